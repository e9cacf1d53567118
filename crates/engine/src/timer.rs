use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

/// One cancellable timer. Re-arming aborts the previous one; every arm gets a fresh
/// generation so a firing that was already queued when the slot was re-armed or
/// cancelled can be recognised and dropped by the owner.
#[derive(Debug, Default)]
pub struct TimerSlot {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl TimerSlot {
    pub fn arm<F>(&mut self, after: Duration, fire: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel();
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        self.handle = Some(tokio::spawn(async move {
            sleep(after).await;
            fire(generation);
        }));
        generation
    }

    pub fn cancel(&mut self) {
        if let Some(h) = self.handle.take() {
            h.abort();
        }
    }

    pub fn is_armed(&self) -> bool { self.handle.is_some() }

    /// Consumes a firing. True only for the live generation, which disarms the slot.
    pub fn fired(&mut self, generation: u64) -> bool {
        if self.handle.is_some() && generation == self.generation {
            self.handle = None;
            true
        } else {
            false
        }
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) { self.cancel(); }
}
