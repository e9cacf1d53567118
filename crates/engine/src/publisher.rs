//! Per-key command submission with at most one write in flight per key.
//!
//! [`CommandPublisher`] owns only bookkeeping; the engine performs the actual
//! [`deliver`] call on a spawned task and reports completion back through
//! [`CommandPublisher::complete`]. While a key is in flight, later submissions for it
//! collapse into a single queued slot, last writer wins.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use stride_link_core::{CommandChannel, DeviceInfo, DeviceInfoSource, DpWrites, LinkError, Payload};
use tracing::warn;

use crate::config::PublishConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKey {
    Load,
    Speed,
    SportState,
    /// Load re-asserted ahead of a start. Separate from `Load` so a dial change can
    /// never swallow the start that follows it.
    PrestartLoad,
}

impl CommandKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKey::Load => "load",
            CommandKey::Speed => "speed",
            CommandKey::SportState => "sport_state",
            CommandKey::PrestartLoad => "prestart_load",
        }
    }
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("device offline or link disconnected")]
    PrecheckBlocked,
    #[error(transparent)]
    Channel(#[from] LinkError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command<F> {
    pub key: CommandKey,
    pub writes: DpWrites,
    /// Continuation run by the owner once delivery finishes.
    pub followup: F,
}

#[derive(Debug, PartialEq)]
pub enum Dispatch<F> {
    /// Key was idle and is now in flight; deliver this.
    Send(Command<F>),
    /// Key busy; stored for when it frees up, replacing `superseded`.
    Queued { superseded: Option<Command<F>> },
    /// Nothing left after dropping empty values.
    Empty,
}

#[derive(Debug)]
pub struct CommandPublisher<F> {
    in_flight: HashSet<CommandKey>,
    queued: HashMap<CommandKey, Command<F>>,
}

impl<F> Default for CommandPublisher<F> {
    fn default() -> Self {
        Self { in_flight: HashSet::new(), queued: HashMap::new() }
    }
}

impl<F> CommandPublisher<F> {
    pub fn new() -> Self { Self::default() }

    pub fn submit(&mut self, key: CommandKey, payload: Payload, followup: F) -> Dispatch<F> {
        let Some(writes) = payload.strip() else {
            return Dispatch::Empty;
        };
        let cmd = Command { key, writes, followup };
        if self.in_flight.contains(&key) {
            let superseded = self.queued.insert(key, cmd);
            return Dispatch::Queued { superseded };
        }
        self.in_flight.insert(key);
        Dispatch::Send(cmd)
    }

    /// Delivery for `key` finished, either way. Returns the queued successor, which
    /// is already marked in flight.
    pub fn complete(&mut self, key: CommandKey) -> Option<Command<F>> {
        match self.queued.remove(&key) {
            Some(next) => Some(next),
            None => {
                self.in_flight.remove(&key);
                None
            }
        }
    }

    pub fn is_in_flight(&self, key: CommandKey) -> bool { self.in_flight.contains(&key) }

    pub fn queued_len(&self) -> usize { self.queued.len() }
}

/// Last device info seen, consulted when the liveness query itself fails.
#[derive(Debug, Clone, Default)]
pub struct InfoCache(Arc<Mutex<Option<DeviceInfo>>>);

impl InfoCache {
    pub fn store(&self, info: DeviceInfo) { *self.0.lock() = Some(info); }
    pub fn get(&self) -> Option<DeviceInfo> { *self.0.lock() }
}

/// Precheck, then send. An unknown device state counts as ready.
pub async fn deliver(
    channel: &dyn CommandChannel,
    info: &dyn DeviceInfoSource,
    cache: &InfoCache,
    device_id: &str,
    writes: &DpWrites,
    cfg: &PublishConfig,
) -> Result<(), PublishError> {
    let ready = match info.device_info(device_id).await {
        Ok(i) => {
            cache.store(i);
            i.is_ready()
        }
        Err(err) => {
            warn!(target = "stride.publisher", device = device_id, error = %err, "device info query failed, using cached state");
            cache.get().map_or(true, |i| i.is_ready())
        }
    };
    if !ready {
        return Err(PublishError::PrecheckBlocked);
    }
    channel.publish(device_id, writes, cfg.mode, &cfg.pipelines).await?;
    Ok(())
}
