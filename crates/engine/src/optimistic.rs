/// Outcome of feeding a device report into an [`OptimisticValue`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// No prediction pending; show the report.
    Accepted(f64),
    /// Report matches the prediction; lock released.
    Confirmed(f64),
    /// Stale report during the lock window; keep showing the prediction.
    Suppressed,
}

/// A locally predicted value that wins over device reports until the device catches
/// up or the owner expires it.
#[derive(Debug, Clone, Default)]
pub struct OptimisticValue {
    tolerance: f64,
    predicted: Option<f64>,
    last_observed: Option<f64>,
}

impl OptimisticValue {
    pub fn new(tolerance: f64) -> Self {
        Self { tolerance, ..Self::default() }
    }

    pub fn is_locked(&self) -> bool { self.predicted.is_some() }
    pub fn predicted(&self) -> Option<f64> { self.predicted }
    pub fn last_observed(&self) -> Option<f64> { self.last_observed }

    /// Locks on `value` and returns it for display.
    pub fn predict(&mut self, value: f64) -> f64 {
        self.predicted = Some(value);
        value
    }

    pub fn observe(&mut self, reported: f64) -> Observation {
        self.last_observed = Some(reported);
        match self.predicted {
            None => Observation::Accepted(reported),
            Some(p) if (reported - p).abs() <= self.tolerance => {
                self.predicted = None;
                Observation::Confirmed(reported)
            }
            Some(_) => Observation::Suppressed,
        }
    }

    /// Lock window ran out without confirmation. Returns the device value if the
    /// display has to snap back to it.
    pub fn expire(&mut self) -> Option<f64> {
        let p = self.predicted.take()?;
        self.last_observed.filter(|o| (o - p).abs() > self.tolerance)
    }

    /// The command carrying the prediction failed. Returns the last device value.
    pub fn fail(&mut self) -> Option<f64> {
        self.predicted = None;
        self.last_observed
    }

    pub fn release(&mut self) { self.predicted = None; }
}
