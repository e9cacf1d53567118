use serde::Serialize;
use stride_link_core::TelemetryValue;
use tracing::debug;

/// Machine sport state. Firmwares report it either as `0/1/2` or as
/// `"Start"/"Pause"/"Stop"`; both collapse to this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SportState {
    Start,
    Pause,
    Stop,
}

pub fn normalize(raw: &TelemetryValue) -> Option<SportState> {
    match raw {
        TelemetryValue::Int(n) => from_code(*n),
        TelemetryValue::Float(f) if f.fract() == 0.0 => from_code(*f as i64),
        TelemetryValue::Text(s) => match s.trim().to_ascii_uppercase().as_str() {
            "START" | "0" => Some(SportState::Start),
            "PAUSE" | "1" => Some(SportState::Pause),
            "STOP" | "END" | "2" => Some(SportState::Stop),
            _ => None,
        },
        _ => None,
    }
}

fn from_code(n: i64) -> Option<SportState> {
    match n {
        0 => Some(SportState::Start),
        1 => Some(SportState::Pause),
        2 => Some(SportState::Stop),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Numeric,
    Symbolic,
}

impl Encoding {
    fn of(raw: &TelemetryValue) -> Option<Encoding> {
        match raw {
            TelemetryValue::Int(_) | TelemetryValue::Float(_) => Some(Encoding::Numeric),
            TelemetryValue::Text(s) if s.trim().parse::<i64>().is_ok() => Some(Encoding::Numeric),
            TelemetryValue::Text(_) => Some(Encoding::Symbolic),
            TelemetryValue::Bool(_) => None,
        }
    }

    pub fn encode(self, state: SportState) -> TelemetryValue {
        match (self, state) {
            (Encoding::Numeric, SportState::Start) => TelemetryValue::Int(0),
            (Encoding::Numeric, SportState::Pause) => TelemetryValue::Int(1),
            (Encoding::Numeric, SportState::Stop) => TelemetryValue::Int(2),
            (Encoding::Symbolic, SportState::Start) => "Start".into(),
            (Encoding::Symbolic, SportState::Pause) => "Pause".into(),
            (Encoding::Symbolic, SportState::Stop) => "Stop".into(),
        }
    }
}

/// Learns the device's sport-state encoding from the first recognisable report and
/// keeps it for the rest of the device session. Symbolic until then.
#[derive(Debug, Default)]
pub struct EncodingDetector {
    resolved: Option<Encoding>,
}

impl EncodingDetector {
    pub fn observe(&mut self, raw: &TelemetryValue) {
        if self.resolved.is_some() || normalize(raw).is_none() {
            return;
        }
        self.resolved = Encoding::of(raw);
        if let Some(e) = self.resolved {
            debug!(target = "stride.sport", encoding = ?e, "sport state encoding detected");
        }
    }

    pub fn resolved(&self) -> Option<Encoding> { self.resolved }

    pub fn encode(&self, state: SportState) -> TelemetryValue {
        self.resolved.unwrap_or(Encoding::Symbolic).encode(state)
    }
}
