//! Core device model and traits used by Stride

mod channels;
mod decode;

pub use channels::*;
pub use decode::decode_bundle;

use futures::stream::BoxStream;
use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use std::fmt;

/// Raw keyed-value bundle as pushed by the telemetry bus, e.g. `{"112": 55, "106": "Start"}`.
pub type TelemetryBundle = serde_json::Map<String, serde_json::Value>;

pub type BundleStream = BoxStream<'static, TelemetryBundle>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl TelemetryValue {
    /// Numeric view of the value; numeric text is accepted, anything else is `None`.
    pub fn as_f64(&self) -> Option<f64> {
        let v = match self {
            TelemetryValue::Int(i) => *i as f64,
            TelemetryValue::Float(f) => *f,
            TelemetryValue::Text(s) => s.trim().parse::<f64>().ok()?,
            TelemetryValue::Bool(_) => return None,
        };
        v.is_finite().then_some(v)
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TelemetryValue::Bool(b) => (*b).into(),
            TelemetryValue::Int(i) => (*i).into(),
            TelemetryValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            TelemetryValue::Text(s) => s.clone().into(),
        }
    }
}

impl From<f64> for TelemetryValue {
    fn from(v: f64) -> Self {
        // devices expect integers for whole values
        if v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
            TelemetryValue::Int(v as i64)
        } else {
            TelemetryValue::Float(v)
        }
    }
}

impl From<i64> for TelemetryValue {
    fn from(v: i64) -> Self { TelemetryValue::Int(v) }
}

impl From<&str> for TelemetryValue {
    fn from(v: &str) -> Self { TelemetryValue::Text(v.to_string()) }
}

impl fmt::Display for TelemetryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryValue::Bool(b) => write!(f, "{b}"),
            TelemetryValue::Int(i) => write!(f, "{i}"),
            TelemetryValue::Float(v) => write!(f, "{v}"),
            TelemetryValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub channel: u32,
    pub value: TelemetryValue,
}

/// Outgoing writes before null stripping. `None` entries never reach the device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    writes: Vec<(u32, Option<TelemetryValue>)>,
}

impl Payload {
    pub fn new() -> Self { Self::default() }

    pub fn set(mut self, channel: u32, value: impl Into<TelemetryValue>) -> Self {
        self.writes.push((channel, Some(value.into())));
        self
    }

    pub fn set_opt(mut self, channel: u32, value: Option<TelemetryValue>) -> Self {
        self.writes.push((channel, value));
        self
    }

    /// Drops empty writes; `None` when nothing is left to send.
    pub fn strip(self) -> Option<DpWrites> {
        let map: BTreeMap<u32, TelemetryValue> = self.writes
            .into_iter()
            .filter_map(|(ch, v)| v.map(|v| (ch, v)))
            .collect();
        if map.is_empty() { None } else { Some(DpWrites(map)) }
    }
}

/// A non-empty set of channel writes ready for the command channel.
#[derive(Debug, Clone, PartialEq)]
pub struct DpWrites(BTreeMap<u32, TelemetryValue>);

impl DpWrites {
    pub fn get(&self, channel: u32) -> Option<&TelemetryValue> { self.0.get(&channel) }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &TelemetryValue)> {
        self.0.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// Wire form used by the device SDK: channel ids as string keys.
    pub fn to_json(&self) -> serde_json::Map<String, serde_json::Value> {
        self.0.iter().map(|(k, v)| (k.to_string(), v.to_json())).collect()
    }
}

impl fmt::Display for DpWrites {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Transport pipelines in the device SDK's numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pipeline {
    Lan = 0,
    Mqtt = 1,
    Http = 2,
    Ble = 3,
    SigMesh = 4,
    BleMesh = 5,
    BleBeacon = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    Lan = 0,
    Network = 1,
    Auto = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub online: bool,
    /// Short-range radio link state; `None` when the device does not report one.
    pub link_connected: Option<bool>,
}

impl DeviceInfo {
    pub fn is_ready(&self) -> bool {
        self.online && self.link_connected != Some(false)
    }
}

/// SDK code for "device busy or value out of range".
pub const CODE_BUSY: i64 = 20028;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("device busy or value out of range (code 20028)")]
    Busy,
    #[error("device unreachable")]
    Unreachable,
    #[error("device rejected command (code {code}): {message}")]
    Rejected { code: i64, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LinkError {
    pub fn from_code(code: i64, message: impl Into<String>) -> Self {
        match code {
            CODE_BUSY => LinkError::Busy,
            _ => LinkError::Rejected { code, message: message.into() },
        }
    }

    /// Machine-readable code for user-facing notices.
    pub fn code(&self) -> String {
        match self {
            LinkError::Busy => "busy".into(),
            LinkError::Unreachable => "unreachable".into(),
            LinkError::Rejected { code, .. } => code.to_string(),
            LinkError::Other(_) => "other".into(),
        }
    }
}

/// Outgoing command path to a device.
#[async_trait::async_trait]
pub trait CommandChannel: Send + Sync {
    async fn publish(
        &self,
        device_id: &str,
        writes: &DpWrites,
        mode: PublishMode,
        pipelines: &[Pipeline],
    ) -> Result<(), LinkError>;
}

/// Liveness query made before every publish.
#[async_trait::async_trait]
pub trait DeviceInfoSource: Send + Sync {
    async fn device_info(&self, device_id: &str) -> Result<DeviceInfo, LinkError>;
}

/// Push source of telemetry bundles; `register` subscribes once per device.
#[async_trait::async_trait]
pub trait TelemetryBus: Send + Sync {
    async fn register(&self, device_id: &str) -> Result<BundleStream, LinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_strip_drops_none() {
        let p = Payload::new()
            .set(107, 3.0)
            .set_opt(112, None);
        let w = p.strip().expect("non-empty");
        assert_eq!(w.len(), 1);
        assert_eq!(w.get(107), Some(&TelemetryValue::Int(3)));
        assert_eq!(w.to_json()["107"], serde_json::json!(3));
    }

    #[test]
    fn test_payload_all_none_is_empty() {
        assert!(Payload::new().set_opt(106, None).strip().is_none());
        assert!(Payload::new().strip().is_none());
    }

    #[test]
    fn test_value_numeric_views() {
        assert_eq!(TelemetryValue::Text(" 12 ".into()).as_f64(), Some(12.0));
        assert_eq!(TelemetryValue::Text("Start".into()).as_f64(), None);
        assert_eq!(TelemetryValue::Bool(true).as_f64(), None);
        assert_eq!(TelemetryValue::from(2.5), TelemetryValue::Float(2.5));
    }

    #[test]
    fn test_device_ready() {
        assert!(DeviceInfo { online: true, link_connected: None }.is_ready());
        assert!(!DeviceInfo { online: true, link_connected: Some(false) }.is_ready());
        assert!(!DeviceInfo { online: false, link_connected: Some(true) }.is_ready());
    }

    #[test]
    fn test_link_error_codes() {
        assert!(matches!(LinkError::from_code(CODE_BUSY, "x"), LinkError::Busy));
        assert_eq!(LinkError::from_code(7, "nope").code(), "7");
    }
}
