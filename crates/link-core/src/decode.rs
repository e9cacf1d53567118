use serde_json::Value;
use tracing::trace;

use crate::{TelemetryBundle, TelemetryEvent, TelemetryValue};

/// Flattens a bundle into events in the bundle's own order.
///
/// Unknown channel ids pass through. Keys that are not channel ids and values that are
/// not scalars are skipped.
pub fn decode_bundle(bundle: &TelemetryBundle) -> Vec<TelemetryEvent> {
    let mut out = Vec::with_capacity(bundle.len());
    for (key, raw) in bundle {
        let Ok(channel) = key.trim().parse::<u32>() else {
            trace!(target = "stride.decode", key = %key, "skipping non-numeric channel key");
            continue;
        };
        let value = match raw {
            Value::Bool(b) => TelemetryValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => TelemetryValue::Int(i),
                None => match n.as_f64() {
                    Some(f) => TelemetryValue::Float(f),
                    None => continue,
                },
            },
            Value::String(s) => TelemetryValue::Text(s.clone()),
            other => {
                trace!(target = "stride.decode", channel, value = %other, "skipping non-scalar value");
                continue;
            }
        };
        out.push(TelemetryEvent { channel, value });
    }
    out
}
