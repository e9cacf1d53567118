use iox::{KeyValueStore, SessionArchive, StoreError};
use model::{format_hms, SessionRecord, TransitionParams};
use stride_link_core::Units;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::session::SessionData;

/// Hands the finished session to whatever shows the summary.
pub trait Navigator: Send + Sync {
    fn show_summary(&self, params: TransitionParams);
}

fn round_to(v: f64, decimals: i32) -> f64 {
    let f = 10f64.powi(decimals);
    (v * f).round() / f
}

/// Snapshot of the session as it ends. Aggregates fall back to the current reading
/// when nothing was tracked; device-reported load extremes win over tracked ones.
pub fn build_record(data: &SessionData, units: &Units, ended_at: OffsetDateTime) -> SessionRecord {
    let speed = data.speed.max(0.0);
    let stats = &data.stats;
    SessionRecord {
        id: Uuid::new_v4(),
        ended_at_ms: (ended_at.unix_timestamp_nanos() / 1_000_000) as i64,
        date: ended_at.format(&Rfc3339).unwrap_or_default(),
        date_label: format!("{:04}/{:02}/{:02}", ended_at.year(), u8::from(ended_at.month()), ended_at.day()),
        duration_secs: data.elapsed_secs,
        duration_formatted: format_hms(data.elapsed_secs),
        speed,
        speed_kmh: round_to(speed * units.speed_to_kmh, 1),
        max_speed: stats.speed.max().unwrap_or(speed),
        min_speed: stats.speed.min().unwrap_or(speed),
        calories: data.calories_kcal.round(),
        distance_km: round_to(data.distance_km, 2),
        heart_rate: data.heart_rate_bpm,
        load: data.load,
        incline: data.incline,
        max_incline: stats.incline.max().unwrap_or(data.incline),
        min_incline: stats.incline.min().unwrap_or(data.incline),
        gauge: data.gauge,
        speed_limits: data.speed_limits,
        incline_limits: data.incline_limits,
        max_resistance: data.device_peak_load.or(stats.load.max()).unwrap_or(data.load),
        min_resistance: data.device_trough_load.or(stats.load.min()).unwrap_or(data.load),
        avg_resistance: stats.load.mean().map_or(data.load, |m| round_to(m, 1)),
        goal: data.goal.as_ref().map(|g| g.goal()),
    }
}

/// Archives `record`, then navigates to the summary. Navigation happens even when
/// the archive write fails; the error is returned for the caller to surface.
pub fn finalize<S: KeyValueStore>(
    archive: &SessionArchive<S>,
    navigator: &dyn Navigator,
    record: &SessionRecord,
) -> Result<(), StoreError> {
    let saved = archive.append(record).map(|len| {
        debug!(target = "stride.lifecycle", id = %record.id, archived = len, "session saved");
    });
    navigator.show_summary(record.transition_params());
    saved
}
