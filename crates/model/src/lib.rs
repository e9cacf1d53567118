use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GoalKind {
    Time,
    Distance,
    Calories,
}

/// Session target. `target` is minutes for time goals, km for distance, kcal for calories.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct Goal {
    pub kind: GoalKind,
    pub target: f64,
}

impl Goal {
    pub fn time_secs(&self) -> u64 {
        match self.kind {
            GoalKind::Time => (self.target * 60.0).round().max(0.0) as u64,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid goal `{0}` (expected time|distance|calories:<value>)")]
pub struct GoalParseError(pub String);

impl FromStr for Goal {
    type Err = GoalParseError;

    /// `distance:1.5`, `time:30`, `calories:200`. A zero target is not a goal.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || GoalParseError(s.to_string());
        let (kind, value) = s.split_once(':').ok_or_else(err)?;
        let kind = match kind.trim() {
            "time" => GoalKind::Time,
            "distance" => GoalKind::Distance,
            "calories" => GoalKind::Calories,
            _ => return Err(err()),
        };
        let target: f64 = value.trim().parse().map_err(|_| err())?;
        if !target.is_finite() || target <= 0.0 {
            return Err(err());
        }
        Ok(Goal { kind, target })
    }
}

/// Which channel the load gauge drives.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GaugeKind {
    #[default]
    Resistance,
    Incline,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub fn clamp(&self, v: f64) -> f64 {
        v.max(self.min).min(self.max)
    }
}

/// Finished workout, newest-first in the archive.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct SessionRecord {
    #[serde(with = "uuid::serde::simple")]
    pub id: Uuid,
    pub ended_at_ms: i64,
    /// RFC 3339
    pub date: String,
    /// `YYYY/MM/DD`
    pub date_label: String,
    pub duration_secs: u64,
    pub duration_formatted: String,
    pub speed: f64,
    pub speed_kmh: f64,
    pub max_speed: f64,
    pub min_speed: f64,
    pub calories: f64,
    pub distance_km: f64,
    pub heart_rate: f64,
    pub load: f64,
    pub incline: f64,
    pub max_incline: f64,
    pub min_incline: f64,
    pub gauge: GaugeKind,
    pub speed_limits: Bounds,
    pub incline_limits: Bounds,
    pub max_resistance: f64,
    pub min_resistance: f64,
    pub avg_resistance: f64,
    #[serde(default)]
    pub goal: Option<Goal>,
}

/// Flat key/value parameters handed to the summary view.
pub type TransitionParams = BTreeMap<String, String>;

impl SessionRecord {
    pub fn is_goal_mode(&self) -> bool { self.goal.is_some() }

    pub fn transition_params(&self) -> TransitionParams {
        let mut p = TransitionParams::new();
        let mut put = |k: &str, v: String| { p.insert(k.to_string(), v); };
        put("id", self.id.simple().to_string());
        put("duration", self.duration_secs.to_string());
        put("speed", self.speed.to_string());
        put("speed_kmh", format!("{:.1}", self.speed_kmh));
        put("calories", self.calories.to_string());
        put("distance", self.distance_km.to_string());
        put("heart_rate", self.heart_rate.to_string());
        put("max_resistance", self.max_resistance.to_string());
        put("min_resistance", self.min_resistance.to_string());
        put("avg_resistance", self.avg_resistance.to_string());
        put("max_speed", self.max_speed.to_string());
        put("min_speed", self.min_speed.to_string());
        put("incline", self.incline.to_string());
        put("max_incline", self.max_incline.to_string());
        put("min_incline", self.min_incline.to_string());
        put("date", self.date_label.clone());
        put("goal_mode", self.is_goal_mode().to_string());
        p
    }
}

/// `HH:MM:SS`, hours always shown.
pub fn format_hms(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_record() -> SessionRecord {
        SessionRecord {
            id: Uuid::new_v4(),
            ended_at_ms: 1_700_000_000_000,
            date: "2023-11-14T22:13:20Z".into(),
            date_label: "2023/11/14".into(),
            duration_secs: 754,
            duration_formatted: format_hms(754),
            speed: 5.5,
            speed_kmh: 5.5,
            max_speed: 6.0,
            min_speed: 4.0,
            calories: 88.0,
            distance_km: 1.06,
            heart_rate: 120.0,
            load: 4.0,
            incline: 0.0,
            max_incline: 0.0,
            min_incline: 0.0,
            gauge: GaugeKind::Resistance,
            speed_limits: Bounds { min: 1.0, max: 16.0 },
            incline_limits: Bounds { min: 0.0, max: 15.0 },
            max_resistance: 6.0,
            min_resistance: 1.0,
            avg_resistance: 3.5,
            goal: Some(Goal { kind: GoalKind::Distance, target: 1.0 }),
        }
    }

    #[test]
    fn test_goal_parse() {
        let g: Goal = "distance:1.5".parse().unwrap();
        assert_eq!(g, Goal { kind: GoalKind::Distance, target: 1.5 });
        assert_eq!("time:30".parse::<Goal>().unwrap().time_secs(), 1800);
        assert!("time:0".parse::<Goal>().is_err());
        assert!("pace:3".parse::<Goal>().is_err());
        assert!("calories".parse::<Goal>().is_err());
    }

    #[test]
    fn test_goal_parse_error_message() {
        let err = "pace:3".parse::<Goal>().unwrap_err();
        assert_eq!(err, GoalParseError("pace:3".into()));
        assert_eq!(err.to_string(), "invalid goal `pace:3` (expected time|distance|calories:<value>)");
        let boxed: Box<dyn std::error::Error> = Box::new(err);
        assert!(boxed.source().is_none());
    }

    #[test]
    fn test_format_hms() {
        assert_eq!(format_hms(0), "00:00:00");
        assert_eq!(format_hms(754), "00:12:34");
        assert_eq!(format_hms(3 * 3600 + 5), "03:00:05");
    }

    #[test]
    fn test_transition_params_are_flat_strings() {
        let r = sample_record();
        let p = r.transition_params();
        assert_eq!(p["duration"], "754");
        assert_eq!(p["distance"], "1.06");
        assert_eq!(p["date"], "2023/11/14");
        assert_eq!(p["goal_mode"], "true");
        assert_eq!(p["id"].len(), 32);
    }

    #[test]
    fn test_record_json_round_trip_keeps_simple_uuid() {
        let r = sample_record();
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["id"].as_str().unwrap().len(), 32);
        let back: SessionRecord = serde_json::from_value(v).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn test_bounds_clamp() {
        let b = Bounds { min: 0.0, max: 15.0 };
        assert_eq!(b.clamp(20.0), 15.0);
        assert_eq!(b.clamp(-1.0), 0.0);
    }
}
