use model::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Running min/max/mean of one metric. The first sample seeds both extremes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl MetricStats {
    pub fn record(&mut self, v: f64) {
        if !v.is_finite() {
            return;
        }
        self.count += 1;
        self.sum += v;
        self.min = Some(self.min.map_or(v, |m| m.min(v)));
        self.max = Some(self.max.map_or(v, |m| m.max(v)));
    }

    pub fn count(&self) -> u64 { self.count }
    pub fn min(&self) -> Option<f64> { self.min }
    pub fn max(&self) -> Option<f64> { self.max }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn reset(&mut self) { *self = Self::default(); }
}

/// Per-session aggregates.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionStats {
    pub speed: MetricStats,
    pub incline: MetricStats,
    pub load: MetricStats,
}

impl SessionStats {
    /// Stopped-belt readings carry no information about pace.
    pub fn track_speed(&mut self, v: f64) {
        if v > 0.0 {
            self.speed.record(v);
        }
    }

    pub fn track_incline(&mut self, v: f64) { self.incline.record(v); }

    pub fn track_load(&mut self, v: f64) { self.load.record(v); }

    /// Clears everything; the load gauge is seeded with its current setting.
    pub fn reset(&mut self, current_load: f64) {
        self.speed.reset();
        self.incline.reset();
        self.load.reset();
        self.load.record(current_load);
    }
}

/// Zero point for an absolute device counter (odometer, energy counter).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Baseline {
    origin: Option<f64>,
}

impl Baseline {
    /// Progress since the first reading; captures the origin on first use.
    pub fn relative(&mut self, raw: f64) -> f64 {
        let origin = *self.origin.get_or_insert(raw);
        (raw - origin).max(0.0)
    }

    pub fn origin(&self) -> Option<f64> { self.origin }

    pub fn clear(&mut self) { self.origin = None; }
}

/// Goal completion state for one session.
#[derive(Clone, Debug, PartialEq)]
pub struct GoalTracker {
    goal: Goal,
    countdown_secs: u64,
    completed: bool,
}

impl GoalTracker {
    pub fn new(goal: Goal) -> Self {
        Self { goal, countdown_secs: goal.time_secs(), completed: false }
    }

    pub fn goal(&self) -> Goal { self.goal }
    pub fn is_completed(&self) -> bool { self.completed }
    pub fn countdown_secs(&self) -> u64 { self.countdown_secs }

    /// Seconds consumed by a time goal's countdown.
    pub fn elapsed_secs(&self) -> u64 {
        self.goal.time_secs().saturating_sub(self.countdown_secs)
    }

    /// One second of local time. Returns true when this tick completes a time goal.
    pub fn tick(&mut self) -> bool {
        if self.goal.kind != GoalKind::Time || self.completed {
            return false;
        }
        self.countdown_secs = self.countdown_secs.saturating_sub(1);
        self.check(self.countdown_secs == 0)
    }

    /// Feeds baseline-relative distance (km). Returns true on completion.
    pub fn observe_distance(&mut self, km: f64) -> bool {
        self.goal.kind == GoalKind::Distance && self.check(km >= self.goal.target)
    }

    /// Feeds baseline-relative calories (kcal). Returns true on completion.
    pub fn observe_calories(&mut self, kcal: f64) -> bool {
        self.goal.kind == GoalKind::Calories && self.check(kcal >= self.goal.target)
    }

    /// The user chose to keep going; the goal can complete again.
    pub fn decline(&mut self) { self.completed = false; }

    pub fn reset(&mut self) { *self = Self::new(self.goal); }

    fn check(&mut self, reached: bool) -> bool {
        if self.completed || !reached {
            return false;
        }
        self.completed = true;
        true
    }
}

pub fn history_summary(records: &[SessionRecord]) -> Value {
    let total_distance: f64 = records.iter().map(|r| r.distance_km).sum();
    let total_calories: f64 = records.iter().map(|r| r.calories).sum();
    let total_secs: u64 = records.iter().map(|r| r.duration_secs).sum();
    let longest = records.iter().map(|r| r.duration_secs).max().unwrap_or(0);
    let avg_secs = if !records.is_empty() {
        total_secs as f64 / records.len() as f64
    } else {
        0.0
    };
    let goals_met = records.iter().filter(|r| r.is_goal_mode()).count();

    json!({
        "sessions": records.len(),
        "total_distance_km": total_distance,
        "total_calories": total_calories,
        "total_duration": format_hms(total_secs),
        "avg_duration_secs": avg_secs,
        "longest_secs": longest,
        "goal_sessions": goals_met
    })
}
