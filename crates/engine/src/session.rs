use analysis::{Baseline, GoalTracker, SessionStats};
use model::{format_hms, Bounds, Goal, GaugeKind, GoalKind};
use serde::Serialize;
use stride_link_core::ChannelTable;

use crate::config::EngineConfig;
use crate::phase::Phase;

/// Live readings plus per-session aggregates. Owned by the engine task.
#[derive(Clone, Debug)]
pub struct SessionData {
    pub goal: Option<GoalTracker>,
    pub elapsed_secs: u64,
    pub distance_km: f64,
    pub calories_kcal: f64,
    pub heart_rate_bpm: f64,
    pub speed: f64,
    pub load: f64,
    pub incline: f64,
    pub gauge: GaugeKind,
    pub speed_limits: Bounds,
    pub incline_limits: Bounds,
    pub device_peak_load: Option<f64>,
    pub device_trough_load: Option<f64>,
    pub stats: SessionStats,
    baseline_distance: Baseline,
    baseline_calories: Baseline,
}

impl SessionData {
    pub fn new(cfg: &EngineConfig) -> Self {
        let mut stats = SessionStats::default();
        stats.reset(cfg.default_load);
        Self {
            goal: cfg.goal.map(GoalTracker::new),
            elapsed_secs: 0,
            distance_km: 0.0,
            calories_kcal: 0.0,
            heart_rate_bpm: 0.0,
            speed: 0.0,
            load: cfg.default_load,
            incline: 0.0,
            gauge: GaugeKind::Resistance,
            speed_limits: cfg.speed_limits,
            incline_limits: cfg.incline_limits,
            device_peak_load: None,
            device_trough_load: None,
            stats,
            baseline_distance: Baseline::default(),
            baseline_calories: Baseline::default(),
        }
    }

    fn time_goal(&self) -> bool {
        self.goal.as_ref().is_some_and(|g| g.goal().kind == GoalKind::Time)
    }

    /// A fresh session starts: aggregates restart, goal progress and baselines are
    /// cleared so the next odometer reading becomes the new zero.
    pub fn reset_for_session(&mut self) {
        self.stats.reset(self.load);
        self.baseline_distance.clear();
        self.baseline_calories.clear();
        self.device_peak_load = None;
        self.device_trough_load = None;
        if let Some(g) = self.goal.as_mut() {
            g.reset();
            self.distance_km = 0.0;
            self.calories_kcal = 0.0;
        }
        if self.time_goal() {
            self.elapsed_secs = 0;
        }
    }

    /// Returns true when this reading completes a distance goal.
    pub fn apply_distance(&mut self, km: f64, in_session: bool) -> bool {
        let Some(goal) = self.goal.as_mut() else {
            self.distance_km = km;
            return false;
        };
        self.distance_km = self.baseline_distance.relative(km);
        in_session && goal.observe_distance(self.distance_km)
    }

    /// Returns true when this reading completes a calorie goal.
    pub fn apply_calories(&mut self, kcal: f64, in_session: bool) -> bool {
        let Some(goal) = self.goal.as_mut() else {
            self.calories_kcal = kcal;
            return false;
        };
        self.calories_kcal = self.baseline_calories.relative(kcal);
        in_session && goal.observe_calories(self.calories_kcal)
    }

    /// Time goals count down locally; the device clock is ignored for them.
    pub fn apply_elapsed(&mut self, secs: f64) {
        if !self.time_goal() {
            self.elapsed_secs = secs.max(0.0) as u64;
        }
    }

    pub fn apply_resistance(&mut self, v: f64, in_session: bool) {
        if self.gauge != GaugeKind::Resistance {
            return;
        }
        self.load = v;
        if in_session {
            self.stats.track_load(v);
        }
    }

    /// An incline report means the machine has a lift motor: the dial follows incline
    /// from now on.
    pub fn apply_incline(&mut self, v: f64, in_session: bool) {
        self.gauge = GaugeKind::Incline;
        self.incline = v;
        self.load = v;
        if in_session {
            self.stats.track_incline(v);
            self.stats.track_load(v);
        }
    }

    /// Local dial change.
    pub fn set_load(&mut self, v: f64, in_session: bool) {
        self.load = v;
        self.stats.track_load(v);
        if self.gauge == GaugeKind::Incline {
            self.incline = v;
            if in_session {
                self.stats.track_incline(v);
            }
        }
    }

    /// One local second while running. Returns true when a time goal completes.
    pub fn tick(&mut self) -> bool {
        let Some(g) = self.goal.as_mut() else { return false };
        if g.goal().kind != GoalKind::Time {
            return false;
        }
        let done = g.tick();
        self.elapsed_secs = g.elapsed_secs();
        done
    }

    pub fn gauge_channel(&self, channels: &ChannelTable) -> u32 {
        match self.gauge {
            GaugeKind::Resistance => channels.resistance,
            GaugeKind::Incline => channels.incline,
        }
    }

    pub fn dashboard(&self, phase: Phase, speed_locked: bool) -> Dashboard {
        let countdown = self
            .goal
            .as_ref()
            .filter(|g| g.goal().kind == GoalKind::Time)
            .map(|g| g.countdown_secs());
        Dashboard {
            phase,
            clock: format_hms(countdown.unwrap_or(self.elapsed_secs)),
            elapsed_secs: self.elapsed_secs,
            countdown_secs: countdown,
            distance_km: self.distance_km,
            calories_kcal: self.calories_kcal,
            heart_rate_bpm: self.heart_rate_bpm,
            speed: self.speed,
            speed_locked,
            load: self.load,
            incline: self.incline,
            gauge: self.gauge,
            speed_limits: self.speed_limits,
            incline_limits: self.incline_limits,
            goal: self.goal.as_ref().map(|g| g.goal()),
            goal_completed: self.goal.as_ref().is_some_and(|g| g.is_completed()),
        }
    }
}

/// What the UI renders. Published on every change.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Dashboard {
    pub phase: Phase,
    /// Countdown for time goals, elapsed time otherwise.
    pub clock: String,
    pub elapsed_secs: u64,
    pub countdown_secs: Option<u64>,
    pub distance_km: f64,
    pub calories_kcal: f64,
    pub heart_rate_bpm: f64,
    pub speed: f64,
    pub speed_locked: bool,
    pub load: f64,
    pub incline: f64,
    pub gauge: GaugeKind,
    pub speed_limits: Bounds,
    pub incline_limits: Bounds,
    pub goal: Option<Goal>,
    pub goal_completed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(goal: Option<Goal>) -> SessionData {
        SessionData::new(&EngineConfig { goal, ..EngineConfig::default() })
    }

    #[test]
    fn test_goal_mode_distance_is_baseline_relative() {
        let mut d = data(Some(Goal { kind: GoalKind::Distance, target: 1.0 }));
        d.reset_for_session();
        assert!(!d.apply_distance(12.34, true));
        assert_eq!(d.distance_km, 0.0);
        assert!(d.apply_distance(13.40, true));
        assert!((d.distance_km - 1.06).abs() < 1e-9);
        assert!(d.dashboard(Phase::Running, false).goal_completed);
    }

    #[test]
    fn test_free_mode_shows_absolute_counters() {
        let mut d = data(None);
        assert!(!d.apply_distance(12.34, true));
        assert!(!d.apply_calories(80.0, true));
        assert_eq!((d.distance_km, d.calories_kcal), (12.34, 80.0));
    }

    #[test]
    fn test_goal_not_evaluated_outside_session() {
        let mut d = data(Some(Goal { kind: GoalKind::Calories, target: 10.0 }));
        d.apply_calories(100.0, false);
        assert!(!d.apply_calories(200.0, false));
        assert_eq!(d.calories_kcal, 100.0);
    }

    #[test]
    fn test_incline_report_switches_gauge() {
        let mut d = data(None);
        let ch = ChannelTable::default();
        assert_eq!(d.gauge_channel(&ch), 107);
        d.apply_incline(4.0, true);
        assert_eq!(d.gauge_channel(&ch), 114);
        assert_eq!(d.load, 4.0);
        // resistance reports no longer drive the dial
        d.apply_resistance(9.0, true);
        assert_eq!(d.load, 4.0);
        assert_eq!(d.stats.incline.max(), Some(4.0));
    }

    #[test]
    fn test_time_goal_owns_the_clock() {
        let mut d = data(Some(Goal { kind: GoalKind::Time, target: 1.0 }));
        d.apply_elapsed(500.0);
        assert_eq!(d.elapsed_secs, 0);
        assert!(!d.tick());
        let dash = d.dashboard(Phase::Running, false);
        assert_eq!(dash.countdown_secs, Some(59));
        assert_eq!(dash.clock, "00:00:59");
        assert_eq!(dash.elapsed_secs, 1);
    }

    #[test]
    fn test_reset_reseeds_load_stats() {
        let mut d = data(None);
        d.set_load(8.0, true);
        d.load = 3.0;
        d.reset_for_session();
        assert_eq!(d.stats.load.max(), Some(3.0));
        assert_eq!(d.stats.load.count(), 1);
    }
}
