use model::{Bounds, Goal};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use stride_link_core::{DeviceProfile, Pipeline, PublishMode};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub mode: PublishMode,
    pub pipelines: Vec<Pipeline>,
    pub load_debounce_ms: u64,
    pub speed_debounce_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            mode: PublishMode::Auto,
            pipelines: vec![Pipeline::Lan, Pipeline::Mqtt, Pipeline::Ble],
            load_debounce_ms: 150,
            speed_debounce_ms: 80,
        }
    }
}

/// Optimistic speed display.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// A report within this distance of the prediction confirms it.
    pub tolerance: f64,
    pub timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { tolerance: 0.11, timeout_ms: 2000 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub device_id: String,
    pub profile: DeviceProfile,
    pub publish: PublishConfig,
    pub speed_lock: LockConfig,
    pub speed_step: f64,
    /// Load shown and re-asserted before the device reports one.
    pub default_load: f64,
    /// Until the device reports 115/116.
    pub speed_limits: Bounds,
    /// Until the device reports 117/118; the load dial is clamped to these.
    pub incline_limits: Bounds,
    pub main_action_guard_ms: u64,
    pub goal: Option<Goal>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            profile: DeviceProfile::default(),
            publish: PublishConfig::default(),
            speed_lock: LockConfig::default(),
            speed_step: 0.1,
            default_load: 1.0,
            speed_limits: Bounds { min: 0.0, max: 999.0 },
            incline_limits: Bounds { min: 0.0, max: 15.0 },
            main_action_guard_ms: 500,
            goal: None,
        }
    }
}

impl EngineConfig {
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn load_debounce(&self) -> Duration { Duration::from_millis(self.publish.load_debounce_ms) }
    pub fn speed_debounce(&self) -> Duration { Duration::from_millis(self.publish.speed_debounce_ms) }
    pub fn lock_timeout(&self) -> Duration { Duration::from_millis(self.speed_lock.timeout_ms) }
    pub fn main_action_guard(&self) -> Duration { Duration::from_millis(self.main_action_guard_ms) }
}
