//! In-process exercise machine speaking the same channel protocol as the real firmware.

use anyhow::anyhow;
use futures::{channel::mpsc, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::{self, Duration};
use tracing::{debug, trace};
use stride_link_core::*;

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub device_id: String,
    /// Delay before a command is applied and acknowledged.
    pub latency: Duration,
    pub report_interval: Duration,
    /// Report sport state as 0/1/2 instead of Start/Pause/Stop.
    pub numeric_state: bool,
    /// Report applied writes back as telemetry, like the real firmware.
    pub echo: bool,
    pub profile: DeviceProfile,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            device_id: "sim-0".into(),
            latency: Duration::from_millis(120),
            report_interval: Duration::from_secs(1),
            numeric_state: false,
            echo: true,
            profile: DeviceProfile::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimSport {
    Idle,
    Running,
    Paused,
    Stopped,
}

#[derive(Debug)]
struct SimState {
    online: bool,
    link_connected: bool,
    fail_code: Option<i64>,
    sport: SimSport,
    speed_raw: i64,
    load: f64,
    distance_km: f64,
    calories: f64,
    elapsed_s: f64,
    published: Vec<DpWrites>,
    publish_calls: usize,
}

pub struct SimMachine {
    cfg: SimConfig,
    state: Mutex<SimState>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<TelemetryBundle>>>,
}

impl SimMachine {
    pub fn new(cfg: SimConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(SimState {
                online: true,
                link_connected: true,
                fail_code: None,
                sport: SimSport::Idle,
                speed_raw: 30,
                load: 1.0,
                distance_km: 0.0,
                calories: 0.0,
                elapsed_s: 0.0,
                published: vec![],
                publish_calls: 0,
            }),
            listeners: Mutex::new(vec![]),
        }
    }

    pub fn set_online(&self, online: bool) { self.state.lock().online = online; }

    pub fn set_link_connected(&self, connected: bool) { self.state.lock().link_connected = connected; }

    /// Every following publish fails with `code` until cleared.
    pub fn fail_with(&self, code: Option<i64>) { self.state.lock().fail_code = code; }

    /// Writes the machine accepted, in arrival order.
    pub fn published(&self) -> Vec<DpWrites> { self.state.lock().published.clone() }

    /// Publish attempts that reached the command channel, accepted or not.
    pub fn publish_calls(&self) -> usize { self.state.lock().publish_calls }

    pub fn sport(&self) -> SimSport { self.state.lock().sport }

    /// Injects a raw bundle as if the firmware had pushed it.
    pub fn push(&self, bundle: Value) {
        match bundle {
            Value::Object(map) => self.emit(map),
            other => debug!(target = "stride.sim", value = %other, "ignoring non-object bundle"),
        }
    }

    /// Physical console button: the machine changes state on its own and reports it.
    pub fn press(&self, sport: SimSport) {
        self.state.lock().sport = sport;
        let mut b = TelemetryBundle::new();
        b.insert(self.cfg.profile.channels.sport_state.to_string(), self.state_value(sport));
        self.emit(b);
    }

    /// Periodic telemetry loop; runs until the task is dropped.
    pub async fn run(self: Arc<Self>) {
        let mut tick = time::interval(self.cfg.report_interval);
        tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if let Some(b) = self.step(self.cfg.report_interval) {
                self.emit(b);
            }
        }
    }

    fn step(&self, dt: Duration) -> Option<TelemetryBundle> {
        let ch = &self.cfg.profile.channels;
        let units = &self.cfg.profile.units;
        let mut st = self.state.lock();
        if st.sport != SimSport::Running {
            return None;
        }
        let kmh = units.speed_from_raw(st.speed_raw as f64) * units.speed_to_kmh;
        let hours = dt.as_secs_f64() / 3600.0;
        st.distance_km += kmh * hours;
        // rough treadmill energy cost, ~60 kcal per km plus a load term
        st.calories += kmh * hours * (60.0 + st.load * 2.0);
        st.elapsed_s += dt.as_secs_f64();

        let mut b = TelemetryBundle::new();
        b.insert(ch.elapsed_time.to_string(), json!(st.elapsed_s.floor() as u64));
        b.insert(ch.distance.to_string(), json!((st.distance_km * units.distance_divisor).round() as i64));
        b.insert(ch.calories.to_string(), json!(st.calories.floor() as i64));
        b.insert(ch.speed.to_string(), json!(st.speed_raw));
        b.insert(ch.heart_rate.to_string(), json!(90 + st.speed_raw / 2));
        Some(b)
    }

    fn emit(&self, bundle: TelemetryBundle) {
        let mut listeners = self.listeners.lock();
        listeners.retain(|tx| tx.unbounded_send(bundle.clone()).is_ok());
        trace!(target = "stride.sim", listeners = listeners.len(), "bundle pushed");
    }

    fn state_value(&self, sport: SimSport) -> Value {
        let (n, s) = match sport {
            SimSport::Running => (0, "Start"),
            SimSport::Paused => (1, "Pause"),
            SimSport::Idle | SimSport::Stopped => (2, "Stop"),
        };
        if self.cfg.numeric_state { json!(n) } else { json!(s) }
    }

    /// Applies accepted writes; returns the bundle the firmware would report back.
    fn apply(&self, writes: &DpWrites) -> TelemetryBundle {
        let ch = &self.cfg.profile.channels;
        let mut echo = TelemetryBundle::new();
        let mut st = self.state.lock();
        st.published.push(writes.clone());
        for (id, v) in writes.iter() {
            match ch.field(id) {
                Some(Field::SportState) => {
                    if let Some(sport) = parse_sport(v) {
                        st.sport = sport;
                        echo.insert(id.to_string(), self.state_value(sport));
                    }
                    continue;
                }
                Some(Field::Speed) => {
                    if let Some(raw) = v.as_f64() { st.speed_raw = raw.round() as i64; }
                }
                Some(Field::Resistance) | Some(Field::Incline) => {
                    if let Some(load) = v.as_f64() { st.load = load; }
                }
                _ => {}
            }
            echo.insert(id.to_string(), v.to_json());
        }
        echo
    }
}

fn parse_sport(v: &TelemetryValue) -> Option<SimSport> {
    match v {
        TelemetryValue::Int(0) => Some(SimSport::Running),
        TelemetryValue::Int(1) => Some(SimSport::Paused),
        TelemetryValue::Int(2) => Some(SimSport::Stopped),
        TelemetryValue::Text(s) => match s.to_ascii_uppercase().as_str() {
            "START" | "0" => Some(SimSport::Running),
            "PAUSE" | "1" => Some(SimSport::Paused),
            "STOP" | "END" | "2" => Some(SimSport::Stopped),
            _ => None,
        },
        _ => None,
    }
}

#[async_trait::async_trait]
impl CommandChannel for SimMachine {
    async fn publish(
        &self,
        device_id: &str,
        writes: &DpWrites,
        _mode: PublishMode,
        pipelines: &[Pipeline],
    ) -> Result<(), LinkError> {
        self.state.lock().publish_calls += 1;
        if device_id != self.cfg.device_id {
            return Err(LinkError::Unreachable);
        }
        if pipelines.is_empty() {
            return Err(anyhow!("no transport pipelines selected").into());
        }
        if !self.cfg.latency.is_zero() {
            time::sleep(self.cfg.latency).await;
        }
        {
            let st = self.state.lock();
            if !st.online {
                return Err(LinkError::Unreachable);
            }
            if let Some(code) = st.fail_code {
                return Err(LinkError::from_code(code, "simulated failure"));
            }
        }
        let echo = self.apply(writes);
        debug!(target = "stride.sim", writes = %writes, "command applied");
        if self.cfg.echo && !echo.is_empty() {
            self.emit(echo);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl DeviceInfoSource for SimMachine {
    async fn device_info(&self, device_id: &str) -> Result<DeviceInfo, LinkError> {
        if device_id != self.cfg.device_id {
            return Err(LinkError::Unreachable);
        }
        let st = self.state.lock();
        Ok(DeviceInfo { online: st.online, link_connected: Some(st.link_connected) })
    }
}

#[async_trait::async_trait]
impl TelemetryBus for SimMachine {
    async fn register(&self, device_id: &str) -> Result<BundleStream, LinkError> {
        if device_id != self.cfg.device_id {
            return Err(LinkError::Unreachable);
        }
        let (tx, rx) = mpsc::unbounded();
        self.listeners.lock().push(tx);
        Ok(rx.boxed())
    }
}
