//! The session actor: one task owning all mutable session state.
//!
//! User intents, telemetry bundles, timer firings and delivery completions are all
//! serialised through a single `select!` loop, so no two handlers ever interleave.
//! Command delivery runs on spawned tasks that report back as [`Internal`] messages.

use iox::{KeyValueStore, SessionArchive};
use model::{Goal, SessionRecord};
use std::collections::HashMap;
use std::sync::Arc;
use stride_link_core::{
    decode_bundle, BundleStream, CommandChannel, DeviceInfoSource, Field, LinkError, Payload,
    TelemetryBundle, TelemetryBus, TelemetryEvent, TelemetryValue,
};
use futures::StreamExt;
use ::time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::lifecycle::{build_record, finalize, Navigator};
use crate::optimistic::{Observation, OptimisticValue};
use crate::phase::{Entry, Phase, RemoteAction};
use crate::publisher::{deliver, Command, CommandKey, CommandPublisher, Dispatch, InfoCache, PublishError};
use crate::session::{Dashboard, SessionData};
use crate::sport::{normalize, EncodingDetector, SportState};
use crate::timer::TimerSlot;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Intent {
    /// Main button: start or resume when not running, pause when running.
    Toggle,
    Start,
    Pause,
    Stop,
    SpeedUp,
    SpeedDown,
    SetSpeed(f64),
    /// Dial position; drives resistance or incline depending on the gauge.
    SetLoad(f64),
    /// Answer to a reached goal: finish the session or keep going.
    GoalDecision { finish: bool },
}

/// Transient, user-visible problems.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    DeviceUnreachable { key: CommandKey },
    CommandFailed { key: CommandKey, code: String, message: String },
    SaveFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Notice(Notice),
    GoalReached(Goal),
    SessionFinished(Box<SessionRecord>),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("telemetry registration failed: {0}")]
    Register(#[source] LinkError),
    #[error("engine stopped")]
    Closed,
}

/// Everything the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub channel: Arc<dyn CommandChannel>,
    pub device_info: Arc<dyn DeviceInfoSource>,
    pub bus: Arc<dyn TelemetryBus>,
    pub store: Arc<dyn KeyValueStore>,
    pub navigator: Arc<dyn Navigator>,
}

impl Collaborators {
    /// One device object serving all three link roles.
    pub fn from_device<D>(device: Arc<D>, store: Arc<dyn KeyValueStore>, navigator: Arc<dyn Navigator>) -> Self
    where
        D: CommandChannel + DeviceInfoSource + TelemetryBus + 'static,
    {
        Self {
            channel: device.clone(),
            device_info: device.clone(),
            bus: device,
            store,
            navigator,
        }
    }
}

pub struct EngineHandle {
    intents: mpsc::Sender<Intent>,
    display: watch::Receiver<Dashboard>,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    pub async fn send(&self, intent: Intent) -> Result<(), EngineError> {
        self.intents.send(intent).await.map_err(|_| EngineError::Closed)
    }

    pub fn dashboard(&self) -> Dashboard { self.display.borrow().clone() }

    pub async fn next_event(&mut self) -> Option<EngineEvent> { self.events.recv().await }

    pub fn try_event(&mut self) -> Option<EngineEvent> { self.events.try_recv().ok() }

    /// Closes the intent channel and waits for the task to wind down.
    pub async fn shutdown(self) {
        let EngineHandle { intents, task, .. } = self;
        drop(intents);
        let _ = task.await;
    }
}

/// Continuation attached to a command, run when its delivery completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Followup {
    None,
    /// Pre-start load write; START goes out whatever its outcome.
    StartAfterLoad,
    Started,
    Paused,
    LoadApplied,
    Speed,
}

enum Internal {
    DebounceFired { key: CommandKey, generation: u64 },
    Delivered { key: CommandKey, followup: Followup, outcome: Result<(), PublishError> },
    SpeedLockExpired { generation: u64 },
}

#[derive(Default)]
struct Debounced {
    timer: TimerSlot,
    pending: Option<(Payload, Followup)>,
}

pub struct SessionEngine {
    cfg: EngineConfig,
    collab: Collaborators,
    archive: SessionArchive<Arc<dyn KeyValueStore>>,
    info_cache: InfoCache,
    publisher: CommandPublisher<Followup>,
    debounced: HashMap<CommandKey, Debounced>,
    speed: OptimisticValue,
    speed_timer: TimerSlot,
    encoding: EncodingDetector,
    phase: Phase,
    data: SessionData,
    last_toggle: Option<Instant>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    events: mpsc::UnboundedSender<EngineEvent>,
    display: watch::Sender<Dashboard>,
}

impl SessionEngine {
    /// Subscribes to the device's telemetry and starts the engine task.
    pub async fn spawn(cfg: EngineConfig, collab: Collaborators) -> Result<EngineHandle, EngineError> {
        let telemetry = collab.bus.register(&cfg.device_id).await.map_err(EngineError::Register)?;
        let info_cache = InfoCache::default();
        match collab.device_info.device_info(&cfg.device_id).await {
            Ok(info) => info_cache.store(info),
            Err(err) => warn!(target = "stride.engine", device = %cfg.device_id, error = %err, "initial device info unavailable"),
        }

        let (intent_tx, intent_rx) = mpsc::channel(32);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let data = SessionData::new(&cfg);
        let (display_tx, display_rx) = watch::channel(data.dashboard(Phase::Idle, false));

        let engine = SessionEngine {
            archive: SessionArchive::new(collab.store.clone()),
            speed: OptimisticValue::new(cfg.speed_lock.tolerance),
            cfg,
            collab,
            info_cache,
            publisher: CommandPublisher::new(),
            debounced: HashMap::new(),
            speed_timer: TimerSlot::default(),
            encoding: EncodingDetector::default(),
            phase: Phase::Idle,
            data,
            last_toggle: None,
            internal_tx,
            events: event_tx,
            display: display_tx,
        };
        let task = tokio::spawn(engine.run(intent_rx, telemetry, internal_rx));
        Ok(EngineHandle { intents: intent_tx, display: display_rx, events: event_rx, task })
    }

    async fn run(
        mut self,
        mut intents: mpsc::Receiver<Intent>,
        mut telemetry: BundleStream,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let mut tick = time::interval_at(Instant::now() + Duration::from_secs(1), Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut telemetry_open = true;
        info!(target = "stride.engine", device = %self.cfg.device_id, "session engine started");

        loop {
            tokio::select! {
                intent = intents.recv() => match intent {
                    Some(intent) => self.on_intent(intent),
                    None => break,
                },
                bundle = telemetry.next(), if telemetry_open => match bundle {
                    Some(bundle) => self.on_bundle(&bundle),
                    None => {
                        warn!(target = "stride.engine", "telemetry stream ended");
                        telemetry_open = false;
                    }
                },
                Some(msg) = internal.recv() => self.on_internal(msg),
                _ = tick.tick() => self.on_tick(),
            }
            self.refresh_display();
        }

        self.cancel_timers();
        info!(target = "stride.engine", device = %self.cfg.device_id, "session engine stopped");
    }

    fn on_intent(&mut self, intent: Intent) {
        debug!(target = "stride.engine", ?intent, phase = ?self.phase, "intent");
        match intent {
            Intent::Toggle => self.toggle(),
            Intent::Start => self.start_local(),
            Intent::Pause => self.pause_local(),
            Intent::Stop => self.stop_sequence(true),
            Intent::SpeedUp => self.adjust_speed(self.data.speed + self.cfg.speed_step),
            Intent::SpeedDown => self.adjust_speed(self.data.speed - self.cfg.speed_step),
            Intent::SetSpeed(v) => self.adjust_speed(v),
            Intent::SetLoad(v) => self.set_load(v),
            Intent::GoalDecision { finish } => self.goal_decision(finish),
        }
    }

    fn toggle(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_toggle {
            if now.duration_since(last) < self.cfg.main_action_guard() {
                debug!(target = "stride.engine", "main action ignored inside guard window");
                return;
            }
        }
        self.last_toggle = Some(now);
        if self.phase == Phase::Running {
            self.pause_local();
        } else {
            self.start_local();
        }
    }

    fn start_local(&mut self) {
        if !self.phase.can_start() {
            debug!(target = "stride.engine", phase = ?self.phase, "start ignored");
            return;
        }
        let payload = self.prestart_load();
        self.publish(CommandKey::PrestartLoad, payload, Followup::StartAfterLoad);
    }

    /// Some machines report no motion until a nonzero load is set.
    fn prestart_load(&mut self) -> Payload {
        if self.data.load <= 0.0 {
            self.data.load = 1.0;
        }
        Payload::new().set(self.gauge_channel(), self.data.load)
    }

    fn pause_local(&mut self) {
        if self.phase != Phase::Running {
            debug!(target = "stride.engine", phase = ?self.phase, "pause ignored");
            return;
        }
        let payload = self.sport_payload(SportState::Pause);
        self.publish(CommandKey::SportState, payload, Followup::Paused);
    }

    fn adjust_speed(&mut self, target: f64) {
        let predicted = (self.data.speed_limits.clamp(target) * 10.0).round() / 10.0;
        self.data.speed = self.speed.predict(predicted);

        let tx = self.internal_tx.clone();
        let timeout = self.cfg.lock_timeout();
        self.speed_timer.arm(timeout, move |generation| {
            let _ = tx.send(Internal::SpeedLockExpired { generation });
        });

        let raw = self.cfg.profile.units.speed_to_raw(predicted);
        let payload = Payload::new().set(self.cfg.profile.channels.speed, raw);
        let delay = self.cfg.speed_debounce();
        self.enqueue(CommandKey::Speed, payload, delay, Followup::Speed);
    }

    fn set_load(&mut self, v: f64) {
        let load = self.data.incline_limits.clamp(v);
        if load == self.data.load {
            trace!(target = "stride.engine", load, "load unchanged");
            return;
        }
        self.data.set_load(load, self.phase.in_session());
        let payload = Payload::new().set(self.gauge_channel(), load);
        let delay = self.cfg.load_debounce();
        self.enqueue(CommandKey::Load, payload, delay, Followup::LoadApplied);
    }

    fn goal_decision(&mut self, finish: bool) {
        let Some(goal) = self.data.goal.as_mut().filter(|g| g.is_completed()) else {
            debug!(target = "stride.engine", "no goal decision pending");
            return;
        };
        if finish {
            self.stop_sequence(true);
            return;
        }
        goal.decline();
        if self.phase == Phase::Paused {
            self.enter_running();
        }
    }

    /// Debounced submit: the latest value wins once `delay` passes without another.
    fn enqueue(&mut self, key: CommandKey, payload: Payload, delay: Duration, followup: Followup) {
        let tx = self.internal_tx.clone();
        let slot = self.debounced.entry(key).or_default();
        slot.pending = Some((payload, followup));
        slot.timer.arm(delay, move |generation| {
            let _ = tx.send(Internal::DebounceFired { key, generation });
        });
    }

    fn publish(&mut self, key: CommandKey, payload: Payload, followup: Followup) {
        match self.publisher.submit(key, payload, followup) {
            Dispatch::Send(cmd) => self.spawn_delivery(cmd),
            Dispatch::Queued { superseded } => {
                debug!(target = "stride.publisher", %key, superseded = superseded.is_some(), "queued behind in-flight write");
            }
            Dispatch::Empty => debug!(target = "stride.publisher", %key, "empty payload, nothing to publish"),
        }
    }

    fn spawn_delivery(&self, cmd: Command<Followup>) {
        let channel = Arc::clone(&self.collab.channel);
        let info = Arc::clone(&self.collab.device_info);
        let cache = self.info_cache.clone();
        let device_id = self.cfg.device_id.clone();
        let publish_cfg = self.cfg.publish.clone();
        let tx = self.internal_tx.clone();
        debug!(target = "stride.publisher", key = %cmd.key, writes = %cmd.writes, "publishing");
        tokio::spawn(async move {
            let Command { key, writes, followup } = cmd;
            let outcome = deliver(channel.as_ref(), info.as_ref(), &cache, &device_id, &writes, &publish_cfg).await;
            let _ = tx.send(Internal::Delivered { key, followup, outcome });
        });
    }

    fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::DebounceFired { key, generation } => {
                let Some(slot) = self.debounced.get_mut(&key) else { return };
                if !slot.timer.fired(generation) {
                    trace!(target = "stride.engine", %key, "stale debounce firing");
                    return;
                }
                if let Some((payload, followup)) = slot.pending.take() {
                    self.publish(key, payload, followup);
                }
            }
            Internal::Delivered { key, followup, outcome } => self.on_delivered(key, followup, outcome),
            Internal::SpeedLockExpired { generation } => {
                if !self.speed_timer.fired(generation) {
                    return;
                }
                if let Some(v) = self.speed.expire() {
                    debug!(target = "stride.engine", speed = v, "speed lock expired, showing device value");
                    self.data.speed = v;
                }
            }
        }
    }

    fn on_delivered(&mut self, key: CommandKey, followup: Followup, outcome: Result<(), PublishError>) {
        if let Some(next) = self.publisher.complete(key) {
            self.spawn_delivery(next);
        }
        if let Err(err) = &outcome {
            self.report_failure(key, err);
        }
        let ok = outcome.is_ok();
        match followup {
            Followup::None => {}
            Followup::StartAfterLoad => {
                if !ok {
                    warn!(target = "stride.engine", "load re-assert failed, sending start anyway");
                }
                if self.phase.can_start() {
                    let payload = self.sport_payload(SportState::Start);
                    self.publish(CommandKey::SportState, payload, Followup::Started);
                }
            }
            Followup::Started => {
                if ok {
                    self.enter_running();
                }
            }
            Followup::Paused => {
                if ok {
                    if let Err(err) = self.phase.pause() {
                        debug!(target = "stride.engine", %err, "pause confirmation ignored");
                    }
                }
            }
            Followup::LoadApplied => {
                if ok && self.phase == Phase::Idle {
                    info!(target = "stride.engine", load = self.data.load, "load set while idle, starting session");
                    self.start_local();
                }
            }
            Followup::Speed => {
                if !ok {
                    self.speed_timer.cancel();
                    if let Some(v) = self.speed.fail() {
                        self.data.speed = v;
                    }
                }
            }
        }
    }

    fn report_failure(&mut self, key: CommandKey, err: &PublishError) {
        let notice = match err {
            PublishError::PrecheckBlocked => {
                warn!(target = "stride.publisher", %key, "device not ready, command not sent");
                Notice::DeviceUnreachable { key }
            }
            PublishError::Channel(e) => {
                warn!(target = "stride.publisher", %key, error = %e, "command failed");
                Notice::CommandFailed { key, code: e.code(), message: e.to_string() }
            }
        };
        self.emit(EngineEvent::Notice(notice));
    }

    fn enter_running(&mut self) -> Option<Entry> {
        match self.phase.begin() {
            Ok(Entry::Fresh) => {
                self.data.reset_for_session();
                info!(target = "stride.engine", goal = ?self.data.goal.as_ref().map(|g| g.goal()), "session started");
                Some(Entry::Fresh)
            }
            Ok(Entry::Resumed) => {
                debug!(target = "stride.engine", "session resumed");
                Some(Entry::Resumed)
            }
            Err(err) => {
                debug!(target = "stride.engine", %err, "start ignored");
                None
            }
        }
    }

    /// Stop, archive, navigate. Runs at most once per session: `begin_stop` fails
    /// for every phase but Running and Paused.
    fn stop_sequence(&mut self, send_command: bool) {
        if let Err(err) = self.phase.begin_stop() {
            debug!(target = "stride.engine", %err, "stop ignored");
            return;
        }
        info!(target = "stride.engine", remote = !send_command, elapsed = self.data.elapsed_secs, "stopping session");
        if send_command {
            let payload = self.sport_payload(SportState::Stop);
            self.publish(CommandKey::SportState, payload, Followup::None);
        }
        self.cancel_timers();
        self.speed.release();

        let record = build_record(&self.data, &self.cfg.profile.units, OffsetDateTime::now_utc());
        if let Err(err) = self.phase.finish() {
            warn!(target = "stride.engine", %err, "unexpected phase while finishing");
        }
        if let Err(err) = finalize(&self.archive, self.collab.navigator.as_ref(), &record) {
            warn!(target = "stride.engine", error = %err, "could not archive session, showing summary anyway");
            self.emit(EngineEvent::Notice(Notice::SaveFailed { reason: err.to_string() }));
        }
        self.emit(EngineEvent::SessionFinished(Box::new(record)));
    }

    fn on_bundle(&mut self, bundle: &TelemetryBundle) {
        for ev in decode_bundle(bundle) {
            self.on_event(ev);
        }
    }

    fn on_event(&mut self, ev: TelemetryEvent) {
        let Some(field) = self.cfg.profile.channels.field(ev.channel) else {
            trace!(target = "stride.engine", channel = ev.channel, "unmapped channel");
            return;
        };
        match field {
            Field::SportState => self.on_sport_report(&ev.value),
            Field::History => trace!(target = "stride.engine", "history channel ignored"),
            _ => match ev.value.as_f64() {
                Some(v) => self.on_reading(field, v),
                None => trace!(target = "stride.engine", channel = ev.channel, value = %ev.value, "non-numeric reading skipped"),
            },
        }
    }

    fn on_sport_report(&mut self, raw: &TelemetryValue) {
        let Some(state) = normalize(raw) else {
            trace!(target = "stride.engine", value = %raw, "unrecognised sport state");
            return;
        };
        self.encoding.observe(raw);
        debug!(target = "stride.engine", ?state, phase = ?self.phase, "machine reported sport state");
        match self.phase.remote_action(state) {
            RemoteAction::BeginSession => {
                self.enter_running();
                let payload = self.prestart_load();
                self.publish(CommandKey::PrestartLoad, payload, Followup::None);
            }
            RemoteAction::Resume => {
                self.enter_running();
            }
            RemoteAction::Pause => {
                if let Err(err) = self.phase.pause() {
                    debug!(target = "stride.engine", %err, "remote pause ignored");
                }
            }
            RemoteAction::Stop => self.stop_sequence(false),
            RemoteAction::Ignore => trace!(target = "stride.engine", ?state, "sport state needs no action"),
        }
    }

    fn on_reading(&mut self, field: Field, v: f64) {
        let in_session = self.phase.in_session();
        let units = &self.cfg.profile.units;
        match field {
            Field::Speed => {
                let speed = units.speed_from_raw(v);
                self.on_speed(speed, in_session);
            }
            Field::Distance => {
                let km = units.distance_from_raw(v);
                if self.data.apply_distance(km, in_session) {
                    self.goal_reached();
                }
            }
            Field::Calories => {
                if self.data.apply_calories(v, in_session) {
                    self.goal_reached();
                }
            }
            Field::ElapsedTime => self.data.apply_elapsed(v),
            Field::HeartRate => self.data.heart_rate_bpm = v,
            Field::Resistance => self.data.apply_resistance(v, in_session),
            Field::Incline => self.data.apply_incline(v, in_session),
            Field::MaxSpeed => self.data.speed_limits.max = units.speed_limit_from_raw(v),
            Field::MinSpeed => self.data.speed_limits.min = units.speed_limit_from_raw(v),
            Field::MaxIncline => self.data.incline_limits.max = v,
            Field::MinIncline => self.data.incline_limits.min = v,
            Field::PeakResistance => self.data.device_peak_load = Some(v),
            Field::TroughResistance => self.data.device_trough_load = Some(v),
            Field::SportState | Field::History => {}
        }
    }

    fn on_speed(&mut self, speed: f64, in_session: bool) {
        match self.speed.observe(speed) {
            Observation::Suppressed => {
                trace!(target = "stride.engine", speed, "speed report suppressed while locked");
                return;
            }
            Observation::Confirmed(v) => {
                self.speed_timer.cancel();
                self.data.speed = v;
            }
            Observation::Accepted(v) => self.data.speed = v,
        }
        if in_session {
            self.data.stats.track_speed(speed);
        }
    }

    fn on_tick(&mut self) {
        if self.phase == Phase::Running && self.data.tick() {
            self.goal_reached();
        }
    }

    /// The session pauses locally and waits for a [`Intent::GoalDecision`].
    fn goal_reached(&mut self) {
        let Some(goal) = self.data.goal.as_ref().map(|g| g.goal()) else { return };
        info!(target = "stride.engine", ?goal, "goal reached");
        if let Err(err) = self.phase.pause() {
            debug!(target = "stride.engine", %err, "already paused at goal");
        }
        self.emit(EngineEvent::GoalReached(goal));
    }

    fn sport_payload(&self, state: SportState) -> Payload {
        Payload::new().set(self.cfg.profile.channels.sport_state, self.encoding.encode(state))
    }

    fn gauge_channel(&self) -> u32 { self.data.gauge_channel(&self.cfg.profile.channels) }

    fn cancel_timers(&mut self) {
        for slot in self.debounced.values_mut() {
            slot.timer.cancel();
            slot.pending = None;
        }
        self.speed_timer.cancel();
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn refresh_display(&self) {
        self.display.send_replace(self.data.dashboard(self.phase, self.speed.is_locked()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iox::{MemoryStore, StoreError};
    use model::{GoalKind, TransitionParams};
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use stride_link_core::{DpWrites, CODE_BUSY};
    use stride_link_sim::{SimConfig, SimMachine};

    #[derive(Default)]
    struct RecordingNavigator(Mutex<Vec<TransitionParams>>);

    impl Navigator for RecordingNavigator {
        fn show_summary(&self, params: TransitionParams) { self.0.lock().push(params); }
    }

    struct FailingStore;

    impl KeyValueStore for FailingStore {
        fn get(&self, _: &str) -> Result<Option<Value>, StoreError> { Ok(None) }
        fn set(&self, _: &str, _: Value) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk full".into()))
        }
    }

    struct Rig {
        sim: Arc<SimMachine>,
        engine: EngineHandle,
        nav: Arc<RecordingNavigator>,
        store: Arc<dyn KeyValueStore>,
    }

    impl Rig {
        async fn new(cfg: EngineConfig) -> Self {
            Self::with(cfg, SimConfig { latency: Duration::ZERO, ..SimConfig::default() }, Arc::new(MemoryStore::new())).await
        }

        async fn with(cfg: EngineConfig, sim_cfg: SimConfig, store: Arc<dyn KeyValueStore>) -> Self {
            let sim = Arc::new(SimMachine::new(SimConfig { device_id: cfg.device_id.clone(), echo: false, ..sim_cfg }));
            let nav = Arc::new(RecordingNavigator::default());
            let collab = Collaborators::from_device(sim.clone(), store.clone(), nav.clone());
            let engine = SessionEngine::spawn(cfg, collab).await.unwrap();
            Rig { sim, engine, nav, store }
        }

        async fn send(&self, intent: Intent) { self.engine.send(intent).await.unwrap(); }

        fn events(&mut self) -> Vec<EngineEvent> {
            let mut out = vec![];
            while let Some(e) = self.engine.try_event() {
                out.push(e);
            }
            out
        }

        async fn remote_start(&self) {
            self.sim.push(json!({"106": "Start"}));
            settle().await;
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig { device_id: "sim-0".into(), ..EngineConfig::default() }
    }

    async fn settle() { time::sleep(Duration::from_millis(10)).await; }

    async fn wait(ms: u64) { time::sleep(Duration::from_millis(ms)).await; }

    fn writes(v: Value) -> DpWrites {
        let mut p = Payload::new();
        for (k, v) in v.as_object().unwrap() {
            let value: TelemetryValue = serde_json::from_value(v.clone()).unwrap();
            p = p.set(k.parse().unwrap(), value);
        }
        p.strip().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_reasserts_load_then_starts() {
        let rig = Rig::new(EngineConfig { default_load: 0.0, ..test_config() }).await;
        rig.send(Intent::Start).await;
        settle().await;
        assert_eq!(rig.sim.published(), vec![writes(json!({"107": 1})), writes(json!({"106": "Start"}))]);
        let d = rig.engine.dashboard();
        assert_eq!(d.phase, Phase::Running);
        assert_eq!(d.load, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_sent_even_if_load_write_fails() {
        let mut rig = Rig::new(test_config()).await;
        rig.sim.fail_with(Some(CODE_BUSY));
        rig.send(Intent::Start).await;
        settle().await;
        assert_eq!(rig.sim.publish_calls(), 2);
        assert_eq!(rig.engine.dashboard().phase, Phase::Idle);
        let keys: Vec<CommandKey> = rig.events().into_iter().filter_map(|e| match e {
            EngineEvent::Notice(Notice::CommandFailed { key, code, .. }) if code == "busy" => Some(key),
            _ => None,
        }).collect();
        assert_eq!(keys, vec![CommandKey::PrestartLoad, CommandKey::SportState]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_start_does_not_echo_start() {
        let rig = Rig::new(test_config()).await;
        rig.remote_start().await;
        assert_eq!(rig.engine.dashboard().phase, Phase::Running);
        assert_eq!(rig.sim.published(), vec![writes(json!({"107": 1}))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_remote_stop_finishes_once() {
        let mut rig = Rig::new(test_config()).await;
        rig.remote_start().await;
        rig.sim.push(json!({"108": 42, "110": 121}));
        rig.sim.push(json!({"106": "Stop"}));
        settle().await;
        rig.sim.push(json!({"106": "Stop"}));
        settle().await;

        assert_eq!(rig.nav.0.lock().len(), 1);
        assert_eq!(rig.engine.dashboard().phase, Phase::Finished);
        let archived = SessionArchive::new(rig.store.clone()).load().unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].duration_secs, 42);
        assert_eq!(archived[0].heart_rate, 121.0);
        let finished = rig.events().into_iter().filter(|e| matches!(e, EngineEvent::SessionFinished(_))).count();
        assert_eq!(finished, 1);
        // remote stop is never echoed back
        assert!(rig.sim.published().iter().all(|w| w.get(106).is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_stop_then_echo_navigates_once() {
        let rig = Rig::new(test_config()).await;
        rig.remote_start().await;
        rig.send(Intent::Stop).await;
        settle().await;
        rig.sim.push(json!({"106": "Stop"}));
        settle().await;
        assert_eq!(rig.nav.0.lock().len(), 1);
        assert_eq!(rig.sim.published().last(), Some(&writes(json!({"106": "Stop"}))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_idle_is_ignored() {
        let rig = Rig::new(test_config()).await;
        rig.sim.push(json!({"106": "Stop"}));
        rig.send(Intent::Stop).await;
        settle().await;
        assert!(rig.nav.0.lock().is_empty());
        assert_eq!(rig.engine.dashboard().phase, Phase::Idle);
        assert_eq!(rig.sim.publish_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_archive_failure_still_navigates() {
        let mut rig = Rig::with(
            test_config(),
            SimConfig { latency: Duration::ZERO, ..SimConfig::default() },
            Arc::new(FailingStore),
        ).await;
        rig.remote_start().await;
        rig.sim.push(json!({"106": "Stop"}));
        settle().await;
        assert_eq!(rig.nav.0.lock().len(), 1);
        let events = rig.events();
        assert!(events.iter().any(|e| matches!(e, EngineEvent::Notice(Notice::SaveFailed { .. }))));
        assert!(events.iter().any(|e| matches!(e, EngineEvent::SessionFinished(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_and_reordered_telemetry_settle_on_last() {
        let rig = Rig::new(test_config()).await;
        rig.remote_start().await;
        rig.sim.push(json!({"110": 100, "108": 30, "103": 250}));
        rig.sim.push(json!({"110": 100, "108": 30, "103": 250}));
        settle().await;
        let once = rig.engine.dashboard();
        assert_eq!((once.heart_rate_bpm, once.elapsed_secs, once.distance_km), (100.0, 30, 2.5));

        // a late batch carrying older values still wins: last arrival is what shows
        rig.sim.push(json!({"110": 120}));
        rig.sim.push(json!({"110": 95, "999": 1, "bogus": 3}));
        settle().await;
        assert_eq!(rig.engine.dashboard().heart_rate_bpm, 95.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_precheck_failure_never_reaches_channel() {
        let mut rig = Rig::new(test_config()).await;
        rig.sim.set_online(false);
        rig.send(Intent::SetLoad(5.0)).await;
        wait(200).await;
        assert_eq!(rig.sim.publish_calls(), 0);
        assert_eq!(rig.events(), vec![EngineEvent::Notice(Notice::DeviceUnreachable { key: CommandKey::Load })]);
        let d = rig.engine.dashboard();
        assert_eq!(d.load, 5.0);
        assert_eq!(d.phase, Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_change_while_idle_starts_session() {
        let rig = Rig::new(test_config()).await;
        rig.send(Intent::SetLoad(4.0)).await;
        wait(200).await;
        assert_eq!(rig.sim.published(), vec![
            writes(json!({"107": 4})),
            writes(json!({"107": 4})),
            writes(json!({"106": "Start"})),
        ]);
        assert_eq!(rig.engine.dashboard().phase, Phase::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_dial_debounced_and_clamped() {
        let rig = Rig::new(test_config()).await;
        rig.remote_start().await;
        rig.sim.push(json!({"117": 10}));
        rig.send(Intent::SetLoad(2.0)).await;
        wait(50).await;
        rig.send(Intent::SetLoad(3.0)).await;
        wait(50).await;
        rig.send(Intent::SetLoad(14.0)).await;
        wait(200).await;
        assert_eq!(rig.sim.published(), vec![writes(json!({"107": 1})), writes(json!({"107": 10}))]);
        assert_eq!(rig.engine.dashboard().load, 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incline_report_moves_dial_to_incline_channel() {
        let rig = Rig::new(test_config()).await;
        rig.remote_start().await;
        rig.sim.push(json!({"114": 3}));
        settle().await;
        rig.send(Intent::SetLoad(5.0)).await;
        wait(200).await;
        assert_eq!(rig.sim.published().last(), Some(&writes(json!({"114": 5}))));
        assert_eq!(rig.engine.dashboard().gauge, model::GaugeKind::Incline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_lock_suppresses_stale_reports_then_expires() {
        let rig = Rig::new(test_config()).await;
        rig.sim.push(json!({"112": 50}));
        settle().await;
        assert_eq!(rig.engine.dashboard().speed, 5.0);

        rig.send(Intent::SpeedUp).await;
        settle().await;
        let d = rig.engine.dashboard();
        assert_eq!(d.speed, 5.1);
        assert!(d.speed_locked);

        rig.sim.push(json!({"112": 40}));
        settle().await;
        assert_eq!(rig.engine.dashboard().speed, 5.1);

        wait(2100).await;
        let d = rig.engine.dashboard();
        assert_eq!(d.speed, 4.0);
        assert!(!d.speed_locked);
        assert_eq!(rig.sim.published(), vec![writes(json!({"112": 51}))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_lock_released_on_confirmation() {
        let rig = Rig::new(test_config()).await;
        rig.sim.push(json!({"112": 50}));
        rig.send(Intent::SetSpeed(7.0)).await;
        settle().await;
        rig.sim.push(json!({"112": 70}));
        settle().await;
        let d = rig.engine.dashboard();
        assert_eq!(d.speed, 7.0);
        assert!(!d.speed_locked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_speed_command_reverts_display() {
        let mut rig = Rig::new(test_config()).await;
        rig.sim.push(json!({"112": 50}));
        settle().await;
        rig.sim.fail_with(Some(CODE_BUSY));
        rig.send(Intent::SpeedUp).await;
        wait(150).await;
        let d = rig.engine.dashboard();
        assert_eq!(d.speed, 5.0);
        assert!(!d.speed_locked);
        assert!(rig.events().iter().any(|e| matches!(
            e,
            EngineEvent::Notice(Notice::CommandFailed { key: CommandKey::Speed, .. })
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_speed_writes_coalesce() {
        let rig = Rig::with(
            test_config(),
            SimConfig { latency: Duration::from_millis(300), ..SimConfig::default() },
            Arc::new(MemoryStore::new()),
        ).await;
        rig.sim.push(json!({"112": 50}));
        settle().await;
        // first write goes out at +80ms and is in flight until +380ms
        rig.send(Intent::SpeedUp).await;
        wait(100).await;
        rig.send(Intent::SpeedUp).await;
        wait(100).await;
        rig.send(Intent::SpeedUp).await;
        wait(800).await;
        assert_eq!(rig.sim.published(), vec![writes(json!({"112": 51})), writes(json!({"112": 53}))]);
        assert_eq!(rig.sim.publish_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distance_goal_pauses_for_decision() {
        let goal = Goal { kind: GoalKind::Distance, target: 1.0 };
        let mut rig = Rig::new(EngineConfig { goal: Some(goal), ..test_config() }).await;
        rig.remote_start().await;
        rig.sim.push(json!({"103": 1234}));
        rig.sim.push(json!({"103": 1340}));
        settle().await;

        assert!(rig.events().contains(&EngineEvent::GoalReached(goal)));
        let d = rig.engine.dashboard();
        assert!((d.distance_km - 1.06).abs() < 1e-9);
        assert_eq!(d.phase, Phase::Paused);
        assert!(d.goal_completed);

        rig.send(Intent::GoalDecision { finish: false }).await;
        settle().await;
        let d = rig.engine.dashboard();
        assert_eq!(d.phase, Phase::Running);
        assert!(!d.goal_completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_pause_and_resume_keep_baseline_and_stats() {
        let goal = Goal { kind: GoalKind::Distance, target: 5.0 };
        let rig = Rig::new(EngineConfig { goal: Some(goal), ..test_config() }).await;
        rig.remote_start().await;
        rig.sim.push(json!({"103": 1000, "112": 50}));
        rig.sim.push(json!({"103": 1100, "112": 80}));
        settle().await;
        assert!((rig.engine.dashboard().distance_km - 1.0).abs() < 1e-9);

        rig.sim.push(json!({"106": "Pause"}));
        settle().await;
        assert_eq!(rig.engine.dashboard().phase, Phase::Paused);

        rig.sim.push(json!({"106": "Start"}));
        settle().await;
        assert_eq!(rig.engine.dashboard().phase, Phase::Running);

        rig.sim.push(json!({"103": 1200, "112": 30}));
        settle().await;
        // origin captured at 10.00 km survives the resume
        assert!((rig.engine.dashboard().distance_km - 2.0).abs() < 1e-9);

        rig.send(Intent::Stop).await;
        settle().await;
        let archived = SessionArchive::new(rig.store.clone()).load().unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].max_speed, 8.0);
        assert_eq!(archived[0].min_speed, 3.0);
        assert!((archived[0].distance_km - 2.0).abs() < 1e-9);
        // remote state changes are mirrored locally, never echoed back
        assert!(rig.sim.published().iter().all(|w| w.get(106) != Some(&TelemetryValue::Text("Pause".into()))));
        assert_eq!(rig.sim.published().iter().filter(|w| w.get(106).is_some()).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finishing_at_goal_archives_goal_session() {
        let goal = Goal { kind: GoalKind::Calories, target: 20.0 };
        let rig = Rig::new(EngineConfig { goal: Some(goal), ..test_config() }).await;
        rig.remote_start().await;
        rig.sim.push(json!({"105": 100}));
        rig.sim.push(json!({"105": 125}));
        settle().await;
        rig.send(Intent::GoalDecision { finish: true }).await;
        settle().await;

        assert_eq!(rig.sim.published().last(), Some(&writes(json!({"106": "Stop"}))));
        let nav = rig.nav.0.lock();
        assert_eq!(nav.len(), 1);
        assert_eq!(nav[0]["goal_mode"], "true");
        assert_eq!(nav[0]["calories"], "25");
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_goal_counts_down_locally() {
        let goal = Goal { kind: GoalKind::Time, target: 0.05 };
        let mut rig = Rig::new(EngineConfig { goal: Some(goal), ..test_config() }).await;
        rig.remote_start().await;
        rig.sim.push(json!({"108": 900}));
        wait(3500).await;
        assert!(rig.events().contains(&EngineEvent::GoalReached(goal)));
        let d = rig.engine.dashboard();
        assert_eq!(d.countdown_secs, Some(0));
        assert_eq!(d.clock, "00:00:00");
        assert_eq!(d.elapsed_secs, 3);
        assert_eq!(d.phase, Phase::Paused);
    }

    #[tokio::test(start_paused = true)]
    async fn test_numeric_encoding_is_mirrored() {
        let rig = Rig::new(test_config()).await;
        rig.sim.push(json!({"106": 0}));
        settle().await;
        rig.send(Intent::Pause).await;
        settle().await;
        assert_eq!(rig.sim.published().last(), Some(&writes(json!({"106": 1}))));
        assert_eq!(rig.engine.dashboard().phase, Phase::Paused);
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_guard_drops_double_tap() {
        let rig = Rig::new(test_config()).await;
        rig.send(Intent::Toggle).await;
        rig.send(Intent::Toggle).await;
        settle().await;
        assert_eq!(rig.engine.dashboard().phase, Phase::Running);
        assert_eq!(rig.sim.publish_calls(), 2);

        wait(600).await;
        rig.send(Intent::Toggle).await;
        settle().await;
        assert_eq!(rig.engine.dashboard().phase, Phase::Paused);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_task() {
        let rig = Rig::new(test_config()).await;
        let sim = rig.sim.clone();
        rig.engine.shutdown().await;
        sim.push(json!({"106": "Start"}));
        settle().await;
        assert_eq!(sim.publish_calls(), 0);
    }
}
