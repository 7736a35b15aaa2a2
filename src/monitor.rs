// Monitoring control loop.
//
// Transitions are computed by `ControlState::apply` as a list of effects; the
// service executes them while holding the control lock. No await happens under
// that lock: sensor and location calls are synchronous, persistence runs in the
// sample-processing task.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::classifier::EventClassifier;
use crate::config::{MonitorConfig, PipelineTuning};
use crate::error::{FailureKind, MonitorError, MonitorResult, SourceError, StorageError};
use crate::health::HealthMonitor;
use crate::pipeline::FusionPipeline;
use crate::recovery::{ErrorHandler, RecoveryAction, RecoveryOutcome};
use crate::session::SessionManager;
use crate::sources::{interval_us, AccuracyHint, BatteryStatus, LocationSource, ResourceMonitor, SensorSource};
use crate::status::MonitorStatus;
use crate::storage::EventRepository;
use crate::types::{CandidateEvent, DeviceOrientation, MotionState, RawSample, SensorKind};

const LOCATION_INTERVAL: Duration = Duration::from_secs(1);

// ─── Pure state machine ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorPhase {
    Stopped,
    Running,
    /// Sensors and location released to save battery; session kept
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlCommand {
    Start,
    Stop,
    Battery(BatteryStatus),
    Thermal(bool),
    MotionChanged(MotionState),
    /// Settling delay for a scheduled rate change elapsed
    ApplyRate(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    SpawnTasks,
    AbortTasks,
    OpenSession,
    EndSession,
    StartLocation,
    StopLocation,
    RegisterSensors { rate_hz: u32 },
    UnregisterSensors,
    ScheduleRate { rate_hz: u32 },
    CancelPendingRate,
    Unrecoverable(FailureKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlState {
    pub phase: MonitorPhase,
    pub motion: MotionState,
    pub battery: Option<BatteryStatus>,
    pub throttled: bool,
    /// Rate the sensors are registered at
    pub rate_hz: u32,
}

impl ControlState {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            phase: MonitorPhase::Stopped,
            motion: MotionState::Unknown,
            battery: None,
            throttled: false,
            rate_hz: config.normal_rate_hz(),
        }
    }

    pub fn charging(&self) -> bool {
        self.battery.map_or(false, |b| b.charging)
    }

    /// Reduced while throttled, or while parked on battery.
    pub fn target_rate(&self, config: &MonitorConfig) -> u32 {
        if self.throttled || (self.motion == MotionState::Stationary && !self.charging()) {
            config.reduced_rate_hz()
        } else {
            config.normal_rate_hz()
        }
    }

    fn reschedule(&self, config: &MonitorConfig) -> Vec<Effect> {
        let mut effects = vec![Effect::CancelPendingRate];
        let target = self.target_rate(config);
        if target != self.rate_hz {
            effects.push(Effect::ScheduleRate { rate_hz: target });
        }
        effects
    }

    fn stop_effects(phase: MonitorPhase) -> Vec<Effect> {
        let mut effects = vec![Effect::AbortTasks, Effect::CancelPendingRate];
        if phase == MonitorPhase::Running {
            effects.push(Effect::UnregisterSensors);
            effects.push(Effect::StopLocation);
        }
        effects.push(Effect::EndSession);
        effects
    }

    pub fn apply(
        self,
        command: ControlCommand,
        config: &MonitorConfig,
        tuning: &PipelineTuning,
    ) -> (ControlState, Vec<Effect>) {
        use MonitorPhase::*;
        let mut next = self;

        let effects = match command {
            ControlCommand::Start => {
                if self.phase != Stopped {
                    return (self, Vec::new());
                }
                next.phase = Running;
                next.motion = MotionState::Unknown;
                next.throttled = false;
                next.rate_hz = next.target_rate(config);
                vec![
                    Effect::SpawnTasks,
                    Effect::OpenSession,
                    Effect::StartLocation,
                    Effect::RegisterSensors { rate_hz: next.rate_hz },
                ]
            }

            ControlCommand::Stop => {
                if self.phase == Stopped {
                    return (self, Vec::new());
                }
                next.phase = Stopped;
                next.motion = MotionState::Unknown;
                Self::stop_effects(self.phase)
            }

            ControlCommand::Battery(status) => {
                next.battery = Some(status);
                if self.phase == Stopped {
                    return (next, Vec::new());
                }
                if !status.charging && status.level_percent <= tuning.battery_critical_percent {
                    next.phase = Stopped;
                    next.motion = MotionState::Unknown;
                    let mut effects = Self::stop_effects(self.phase);
                    effects.push(Effect::Unrecoverable(FailureKind::BatteryCritical));
                    effects
                } else if self.phase == Running
                    && !status.charging
                    && status.level_percent < config.battery_pause_percent()
                {
                    next.phase = Paused;
                    vec![Effect::CancelPendingRate, Effect::UnregisterSensors, Effect::StopLocation]
                } else if self.phase == Paused
                    && (status.charging || status.level_percent >= config.battery_resume_percent())
                {
                    next.phase = Running;
                    next.rate_hz = next.target_rate(config);
                    vec![
                        Effect::OpenSession,
                        Effect::StartLocation,
                        Effect::RegisterSensors { rate_hz: next.rate_hz },
                    ]
                } else if self.phase == Running && status.charging != self.charging() {
                    next.reschedule(config)
                } else {
                    Vec::new()
                }
            }

            ControlCommand::Thermal(throttled) => {
                if throttled == self.throttled {
                    return (self, Vec::new());
                }
                next.throttled = throttled;
                if self.phase != Running {
                    Vec::new()
                } else if throttled {
                    // Applied immediately, no settling delay
                    let mut effects = vec![Effect::CancelPendingRate];
                    let reduced = config.reduced_rate_hz();
                    if self.rate_hz != reduced {
                        next.rate_hz = reduced;
                        effects.push(Effect::RegisterSensors { rate_hz: reduced });
                    }
                    effects
                } else {
                    next.reschedule(config)
                }
            }

            ControlCommand::MotionChanged(motion) => {
                if motion == self.motion {
                    return (self, Vec::new());
                }
                next.motion = motion;
                if self.phase == Running {
                    next.reschedule(config)
                } else {
                    Vec::new()
                }
            }

            ControlCommand::ApplyRate(rate_hz) => {
                if self.phase == Running && rate_hz == self.target_rate(config) && rate_hz != self.rate_hz {
                    next.rate_hz = rate_hz;
                    vec![Effect::RegisterSensors { rate_hz }]
                } else {
                    Vec::new()
                }
            }
        };
        (next, effects)
    }
}

// ─── Service ─────────────────────────────────────────────────────────────────

/// Collaborators the service drives.
pub struct MonitorDeps {
    pub sensors: Arc<dyn SensorSource>,
    pub location: Arc<dyn LocationSource>,
    pub resources: Arc<dyn ResourceMonitor>,
    pub repository: EventRepository,
}

struct Control {
    state: ControlState,
    tasks: Vec<JoinHandle<()>>,
    pending_rate: Option<JoinHandle<()>>,
    sample_tx: Option<mpsc::Sender<RawSample>>,
    rate_tx: Option<watch::Sender<u32>>,
}

#[derive(Default)]
struct Counters {
    accel_samples: AtomicU64,
    gyro_samples: AtomicU64,
    location_fixes: AtomicU64,
    candidates: AtomicU64,
    events_stored: AtomicU64,
    events_rejected: AtomicU64,
    events_dropped: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Clone, Copy)]
struct PipelineSnapshot {
    orientation: DeviceOrientation,
    calibrated: bool,
    calibration_count: u64,
    device_stability: f32,
}

impl Default for PipelineSnapshot {
    fn default() -> Self {
        Self {
            orientation: DeviceOrientation::Unknown,
            calibrated: false,
            calibration_count: 0,
            device_stability: 0.5,
        }
    }
}

struct Inner {
    config: MonitorConfig,
    tuning: PipelineTuning,
    sensors: Arc<dyn SensorSource>,
    location: Arc<dyn LocationSource>,
    resources: Arc<dyn ResourceMonitor>,
    repository: EventRepository,
    classifier: EventClassifier,
    sessions: SessionManager,
    errors: ErrorHandler,
    health: HealthMonitor,
    counters: Counters,
    snapshot: Mutex<PipelineSnapshot>,
    shed_buffers: AtomicBool,
    last_error: Mutex<Option<MonitorError>>,
    control: Mutex<Control>,
}

/// Road anomaly monitoring service.
///
/// Cheap to clone; all clones drive the same run.
#[derive(Clone)]
pub struct MonitoringService {
    inner: Arc<Inner>,
}

impl MonitoringService {
    pub fn new(config: MonitorConfig, tuning: PipelineTuning, deps: MonitorDeps) -> Self {
        let state = ControlState::new(&config);
        let inner = Inner {
            classifier: EventClassifier::new(&config, &tuning),
            sessions: SessionManager::new(config.session_timeout()),
            health: HealthMonitor::new(&tuning),
            errors: ErrorHandler::new(),
            counters: Counters::default(),
            snapshot: Mutex::new(PipelineSnapshot::default()),
            shed_buffers: AtomicBool::new(false),
            last_error: Mutex::new(None),
            control: Mutex::new(Control {
                state,
                tasks: Vec::new(),
                pending_rate: None,
                sample_tx: None,
                rate_tx: None,
            }),
            sensors: deps.sensors,
            location: deps.location,
            resources: deps.resources,
            repository: deps.repository,
            config,
            tuning,
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn start(&self) -> MonitorResult<()> {
        let inner = &self.inner;
        let mut control = inner.lock_control()?;
        if control.state.phase != MonitorPhase::Stopped {
            return Err(MonitorError::AlreadyRunning);
        }
        if let Ok(mut last) = inner.last_error.lock() {
            *last = None;
        }

        if let Err(e) = inner.transition(&mut control, ControlCommand::Start) {
            log::error!("Start failed: {e}");
            if let Err(stop_err) = inner.transition(&mut control, ControlCommand::Stop) {
                log::error!("Rollback after failed start: {stop_err}");
            }
            return Err(e);
        }
        log::info!("Monitoring started at {} Hz", control.state.rate_hz);
        Ok(())
    }

    pub fn stop(&self) -> MonitorResult<()> {
        let mut control = self.inner.lock_control()?;
        if control.state.phase == MonitorPhase::Stopped {
            return Err(MonitorError::NotRunning);
        }
        self.inner.transition(&mut control, ControlCommand::Stop)?;
        log::info!("Monitoring stopped");
        Ok(())
    }

    pub fn phase(&self) -> MonitorPhase {
        self.inner.phase()
    }

    pub fn sampling_rate_hz(&self) -> u32 {
        self.inner
            .control
            .lock()
            .ok()
            .map(|c| c.state.rate_hz)
            .unwrap_or_else(|| self.inner.config.normal_rate_hz())
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn repository(&self) -> &EventRepository {
        &self.inner.repository
    }

    /// Failure that stopped the last run, if it stopped on its own.
    pub fn last_error(&self) -> Option<MonitorError> {
        self.inner.last_error.lock().ok().and_then(|e| e.clone())
    }

    pub fn status(&self) -> MonitorStatus {
        let inner = &self.inner;
        let state = inner
            .control
            .lock()
            .ok()
            .map(|c| c.state)
            .unwrap_or_else(|| ControlState::new(&inner.config));
        let snapshot = inner.snapshot.lock().map(|s| *s).unwrap_or_default();
        let counters = &inner.counters;
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        MonitorStatus {
            timestamp: chrono::Utc::now(),
            phase: state.phase,
            sampling_rate_hz: state.rate_hz,
            motion_state: state.motion,
            orientation: snapshot.orientation,
            session_id: inner.sessions.current_session().ok().flatten().map(|s| s.id),
            sessions_started: inner.sessions.sessions_started().unwrap_or(0),
            calibration_complete: snapshot.calibrated,
            calibration_count: snapshot.calibration_count,
            device_stability: snapshot.device_stability,
            accel_samples: load(&counters.accel_samples),
            gyro_samples: load(&counters.gyro_samples),
            location_fixes: load(&counters.location_fixes),
            candidates_detected: load(&counters.candidates),
            events_stored: load(&counters.events_stored),
            events_rejected: load(&counters.events_rejected),
            events_dropped: load(&counters.events_dropped),
            battery_percent: state.battery.map(|b| b.level_percent),
            charging: state.charging(),
            thermal_throttling: state.throttled,
            health: inner.health.check_health(),
            failures: inner.errors.failure_counts(),
            last_error: self.last_error().map(|e| e.to_string()),
        }
    }
}

impl Inner {
    fn lock_control(&self) -> MonitorResult<MutexGuard<'_, Control>> {
        self.control
            .lock()
            .map_err(|_| MonitorError::Internal("Failed to acquire control lock".to_string()))
    }

    fn phase(&self) -> MonitorPhase {
        self.control
            .lock()
            .ok()
            .map(|c| c.state.phase)
            .unwrap_or(MonitorPhase::Stopped)
    }

    fn dispatch(self: &Arc<Self>, command: ControlCommand) -> MonitorResult<()> {
        let mut control = self.lock_control()?;
        self.transition(&mut control, command)
    }

    fn transition(self: &Arc<Self>, control: &mut Control, command: ControlCommand) -> MonitorResult<()> {
        let (next, effects) = control.state.apply(command, &self.config, &self.tuning);
        if next.phase != control.state.phase {
            log::info!("Monitor {:?} -> {:?} ({:?})", control.state.phase, next.phase, command);
        }
        control.state = next;
        self.execute(control, effects)
    }

    /// Run every effect; the first failure is returned after the rest ran.
    fn execute(self: &Arc<Self>, control: &mut Control, effects: Vec<Effect>) -> MonitorResult<()> {
        let mut first_error = None;
        for effect in effects {
            log::debug!("Effect {:?}", effect);
            let result = match effect {
                Effect::SpawnTasks => {
                    self.spawn_tasks(control);
                    Ok(())
                }
                Effect::AbortTasks => {
                    for task in control.tasks.drain(..) {
                        task.abort();
                    }
                    control.sample_tx = None;
                    control.rate_tx = None;
                    Ok(())
                }
                Effect::OpenSession => self.sessions.start_session().map(|_| ()),
                Effect::EndSession => self.sessions.end_session().map(|_| ()),
                Effect::StartLocation => match self.location.start(LOCATION_INTERVAL, AccuracyHint::High) {
                    Ok(()) => Ok(()),
                    Err(e) => self.source_failure(e),
                },
                Effect::StopLocation => {
                    self.location.stop();
                    Ok(())
                }
                Effect::RegisterSensors { rate_hz } => self.register_sensors(control, rate_hz),
                Effect::UnregisterSensors => {
                    self.sensors.unregister(SensorKind::Accel);
                    self.sensors.unregister(SensorKind::Gyro);
                    Ok(())
                }
                Effect::ScheduleRate { rate_hz } => {
                    self.schedule_rate(control, rate_hz);
                    Ok(())
                }
                Effect::CancelPendingRate => {
                    if let Some(pending) = control.pending_rate.take() {
                        pending.abort();
                    }
                    Ok(())
                }
                Effect::Unrecoverable(kind) => {
                    self.errors.handle(kind, "control loop");
                    self.record_error(MonitorError::Unrecoverable {
                        kind,
                        message: "monitoring stopped".to_string(),
                    });
                    Ok(())
                }
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn source_failure(&self, error: SourceError) -> MonitorResult<()> {
        match self.errors.handle(error.failure_kind(), &error.to_string()) {
            RecoveryOutcome::Unrecoverable(kind) => Err(MonitorError::Unrecoverable {
                kind,
                message: error.to_string(),
            }),
            RecoveryOutcome::Recover(_) => Ok(()),
        }
    }

    fn register_sensors(&self, control: &mut Control, rate_hz: u32) -> MonitorResult<()> {
        let tx = control
            .sample_tx
            .clone()
            .ok_or_else(|| MonitorError::Internal("Sample channel not open".to_string()))?;
        let period = interval_us(rate_hz);
        for kind in [SensorKind::Accel, SensorKind::Gyro] {
            if let Err(e) = self.sensors.register(kind, period, tx.clone()) {
                self.source_failure(e)?;
            }
        }
        if let Some(rate_tx) = &control.rate_tx {
            rate_tx.send_replace(rate_hz);
        }
        self.health.reset();
        log::info!("Sensors registered at {} Hz", rate_hz);
        Ok(())
    }

    fn schedule_rate(self: &Arc<Self>, control: &mut Control, rate_hz: u32) {
        if let Some(pending) = control.pending_rate.take() {
            pending.abort();
        }
        let weak = Arc::downgrade(self);
        let delay = self.tuning.rate_transition_delay;
        log::debug!("Rate change to {} Hz in {:?}", rate_hz, delay);

        control.pending_rate = Some(tokio::spawn(async move {
            sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let result = inner.lock_control().and_then(|mut control| {
                control.pending_rate = None;
                inner.transition(&mut control, ControlCommand::ApplyRate(rate_hz))
            });
            if let Err(e) = result {
                log::error!("Rate change to {} Hz failed: {e}", rate_hz);
            }
        }));
    }

    fn spawn_tasks(self: &Arc<Self>, control: &mut Control) {
        let rate = control.state.rate_hz;
        let (sample_tx, sample_rx) = mpsc::channel(self.tuning.sample_channel_capacity.max(1));
        let (rate_tx, rate_rx) = watch::channel(rate);
        let pipeline = FusionPipeline::new(&self.config, &self.tuning, rate);
        let motion_rx = pipeline.subscribe_motion();
        let location_rx = self.location.subscribe();

        control.sample_tx = Some(sample_tx);
        control.rate_tx = Some(rate_tx);

        let weak = Arc::downgrade(self);
        control.tasks.push(tokio::spawn(processing_task(
            weak.clone(),
            pipeline,
            sample_rx,
            location_rx,
            rate_rx,
        )));
        control.tasks.push(tokio::spawn(resource_task(weak.clone(), self.tuning.resource_poll_interval)));
        control.tasks.push(tokio::spawn(motion_task(weak, motion_rx, self.config.stationary_timeout())));
    }

    fn record_error(&self, error: MonitorError) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(error);
        }
    }

    /// Stop the run after an unrecoverable failure.
    fn fail(self: &Arc<Self>, kind: FailureKind, message: String) {
        log::error!("Stopping monitoring: {kind:?}: {message}");
        self.record_error(MonitorError::Unrecoverable { kind, message });
        match self.lock_control() {
            Ok(mut control) if control.state.phase != MonitorPhase::Stopped => {
                if let Err(e) = self.transition(&mut control, ControlCommand::Stop) {
                    log::error!("Stop after failure: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => log::error!("{e}"),
        }
    }

    fn update_snapshot(&self, pipeline: &FusionPipeline) {
        if let Ok(mut snapshot) = self.snapshot.lock() {
            *snapshot = PipelineSnapshot {
                orientation: pipeline.orientation(),
                calibrated: pipeline.is_calibrated(),
                calibration_count: pipeline.calibration_count(),
                device_stability: pipeline.device_stability(),
            };
        }
    }

    async fn persist(self: &Arc<Self>, candidate: &CandidateEvent, session_id: Option<Uuid>) {
        let Some(session_id) = session_id else {
            bump(&self.counters.events_dropped);
            log::debug!("Candidate at {} ms dropped: no active session", candidate.timestamp);
            return;
        };
        let event = match self.classifier.classify(candidate, session_id) {
            Ok(event) => event,
            Err(e) => {
                bump(&self.counters.events_rejected);
                log::warn!("{e}");
                return;
            }
        };
        if let Err(e) = self.classifier.validate_classified_event(&event) {
            bump(&self.counters.events_rejected);
            log::debug!("{e}");
            return;
        }

        match self.repository.insert(&event).await {
            Ok(()) => {
                bump(&self.counters.events_stored);
                if let Err(e) = self.sessions.update_activity() {
                    log::warn!("{e}");
                }
                log::info!(
                    "Stored event {} severity {} peak {:.2} m/s² confidence {:.2}",
                    event.id, event.severity, event.peak_accel_ms2, event.confidence
                );
            }
            Err(e) => {
                bump(&self.counters.events_dropped);
                self.storage_failure(e);
            }
        }
    }

    fn storage_failure(self: &Arc<Self>, error: StorageError) {
        let Some(kind) = error.failure_kind() else {
            log::warn!("Event dropped: {error}");
            return;
        };
        match self.errors.handle(kind, &error.to_string()) {
            RecoveryOutcome::Recover(RecoveryAction::CleanupStorage) => {
                if let Err(e) = self.repository.cleanup() {
                    log::warn!("Storage cleanup failed: {e}");
                }
            }
            RecoveryOutcome::Recover(_) => {}
            RecoveryOutcome::Unrecoverable(kind) => self.fail(kind, error.to_string()),
        }
    }
}

// ─── Tasks ───────────────────────────────────────────────────────────────────

async fn processing_task(
    weak: Weak<Inner>,
    mut pipeline: FusionPipeline,
    mut samples: mpsc::Receiver<RawSample>,
    mut location_rx: watch::Receiver<Option<crate::types::LocationFix>>,
    mut rate_rx: watch::Receiver<u32>,
) {
    let mut session_id: Option<Uuid> = None;
    let mut gps_degraded = false;
    let mut fix_received: Option<Instant> = None;
    let mut fix_stale = false;

    while let Some(sample) = samples.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };

        if rate_rx.has_changed().unwrap_or(false) {
            let rate = *rate_rx.borrow_and_update();
            pipeline.set_sample_rate(rate);
        }
        if location_rx.has_changed().unwrap_or(false) {
            let latest = *location_rx.borrow_and_update();
            if let Some(fix) = latest {
                fix_received = Some(Instant::now());
                inner.health.gps.update();
                bump(&inner.counters.location_fixes);
                let poor = !fix.has_accuracy_within(inner.config.gps_accuracy_threshold_m());
                if poor && !gps_degraded {
                    inner
                        .errors
                        .handle(FailureKind::GpsAccuracyTooLow, &format!("fix accuracy {:.0} m", fix.accuracy_m));
                }
                gps_degraded = poor;
            }
        }
        let fresh = fix_received.map_or(false, |at| at.elapsed() <= inner.tuning.max_fix_age);
        if fix_stale == fresh {
            if fresh {
                log::info!("Location fix available");
            } else if fix_received.is_some() {
                log::warn!("No location fix for {:?}, detection suspended", inner.tuning.max_fix_age);
            }
            fix_stale = !fresh;
        }
        let location = if fresh { *location_rx.borrow() } else { None };

        match sample.kind {
            SensorKind::Accel => {
                inner.health.accel.update();
                bump(&inner.counters.accel_samples);
            }
            SensorKind::Gyro => {
                inner.health.gyro.update();
                bump(&inner.counters.gyro_samples);
            }
        }

        if inner.shed_buffers.swap(false, Ordering::SeqCst) {
            pipeline.shed_buffers();
        }
        let current = inner.sessions.current_session().ok().flatten().map(|s| s.id);
        if current != session_id {
            // Candidates never merge across sessions
            if let Some(candidate) = pipeline.flush_candidates() {
                bump(&inner.counters.candidates);
                inner.persist(&candidate, session_id).await;
            }
            session_id = current;
        }

        let outcome = pipeline.process(&sample, location);
        if let Some(e) = outcome.calibration_error {
            let action = inner.errors.handle(FailureKind::SensorCalibrationFailure, &e.to_string());
            if action == RecoveryOutcome::Recover(RecoveryAction::RetryCalibration) {
                pipeline.retry_calibration();
            }
        }
        if sample.kind == SensorKind::Accel {
            inner.update_snapshot(&pipeline);
        }

        if let Some(candidate) = outcome.candidate {
            bump(&inner.counters.candidates);
            inner.persist(&candidate, session_id).await;
        }
    }
    log::debug!("Sample processing finished");
}

#[derive(Default)]
struct PollState {
    throttled: bool,
    low_memory: bool,
    silent: HashSet<&'static str>,
}

async fn resource_task(weak: Weak<Inner>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut poll = PollState::default();

    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        inner.poll_resources(&mut poll);
    }
}

impl Inner {
    fn poll_resources(self: &Arc<Self>, poll: &mut PollState) {
        let battery = self.resources.battery();
        if let Err(e) = self.dispatch(ControlCommand::Battery(battery)) {
            log::error!("Battery update failed: {e}");
        }

        let throttled = self.resources.is_thermal_throttling();
        if throttled && !poll.throttled {
            self.errors.handle(FailureKind::CpuThrottling, "thermal throttling");
        }
        poll.throttled = throttled;
        if let Err(e) = self.dispatch(ControlCommand::Thermal(throttled)) {
            log::error!("Thermal update failed: {e}");
        }

        let low_memory = self.resources.is_low_memory();
        if low_memory && !poll.low_memory {
            let outcome = self.errors.handle(FailureKind::LowMemory, "memory pressure");
            if outcome == RecoveryOutcome::Recover(RecoveryAction::ReduceBufferLoad) {
                self.shed_buffers.store(true, Ordering::SeqCst);
            }
        }
        poll.low_memory = low_memory;

        let state = match self.lock_control() {
            Ok(control) => control.state,
            Err(_) => return,
        };
        if state.phase != MonitorPhase::Running {
            poll.silent.clear();
            return;
        }

        // Keep the session open for as long as the vehicle moves
        if state.motion == MotionState::Moving {
            if let Err(e) = self.sessions.update_activity() {
                log::warn!("{e}");
            }
        }

        let silent = self.health.silent_sources();
        for source in &silent {
            if poll.silent.insert(source.name) {
                self.errors.handle(source.failure_kind(), &format!("{} silent", source.name));
            }
        }
        poll.silent.retain(|name| silent.iter().any(|s| s.name == *name));
        log::debug!("{}", self.health.format_status());
    }
}

async fn motion_task(weak: Weak<Inner>, mut motion_rx: watch::Receiver<MotionState>, stationary_timeout: Duration) {
    let mut deadline: Option<Instant> = None;

    loop {
        let expiry = deadline;
        let stationary_expired = async move {
            match expiry {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            changed = motion_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let motion = *motion_rx.borrow_and_update();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = inner.dispatch(ControlCommand::MotionChanged(motion)) {
                    log::error!("Motion update failed: {e}");
                }
                deadline = match motion {
                    MotionState::Stationary => Some(Instant::now() + stationary_timeout),
                    MotionState::Moving => {
                        if inner.phase() == MonitorPhase::Running {
                            let opened = inner.sessions.start_session().and_then(|_| inner.sessions.update_activity());
                            if let Err(e) = opened {
                                log::warn!("{e}");
                            }
                        }
                        None
                    }
                    MotionState::Unknown => None,
                };
            }
            _ = stationary_expired => {
                deadline = None;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                log::info!("Stationary for {:?}, ending session", stationary_timeout);
                if let Err(e) = inner.sessions.end_session() {
                    log::warn!("{e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::BackoffPolicy;
    use crate::sim::{DriveProfile, SimulatedLocation, SimulatedResources, SimulatedSensors};
    use crate::storage::MemoryEventStore;

    fn config() -> MonitorConfig {
        MonitorConfig::default()
    }

    fn tuning() -> PipelineTuning {
        PipelineTuning::default()
    }

    fn running() -> ControlState {
        let (state, _) = ControlState::new(&config()).apply(ControlCommand::Start, &config(), &tuning());
        state
    }

    fn battery(level_percent: u8, charging: bool) -> ControlCommand {
        ControlCommand::Battery(BatteryStatus { level_percent, charging })
    }

    // ── Pure transitions ──

    #[test]
    fn test_start_registers_at_normal_rate() {
        let (state, effects) = ControlState::new(&config()).apply(ControlCommand::Start, &config(), &tuning());
        assert_eq!(state.phase, MonitorPhase::Running);
        assert_eq!(state.rate_hz, 50);
        assert_eq!(
            effects,
            vec![
                Effect::SpawnTasks,
                Effect::OpenSession,
                Effect::StartLocation,
                Effect::RegisterSensors { rate_hz: 50 },
            ]
        );

        let (again, effects) = state.apply(ControlCommand::Start, &config(), &tuning());
        assert_eq!(again, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_stop_releases_everything() {
        let (state, effects) = running().apply(ControlCommand::Stop, &config(), &tuning());
        assert_eq!(state.phase, MonitorPhase::Stopped);
        assert!(effects.contains(&Effect::AbortTasks));
        assert!(effects.contains(&Effect::UnregisterSensors));
        assert!(effects.contains(&Effect::StopLocation));
        assert_eq!(effects.last(), Some(&Effect::EndSession));
    }

    #[test]
    fn test_low_battery_pauses_with_hysteresis() {
        let (paused, effects) = running().apply(battery(12, false), &config(), &tuning());
        assert_eq!(paused.phase, MonitorPhase::Paused);
        assert_eq!(
            effects,
            vec![Effect::CancelPendingRate, Effect::UnregisterSensors, Effect::StopLocation]
        );

        // Between pause and resume thresholds: stays paused
        let (still_paused, effects) = paused.apply(battery(20, false), &config(), &tuning());
        assert_eq!(still_paused.phase, MonitorPhase::Paused);
        assert!(effects.is_empty());

        let (resumed, effects) = still_paused.apply(battery(20, true), &config(), &tuning());
        assert_eq!(resumed.phase, MonitorPhase::Running);
        assert!(effects.contains(&Effect::OpenSession));
        assert!(effects.contains(&Effect::RegisterSensors { rate_hz: 50 }));

        let (resumed, _) = paused.apply(battery(25, false), &config(), &tuning());
        assert_eq!(resumed.phase, MonitorPhase::Running);
    }

    #[test]
    fn test_charging_does_not_pause() {
        let (state, effects) = running().apply(battery(10, true), &config(), &tuning());
        assert_eq!(state.phase, MonitorPhase::Running);
        assert_eq!(effects, vec![Effect::CancelPendingRate]);
    }

    #[test]
    fn test_critical_battery_stops_unrecoverably() {
        let (state, effects) = running().apply(battery(3, false), &config(), &tuning());
        assert_eq!(state.phase, MonitorPhase::Stopped);
        assert_eq!(effects.last(), Some(&Effect::Unrecoverable(FailureKind::BatteryCritical)));
        assert!(effects.contains(&Effect::EndSession));
    }

    #[test]
    fn test_stationary_schedules_reduced_rate() {
        let (state, effects) = running().apply(ControlCommand::MotionChanged(MotionState::Stationary), &config(), &tuning());
        assert_eq!(effects, vec![Effect::CancelPendingRate, Effect::ScheduleRate { rate_hz: 10 }]);
        assert_eq!(state.rate_hz, 50);

        let (state, effects) = state.apply(ControlCommand::ApplyRate(10), &config(), &tuning());
        assert_eq!(effects, vec![Effect::RegisterSensors { rate_hz: 10 }]);
        assert_eq!(state.rate_hz, 10);

        let (state, effects) = state.apply(ControlCommand::MotionChanged(MotionState::Moving), &config(), &tuning());
        assert_eq!(effects, vec![Effect::CancelPendingRate, Effect::ScheduleRate { rate_hz: 50 }]);
        assert_eq!(state.target_rate(&config()), 50);
    }

    #[test]
    fn test_newer_motion_cancels_pending_rate() {
        let (state, _) = running().apply(ControlCommand::MotionChanged(MotionState::Stationary), &config(), &tuning());
        let (state, effects) = state.apply(ControlCommand::MotionChanged(MotionState::Moving), &config(), &tuning());
        assert_eq!(effects, vec![Effect::CancelPendingRate]);

        // A stale timer that slipped through is ignored
        let (state, effects) = state.apply(ControlCommand::ApplyRate(10), &config(), &tuning());
        assert!(effects.is_empty());
        assert_eq!(state.rate_hz, 50);
    }

    #[test]
    fn test_stationary_while_charging_keeps_normal_rate() {
        let (state, _) = running().apply(battery(60, true), &config(), &tuning());
        let (_, effects) = state.apply(ControlCommand::MotionChanged(MotionState::Stationary), &config(), &tuning());
        assert_eq!(effects, vec![Effect::CancelPendingRate]);
    }

    #[test]
    fn test_throttling_forces_reduced_rate() {
        let (state, effects) = running().apply(ControlCommand::Thermal(true), &config(), &tuning());
        assert_eq!(state.rate_hz, 10);
        assert_eq!(effects, vec![Effect::CancelPendingRate, Effect::RegisterSensors { rate_hz: 10 }]);

        let (state, effects) = state.apply(ControlCommand::Thermal(false), &config(), &tuning());
        assert_eq!(effects, vec![Effect::CancelPendingRate, Effect::ScheduleRate { rate_hz: 50 }]);
        assert!(!state.throttled);
    }

    #[test]
    fn test_commands_ignored_while_stopped() {
        let stopped = ControlState::new(&config());
        for command in [
            ControlCommand::Stop,
            ControlCommand::MotionChanged(MotionState::Stationary),
            ControlCommand::ApplyRate(10),
            battery(2, false),
        ] {
            let (state, effects) = stopped.apply(command, &config(), &tuning());
            assert_eq!(state.phase, MonitorPhase::Stopped);
            assert!(effects.is_empty());
        }
    }

    // ── Service ──

    struct Harness {
        service: MonitoringService,
        sensors: Arc<SimulatedSensors>,
        location: Arc<SimulatedLocation>,
        resources: Arc<SimulatedResources>,
    }

    fn harness(profile: DriveProfile, speed_kmh: f32) -> Harness {
        harness_with(config(), profile, speed_kmh, 10_000)
    }

    fn harness_with(config: MonitorConfig, profile: DriveProfile, speed_kmh: f32, max_events: usize) -> Harness {
        let sensors = Arc::new(SimulatedSensors::new(profile));
        let location = Arc::new(SimulatedLocation::new(48.137, 11.575, speed_kmh, 8.0));
        let resources = Arc::new(SimulatedResources::new(BatteryStatus { level_percent: 80, charging: false }));
        let repository = EventRepository::new(
            Arc::new(MemoryEventStore::new()),
            max_events,
            chrono::Duration::days(30),
            BackoffPolicy::default(),
        );
        let deps = MonitorDeps {
            sensors: sensors.clone(),
            location: location.clone(),
            resources: resources.clone(),
            repository,
        };
        Harness {
            service: MonitoringService::new(config, tuning(), deps),
            sensors,
            location,
            resources,
        }
    }

    fn stored(h: &Harness) -> usize {
        h.service.repository().count().unwrap()
    }

    fn failures(h: &Harness, kind: &str) -> u64 {
        h.service.status().failures.get(kind).copied().unwrap_or(0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_lifecycle() {
        let h = harness(DriveProfile::Driving { bump_interval: None }, 40.0);
        h.service.start().unwrap();
        assert_eq!(h.service.phase(), MonitorPhase::Running);
        assert_eq!(h.sensors.registered_interval(SensorKind::Accel), Some(20_000));
        assert!(h.location.is_running());
        assert!(h.service.sessions().has_active_session().unwrap());
        assert_eq!(h.service.start(), Err(MonitorError::AlreadyRunning));

        sleep(Duration::from_secs(2)).await;
        assert!(h.service.status().accel_samples > 50);

        h.service.stop().unwrap();
        assert_eq!(h.service.phase(), MonitorPhase::Stopped);
        assert_eq!(h.sensors.registered_interval(SensorKind::Accel), None);
        assert!(!h.location.is_running());
        assert!(!h.service.sessions().has_active_session().unwrap());
        assert_eq!(h.service.stop(), Err(MonitorError::NotRunning));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parked_device_drops_to_reduced_rate() {
        let h = harness(DriveProfile::Parked, 0.0);
        h.service.start().unwrap();

        sleep(Duration::from_secs(5)).await;
        assert_eq!(h.service.status().motion_state, MotionState::Stationary);
        assert_eq!(h.service.sampling_rate_hz(), 10);
        assert_eq!(h.sensors.registered_interval(SensorKind::Accel), Some(100_000));

        sleep(Duration::from_secs(10)).await;
        assert!(h.service.status().calibration_complete);

        h.sensors.set_profile(DriveProfile::Driving { bump_interval: None });
        sleep(Duration::from_secs(5)).await;
        assert_eq!(h.service.sampling_rate_hz(), 50);
        h.service.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bumps_are_classified_and_stored() {
        let h = harness(DriveProfile::Driving { bump_interval: Some(Duration::from_secs(3)) }, 40.0);
        h.service.start().unwrap();

        sleep(Duration::from_secs(10)).await;
        let stored = h.service.repository().count().unwrap();
        assert!(stored >= 2, "stored {stored}");

        let session = h.service.sessions().current_session().unwrap().unwrap();
        let events = h.service.repository().query(&crate::storage::EventQuery::default()).unwrap();
        assert!(events.iter().all(|e| e.session_id == session.id));
        assert!(events.iter().all(|e| (1..=5).contains(&e.severity)));
        h.service.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_bump_stored_once() {
        let h = harness(DriveProfile::Driving { bump_interval: Some(Duration::from_secs(3)) }, 40.0);
        h.service.start().unwrap();

        // Bumps at 3 s, 6 s and 9 s
        sleep(Duration::from_millis(10_500)).await;
        let status = h.service.status();
        assert_eq!(status.candidates_detected, 3);
        assert_eq!(stored(&h), 3);

        let events = h.service.repository().query(&crate::storage::EventQuery::default()).unwrap();
        assert!(events.iter().all(|e| (50..=500).contains(&e.impulse_duration_ms)));
        h.service.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_slow_means_no_events() {
        let h = harness(DriveProfile::Driving { bump_interval: Some(Duration::from_secs(3)) }, 3.0);
        h.service.start().unwrap();
        sleep(Duration::from_secs(10)).await;
        assert_eq!(stored(&h), 0);

        h.location.set_speed_kmh(40.0);
        sleep(Duration::from_secs(5)).await;
        assert!(stored(&h) >= 1);
        h.service.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_location_suspends_detection() {
        let h = harness(DriveProfile::Driving { bump_interval: Some(Duration::from_secs(3)) }, 40.0);
        h.service.start().unwrap();
        sleep(Duration::from_secs(4)).await;
        h.location.stop();

        // Fixes age out 3 s after the last one
        sleep(Duration::from_secs(4)).await;
        let before = stored(&h);
        assert!(before >= 1);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(stored(&h), before);
        let status = h.service.status();
        assert!(!status.health.gps_healthy);
        assert_eq!(status.phase, MonitorPhase::Running);

        h.location.start(Duration::from_secs(1), AccuracyHint::High).unwrap();
        sleep(Duration::from_secs(5)).await;
        assert!(stored(&h) > before);
        h.service.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_poor_gps_accuracy_reported_once_per_episode() {
        let h = harness(DriveProfile::Driving { bump_interval: Some(Duration::from_secs(3)) }, 40.0);
        h.location.set_accuracy_m(35.0);
        h.service.start().unwrap();

        sleep(Duration::from_secs(10)).await;
        assert_eq!(failures(&h, "GpsAccuracyTooLow"), 1);
        assert_eq!(stored(&h), 0);

        h.location.set_accuracy_m(8.0);
        sleep(Duration::from_secs(5)).await;
        assert!(stored(&h) >= 1);

        h.location.set_accuracy_m(35.0);
        sleep(Duration::from_secs(5)).await;
        assert_eq!(failures(&h, "GpsAccuracyTooLow"), 2);
        assert_eq!(h.service.phase(), MonitorPhase::Running);
        h.service.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_memory_sheds_buffers_once_per_episode() {
        let h = harness(DriveProfile::Driving { bump_interval: None }, 40.0);
        h.resources.set_low_memory(true);
        h.service.start().unwrap();

        sleep(Duration::from_secs(1)).await;
        assert_eq!(failures(&h, "LowMemory"), 1);
        // Request raised by the poll and consumed by sample processing
        assert!(!h.service.inner.shed_buffers.load(Ordering::SeqCst));

        sleep(Duration::from_secs(31)).await;
        assert_eq!(failures(&h, "LowMemory"), 1);

        h.resources.set_low_memory(false);
        sleep(Duration::from_secs(30)).await;
        h.resources.set_low_memory(true);
        sleep(Duration::from_secs(30)).await;
        assert_eq!(failures(&h, "LowMemory"), 2);
        assert_eq!(h.service.phase(), MonitorPhase::Running);
        h.service.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_full_drops_event_and_keeps_running() {
        let h = harness_with(config(), DriveProfile::Driving { bump_interval: Some(Duration::from_secs(3)) }, 40.0, 1);
        h.service.start().unwrap();

        // First bump fills the store, the second finds it full
        sleep(Duration::from_secs(7)).await;
        assert_eq!(stored(&h), 1);
        assert_eq!(failures(&h, "StorageFull"), 1);
        assert_eq!(h.service.status().events_dropped, 1);
        assert_eq!(h.service.phase(), MonitorPhase::Running);

        // Once synced, the old event is reclaimed for the next one
        let first = h.service.repository().unsynced(10).unwrap();
        let ids: Vec<Uuid> = first.iter().map(|e| e.id).collect();
        h.service.repository().mark_synced(&ids).unwrap();
        sleep(Duration::from_secs(3)).await;

        let now = h.service.repository().unsynced(10).unwrap();
        assert_eq!(stored(&h), 1);
        assert_eq!(now.len(), 1);
        assert_ne!(now[0].id, ids[0]);
        h.service.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stationary_timeout_ends_session() {
        let mut config = config();
        config.set_stationary_timeout_min(1).unwrap();
        let h = harness_with(config, DriveProfile::Parked, 0.0, 10_000);
        h.service.start().unwrap();
        let first = h.service.sessions().current_session().unwrap().unwrap().id;

        sleep(Duration::from_secs(30)).await;
        assert!(h.service.sessions().has_active_session().unwrap());

        sleep(Duration::from_secs(40)).await;
        assert!(!h.service.sessions().has_active_session().unwrap());
        assert_eq!(h.service.phase(), MonitorPhase::Running);

        // Driving off opens a new session
        h.sensors.set_profile(DriveProfile::Driving { bump_interval: None });
        h.location.set_speed_kmh(40.0);
        sleep(Duration::from_secs(5)).await;
        let second = h.service.sessions().current_session().unwrap().unwrap().id;
        assert_ne!(second, first);
        assert_eq!(h.service.sessions().sessions_started().unwrap(), 2);
        h.service.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_pause_and_resume() {
        let h = harness(DriveProfile::Driving { bump_interval: None }, 40.0);
        h.resources.set_battery(BatteryStatus { level_percent: 12, charging: false });
        h.service.start().unwrap();

        sleep(Duration::from_secs(1)).await;
        assert_eq!(h.service.phase(), MonitorPhase::Paused);
        assert_eq!(h.sensors.registered_interval(SensorKind::Accel), None);
        assert!(h.service.sessions().has_active_session().unwrap());

        h.resources.set_battery(BatteryStatus { level_percent: 12, charging: true });
        sleep(Duration::from_secs(31)).await;
        assert_eq!(h.service.phase(), MonitorPhase::Running);
        assert_eq!(h.sensors.registered_interval(SensorKind::Accel), Some(20_000));
        h.service.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_battery_stops_service() {
        let h = harness(DriveProfile::Driving { bump_interval: None }, 40.0);
        h.resources.set_battery(BatteryStatus { level_percent: 2, charging: false });
        h.service.start().unwrap();

        sleep(Duration::from_secs(1)).await;
        assert_eq!(h.service.phase(), MonitorPhase::Stopped);
        assert!(matches!(
            h.service.last_error(),
            Some(MonitorError::Unrecoverable { kind: FailureKind::BatteryCritical, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_fails_start() {
        let h = harness(DriveProfile::Parked, 0.0);
        h.sensors.deny_permission(true);
        let result = h.service.start();
        assert!(matches!(
            result,
            Err(MonitorError::Unrecoverable { kind: FailureKind::SensorPermissionDenied, .. })
        ));
        assert_eq!(h.service.phase(), MonitorPhase::Stopped);
        assert!(!h.location.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_thermal_throttling_reduces_rate() {
        let h = harness(DriveProfile::Driving { bump_interval: None }, 40.0);
        h.resources.set_thermal_throttling(true);
        h.service.start().unwrap();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(h.service.sampling_rate_hz(), 10);
        assert!(h.service.status().failures.contains_key("CpuThrottling"));
        h.service.stop().unwrap();
    }
}
