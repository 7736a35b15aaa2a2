//! Simulated collaborators for replays, the demo binary and tests.
//!
//! Sample timestamps are milliseconds since the simulator was created, taken
//! from the tokio clock so paused-time tests stay deterministic.

use std::collections::HashMap;
use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};

use crate::error::SourceError;
use crate::sources::{AccuracyHint, BatteryStatus, LocationSource, ResourceMonitor, SensorSource};
use crate::types::{LocationFix, RawSample, SensorKind};

/// Pothole spike added to vertical acceleration (m/s²).
const BUMP_MAGNITUDE: f32 = 12.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DriveProfile {
    /// Level and still
    Parked,
    /// Road vibration and steady yaw, optionally a pothole every `bump_interval`
    Driving { bump_interval: Option<Duration> },
}

fn accel_at(profile: DriveProfile, t_ms: u64, bump: bool) -> (f32, f32, f32) {
    let t = t_ms as f32 / 1000.0;
    match profile {
        DriveProfile::Parked => (0.0, 0.0, 9.81 + (t * PI).sin() * 0.01),
        DriveProfile::Driving { .. } => {
            let z = 9.81 + (t * 2.0 * PI * 11.0).sin() * 0.5 + if bump { BUMP_MAGNITUDE } else { 0.0 };
            ((t * 2.0 * PI * 1.3).sin() * 0.3, (t * 2.0 * PI * 0.7).cos() * 0.2, z)
        }
    }
}

fn gyro_at(profile: DriveProfile, t_ms: u64) -> (f32, f32, f32) {
    let t = t_ms as f32 / 1000.0;
    match profile {
        DriveProfile::Parked => (0.0, 0.0, 0.0),
        DriveProfile::Driving { .. } => ((t * 0.5).sin() * 0.02, (t * 0.3).cos() * 0.03, 0.2 + t.sin() * 0.05),
    }
}

struct Registration {
    task: JoinHandle<()>,
    interval_us: u64,
}

/// Accelerometer and gyroscope following a [`DriveProfile`].
pub struct SimulatedSensors {
    profile: Arc<Mutex<DriveProfile>>,
    registrations: Mutex<HashMap<SensorKind, Registration>>,
    deny_permission: AtomicBool,
    epoch: Instant,
}

impl SimulatedSensors {
    pub fn new(profile: DriveProfile) -> Self {
        Self {
            profile: Arc::new(Mutex::new(profile)),
            registrations: Mutex::new(HashMap::new()),
            deny_permission: AtomicBool::new(false),
            epoch: Instant::now(),
        }
    }

    pub fn set_profile(&self, profile: DriveProfile) {
        if let Ok(mut current) = self.profile.lock() {
            *current = profile;
        }
    }

    pub fn deny_permission(&self, deny: bool) {
        self.deny_permission.store(deny, Ordering::SeqCst);
    }

    pub fn registered_interval(&self, kind: SensorKind) -> Option<u64> {
        self.registrations
            .lock()
            .ok()
            .and_then(|r| r.get(&kind).map(|reg| reg.interval_us))
    }
}

async fn sensor_loop(
    kind: SensorKind,
    interval_us: u64,
    profile: Arc<Mutex<DriveProfile>>,
    epoch: Instant,
    tx: mpsc::Sender<RawSample>,
) {
    let mut ticker = interval(Duration::from_micros(interval_us.max(1)));
    let mut last_bump: Option<u64> = None;
    let mut dropped = 0u64;

    loop {
        ticker.tick().await;
        let t_ms = epoch.elapsed().as_millis() as u64;
        let profile = profile.lock().map(|p| *p).unwrap_or(DriveProfile::Parked);

        let sample = match kind {
            SensorKind::Accel => {
                let bump = match profile {
                    DriveProfile::Driving { bump_interval: Some(every) } if !every.is_zero() => {
                        let index = t_ms / every.as_millis().max(1) as u64;
                        let fire = index > 0 && last_bump.map_or(true, |last| index != last);
                        last_bump = Some(index);
                        fire
                    }
                    _ => false,
                };
                let (x, y, z) = accel_at(profile, t_ms, bump);
                RawSample::accel(x, y, z, t_ms)
            }
            SensorKind::Gyro => {
                let (x, y, z) = gyro_at(profile, t_ms);
                RawSample::gyro(x, y, z, t_ms)
            }
        };

        match tx.try_send(sample) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                if dropped % 100 == 1 {
                    log::warn!("{:?} channel full, {} samples dropped", kind, dropped);
                }
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
}

impl SensorSource for SimulatedSensors {
    fn register(&self, kind: SensorKind, interval_us: u64, listener: mpsc::Sender<RawSample>) -> Result<(), SourceError> {
        if self.deny_permission.load(Ordering::SeqCst) {
            return Err(SourceError::SensorPermissionDenied(format!("{kind:?}")));
        }
        let mut registrations = self
            .registrations
            .lock()
            .map_err(|_| SourceError::SensorUnavailable(format!("{kind:?}")))?;
        if let Some(previous) = registrations.remove(&kind) {
            previous.task.abort();
        }
        let task = tokio::spawn(sensor_loop(kind, interval_us, self.profile.clone(), self.epoch, listener));
        registrations.insert(kind, Registration { task, interval_us });
        Ok(())
    }

    fn unregister(&self, kind: SensorKind) {
        if let Ok(mut registrations) = self.registrations.lock() {
            if let Some(previous) = registrations.remove(&kind) {
                previous.task.abort();
            }
        }
    }
}

// ─── Location ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Track {
    latitude: f64,
    longitude: f64,
    speed_kmh: f32,
    accuracy_m: f32,
}

/// GPS heading due east at a fixed speed.
pub struct SimulatedLocation {
    track: Arc<Mutex<Track>>,
    fix_tx: Arc<watch::Sender<Option<LocationFix>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    epoch: Instant,
}

impl SimulatedLocation {
    pub fn new(latitude: f64, longitude: f64, speed_kmh: f32, accuracy_m: f32) -> Self {
        let (fix_tx, _) = watch::channel(None);
        Self {
            track: Arc::new(Mutex::new(Track { latitude, longitude, speed_kmh, accuracy_m })),
            fix_tx: Arc::new(fix_tx),
            task: Mutex::new(None),
            epoch: Instant::now(),
        }
    }

    pub fn set_speed_kmh(&self, speed_kmh: f32) {
        if let Ok(mut track) = self.track.lock() {
            track.speed_kmh = speed_kmh;
        }
    }

    pub fn set_accuracy_m(&self, accuracy_m: f32) {
        if let Ok(mut track) = self.track.lock() {
            track.accuracy_m = accuracy_m;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().map(|t| t.is_some()).unwrap_or(false)
    }
}

impl LocationSource for SimulatedLocation {
    fn start(&self, every: Duration, _accuracy: AccuracyHint) -> Result<(), SourceError> {
        let mut task = self
            .task
            .lock()
            .map_err(|_| SourceError::LocationUnavailable("simulator state poisoned".to_string()))?;
        if let Some(previous) = task.take() {
            previous.abort();
        }

        let track = self.track.clone();
        let fix_tx = self.fix_tx.clone();
        let epoch = self.epoch;
        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;
                let Ok(mut t) = track.lock() else {
                    break;
                };
                // ~111 km per degree of longitude at the equator; close enough here
                let meters = t.speed_kmh as f64 / 3.6 * every.as_secs_f64();
                t.longitude += meters / 111_320.0;
                let fix = LocationFix::new(t.latitude, t.longitude, t.accuracy_m, t.speed_kmh / 3.6, epoch.elapsed().as_millis() as u64)
                    .with_bearing(90.0);
                fix_tx.send_replace(Some(fix));
            }
        }));
        Ok(())
    }

    fn stop(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(previous) = task.take() {
                previous.abort();
            }
        }
    }

    fn subscribe(&self) -> watch::Receiver<Option<LocationFix>> {
        self.fix_tx.subscribe()
    }

    fn last_known(&self) -> Option<LocationFix> {
        *self.fix_tx.borrow()
    }
}

// ─── Resources ───────────────────────────────────────────────────────────────

pub struct SimulatedResources {
    battery: Mutex<BatteryStatus>,
    thermal: AtomicBool,
    low_memory: AtomicBool,
}

impl SimulatedResources {
    pub fn new(battery: BatteryStatus) -> Self {
        Self {
            battery: Mutex::new(battery),
            thermal: AtomicBool::new(false),
            low_memory: AtomicBool::new(false),
        }
    }

    pub fn set_battery(&self, status: BatteryStatus) {
        if let Ok(mut battery) = self.battery.lock() {
            *battery = status;
        }
    }

    pub fn set_thermal_throttling(&self, throttling: bool) {
        self.thermal.store(throttling, Ordering::SeqCst);
    }

    pub fn set_low_memory(&self, low: bool) {
        self.low_memory.store(low, Ordering::SeqCst);
    }
}

impl ResourceMonitor for SimulatedResources {
    fn battery(&self) -> BatteryStatus {
        self.battery
            .lock()
            .map(|b| *b)
            .unwrap_or(BatteryStatus { level_percent: 100, charging: true })
    }

    fn is_thermal_throttling(&self) -> bool {
        self.thermal.load(Ordering::SeqCst)
    }

    fn is_low_memory(&self) -> bool {
        self.low_memory.load(Ordering::SeqCst)
    }
}
