use nalgebra::Vector3;
use std::collections::VecDeque;
use tokio::sync::watch;

use crate::conditioning::STANDARD_GRAVITY;
use crate::config::PipelineTuning;
use crate::types::{ConditionedSample, DeviceOrientation, MotionState};

const HORIZONTAL_MAX_TILT_DEG: f32 = 30.0;
const DASHBOARD_MAX_TILT_DEG: f32 = 65.0;

/// Neutral stability reported while no gyroscope data is available.
const UNKNOWN_STABILITY: f32 = 0.5;

/// Derives motion state and device orientation from filtered,
/// gravity-inclusive samples and publishes both as observable state.
pub struct MotionInferencer {
    motion_tx: watch::Sender<MotionState>,
    orientation_tx: watch::Sender<DeviceOrientation>,

    // Stationary detection
    still_since: Option<u64>,
    stationary_window_ms: u64,
    accel_tolerance: f32,
    gyro_threshold: f32,

    // Stability
    recent_gyro: VecDeque<f32>,
    stability_window: usize,
    gyro_ceiling: f32,

    // Orientation
    last_gravity: Option<(Vector3<f32>, u64)>,
    orientation_rate_deg_s: f32,
    rate_alpha: f32,
    handling_rate_deg_s: f32,
}

impl MotionInferencer {
    pub fn new(tuning: &PipelineTuning) -> Self {
        let (motion_tx, _) = watch::channel(MotionState::Unknown);
        let (orientation_tx, _) = watch::channel(DeviceOrientation::Unknown);
        Self {
            motion_tx,
            orientation_tx,
            still_since: None,
            stationary_window_ms: tuning.stationary_window_ms,
            accel_tolerance: tuning.stationary_accel_tolerance,
            gyro_threshold: tuning.stationary_gyro_threshold,
            recent_gyro: VecDeque::with_capacity(tuning.stability_window),
            stability_window: tuning.stability_window.max(1),
            gyro_ceiling: tuning.stability_gyro_ceiling,
            last_gravity: None,
            orientation_rate_deg_s: 0.0,
            rate_alpha: tuning.orientation_rate_alpha,
            handling_rate_deg_s: tuning.handling_rate_deg_s,
        }
    }

    pub fn subscribe_motion(&self) -> watch::Receiver<MotionState> {
        self.motion_tx.subscribe()
    }

    pub fn subscribe_orientation(&self) -> watch::Receiver<DeviceOrientation> {
        self.orientation_tx.subscribe()
    }

    pub fn motion_state(&self) -> MotionState {
        *self.motion_tx.borrow()
    }

    pub fn orientation(&self) -> DeviceOrientation {
        *self.orientation_tx.borrow()
    }

    /// Device is being held or manipulated rather than mounted.
    pub fn is_handling(&self) -> bool {
        self.orientation() == DeviceOrientation::Handling
    }

    /// Classify STATIONARY when the device stays still for the whole window.
    pub fn update_motion_state(
        &mut self,
        accel: &ConditionedSample,
        gyro: Option<&ConditionedSample>,
    ) -> MotionState {
        let gyro_mag = gyro.map(|g| g.magnitude()).unwrap_or(0.0);
        if gyro.is_some() {
            self.recent_gyro.push_back(gyro_mag);
            while self.recent_gyro.len() > self.stability_window {
                self.recent_gyro.pop_front();
            }
        }

        let accel_dev = (accel.magnitude() - STANDARD_GRAVITY).abs();
        let still = accel_dev < self.accel_tolerance && gyro_mag < self.gyro_threshold;

        let current = self.motion_state();
        let next = if still {
            let since = *self.still_since.get_or_insert(accel.timestamp);
            if accel.timestamp.saturating_sub(since) >= self.stationary_window_ms {
                MotionState::Stationary
            } else {
                current
            }
        } else {
            self.still_since = None;
            MotionState::Moving
        };

        self.motion_tx.send_if_modified(|state| {
            if *state != next {
                log::debug!("Motion state {:?} -> {:?}", *state, next);
                *state = next;
                true
            } else {
                false
            }
        });
        next
    }

    /// Classify mounting from the gravity-vector tilt, or HANDLING when the
    /// orientation is changing faster than the handling threshold.
    pub fn update_orientation(
        &mut self,
        accel: &ConditionedSample,
        gyro: Option<&ConditionedSample>,
    ) -> DeviceOrientation {
        let Some(dir) = accel.vector().try_normalize(1e-3) else {
            return self.orientation();
        };

        let instant_rate = match gyro {
            Some(g) => g.magnitude().to_degrees(),
            None => self.gravity_change_rate(dir, accel.timestamp),
        };
        self.last_gravity = Some((dir, accel.timestamp));
        self.orientation_rate_deg_s =
            self.rate_alpha * instant_rate + (1.0 - self.rate_alpha) * self.orientation_rate_deg_s;

        let next = if self.orientation_rate_deg_s > self.handling_rate_deg_s {
            DeviceOrientation::Handling
        } else {
            let tilt_deg = dir.z.abs().clamp(0.0, 1.0).acos().to_degrees();
            if tilt_deg < HORIZONTAL_MAX_TILT_DEG {
                DeviceOrientation::VehicleHorizontal
            } else if tilt_deg < DASHBOARD_MAX_TILT_DEG {
                DeviceOrientation::VehicleDashboard
            } else {
                DeviceOrientation::PortraitOrLandscape
            }
        };

        self.orientation_tx.send_if_modified(|state| {
            if *state != next {
                log::debug!("Orientation {:?} -> {:?}", *state, next);
                *state = next;
                true
            } else {
                false
            }
        });
        next
    }

    fn gravity_change_rate(&self, dir: Vector3<f32>, timestamp: u64) -> f32 {
        match self.last_gravity {
            Some((prev, prev_ts)) if timestamp > prev_ts => {
                let angle = dir.dot(&prev).clamp(-1.0, 1.0).acos().to_degrees();
                angle / ((timestamp - prev_ts) as f32 / 1000.0)
            }
            _ => 0.0,
        }
    }

    /// 1.0 for a rigid mount, falling toward 0.0 as recent rotation grows.
    pub fn device_stability(&self) -> f32 {
        if self.recent_gyro.is_empty() {
            return UNKNOWN_STABILITY;
        }
        let mean = self.recent_gyro.iter().sum::<f32>() / self.recent_gyro.len() as f32;
        (1.0 - mean / self.gyro_ceiling).clamp(0.0, 1.0)
    }

    /// Forget accumulated windows; published state is kept.
    pub fn reset_windows(&mut self) {
        self.still_since = None;
        self.recent_gyro.clear();
        self.last_gravity = None;
        self.orientation_rate_deg_s = 0.0;
    }
}
