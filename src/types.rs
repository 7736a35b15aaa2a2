use chrono::{DateTime, Utc};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Accuracy reported by a sensor when it is calibrated and trustworthy.
pub const MAX_SENSOR_ACCURACY: u8 = 3;

/// GPS accuracy (meters) at or below which a fix counts as good.
pub const GOOD_GPS_ACCURACY_M: f32 = 20.0;

/// Speed (km/h) at or above which the vehicle counts as moving fast.
pub const MOVING_FAST_KMH: f32 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorKind {
    Accel,
    Gyro,
}

/// Raw reading delivered by the sensor collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub kind: SensorKind,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// 0 (unreliable) ..= 3 (high)
    pub accuracy: u8,
    /// Monotonic milliseconds
    pub timestamp: u64,
}

impl RawSample {
    pub fn accel(x: f32, y: f32, z: f32, timestamp: u64) -> Self {
        Self { kind: SensorKind::Accel, x, y, z, accuracy: MAX_SENSOR_ACCURACY, timestamp }
    }

    pub fn gyro(x: f32, y: f32, z: f32, timestamp: u64) -> Self {
        Self { kind: SensorKind::Gyro, x, y, z, accuracy: MAX_SENSOR_ACCURACY, timestamp }
    }

    pub fn with_accuracy(mut self, accuracy: u8) -> Self {
        self.accuracy = accuracy.min(MAX_SENSOR_ACCURACY);
        self
    }

    pub fn vector(&self) -> Vector3<f32> {
        Vector3::new(self.x, self.y, self.z)
    }

    pub fn magnitude(&self) -> f32 {
        self.vector().norm()
    }
}

/// Calibration-corrected, noise-filtered sample. Same shape as [`RawSample`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConditionedSample {
    pub kind: SensorKind,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub accuracy: u8,
    pub timestamp: u64,
}

impl ConditionedSample {
    pub fn from_vector(kind: SensorKind, v: Vector3<f32>, accuracy: u8, timestamp: u64) -> Self {
        Self { kind, x: v.x, y: v.y, z: v.z, accuracy, timestamp }
    }

    pub fn vector(&self) -> Vector3<f32> {
        Vector3::new(self.x, self.y, self.z)
    }

    pub fn magnitude(&self) -> f32 {
        self.vector().norm()
    }
}

impl From<RawSample> for ConditionedSample {
    fn from(raw: RawSample) -> Self {
        Self {
            kind: raw.kind,
            x: raw.x,
            y: raw.y,
            z: raw.z,
            accuracy: raw.accuracy,
            timestamp: raw.timestamp,
        }
    }
}

/// GPS fix from the location collaborator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: f32,
    pub speed_mps: f32,
    pub bearing_deg: Option<f32>,
    pub timestamp: u64,
}

impl LocationFix {
    pub fn new(latitude: f64, longitude: f64, accuracy_m: f32, speed_mps: f32, timestamp: u64) -> Self {
        Self { latitude, longitude, accuracy_m, speed_mps, bearing_deg: None, timestamp }
    }

    pub fn with_bearing(mut self, bearing_deg: f32) -> Self {
        self.bearing_deg = Some(bearing_deg);
        self
    }

    pub fn speed_kmh(&self) -> f32 {
        self.speed_mps * 3.6
    }

    pub fn has_good_accuracy(&self) -> bool {
        self.has_accuracy_within(GOOD_GPS_ACCURACY_M)
    }

    pub fn is_moving_fast(&self) -> bool {
        self.is_moving_at_least(MOVING_FAST_KMH)
    }

    pub fn has_accuracy_within(&self, threshold_m: f32) -> bool {
        self.accuracy_m <= threshold_m
    }

    pub fn is_moving_at_least(&self, min_kmh: f32) -> bool {
        self.speed_kmh() >= min_kmh
    }
}

/// Signal quality attached to every candidate event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorQuality {
    pub accel_accuracy: u8,
    pub gyro_accuracy: u8,
    /// Lower is better
    pub gps_accuracy_m: f32,
    /// 0.0 (shaking) ..= 1.0 (rigidly mounted)
    pub device_stability: f32,
}

impl SensorQuality {
    /// Best accuracy of both, lowest GPS error, mean stability.
    pub fn combine(&self, other: &SensorQuality) -> SensorQuality {
        SensorQuality {
            accel_accuracy: self.accel_accuracy.max(other.accel_accuracy),
            gyro_accuracy: self.gyro_accuracy.max(other.gyro_accuracy),
            gps_accuracy_m: self.gps_accuracy_m.min(other.gps_accuracy_m),
            device_stability: (self.device_stability + other.device_stability) / 2.0,
        }
    }
}

impl Default for SensorQuality {
    fn default() -> Self {
        Self {
            accel_accuracy: 0,
            gyro_accuracy: 0,
            gps_accuracy_m: f32::MAX,
            device_stability: 0.0,
        }
    }
}

/// Unclassified detection, possibly still mergeable with its neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidateEvent {
    pub timestamp: u64,
    /// m/s²
    pub peak_acceleration: f32,
    pub duration_ms: u32,
    pub location: Option<LocationFix>,
    pub quality: SensorQuality,
}

impl CandidateEvent {
    /// Merge with a temporally adjacent candidate.
    ///
    /// Keeps the earliest timestamp, the max peak, the summed duration and the
    /// location of the earlier candidate (falling back to the later one).
    pub fn merge(&self, other: &CandidateEvent) -> CandidateEvent {
        let (first, second) = if self.timestamp <= other.timestamp {
            (self, other)
        } else {
            (other, self)
        };
        CandidateEvent {
            timestamp: first.timestamp,
            peak_acceleration: first.peak_acceleration.max(second.peak_acceleration),
            duration_ms: first.duration_ms.saturating_add(second.duration_ms),
            location: first.location.or(second.location),
            quality: first.quality.combine(&second.quality),
        }
    }
}

/// Persistable, fully scored anomaly record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedEvent {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub gps_accuracy_m: f32,
    pub speed_kmh: f32,
    pub heading_deg: Option<f32>,
    pub peak_accel_ms2: f32,
    pub impulse_duration_ms: u32,
    /// 1 (minor) ..= 5 (severe)
    pub severity: u8,
    pub confidence: f32,
    pub device_model: String,
    pub os_version: String,
    pub session_id: Uuid,
    pub synced: bool,
}

/// Bounded driving session. Owned by the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub start_time: DateTime<Utc>,
    pub last_activity_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionState {
    /// No sustained window observed yet
    Unknown,
    Stationary,
    Moving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceOrientation {
    Unknown,
    VehicleHorizontal,
    VehicleDashboard,
    PortraitOrLandscape,
    /// Device is being held or manipulated, not vehicle-mounted
    Handling,
}

/// Identity stamped on every classified event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_model: String,
    pub os_version: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            device_model: "unknown".to_string(),
            os_version: std::env::consts::OS.to_string(),
        }
    }
}
