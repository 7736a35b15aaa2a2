use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    SensorUnavailable,
    SensorPermissionDenied,
    SensorCalibrationFailure,
    StorageFull,
    DatabaseCorruption,
    StoragePermissionDenied,
    LowMemory,
    CpuThrottling,
    BatteryCritical,
    LocationPermissionDenied,
    LocationUnavailable,
    GpsAccuracyTooLow,
}

/// Rejected configuration value. State is left untouched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} = {value} is outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("{0}")]
    Inconsistent(String),

    #[error("Failed to load config: {0}")]
    Load(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Event store is full ({count} events, cap {cap})")]
    Full { count: usize, cap: usize },

    #[error("Event store is corrupted: {0}")]
    Corrupted(String),

    #[error("Permission denied for event store: {0}")]
    PermissionDenied(String),

    #[error("Event store busy: {0}")]
    Busy(String),

    #[error("Event {0} already exists")]
    Duplicate(uuid::Uuid),
}

impl StorageError {
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            StorageError::Full { .. } => Some(FailureKind::StorageFull),
            StorageError::Corrupted(_) => Some(FailureKind::DatabaseCorruption),
            StorageError::PermissionDenied(_) => Some(FailureKind::StoragePermissionDenied),
            StorageError::Busy(_) | StorageError::Duplicate(_) => None,
        }
    }

    /// Worth another attempt after a backoff delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Busy(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Sensor unavailable: {0}")]
    SensorUnavailable(String),

    #[error("Sensor permission denied: {0}")]
    SensorPermissionDenied(String),

    #[error("Location unavailable: {0}")]
    LocationUnavailable(String),

    #[error("Location permission denied")]
    LocationPermissionDenied,
}

impl SourceError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SourceError::SensorUnavailable(_) => FailureKind::SensorUnavailable,
            SourceError::SensorPermissionDenied(_) => FailureKind::SensorPermissionDenied,
            SourceError::LocationUnavailable(_) => FailureKind::LocationUnavailable,
            SourceError::LocationPermissionDenied => FailureKind::LocationPermissionDenied,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassifyError {
    #[error("Candidate at {0} ms has no location")]
    MissingLocation(u64),

    #[error("Classified event rejected: {0}")]
    Invalid(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("Device not still enough to calibrate (spread {spread:.3} m/s² > {tolerance:.3})")]
    TooNoisy { spread: f32, tolerance: f32 },
}

/// Errors surfaced by the monitoring service to its caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MonitorError {
    #[error("Monitoring already running")]
    AlreadyRunning,

    #[error("Monitoring not running")]
    NotRunning,

    #[error("Unrecoverable failure {kind:?}: {message}")]
    Unrecoverable { kind: FailureKind, message: String },

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type MonitorResult<T> = Result<T, MonitorError>;
