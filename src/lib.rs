//! Road anomaly detection from phone motion sensors and GPS.
//!
//! Raw accelerometer/gyroscope samples are low-pass filtered, calibrated
//! against the gravity vector captured while parked, gated on vehicle speed
//! and GPS quality, merged into candidate events and scored into persisted
//! anomaly records. [`monitor::MonitoringService`] drives the whole chain and
//! adapts the sampling rate to motion, battery and thermal state.

pub mod classifier;
pub mod conditioning;
pub mod config;
pub mod detector;
pub mod error;
pub mod health;
pub mod monitor;
pub mod motion;
pub mod pipeline;
pub mod recovery;
pub mod session;
pub mod sim;
pub mod sources;
pub mod status;
pub mod storage;
pub mod types;

pub use config::{MonitorConfig, PipelineTuning};
pub use error::{FailureKind, MonitorError, MonitorResult};
pub use monitor::{MonitorDeps, MonitorPhase, MonitoringService};
pub use storage::{EventQuery, EventRepository, EventStore, MemoryEventStore};
pub use types::{CandidateEvent, ClassifiedEvent, LocationFix, RawSample, SensorKind};
