//! Collaborator seams: platform sensors, location and device resources.
//!
//! All calls are synchronous and cheap; the monitoring service makes them while
//! holding its control lock.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::error::SourceError;
use crate::types::{LocationFix, RawSample, SensorKind};

/// Motion sensors. Registered listeners receive samples until unregistered.
pub trait SensorSource: Send + Sync {
    /// Start (or restart at a new interval) delivering `kind` samples.
    fn register(
        &self,
        kind: SensorKind,
        interval_us: u64,
        listener: mpsc::Sender<RawSample>,
    ) -> Result<(), SourceError>;

    fn unregister(&self, kind: SensorKind);
}

/// Requested fix quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccuracyHint {
    High,
    Balanced,
}

pub trait LocationSource: Send + Sync {
    fn start(&self, interval: Duration, accuracy: AccuracyHint) -> Result<(), SourceError>;
    fn stop(&self);
    /// Latest fix, `None` until the first one arrives.
    fn subscribe(&self) -> watch::Receiver<Option<LocationFix>>;
    fn last_known(&self) -> Option<LocationFix>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryStatus {
    pub level_percent: u8,
    pub charging: bool,
}

pub trait ResourceMonitor: Send + Sync {
    fn battery(&self) -> BatteryStatus;
    fn is_thermal_throttling(&self) -> bool;
    fn is_low_memory(&self) -> bool;
}

/// Sensor period for a sampling rate.
pub fn interval_us(rate_hz: u32) -> u64 {
    1_000_000 / rate_hz.max(1) as u64
}
