use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use uuid::Uuid;

use crate::health::HealthReport;
use crate::monitor::MonitorPhase;
use crate::types::{DeviceOrientation, MotionState};

/// Point-in-time view of the monitoring service, written as JSON for dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorStatus {
    pub timestamp: DateTime<Utc>,
    pub phase: MonitorPhase,
    pub sampling_rate_hz: u32,
    pub motion_state: MotionState,
    pub orientation: DeviceOrientation,
    pub session_id: Option<Uuid>,
    pub sessions_started: u64,
    pub calibration_complete: bool,
    pub calibration_count: u64,
    pub device_stability: f32,
    // Counters
    pub accel_samples: u64,
    pub gyro_samples: u64,
    pub location_fixes: u64,
    pub candidates_detected: u64,
    pub events_stored: u64,
    pub events_rejected: u64,
    pub events_dropped: u64,
    // Resources
    pub battery_percent: Option<u8>,
    pub charging: bool,
    pub thermal_throttling: bool,
    // Health
    pub health: HealthReport,
    pub failures: BTreeMap<String, u64>,
    pub last_error: Option<String>,
}

impl MonitorStatus {
    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}
