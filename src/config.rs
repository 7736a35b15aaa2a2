use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::types::DeviceInfo;

// ─── User-facing configuration ───────────────────────────────────────────────

/// Validated monitoring configuration.
///
/// Every setter checks its range (and cross-field constraints such as
/// `pause < resume`) and leaves the config untouched on rejection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    accel_threshold_ms2: f32,
    normal_rate_hz: u32,
    reduced_rate_hz: u32,
    battery_pause_percent: u8,
    battery_resume_percent: u8,
    stationary_timeout_min: u32,
    session_timeout_min: u32,
    gps_accuracy_threshold_m: f32,
    min_speed_kmh: f32,
    max_stored_events: usize,
    retention_days: u32,
    device: DeviceInfo,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            accel_threshold_ms2: 2.5,
            normal_rate_hz: 50,
            reduced_rate_hz: 10,
            battery_pause_percent: 15,
            battery_resume_percent: 25,
            stationary_timeout_min: 10,
            session_timeout_min: 5,
            gps_accuracy_threshold_m: 20.0,
            min_speed_kmh: 5.0,
            max_stored_events: 10_000,
            retention_days: 30,
            device: DeviceInfo::default(),
        }
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value.is_nan() || value < min || value > max {
        return Err(ConfigError::OutOfRange { field, value, min, max });
    }
    Ok(())
}

impl MonitorConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Load(format!("{}: {e}", path.as_ref().display())))?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: MonitorConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field and the cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("accel_threshold_ms2", self.accel_threshold_ms2 as f64, 1.0, 10.0)?;
        check_range("normal_rate_hz", self.normal_rate_hz as f64, 10.0, 100.0)?;
        check_range("reduced_rate_hz", self.reduced_rate_hz as f64, 1.0, 50.0)?;
        check_range("battery_pause_percent", self.battery_pause_percent as f64, 5.0, 30.0)?;
        check_range("battery_resume_percent", self.battery_resume_percent as f64, 10.0, 50.0)?;
        check_range("stationary_timeout_min", self.stationary_timeout_min as f64, 1.0, 60.0)?;
        check_range("session_timeout_min", self.session_timeout_min as f64, 1.0, 30.0)?;
        check_range("gps_accuracy_threshold_m", self.gps_accuracy_threshold_m as f64, 5.0, 100.0)?;
        check_range("min_speed_kmh", self.min_speed_kmh as f64, 0.0, 20.0)?;
        check_range("max_stored_events", self.max_stored_events as f64, 1_000.0, 50_000.0)?;
        check_range("retention_days", self.retention_days as f64, 1.0, 365.0)?;
        Self::check_battery_pair(self.battery_pause_percent, self.battery_resume_percent)?;
        Self::check_rate_pair(self.normal_rate_hz, self.reduced_rate_hz)?;
        Ok(())
    }

    fn check_battery_pair(pause: u8, resume: u8) -> Result<(), ConfigError> {
        if pause >= resume {
            return Err(ConfigError::Inconsistent(format!(
                "battery pause threshold {pause}% must be below resume threshold {resume}%"
            )));
        }
        Ok(())
    }

    fn check_rate_pair(normal: u32, reduced: u32) -> Result<(), ConfigError> {
        if reduced > normal {
            return Err(ConfigError::Inconsistent(format!(
                "reduced rate {reduced} Hz exceeds normal rate {normal} Hz"
            )));
        }
        Ok(())
    }

    // ── Getters ──────────────────────────────────────────────────────────

    pub fn accel_threshold_ms2(&self) -> f32 { self.accel_threshold_ms2 }
    pub fn normal_rate_hz(&self) -> u32 { self.normal_rate_hz }
    pub fn reduced_rate_hz(&self) -> u32 { self.reduced_rate_hz }
    pub fn battery_pause_percent(&self) -> u8 { self.battery_pause_percent }
    pub fn battery_resume_percent(&self) -> u8 { self.battery_resume_percent }
    pub fn gps_accuracy_threshold_m(&self) -> f32 { self.gps_accuracy_threshold_m }
    pub fn min_speed_kmh(&self) -> f32 { self.min_speed_kmh }
    pub fn max_stored_events(&self) -> usize { self.max_stored_events }
    pub fn retention_days(&self) -> u32 { self.retention_days }
    pub fn device(&self) -> &DeviceInfo { &self.device }

    /// Parked time after which the session ends. Only takes effect when
    /// shorter than the session inactivity timeout, which otherwise ends a
    /// parked session first (the case with the defaults, 10 vs 5 min).
    pub fn stationary_timeout(&self) -> Duration {
        Duration::from_secs(self.stationary_timeout_min as u64 * 60)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_min as u64 * 60)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days as i64)
    }

    // ── Validated setters ────────────────────────────────────────────────

    pub fn set_accel_threshold_ms2(&mut self, value: f32) -> Result<(), ConfigError> {
        check_range("accel_threshold_ms2", value as f64, 1.0, 10.0)?;
        self.accel_threshold_ms2 = value;
        Ok(())
    }

    pub fn set_normal_rate_hz(&mut self, value: u32) -> Result<(), ConfigError> {
        check_range("normal_rate_hz", value as f64, 10.0, 100.0)?;
        Self::check_rate_pair(value, self.reduced_rate_hz)?;
        self.normal_rate_hz = value;
        Ok(())
    }

    pub fn set_reduced_rate_hz(&mut self, value: u32) -> Result<(), ConfigError> {
        check_range("reduced_rate_hz", value as f64, 1.0, 50.0)?;
        Self::check_rate_pair(self.normal_rate_hz, value)?;
        self.reduced_rate_hz = value;
        Ok(())
    }

    pub fn set_battery_pause_percent(&mut self, value: u8) -> Result<(), ConfigError> {
        check_range("battery_pause_percent", value as f64, 5.0, 30.0)?;
        Self::check_battery_pair(value, self.battery_resume_percent)?;
        self.battery_pause_percent = value;
        Ok(())
    }

    pub fn set_battery_resume_percent(&mut self, value: u8) -> Result<(), ConfigError> {
        check_range("battery_resume_percent", value as f64, 10.0, 50.0)?;
        Self::check_battery_pair(self.battery_pause_percent, value)?;
        self.battery_resume_percent = value;
        Ok(())
    }

    /// Set both battery thresholds at once, for moves that would cross the old pair.
    pub fn set_battery_thresholds(&mut self, pause: u8, resume: u8) -> Result<(), ConfigError> {
        check_range("battery_pause_percent", pause as f64, 5.0, 30.0)?;
        check_range("battery_resume_percent", resume as f64, 10.0, 50.0)?;
        Self::check_battery_pair(pause, resume)?;
        self.battery_pause_percent = pause;
        self.battery_resume_percent = resume;
        Ok(())
    }

    pub fn set_stationary_timeout_min(&mut self, value: u32) -> Result<(), ConfigError> {
        check_range("stationary_timeout_min", value as f64, 1.0, 60.0)?;
        self.stationary_timeout_min = value;
        Ok(())
    }

    pub fn set_session_timeout_min(&mut self, value: u32) -> Result<(), ConfigError> {
        check_range("session_timeout_min", value as f64, 1.0, 30.0)?;
        self.session_timeout_min = value;
        Ok(())
    }

    pub fn set_gps_accuracy_threshold_m(&mut self, value: f32) -> Result<(), ConfigError> {
        check_range("gps_accuracy_threshold_m", value as f64, 5.0, 100.0)?;
        self.gps_accuracy_threshold_m = value;
        Ok(())
    }

    pub fn set_min_speed_kmh(&mut self, value: f32) -> Result<(), ConfigError> {
        check_range("min_speed_kmh", value as f64, 0.0, 20.0)?;
        self.min_speed_kmh = value;
        Ok(())
    }

    pub fn set_max_stored_events(&mut self, value: usize) -> Result<(), ConfigError> {
        check_range("max_stored_events", value as f64, 1_000.0, 50_000.0)?;
        self.max_stored_events = value;
        Ok(())
    }

    pub fn set_retention_days(&mut self, value: u32) -> Result<(), ConfigError> {
        check_range("retention_days", value as f64, 1.0, 365.0)?;
        self.retention_days = value;
        Ok(())
    }

    pub fn set_device(&mut self, device: DeviceInfo) {
        self.device = device;
    }
}

// ─── Pipeline tuning ─────────────────────────────────────────────────────────

/// Internal tuning constants for the fusion pipeline and control loop.
///
/// None of these are load-bearing for correctness; they are exposed so tests
/// and replays can shorten windows and delays.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineTuning {
    // ── Signal conditioning ──
    pub filter_cutoff_hz: f32,
    pub calibration_samples: usize,
    pub calibration_max_spread: f32,
    pub calibration_drift_threshold: f32,

    // ── Motion inference ──
    pub stationary_accel_tolerance: f32,
    pub stationary_gyro_threshold: f32,
    pub stationary_window_ms: u64,
    pub stability_window: usize,
    pub stability_gyro_ceiling: f32,
    pub handling_rate_deg_s: f32,
    pub orientation_rate_alpha: f32,

    // ── Event detection ──
    pub merge_window_ms: u64,
    pub min_duration_ms: u32,
    pub max_duration_ms: u32,

    // ── Control loop ──
    pub rate_transition_delay: Duration,
    pub resource_poll_interval: Duration,
    pub battery_critical_percent: u8,
    pub sample_channel_capacity: usize,
    pub accel_silence: Duration,
    pub gps_silence: Duration,
    /// Fixes older than this are not used for detection.
    pub max_fix_age: Duration,
}

impl Default for PipelineTuning {
    fn default() -> Self {
        Self {
            filter_cutoff_hz: 15.0,
            calibration_samples: 100,
            calibration_max_spread: 0.3,
            calibration_drift_threshold: 0.5,
            stationary_accel_tolerance: 0.6,
            stationary_gyro_threshold: 0.15,
            stationary_window_ms: 1_000,
            stability_window: 25,
            stability_gyro_ceiling: 2.0,
            handling_rate_deg_s: 60.0,
            orientation_rate_alpha: 0.2,
            merge_window_ms: 500,
            min_duration_ms: 50,
            max_duration_ms: 500,
            rate_transition_delay: Duration::from_secs(2),
            resource_poll_interval: Duration::from_secs(30),
            battery_critical_percent: 3,
            sample_channel_capacity: 500,
            accel_silence: Duration::from_secs(5),
            gps_silence: Duration::from_secs(30),
            max_fix_age: Duration::from_secs(3),
        }
    }
}
