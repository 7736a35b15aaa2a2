use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::config::PipelineTuning;
use crate::error::FailureKind;

/// Liveness of one input source.
#[derive(Debug)]
pub struct SourceHealth {
    pub name: &'static str,
    last_update: Mutex<Instant>,
    silence_threshold: Duration,
    failure: FailureKind,
}

impl SourceHealth {
    pub fn new(name: &'static str, silence_threshold: Duration, failure: FailureKind) -> Self {
        Self {
            name,
            last_update: Mutex::new(Instant::now()),
            silence_threshold,
            failure,
        }
    }

    pub fn update(&self) {
        if let Ok(mut time) = self.last_update.lock() {
            *time = Instant::now();
        }
    }

    pub fn time_since_last_update(&self) -> Option<Duration> {
        self.last_update.lock().ok().map(|t| t.elapsed())
    }

    pub fn is_silent(&self) -> bool {
        self.time_since_last_update()
            .map(|d| d > self.silence_threshold)
            .unwrap_or(false)
    }

    /// Failure reported when this source goes silent.
    pub fn failure_kind(&self) -> FailureKind {
        self.failure
    }
}

/// Snapshot for status output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    pub accel_healthy: bool,
    pub gyro_healthy: bool,
    pub gps_healthy: bool,
    pub accel_silence_secs: f64,
    pub gyro_silence_secs: f64,
    pub gps_silence_secs: f64,
}

#[derive(Debug)]
pub struct HealthMonitor {
    pub accel: SourceHealth,
    pub gyro: SourceHealth,
    pub gps: SourceHealth,
}

impl HealthMonitor {
    pub fn new(tuning: &PipelineTuning) -> Self {
        Self {
            accel: SourceHealth::new("Accel", tuning.accel_silence, FailureKind::SensorUnavailable),
            gyro: SourceHealth::new("Gyro", tuning.accel_silence, FailureKind::SensorUnavailable),
            gps: SourceHealth::new("GPS", tuning.gps_silence, FailureKind::LocationUnavailable),
        }
    }

    /// Restart all silence clocks (sources were just (re)registered).
    pub fn reset(&self) {
        self.accel.update();
        self.gyro.update();
        self.gps.update();
    }

    pub fn silent_sources(&self) -> Vec<&SourceHealth> {
        [&self.accel, &self.gyro, &self.gps]
            .into_iter()
            .filter(|s| s.is_silent())
            .collect()
    }

    pub fn check_health(&self) -> HealthReport {
        let secs = |s: &SourceHealth| s.time_since_last_update().unwrap_or_default().as_secs_f64();
        HealthReport {
            accel_healthy: !self.accel.is_silent(),
            gyro_healthy: !self.gyro.is_silent(),
            gps_healthy: !self.gps.is_silent(),
            accel_silence_secs: secs(&self.accel),
            gyro_silence_secs: secs(&self.gyro),
            gps_silence_secs: secs(&self.gps),
        }
    }

    pub fn format_status(&self) -> String {
        let mark = |s: &SourceHealth| {
            if s.is_silent() {
                format!("silent {:.1}s", s.time_since_last_update().unwrap_or_default().as_secs_f64())
            } else {
                "ok".to_string()
            }
        };
        format!("Health: Accel {} | Gyro {} | GPS {}", mark(&self.accel), mark(&self.gyro), mark(&self.gps))
    }
}
