use chrono::Utc;
use uuid::Uuid;

use crate::config::{MonitorConfig, PipelineTuning};
use crate::error::ClassifyError;
use crate::types::{CandidateEvent, ClassifiedEvent, DeviceInfo, SensorQuality, MAX_SENSOR_ACCURACY};

// Confidence weights
const GPS_WEIGHT: f32 = 0.4;
const SENSOR_WEIGHT: f32 = 0.3;
const STABILITY_WEIGHT: f32 = 0.3;

/// Peak acceleration (m/s²) to severity 1..=5.
pub fn calculate_severity(peak_accel_ms2: f32) -> u8 {
    if peak_accel_ms2 < 4.0 {
        1
    } else if peak_accel_ms2 < 6.0 {
        2
    } else if peak_accel_ms2 < 8.0 {
        3
    } else if peak_accel_ms2 < 12.0 {
        4
    } else {
        5
    }
}

/// Step score for horizontal GPS accuracy in meters.
pub fn gps_score(accuracy_m: f32) -> f32 {
    if accuracy_m <= 5.0 {
        1.0
    } else if accuracy_m <= 10.0 {
        0.8
    } else if accuracy_m <= 15.0 {
        0.7
    } else if accuracy_m <= 20.0 {
        0.6
    } else {
        0.3
    }
}

pub fn sensor_score(quality: &SensorQuality) -> f32 {
    let max = MAX_SENSOR_ACCURACY as f32;
    (quality.accel_accuracy as f32 / max + quality.gyro_accuracy as f32 / max) / 2.0
}

pub fn calculate_confidence(quality: &SensorQuality) -> f32 {
    let score = GPS_WEIGHT * gps_score(quality.gps_accuracy_m)
        + SENSOR_WEIGHT * sensor_score(quality)
        + STABILITY_WEIGHT * quality.device_stability;
    score.clamp(0.0, 1.0)
}

/// Scores candidates and stamps them with identity and device metadata.
pub struct EventClassifier {
    device: DeviceInfo,
    accel_threshold: f32,
    gps_accuracy_m: f32,
    min_speed_kmh: f32,
    min_duration_ms: u32,
    max_duration_ms: u32,
}

impl EventClassifier {
    pub fn new(config: &MonitorConfig, tuning: &PipelineTuning) -> Self {
        Self {
            device: config.device().clone(),
            accel_threshold: config.accel_threshold_ms2(),
            gps_accuracy_m: config.gps_accuracy_threshold_m(),
            min_speed_kmh: config.min_speed_kmh(),
            min_duration_ms: tuning.min_duration_ms,
            max_duration_ms: tuning.max_duration_ms,
        }
    }

    pub fn classify(&self, candidate: &CandidateEvent, session_id: Uuid) -> Result<ClassifiedEvent, ClassifyError> {
        let fix = candidate
            .location
            .ok_or(ClassifyError::MissingLocation(candidate.timestamp))?;

        let event = ClassifiedEvent {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            latitude: fix.latitude,
            longitude: fix.longitude,
            gps_accuracy_m: fix.accuracy_m,
            speed_kmh: fix.speed_kmh(),
            heading_deg: fix.bearing_deg,
            peak_accel_ms2: candidate.peak_acceleration,
            impulse_duration_ms: candidate.duration_ms,
            severity: calculate_severity(candidate.peak_acceleration),
            confidence: calculate_confidence(&candidate.quality),
            device_model: self.device.device_model.clone(),
            os_version: self.device.os_version.clone(),
            session_id,
            synced: false,
        };
        log::debug!(
            "Classified event {} severity {} confidence {:.2}",
            event.id, event.severity, event.confidence
        );
        Ok(event)
    }

    /// Final gate before persistence.
    pub fn validate_classified_event(&self, event: &ClassifiedEvent) -> Result<(), ClassifyError> {
        let problem = if !(1..=5).contains(&event.severity) {
            Some(format!("severity {} outside 1..=5", event.severity))
        } else if !(0.0..=1.0).contains(&event.confidence) {
            Some(format!("confidence {} outside 0..=1", event.confidence))
        } else if event.peak_accel_ms2 < self.accel_threshold {
            Some(format!("peak {:.2} m/s² below threshold", event.peak_accel_ms2))
        } else if event.gps_accuracy_m > self.gps_accuracy_m {
            Some(format!("gps accuracy {:.1} m too coarse", event.gps_accuracy_m))
        } else if event.speed_kmh < self.min_speed_kmh {
            Some(format!("speed {:.1} km/h too low", event.speed_kmh))
        } else if !(self.min_duration_ms..=self.max_duration_ms).contains(&event.impulse_duration_ms) {
            Some(format!("duration {} ms out of range", event.impulse_duration_ms))
        } else {
            None
        };
        match problem {
            Some(reason) => Err(ClassifyError::Invalid(reason)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LocationFix;
    use approx::assert_relative_eq;

    fn classifier() -> EventClassifier {
        EventClassifier::new(&MonitorConfig::default(), &PipelineTuning::default())
    }

    fn candidate(peak: f32, gps_accuracy: f32) -> CandidateEvent {
        CandidateEvent {
            timestamp: 1000,
            peak_acceleration: peak,
            duration_ms: 100,
            location: Some(LocationFix::new(48.137, 11.575, gps_accuracy, 40.0 / 3.6, 1000).with_bearing(90.0)),
            quality: SensorQuality {
                accel_accuracy: 3,
                gyro_accuracy: 3,
                gps_accuracy_m: gps_accuracy,
                device_stability: 0.9,
            },
        }
    }

    #[test]
    fn test_severity_boundaries() {
        assert_eq!(calculate_severity(2.5), 1);
        assert_eq!(calculate_severity(4.0), 2);
        assert_eq!(calculate_severity(6.0), 3);
        assert_eq!(calculate_severity(7.99), 3);
        assert_eq!(calculate_severity(8.0), 4);
        assert_eq!(calculate_severity(12.0), 5);
        assert_eq!(calculate_severity(40.0), 5);
    }

    #[test]
    fn test_severity_monotone() {
        let mut last = 0;
        for i in 0..200 {
            let s = calculate_severity(i as f32 * 0.1);
            assert!(s >= last);
            assert!((1..=5).contains(&s));
            last = s;
        }
    }

    #[test]
    fn test_gps_score_steps() {
        assert_eq!(gps_score(3.0), 1.0);
        assert_eq!(gps_score(8.0), 0.8);
        assert_eq!(gps_score(15.0), 0.7);
        assert_eq!(gps_score(20.0), 0.6);
        assert_eq!(gps_score(35.0), 0.3);
    }

    #[test]
    fn test_classify_typical_bump() {
        let c = classifier();
        let session = Uuid::new_v4();
        let event = c.classify(&candidate(9.0, 8.0), session).unwrap();

        assert_eq!(event.severity, 4);
        assert_eq!(event.session_id, session);
        assert!(!event.synced);
        assert_relative_eq!(event.speed_kmh, 40.0, epsilon = 1e-3);
        assert_eq!(event.heading_deg, Some(90.0));
        // 0.4 * 0.8 + 0.3 * 1.0 + 0.3 * 0.9
        assert_relative_eq!(event.confidence, 0.89, epsilon = 1e-5);
        assert!(c.validate_classified_event(&event).is_ok());
    }

    #[test]
    fn test_classify_requires_location() {
        let mut cand = candidate(9.0, 8.0);
        cand.location = None;
        assert_eq!(classifier().classify(&cand, Uuid::new_v4()), Err(ClassifyError::MissingLocation(1000)));
    }

    #[test]
    fn test_confidence_clamped() {
        let worst = SensorQuality { accel_accuracy: 0, gyro_accuracy: 0, gps_accuracy_m: 500.0, device_stability: 0.0 };
        let best = SensorQuality { accel_accuracy: 3, gyro_accuracy: 3, gps_accuracy_m: 1.0, device_stability: 1.0 };
        assert_relative_eq!(calculate_confidence(&worst), 0.12, epsilon = 1e-6);
        assert_relative_eq!(calculate_confidence(&best), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_validation_rejects_coarse_fix() {
        let c = classifier();
        let mut event = c.classify(&candidate(9.0, 8.0), Uuid::new_v4()).unwrap();
        event.gps_accuracy_m = 35.0;
        assert!(matches!(c.validate_classified_event(&event), Err(ClassifyError::Invalid(_))));

        let mut event = c.classify(&candidate(9.0, 8.0), Uuid::new_v4()).unwrap();
        event.impulse_duration_ms = 900;
        assert!(c.validate_classified_event(&event).is_err());
    }
}
