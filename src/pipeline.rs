use tokio::sync::watch;

use crate::conditioning::{CalibrationUpdate, SignalConditioner};
use crate::config::{MonitorConfig, PipelineTuning};
use crate::detector::{DetectionContext, EventDetector};
use crate::error::CalibrationError;
use crate::motion::MotionInferencer;
use crate::types::{
    CandidateEvent, ConditionedSample, DeviceOrientation, LocationFix, MotionState, RawSample, SensorKind,
    SensorQuality,
};

/// Gyro readings older than this are not paired with an accel sample.
const GYRO_PAIRING_WINDOW_MS: u64 = 200;

/// Result of feeding one raw sample.
#[derive(Debug, Default)]
pub struct StepOutcome {
    pub candidate: Option<CandidateEvent>,
    pub calibration: Option<CalibrationUpdate>,
    pub calibration_error: Option<CalibrationError>,
}

/// Conditioning, motion inference and detection for one sample stream.
///
/// Gyro samples only update the latest rotation reading; every accel sample
/// runs the full chain with the freshest gyro reading alongside it.
pub struct FusionPipeline {
    conditioner: SignalConditioner,
    motion: MotionInferencer,
    detector: EventDetector,
    latest_gyro: Option<ConditionedSample>,
}

impl FusionPipeline {
    pub fn new(config: &MonitorConfig, tuning: &PipelineTuning, sample_rate_hz: u32) -> Self {
        Self {
            conditioner: SignalConditioner::new(tuning, sample_rate_hz),
            motion: MotionInferencer::new(tuning),
            detector: EventDetector::new(config, tuning),
            latest_gyro: None,
        }
    }

    pub fn subscribe_motion(&self) -> watch::Receiver<MotionState> {
        self.motion.subscribe_motion()
    }

    pub fn motion_state(&self) -> MotionState {
        self.motion.motion_state()
    }

    pub fn orientation(&self) -> DeviceOrientation {
        self.motion.orientation()
    }

    pub fn is_calibrated(&self) -> bool {
        self.conditioner.is_calibrated()
    }

    pub fn calibration_count(&self) -> u64 {
        self.conditioner.calibration_count()
    }

    pub fn device_stability(&self) -> f32 {
        self.motion.device_stability()
    }

    pub fn set_sample_rate(&mut self, sample_rate_hz: u32) {
        self.conditioner.set_sample_rate(sample_rate_hz);
    }

    pub fn process(&mut self, raw: &RawSample, location: Option<LocationFix>) -> StepOutcome {
        let filtered = self.conditioner.filter(raw);
        if raw.kind == SensorKind::Gyro {
            self.latest_gyro = Some(filtered);
            return StepOutcome::default();
        }

        let gyro = self
            .latest_gyro
            .filter(|g| filtered.timestamp.abs_diff(g.timestamp) <= GYRO_PAIRING_WINDOW_MS);
        let state = self.motion.update_motion_state(&filtered, gyro.as_ref());
        self.motion.update_orientation(&filtered, gyro.as_ref());

        let mut outcome = StepOutcome::default();
        if state == MotionState::Stationary {
            match self.conditioner.collect_stationary(&filtered, gyro.as_ref()) {
                Ok(Some(update)) => {
                    self.detector.set_vertical_axis(self.conditioner.gravity_direction());
                    outcome.calibration = Some(update);
                }
                Ok(None) => {}
                Err(e) => outcome.calibration_error = Some(e),
            }
        } else {
            self.conditioner.interrupt_collection();
        }

        let linear = self.conditioner.calibrate(&filtered);
        let ctx = DetectionContext {
            location,
            handling: self.motion.is_handling(),
            quality: SensorQuality {
                accel_accuracy: raw.accuracy,
                gyro_accuracy: gyro.map(|g| g.accuracy).unwrap_or(0),
                gps_accuracy_m: location.map(|f| f.accuracy_m).unwrap_or(f32::MAX),
                device_stability: self.motion.device_stability(),
            },
        };
        outcome.candidate = self.detector.detect_event(&linear, &ctx);
        outcome
    }

    /// Start a fresh calibration batch.
    pub fn retry_calibration(&mut self) {
        self.conditioner.interrupt_collection();
    }

    /// Drop buffered windows and pending candidates.
    pub fn shed_buffers(&mut self) {
        self.motion.reset_windows();
        self.detector.clear_state();
        self.conditioner.interrupt_collection();
    }

    /// Emit the open candidate group now (session boundary).
    pub fn flush_candidates(&mut self) -> Option<CandidateEvent> {
        self.detector.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> FusionPipeline {
        let tuning = PipelineTuning { calibration_samples: 10, ..PipelineTuning::default() };
        FusionPipeline::new(&MonitorConfig::default(), &tuning, 50)
    }

    fn driving_fix() -> LocationFix {
        LocationFix::new(48.137, 11.575, 8.0, 40.0 / 3.6, 0)
    }

    /// Feed level, still samples at 50 Hz over `[from, to)` ms.
    fn feed_still(p: &mut FusionPipeline, from: u64, to: u64, location: Option<LocationFix>) {
        for ts in (from..to).step_by(20) {
            p.process(&RawSample::gyro(0.0, 0.0, 0.0, ts), location);
            let out = p.process(&RawSample::accel(0.0, 0.0, 9.81, ts), location);
            assert!(out.candidate.is_none());
        }
    }

    #[test]
    fn test_calibrates_while_stationary() {
        let mut p = pipeline();
        feed_still(&mut p, 0, 1500, None);
        assert_eq!(p.motion_state(), MotionState::Stationary);
        assert!(p.is_calibrated());
        assert_eq!(p.orientation(), DeviceOrientation::VehicleHorizontal);
    }

    #[test]
    fn test_bump_produces_one_candidate() {
        let mut p = pipeline();
        let fix = Some(driving_fix());
        feed_still(&mut p, 0, 1500, fix);

        let mut candidates = Vec::new();
        for ts in (1500..2500).step_by(20) {
            let z = if ts == 1500 { 9.81 + 12.0 } else { 9.81 };
            p.process(&RawSample::gyro(0.0, 0.0, 0.0, ts), fix);
            candidates.extend(p.process(&RawSample::accel(0.0, 0.0, z, ts), fix).candidate);
        }
        assert_eq!(candidates.len(), 1);
        let candidate = candidates[0];
        assert_eq!(candidate.timestamp, 1500);
        assert!(candidate.peak_acceleration > 7.0 && candidate.peak_acceleration < 8.5);
        assert_eq!(candidate.quality.accel_accuracy, 3);
        assert!(p.flush_candidates().is_none());
    }

    #[test]
    fn test_no_candidate_without_location() {
        let mut p = pipeline();
        feed_still(&mut p, 0, 1500, None);
        let out = p.process(&RawSample::accel(0.0, 0.0, 25.0, 1500), None);
        assert!(out.candidate.is_none());
    }

    #[test]
    fn test_stale_gyro_not_paired() {
        let mut p = pipeline();
        let fix = Some(driving_fix());
        p.process(&RawSample::gyro(0.0, 0.0, 0.0, 0), fix);
        feed_still(&mut p, 0, 20, fix);

        // Gyro went quiet; stability falls back to neutral once windows reset
        p.shed_buffers();
        p.process(&RawSample::accel(0.0, 0.0, 9.81, 5000), fix);
        assert_eq!(p.device_stability(), 0.5);
    }
}
