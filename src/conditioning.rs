// Signal conditioning: per-axis low-pass filtering and stationary calibration.
//
// The accelerometer offset captured while stationary is the gravity vector in
// device frame, so a calibrated accelerometer sample is linear acceleration.

use nalgebra::Vector3;

use crate::config::PipelineTuning;
use crate::error::CalibrationError;
use crate::types::{ConditionedSample, RawSample, SensorKind};

pub const STANDARD_GRAVITY: f32 = 9.81;

// ─── Low-pass filter ─────────────────────────────────────────────────────────

struct LowPassFilter {
    cutoff_hz: f32,
    alpha: f32,
    last_output: Vector3<f32>,
    initialized: bool,
}

impl LowPassFilter {
    fn new(cutoff_hz: f32, sample_rate_hz: f32) -> Self {
        Self {
            cutoff_hz,
            alpha: Self::alpha_for(cutoff_hz, sample_rate_hz),
            last_output: Vector3::zeros(),
            initialized: false,
        }
    }

    fn alpha_for(cutoff_hz: f32, sample_rate_hz: f32) -> f32 {
        let dt = 1.0 / sample_rate_hz.max(1.0);
        let rc = 1.0 / (2.0 * std::f32::consts::PI * cutoff_hz);
        dt / (rc + dt)
    }

    fn set_sample_rate(&mut self, sample_rate_hz: f32) {
        self.alpha = Self::alpha_for(self.cutoff_hz, sample_rate_hz);
    }

    fn update(&mut self, input: Vector3<f32>) -> Vector3<f32> {
        if !self.initialized {
            self.last_output = input;
            self.initialized = true;
            return input;
        }
        self.last_output = self.last_output * (1.0 - self.alpha) + input * self.alpha;
        self.last_output
    }
}

// ─── Calibration ─────────────────────────────────────────────────────────────

/// Outcome of a completed stationary batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationUpdate {
    Initial { accel_offset: Vector3<f32>, gyro_offset: Vector3<f32> },
    Recalibrated { drift: f32 },
}

fn mean_vector(samples: &[Vector3<f32>]) -> Option<Vector3<f32>> {
    if samples.is_empty() {
        return None;
    }
    let sum = samples.iter().fold(Vector3::zeros(), |acc, v| acc + v);
    Some(sum / samples.len() as f32)
}

fn magnitude_spread(samples: &[Vector3<f32>]) -> f32 {
    let n = samples.len().max(1) as f32;
    let mean = samples.iter().map(|v| v.norm()).sum::<f32>() / n;
    let var = samples.iter().map(|v| (v.norm() - mean).powi(2)).sum::<f32>() / n;
    var.sqrt()
}

pub struct SignalConditioner {
    accel_lpf: LowPassFilter,
    gyro_lpf: LowPassFilter,

    accel_offset: Vector3<f32>,
    gyro_offset: Vector3<f32>,
    calibrated: bool,
    calibration_count: u64,

    stationary_accel: Vec<Vector3<f32>>,
    stationary_gyro: Vec<Vector3<f32>>,
    batch_size: usize,
    max_spread: f32,
    drift_threshold: f32,
}

impl SignalConditioner {
    pub fn new(tuning: &PipelineTuning, sample_rate_hz: u32) -> Self {
        Self {
            accel_lpf: LowPassFilter::new(tuning.filter_cutoff_hz, sample_rate_hz as f32),
            gyro_lpf: LowPassFilter::new(tuning.filter_cutoff_hz, sample_rate_hz as f32),
            accel_offset: Vector3::new(0.0, 0.0, STANDARD_GRAVITY),
            gyro_offset: Vector3::zeros(),
            calibrated: false,
            calibration_count: 0,
            stationary_accel: Vec::with_capacity(tuning.calibration_samples),
            stationary_gyro: Vec::with_capacity(tuning.calibration_samples),
            batch_size: tuning.calibration_samples.max(1),
            max_spread: tuning.calibration_max_spread,
            drift_threshold: tuning.calibration_drift_threshold,
        }
    }

    /// Follow a sampling-rate change so the filter cutoff stays put.
    pub fn set_sample_rate(&mut self, sample_rate_hz: u32) {
        self.accel_lpf.set_sample_rate(sample_rate_hz as f32);
        self.gyro_lpf.set_sample_rate(sample_rate_hz as f32);
    }

    /// Noise-reduce a raw sample. Offsets are not applied.
    pub fn filter(&mut self, sample: &RawSample) -> ConditionedSample {
        let lpf = match sample.kind {
            SensorKind::Accel => &mut self.accel_lpf,
            SensorKind::Gyro => &mut self.gyro_lpf,
        };
        let smoothed = lpf.update(sample.vector());
        ConditionedSample::from_vector(sample.kind, smoothed, sample.accuracy, sample.timestamp)
    }

    /// Remove the current per-axis offset for the sample's kind.
    pub fn calibrate(&self, sample: &ConditionedSample) -> ConditionedSample {
        let offset = match sample.kind {
            SensorKind::Accel => self.accel_offset,
            SensorKind::Gyro => self.gyro_offset,
        };
        ConditionedSample::from_vector(
            sample.kind,
            sample.vector() - offset,
            sample.accuracy,
            sample.timestamp,
        )
    }

    /// Feed a filtered sample pair taken while the device is stationary.
    ///
    /// Returns `Ok(Some(..))` when a full batch changed the offsets, `Ok(None)`
    /// while collecting or when the batch agrees with the current offsets.
    pub fn collect_stationary(
        &mut self,
        accel: &ConditionedSample,
        gyro: Option<&ConditionedSample>,
    ) -> Result<Option<CalibrationUpdate>, CalibrationError> {
        self.stationary_accel.push(accel.vector());
        if let Some(gyro) = gyro {
            self.stationary_gyro.push(gyro.vector());
        }
        if self.stationary_accel.len() < self.batch_size {
            return Ok(None);
        }

        let spread = magnitude_spread(&self.stationary_accel);
        let accel_mean = mean_vector(&self.stationary_accel);
        let gyro_mean = mean_vector(&self.stationary_gyro);
        self.interrupt_collection();

        if spread > self.max_spread {
            return Err(CalibrationError::TooNoisy { spread, tolerance: self.max_spread });
        }
        let Some(accel_mean) = accel_mean else {
            return Ok(None);
        };

        if !self.calibrated {
            self.accel_offset = accel_mean;
            if let Some(gyro_mean) = gyro_mean {
                self.gyro_offset = gyro_mean;
            }
            self.calibrated = true;
            self.calibration_count += 1;
            log::info!(
                "Calibration complete: gravity ({:.3}, {:.3}, {:.3}) |g|={:.3}",
                accel_mean.x, accel_mean.y, accel_mean.z, accel_mean.norm()
            );
            return Ok(Some(CalibrationUpdate::Initial {
                accel_offset: self.accel_offset,
                gyro_offset: self.gyro_offset,
            }));
        }

        let drift = (accel_mean - self.accel_offset).norm();
        if drift > self.drift_threshold {
            self.accel_offset = accel_mean;
            if let Some(gyro_mean) = gyro_mean {
                self.gyro_offset = gyro_mean;
            }
            self.calibration_count += 1;
            log::info!("Offsets drifted {:.3} m/s², recalibrated", drift);
            return Ok(Some(CalibrationUpdate::Recalibrated { drift }));
        }
        Ok(None)
    }

    /// Drop a partially collected batch (motion resumed or calibration retry).
    pub fn interrupt_collection(&mut self) {
        self.stationary_accel.clear();
        self.stationary_gyro.clear();
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    pub fn calibration_count(&self) -> u64 {
        self.calibration_count
    }

    pub fn accel_offset(&self) -> Vector3<f32> {
        self.accel_offset
    }

    pub fn gyro_offset(&self) -> Vector3<f32> {
        self.gyro_offset
    }

    /// Unit vector pointing along gravity in device frame.
    pub fn gravity_direction(&self) -> Vector3<f32> {
        self.accel_offset
            .try_normalize(1e-3)
            .unwrap_or_else(Vector3::z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn conditioner(batch: usize) -> SignalConditioner {
        let tuning = PipelineTuning { calibration_samples: batch, ..PipelineTuning::default() };
        SignalConditioner::new(&tuning, 50)
    }

    #[test]
    fn test_filter_first_sample_passthrough() {
        let mut c = conditioner(100);
        let out = c.filter(&RawSample::accel(1.0, 2.0, 9.0, 0));
        assert_eq!(out.vector(), Vector3::new(1.0, 2.0, 9.0));
    }

    #[test]
    fn test_filter_smooths_step() {
        let mut c = conditioner(100);
        c.filter(&RawSample::accel(0.0, 0.0, 0.0, 0));
        let out = c.filter(&RawSample::accel(0.0, 0.0, 10.0, 20));
        assert!(out.z > 0.0 && out.z < 10.0);

        // Converges on a held input
        let mut last = out.z;
        for i in 2..60 {
            last = c.filter(&RawSample::accel(0.0, 0.0, 10.0, i * 20)).z;
        }
        assert_relative_eq!(last, 10.0, epsilon = 1e-3);
    }

    #[test]
    fn test_uncalibrated_removes_nominal_gravity() {
        let c = conditioner(100);
        let s = ConditionedSample::from(RawSample::accel(0.0, 0.0, 9.81, 0));
        let out = c.calibrate(&s);
        assert_relative_eq!(out.z, 0.0, epsilon = 1e-6);
        assert_eq!(c.gravity_direction(), Vector3::z());
    }

    #[test]
    fn test_stationary_batch_sets_offsets() {
        let mut c = conditioner(10);
        let accel = ConditionedSample::from(RawSample::accel(0.0, 9.81, 0.3, 0));
        let gyro = ConditionedSample::from(RawSample::gyro(0.01, -0.02, 0.0, 0));

        for _ in 0..9 {
            assert_eq!(c.collect_stationary(&accel, Some(&gyro)).unwrap(), None);
        }
        let update = c.collect_stationary(&accel, Some(&gyro)).unwrap();
        assert!(matches!(update, Some(CalibrationUpdate::Initial { .. })));
        assert!(c.is_calibrated());

        // Dashboard-mounted device: gravity along +y
        let dir = c.gravity_direction();
        assert!(dir.y > 0.99);

        let out = c.calibrate(&ConditionedSample::from(RawSample::gyro(0.01, -0.02, 0.0, 1)));
        assert_relative_eq!(out.magnitude(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_noisy_batch_fails_and_resets() {
        let mut c = conditioner(4);
        for (i, z) in [9.0f32, 10.6, 9.0, 10.6].iter().enumerate() {
            let accel = ConditionedSample::from(RawSample::accel(0.0, 0.0, *z, i as u64));
            let result = c.collect_stationary(&accel, None);
            if i == 3 {
                assert!(matches!(result, Err(CalibrationError::TooNoisy { .. })));
            }
        }
        assert!(!c.is_calibrated());
    }

    #[test]
    fn test_recalibrates_only_beyond_drift() {
        let mut c = conditioner(2);
        let flat = ConditionedSample::from(RawSample::accel(0.0, 0.0, 9.81, 0));
        c.collect_stationary(&flat, None).unwrap();
        c.collect_stationary(&flat, None).unwrap();
        assert_eq!(c.calibration_count(), 1);

        let small = ConditionedSample::from(RawSample::accel(0.2, 0.0, 9.8, 0));
        c.collect_stationary(&small, None).unwrap();
        assert_eq!(c.collect_stationary(&small, None).unwrap(), None);

        let tilted = ConditionedSample::from(RawSample::accel(0.0, 3.0, 9.34, 0));
        c.collect_stationary(&tilted, None).unwrap();
        let update = c.collect_stationary(&tilted, None).unwrap();
        assert!(matches!(update, Some(CalibrationUpdate::Recalibrated { .. })));
        assert_eq!(c.calibration_count(), 2);
    }
}
