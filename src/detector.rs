use nalgebra::Vector3;
use std::collections::VecDeque;

use crate::config::{MonitorConfig, PipelineTuning};
use crate::types::{CandidateEvent, ConditionedSample, LocationFix, SensorQuality};

/// Per-sample inputs the detector does not own.
#[derive(Clone, Copy, Debug, Default)]
pub struct DetectionContext {
    pub location: Option<LocationFix>,
    pub handling: bool,
    pub quality: SensorQuality,
}

/// First gate a sample failed, in evaluation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateFailure {
    NoLocation,
    TooSlow,
    PoorGpsAccuracy,
    Handling,
    BelowThreshold,
}

pub struct EventDetector {
    accel_threshold: f32,
    min_speed_kmh: f32,
    gps_accuracy_m: f32,
    merge_window_ms: u64,
    min_duration_ms: u32,
    max_duration_ms: u32,
    vertical_axis: Vector3<f32>,
    recent: VecDeque<CandidateEvent>,
}

impl EventDetector {
    pub fn new(config: &MonitorConfig, tuning: &PipelineTuning) -> Self {
        Self {
            accel_threshold: config.accel_threshold_ms2(),
            min_speed_kmh: config.min_speed_kmh(),
            gps_accuracy_m: config.gps_accuracy_threshold_m(),
            merge_window_ms: tuning.merge_window_ms,
            min_duration_ms: tuning.min_duration_ms,
            max_duration_ms: tuning.max_duration_ms,
            vertical_axis: Vector3::z(),
            recent: VecDeque::new(),
        }
    }

    /// Axis (device frame) whose acceleration counts as vertical.
    pub fn set_vertical_axis(&mut self, axis: Vector3<f32>) {
        if let Some(unit) = axis.try_normalize(1e-3) {
            self.vertical_axis = unit;
        }
    }

    pub fn vertical_acceleration(&self, sample: &ConditionedSample) -> f32 {
        sample.vector().dot(&self.vertical_axis).abs()
    }

    /// Run the gates in order, short-circuiting on the first failure.
    /// Returns the vertical acceleration magnitude on success.
    pub fn gate(&self, sample: &ConditionedSample, ctx: &DetectionContext) -> Result<f32, GateFailure> {
        let fix = ctx.location.ok_or(GateFailure::NoLocation)?;
        if !fix.is_moving_at_least(self.min_speed_kmh) {
            return Err(GateFailure::TooSlow);
        }
        if !fix.has_accuracy_within(self.gps_accuracy_m) {
            return Err(GateFailure::PoorGpsAccuracy);
        }
        if ctx.handling {
            return Err(GateFailure::Handling);
        }
        let vertical = self.vertical_acceleration(sample);
        if vertical < self.accel_threshold {
            return Err(GateFailure::BelowThreshold);
        }
        Ok(vertical)
    }

    /// Detect a candidate for this sample and merge it with recent neighbours.
    ///
    /// Candidates within the merge window of each other form one open group.
    /// The group is emitted once, folded, when a sample arrives more than the
    /// window after its last member; the sample's own candidate starts the
    /// next group. Returns at most one event per call.
    pub fn detect_event(&mut self, sample: &ConditionedSample, ctx: &DetectionContext) -> Option<CandidateEvent> {
        let closed = self.close_expired(sample.timestamp);

        let vertical = match self.gate(sample, ctx) {
            Ok(v) => v,
            Err(failure) => {
                log::trace!("Sample at {} ms rejected: {:?}", sample.timestamp, failure);
                return closed;
            }
        };

        let candidate = CandidateEvent {
            timestamp: sample.timestamp,
            peak_acceleration: vertical,
            duration_ms: self.estimate_duration(vertical),
            location: ctx.location,
            quality: ctx.quality,
        };
        if !self.validate_candidate(&candidate) {
            log::debug!("Candidate at {} ms failed validation", candidate.timestamp);
            return closed;
        }
        self.push_candidate(candidate);
        closed
    }

    /// Rough impulse width: stronger hits are sharper.
    pub fn estimate_duration(&self, magnitude: f32) -> u32 {
        let estimate = if magnitude >= 12.0 {
            50
        } else if magnitude >= 8.0 {
            100
        } else if magnitude >= 5.0 {
            150
        } else {
            200
        };
        estimate.clamp(self.min_duration_ms, self.max_duration_ms)
    }

    pub fn validate_candidate(&self, candidate: &CandidateEvent) -> bool {
        let location_ok = candidate.location.map_or(false, |fix| {
            fix.has_accuracy_within(self.gps_accuracy_m) && fix.is_moving_at_least(self.min_speed_kmh)
        });
        candidate.peak_acceleration >= self.accel_threshold
            && (self.min_duration_ms..=self.max_duration_ms).contains(&candidate.duration_ms)
            && location_ok
    }

    fn push_candidate(&mut self, candidate: CandidateEvent) {
        let at = self.recent.partition_point(|c| c.timestamp <= candidate.timestamp);
        self.recent.insert(at, candidate);
    }

    /// Emit the open group once no later sample can extend it.
    fn close_expired(&mut self, now_ms: u64) -> Option<CandidateEvent> {
        let last = self.recent.back()?.timestamp;
        if now_ms.saturating_sub(last) <= self.merge_window_ms {
            return None;
        }
        self.flush()
    }

    /// Emit the open group now, folded into one event.
    pub fn flush(&mut self) -> Option<CandidateEvent> {
        let group: Vec<CandidateEvent> = self.recent.drain(..).collect();
        merge_candidates(&group, self.merge_window_ms)
    }

    /// Forget unconsumed candidates without emitting them.
    pub fn clear_state(&mut self) {
        self.recent.clear();
    }

    pub fn pending_candidates(&self) -> usize {
        self.recent.len()
    }
}

fn split_chains(sorted: &[CandidateEvent], window_ms: u64) -> Vec<Vec<CandidateEvent>> {
    let mut chains: Vec<Vec<CandidateEvent>> = Vec::new();
    for candidate in sorted {
        let extends = chains
            .last()
            .and_then(|chain| chain.last())
            .map_or(false, |prev| candidate.timestamp.abs_diff(prev.timestamp) <= window_ms);
        match chains.last_mut() {
            Some(chain) if extends => chain.push(*candidate),
            _ => chains.push(vec![*candidate]),
        }
    }
    chains
}

fn fold_chain(chain: &[CandidateEvent]) -> Option<CandidateEvent> {
    let (first, rest) = chain.split_first()?;
    Some(rest.iter().fold(*first, |acc, next| acc.merge(next)))
}

/// Merge time-sorted candidates as a strict chain.
///
/// Folds from the earliest candidate and stops at the first gap wider than
/// `window_ms`; candidates after the break are not merged into the result.
pub fn merge_candidates(candidates: &[CandidateEvent], window_ms: u64) -> Option<CandidateEvent> {
    let mut sorted = candidates.to_vec();
    sorted.sort_by_key(|c| c.timestamp);
    split_chains(&sorted, window_ms)
        .into_iter()
        .next()
        .and_then(|chain| fold_chain(&chain))
}
