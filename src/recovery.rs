use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::FailureKind;

/// What the caller should do about a recoverable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryAction {
    /// Keep monitoring with whatever sources remain
    ContinueDegraded,
    RetryCalibration,
    CleanupStorage,
    ReduceBufferLoad,
    ReduceSamplingLoad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Recover(RecoveryAction),
    /// Needs user action; surfaced to the caller
    Unrecoverable(FailureKind),
}

/// Exponential backoff, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    /// `min(base * 2^attempt, max)`, attempt counted from 0.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Run `op` until it succeeds, the error is not retryable, or attempts
    /// run out. The last error is returned.
    pub async fn retry<T, E, F, Fut>(
        &self,
        mut op: F,
        is_retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if is_retryable(&e) && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    log::warn!(
                        "Attempt {}/{} failed: {}, retrying in {:.1}s",
                        attempt + 1,
                        self.max_attempts,
                        e,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Maps failures to recovery actions and keeps a per-kind tally.
#[derive(Default)]
pub struct ErrorHandler {
    tally: Mutex<BTreeMap<String, u64>>,
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recovery_for(kind: FailureKind) -> RecoveryOutcome {
        use FailureKind::*;
        match kind {
            SensorPermissionDenied
            | StoragePermissionDenied
            | LocationPermissionDenied
            | DatabaseCorruption
            | BatteryCritical => RecoveryOutcome::Unrecoverable(kind),
            SensorUnavailable | LocationUnavailable | GpsAccuracyTooLow => {
                RecoveryOutcome::Recover(RecoveryAction::ContinueDegraded)
            }
            SensorCalibrationFailure => RecoveryOutcome::Recover(RecoveryAction::RetryCalibration),
            StorageFull => RecoveryOutcome::Recover(RecoveryAction::CleanupStorage),
            LowMemory => RecoveryOutcome::Recover(RecoveryAction::ReduceBufferLoad),
            CpuThrottling => RecoveryOutcome::Recover(RecoveryAction::ReduceSamplingLoad),
        }
    }

    /// Record and classify a failure.
    pub fn handle(&self, kind: FailureKind, context: &str) -> RecoveryOutcome {
        if let Ok(mut tally) = self.tally.lock() {
            *tally.entry(format!("{kind:?}")).or_insert(0) += 1;
        }
        let outcome = Self::recovery_for(kind);
        match outcome {
            RecoveryOutcome::Unrecoverable(_) => log::error!("{kind:?} ({context}): unrecoverable"),
            RecoveryOutcome::Recover(action) => log::warn!("{kind:?} ({context}): {action:?}"),
        }
        outcome
    }

    pub fn failure_counts(&self) -> BTreeMap<String, u64> {
        self.tally.lock().map(|t| t.clone()).unwrap_or_default()
    }
}
