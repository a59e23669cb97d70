//! Pipeline tuning

use std::time::Duration;

use super::retry::RetryPolicy;
use crate::error::PipelineError;

/// Fewest workers ever used for a worker set
pub const MIN_WORKERS: usize = 1;
/// Most workers ever used for a worker set
pub const MAX_WORKERS: usize = 20;

/// Worker count derived from the machine: half the detected CPUs, clamped
/// to `MIN_WORKERS..=MAX_WORKERS`.
pub fn optimal_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    (cpus / 2).clamp(MIN_WORKERS, MAX_WORKERS)
}

/// Sizes and limits for one [`Pipeline`](super::Pipeline)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Session pool capacity; also the size of the I/O worker set
    pub pool_size: usize,
    /// Size of the CPU worker set used for classification
    pub classify_workers: usize,
    /// Messages per fetch or move batch
    pub batch_size: usize,
    /// Retry behaviour for transient errors
    pub retry: RetryPolicy,
    /// How long a worker waits for a free session
    pub acquire_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let workers = optimal_workers();
        Self {
            pool_size: workers,
            classify_workers: workers,
            batch_size: 50,
            retry: RetryPolicy::default(),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.pool_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "pool size must be at least 1".into(),
            ));
        }
        if self.classify_workers == 0 {
            return Err(PipelineError::InvalidConfig(
                "classify workers must be at least 1".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "batch size must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::InvalidConfig(
                "max attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
