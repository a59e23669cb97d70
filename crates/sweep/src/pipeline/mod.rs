//! The cleanup pipeline
//!
//! Per source folder: search for old messages, fetch their headers in
//! parallel, classify them, then move the ones marked for review. The
//! [`Pipeline`] owns the session pool and both worker sets; the stages
//! borrow them through a [`StageContext`].

mod config;
mod fetch;
mod moves;
mod normalize;
mod orchestrator;
mod progress;
mod retry;

pub use config::{MAX_WORKERS, MIN_WORKERS, PipelineConfig, optimal_workers};
pub use fetch::{FetchReport, HeaderFetchStage, Unresolved};
pub use moves::{MoveReport, MoveStage, TargetFolder};
pub use normalize::{decode_encoded_words, normalize_headers};
pub use orchestrator::{Pipeline, PipelineStats, RunState};
pub use progress::{CancellationToken, NoProgress, ProgressCallback};
pub use retry::RetryPolicy;

use crate::session::{SessionFactory, SessionPool};

/// Shared resources a stage runs with
pub struct StageContext<'a, F: SessionFactory> {
    pub pool: &'a SessionPool<F>,
    /// Worker set the stage's batches run on
    pub workers: &'a rayon::ThreadPool,
    pub config: &'a PipelineConfig,
    pub cancel: &'a CancellationToken,
    pub progress: &'a dyn ProgressCallback,
}

impl<F: SessionFactory> Clone for StageContext<'_, F> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<F: SessionFactory> Copy for StageContext<'_, F> {}
