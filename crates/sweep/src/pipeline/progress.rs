//! Progress reporting and cooperative cancellation

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Receives progress updates from the pipeline.
///
/// Called from worker threads after every completed batch. Implementations
/// must return quickly and must not block.
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, current: usize, total: usize, message: &str);
}

impl<F> ProgressCallback for F
where
    F: Fn(usize, usize, &str) + Send + Sync,
{
    fn on_progress(&self, current: usize, total: usize, message: &str) {
        self(current, total, message)
    }
}

/// Discards all progress updates
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_progress(&self, _current: usize, _total: usize, _message: &str) {}
}

/// Shared flag used to ask a running pipeline to stop.
///
/// Cancellation is cooperative: stages check the flag between batches and
/// let in-flight batches finish.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Item counter for one stage of one folder, shared by its workers
pub(crate) struct StageProgress<'a> {
    callback: &'a dyn ProgressCallback,
    total: usize,
    done: AtomicUsize,
    message: String,
}

impl<'a> StageProgress<'a> {
    pub(crate) fn new(callback: &'a dyn ProgressCallback, total: usize, message: String) -> Self {
        Self {
            callback,
            total,
            done: AtomicUsize::new(0),
            message,
        }
    }

    /// Record `items` more as done and notify the callback
    pub(crate) fn advance(&self, items: usize) {
        let done = self.done.fetch_add(items, Ordering::SeqCst) + items;
        self.callback
            .on_progress(done.min(self.total), self.total, &self.message);
    }
}
