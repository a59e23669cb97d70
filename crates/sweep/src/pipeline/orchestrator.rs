//! Runs the stages folder by folder and aggregates the result

use chrono::NaiveDate;
use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::StageContext;
use super::config::PipelineConfig;
use super::fetch::HeaderFetchStage;
use super::moves::{MoveStage, TargetFolder};
use super::progress::{CancellationToken, NoProgress, ProgressCallback, StageProgress};
use crate::classify::classify;
use crate::error::{PipelineError, SessionError};
use crate::models::{FolderReport, HeaderRecord, Policy, RunResult, Stage, Uid, Verdict, imap_date};
use crate::session::{MailSession, PoolStats, SessionFactory, SessionPool};

/// Where a run currently is.
///
/// A run walks `Searching → Fetching → Classifying → Moving` once per
/// source folder and ends in `Done`. `Cancelled` is absorbing: once entered
/// it is only left when the next run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Searching,
    Fetching,
    Classifying,
    Moving,
    Done,
    Cancelled,
    /// Stopped by a fatal error
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Cancelled | RunState::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Searching => "searching",
            RunState::Fetching => "fetching",
            RunState::Classifying => "classifying",
            RunState::Moving => "moving",
            RunState::Done => "done",
            RunState::Cancelled => "cancelled",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Resource sizing and counters of a pipeline
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub cpu_cores: usize,
    pub pool_size: usize,
    pub classify_workers: usize,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub state: RunState,
    pub pool: PoolStats,
}

/// Mailbox cleanup pipeline.
///
/// Owns the session pool, an I/O worker set sized to the pool and a
/// separate CPU worker set for classification.
pub struct Pipeline<F: SessionFactory> {
    pool: SessionPool<F>,
    io_workers: rayon::ThreadPool,
    cpu_workers: rayon::ThreadPool,
    config: PipelineConfig,
    progress: Arc<dyn ProgressCallback>,
    state: Mutex<RunState>,
}

impl<F: SessionFactory> Pipeline<F> {
    /// Create a pipeline. No session is opened until the first run.
    pub fn new(factory: F, config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let io_workers = rayon::ThreadPoolBuilder::new()
            .num_threads(config.pool_size)
            .thread_name(|i| format!("sweep-io-{}", i))
            .build()?;
        let cpu_workers = rayon::ThreadPoolBuilder::new()
            .num_threads(config.classify_workers)
            .thread_name(|i| format!("sweep-cpu-{}", i))
            .build()?;

        debug!(
            "Pipeline ready: {} sessions, {} classify workers, batches of {}",
            config.pool_size, config.classify_workers, config.batch_size
        );

        Ok(Self {
            pool: SessionPool::new(factory, config.pool_size),
            io_workers,
            cpu_workers,
            config,
            progress: Arc::new(NoProgress),
            state: Mutex::new(RunState::Idle),
        })
    }

    /// Report progress to `progress` during runs
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn pool(&self) -> &SessionPool<F> {
        &self.pool
    }

    pub fn state(&self) -> RunState {
        *self.lock_state()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            cpu_cores: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            pool_size: self.config.pool_size,
            classify_workers: self.config.classify_workers,
            batch_size: self.config.batch_size,
            max_attempts: self.config.retry.max_attempts,
            state: self.state(),
            pool: self.pool.stats(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next`, unless the run was cancelled
    fn enter(&self, next: RunState, cancel: &CancellationToken) {
        let mut state = self.lock_state();
        if *state == RunState::Cancelled {
            return;
        }
        *state = if cancel.is_cancelled() {
            RunState::Cancelled
        } else {
            next
        };
        debug!("Pipeline state: {}", *state);
    }

    fn context<'a>(&'a self, cancel: &'a CancellationToken) -> StageContext<'a, F> {
        StageContext {
            pool: &self.pool,
            workers: &self.io_workers,
            config: &self.config,
            cancel,
            progress: &*self.progress,
        }
    }

    /// Process every source folder of `policy` in order.
    ///
    /// A folder whose search fails is reported and skipped. Cancellation
    /// stops the run between batches and yields a partial result.
    ///
    /// # Errors
    /// [`PipelineError::Fatal`] when a session error makes continuing
    /// pointless, e.g. rejected credentials or no reachable server.
    pub fn run(&self, policy: &Policy, cancel: &CancellationToken) -> Result<RunResult, PipelineError> {
        *self.lock_state() = RunState::Idle;

        let cutoff = policy.cutoff_from_now();
        info!(
            "{}: {} folder(s), messages before {} ({}+ days old) go to {}",
            if policy.dry_run { "Dry run" } else { "Live run" },
            policy.source_folders.len(),
            imap_date(cutoff),
            policy.age_days,
            policy.target_folder
        );

        let target = TargetFolder::new(policy.target_folder.as_str());
        let mut reports = Vec::with_capacity(policy.source_folders.len());

        for folder in &policy.source_folders {
            if cancel.is_cancelled() {
                break;
            }
            match self.process_folder(folder, policy, cutoff, &target, cancel) {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!("Aborting run while processing {}: {}", folder, e);
                    *self.lock_state() = RunState::Failed;
                    return Err(PipelineError::fatal(folder.as_str(), e));
                }
            }
        }

        let cancelled = cancel.is_cancelled();
        self.enter(RunState::Done, cancel);

        let result = RunResult::from_reports(reports, cancelled, policy.dry_run);
        info!(
            "Run {}: scanned {}, {} candidates, {} moved, {} kept, {} unresolved, {} failed",
            if cancelled { "cancelled" } else { "finished" },
            result.scanned,
            result.candidates,
            result.moved,
            result.kept,
            result.unresolved,
            result.failed
        );
        Ok(result)
    }

    fn process_folder(
        &self,
        folder: &str,
        policy: &Policy,
        cutoff: NaiveDate,
        target: &TargetFolder,
        cancel: &CancellationToken,
    ) -> Result<FolderReport, SessionError> {
        let mut report = FolderReport::new(folder);

        self.enter(RunState::Searching, cancel);
        let uids = match self.search(folder, cutoff) {
            Ok(uids) => uids,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("Skipping folder {}: search failed: {}", folder, e);
                report.record_error(Stage::Search, e.kind(), 1);
                return Ok(report);
            }
        };
        report.searched = uids.len();
        self.progress.on_progress(
            uids.len(),
            uids.len(),
            &format!("{}: {} messages older than the cutoff", folder, uids.len()),
        );
        info!("{}: {} messages older than {}", folder, uids.len(), imap_date(cutoff));

        if uids.is_empty() || cancel.is_cancelled() {
            return Ok(report);
        }

        self.enter(RunState::Fetching, cancel);
        let fetched = HeaderFetchStage::new(self.context(cancel)).fetch(folder, &uids)?;
        report.unresolved = fetched.unresolved.len();
        for unresolved in &fetched.unresolved {
            report.record_error(Stage::Fetch, unresolved.kind, 1);
        }

        self.enter(RunState::Classifying, cancel);
        let verdicts = self.classify_records(folder, &fetched.records, policy, cancel);
        report.candidates = verdicts.iter().filter(|v| v.is_move()).count();
        report.kept = verdicts.len() - report.candidates;

        self.enter(RunState::Moving, cancel);
        let moves = MoveStage::new(self.context(cancel), target, policy.dry_run).apply(&verdicts)?;
        report.moved = moves.succeeded();
        report.failed = moves.failed();
        for kind in moves.outcomes.iter().filter_map(|o| o.failure_kind()) {
            report.record_error(Stage::Move, kind, 1);
        }

        info!(
            "{}: {} candidates, {} {}, {} kept, {} unresolved, {} failed",
            folder,
            report.candidates,
            report.moved,
            if policy.dry_run { "would be moved" } else { "moved" },
            report.kept,
            report.unresolved,
            report.failed
        );
        Ok(report)
    }

    fn search(&self, folder: &str, cutoff: NaiveDate) -> Result<Vec<Uid>, SessionError> {
        let uids = self.config.retry.retry(&format!("Search in {}", folder), |_| {
            self.pool
                .with_session(self.config.acquire_timeout, |session| {
                    session.search_before(folder, cutoff)
                })
        })?;

        let mut seen = HashSet::with_capacity(uids.len());
        Ok(uids.into_iter().filter(|uid| seen.insert(*uid)).collect())
    }

    /// Classify on the CPU worker set, one batch per task
    fn classify_records(
        &self,
        folder: &str,
        records: &[HeaderRecord],
        policy: &Policy,
        cancel: &CancellationToken,
    ) -> Vec<Verdict> {
        if records.is_empty() {
            return Vec::new();
        }

        let progress = StageProgress::new(
            &*self.progress,
            records.len(),
            format!("{}: classifying", folder),
        );

        self.cpu_workers.install(|| {
            records
                .par_chunks(self.config.batch_size)
                .flat_map_iter(|chunk| {
                    if cancel.is_cancelled() {
                        return Vec::new();
                    }
                    let verdicts: Vec<Verdict> = chunk
                        .iter()
                        .map(|header| {
                            let verdict = classify(header, policy);
                            log_verdict(header, &verdict);
                            verdict
                        })
                        .collect();
                    progress.advance(chunk.len());
                    verdicts
                })
                .collect()
        })
    }
}

fn log_verdict(header: &HeaderRecord, verdict: &Verdict) {
    let sender = if header.sender.is_empty() {
        "<unknown>"
    } else {
        header.sender.as_str()
    };
    if verdict.is_move() {
        debug!("MATCH ({}): {} | {}", verdict.reason, sender, header.subject);
    } else {
        debug!("SKIP ({}): {} | {}", verdict.reason, sender, header.subject);
    }
}
