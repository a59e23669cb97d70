//! Parallel move stage with target folder auto-creation

use log::{debug, info, warn};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use super::StageContext;
use super::progress::StageProgress;
use crate::error::SessionError;
use crate::models::{MoveOutcome, Reason, Uid, Verdict};
use crate::session::{MailSession, SessionFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FolderState {
    Unknown,
    Creating,
    Created,
}

/// Coordinates creation of the review folder between move workers.
///
/// The first worker that finds the folder missing creates it while the
/// others wait. Once created, a later "not found" never triggers another
/// creation during the same run.
pub struct TargetFolder {
    name: String,
    state: Mutex<FolderState>,
    changed: Condvar,
    creations: AtomicUsize,
}

impl TargetFolder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(FolderState::Unknown),
            changed: Condvar::new(),
            creations: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of create calls this run issued
    pub fn creations(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, FolderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make sure the folder exists after a move reported it missing.
    ///
    /// Returns once the folder was created by this or another worker. The
    /// state lock is not held while talking to the server.
    pub fn ensure<S: MailSession + ?Sized>(&self, session: &mut S) -> Result<(), SessionError> {
        let mut state = self.lock();
        loop {
            match *state {
                FolderState::Created => return Ok(()),
                FolderState::Creating => {
                    state = self
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                FolderState::Unknown => {
                    *state = FolderState::Creating;
                    break;
                }
            }
        }
        drop(state);

        self.creations.fetch_add(1, Ordering::SeqCst);
        let result = match session.create_folder(&self.name) {
            Ok(()) => {
                info!("Created folder {}", self.name);
                Ok(())
            }
            Err(SessionError::AlreadyExists(_)) => {
                debug!("Folder {} already exists", self.name);
                Ok(())
            }
            Err(e) => Err(e),
        };

        *self.lock() = if result.is_ok() {
            FolderState::Created
        } else {
            FolderState::Unknown
        };
        self.changed.notify_all();
        result
    }
}

/// What one move batch produced
#[derive(Debug, Default)]
struct BatchResult {
    outcomes: Vec<MoveOutcome>,
    cancelled: bool,
}

/// Everything the move stage produced
#[derive(Debug, Clone, Default)]
pub struct MoveReport {
    /// One outcome per distinct move verdict that was attempted
    pub outcomes: Vec<MoveOutcome>,
    /// Batches were skipped because the run was cancelled
    pub cancelled: bool,
}

impl MoveReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

/// Applies move verdicts in parallel.
///
/// Each batch holds one leased session while it moves its messages one by
/// one, so a single bad message never fails its neighbours. Transient
/// failures are collected and retried in rounds with backoff, without
/// holding the session while waiting.
pub struct MoveStage<'a, F: SessionFactory> {
    ctx: StageContext<'a, F>,
    target: &'a TargetFolder,
    dry_run: bool,
}

impl<'a, F: SessionFactory> MoveStage<'a, F> {
    pub fn new(ctx: StageContext<'a, F>, target: &'a TargetFolder, dry_run: bool) -> Self {
        Self {
            ctx,
            target,
            dry_run,
        }
    }

    /// Apply every move verdict. Keep verdicts are ignored.
    ///
    /// # Errors
    /// Returns the first fatal session error.
    pub fn apply(&self, verdicts: &[Verdict]) -> Result<MoveReport, SessionError> {
        let mut seen = HashSet::new();
        let mut by_folder: BTreeMap<&str, Vec<(Uid, &Reason)>> = BTreeMap::new();
        for verdict in verdicts.iter().filter(|v| v.is_move()) {
            if seen.insert((verdict.folder.as_str(), verdict.uid)) {
                by_folder
                    .entry(verdict.folder.as_str())
                    .or_default()
                    .push((verdict.uid, &verdict.reason));
            }
        }

        let total: usize = by_folder.values().map(Vec::len).sum();
        if total == 0 {
            return Ok(MoveReport::default());
        }

        let batch_size = self.ctx.config.batch_size.max(1);
        let jobs: Vec<(&str, &[(Uid, &Reason)])> = by_folder
            .iter()
            .flat_map(|(folder, items)| items.chunks(batch_size).map(move |chunk| (*folder, chunk)))
            .collect();

        let verb = if self.dry_run { "simulating moves" } else { "moving" };
        let folders: Vec<&str> = by_folder.keys().copied().collect();
        let progress = StageProgress::new(
            self.ctx.progress,
            total,
            format!("{}: {} to {}", folders.join(", "), verb, self.target.name()),
        );

        let batches: Vec<BatchResult> = self.ctx.workers.install(|| {
            jobs.par_iter()
                .map(|(folder, items)| -> Result<BatchResult, SessionError> {
                    if self.ctx.cancel.is_cancelled() {
                        return Ok(BatchResult {
                            outcomes: Vec::new(),
                            cancelled: true,
                        });
                    }
                    let outcomes = if self.dry_run {
                        self.simulate_batch(folder, items)
                    } else {
                        self.move_batch(folder, items)?
                    };
                    progress.advance(items.len());
                    Ok(BatchResult {
                        outcomes,
                        cancelled: false,
                    })
                })
                .collect::<Result<Vec<_>, SessionError>>()
        })?;

        let mut report = MoveReport::default();
        for batch in batches {
            report.outcomes.extend(batch.outcomes);
            report.cancelled |= batch.cancelled;
        }
        Ok(report)
    }

    fn simulate_batch(&self, folder: &str, items: &[(Uid, &Reason)]) -> Vec<MoveOutcome> {
        items
            .iter()
            .map(|&(uid, reason)| {
                info!(
                    "DRY-RUN would move {}/{} to {} ({})",
                    folder,
                    uid,
                    self.target.name(),
                    reason
                );
                MoveOutcome::simulated(uid, folder)
            })
            .collect()
    }

    fn move_batch(
        &self,
        folder: &str,
        items: &[(Uid, &Reason)],
    ) -> Result<Vec<MoveOutcome>, SessionError> {
        let retry = &self.ctx.config.retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut outcomes = Vec::with_capacity(items.len());
        let mut pending: Vec<Uid> = items.iter().map(|&(uid, _)| uid).collect();
        let mut attempt = 1;

        loop {
            let failed = self.move_round(folder, &pending, attempt, &mut outcomes)?;
            if failed.is_empty() {
                break;
            }

            if attempt >= max_attempts {
                for (uid, e) in failed {
                    warn!(
                        "Giving up on {}/{} after {} attempts: {}",
                        folder, uid, attempt, e
                    );
                    outcomes.push(MoveOutcome::failed(uid, folder, &e));
                }
                break;
            }

            let delay = retry.backoff(attempt);
            warn!(
                "{} moves in {} failed (attempt {}/{}); retrying in {:?}",
                failed.len(),
                folder,
                attempt,
                max_attempts,
                delay
            );
            std::thread::sleep(delay);
            pending = failed.into_iter().map(|(uid, _)| uid).collect();
            attempt += 1;
        }

        Ok(outcomes)
    }

    /// One pass over `pending` on a single leased session. Terminal
    /// outcomes go to `outcomes`; UIDs worth retrying are returned.
    fn move_round(
        &self,
        folder: &str,
        pending: &[Uid],
        attempt: u32,
        outcomes: &mut Vec<MoveOutcome>,
    ) -> Result<Vec<(Uid, SessionError)>, SessionError> {
        let mut lease = match self.ctx.pool.acquire(self.ctx.config.acquire_timeout) {
            Ok(lease) => lease,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) if e.is_transient() => {
                return Ok(pending.iter().map(|&uid| (uid, e.clone())).collect());
            }
            Err(e) => {
                outcomes.extend(pending.iter().map(|&uid| MoveOutcome::failed(uid, folder, &e)));
                return Ok(Vec::new());
            }
        };

        let mut retry = Vec::new();
        for (i, &uid) in pending.iter().enumerate() {
            match self.move_one(&mut *lease, folder, uid) {
                Ok(()) => {
                    debug!("Moved {}/{} to {}", folder, uid, self.target.name());
                    outcomes.push(MoveOutcome::moved(uid, folder, attempt));
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) if e.is_transient() => {
                    let broken = e.breaks_session();
                    retry.push((uid, e.clone()));
                    if broken {
                        // The rest of the batch waits for a fresh session
                        lease.mark_broken();
                        retry.extend(pending[i + 1..].iter().map(|&uid| (uid, e.clone())));
                        break;
                    }
                }
                Err(e) => {
                    warn!("Could not move {}/{}: {}", folder, uid, e);
                    outcomes.push(MoveOutcome::failed(uid, folder, &e));
                }
            }
        }

        Ok(retry)
    }

    fn move_one(&self, session: &mut F::Session, folder: &str, uid: Uid) -> Result<(), SessionError> {
        let target = self.target.name();
        match session.move_message(folder, uid, target) {
            Err(SessionError::FolderNotFound(missing)) if missing == target => {
                self.target.ensure(session)?;
                session.move_message(folder, uid, target)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{FetchedHeaders, MoveStatus};
    use crate::pipeline::{
        CancellationToken, NoProgress, PipelineConfig, ProgressCallback, RetryPolicy,
    };
    use crate::session::{MemoryServer, ServerOp, SessionPool};
    use std::time::Duration;

    const TARGET: &str = "Review/Delete";

    fn config(batch_size: usize, max_attempts: u32) -> PipelineConfig {
        PipelineConfig {
            pool_size: 3,
            classify_workers: 1,
            batch_size,
            retry: RetryPolicy {
                max_attempts,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
            acquire_timeout: Duration::from_secs(5),
        }
    }

    fn seed(server: &MemoryServer, n: usize) -> Vec<Verdict> {
        (0..n)
            .map(|i| {
                let uid = server.add_message(
                    "INBOX",
                    FetchedHeaders::new(Uid::new(1)).subject(format!("Deal {}", i)),
                );
                Verdict::move_to_review(uid, "INBOX", Reason::ListUnsubscribe)
            })
            .collect()
    }

    fn apply(
        server: &MemoryServer,
        config: &PipelineConfig,
        target: &TargetFolder,
        dry_run: bool,
        verdicts: &[Verdict],
    ) -> Result<MoveReport, SessionError> {
        apply_with_progress(server, config, target, dry_run, verdicts, &NoProgress)
    }

    fn apply_with_progress(
        server: &MemoryServer,
        config: &PipelineConfig,
        target: &TargetFolder,
        dry_run: bool,
        verdicts: &[Verdict],
        progress: &dyn ProgressCallback,
    ) -> Result<MoveReport, SessionError> {
        let pool = SessionPool::new(server.clone(), config.pool_size);
        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(config.pool_size)
            .build()
            .unwrap();
        let cancel = CancellationToken::new();
        let ctx = StageContext {
            pool: &pool,
            workers: &workers,
            config,
            cancel: &cancel,
            progress,
        };
        MoveStage::new(ctx, target, dry_run).apply(verdicts)
    }

    #[test]
    fn test_moves_and_creates_target_once() {
        let server = MemoryServer::new();
        let verdicts = seed(&server, 9);
        let target = TargetFolder::new(TARGET);

        let report = apply(&server, &config(2, 3), &target, false, &verdicts).unwrap();

        assert_eq!(report.succeeded(), 9);
        assert_eq!(report.outcomes.len(), 9);
        assert_eq!(target.creations(), 1);
        assert_eq!(server.calls(ServerOp::Create), 1);
        assert_eq!(server.count(TARGET), 9);
        assert_eq!(server.count("INBOX"), 0);
    }

    #[test]
    fn test_existing_folder_answer_counts_as_created() {
        let server = MemoryServer::new();
        let verdicts = seed(&server, 1);
        let target = TargetFolder::new(TARGET);
        let mut session = crate::session::SessionFactory::connect(&server).unwrap();

        server.create(TARGET);
        target.ensure(&mut session).unwrap();
        target.ensure(&mut session).unwrap();

        assert_eq!(target.creations(), 1);
        assert!(apply(&server, &config(5, 1), &target, false, &verdicts).is_ok());
    }

    #[test]
    fn test_folder_not_recreated_after_success() {
        let server = MemoryServer::new();
        let verdicts = seed(&server, 2);
        let target = TargetFolder::new(TARGET);

        let first = apply(&server, &config(5, 1), &target, false, &verdicts[..1]).unwrap();
        assert_eq!(first.succeeded(), 1);

        server.delete_folder(TARGET);
        let second = apply(&server, &config(5, 1), &target, false, &verdicts[1..]).unwrap();

        assert_eq!(target.creations(), 1);
        assert_eq!(second.failed(), 1);
        assert_eq!(
            second.outcomes[0].failure_kind(),
            Some(ErrorKind::Recoverable)
        );
    }

    #[test]
    fn test_dry_run_issues_no_calls() {
        let server = MemoryServer::new();
        let verdicts = seed(&server, 4);
        let target = TargetFolder::new(TARGET);

        let report = apply(&server, &config(3, 3), &target, true, &verdicts).unwrap();

        assert_eq!(report.succeeded(), 4);
        assert!(report
            .outcomes
            .iter()
            .all(|o| o.status == MoveStatus::Simulated));
        assert_eq!(server.calls(ServerOp::Move), 0);
        assert_eq!(server.calls(ServerOp::Create), 0);
        assert_eq!(server.connects(), 0);
        assert_eq!(server.count("INBOX"), 4);
    }

    #[test]
    fn test_progress_names_source_folder() {
        let server = MemoryServer::new();
        let verdicts = seed(&server, 4);
        let target = TargetFolder::new(TARGET);
        let messages = Mutex::new(Vec::new());
        let record = |_current: usize, _total: usize, message: &str| {
            messages
                .lock()
                .unwrap()
                .push(message.to_string());
        };

        apply_with_progress(&server, &config(2, 1), &target, true, &verdicts, &record).unwrap();

        let messages = messages.into_inner().unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages
            .iter()
            .all(|m| m == "INBOX: simulating moves to Review/Delete"));
    }

    #[test]
    fn test_keep_verdicts_and_duplicates_ignored() {
        let server = MemoryServer::new();
        server.create(TARGET);
        let mut verdicts = seed(&server, 2);
        verdicts.push(verdicts[0].clone());
        verdicts.push(Verdict::keep(Uid::new(99), "INBOX", Reason::NoMatch));

        let report = apply(&server, &config(10, 1), &TargetFolder::new(TARGET), false, &verdicts)
            .unwrap();

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(server.calls(ServerOp::Move), 2);
    }

    #[test]
    fn test_transient_failure_moves_after_retry() {
        let server = MemoryServer::new();
        server.create(TARGET);
        let verdicts = seed(&server, 3);
        server.fail_next(ServerOp::Move, SessionError::ServerBusy("busy".into()));

        let report = apply(&server, &config(10, 3), &TargetFolder::new(TARGET), false, &verdicts)
            .unwrap();

        assert_eq!(report.succeeded(), 3);
        let retried: Vec<_> = report
            .outcomes
            .iter()
            .filter(|o| matches!(o.status, MoveStatus::MovedAfterRetry { attempts: 2 }))
            .collect();
        assert_eq!(retried.len(), 1);
    }

    #[test]
    fn test_retry_exhaustion_is_terminal_not_fatal() {
        let server = MemoryServer::new();
        server.create(TARGET);
        let verdicts = seed(&server, 1);
        server.fail_times(ServerOp::Move, 2, SessionError::Timeout("slow".into()));

        let report = apply(&server, &config(10, 2), &TargetFolder::new(TARGET), false, &verdicts)
            .unwrap();

        assert_eq!(report.failed(), 1);
        assert_eq!(report.outcomes[0].failure_kind(), Some(ErrorKind::Transient));
        assert_eq!(server.calls(ServerOp::Move), 2);
    }

    #[test]
    fn test_permanent_error_fails_only_that_message() {
        let server = MemoryServer::new();
        server.create(TARGET);
        let verdicts = seed(&server, 3);
        server.expunge("INBOX", verdicts[1].uid);

        let report = apply(&server, &config(10, 3), &TargetFolder::new(TARGET), false, &verdicts)
            .unwrap();

        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        let failed = report.outcomes.iter().find(|o| !o.is_success()).unwrap();
        assert_eq!(failed.uid, verdicts[1].uid);
        assert_eq!(failed.failure_kind(), Some(ErrorKind::Permanent));
    }

    #[test]
    fn test_connection_loss_moves_rest_on_new_session() {
        let server = MemoryServer::new();
        server.create(TARGET);
        let verdicts = seed(&server, 4);
        server.fail_next(ServerOp::Move, SessionError::ConnectionLost("reset".into()));

        let report = apply(&server, &config(10, 2), &TargetFolder::new(TARGET), false, &verdicts)
            .unwrap();

        assert_eq!(report.succeeded(), 4);
        assert_eq!(server.connects(), 2);
        assert_eq!(server.calls(ServerOp::Move), 5);
    }
}
