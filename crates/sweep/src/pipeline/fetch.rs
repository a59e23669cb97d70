//! Parallel header fetching

use log::{debug, warn};
use rayon::prelude::*;
use std::collections::HashSet;

use super::StageContext;
use super::normalize::normalize_headers;
use super::progress::StageProgress;
use crate::error::{ErrorKind, SessionError};
use crate::models::{HeaderRecord, Uid};
use crate::session::{MailSession, SessionFactory};

/// A message whose headers could not be fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unresolved {
    pub uid: Uid,
    pub kind: ErrorKind,
    pub error: String,
}

impl Unresolved {
    fn new(uid: Uid, error: &SessionError) -> Self {
        Self {
            uid,
            kind: error.kind(),
            error: error.to_string(),
        }
    }
}

/// Everything one folder's fetch produced
#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    /// One record per fetched message, in batch order
    pub records: Vec<HeaderRecord>,
    /// Messages skipped because their batch failed or the server lost them
    pub unresolved: Vec<Unresolved>,
    /// Batches were skipped because the run was cancelled
    pub cancelled: bool,
}

impl FetchReport {
    fn merge(&mut self, other: FetchReport) {
        self.records.extend(other.records);
        self.unresolved.extend(other.unresolved);
        self.cancelled |= other.cancelled;
    }
}

/// Fetches header metadata for candidate UIDs in parallel batches.
///
/// Every batch leases one session for its whole duration. A batch that
/// keeps failing is skipped and its UIDs reported as unresolved; only a
/// fatal error stops the stage.
pub struct HeaderFetchStage<'a, F: SessionFactory> {
    ctx: StageContext<'a, F>,
}

impl<'a, F: SessionFactory> HeaderFetchStage<'a, F> {
    pub fn new(ctx: StageContext<'a, F>) -> Self {
        Self { ctx }
    }

    /// Fetch headers for `uids` in `folder`.
    ///
    /// Duplicate UIDs are fetched once.
    ///
    /// # Errors
    /// Returns the first fatal session error; results of other batches are
    /// dropped in that case.
    pub fn fetch(&self, folder: &str, uids: &[Uid]) -> Result<FetchReport, SessionError> {
        let mut seen = HashSet::with_capacity(uids.len());
        let uids: Vec<Uid> = uids.iter().copied().filter(|uid| seen.insert(*uid)).collect();

        if uids.is_empty() {
            return Ok(FetchReport::default());
        }

        let batch_size = self.ctx.config.batch_size.max(1);
        let progress = StageProgress::new(
            self.ctx.progress,
            uids.len(),
            format!("{}: fetching headers", folder),
        );
        debug!(
            "Fetching headers for {} messages in {} ({} per batch)",
            uids.len(),
            folder,
            batch_size
        );

        let batches: Vec<FetchReport> = self.ctx.workers.install(|| {
            uids.par_chunks(batch_size)
                .map(|batch| self.fetch_batch(folder, batch, &progress))
                .collect::<Result<Vec<_>, SessionError>>()
        })?;

        let mut report = FetchReport::default();
        for batch in batches {
            report.merge(batch);
        }
        Ok(report)
    }

    fn fetch_batch(
        &self,
        folder: &str,
        batch: &[Uid],
        progress: &StageProgress<'_>,
    ) -> Result<FetchReport, SessionError> {
        if self.ctx.cancel.is_cancelled() {
            return Ok(FetchReport {
                cancelled: true,
                ..Default::default()
            });
        }

        let label = format!("Header fetch of {} messages in {}", batch.len(), folder);
        let result = self.ctx.config.retry.retry(&label, |_| {
            self.ctx
                .pool
                .with_session(self.ctx.config.acquire_timeout, |session| {
                    session.fetch_headers(folder, batch)
                })
        });

        let report = match result {
            Ok(headers) => {
                let mut pending: HashSet<Uid> = batch.iter().copied().collect();
                let mut records = Vec::with_capacity(batch.len());

                for headers in headers {
                    // Unrequested or repeated UIDs are ignored
                    if pending.remove(&headers.uid) {
                        records.push(normalize_headers(folder, headers));
                    }
                }

                let unresolved = batch
                    .iter()
                    .filter(|uid| pending.contains(uid))
                    .map(|&uid| Unresolved::new(uid, &SessionError::MessageGone(uid)))
                    .collect::<Vec<_>>();
                if !unresolved.is_empty() {
                    debug!(
                        "{} messages in {} vanished before their headers were fetched",
                        unresolved.len(),
                        folder
                    );
                }

                FetchReport {
                    records,
                    unresolved,
                    cancelled: false,
                }
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(
                    "SKIP {} messages in {}: header fetch failed: {}",
                    batch.len(),
                    folder,
                    e
                );
                FetchReport {
                    records: Vec::new(),
                    unresolved: batch.iter().map(|&uid| Unresolved::new(uid, &e)).collect(),
                    cancelled: false,
                }
            }
        };

        progress.advance(batch.len());
        Ok(report)
    }
}
