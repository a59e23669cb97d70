//! Move outcomes and run results

use serde::Serialize;
use std::collections::BTreeMap;

use super::Uid;
use crate::error::{ErrorKind, SessionError};

/// Pipeline stage, used for progress messages and error reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Search,
    Fetch,
    Classify,
    Move,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Search => "search",
            Stage::Fetch => "fetch",
            Stage::Classify => "classify",
            Stage::Move => "move",
        };
        f.write_str(name)
    }
}

/// Terminal state of one move verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum MoveStatus {
    /// Moved on the first attempt
    Moved,
    /// Moved after `attempts` tries
    MovedAfterRetry { attempts: u32 },
    /// Dry run; nothing was sent to the server
    Simulated,
    /// Gave up on this message
    Failed { kind: ErrorKind, error: String },
}

/// Result of applying one move verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MoveOutcome {
    pub uid: Uid,
    pub folder: String,
    #[serde(flatten)]
    pub status: MoveStatus,
}

impl MoveOutcome {
    pub fn moved(uid: Uid, folder: impl Into<String>, attempts: u32) -> Self {
        let status = if attempts <= 1 {
            MoveStatus::Moved
        } else {
            MoveStatus::MovedAfterRetry { attempts }
        };
        Self {
            uid,
            folder: folder.into(),
            status,
        }
    }

    pub fn simulated(uid: Uid, folder: impl Into<String>) -> Self {
        Self {
            uid,
            folder: folder.into(),
            status: MoveStatus::Simulated,
        }
    }

    pub fn failed(uid: Uid, folder: impl Into<String>, error: &SessionError) -> Self {
        Self {
            uid,
            folder: folder.into(),
            status: MoveStatus::Failed {
                kind: error.kind(),
                error: error.to_string(),
            },
        }
    }

    /// Whether the message counts as moved (simulated moves included)
    pub fn is_success(&self) -> bool {
        !matches!(self.status, MoveStatus::Failed { .. })
    }

    /// Error kind of a failed outcome
    pub fn failure_kind(&self) -> Option<ErrorKind> {
        match &self.status {
            MoveStatus::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Counts for a single source folder
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FolderReport {
    pub folder: String,
    /// UIDs returned by the age search
    pub searched: usize,
    /// Messages classified for move
    pub candidates: usize,
    /// Messages classified as keep
    pub kept: usize,
    /// Messages moved (or simulated in dry run)
    pub moved: usize,
    /// Move verdicts that ended in failure
    pub failed: usize,
    /// UIDs whose headers could not be fetched
    pub unresolved: usize,
    /// Error counts per stage and kind
    #[serde(skip)]
    pub errors: BTreeMap<(Stage, ErrorKind), usize>,
}

impl FolderReport {
    pub fn new(folder: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            ..Default::default()
        }
    }

    /// Record `count` failures of the given kind in a stage
    pub fn record_error(&mut self, stage: Stage, kind: ErrorKind, count: usize) {
        if count > 0 {
            *self.errors.entry((stage, kind)).or_default() += count;
        }
    }
}

/// One row of the run-level error list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderError {
    pub folder: String,
    pub stage: Stage,
    pub kind: ErrorKind,
    pub count: usize,
}

/// Final result of a pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunResult {
    /// Messages classified for move across all folders
    pub candidates: usize,
    /// Messages moved (or simulated in dry run)
    pub moved: usize,
    /// UIDs returned by all searches
    pub scanned: usize,
    /// Messages classified as keep
    pub kept: usize,
    /// UIDs dropped because their headers could not be fetched
    pub unresolved: usize,
    /// Move verdicts that ended in failure
    pub failed: usize,
    /// Whether the run stopped early because it was cancelled
    pub cancelled: bool,
    /// Whether moves were simulated
    pub dry_run: bool,
    /// Per-folder counts, in processing order
    pub folders: Vec<FolderReport>,
    /// Failures grouped by folder, stage and kind
    pub errors: Vec<FolderError>,
}

impl RunResult {
    /// Aggregate per-folder reports into the final result
    pub fn from_reports(folders: Vec<FolderReport>, cancelled: bool, dry_run: bool) -> Self {
        let mut result = RunResult {
            cancelled,
            dry_run,
            ..Default::default()
        };

        for report in &folders {
            result.candidates += report.candidates;
            result.moved += report.moved;
            result.scanned += report.searched;
            result.kept += report.kept;
            result.unresolved += report.unresolved;
            result.failed += report.failed;
            result
                .errors
                .extend(report.errors.iter().map(|(&(stage, kind), &count)| FolderError {
                    folder: report.folder.clone(),
                    stage,
                    kind,
                    count,
                }));
        }

        result.folders = folders;
        result
    }

    /// Whether any stage recorded a failure
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}
