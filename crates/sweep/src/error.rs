//! Error types for mailbox sessions and pipeline runs

use serde::Serialize;
use std::time::Duration;

use crate::models::Uid;

/// How the pipeline reacts to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Timeouts, dropped connections, busy server. Retried with backoff.
    Transient,
    /// Missing target folder. Fixed once by creating it, then retried.
    Recoverable,
    /// Terminal for the affected message only.
    Permanent,
    /// Aborts the whole run.
    Fatal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Recoverable => "recoverable",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(tag)
    }
}

/// Errors reported by a mail session or the session pool
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("Server busy: {0}")]
    ServerBusy(String),

    #[error("No session available after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    #[error("Folder already exists: {0}")]
    AlreadyExists(String),

    #[error("Message {0} no longer exists")]
    MessageGone(Uid),

    #[error("Malformed message identifier: {0}")]
    InvalidId(String),

    #[error("Server rejected command: {0}")]
    Rejected(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Unable to open any session: {0}")]
    NoSessions(String),
}

impl SessionError {
    /// Classify this error for retry and reporting decisions
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Timeout(_)
            | SessionError::ConnectionLost(_)
            | SessionError::Connect(_)
            | SessionError::ServerBusy(_)
            | SessionError::PoolExhausted { .. } => ErrorKind::Transient,
            SessionError::FolderNotFound(_) => ErrorKind::Recoverable,
            SessionError::AlreadyExists(_)
            | SessionError::MessageGone(_)
            | SessionError::InvalidId(_)
            | SessionError::Rejected(_) => ErrorKind::Permanent,
            SessionError::Auth(_) | SessionError::NoSessions(_) => ErrorKind::Fatal,
        }
    }

    /// Whether the error should be retried with backoff
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Whether the error aborts the run
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    /// Whether the session that produced this error can no longer be trusted.
    ///
    /// Such sessions are discarded on release instead of going back to the
    /// idle set.
    pub fn breaks_session(&self) -> bool {
        matches!(
            self,
            SessionError::Timeout(_) | SessionError::ConnectionLost(_) | SessionError::Connect(_)
        )
    }
}

/// Errors that end a pipeline run without a result
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Run aborted while processing {folder}: {source}")]
    Fatal {
        folder: String,
        #[source]
        source: SessionError,
    },

    #[error("Invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to start worker threads: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl PipelineError {
    /// Wrap a fatal session error with the folder being processed
    pub fn fatal(folder: impl Into<String>, source: SessionError) -> Self {
        PipelineError::Fatal {
            folder: folder.into(),
            source,
        }
    }
}
