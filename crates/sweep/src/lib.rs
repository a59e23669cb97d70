//! Sweep crate - mailbox cleanup pipeline
//!
//! Moves old bulk mail out of IMAP folders into a review folder:
//! - Domain models (HeaderRecord, Policy, Verdict, RunResult)
//! - Bounded session pool over a pluggable session trait
//! - Parallel header fetch and move stages with retry
//! - Deterministic classification rules with safety overrides
//! - Layered JSON configuration
//!
//! The wire protocol is not part of this crate. Implement
//! [`MailSession`] and [`SessionFactory`] for a real server, or use
//! [`MemoryServer`] for tests and demos.

pub mod classify;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod session;
pub mod settings;

pub use classify::{classify, domain_matches};
pub use error::{ErrorKind, PipelineError, SessionError};
pub use models::{
    Decision, EmailAddress, FetchedHeaders, FolderError, FolderReport, HeaderRecord, MoveOutcome,
    MoveStatus, Policy, PolicyBuilder, Reason, RunResult, Stage, Uid, Verdict, imap_date,
};
pub use pipeline::{
    CancellationToken, FetchReport, HeaderFetchStage, MoveReport, MoveStage, NoProgress, Pipeline,
    PipelineConfig, PipelineStats, ProgressCallback, RetryPolicy, RunState, StageContext,
    TargetFolder, decode_encoded_words, normalize_headers,
};
pub use session::{
    MailSession, MemoryServer, MemorySession, PoolStats, ServerOp, SessionFactory, SessionLease,
    SessionPool,
};
pub use settings::{CleanupConfig, WorkerCount};
