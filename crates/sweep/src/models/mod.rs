//! Domain models for the cleanup pipeline

mod message;
mod policy;
mod report;
mod verdict;

pub use message::{EmailAddress, FetchedHeaders, HeaderRecord, HeaderRecordBuilder, Uid};
pub use policy::{DEFAULT_TARGET_FOLDER, Policy, PolicyBuilder, imap_date};
pub use report::{FolderError, FolderReport, MoveOutcome, MoveStatus, RunResult, Stage};
pub use verdict::{Decision, Reason, Verdict};
