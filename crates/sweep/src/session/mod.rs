//! Mailbox sessions and the bounded session pool
//!
//! The wire protocol lives outside this crate. Anything that can search,
//! fetch headers, move messages and create folders can drive the pipeline
//! by implementing [`MailSession`] and handing a [`SessionFactory`] to it.

pub mod memory;
mod pool;

use chrono::NaiveDate;

use crate::error::SessionError;
use crate::models::{FetchedHeaders, Uid};

pub use memory::{MemoryServer, MemorySession, ServerOp};
pub use pool::{PoolStats, SessionLease, SessionPool};

/// One authenticated connection to the mail server.
///
/// Sessions are not shared between threads; the pool hands each one to a
/// single worker at a time.
pub trait MailSession: Send {
    /// UIDs of messages in `folder` received before `before`
    fn search_before(&mut self, folder: &str, before: NaiveDate) -> Result<Vec<Uid>, SessionError>;

    /// Header fields for the given UIDs. UIDs that no longer exist are
    /// simply missing from the result.
    fn fetch_headers(
        &mut self,
        folder: &str,
        uids: &[Uid],
    ) -> Result<Vec<FetchedHeaders>, SessionError>;

    /// Move one message from `folder` to `target`
    fn move_message(&mut self, folder: &str, uid: Uid, target: &str) -> Result<(), SessionError>;

    /// Create a folder. Returns [`SessionError::AlreadyExists`] if it is
    /// already there.
    fn create_folder(&mut self, name: &str) -> Result<(), SessionError>;

    /// Cheap liveness check, run before an idle session is handed out
    fn noop(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    /// Close the connection. Errors are ignored.
    fn logout(&mut self) {}
}

/// Produces authenticated sessions on demand
pub trait SessionFactory: Send + Sync {
    type Session: MailSession;

    /// Open and authenticate a new session
    fn connect(&self) -> Result<Self::Session, SessionError>;
}
