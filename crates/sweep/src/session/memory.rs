//! In-memory mail server
//!
//! A scriptable stand-in for a real server, used by tests and dry-run
//! demos. Folders and messages live in a shared map; failures can be
//! queued per operation and every call is counted.

use chrono::{NaiveDate, NaiveTime};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{MailSession, SessionFactory};
use crate::error::SessionError;
use crate::models::{FetchedHeaders, Uid};

/// Server operations that failures can be scripted for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerOp {
    Search,
    Fetch,
    Move,
    Create,
    Noop,
}

#[derive(Default)]
struct Folder {
    messages: BTreeMap<Uid, FetchedHeaders>,
    next_uid: u32,
}

impl Folder {
    fn insert(&mut self, mut headers: FetchedHeaders) -> Uid {
        let uid = Uid::new(self.next_uid.max(1));
        self.next_uid = uid.get() + 1;
        headers.uid = uid;
        self.messages.insert(uid, headers);
        uid
    }
}

#[derive(Default)]
struct ServerState {
    folders: BTreeMap<String, Folder>,
    failures: HashMap<ServerOp, VecDeque<SessionError>>,
    connect_failures: VecDeque<SessionError>,
    auth_failure: Option<String>,
    latency: Duration,
    calls: HashMap<ServerOp, usize>,
    fetched: Vec<(String, Uid)>,
    moved: Vec<(String, Uid)>,
    connects: usize,
    logouts: usize,
    live_sessions: usize,
    peak_sessions: usize,
}

/// Shared handle to an in-memory mailbox. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryServer {
    /// Create a server with an empty INBOX
    pub fn new() -> Self {
        let server = Self::default();
        server.create("INBOX");
        server
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a folder if it does not exist
    pub fn create(&self, folder: &str) {
        self.lock().folders.entry(folder.to_string()).or_default();
    }

    /// Store a message and return the UID it was given.
    ///
    /// The UID in `headers` is replaced by the folder's next UID. Creates
    /// the folder when needed.
    pub fn add_message(&self, folder: &str, headers: FetchedHeaders) -> Uid {
        self.lock()
            .folders
            .entry(folder.to_string())
            .or_default()
            .insert(headers)
    }

    /// Remove a message behind the pipeline's back
    pub fn expunge(&self, folder: &str, uid: Uid) {
        if let Some(f) = self.lock().folders.get_mut(folder) {
            f.messages.remove(&uid);
        }
    }

    /// Delete a folder and its messages
    pub fn delete_folder(&self, folder: &str) {
        self.lock().folders.remove(folder);
    }

    pub fn has_folder(&self, folder: &str) -> bool {
        self.lock().folders.contains_key(folder)
    }

    /// Number of messages in a folder (zero if missing)
    pub fn count(&self, folder: &str) -> usize {
        self.lock()
            .folders
            .get(folder)
            .map_or(0, |f| f.messages.len())
    }

    /// Subjects of the messages in a folder, in UID order
    pub fn subjects(&self, folder: &str) -> Vec<String> {
        self.lock()
            .folders
            .get(folder)
            .map(|f| {
                f.messages
                    .values()
                    .map(|h| h.subject.clone().unwrap_or_default())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Queue an error for the next call of `op`
    pub fn fail_next(&self, op: ServerOp, error: SessionError) {
        self.fail_times(op, 1, error);
    }

    /// Queue the same error for the next `times` calls of `op`
    pub fn fail_times(&self, op: ServerOp, times: usize, error: SessionError) {
        let mut state = self.lock();
        let queue = state.failures.entry(op).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    /// Make the next connection attempt fail with `error`
    pub fn fail_next_connect(&self, error: SessionError) {
        self.lock().connect_failures.push_back(error);
    }

    /// Reject every login with an authentication error
    pub fn fail_auth(&self, message: &str) {
        self.lock().auth_failure = Some(message.to_string());
    }

    /// Delay every operation by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Number of calls made for `op`, failed ones included
    pub fn calls(&self, op: ServerOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Every (folder, uid) returned by a header fetch, in call order
    pub fn fetched(&self) -> Vec<(String, Uid)> {
        self.lock().fetched.clone()
    }

    /// Every (source folder, uid) successfully moved, in call order
    pub fn moved(&self) -> Vec<(String, Uid)> {
        self.lock().moved.clone()
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn logouts(&self) -> usize {
        self.lock().logouts
    }

    /// Highest number of sessions that were open at the same time
    pub fn peak_concurrent_sessions(&self) -> usize {
        self.lock().peak_sessions
    }

    /// Count the call, apply latency and pop any scripted failure
    fn begin(&self, op: ServerOp) -> Result<(), SessionError> {
        let latency = {
            let mut state = self.lock();
            *state.calls.entry(op).or_default() += 1;
            if let Some(error) = state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
                return Err(error);
            }
            state.latency
        };

        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        Ok(())
    }
}

impl SessionFactory for MemoryServer {
    type Session = MemorySession;

    fn connect(&self) -> Result<MemorySession, SessionError> {
        let mut state = self.lock();
        if let Some(message) = &state.auth_failure {
            return Err(SessionError::Auth(message.clone()));
        }
        if let Some(error) = state.connect_failures.pop_front() {
            return Err(error);
        }

        state.connects += 1;
        state.live_sessions += 1;
        state.peak_sessions = state.peak_sessions.max(state.live_sessions);

        Ok(MemorySession {
            server: self.clone(),
            logged_out: false,
        })
    }
}

/// Session against a [`MemoryServer`]
pub struct MemorySession {
    server: MemoryServer,
    logged_out: bool,
}

impl MailSession for MemorySession {
    fn search_before(&mut self, folder: &str, before: NaiveDate) -> Result<Vec<Uid>, SessionError> {
        self.server.begin(ServerOp::Search)?;
        let cutoff = before.and_time(NaiveTime::MIN).and_utc();

        let state = self.server.lock();
        let folder = state
            .folders
            .get(folder)
            .ok_or_else(|| SessionError::FolderNotFound(folder.to_string()))?;

        Ok(folder
            .messages
            .values()
            .filter(|h| h.internal_date.is_none_or(|date| date < cutoff))
            .map(|h| h.uid)
            .collect())
    }

    fn fetch_headers(
        &mut self,
        folder: &str,
        uids: &[Uid],
    ) -> Result<Vec<FetchedHeaders>, SessionError> {
        self.server.begin(ServerOp::Fetch)?;

        let mut state = self.server.lock();
        let headers: Vec<FetchedHeaders> = {
            let stored = state
                .folders
                .get(folder)
                .ok_or_else(|| SessionError::FolderNotFound(folder.to_string()))?;
            uids.iter()
                .filter_map(|uid| stored.messages.get(uid).cloned())
                .collect()
        };

        state
            .fetched
            .extend(headers.iter().map(|h| (folder.to_string(), h.uid)));
        Ok(headers)
    }

    fn move_message(&mut self, folder: &str, uid: Uid, target: &str) -> Result<(), SessionError> {
        self.server.begin(ServerOp::Move)?;

        let mut state = self.server.lock();
        if !state.folders.contains_key(target) {
            return Err(SessionError::FolderNotFound(target.to_string()));
        }

        let headers = state
            .folders
            .get_mut(folder)
            .ok_or_else(|| SessionError::FolderNotFound(folder.to_string()))?
            .messages
            .remove(&uid)
            .ok_or(SessionError::MessageGone(uid))?;

        if let Some(dest) = state.folders.get_mut(target) {
            dest.insert(headers);
        }
        state.moved.push((folder.to_string(), uid));
        Ok(())
    }

    fn create_folder(&mut self, name: &str) -> Result<(), SessionError> {
        self.server.begin(ServerOp::Create)?;

        let mut state = self.server.lock();
        if state.folders.contains_key(name) {
            return Err(SessionError::AlreadyExists(name.to_string()));
        }
        state.folders.insert(name.to_string(), Folder::default());
        Ok(())
    }

    fn noop(&mut self) -> Result<(), SessionError> {
        self.server.begin(ServerOp::Noop)
    }

    fn logout(&mut self) {
        if !self.logged_out {
            self.logged_out = true;
            self.server.lock().logouts += 1;
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let mut state = self.server.lock();
        state.live_sessions = state.live_sessions.saturating_sub(1);
    }
}
