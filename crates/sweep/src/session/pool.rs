//! Bounded pool of authenticated sessions

use log::{debug, warn};
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{MailSession, SessionFactory};
use crate::error::SessionError;

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Maximum number of live sessions
    pub capacity: usize,
    /// Sessions waiting in the idle set
    pub idle: usize,
    /// Sessions currently leased (including slots being connected)
    pub leased: usize,
    /// Sessions opened over the pool's lifetime
    pub created: usize,
    /// Sessions closed because they were unhealthy or the pool was closed
    pub discarded: usize,
    /// Highest number of simultaneous leases observed
    pub peak_leased: usize,
    /// Successful acquires
    pub acquired: usize,
    /// Releases, one per successful acquire
    pub released: usize,
}

struct PoolState<S> {
    idle: Vec<S>,
    leased: usize,
    created: usize,
    discarded: usize,
    peak_leased: usize,
    acquired: usize,
    released: usize,
    closed: bool,
}

enum Slot<S> {
    Idle(S),
    Connect,
}

/// A fixed-capacity pool of sessions.
///
/// Sessions are opened lazily, up to `capacity`, and reused across leases.
/// All bookkeeping happens under one mutex, which is never held while
/// talking to the server: connecting, health checks and logouts run after
/// the lock is dropped, with the slot already reserved.
pub struct SessionPool<F: SessionFactory> {
    factory: F,
    capacity: usize,
    state: Mutex<PoolState<F::Session>>,
    available: Condvar,
}

impl<F: SessionFactory> SessionPool<F> {
    /// Create a pool. A capacity of zero is raised to one.
    pub fn new(factory: F, capacity: usize) -> Self {
        Self {
            factory,
            capacity: capacity.max(1),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                leased: 0,
                created: 0,
                discarded: 0,
                peak_leased: 0,
                acquired: 0,
                released: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<F::Session>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lease a session, waiting up to `timeout` for one to become free.
    ///
    /// # Errors
    /// - [`SessionError::PoolExhausted`] if nothing became available in time
    /// - the factory's error if a new session could not be opened;
    ///   authentication failures are fatal, and so is a connect failure
    ///   before the pool ever opened a session
    ///   ([`SessionError::NoSessions`]). Once a session has been opened,
    ///   connect failures stay transient so callers can back off and retry.
    pub fn acquire(&self, timeout: Duration) -> Result<SessionLease<'_, F>, SessionError> {
        let deadline = Instant::now() + timeout;

        loop {
            let slot = self.reserve_slot(deadline, timeout)?;

            match slot {
                Slot::Idle(mut session) => match session.noop() {
                    Ok(()) => return Ok(self.lease(session)),
                    Err(e) => {
                        debug!("Discarding idle session that failed health check: {}", e);
                        session.logout();
                        self.forget_slot(true);
                    }
                },
                Slot::Connect => match self.factory.connect() {
                    Ok(session) => {
                        self.lock().created += 1;
                        return Ok(self.lease(session));
                    }
                    Err(e) => {
                        let created = self.forget_slot(false);
                        if e.is_fatal() {
                            return Err(e);
                        }
                        if created == 0 {
                            warn!("Could not open any session: {}", e);
                            return Err(SessionError::NoSessions(e.to_string()));
                        }
                        debug!("Reconnect failed: {}", e);
                        return Err(e);
                    }
                },
            }
        }
    }

    /// Wait for an idle session or a free slot, and mark it leased
    fn reserve_slot(
        &self,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Slot<F::Session>, SessionError> {
        let mut state = self.lock();

        let slot = loop {
            if let Some(session) = state.idle.pop() {
                break Slot::Idle(session);
            }
            if state.leased < self.capacity {
                break Slot::Connect;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SessionError::PoolExhausted { waited: timeout });
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        };

        state.leased += 1;
        state.peak_leased = state.peak_leased.max(state.leased);
        Ok(slot)
    }

    /// Give back a reserved slot without a session. Returns the number of
    /// sessions opened so far.
    fn forget_slot(&self, discarded: bool) -> usize {
        let mut state = self.lock();
        state.leased = state.leased.saturating_sub(1);
        if discarded {
            state.discarded += 1;
        }
        let created = state.created;
        drop(state);
        self.available.notify_one();
        created
    }

    fn lease(&self, session: F::Session) -> SessionLease<'_, F> {
        self.lock().acquired += 1;
        SessionLease {
            pool: self,
            session: Some(session),
            healthy: true,
        }
    }

    /// Return a leased session. Unhealthy sessions are closed and their
    /// slot is refilled lazily by a later acquire.
    pub fn release(&self, lease: SessionLease<'_, F>, healthy: bool) {
        lease.release(healthy);
    }

    /// Run `op` on a leased session.
    ///
    /// The session is returned when `op` finishes, and discarded if the
    /// error it returned means the connection is gone.
    pub fn with_session<T>(
        &self,
        timeout: Duration,
        op: impl FnOnce(&mut F::Session) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let mut lease = self.acquire(timeout)?;
        let result = op(&mut *lease);
        if let Err(e) = &result
            && e.breaks_session()
        {
            lease.mark_broken();
        }
        result
    }

    fn put_back(&self, session: F::Session, healthy: bool) {
        let mut state = self.lock();
        state.leased = state.leased.saturating_sub(1);
        state.released += 1;

        let to_close = if healthy && !state.closed {
            state.idle.push(session);
            None
        } else {
            state.discarded += 1;
            Some(session)
        };
        drop(state);
        self.available.notify_one();

        if let Some(mut session) = to_close {
            session.logout();
        }
    }

    /// Log out every idle session. Leased sessions are closed when they
    /// come back.
    pub fn close(&self) {
        let idle = {
            let mut state = self.lock();
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.discarded += idle.len();
            idle
        };

        if !idle.is_empty() {
            debug!("Closing {} idle sessions", idle.len());
        }
        for mut session in idle {
            session.logout();
        }
        self.available.notify_all();
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            capacity: self.capacity,
            idle: state.idle.len(),
            leased: state.leased,
            created: state.created,
            discarded: state.discarded,
            peak_leased: state.peak_leased,
            acquired: state.acquired,
            released: state.released,
        }
    }
}

impl<F: SessionFactory> Drop for SessionPool<F> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Exclusive use of one pooled session.
///
/// The session goes back to the pool exactly once: on [`release`] or when
/// the lease is dropped. A lease marked broken is discarded instead.
///
/// [`release`]: SessionLease::release
pub struct SessionLease<'a, F: SessionFactory> {
    pool: &'a SessionPool<F>,
    session: Option<F::Session>,
    healthy: bool,
}

impl<F: SessionFactory> SessionLease<'_, F> {
    /// Mark the session as unusable so it is discarded on release
    pub fn mark_broken(&mut self) {
        self.healthy = false;
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Return the session to the pool now
    pub fn release(mut self, healthy: bool) {
        self.healthy = self.healthy && healthy;
        // Drop does the actual work
    }
}

impl<F: SessionFactory> Deref for SessionLease<'_, F> {
    type Target = F::Session;

    fn deref(&self) -> &Self::Target {
        self.session
            .as_ref()
            .expect("lease holds a session until released")
    }
}

impl<F: SessionFactory> DerefMut for SessionLease<'_, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
            .as_mut()
            .expect("lease holds a session until released")
    }
}

impl<F: SessionFactory> Drop for SessionLease<'_, F> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.put_back(session, self.healthy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MailSession, MemoryServer};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_sessions_are_reused() {
        let server = MemoryServer::new();
        let pool = SessionPool::new(server.clone(), 2);

        let lease = pool.acquire(WAIT).unwrap();
        drop(lease);
        let lease = pool.acquire(WAIT).unwrap();
        pool.release(lease, true);

        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.released, 2);
        assert_eq!(server.connects(), 1);
    }

    #[test]
    fn test_unhealthy_session_is_replaced() {
        let server = MemoryServer::new();
        let pool = SessionPool::new(server.clone(), 1);

        let mut lease = pool.acquire(WAIT).unwrap();
        lease.mark_broken();
        drop(lease);
        assert_eq!(pool.stats().discarded, 1);
        assert_eq!(pool.stats().idle, 0);

        let lease = pool.acquire(WAIT).unwrap();
        drop(lease);
        assert_eq!(server.connects(), 2);
        assert_eq!(server.logouts(), 1);
    }

    #[test]
    fn test_acquire_times_out_when_exhausted() {
        let pool = SessionPool::new(MemoryServer::new(), 1);
        let _held = pool.acquire(WAIT).unwrap();

        let result = pool.acquire(Duration::from_millis(20));
        assert!(matches!(result, Err(SessionError::PoolExhausted { .. })));
        assert_eq!(pool.stats().leased, 1);
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let pool = SessionPool::new(MemoryServer::new(), 1);
        let held = pool.acquire(WAIT).unwrap();

        thread::scope(|s| {
            let waiter = s.spawn(|| pool.acquire(WAIT).map(|_| ()));
            thread::sleep(Duration::from_millis(20));
            drop(held);
            assert!(waiter.join().unwrap().is_ok());
        });
        assert_eq!(pool.stats().created, 1);
    }

    #[test]
    fn test_auth_failure_is_fatal() {
        let server = MemoryServer::new();
        server.fail_auth("invalid credentials");
        let pool = SessionPool::new(server, 2);

        let err = pool.acquire(WAIT).err().unwrap();
        assert!(matches!(err, SessionError::Auth(_)));
        assert_eq!(pool.stats().leased, 0);
    }

    #[test]
    fn test_connect_failure_before_first_session_is_fatal() {
        let server = MemoryServer::new();
        server.fail_next_connect(SessionError::Connect("refused".into()));
        let pool = SessionPool::new(server, 2);

        let err = pool.acquire(WAIT).err().unwrap();
        assert!(matches!(err, SessionError::NoSessions(_)));
    }

    #[test]
    fn test_connect_failure_with_live_sessions_is_transient() {
        let server = MemoryServer::new();
        let pool = SessionPool::new(server.clone(), 2);
        let _held = pool.acquire(WAIT).unwrap();

        server.fail_next_connect(SessionError::Connect("refused".into()));
        let err = pool.acquire(WAIT).err().unwrap();
        assert!(err.is_transient());
        assert_eq!(pool.stats().leased, 1);
    }

    #[test]
    fn test_reconnect_failure_after_discard_is_transient() {
        let server = MemoryServer::new();
        let pool = SessionPool::new(server.clone(), 1);

        let mut lease = pool.acquire(WAIT).unwrap();
        lease.mark_broken();
        drop(lease);
        assert_eq!(pool.stats().idle + pool.stats().leased, 0);

        server.fail_next_connect(SessionError::Connect("refused".into()));
        let err = pool.acquire(WAIT).err().unwrap();
        assert!(matches!(err, SessionError::Connect(_)));
        assert!(err.is_transient());

        // The slot is free again and the next attempt reconnects
        assert!(pool.acquire(WAIT).is_ok());
        assert_eq!(pool.stats().created, 2);
    }

    #[test]
    fn test_failed_health_check_discards_idle_session() {
        let server = MemoryServer::new();
        let pool = SessionPool::new(server.clone(), 1);
        drop(pool.acquire(WAIT).unwrap());

        server.fail_next(
            crate::session::ServerOp::Noop,
            SessionError::ConnectionLost("idle timeout".into()),
        );
        let mut lease = pool.acquire(WAIT).unwrap();
        assert!(lease.noop().is_ok());
        drop(lease);

        assert_eq!(server.connects(), 2);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[test]
    fn test_never_exceeds_capacity_under_contention() {
        let server = MemoryServer::new();
        let pool = SessionPool::new(server.clone(), 3);
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        thread::scope(|s| {
            for _ in 0..12 {
                s.spawn(|| {
                    for _ in 0..20 {
                        let lease = pool.acquire(WAIT).unwrap();
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_micros(200));
                        active.fetch_sub(1, Ordering::SeqCst);
                        drop(lease);
                    }
                });
            }
        });

        let stats = pool.stats();
        assert!(max_seen.load(Ordering::SeqCst) <= 3);
        assert!(stats.peak_leased <= 3);
        assert!(stats.created <= 3);
        assert_eq!(stats.acquired, 240);
        assert_eq!(stats.released, 240);
        assert_eq!(stats.leased, 0);
        assert!(server.peak_concurrent_sessions() <= 3);
    }

    #[test]
    fn test_close_logs_out_idle_sessions() {
        let server = MemoryServer::new();
        let pool = SessionPool::new(server.clone(), 2);
        let a = pool.acquire(WAIT).unwrap();
        let b = pool.acquire(WAIT).unwrap();
        drop(a);

        pool.close();
        assert_eq!(server.logouts(), 1);

        // Leased sessions are closed when they come back
        drop(b);
        assert_eq!(server.logouts(), 2);
        assert_eq!(pool.stats().idle, 0);
    }
}
