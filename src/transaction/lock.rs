//! Session locks
//!
//! Every table and every database owns one [`SessionLock`]: a shared /
//! exclusive lock whose holders are session ids. Locks are re-entrant per
//! session and a session may hold S and X at the same time (an upgrade adds
//! the X entry next to the S entry). Nothing is downgraded or released before
//! the session commits.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Session identifier
pub type SessionId = u64;

/// How often a cancellable or bounded wait re-checks its exit conditions
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Lock Mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Default)]
struct CancelState {
    /// Waits currently blocked with this token
    waiting: usize,
    cancelled: bool,
}

/// Interrupt handle for a session's blocked lock waits. Cancelling only
/// affects waits that are blocked at that moment.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<Mutex<CancelState>>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupt the waits currently blocked with this token. Returns false
    /// when there were none.
    pub fn cancel(&self) -> bool {
        let mut state = self.0.lock();
        if state.waiting == 0 {
            return false;
        }
        state.cancelled = true;
        true
    }

    fn register(&self) -> WaitRegistration<'_> {
        self.0.lock().waiting += 1;
        WaitRegistration { token: self }
    }
}

/// A blocked wait, deregistered on drop
struct WaitRegistration<'a> {
    token: &'a CancelToken,
}

impl WaitRegistration<'_> {
    fn is_cancelled(&self) -> bool {
        self.token.0.lock().cancelled
    }
}

impl Drop for WaitRegistration<'_> {
    fn drop(&mut self) {
        let mut state = self.token.0.lock();
        state.waiting -= 1;
        if state.waiting == 0 {
            state.cancelled = false;
        }
    }
}

/// Limits on how long an acquisition may block
#[derive(Debug, Clone, Default)]
pub struct LockWait {
    pub cancel: Option<CancelToken>,
    pub timeout: Option<Duration>,
}

impl LockWait {
    /// Block until granted
    pub fn forever() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn is_unbounded(&self) -> bool {
        self.cancel.is_none() && self.timeout.is_none()
    }
}

#[derive(Debug, Default)]
struct Holders {
    shared: HashSet<SessionId>,
    exclusive: HashSet<SessionId>,
}

/// True when nobody but `session` is in `set`
fn held_only_by(set: &HashSet<SessionId>, session: SessionId) -> bool {
    set.is_empty() || (set.len() == 1 && set.contains(&session))
}

impl Holders {
    fn can_grant(&self, session: SessionId, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => held_only_by(&self.exclusive, session),
            LockMode::Exclusive => {
                held_only_by(&self.exclusive, session) && held_only_by(&self.shared, session)
            }
        }
    }

    fn grant(&mut self, session: SessionId, mode: LockMode) {
        match mode {
            LockMode::Shared => self.shared.insert(session),
            LockMode::Exclusive => self.exclusive.insert(session),
        };
    }
}

/// Shared/exclusive lock keyed by session, obeying strict 2PL
#[derive(Debug)]
pub struct SessionLock {
    /// Resource name used in errors and logs
    resource: String,
    holders: Mutex<Holders>,
    released: Condvar,
}

impl SessionLock {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            holders: Mutex::new(Holders::default()),
            released: Condvar::new(),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Acquire a shared lock, blocking while another session holds X
    pub fn s_acquire(&self, session: SessionId) -> Result<()> {
        self.acquire(session, LockMode::Shared, &LockWait::forever())
    }

    /// Acquire an exclusive lock, blocking while another session holds S or X
    pub fn x_acquire(&self, session: SessionId) -> Result<()> {
        self.acquire(session, LockMode::Exclusive, &LockWait::forever())
    }

    /// Acquire in `mode`. An interrupted or timed out wait grants nothing.
    pub fn acquire(&self, session: SessionId, mode: LockMode, wait: &LockWait) -> Result<()> {
        let deadline = wait.timeout.map(|t| Instant::now() + t);
        let mut registration = None;
        let mut holders = self.holders.lock();

        while !holders.can_grant(session, mode) {
            tracing::debug!(
                "session {} waits for {:?} lock on '{}'",
                session,
                mode,
                self.resource
            );
            if wait.is_unbounded() {
                self.released.wait(&mut holders);
                continue;
            }
            if let Some(token) = &wait.cancel {
                let registration = registration.get_or_insert_with(|| token.register());
                if registration.is_cancelled() {
                    return Err(Error::LockInterrupted(self.resource.clone()));
                }
            }
            let mut slice = POLL_INTERVAL;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::LockTimeout(self.resource.clone()));
                }
                slice = slice.min(deadline - now);
            }
            self.released.wait_for(&mut holders, slice);
        }

        holders.grant(session, mode);
        tracing::trace!("session {} holds {:?} on '{}'", session, mode, self.resource);
        Ok(())
    }

    pub fn s_release(&self, session: SessionId) {
        self.holders.lock().shared.remove(&session);
        self.released.notify_all();
    }

    pub fn x_release(&self, session: SessionId) {
        self.holders.lock().exclusive.remove(&session);
        self.released.notify_all();
    }

    /// Drop every hold `session` has on this resource
    pub fn release_all(&self, session: SessionId) {
        {
            let mut holders = self.holders.lock();
            holders.shared.remove(&session);
            holders.exclusive.remove(&session);
        }
        tracing::trace!("session {} released '{}'", session, self.resource);
        self.released.notify_all();
    }

    /// Does `session` currently hold this lock in `mode`?
    pub fn is_held_by(&self, session: SessionId, mode: LockMode) -> bool {
        let holders = self.holders.lock();
        match mode {
            LockMode::Shared => holders.shared.contains(&session),
            LockMode::Exclusive => holders.exclusive.contains(&session),
        }
    }

    /// No session holds anything
    pub fn is_free(&self) -> bool {
        let holders = self.holders.lock();
        holders.shared.is_empty() && holders.exclusive.is_empty()
    }
}
