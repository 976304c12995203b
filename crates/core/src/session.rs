//! Per-user runtime state and the store that owns it.
//!
//! This is deliberately ephemeral: a process restart resets every practice in
//! flight. The persisted session record is the authority for history, the
//! in-memory phase here is the authority for routing — the two are never
//! conflated (see the transition rules in `practice`).

use crate::backend::SessionId;
use crate::event::{ChatId, MessageId, UserId};
use crate::timer::TimerHandle;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::time::Instant;

/// Where a user currently is in the listening cycle.
///
/// `Idle` is represented by the *absence* of a [`SessionRuntimeState`] entry;
/// the store materializes it in [`SessionStore::phase`] so callers can match
/// on all three positions uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ListeningInProgress,
    AwaitingAnswer,
}

/// Volatile state of one user's practice in flight.
///
/// Owns the timer handles for that practice, so dropping or superseding the
/// state without cancelling them is a bug the state machine must not commit.
#[derive(Debug)]
pub struct SessionRuntimeState {
    pub phase: Phase,
    pub session_id: SessionId,
    pub chat: ChatId,
    /// Monotonic start of the listening window; drives the visible timer.
    pub timer_started_at: Instant,
    /// The message edited in place to show elapsed time.
    pub timer_message: MessageId,
    /// Instruction message retracted once the listening phase ends.
    pub instruction_message: Option<MessageId>,
    pub tick_timer: Option<TimerHandle>,
    pub deadline_timer: Option<TimerHandle>,
}

impl SessionRuntimeState {
    /// Cancels any timers still owned by this state. Always called before the
    /// state is discarded, so no orphaned tick task outlives its practice.
    pub fn cancel_timers(&mut self) {
        if let Some(handle) = self.tick_timer.take() {
            handle.cancel();
        }
        if let Some(handle) = self.deadline_timer.take() {
            handle.cancel();
        }
    }
}

/// Concurrency-safe map from user to runtime state, at most one entry per user.
///
/// The single authority the state machine consults before acting on any event.
/// Operations are atomic per key; the lock is never held across an await.
#[derive(Debug, Default)]
pub struct SessionStore {
    inner: Mutex<HashMap<UserId, SessionRuntimeState>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase for the user, `Idle` when no practice is in flight.
    pub fn phase(&self, user: UserId) -> Phase {
        self.inner
            .lock()
            .expect("session store lock poisoned")
            .get(&user)
            .map(|state| state.phase)
            .unwrap_or(Phase::Idle)
    }

    /// Installs the state for a user, returning any superseded state so the
    /// caller can cancel its timers.
    pub fn put(&self, user: UserId, state: SessionRuntimeState) -> Option<SessionRuntimeState> {
        self.inner
            .lock()
            .expect("session store lock poisoned")
            .insert(user, state)
    }

    /// Removes and returns the state, leaving the user `Idle`.
    pub fn take(&self, user: UserId) -> Option<SessionRuntimeState> {
        self.inner
            .lock()
            .expect("session store lock poisoned")
            .remove(&user)
    }

    /// Read access without taking ownership.
    pub fn with<R>(&self, user: UserId, f: impl FnOnce(&SessionRuntimeState) -> R) -> Option<R> {
        self.inner
            .lock()
            .expect("session store lock poisoned")
            .get(&user)
            .map(f)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("session store lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(phase: Phase) -> SessionRuntimeState {
        SessionRuntimeState {
            phase,
            session_id: SessionId("s-1".to_string()),
            chat: ChatId(7),
            timer_started_at: Instant::now(),
            timer_message: MessageId(100),
            instruction_message: None,
            tick_timer: None,
            deadline_timer: None,
        }
    }

    #[tokio::test]
    async fn absent_user_is_idle() {
        let store = SessionStore::new();
        assert_eq!(store.phase(UserId(1)), Phase::Idle);
    }

    #[tokio::test]
    async fn put_supersedes_previous_state() {
        let store = SessionStore::new();
        assert!(store.put(UserId(1), state(Phase::ListeningInProgress)).is_none());
        let old = store.put(UserId(1), state(Phase::ListeningInProgress));
        assert!(old.is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn take_leaves_user_idle() {
        let store = SessionStore::new();
        store.put(UserId(1), state(Phase::AwaitingAnswer));
        assert_eq!(store.phase(UserId(1)), Phase::AwaitingAnswer);
        assert!(store.take(UserId(1)).is_some());
        assert_eq!(store.phase(UserId(1)), Phase::Idle);
        assert!(store.take(UserId(1)).is_none());
    }
}
