//! One-shot and repeating timers that fire back into the event pipeline.
//!
//! A fire does nothing but emit an [`Event`] on the same channel the chat
//! transport feeds, so timer-driven mutation goes through the dispatcher like
//! everything else. Cancellation is a typed operation on an owned
//! [`TimerHandle`], not a name lookup; handles live inside the session runtime
//! state that scheduled them.

use crate::event::{Event, UserId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{Instant, interval_at, sleep};

/// Timer identity, derived from the user so at most one repeating timer and
/// one deadline can exist per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Tick(UserId),
    Deadline(UserId),
}

#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    /// The caller must cancel the existing timer before scheduling a new one
    /// under the same key.
    #[error("a timer is already scheduled under {0:?}")]
    KeyBusy(TimerKey),
}

type Registry = Arc<Mutex<HashMap<TimerKey, AbortHandle>>>;

/// Owned proof of a scheduled timer. Cancelling aborts the backing task and
/// frees the key; a tick already in flight is neutralized by the phase check
/// in the state machine, never here.
#[derive(Debug)]
pub struct TimerHandle {
    key: TimerKey,
    registry: Registry,
}

impl TimerHandle {
    pub fn cancel(self) {
        let mut registry = self.registry.lock().expect("timer registry lock poisoned");
        if let Some(abort) = registry.remove(&self.key) {
            abort.abort();
        }
    }
}

/// Schedules timers and routes their fires into the shared event channel.
#[derive(Debug, Clone)]
pub struct TimerService {
    events: mpsc::Sender<Event>,
    registry: Registry,
}

impl TimerService {
    pub fn new(events: mpsc::Sender<Event>) -> Self {
        Self {
            events,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fires `event` once after `delay`, then frees the key.
    pub fn schedule_once(
        &self,
        key: TimerKey,
        delay: Duration,
        event: Event,
    ) -> Result<TimerHandle, TimerError> {
        let events = self.events.clone();
        let registry = self.registry.clone();
        self.register(key, move || {
            tokio::spawn(async move {
                sleep(delay).await;
                if events.send(event).await.is_err() {
                    tracing::warn!(?key, "event channel closed, dropping timer fire");
                }
                registry
                    .lock()
                    .expect("timer registry lock poisoned")
                    .remove(&key);
            })
            .abort_handle()
        })
    }

    /// Fires `event` every `interval`, the first fire after `first_delay`.
    pub fn schedule_repeating(
        &self,
        key: TimerKey,
        interval: Duration,
        first_delay: Duration,
        event: Event,
    ) -> Result<TimerHandle, TimerError> {
        let events = self.events.clone();
        self.register(key, move || {
            tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + first_delay, interval);
                loop {
                    ticker.tick().await;
                    if events.send(event.clone()).await.is_err() {
                        tracing::warn!(?key, "event channel closed, stopping timer");
                        break;
                    }
                }
            })
            .abort_handle()
        })
    }

    /// True while a timer is scheduled under `key`.
    pub fn is_active(&self, key: TimerKey) -> bool {
        self.registry
            .lock()
            .expect("timer registry lock poisoned")
            .contains_key(&key)
    }

    fn register(
        &self,
        key: TimerKey,
        spawn: impl FnOnce() -> AbortHandle,
    ) -> Result<TimerHandle, TimerError> {
        use std::collections::hash_map::Entry;
        let mut registry = self.registry.lock().expect("timer registry lock poisoned");
        match registry.entry(key) {
            Entry::Occupied(_) => Err(TimerError::KeyBusy(key)),
            Entry::Vacant(slot) => {
                slot.insert(spawn());
                Ok(TimerHandle {
                    key,
                    registry: self.registry.clone(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChatId;

    fn tick_event() -> Event {
        Event::Tick {
            user: UserId(1),
            chat: ChatId(1),
        }
    }

    async fn settle() {
        // Give the spawned timer task a chance to run after the clock moves.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_timer_fires_once_per_interval() {
        let (tx, mut rx) = mpsc::channel(16);
        let service = TimerService::new(tx);
        let key = TimerKey::Tick(UserId(1));
        let handle = service
            .schedule_repeating(key, Duration::from_secs(15), Duration::from_secs(15), tick_event())
            .unwrap();
        // The spawned task must register its deadline before the clock moves.
        settle().await;

        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;

        let mut fires = 0;
        while rx.try_recv().is_ok() {
            fires += 1;
        }
        assert_eq!(fires, 2);
        handle.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::channel(16);
        let service = TimerService::new(tx);
        let key = TimerKey::Tick(UserId(1));
        let handle = service
            .schedule_repeating(key, Duration::from_secs(15), Duration::from_secs(15), tick_event())
            .unwrap();
        handle.cancel();
        assert!(!service.is_active(key));

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn double_schedule_under_one_key_is_rejected() {
        let (tx, _rx) = mpsc::channel(16);
        let service = TimerService::new(tx);
        let key = TimerKey::Tick(UserId(1));
        let handle = service
            .schedule_repeating(key, Duration::from_secs(15), Duration::from_secs(15), tick_event())
            .unwrap();
        assert!(matches!(
            service.schedule_repeating(
                key,
                Duration::from_secs(15),
                Duration::from_secs(15),
                tick_event()
            ),
            Err(TimerError::KeyBusy(_))
        ));
        // Freed after cancel.
        handle.cancel();
        let handle = service
            .schedule_repeating(key, Duration::from_secs(15), Duration::from_secs(15), tick_event())
            .unwrap();
        handle.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_once_and_frees_its_key() {
        let (tx, mut rx) = mpsc::channel(16);
        let service = TimerService::new(tx);
        let key = TimerKey::Deadline(UserId(1));
        let _handle = service
            .schedule_once(
                key,
                Duration::from_secs(300),
                Event::ListeningDeadline {
                    user: UserId(1),
                    chat: ChatId(1),
                },
            )
            .unwrap();
        assert!(service.is_active(key));
        // The spawned task must register its deadline before the clock moves.
        settle().await;

        tokio::time::advance(Duration::from_secs(301)).await;
        settle().await;

        assert!(matches!(rx.try_recv(), Ok(Event::ListeningDeadline { .. })));
        assert!(rx.try_recv().is_err());
        assert!(!service.is_active(key));
    }
}
