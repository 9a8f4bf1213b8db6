//! On-hold coordination for chat rooms.
//!
//! A room placed on hold gets an auto-close timer armed under the key
//! `room:<id>`; resuming the room cancels the timer. Validation mirrors the
//! rules a hold transition must satisfy: the room must be open, the visitor
//! must not have sent the last message, and a room can be held only once.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{ActionError, DeferredAction, FireEvent, Scheduler, SchedulerError};

/// Error type for hold transitions
#[derive(Debug)]
pub enum HoldError {
    /// Room identifier was empty
    InvalidRoomId,
    /// Room is closed; nothing can be placed on or resumed from hold
    RoomClosed(String),
    /// The visitor sent the last message; the room must be answered, not held
    VisitorSentLastMessage(String),
    /// Room is already on hold
    AlreadyOnHold(String),
    /// Room is not on hold
    NotOnHold(String),
    /// Error acquiring lock for hold data
    LockError(String),
    /// Underlying scheduler failure
    Scheduler(SchedulerError),
}

impl fmt::Display for HoldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HoldError::InvalidRoomId => write!(f, "Invalid room id"),
            HoldError::RoomClosed(id) => write!(f, "Room {} is closed", id),
            HoldError::VisitorSentLastMessage(id) => {
                write!(f, "Room {} has an unanswered visitor message", id)
            }
            HoldError::AlreadyOnHold(id) => write!(f, "Room {} is already on hold", id),
            HoldError::NotOnHold(id) => write!(f, "Room {} is not on hold", id),
            HoldError::LockError(msg) => write!(f, "Lock error: {}", msg),
            HoldError::Scheduler(e) => write!(f, "Scheduler error: {}", e),
        }
    }
}

impl Error for HoldError {}

impl From<SchedulerError> for HoldError {
    fn from(err: SchedulerError) -> Self {
        HoldError::Scheduler(err)
    }
}

impl<T> From<PoisonError<T>> for HoldError {
    fn from(err: PoisonError<T>) -> Self {
        HoldError::LockError(format!("Lock poisoned: {}", err))
    }
}

/// The facts about a room a hold transition is validated against. Supplied by
/// the caller, which owns the room state.
#[derive(Clone, Debug)]
pub struct RoomFacts {
    pub id: String,
    pub open: bool,
    pub visitor_sent_last_message: bool,
}

impl RoomFacts {
    /// An open room with no unanswered visitor message.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            open: true,
            visitor_sent_last_message: false,
        }
    }

    pub fn closed(mut self) -> Self {
        self.open = false;
        self
    }

    pub fn with_visitor_last_message(mut self) -> Self {
        self.visitor_sent_last_message = true;
        self
    }
}

struct HoldRecord {
    since: DateTime<Utc>,
}

/// Clears the hold record before the caller's close action runs, so the fired
/// timer and the hold registry can never disagree.
struct AutoCloseAction {
    room_id: String,
    holds: Arc<Mutex<HashMap<String, HoldRecord>>>,
    inner: Arc<dyn DeferredAction>,
}

impl AutoCloseAction {
    fn clear_hold(&self) {
        if let Ok(mut holds) = self.holds.lock() {
            holds.remove(&self.room_id);
        }
    }
}

impl DeferredAction for AutoCloseAction {
    fn run(&self, event: FireEvent) -> Result<(), ActionError> {
        self.clear_hold();
        self.inner.run(event)
    }

    fn run_async<'a>(
        &'a self,
        event: FireEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), ActionError>> + Send + 'a>> {
        Box::pin(async move {
            self.clear_hold();
            self.inner.run_async(event).await
        })
    }
}

/// Coordinates on-hold state and the auto-close timers behind it.
pub struct HoldManager {
    scheduler: Arc<Scheduler>,
    holds: Arc<Mutex<HashMap<String, HoldRecord>>>,
}

impl HoldManager {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            holds: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn timer_key(room_id: &str) -> String {
        format!("room:{}", room_id)
    }

    /// Place a room on hold and arm its auto-close timer.
    ///
    /// `close_action` runs once if the hold is neither resumed nor released
    /// before `timeout` elapses; the hold record is cleared before it runs.
    pub fn place_on_hold(
        &self,
        facts: &RoomFacts,
        timeout: Duration,
        close_action: Box<dyn DeferredAction>,
    ) -> Result<(), HoldError> {
        let room_id = facts.id.trim();
        if room_id.is_empty() {
            return Err(HoldError::InvalidRoomId);
        }
        if !facts.open {
            return Err(HoldError::RoomClosed(room_id.to_string()));
        }
        if facts.visitor_sent_last_message {
            return Err(HoldError::VisitorSentLastMessage(room_id.to_string()));
        }

        {
            let mut holds = self.holds.lock()?;
            if holds.contains_key(room_id) {
                return Err(HoldError::AlreadyOnHold(room_id.to_string()));
            }
            holds.insert(room_id.to_string(), HoldRecord { since: Utc::now() });
        }

        let wrapper = AutoCloseAction {
            room_id: room_id.to_string(),
            holds: Arc::clone(&self.holds),
            inner: Arc::from(close_action),
        };

        if let Err(e) = self
            .scheduler
            .schedule(Self::timer_key(room_id), timeout, Box::new(wrapper))
        {
            if let Ok(mut holds) = self.holds.lock() {
                holds.remove(room_id);
            }
            return Err(HoldError::Scheduler(e));
        }

        debug!(room = %room_id, "room placed on hold");
        Ok(())
    }

    /// Resume a held room, cancelling its auto-close timer.
    pub fn resume_on_hold(&self, room_id: &str) -> Result<(), HoldError> {
        let room_id = room_id.trim();
        if room_id.is_empty() {
            return Err(HoldError::InvalidRoomId);
        }

        let removed = { self.holds.lock()?.remove(room_id) };
        if removed.is_none() {
            return Err(HoldError::NotOnHold(room_id.to_string()));
        }

        // Best-effort: a timer already mid-fire runs at most once
        let cancelled = self.scheduler.unschedule(&Self::timer_key(room_id))?;
        if !cancelled {
            debug!(room = %room_id, "auto-close timer already fired");
        }

        debug!(room = %room_id, "room resumed from hold");
        Ok(())
    }

    /// Drop any hold state for a room that closed through another path.
    /// Idempotent; returns whether a hold existed.
    pub fn release(&self, room_id: &str) -> bool {
        let existed = self
            .holds
            .lock()
            .map(|mut holds| holds.remove(room_id).is_some())
            .unwrap_or(false);
        let _ = self.scheduler.unschedule(&Self::timer_key(room_id));
        existed
    }

    pub fn is_on_hold(&self, room_id: &str) -> bool {
        self.holds
            .lock()
            .map(|holds| holds.contains_key(room_id))
            .unwrap_or(false)
    }

    /// When the room was placed on hold, if it currently is.
    pub fn held_since(&self, room_id: &str) -> Option<DateTime<Utc>> {
        self.holds
            .lock()
            .ok()
            .and_then(|holds| holds.get(room_id).map(|record| record.since))
    }

    pub fn held_count(&self) -> usize {
        self.holds.lock().map(|holds| holds.len()).unwrap_or(0)
    }
}

impl fmt::Debug for HoldManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HoldManager")
            .field("held_count", &self.held_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExecutionMode, ManualTimeSource, SchedulerConfig, action_fn};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> (HoldManager, Arc<Scheduler>, ManualTimeSource) {
        let clock = ManualTimeSource::starting_at(0);
        let scheduler = Arc::new(Scheduler::with_config(SchedulerConfig {
            thread_count: 2,
            store_capacity: 16,
            time_source: Some(Box::new(clock.clone())),
            rng_seed: None,
            execution_mode: ExecutionMode::Manual,
        }));
        (HoldManager::new(Arc::clone(&scheduler)), scheduler, clock)
    }

    fn close_counter(counter: Arc<AtomicUsize>) -> Box<dyn DeferredAction> {
        action_fn(move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_place_on_hold_arms_auto_close_timer() {
        let (manager, scheduler, _clock) = manager();
        let counter = Arc::new(AtomicUsize::new(0));

        manager
            .place_on_hold(
                &RoomFacts::new("r1"),
                Duration::from_millis(5000),
                close_counter(Arc::clone(&counter)),
            )
            .expect("Failed to place on hold");

        assert!(manager.is_on_hold("r1"));
        assert!(manager.held_since("r1").is_some());
        assert!(scheduler.is_scheduled("room:r1"));
        assert_eq!(manager.held_count(), 1);
    }

    #[test]
    fn test_place_on_hold_validation_chain() {
        let (manager, _scheduler, _clock) = manager();
        let noop = || close_counter(Arc::new(AtomicUsize::new(0)));
        let timeout = Duration::from_millis(1000);

        assert!(matches!(
            manager.place_on_hold(&RoomFacts::new(""), timeout, noop()),
            Err(HoldError::InvalidRoomId)
        ));
        assert!(matches!(
            manager.place_on_hold(&RoomFacts::new("r1").closed(), timeout, noop()),
            Err(HoldError::RoomClosed(_))
        ));
        assert!(matches!(
            manager.place_on_hold(
                &RoomFacts::new("r1").with_visitor_last_message(),
                timeout,
                noop()
            ),
            Err(HoldError::VisitorSentLastMessage(_))
        ));

        manager
            .place_on_hold(&RoomFacts::new("r1"), timeout, noop())
            .expect("Failed to place on hold");
        assert!(matches!(
            manager.place_on_hold(&RoomFacts::new("r1"), timeout, noop()),
            Err(HoldError::AlreadyOnHold(_))
        ));
    }

    #[test]
    fn test_resume_cancels_auto_close() {
        let (manager, scheduler, clock) = manager();
        let counter = Arc::new(AtomicUsize::new(0));

        manager
            .place_on_hold(
                &RoomFacts::new("r7"),
                Duration::from_millis(5000),
                close_counter(Arc::clone(&counter)),
            )
            .expect("Failed to place on hold");

        clock.advance(Duration::from_millis(100));
        manager.resume_on_hold("r7").expect("Failed to resume");

        assert!(!manager.is_on_hold("r7"));
        assert!(!scheduler.is_scheduled("room:r7"));

        clock.advance(Duration::from_millis(5900));
        scheduler.run_pending().expect("run_pending failed");
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        assert!(matches!(
            manager.resume_on_hold("r7"),
            Err(HoldError::NotOnHold(_))
        ));
    }

    #[test]
    fn test_auto_close_fires_once_and_clears_hold() {
        let (manager, scheduler, clock) = manager();
        let counter = Arc::new(AtomicUsize::new(0));

        manager
            .place_on_hold(
                &RoomFacts::new("r42"),
                Duration::from_millis(1000),
                close_counter(Arc::clone(&counter)),
            )
            .expect("Failed to place on hold");

        clock.advance(Duration::from_millis(1100));
        scheduler.run_pending().expect("run_pending failed");

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!manager.is_on_hold("r42"));
        assert!(!scheduler.is_scheduled("room:r42"));

        // The room can go on hold again after closing out
        manager
            .place_on_hold(
                &RoomFacts::new("r42"),
                Duration::from_millis(1000),
                close_counter(Arc::clone(&counter)),
            )
            .expect("Failed to place on hold again");
        assert!(manager.is_on_hold("r42"));
    }

    #[test]
    fn test_rehold_replaces_prior_timer_after_release() {
        let (manager, scheduler, clock) = manager();
        let counter = Arc::new(AtomicUsize::new(0));

        manager
            .place_on_hold(
                &RoomFacts::new("r2"),
                Duration::from_millis(2000),
                close_counter(Arc::clone(&counter)),
            )
            .expect("Failed to place on hold");

        assert!(manager.release("r2"));
        assert!(!manager.release("r2"));
        assert!(!scheduler.is_scheduled("room:r2"));

        clock.advance(Duration::from_millis(3000));
        scheduler.run_pending().expect("run_pending failed");
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
