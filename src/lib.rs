use rand::prelude::*;
#[cfg(not(feature = "crypto_rand"))]
use rand::rngs::StdRng;
#[cfg(feature = "crypto_rand")]
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use threadpool::ThreadPool;
use tracing::{debug, error, warn};
use uuid::Uuid;

mod execution_mode;
pub mod hold;
pub mod routing;

pub use execution_mode::ExecutionMode;

/// Error type for scheduler operations
#[derive(Debug)]
pub enum SchedulerError {
    /// Key was empty or otherwise unusable
    InvalidKey(String),
    /// Error acquiring lock for internal data
    LockError(String),
    /// Error with time source
    TimeError(String),
    /// Error during serialization
    SerializationError(String),
    /// Other error
    Other(String),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::InvalidKey(msg) => write!(f, "Invalid key: {}", msg),
            SchedulerError::LockError(msg) => write!(f, "Lock error: {}", msg),
            SchedulerError::TimeError(msg) => write!(f, "Time error: {}", msg),
            SchedulerError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            SchedulerError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl Error for SchedulerError {}

// Convert poison errors to scheduler errors
impl<T> From<PoisonError<T>> for SchedulerError {
    fn from(err: PoisonError<T>) -> Self {
        SchedulerError::LockError(format!("Lock poisoned: {}", err))
    }
}

/// Error produced by a fired action. Caught and logged, never propagated.
pub type ActionError = Box<dyn Error + Send + Sync>;

// ----------------- SECTION 1: Core Types -----------------

/// A pending one-shot deferral for a single key.
///
/// Owned exclusively by the scheduler: created on `schedule`, destroyed when
/// the timer fires or the key is unscheduled. The generation token identifies
/// this particular arming; a replacement carries a higher generation, so a
/// superseded timer can detect it must not fire.
#[derive(Clone, Debug)]
pub struct Deferral {
    key: String,
    generation: u64,
    due_at: u64,
    scheduled_at: u64,
    action_id: Option<String>,
    ephemeral_action: bool,
    reschedule_count: u64,
    metadata: HashMap<String, String>,
}

impl Deferral {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Milliseconds since the UNIX epoch at which this deferral is due.
    pub fn due_at(&self) -> u64 {
        self.due_at
    }

    pub fn scheduled_at(&self) -> u64 {
        self.scheduled_at
    }

    /// How many times the key was re-armed while an entry was already pending.
    pub fn reschedule_count(&self) -> u64 {
        self.reschedule_count
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }
}

/// Event handed to an action when its deferral fires.
#[derive(Clone, Debug)]
pub struct FireEvent {
    pub key: String,
    pub generation: u64,
    pub scheduled_at: u64,
    pub fired_at: u64,
    pub reschedule_count: u64,
    pub metadata: HashMap<String, String>,
}

impl FireEvent {
    fn from_deferral(deferral: &Deferral, fired_at: u64) -> Self {
        FireEvent {
            key: deferral.key.clone(),
            generation: deferral.generation,
            scheduled_at: deferral.scheduled_at,
            fired_at,
            reschedule_count: deferral.reschedule_count,
            metadata: deferral.metadata.clone(),
        }
    }
}

/// Mutex-guarded registry mapping each key to at most one pending deferral.
///
/// All mutation goes through this single lock; nothing blocking runs while it
/// is held.
struct DeferralStore {
    entries: Mutex<HashMap<String, Deferral>>,
}

impl DeferralStore {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Insert a deferral, replacing any prior entry for the key. The new entry
    /// inherits the prior entry's reschedule count plus one.
    fn arm(&self, mut deferral: Deferral) -> Result<Option<Deferral>, SchedulerError> {
        let mut entries = self.entries.lock()?;
        if let Some(prior) = entries.get(&deferral.key) {
            deferral.reschedule_count = prior.reschedule_count + 1;
        }
        Ok(entries.insert(deferral.key.clone(), deferral))
    }

    fn remove(&self, key: &str) -> Result<Option<Deferral>, SchedulerError> {
        let mut entries = self.entries.lock()?;
        Ok(entries.remove(key))
    }

    /// Remove the entry for `key` only if it still carries `generation`.
    /// A mismatch means the entry was replaced after the caller observed it.
    fn remove_if_generation(
        &self,
        key: &str,
        generation: u64,
    ) -> Result<Option<Deferral>, SchedulerError> {
        let mut entries = self.entries.lock()?;
        match entries.get(key) {
            Some(current) if current.generation == generation => Ok(entries.remove(key)),
            _ => Ok(None),
        }
    }

    fn get(&self, key: &str) -> Result<Option<Deferral>, SchedulerError> {
        let entries = self.entries.lock()?;
        Ok(entries.get(key).cloned())
    }

    fn contains_key(&self, key: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains_key(key))
            .unwrap_or(false)
    }

    fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    /// Keys and generations of every entry due at or before `now`.
    fn due_before(&self, now: u64) -> Result<Vec<(String, u64)>, SchedulerError> {
        let entries = self.entries.lock()?;
        Ok(entries
            .values()
            .filter(|deferral| deferral.due_at <= now)
            .map(|deferral| (deferral.key.clone(), deferral.generation))
            .collect())
    }

    fn next_due(&self) -> Result<Option<u64>, SchedulerError> {
        let entries = self.entries.lock()?;
        Ok(entries.values().map(|deferral| deferral.due_at).min())
    }

    fn snapshot(&self) -> Result<Vec<Deferral>, SchedulerError> {
        let entries = self.entries.lock()?;
        Ok(entries.values().cloned().collect())
    }

    fn drain(&self) -> Result<Vec<Deferral>, SchedulerError> {
        let mut entries = self.entries.lock()?;
        Ok(entries.drain().map(|(_, deferral)| deferral).collect())
    }
}

/// Configuration options for customizing scheduler behavior.
pub struct SchedulerConfig {
    /// Number of threads to use in the worker pool
    pub thread_count: usize,
    /// Initial capacity for the deferral registry
    pub store_capacity: usize,
    /// Custom time source, if not specified a default will be used
    pub time_source: Option<Box<dyn TimeSource>>,
    /// RNG seed for deterministic jitter (if None, uses system random)
    pub rng_seed: Option<u64>,
    /// How the engine is driven
    pub execution_mode: ExecutionMode,
}

impl Clone for SchedulerConfig {
    fn clone(&self) -> Self {
        Self {
            thread_count: self.thread_count,
            store_capacity: self.store_capacity,
            time_source: None, // We don't clone time sources
            rng_seed: self.rng_seed,
            execution_mode: self.execution_mode,
        }
    }
}

impl fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("thread_count", &self.thread_count)
            .field("store_capacity", &self.store_capacity)
            .field("time_source", &"<TimeSource>")
            .field("rng_seed", &self.rng_seed)
            .field("execution_mode", &self.execution_mode)
            .finish()
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thread_count: std::cmp::max(4, num_cpus::get()),
            store_capacity: 64,
            time_source: None,
            rng_seed: None,
            execution_mode: ExecutionMode::default(),
        }
    }
}

/// A scheduler for keyed one-shot deferred actions.
///
/// Each key holds at most one pending deferral. Scheduling an already-pending
/// key replaces the prior entry; the replaced timer can never fire.
pub struct Scheduler {
    deferrals: Arc<DeferralStore>,
    actions: Arc<Mutex<HashMap<String, Arc<dyn DeferredAction>>>>,
    time_source: Arc<Box<dyn TimeSource>>,
    running: Arc<AtomicBool>,
    last_tick: Arc<AtomicU64>,
    generation: Arc<AtomicU64>,
    thread_pool: Arc<ThreadPool>,
    execution_mode: ExecutionMode,
    #[cfg(feature = "crypto_rand")]
    rng: Arc<Mutex<Option<ChaCha8Rng>>>,
    #[cfg(not(feature = "crypto_rand"))]
    rng: Arc<Mutex<Option<StdRng>>>,
}

/// Serializable representation of a pending deferral.
#[derive(Serialize, Deserialize)]
struct SerializedDeferral {
    key: String,
    generation: u64,
    due_at: u64,
    scheduled_at: u64,
    action_id: Option<String>,
    ephemeral_action: bool,
    reschedule_count: u64,
    metadata: HashMap<String, String>,
}

/// Serializable scheduler state for persistence.
///
/// Only the registry is captured; actions themselves are code and must be
/// re-registered before restored deferrals can fire.
#[derive(Serialize, Deserialize)]
pub struct SchedulerState {
    deferrals: Vec<SerializedDeferral>,
    last_tick_time: u64,
}

impl SchedulerState {
    pub fn to_json(&self) -> Result<String, SchedulerError> {
        serde_json::to_string(self).map_err(|e| SchedulerError::SerializationError(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, SchedulerError> {
        serde_json::from_str(raw).map_err(|e| SchedulerError::SerializationError(e.to_string()))
    }

    pub fn pending_count(&self) -> usize {
        self.deferrals.len()
    }
}

// ----------------- SECTION 2: Traits -----------------

/// A unit of work scheduled to run once after a delay unless cancelled or
/// superseded.
pub trait DeferredAction: Send + Sync {
    /// Run the action synchronously.
    fn run(&self, event: FireEvent) -> Result<(), ActionError>;

    /// Run the action asynchronously.
    fn run_async<'a>(
        &'a self,
        event: FireEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), ActionError>> + Send + 'a>>;
}

/// Source of time for the scheduler.
pub trait TimeSource: Send + Sync {
    /// Get the current time in milliseconds since the UNIX epoch.
    fn now(&self) -> Result<u64, SchedulerError>;

    /// Whether this source is monotonic
    fn is_monotonic(&self) -> bool;
}

// ----------------- SECTION 3: Implementations -----------------

fn validate_key(key: &str) -> Result<(), SchedulerError> {
    if key.trim().is_empty() {
        return Err(SchedulerError::InvalidKey(
            "key must be non-empty".to_string(),
        ));
    }
    Ok(())
}

/// Resolve the action for a fired deferral. Ephemeral actions (inline
/// closures) are removed from the registry here, since they can fire only once.
fn take_handler(
    actions: &Mutex<HashMap<String, Arc<dyn DeferredAction>>>,
    deferral: &Deferral,
) -> Option<Arc<dyn DeferredAction>> {
    let action_id = deferral.action_id.as_deref()?;
    match actions.lock() {
        Ok(mut registry) => {
            if deferral.ephemeral_action {
                registry.remove(action_id)
            } else {
                registry.get(action_id).cloned()
            }
        }
        Err(e) => {
            warn!(error = %e, "action registry lock poisoned");
            None
        }
    }
}

/// Execute a fired action, containing both errors and panics.
fn execute_action(handler: Arc<dyn DeferredAction>, event: FireEvent) {
    let key = event.key.clone();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler.run(event)));
    match result {
        Ok(Ok(())) => debug!(key = %key, "deferred action completed"),
        Ok(Err(e)) => error!(key = %key, error = %e, "deferred action failed"),
        Err(_) => error!(key = %key, "deferred action panicked"),
    }
}

impl Scheduler {
    /// Create a new scheduler with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new scheduler with custom configuration.
    pub fn with_config(config: SchedulerConfig) -> Self {
        let time_source: Box<dyn TimeSource> = match config.time_source {
            Some(source) => source,
            None => match MonotonicTimeSource::new() {
                Ok(source) => Box::new(source),
                Err(e) => {
                    warn!(error = %e, "falling back to system time source");
                    Box::new(SystemTimeSource)
                }
            },
        };

        #[cfg(feature = "crypto_rand")]
        let rng = config.rng_seed.map(ChaCha8Rng::seed_from_u64);
        #[cfg(not(feature = "crypto_rand"))]
        let rng = config.rng_seed.map(StdRng::seed_from_u64);

        Scheduler {
            deferrals: Arc::new(DeferralStore::with_capacity(config.store_capacity)),
            actions: Arc::new(Mutex::new(HashMap::with_capacity(config.store_capacity))),
            time_source: Arc::new(time_source),
            running: Arc::new(AtomicBool::new(false)),
            last_tick: Arc::new(AtomicU64::new(0)),
            generation: Arc::new(AtomicU64::new(0)),
            thread_pool: Arc::new(ThreadPool::new(config.thread_count.max(1))),
            execution_mode: config.execution_mode,
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    /// Register `action` to run once after `delay` has elapsed from now.
    ///
    /// If `key` already has a pending deferral, the old timer is cancelled
    /// first; there is no double-fire and no leaked timer. A zero delay means
    /// already due: the action fires on the next tick.
    pub fn schedule(
        &self,
        key: impl Into<String>,
        delay: Duration,
        action: Box<dyn DeferredAction>,
    ) -> Result<(), SchedulerError> {
        let key = key.into();
        validate_key(&key)?;
        let action_id = format!("action_{}", Uuid::new_v4());
        self.actions
            .lock()?
            .insert(action_id.clone(), Arc::from(action));
        self.arm(key, delay, None, Some(action_id), true, HashMap::new())
    }

    /// Like `schedule`, but referencing an action registered up front with
    /// `register_action`. The id may dangle; firing then logs and drops.
    pub fn schedule_action(
        &self,
        key: impl Into<String>,
        delay: Duration,
        action_id: impl Into<String>,
    ) -> Result<(), SchedulerError> {
        let key = key.into();
        validate_key(&key)?;
        self.arm(
            key,
            delay,
            None,
            Some(action_id.into()),
            false,
            HashMap::new(),
        )
    }

    /// Start building a deferral for `key` with the given delay.
    pub fn defer(&self, key: impl Into<String>, delay: Duration) -> DeferralBuilder<'_> {
        DeferralBuilder::new(self, key, delay)
    }

    /// Arm a pre-built deferral request.
    pub fn submit(&self, request: DeferralRequest) -> Result<(), SchedulerError> {
        validate_key(&request.key)?;
        self.arm(
            request.key,
            request.delay,
            request.jitter,
            request.action_id,
            false,
            request.metadata,
        )
    }

    fn arm(
        &self,
        key: String,
        delay: Duration,
        jitter: Option<Duration>,
        action_id: Option<String>,
        ephemeral: bool,
        metadata: HashMap<String, String>,
    ) -> Result<(), SchedulerError> {
        let now = self.time_source.now()?;
        let jitter_ms = match jitter {
            Some(jitter) => self.sample_jitter(jitter),
            None => 0,
        };
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let deferral = Deferral {
            key,
            generation,
            due_at: now + delay.as_millis() as u64 + jitter_ms,
            scheduled_at: now,
            action_id,
            ephemeral_action: ephemeral,
            reschedule_count: 0,
            metadata,
        };

        let replaced = self.deferrals.arm(deferral)?;
        if let Some(prior) = replaced {
            debug!(key = %prior.key, generation = prior.generation, "replaced pending deferral");
            self.discard_ephemeral(&prior);
        }
        Ok(())
    }

    fn sample_jitter(&self, jitter: Duration) -> u64 {
        let bound = jitter.as_millis() as u64;
        if bound == 0 {
            return 0;
        }
        if let Ok(mut rng_guard) = self.rng.lock() {
            if let Some(rng) = rng_guard.as_mut() {
                // Use deterministic RNG if configured
                return rng.gen_range(0..bound);
            }
        }
        thread_rng().gen_range(0..bound)
    }

    /// Cancel the pending deferral for `key`, returning whether one existed.
    ///
    /// Unscheduling an absent key is a no-op returning `Ok(false)`. If the
    /// timer is already mid-fire the action may still run once, but never
    /// twice.
    pub fn unschedule(&self, key: &str) -> Result<bool, SchedulerError> {
        validate_key(key)?;
        match self.deferrals.remove(key)? {
            Some(prior) => {
                self.discard_ephemeral(&prior);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether `key` currently has a pending deferral.
    pub fn is_scheduled(&self, key: &str) -> bool {
        self.deferrals.contains_key(key)
    }

    /// Due time (ms since epoch) of the pending deferral for `key`, if any.
    pub fn deadline(&self, key: &str) -> Option<u64> {
        self.deferrals.get(key).ok().flatten().map(|d| d.due_at)
    }

    pub fn pending_count(&self) -> usize {
        self.deferrals.len()
    }

    /// Snapshot of every pending deferral.
    pub fn pending_deferrals(&self) -> Vec<Deferral> {
        self.deferrals.snapshot().unwrap_or_default()
    }

    fn discard_ephemeral(&self, deferral: &Deferral) {
        if !deferral.ephemeral_action {
            return;
        }
        if let (Some(action_id), Ok(mut registry)) =
            (deferral.action_id.as_deref(), self.actions.lock())
        {
            registry.remove(action_id);
        }
    }

    /// Register a named action that deferrals can reference by id.
    pub fn register_action(
        &self,
        id: impl Into<String>,
        action: Box<dyn DeferredAction>,
    ) -> Result<(), SchedulerError> {
        self.actions.lock()?.insert(id.into(), Arc::from(action));
        Ok(())
    }

    /// Remove a named action, returning whether it was registered.
    pub fn unregister_action(&self, id: &str) -> Result<bool, SchedulerError> {
        Ok(self.actions.lock()?.remove(id).is_some())
    }

    /// Start the scheduler. In `Automatic` mode this spawns the ticker thread;
    /// in `Manual` mode the caller drives `run_pending()`.
    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
        if !self.execution_mode.is_automatic() {
            return;
        }

        let deferrals = Arc::clone(&self.deferrals);
        let actions = Arc::clone(&self.actions);
        let time_source = Arc::clone(&self.time_source);
        let running = Arc::clone(&self.running);
        let last_tick = Arc::clone(&self.last_tick);
        let thread_pool = Arc::clone(&self.thread_pool);

        thread::spawn(move || {
            while running.load(Ordering::Acquire) {
                let now = match time_source.now() {
                    Ok(time) => time,
                    Err(e) => {
                        warn!(error = %e, "time source failed");
                        // Avoid spinning the CPU on a broken clock
                        thread::sleep(Duration::from_millis(100));
                        continue;
                    }
                };

                last_tick.store(now, Ordering::Release);

                // Collect due entries under the lock, fire outside it
                let due = match deferrals.due_before(now) {
                    Ok(due) => due,
                    Err(e) => {
                        warn!(error = %e, "registry lock failed");
                        thread::sleep(Duration::from_millis(100));
                        continue;
                    }
                };

                for (key, generation) in due {
                    // A schedule call that landed after collection bumped the
                    // generation; the removal fails and the fire is skipped.
                    let entry = match deferrals.remove_if_generation(&key, generation) {
                        Ok(Some(entry)) => entry,
                        Ok(None) => {
                            debug!(key = %key, "deferral superseded before firing");
                            continue;
                        }
                        Err(e) => {
                            warn!(error = %e, "registry lock failed during fire");
                            continue;
                        }
                    };

                    match take_handler(&actions, &entry) {
                        Some(handler) => {
                            let event = FireEvent::from_deferral(&entry, now);
                            thread_pool.execute(move || execute_action(handler, event));
                        }
                        None => {
                            warn!(key = %entry.key, "no action registered for fired deferral");
                        }
                    }
                }

                // Sleep until the next deadline, capped to allow periodic
                // re-checks after new schedule calls
                match deferrals.next_due() {
                    Ok(Some(next)) if next > now => {
                        thread::sleep(Duration::from_millis(std::cmp::min(next - now, 100)));
                    }
                    Ok(Some(_)) => continue,
                    Ok(None) => thread::sleep(Duration::from_millis(50)),
                    Err(_) => thread::sleep(Duration::from_millis(100)),
                }
            }
        });
    }

    /// Run one fire pass on the calling thread, executing every due action.
    /// Returns how many actions were executed. The only driver in `Manual`
    /// mode.
    pub fn run_pending(&self) -> Result<usize, SchedulerError> {
        let now = self.time_source.now()?;
        self.last_tick.store(now, Ordering::Release);

        let due = self.deferrals.due_before(now)?;
        let mut fired = 0;
        for (key, generation) in due {
            let Some(entry) = self.deferrals.remove_if_generation(&key, generation)? else {
                continue;
            };
            match take_handler(&self.actions, &entry) {
                Some(handler) => {
                    execute_action(handler, FireEvent::from_deferral(&entry, now));
                    fired += 1;
                }
                None => warn!(key = %entry.key, "no action registered for fired deferral"),
            }
        }
        Ok(fired)
    }

    /// Stop the scheduler.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Check if the scheduler is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Cancel every pending deferral, returning how many were dropped.
    pub fn drain(&self) -> Result<usize, SchedulerError> {
        let drained = self.deferrals.drain()?;
        for deferral in &drained {
            self.discard_ephemeral(deferral);
        }
        Ok(drained.len())
    }

    /// Stop the engine and cancel everything pending. The shutdown path.
    pub fn shutdown(&self) -> Result<usize, SchedulerError> {
        self.stop();
        self.drain()
    }

    pub fn last_tick_ms(&self) -> u64 {
        self.last_tick.load(Ordering::Acquire)
    }

    /// Freeze the scheduler state for persistence.
    pub fn freeze(&self) -> Result<SchedulerState, SchedulerError> {
        let deferrals = self
            .deferrals
            .snapshot()?
            .into_iter()
            .map(|deferral| SerializedDeferral {
                key: deferral.key,
                generation: deferral.generation,
                due_at: deferral.due_at,
                scheduled_at: deferral.scheduled_at,
                action_id: deferral.action_id,
                ephemeral_action: deferral.ephemeral_action,
                reschedule_count: deferral.reschedule_count,
                metadata: deferral.metadata,
            })
            .collect();

        Ok(SchedulerState {
            deferrals,
            last_tick_time: self.last_tick.load(Ordering::Acquire),
        })
    }

    /// Restore a scheduler from a serialized state with default settings.
    ///
    /// Restored deferrals reference actions by id; ids whose actions were not
    /// re-registered log a warning at fire time and are dropped.
    pub fn restore(state: SchedulerState) -> Result<Self, SchedulerError> {
        Self::restore_with_config(state, SchedulerConfig::default())
    }

    /// Restore a scheduler from a serialized state with custom configuration.
    pub fn restore_with_config(
        state: SchedulerState,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let scheduler = Self::with_config(config);

        let mut max_generation = 0;
        for serialized in state.deferrals {
            max_generation = max_generation.max(serialized.generation);
            scheduler.deferrals.arm(Deferral {
                key: serialized.key,
                generation: serialized.generation,
                due_at: serialized.due_at,
                scheduled_at: serialized.scheduled_at,
                action_id: serialized.action_id,
                ephemeral_action: serialized.ephemeral_action,
                reschedule_count: serialized.reschedule_count,
                metadata: serialized.metadata,
            })?;
        }

        // New schedule calls must stay ahead of every restored token
        scheduler.generation.store(max_generation, Ordering::Release);
        scheduler
            .last_tick
            .store(state.last_tick_time, Ordering::Release);

        Ok(scheduler)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::with_config(SchedulerConfig::default())
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending_count", &self.pending_count())
            .field("running", &self.running.load(Ordering::Acquire))
            .field("last_tick", &self.last_tick.load(Ordering::Acquire))
            .finish()
    }
}

// ----------------- SECTION 4: Utility Functions and Types -----------------

/// Create a deferred action from a simple closure function.
///
/// # Example
/// ```
/// # use deferrals::{Scheduler, action_fn};
/// # use std::time::Duration;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let scheduler = Scheduler::new();
///
/// scheduler.schedule(
///     "room:42",
///     Duration::from_secs(300),
///     action_fn(|event| {
///         println!("closing {}", event.key);
///         Ok(())
///     }),
/// )?;
/// # Ok(())
/// # }
/// ```
pub fn action_fn<F>(f: F) -> Box<dyn DeferredAction>
where
    F: Fn(FireEvent) -> Result<(), ActionError> + Send + Sync + Clone + 'static,
{
    Box::new(ClosureAction { handler: f })
}

/// Default system time source using SystemTime.
struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Result<u64, SchedulerError> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| SchedulerError::TimeError(format!("Failed to get time: {}", e)))
            .map(|duration| duration.as_millis() as u64)
    }

    fn is_monotonic(&self) -> bool {
        false // SystemTime is not monotonic
    }
}

/// Monotonic time source using std::time::Instant
pub struct MonotonicTimeSource {
    // Store origin time and a reference point to convert between epoch time and monotonic time
    origin_instant: Instant,
    origin_millis: u64,
}

impl MonotonicTimeSource {
    pub fn new() -> Result<Self, SchedulerError> {
        let now_system = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| SchedulerError::TimeError(format!("Failed to get time: {}", e)))?
            .as_millis() as u64;

        Ok(Self {
            origin_instant: Instant::now(),
            origin_millis: now_system,
        })
    }
}

impl TimeSource for MonotonicTimeSource {
    fn now(&self) -> Result<u64, SchedulerError> {
        let elapsed = self.origin_instant.elapsed().as_millis() as u64;
        Ok(self.origin_millis + elapsed)
    }

    fn is_monotonic(&self) -> bool {
        true // Instant is monotonic
    }
}

/// Settable clock, shared by cloning. Pairs with `ExecutionMode::Manual` and
/// `run_pending()` for deterministic timing tests.
#[derive(Clone, Debug, Default)]
pub struct ManualTimeSource {
    now_ms: Arc<AtomicU64>,
}

impl ManualTimeSource {
    pub fn starting_at(now_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(now_ms)),
        }
    }

    pub fn advance(&self, delta: Duration) {
        self.now_ms
            .fetch_add(delta.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Result<u64, SchedulerError> {
        Ok(self.now_ms.load(Ordering::SeqCst))
    }

    fn is_monotonic(&self) -> bool {
        true
    }
}

/// Structure for implementing DeferredAction from closures.
struct ClosureAction<F: Fn(FireEvent) -> Result<(), ActionError> + Send + Sync + Clone + 'static> {
    handler: F,
}

impl<F: Fn(FireEvent) -> Result<(), ActionError> + Send + Sync + Clone + 'static> Clone
    for ClosureAction<F>
{
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
        }
    }
}

impl<F: Fn(FireEvent) -> Result<(), ActionError> + Send + Sync + Clone + 'static> DeferredAction
    for ClosureAction<F>
{
    fn run(&self, event: FireEvent) -> Result<(), ActionError> {
        (self.handler)(event)
    }

    fn run_async<'a>(
        &'a self,
        event: FireEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), ActionError>> + Send + 'a>> {
        // Simple async wrapper for sync handler
        Box::pin(async move { self.run(event) })
    }
}

// ----------------- SECTION 5: Builder APIs -----------------

/// A detached deferral definition that can be built without a scheduler
/// reference and armed later with `Scheduler::submit`.
#[derive(Clone, Debug)]
pub struct DeferralRequest {
    key: String,
    delay: Duration,
    jitter: Option<Duration>,
    action_id: Option<String>,
    metadata: HashMap<String, String>,
}

impl DeferralRequest {
    /// Create a request for `key` due after `delay`.
    pub fn after(key: impl Into<String>, delay: Duration) -> Self {
        Self {
            key: key.into(),
            delay,
            jitter: None,
            action_id: None,
            metadata: HashMap::new(),
        }
    }

    /// Add a uniform random 0..jitter offset to the due time at arm time.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Reference a registered action by id.
    pub fn with_action_id(mut self, id: impl Into<String>) -> Self {
        self.action_id = Some(id.into());
        self
    }

    /// Attach a metadata entry passed through to the fire event.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

/// Builder for arming deferrals against a scheduler.
pub struct DeferralBuilder<'a> {
    scheduler: &'a Scheduler,
    request: DeferralRequest,
}

impl<'a> DeferralBuilder<'a> {
    /// Create a new deferral builder.
    pub fn new(scheduler: &'a Scheduler, key: impl Into<String>, delay: Duration) -> Self {
        DeferralBuilder {
            scheduler,
            request: DeferralRequest::after(key, delay),
        }
    }

    /// Add a uniform random 0..jitter offset to the due time.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.request = self.request.with_jitter(jitter);
        self
    }

    /// Reference a registered action by id.
    pub fn with_action_id(mut self, id: impl Into<String>) -> Self {
        self.request = self.request.with_action_id(id);
        self
    }

    /// Attach a metadata entry passed through to the fire event.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request = self.request.with_metadata(key, value);
        self
    }

    #[cfg(not(feature = "async"))]
    /// Execute a closure when this deferral fires.
    pub fn execute<F>(self, handler: F) -> Result<(), SchedulerError>
    where
        F: Fn(FireEvent) -> Result<(), ActionError> + Send + Sync + Clone + 'static,
    {
        let DeferralBuilder { scheduler, request } = self;
        validate_key(&request.key)?;

        let id = format!("action_{}", Uuid::new_v4());
        scheduler
            .actions
            .lock()?
            .insert(id.clone(), Arc::new(ClosureAction { handler }));

        scheduler.arm(
            request.key,
            request.delay,
            request.jitter,
            Some(id),
            true,
            request.metadata,
        )
    }

    #[cfg(feature = "async")]
    /// Execute a closure when this deferral fires, with async support.
    pub fn execute<F, Fut>(self, handler: F) -> Result<(), SchedulerError>
    where
        F: Fn(FireEvent) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        use crate::async_support::AsyncClosureAction;

        let DeferralBuilder { scheduler, request } = self;
        validate_key(&request.key)?;

        let id = format!("async_action_{}", Uuid::new_v4());
        scheduler
            .actions
            .lock()?
            .insert(id.clone(), Arc::new(AsyncClosureAction { handler }));

        scheduler.arm(
            request.key,
            request.delay,
            request.jitter,
            Some(id),
            true,
            request.metadata,
        )
    }

    /// Arm the deferral referencing a registered action id.
    pub fn arm(self) -> Result<(), SchedulerError> {
        self.scheduler.submit(self.request)
    }
}

#[cfg(feature = "async")]
pub mod async_support {
    use super::*;

    /// Scheduler wrapper for async actions running on a Tokio runtime.
    pub struct AsyncScheduler {
        scheduler: Scheduler,
    }

    impl fmt::Debug for AsyncScheduler {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("AsyncScheduler")
                .field("scheduler", &self.scheduler)
                .finish()
        }
    }

    impl AsyncScheduler {
        /// Create a new async scheduler with default settings.
        pub fn new() -> Self {
            AsyncScheduler {
                scheduler: Scheduler::new(),
            }
        }

        /// Create a new async scheduler with custom configuration.
        pub fn with_config(config: SchedulerConfig) -> Self {
            AsyncScheduler {
                scheduler: Scheduler::with_config(config),
            }
        }

        /// Register an async action that deferrals can reference by id.
        pub fn register_async_action<F, Fut>(
            &self,
            id: impl Into<String>,
            handler: F,
        ) -> Result<(), SchedulerError>
        where
            F: Fn(FireEvent) -> Fut + Send + Sync + Clone + 'static,
            Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
        {
            self.scheduler
                .register_action(id, Box::new(AsyncClosureAction { handler }))
        }

        /// Start building a deferral for `key` with the given delay.
        pub fn defer(&self, key: impl Into<String>, delay: Duration) -> DeferralBuilder<'_> {
            self.scheduler.defer(key, delay)
        }

        /// Arm a pre-built deferral request.
        pub fn submit(&self, request: DeferralRequest) -> Result<(), SchedulerError> {
            self.scheduler.submit(request)
        }

        /// Schedule a deferral referencing a registered action id.
        pub fn schedule_action(
            &self,
            key: impl Into<String>,
            delay: Duration,
            action_id: impl Into<String>,
        ) -> Result<(), SchedulerError> {
            self.scheduler.schedule_action(key, delay, action_id)
        }

        /// Cancel the pending deferral for `key`.
        pub fn unschedule(&self, key: &str) -> Result<bool, SchedulerError> {
            self.scheduler.unschedule(key)
        }

        /// Whether `key` currently has a pending deferral.
        pub fn is_scheduled(&self, key: &str) -> bool {
            self.scheduler.is_scheduled(key)
        }

        pub fn pending_count(&self) -> usize {
            self.scheduler.pending_count()
        }

        /// Start the async scheduler.
        pub fn start(&self) {
            self.scheduler.start();
        }

        /// Stop the async scheduler.
        pub fn stop(&self) {
            self.scheduler.stop();
        }

        /// Check if the scheduler is currently running.
        pub fn is_running(&self) -> bool {
            self.scheduler.is_running()
        }

        /// Run one fire pass on the calling thread.
        pub fn run_pending(&self) -> Result<usize, SchedulerError> {
            self.scheduler.run_pending()
        }

        /// Cancel every pending deferral.
        pub fn drain(&self) -> Result<usize, SchedulerError> {
            self.scheduler.drain()
        }

        /// Freeze the scheduler state for persistence.
        pub fn freeze(&self) -> Result<SchedulerState, SchedulerError> {
            self.scheduler.freeze()
        }
    }

    impl Default for AsyncScheduler {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Wrapper for async closures.
    pub struct AsyncClosureAction<F, Fut>
    where
        F: Fn(FireEvent) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        pub handler: F,
    }

    impl<F, Fut> DeferredAction for AsyncClosureAction<F, Fut>
    where
        F: Fn(FireEvent) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        fn run(&self, event: FireEvent) -> Result<(), ActionError> {
            // Bridge to a runtime for the synchronous case
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| Box::new(e) as ActionError)?;
            rt.block_on((self.handler)(event))
        }

        fn run_async<'a>(
            &'a self,
            event: FireEvent,
        ) -> Pin<Box<dyn Future<Output = Result<(), ActionError>> + Send + 'a>> {
            Box::pin((self.handler)(event))
        }
    }
}

// ----------------- SECTION 6: Unit Tests -----------------
