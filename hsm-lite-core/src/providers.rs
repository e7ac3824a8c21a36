//! Embedder-supplied execution providers: task spawner, cancellation-aware
//! sleeper, monotonic clock.
//!
//! The engine only ever talks to these traits; the defaults are tokio-backed.
//! Tests inject capturing/counting implementations to drive timers
//! deterministically.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;

/// Monotonic timepoint used by `at` triggers and the clock provider.
pub type Timepoint = Instant;

/// Boxed worker body handed to the spawner.
pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Cancellation signal shared between the dispatch loop and one worker
/// generation. Set once, never cleared; re-entry of a state installs a fresh
/// signal. Also observes the machine-wide stop signal.
#[derive(Clone)]
pub struct CancelSignal {
    entry: watch::Receiver<bool>,
    stop: watch::Receiver<bool>,
    /// Provider-side set hook, shared across clones of this generation.
    local: Arc<AtomicBool>,
}

impl CancelSignal {
    pub(crate) fn new(entry: watch::Receiver<bool>, stop: watch::Receiver<bool>) -> Self {
        Self {
            entry,
            stop,
            local: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Non-blocking check, valid from any thread.
    pub fn is_set(&self) -> bool {
        self.local.load(Ordering::Acquire) || *self.entry.borrow() || *self.stop.borrow()
    }

    /// Mark this generation cancelled from provider code (e.g. a test
    /// sleeper ending a periodic timer). Observed at the worker's next
    /// checkpoint.
    pub fn set(&self) {
        self.local.store(true, Ordering::Release);
    }

    /// Resolves when the engine sets the signal. A dropped sender counts as
    /// set; a provider-side `set` is picked up at the next checkpoint
    /// instead.
    pub async fn cancelled(&mut self) {
        if self.local.load(Ordering::Acquire) {
            return;
        }
        let entry = self.entry.wait_for(|v| *v);
        let stop = self.stop.wait_for(|v| *v);
        tokio::select! {
            _ = entry => {}
            _ = stop => {}
        }
    }
}

/// Handle to a spawned worker. Joining is optional; the engine cancels via
/// signals and never blocks on workers.
pub struct TaskHandle {
    join: Option<tokio::task::JoinHandle<()>>,
}

impl TaskHandle {
    pub fn new(join: tokio::task::JoinHandle<()>) -> Self {
        Self { join: Some(join) }
    }

    /// A handle with nothing to join (provider runs tasks elsewhere).
    pub fn detached() -> Self {
        Self { join: None }
    }

    pub async fn join(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

/// Spawns worker tasks for timers and activities.
pub trait Spawner: Send + Sync {
    fn spawn(&self, task: TaskFuture) -> TaskHandle;
}

/// Cancellation-aware sleeping. Implementations return early iff the signal
/// is set.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep_for(&self, duration: Duration, cancel: &mut CancelSignal);
    async fn sleep_until(&self, deadline: Timepoint, cancel: &mut CancelSignal);
}

/// Monotonic clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timepoint;
}

// ─── Tokio-backed defaults ────────────────────────────────────

pub struct TokioSpawner;

impl Spawner for TokioSpawner {
    fn spawn(&self, task: TaskFuture) -> TaskHandle {
        TaskHandle::new(tokio::spawn(task))
    }
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep_for(&self, duration: Duration, cancel: &mut CancelSignal) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = cancel.cancelled() => {}
        }
    }

    async fn sleep_until(&self, deadline: Timepoint, cancel: &mut CancelSignal) {
        tokio::select! {
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
            _ = cancel.cancelled() => {}
        }
    }
}

pub struct SteadyClock;

impl Clock for SteadyClock {
    fn now(&self) -> Timepoint {
        Instant::now()
    }
}

/// The provider bundle handed to a machine.
#[derive(Clone)]
pub struct Providers {
    pub spawner: Arc<dyn Spawner>,
    pub sleeper: Arc<dyn Sleeper>,
    pub clock: Arc<dyn Clock>,
    /// Poll cadence for `when` triggers.
    pub when_poll_interval: Duration,
}

impl Default for Providers {
    fn default() -> Self {
        Self {
            spawner: Arc::new(TokioSpawner),
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(SteadyClock),
            when_poll_interval: Duration::from_millis(1),
        }
    }
}

impl Providers {
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_when_poll_interval(mut self, interval: Duration) -> Self {
        self.when_poll_interval = interval;
        self
    }
}
