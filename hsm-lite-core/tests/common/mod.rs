//! Shared test fixtures: capturing spawner and counting sleeper so timer
//! workers can be driven by hand, deterministically.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use hsm_lite_core::{CancelSignal, Sleeper, Spawner, TaskFuture, TaskHandle, Timepoint};

/// Captures spawned worker futures for manual, in-test execution.
#[derive(Default)]
pub struct ManualSpawner {
    tasks: Mutex<VecDeque<TaskFuture>>,
}

impl ManualSpawner {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Run the oldest captured worker to completion. Returns false when
    /// nothing was pending.
    pub async fn run_one(&self) -> bool {
        let task = self.tasks.lock().unwrap().pop_front();
        match task {
            Some(task) => {
                task.await;
                true
            }
            None => false,
        }
    }

    pub async fn run_all(&self) {
        while self.run_one().await {}
    }

    pub fn discard_all(&self) {
        self.tasks.lock().unwrap().clear();
    }
}

impl Spawner for ManualSpawner {
    fn spawn(&self, task: TaskFuture) -> TaskHandle {
        self.tasks.lock().unwrap().push_back(task);
        TaskHandle::detached()
    }
}

/// Records every sleep without waiting; optionally sets the cancellation
/// signal once a given number of sleeps has been observed (the original
/// suite's trick for ending periodic timers).
#[derive(Default)]
pub struct CountingSleeper {
    sleeps: Mutex<Vec<Duration>>,
    untils: Mutex<Vec<Timepoint>>,
    cancel_after: Option<usize>,
}

impl CountingSleeper {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    pub fn cancelling_after(sleeps: usize) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            cancel_after: Some(sleeps),
            ..Self::default()
        })
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }

    pub fn sleep_count(&self) -> usize {
        self.sleeps.lock().unwrap().len()
    }

    pub fn until_count(&self) -> usize {
        self.untils.lock().unwrap().len()
    }
}

#[async_trait]
impl Sleeper for CountingSleeper {
    async fn sleep_for(&self, duration: Duration, cancel: &mut CancelSignal) {
        let count = {
            let mut sleeps = self.sleeps.lock().unwrap();
            sleeps.push(duration);
            sleeps.len()
        };
        if let Some(limit) = self.cancel_after {
            if count >= limit {
                cancel.set();
            }
        }
    }

    async fn sleep_until(&self, deadline: Timepoint, _cancel: &mut CancelSignal) {
        self.untils.lock().unwrap().push(deadline);
    }
}

static TRACING: Once = Once::new();

/// Opt-in tracing output for debugging test runs (`RUST_LOG=debug`).
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}
