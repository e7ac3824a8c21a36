//! Timer supervisor: per-state workers for timed triggers and activities.
//!
//! Workers are spawned through the provider on state entry and hold the
//! cancellation signal of that entry generation. They check the signal
//! immediately after every sleep, and the dispatcher re-checks it before
//! acting on anything they enqueue, so results from exited generations are
//! discarded without races.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::watch;

use crate::events::Event;
use crate::machine::{EntryWorkers, Envelope, Runtime, Shared};
use crate::providers::{CancelSignal, TaskFuture};
use crate::types::{
    ActivityFn, DeadlineFn, DurationFn, PredicateFn, StateId, TransitionId, Trigger,
};

/// Synthetic event names carried by timer-originated dispatches.
pub const AFTER_EVENT: &str = "@after";
pub const AT_EVENT: &str = "@at";
pub const EVERY_EVENT: &str = "@every";
pub const WHEN_EVENT: &str = "@when";

/// Spawn workers for every timed trigger and activity of `state` and record
/// their handles plus a fresh cancellation generation.
pub(crate) fn arm_state<I: Send + 'static>(shared: &Shared<I>, core: &mut Runtime, state: StateId) {
    let def = shared.model.state(state);
    if def.timed.is_empty() && def.activities.is_empty() {
        return;
    }
    // Workers hold a strong reference so a machine with live timers stays
    // valid until they observe the stop signal sent on drop.
    let Some(arc) = shared.weak.upgrade() else {
        return;
    };

    let (cancel_tx, entry_rx) = watch::channel(false);
    let mut handles = Vec::new();

    for &tid in &def.timed {
        let sig = CancelSignal::new(entry_rx.clone(), shared.stop_tx.subscribe());
        let fut: TaskFuture = match &shared.model.transition(tid).trigger {
            Trigger::After(f) => Box::pin(after_worker(arc.clone(), tid, state, f.clone(), sig)),
            Trigger::At(f) => Box::pin(at_worker(arc.clone(), tid, state, f.clone(), sig)),
            Trigger::Every(f) => Box::pin(every_worker(arc.clone(), tid, state, f.clone(), sig)),
            Trigger::When(f) => Box::pin(when_worker(arc.clone(), tid, state, f.clone(), sig)),
            _ => continue,
        };
        handles.push(shared.providers.spawner.spawn(fut));
        tracing::debug!(state = %def.path, transition = tid, "armed timer worker");
    }

    let mut pending = 0u32;
    for activity in &def.activities {
        let sig = CancelSignal::new(entry_rx.clone(), shared.stop_tx.subscribe());
        pending += 1;
        handles.push(shared.providers.spawner.spawn(Box::pin(activity_worker(
            arc.clone(),
            state,
            activity.clone(),
            sig,
        ))));
        tracing::debug!(state = %def.path, "spawned activity");
    }

    core.workers.insert(
        state,
        EntryWorkers {
            cancel: cancel_tx,
            handles,
            pending_activities: pending,
        },
    );
}

/// Evaluate a user callable against the instance, routing panics into the
/// fault path. Returns None when the callable panicked.
fn eval_user<I: Send + 'static, R>(
    shared: &Arc<Shared<I>>,
    state: StateId,
    f: impl FnOnce(&I) -> R,
) -> Option<R> {
    let outcome = {
        let inst = shared.lock_instance();
        catch_unwind(AssertUnwindSafe(|| f(&inst)))
    };
    match outcome {
        Ok(value) => Some(value),
        Err(_) => {
            shared.push(Envelope::WorkerPanicked { state });
            None
        }
    }
}

async fn after_worker<I: Send + 'static>(
    shared: Arc<Shared<I>>,
    transition: TransitionId,
    state: StateId,
    delay: DurationFn<I>,
    mut sig: CancelSignal,
) {
    let Some(duration) = eval_user(&shared, state, |i| delay(i)) else {
        let _ = shared.drain().await;
        return;
    };
    shared.providers.sleeper.sleep_for(duration, &mut sig).await;
    if sig.is_set() {
        return;
    }
    shared.push(Envelope::TimerFired {
        transition,
        cancel: sig.clone(),
        event: Event::new(AFTER_EVENT),
    });
    let _ = shared.drain().await;
}

async fn at_worker<I: Send + 'static>(
    shared: Arc<Shared<I>>,
    transition: TransitionId,
    state: StateId,
    deadline: DeadlineFn<I>,
    mut sig: CancelSignal,
) {
    let Some(at) = eval_user(&shared, state, |i| deadline(i)) else {
        let _ = shared.drain().await;
        return;
    };
    shared.providers.sleeper.sleep_until(at, &mut sig).await;
    if sig.is_set() {
        return;
    }
    shared.push(Envelope::TimerFired {
        transition,
        cancel: sig.clone(),
        event: Event::new(AT_EVENT),
    });
    let _ = shared.drain().await;
}

/// Loop of sleep → cancel check → tick. The delay callable is re-evaluated
/// every iteration; a cancel observed right after the final sleep produces
/// no dispatch.
async fn every_worker<I: Send + 'static>(
    shared: Arc<Shared<I>>,
    transition: TransitionId,
    state: StateId,
    delay: DurationFn<I>,
    mut sig: CancelSignal,
) {
    loop {
        if sig.is_set() {
            return;
        }
        let Some(duration) = eval_user(&shared, state, |i| delay(i)) else {
            let _ = shared.drain().await;
            return;
        };
        shared.providers.sleeper.sleep_for(duration, &mut sig).await;
        if sig.is_set() {
            return;
        }
        shared.push(Envelope::TimerFired {
            transition,
            cancel: sig.clone(),
            event: Event::new(EVERY_EVENT),
        });
        let _ = shared.drain().await;
    }
}

/// Poll the predicate at the provider-configured cadence; first true wins.
async fn when_worker<I: Send + 'static>(
    shared: Arc<Shared<I>>,
    transition: TransitionId,
    state: StateId,
    predicate: PredicateFn<I>,
    mut sig: CancelSignal,
) {
    loop {
        if sig.is_set() {
            return;
        }
        let Some(hit) = eval_user(&shared, state, |i| predicate(i)) else {
            let _ = shared.drain().await;
            return;
        };
        if hit {
            shared.push(Envelope::TimerFired {
                transition,
                cancel: sig.clone(),
                event: Event::new(WHEN_EVENT),
            });
            let _ = shared.drain().await;
            return;
        }
        let interval = shared.providers.when_poll_interval;
        shared.providers.sleeper.sleep_for(interval, &mut sig).await;
    }
}

/// Run the activity once; on return, report completion for this entry
/// generation so stabilization can resolve pending completion transitions.
async fn activity_worker<I: Send + 'static>(
    shared: Arc<Shared<I>>,
    state: StateId,
    activity: ActivityFn<I>,
    sig: CancelSignal,
) {
    if sig.is_set() {
        return;
    }
    let finished = {
        let mut inst = shared.lock_instance();
        catch_unwind(AssertUnwindSafe(|| activity(&mut inst))).is_ok()
    };
    if finished {
        shared.push(Envelope::ActivityDone {
            state,
            cancel: sig,
        });
    } else {
        shared.push(Envelope::WorkerPanicked { state });
    }
    let _ = shared.drain().await;
}
