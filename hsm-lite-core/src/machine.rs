//! Dispatch core: one serialized event loop per machine instance.
//!
//! All configuration reads and writes happen under the core lock (a tokio
//! mutex, so waiters are released in arrival order). External callers and
//! timer workers communicate exclusively by pushing envelopes onto the inbox
//! and then draining it under the lock; whoever holds the lock processes
//! everything queued so far, which keeps FIFO ordering across callers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::defer::DeferQueue;
use crate::events::{AuditEvent, Event, EventKey};
use crate::path;
use crate::providers::{CancelSignal, Providers, TaskHandle};
use crate::resolver;
use crate::timers;
use crate::types::{
    ActionFn, EventTag, MachineConfig, NormalizedModel, StateId, TaggedAction, TargetSpec,
    TransitionId,
};

/// Runtime failures surfaced by the per-instance API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MachineError {
    #[error("machine has not been started")]
    NotStarted,
    #[error("machine is already started")]
    AlreadyStarted,
    #[error("machine is stopped")]
    Stopped,
    #[error("machine is faulted: behavior panicked in {0}")]
    Faulted(String),
}

/// Handed to every behavior invocation. Behaviors must not dispatch
/// synchronously; `enqueue` records events that run after the current
/// transition completes.
pub struct ActionCtx<'a> {
    inbox: &'a Mutex<VecDeque<Envelope>>,
}

impl ActionCtx<'_> {
    pub fn enqueue(&self, event: impl Into<Event>) {
        lock_poisonless(self.inbox).push_back(Envelope::External(event.into()));
    }
}

/// One message on the machine inbox.
pub(crate) enum Envelope {
    External(Event),
    /// A timed trigger fired; `cancel` is re-checked at dispatch time so
    /// results from exited state generations are discarded.
    TimerFired {
        transition: TransitionId,
        cancel: CancelSignal,
        event: Event,
    },
    ActivityDone {
        state: StateId,
        cancel: CancelSignal,
    },
    WorkerPanicked {
        state: StateId,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Created,
    Running,
    Stopped,
    Faulted,
}

/// Live workers for one entry generation of a state.
pub(crate) struct EntryWorkers {
    pub cancel: watch::Sender<bool>,
    #[allow(dead_code)]
    pub handles: Vec<TaskHandle>,
    pub pending_activities: u32,
}

/// Per-instance mutable state, owned by the dispatch loop.
pub(crate) struct Runtime {
    phase: Phase,
    fault_path: Option<String>,
    pub active_leaf: StateId,
    pub history_shallow: HashMap<StateId, StateId>,
    pub history_deep: HashMap<StateId, StateId>,
    deferred: DeferQueue,
    pub workers: HashMap<StateId, EntryWorkers>,
    /// States whose completion transition fired without leaving them;
    /// cleared on re-entry so a fresh generation can complete again.
    completion_done: HashSet<StateId>,
    audit: Vec<AuditEvent>,
}

pub(crate) struct Shared<I> {
    pub model: std::sync::Arc<NormalizedModel<I>>,
    pub providers: Providers,
    config: MachineConfig,
    instance_id: Uuid,
    instance: Mutex<I>,
    inbox: Mutex<VecDeque<Envelope>>,
    core: tokio::sync::Mutex<Runtime>,
    pub stop_tx: watch::Sender<bool>,
    /// Self-reference handed to spawned workers.
    pub weak: std::sync::Weak<Shared<I>>,
}

/// A machine instance: the normalized model plus one `Runtime` and the user
/// instance it drives. Dropping the machine signals every worker to stop.
pub struct Machine<I> {
    shared: std::sync::Arc<Shared<I>>,
}

enum Disposition {
    Consumed,
    Deferred,
    Ignored,
}

impl<I: Send + 'static> Machine<I> {
    pub fn new(model: std::sync::Arc<NormalizedModel<I>>, instance: I) -> Self {
        Self::with_providers(model, instance, Providers::default())
    }

    pub fn with_providers(
        model: std::sync::Arc<NormalizedModel<I>>,
        instance: I,
        providers: Providers,
    ) -> Self {
        Self::with_config(model, instance, providers, MachineConfig::default())
    }

    pub fn with_config(
        model: std::sync::Arc<NormalizedModel<I>>,
        instance: I,
        providers: Providers,
        config: MachineConfig,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let root = model.root;
        let max_deferred = config.max_deferred;
        Self {
            shared: std::sync::Arc::new_cyclic(|weak| Shared {
                model,
                providers,
                config,
                instance_id: Uuid::now_v7(),
                instance: Mutex::new(instance),
                inbox: Mutex::new(VecDeque::new()),
                core: tokio::sync::Mutex::new(Runtime {
                    phase: Phase::Created,
                    fault_path: None,
                    active_leaf: root,
                    history_shallow: HashMap::new(),
                    history_deep: HashMap::new(),
                    deferred: DeferQueue::new(max_deferred),
                    workers: HashMap::new(),
                    completion_done: HashSet::new(),
                    audit: Vec::new(),
                }),
                stop_tx,
                weak: weak.clone(),
            }),
        }
    }

    /// Drive the initial entry from the root through nested initial chains;
    /// returns once the first stable configuration is reached.
    pub async fn start(&self) -> Result<(), MachineError> {
        self.shared.start().await
    }

    /// Enqueue and process one event. Returns when the dispatcher is idle
    /// again for this call. Serialized across callers and workers.
    pub async fn dispatch(&self, event: impl Into<Event>) -> Result<(), MachineError> {
        self.shared.push(Envelope::External(event.into()));
        self.shared.drain().await
    }

    /// Absolute path of the active leaf.
    pub async fn state(&self) -> String {
        let core = self.shared.core.lock().await;
        self.shared.model.path(core.active_leaf).to_string()
    }

    /// Cancel all workers and refuse further dispatches. Idempotent.
    pub async fn stop(&self) {
        self.shared.stop().await;
    }

    /// Copy of the audit trail so far.
    pub async fn audit(&self) -> Vec<AuditEvent> {
        self.shared.core.lock().await.audit.clone()
    }

    pub fn instance_id(&self) -> Uuid {
        self.shared.instance_id
    }

    pub fn model(&self) -> &std::sync::Arc<NormalizedModel<I>> {
        &self.shared.model
    }

    /// Read the user instance outside of behaviors.
    pub fn with_instance<R>(&self, f: impl FnOnce(&I) -> R) -> R {
        f(&self.shared.lock_instance())
    }

    /// Mutate the user instance outside of behaviors (e.g. test setup).
    pub fn with_instance_mut<R>(&self, f: impl FnOnce(&mut I) -> R) -> R {
        f(&mut self.shared.lock_instance())
    }
}

impl<I> Drop for Machine<I> {
    fn drop(&mut self) {
        let _ = self.shared.stop_tx.send(true);
    }
}

fn lock_poisonless<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<I: Send + 'static> Shared<I> {
    pub(crate) fn lock_instance(&self) -> MutexGuard<'_, I> {
        lock_poisonless(&self.instance)
    }

    pub(crate) fn push(&self, env: Envelope) {
        lock_poisonless(&self.inbox).push_back(env);
    }

    fn pop(&self) -> Option<Envelope> {
        lock_poisonless(&self.inbox).pop_front()
    }

    async fn start(&self) -> Result<(), MachineError> {
        {
            let mut core = self.core.lock().await;
            match core.phase {
                Phase::Created => {}
                Phase::Running => return Err(MachineError::AlreadyStarted),
                Phase::Stopped => return Err(MachineError::Stopped),
                Phase::Faulted => return Err(self.fault_error(&core)),
            }
            core.phase = Phase::Running;
            core.audit.push(AuditEvent::Started {
                instance_id: self.instance_id,
            });
            tracing::debug!(machine = %self.model.name, instance = %self.instance_id, "starting");

            let init = Event::init();
            let mut enter = vec![self.model.root];
            enter.extend(path::initial_chain(&self.model, self.model.root));
            for &s in &enter {
                self.enter_state(&mut core, s, &init, EventKey::Unknown)?;
            }
            core.active_leaf = enter.last().copied().unwrap_or(self.model.root);
            self.stabilize(&mut core)?;
        }
        self.drain().await
    }

    async fn stop(&self) {
        let mut core = self.core.lock().await;
        if core.phase == Phase::Stopped {
            return;
        }
        core.phase = Phase::Stopped;
        let _ = self.stop_tx.send(true);
        for (_, workers) in core.workers.drain() {
            let _ = workers.cancel.send(true);
        }
        core.deferred.clear();
        lock_poisonless(&self.inbox).clear();
        core.audit.push(AuditEvent::Stopped);
        tracing::debug!(machine = %self.model.name, instance = %self.instance_id, "stopped");
    }

    /// Process everything queued so far under the core lock.
    pub(crate) async fn drain(&self) -> Result<(), MachineError> {
        let mut core = self.core.lock().await;
        let mut result = Ok(());
        while let Some(env) = self.pop() {
            if let Err(err) = self.process(&mut core, env) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    fn process(
        &self,
        core: &mut Runtime,
        env: Envelope,
    ) -> Result<(), MachineError> {
        match env {
            Envelope::External(event) => {
                match core.phase {
                    Phase::Created => return Err(MachineError::NotStarted),
                    Phase::Stopped => return Err(MachineError::Stopped),
                    Phase::Faulted => return Err(self.fault_error(core)),
                    Phase::Running => {}
                }
                self.handle_runtime_event(core, event, false)?;
                self.stabilize(core)
            }
            Envelope::TimerFired {
                transition,
                cancel,
                event,
            } => {
                if core.phase != Phase::Running {
                    return Ok(());
                }
                let source = self.model.transition(transition).source;
                if cancel.is_set() {
                    core.audit.push(AuditEvent::StaleWorkerIgnored {
                        state: self.model.path(source).to_string(),
                    });
                    tracing::debug!(state = %self.model.path(source), "stale timer result discarded");
                    return Ok(());
                }
                let pass = {
                    let inst = self.lock_instance();
                    match &self.model.transition(transition).guard {
                        Some(guard) => guard(&inst, &event),
                        None => true,
                    }
                };
                if pass {
                    self.execute(core, transition, &event)?;
                    self.stabilize(core)?;
                }
                Ok(())
            }
            Envelope::ActivityDone { state, cancel } => {
                if core.phase != Phase::Running {
                    return Ok(());
                }
                if cancel.is_set() {
                    core.audit.push(AuditEvent::StaleWorkerIgnored {
                        state: self.model.path(state).to_string(),
                    });
                    return Ok(());
                }
                if let Some(workers) = core.workers.get_mut(&state) {
                    workers.pending_activities = workers.pending_activities.saturating_sub(1);
                }
                core.audit.push(AuditEvent::ActivityCompleted {
                    state: self.model.path(state).to_string(),
                });
                self.stabilize(core)
            }
            Envelope::WorkerPanicked { state } => {
                if core.phase != Phase::Running {
                    return Ok(());
                }
                let path = self.model.path(state).to_string();
                self.fault(core, &path);
                Err(MachineError::Faulted(path))
            }
        }
    }

    /// Select and run one transition for a runtime event, or defer/ignore.
    fn handle_runtime_event(
        &self,
        core: &mut Runtime,
        event: Event,
        replaying: bool,
    ) -> Result<Disposition, MachineError> {
        let key = self.model.key_of(event.name());
        let selected = {
            let inst = self.lock_instance();
            resolver::select_event(&self.model, core.active_leaf, key, &inst, &event)
        };
        if let Some(tid) = selected {
            self.execute(core, tid, &event)?;
            return Ok(Disposition::Consumed);
        }

        if let EventKey::Known(id) = key {
            if self.model.defers(core.active_leaf, id) {
                if core.deferred.push(event.clone()) {
                    if !replaying {
                        core.audit.push(AuditEvent::EventDeferred {
                            event: event.name().to_string(),
                        });
                    }
                } else {
                    core.audit.push(AuditEvent::DeferralOverflow {
                        event: event.name().to_string(),
                    });
                    tracing::warn!(
                        event = event.name(),
                        capacity = self.config.max_deferred,
                        "deferral queue full, event dropped"
                    );
                }
                return Ok(Disposition::Deferred);
            }
        }

        core.audit.push(if replaying {
            AuditEvent::DeferredDiscarded {
                event: event.name().to_string(),
            }
        } else {
            AuditEvent::EventIgnored {
                event: event.name().to_string(),
            }
        });
        Ok(Disposition::Ignored)
    }

    /// Resolve completion and replay deferral until a fixed point.
    fn stabilize(&self, core: &mut Runtime) -> Result<(), MachineError> {
        let completion = Event::completion();
        loop {
            let mut progressed = false;

            // Completion pass: innermost eligible state first, re-scanned
            // after every fired transition.
            loop {
                let selected = {
                    let inst = self.lock_instance();
                    let workers = &core.workers;
                    let fired = &core.completion_done;
                    resolver::select_completion(
                        &self.model,
                        core.active_leaf,
                        &inst,
                        &completion,
                        &|s| workers.get(&s).map_or(true, |w| w.pending_activities == 0),
                        &|s| fired.contains(&s),
                    )
                };
                let Some(tid) = selected else { break };
                let source = self.model.transition(tid).source;
                core.completion_done.insert(source);
                self.execute(core, tid, &completion)?;
                progressed = true;
            }

            // One deferral drain; events re-deferred during the drain wait
            // for the next one.
            let pending = core.deferred.len();
            for _ in 0..pending {
                let Some(event) = core.deferred.pop() else { break };
                if let Disposition::Consumed = self.handle_runtime_event(core, event, true)? {
                    progressed = true;
                }
            }

            if !progressed {
                return Ok(());
            }
        }
    }

    fn execute(
        &self,
        core: &mut Runtime,
        tid: TransitionId,
        event: &Event,
    ) -> Result<(), MachineError> {
        let key = self.model.key_of(event.name());
        let transition = self.model.transition(tid);
        let prior_leaf = core.active_leaf;

        let (authored, history) = match transition.target {
            TargetSpec::Internal => {
                if let Some(effect) = transition.effect.clone() {
                    self.run_action(core, &effect, event, transition.source)?;
                }
                let here = self.model.path(prior_leaf).to_string();
                core.audit.push(AuditEvent::TransitionFired {
                    transition: tid,
                    from: here.clone(),
                    to: here,
                    event: event.name().to_string(),
                });
                return Ok(());
            }
            TargetSpec::External(s) => (s, None),
            TargetSpec::ShallowHistory(c) => (c, Some(false)),
            TargetSpec::DeepHistory(c) => (c, Some(true)),
        };

        let path = path::compute(&self.model, prior_leaf, transition.source, authored);
        for &s in &path.exit {
            self.exit_state(core, s, prior_leaf, event, key)?;
        }

        if let Some(effect) = transition.effect.clone() {
            self.run_action(core, &effect, event, transition.source)?;
        }

        let mut enter = path.enter;
        match history {
            None => enter.extend(path::initial_chain(&self.model, authored)),
            Some(deep) => enter.extend(path::history_extension(
                &self.model,
                authored,
                deep,
                &core.history_shallow,
                &core.history_deep,
            )),
        }
        for &s in &enter {
            self.enter_state(core, s, event, key)?;
        }
        core.active_leaf = enter.last().copied().unwrap_or(authored);

        tracing::debug!(
            from = %self.model.path(prior_leaf),
            to = %self.model.path(core.active_leaf),
            event = event.name(),
            "transition fired"
        );
        core.audit.push(AuditEvent::TransitionFired {
            transition: tid,
            from: self.model.path(prior_leaf).to_string(),
            to: self.model.path(core.active_leaf).to_string(),
            event: event.name().to_string(),
        });
        Ok(())
    }

    /// Exit sequence: cancel workers, record history, run exit behaviors.
    fn exit_state(
        &self,
        core: &mut Runtime,
        state: StateId,
        leaf_at_exit: StateId,
        event: &Event,
        key: EventKey,
    ) -> Result<(), MachineError> {
        if let Some(workers) = core.workers.remove(&state) {
            let _ = workers.cancel.send(true);
        }
        if let Some(parent) = self.model.state(state).parent {
            core.history_shallow.insert(parent, state);
            core.history_deep.insert(parent, leaf_at_exit);
        }
        let actions: Vec<_> = matching_actions(&self.model.state(state).exits, key);
        for action in actions {
            self.run_action(core, &action, event, state)?;
        }
        Ok(())
    }

    /// Entry sequence: run entry behaviors, then arm timers and activities.
    fn enter_state(
        &self,
        core: &mut Runtime,
        state: StateId,
        event: &Event,
        key: EventKey,
    ) -> Result<(), MachineError> {
        core.completion_done.remove(&state);
        let actions: Vec<_> = matching_actions(&self.model.state(state).entries, key);
        for action in actions {
            self.run_action(core, &action, event, state)?;
        }
        timers::arm_state(self, core, state);
        Ok(())
    }

    fn run_action(
        &self,
        core: &mut Runtime,
        action: &ActionFn<I>,
        event: &Event,
        state: StateId,
    ) -> Result<(), MachineError> {
        let outcome = {
            let mut inst = self.lock_instance();
            let mut ctx = ActionCtx { inbox: &self.inbox };
            catch_unwind(AssertUnwindSafe(|| action(&mut ctx, &mut inst, event)))
        };
        if outcome.is_err() {
            let path = self.model.path(state).to_string();
            self.fault(core, &path);
            return Err(MachineError::Faulted(path));
        }
        Ok(())
    }

    /// Behavior panicked: cancel everything, refuse further dispatches.
    fn fault(&self, core: &mut Runtime, path: &str) {
        core.phase = Phase::Faulted;
        core.fault_path = Some(path.to_string());
        for (_, workers) in core.workers.drain() {
            let _ = workers.cancel.send(true);
        }
        core.deferred.clear();
        core.audit.push(AuditEvent::Faulted {
            state: path.to_string(),
        });
        tracing::error!(machine = %self.model.name, state = path, "behavior panicked, machine faulted");
    }

    fn fault_error(&self, core: &Runtime) -> MachineError {
        MachineError::Faulted(core.fault_path.clone().unwrap_or_default())
    }
}

/// Behaviors whose tag matches the triggering event, in authoring order.
/// Untagged behaviors always match; tagged ones only on their own event.
fn matching_actions<I>(actions: &[TaggedAction<I>], key: EventKey) -> Vec<ActionFn<I>> {
    actions
        .iter()
        .filter(|a| match a.tag {
            EventTag::Any => true,
            EventTag::Event(id) => key == EventKey::Known(id),
        })
        .map(|a| a.run.clone())
        .collect()
}
