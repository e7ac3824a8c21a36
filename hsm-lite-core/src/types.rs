//! Normalized model tables and the scalar identifiers that index them.
//!
//! Everything in this module is immutable after normalization and shared
//! across machine instances behind an `Arc`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::events::{Event, EventKey};
use crate::machine::ActionCtx;
use crate::providers::Timepoint;

// ─── Scalar aliases ───────────────────────────────────────────

/// Dense pre-order state index (root = 0).
pub type StateId = u32;

/// Dense event index into the model's event table.
pub type EventId = u32;

/// Dense transition index in authoring order.
pub type TransitionId = u32;

// ─── Behavior thunks ──────────────────────────────────────────

/// Entry/exit action or transition effect.
pub type ActionFn<I> = Arc<dyn Fn(&mut ActionCtx, &mut I, &Event) + Send + Sync>;

/// Transition guard. Pure over instance and event.
pub type GuardFn<I> = Arc<dyn Fn(&I, &Event) -> bool + Send + Sync>;

/// Do-activity body, run once per state entry on a worker task.
pub type ActivityFn<I> = Arc<dyn Fn(&mut I) + Send + Sync>;

/// Produces the relative delay for `after`/`every` triggers.
pub type DurationFn<I> = Arc<dyn Fn(&I) -> Duration + Send + Sync>;

/// Produces the absolute deadline for `at` triggers.
pub type DeadlineFn<I> = Arc<dyn Fn(&I) -> Timepoint + Send + Sync>;

/// Condition polled by `when` triggers.
pub type PredicateFn<I> = Arc<dyn Fn(&I) -> bool + Send + Sync>;

// ─── States ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateKind {
    Composite,
    Leaf,
    Final,
    Choice,
}

/// Event tag on a behavior: untagged behaviors run for every event, tagged
/// ones only when the triggering event matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventTag {
    Any,
    Event(EventId),
}

pub struct TaggedAction<I> {
    pub tag: EventTag,
    pub run: ActionFn<I>,
}

pub struct State<I> {
    pub id: StateId,
    pub parent: Option<StateId>,
    pub depth: u32,
    pub kind: StateKind,
    /// Last path segment.
    pub name: String,
    pub name_hash: u32,
    /// Absolute path, `/` separated, model name first.
    pub path: String,
    pub path_hash: u32,
    /// Default substate entered when this composite is the ultimate target.
    pub initial_target: Option<StateId>,
    pub entries: Vec<TaggedAction<I>>,
    pub exits: Vec<TaggedAction<I>>,
    pub activities: Vec<ActivityFn<I>>,
    /// Events this state defers, as authored.
    pub deferred: HashSet<EventId>,
    /// Union of `deferred` over this state and all its ancestors, so the
    /// dispatcher answers "does the configuration defer e" with one lookup.
    pub deferred_inherited: HashSet<EventId>,
    /// Outgoing transitions in authoring order (= within-state priority).
    pub outgoing: Vec<TransitionId>,
    /// Subset of `outgoing` with timer-based triggers, armed on entry.
    pub timed: Vec<TransitionId>,
    pub children: Vec<StateId>,
}

// ─── Transitions ──────────────────────────────────────────────

pub enum Trigger<I> {
    /// No trigger: fires when the source state completes.
    Completion,
    Event(EventId),
    Any,
    After(DurationFn<I>),
    At(DeadlineFn<I>),
    Every(DurationFn<I>),
    When(PredicateFn<I>),
}

impl<I> Trigger<I> {
    pub fn is_timed(&self) -> bool {
        matches!(
            self,
            Trigger::After(_) | Trigger::At(_) | Trigger::Every(_) | Trigger::When(_)
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Trigger::Completion => "completion",
            Trigger::Event(_) => "event",
            Trigger::Any => "any",
            Trigger::After(_) => "after",
            Trigger::At(_) => "at",
            Trigger::Every(_) => "every",
            Trigger::When(_) => "when",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetSpec {
    /// No exit/entry; only the effect runs.
    Internal,
    External(StateId),
    ShallowHistory(StateId),
    DeepHistory(StateId),
}

pub struct Transition<I> {
    pub id: TransitionId,
    pub source: StateId,
    pub trigger: Trigger<I>,
    pub guard: Option<GuardFn<I>>,
    pub effect: Option<ActionFn<I>>,
    pub target: TargetSpec,
}

// ─── Configuration ────────────────────────────────────────────

/// Per-machine tunables.
///
/// `max_deferred` bounds the deferral queue (spec'd "default small"); the
/// fixed-size const-generic alternative is documented on `DeferQueue`.
#[derive(Clone, Debug)]
pub struct MachineConfig {
    pub max_deferred: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self { max_deferred: 16 }
    }
}

// ─── The normalized model ─────────────────────────────────────

/// Flat, immutable tables produced by the normalizer. All cross-references
/// are dense indices; no owning pointers between states.
pub struct NormalizedModel<I> {
    pub name: String,
    pub states: Vec<State<I>>,
    pub transitions: Vec<Transition<I>>,
    /// Event name → dense id. Reserved names are not present; they never
    /// key a table.
    pub events: HashMap<String, EventId>,
    /// Dense id → event name, for diagnostics.
    pub event_names: Vec<String>,
    pub root: StateId,
    /// Per state: ancestor chain root-first, excluding the state itself.
    /// Sized to the state's actual depth — no fixed bound.
    pub ancestors: Vec<Vec<StateId>>,
    /// SHA-256 over the canonicalized tables; identifies a model build.
    pub fingerprint: [u8; 32],
}

impl<I> NormalizedModel<I> {
    pub fn state(&self, id: StateId) -> &State<I> {
        &self.states[id as usize]
    }

    pub fn transition(&self, id: TransitionId) -> &Transition<I> {
        &self.transitions[id as usize]
    }

    pub fn event_id(&self, name: &str) -> Option<EventId> {
        self.events.get(name).copied()
    }

    pub(crate) fn key_of(&self, name: &str) -> EventKey {
        match self.event_id(name) {
            Some(id) => EventKey::Known(id),
            None => EventKey::Unknown,
        }
    }

    /// Active configuration for a leaf: root-first chain including the leaf.
    pub fn chain(&self, leaf: StateId) -> Vec<StateId> {
        let mut chain = self.ancestors[leaf as usize].clone();
        chain.push(leaf);
        chain
    }

    pub fn is_ancestor(&self, ancestor: StateId, of: StateId) -> bool {
        self.ancestors[of as usize].contains(&ancestor)
    }

    /// Lowest common ancestor of two states (either may be the result when
    /// one lies on the other's chain).
    pub fn lca(&self, a: StateId, b: StateId) -> StateId {
        if a == b {
            return a;
        }
        let chain_a = self.chain(a);
        let chain_b = self.chain(b);
        let mut lca = self.root;
        for (x, y) in chain_a.iter().zip(chain_b.iter()) {
            if x == y {
                lca = *x;
            } else {
                break;
            }
        }
        lca
    }

    pub fn path(&self, id: StateId) -> &str {
        &self.state(id).path
    }

    /// Does the configuration rooted at `leaf` defer `event`?
    pub(crate) fn defers(&self, leaf: StateId, event: EventId) -> bool {
        self.state(leaf).deferred_inherited.contains(&event)
    }

    fn fmt_subtree(&self, f: &mut fmt::Formatter<'_>, id: StateId, depth: usize) -> fmt::Result {
        let state = self.state(id);
        let marker = match state.kind {
            StateKind::Composite => "+",
            StateKind::Leaf => "-",
            StateKind::Final => "*",
            StateKind::Choice => "?",
        };
        writeln!(f, "{}{} {}", "  ".repeat(depth), marker, state.name)?;
        for &child in &state.children {
            self.fmt_subtree(f, child, depth + 1)?;
        }
        Ok(())
    }
}

/// Renders the state hierarchy, one state per line, indented by depth.
impl<I> fmt::Display for NormalizedModel<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_subtree(f, self.root, 0)
    }
}

impl<I> fmt::Debug for NormalizedModel<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormalizedModel")
            .field("name", &self.name)
            .field("states", &self.states.len())
            .field("transitions", &self.transitions.len())
            .field("events", &self.event_names)
            .finish()
    }
}
