//! Authored machine description: a tree of state definitions built with
//! consuming builders, consumed once by the normalizer.
//!
//! ```ignore
//! let model = define::<Light>("TrafficLight")
//!     .initial("red")
//!     .state(state("red").transition(transition().on("TIMER").to("green")))
//!     .state(state("green").transition(transition().on("TIMER").to("yellow")))
//!     .state(state("yellow").transition(transition().on("TIMER").to("red")))
//!     .compile()?;
//! ```

use std::any::Any;
use std::sync::Arc;

use crate::compiler::{self, BuildError};
use crate::events::Event;
use crate::machine::ActionCtx;
use crate::types::{
    ActionFn, ActivityFn, DeadlineFn, DurationFn, GuardFn, NormalizedModel, PredicateFn,
};

/// What a definition node will normalize into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DefKind {
    /// Composite or leaf, decided by whether children are present.
    Normal,
    Final,
    Choice,
}

/// Behavior tag as authored: `None` runs for every event, `Some(name)` only
/// for the named/typed event.
pub(crate) type TagName = Option<String>;

pub(crate) enum TriggerDef<I> {
    Completion,
    Event(String),
    Any,
    After(DurationFn<I>),
    At(DeadlineFn<I>),
    Every(DurationFn<I>),
    When(PredicateFn<I>),
}

pub(crate) enum TargetDef {
    Internal,
    Path(String),
    ShallowHistory(String),
    DeepHistory(String),
}

/// One authored transition.
pub struct TransitionDef<I> {
    pub(crate) trigger: TriggerDef<I>,
    pub(crate) guard: Option<GuardFn<I>>,
    pub(crate) effect: Option<ActionFn<I>>,
    pub(crate) target: TargetDef,
}

/// One authored state (the root definition is a `StateDef` too).
pub struct StateDef<I> {
    pub(crate) name: String,
    pub(crate) kind: DefKind,
    pub(crate) initial: Option<String>,
    pub(crate) entries: Vec<(TagName, ActionFn<I>)>,
    pub(crate) exits: Vec<(TagName, ActionFn<I>)>,
    pub(crate) activities: Vec<ActivityFn<I>>,
    pub(crate) defers: Vec<String>,
    pub(crate) transitions: Vec<TransitionDef<I>>,
    pub(crate) children: Vec<StateDef<I>>,
}

/// Root of a machine description. The name becomes the first path segment.
pub fn define<I>(name: impl Into<String>) -> StateDef<I> {
    StateDef::named(name, DefKind::Normal)
}

/// A composite or leaf state (decided by whether children are added).
pub fn state<I>(name: impl Into<String>) -> StateDef<I> {
    StateDef::named(name, DefKind::Normal)
}

/// A final state: terminal leaf, no behaviors, no outgoing transitions.
pub fn final_state<I>(name: impl Into<String>) -> StateDef<I> {
    StateDef::named(name, DefKind::Final)
}

/// A choice pseudostate: completion transitions only, one unguarded default
/// required.
pub fn choice<I>(name: impl Into<String>) -> StateDef<I> {
    StateDef::named(name, DefKind::Choice)
}

/// Starts a transition definition. With no trigger it is a completion
/// transition; with no target it is internal.
pub fn transition<I>() -> TransitionDef<I> {
    TransitionDef {
        trigger: TriggerDef::Completion,
        guard: None,
        effect: None,
        target: TargetDef::Internal,
    }
}

impl<I> StateDef<I> {
    fn named(name: impl Into<String>, kind: DefKind) -> Self {
        Self {
            name: name.into(),
            kind,
            initial: None,
            entries: Vec::new(),
            exits: Vec::new(),
            activities: Vec::new(),
            defers: Vec::new(),
            transitions: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Designate the default substate (path resolved within this state).
    pub fn initial(mut self, path: impl Into<String>) -> Self {
        self.initial = Some(path.into());
        self
    }

    pub fn state(mut self, child: StateDef<I>) -> Self {
        self.children.push(child);
        self
    }

    /// Entry behavior run for every triggering event.
    pub fn entry<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ActionCtx, &mut I, &Event) + Send + Sync + 'static,
    {
        self.entries.push((None, Arc::new(f)));
        self
    }

    /// Entry behavior run only when the named event triggered the entry.
    pub fn entry_for<F>(mut self, event: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut ActionCtx, &mut I, &Event) + Send + Sync + 'static,
    {
        self.entries.push((Some(event.into()), Arc::new(f)));
        self
    }

    /// Entry behavior run only for the typed event `T`, receiving its payload.
    pub fn entry_on<T, F>(mut self, f: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&mut ActionCtx, &mut I, &T) + Send + Sync + 'static,
    {
        self.entries
            .push((Some(type_tag::<T>()), typed_action(f)));
        self
    }

    pub fn exit<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ActionCtx, &mut I, &Event) + Send + Sync + 'static,
    {
        self.exits.push((None, Arc::new(f)));
        self
    }

    pub fn exit_for<F>(mut self, event: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut ActionCtx, &mut I, &Event) + Send + Sync + 'static,
    {
        self.exits.push((Some(event.into()), Arc::new(f)));
        self
    }

    pub fn exit_on<T, F>(mut self, f: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&mut ActionCtx, &mut I, &T) + Send + Sync + 'static,
    {
        self.exits.push((Some(type_tag::<T>()), typed_action(f)));
        self
    }

    /// Do-activity: runs once per entry on a worker task; completion of this
    /// state is gated on it returning.
    pub fn activity<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut I) + Send + Sync + 'static,
    {
        self.activities.push(Arc::new(f));
        self
    }

    /// Defer the named event while this state is in the configuration.
    pub fn defer(mut self, event: impl Into<String>) -> Self {
        self.defers.push(event.into());
        self
    }

    pub fn transition(mut self, t: TransitionDef<I>) -> Self {
        self.transitions.push(t);
        self
    }

    /// Normalize this definition (as machine root) into the flat tables.
    pub fn compile(self) -> Result<Arc<NormalizedModel<I>>, BuildError> {
        compiler::normalize(self).map(Arc::new)
    }
}

impl<I> TransitionDef<I> {
    /// Trigger on the named event.
    pub fn on(mut self, event: impl Into<String>) -> Self {
        self.trigger = TriggerDef::Event(event.into());
        self
    }

    /// Trigger on the typed event `T`.
    pub fn on_typed<T: Any + Send + Sync>(mut self) -> Self {
        self.trigger = TriggerDef::Event(type_tag::<T>());
        self
    }

    /// Trigger on any runtime event not claimed by a more specific
    /// transition.
    pub fn on_any(mut self) -> Self {
        self.trigger = TriggerDef::Any;
        self
    }

    /// Fire after a relative delay, evaluated against the instance on entry.
    pub fn after<F>(mut self, f: F) -> Self
    where
        F: Fn(&I) -> std::time::Duration + Send + Sync + 'static,
    {
        self.trigger = TriggerDef::After(Arc::new(f));
        self
    }

    /// Fire at an absolute timepoint.
    pub fn at<F>(mut self, f: F) -> Self
    where
        F: Fn(&I) -> crate::providers::Timepoint + Send + Sync + 'static,
    {
        self.trigger = TriggerDef::At(Arc::new(f));
        self
    }

    /// Fire repeatedly; the delay callable is re-evaluated every iteration.
    pub fn every<F>(mut self, f: F) -> Self
    where
        F: Fn(&I) -> std::time::Duration + Send + Sync + 'static,
    {
        self.trigger = TriggerDef::Every(Arc::new(f));
        self
    }

    /// Fire when the predicate first observes true (polled).
    pub fn when<F>(mut self, f: F) -> Self
    where
        F: Fn(&I) -> bool + Send + Sync + 'static,
    {
        self.trigger = TriggerDef::When(Arc::new(f));
        self
    }

    pub fn guard<F>(mut self, f: F) -> Self
    where
        F: Fn(&I, &Event) -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Arc::new(f));
        self
    }

    /// Guard over the payload of the typed event `T`.
    pub fn guard_typed<T, F>(mut self, f: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&I, &T) -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Arc::new(move |inst: &I, evt: &Event| {
            evt.payload::<T>().is_some_and(|p| f(inst, p))
        }));
        self
    }

    pub fn effect<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ActionCtx, &mut I, &Event) + Send + Sync + 'static,
    {
        self.effect = Some(Arc::new(f));
        self
    }

    /// Effect over the payload of the typed event `T`.
    pub fn effect_typed<T, F>(mut self, f: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&mut ActionCtx, &mut I, &T) + Send + Sync + 'static,
    {
        self.effect = Some(typed_action(f));
        self
    }

    /// External target by path (absolute or relative).
    pub fn to(mut self, path: impl Into<String>) -> Self {
        self.target = TargetDef::Path(path.into());
        self
    }

    /// Re-enter the composite's last active direct child.
    pub fn to_shallow_history(mut self, path: impl Into<String>) -> Self {
        self.target = TargetDef::ShallowHistory(path.into());
        self
    }

    /// Re-enter the composite's last active leaf exactly.
    pub fn to_deep_history(mut self, path: impl Into<String>) -> Self {
        self.target = TargetDef::DeepHistory(path.into());
        self
    }
}

/// Event-name tag for the typed event `T`; must match `Event::typed`.
pub(crate) fn type_tag<T: Any>() -> String {
    std::any::type_name::<T>().to_string()
}

fn typed_action<I, T, F>(f: F) -> ActionFn<I>
where
    T: Any + Send + Sync,
    F: Fn(&mut ActionCtx, &mut I, &T) + Send + Sync + 'static,
{
    Arc::new(move |ctx: &mut ActionCtx, inst: &mut I, evt: &Event| {
        if let Some(payload) = evt.payload::<T>() {
            f(ctx, inst, payload);
        }
    })
}
