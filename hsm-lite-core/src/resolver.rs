//! Transition selection.
//!
//! Walks the active chain leaf-first so deeper states override ancestors for
//! the same event; within a state, authoring order breaks ties. Timed
//! triggers are never selected here — their workers reference transitions
//! directly.

use crate::events::{Event, EventKey};
use crate::types::{NormalizedModel, StateId, StateKind, TransitionId, Trigger};

/// Pick the winning transition for a runtime event, or None to fall through
/// to deferral handling.
pub(crate) fn select_event<I>(
    model: &NormalizedModel<I>,
    active_leaf: StateId,
    key: EventKey,
    instance: &I,
    event: &Event,
) -> Option<TransitionId> {
    let mut cursor = Some(active_leaf);
    while let Some(state) = cursor {
        for &tid in &model.state(state).outgoing {
            let t = model.transition(tid);
            let matches = match &t.trigger {
                Trigger::Event(id) => key == EventKey::Known(*id),
                Trigger::Any => true,
                _ => false,
            };
            if matches && guard_passes(model, tid, instance, event) {
                return Some(tid);
            }
        }
        cursor = model.state(state).parent;
    }
    None
}

/// Pick the first eligible completion transition, innermost state first.
///
/// `activities_done(s)` reports whether every activity armed for the current
/// entry of `s` has returned; `already_fired(s)` suppresses re-firing a
/// completion transition that did not leave `s` (internal/self completion).
pub(crate) fn select_completion<I>(
    model: &NormalizedModel<I>,
    active_leaf: StateId,
    instance: &I,
    event: &Event,
    activities_done: &dyn Fn(StateId) -> bool,
    already_fired: &dyn Fn(StateId) -> bool,
) -> Option<TransitionId> {
    let mut cursor = Some(active_leaf);
    while let Some(state) = cursor {
        if !already_fired(state) && completed(model, state, active_leaf, activities_done) {
            for &tid in &model.state(state).outgoing {
                let t = model.transition(tid);
                if matches!(t.trigger, Trigger::Completion)
                    && guard_passes(model, tid, instance, event)
                {
                    return Some(tid);
                }
            }
        }
        cursor = model.state(state).parent;
    }
    None
}

/// Has `state` completed, given the current active leaf?
///
/// Leaves complete once their activities return (immediately when they have
/// none); composites additionally require their active direct child to be a
/// final state; choices are always complete; final states have no outgoing
/// transitions so completion is their parent's concern.
fn completed<I>(
    model: &NormalizedModel<I>,
    state: StateId,
    active_leaf: StateId,
    activities_done: &dyn Fn(StateId) -> bool,
) -> bool {
    match model.state(state).kind {
        StateKind::Choice => true,
        StateKind::Final => false,
        StateKind::Leaf => activities_done(state),
        StateKind::Composite => {
            let leaf = model.state(active_leaf);
            leaf.kind == StateKind::Final
                && leaf.parent == Some(state)
                && activities_done(state)
        }
    }
}

fn guard_passes<I>(
    model: &NormalizedModel<I>,
    tid: TransitionId,
    instance: &I,
    event: &Event,
) -> bool {
    match &model.transition(tid).guard {
        Some(guard) => guard(instance, event),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::{define, state, transition};

    fn leaf_by_path<I>(model: &NormalizedModel<I>, path: &str) -> StateId {
        model
            .states
            .iter()
            .find(|s| s.path == path)
            .map(|s| s.id)
            .unwrap()
    }

    #[test]
    fn deeper_state_overrides_ancestor_for_same_event() {
        let model = define::<()>("m")
            .initial("p")
            .state(
                state("p")
                    .initial("c")
                    .transition(transition().on("E").to("/m/fallback"))
                    .state(state("c").transition(transition().on("E").to("../sibling")))
                    .state(state("sibling")),
            )
            .state(state("fallback"))
            .compile()
            .unwrap();

        let c = leaf_by_path(&model, "/m/p/c");
        let key = EventKey::Known(model.event_id("E").unwrap());
        let evt = Event::new("E");
        let tid = select_event(&model, c, key, &(), &evt).unwrap();
        // The child's transition wins even though the parent's was authored
        // first in pre-order.
        assert_eq!(model.transition(tid).source, c);
    }

    #[test]
    fn guard_rejection_falls_through_to_next_candidate() {
        let model = define::<()>("m")
            .initial("s")
            .state(
                state("s")
                    .transition(transition().on("GO").guard(|_, _| false).to("blocked"))
                    .transition(transition().on("GO").to("allowed")),
            )
            .state(state("blocked"))
            .state(state("allowed"))
            .compile()
            .unwrap();

        let s = leaf_by_path(&model, "/m/s");
        let key = EventKey::Known(model.event_id("GO").unwrap());
        let evt = Event::new("GO");
        let tid = select_event(&model, s, key, &(), &evt).unwrap();
        assert_eq!(
            model.transition(tid).target,
            crate::types::TargetSpec::External(leaf_by_path(&model, "/m/allowed"))
        );
    }

    #[test]
    fn specific_event_wins_over_wildcard_in_authoring_order() {
        let model = define::<()>("m")
            .initial("s")
            .state(
                state("s")
                    .transition(transition().on("foo").to("foo_state"))
                    .transition(transition().on_any().to("any_state")),
            )
            .state(state("foo_state"))
            .state(state("any_state"))
            .compile()
            .unwrap();

        let s = leaf_by_path(&model, "/m/s");
        let evt = Event::new("foo");
        let tid = select_event(&model, s, model.key_of("foo"), &(), &evt).unwrap();
        assert_eq!(
            model.transition(tid).target,
            crate::types::TargetSpec::External(leaf_by_path(&model, "/m/foo_state"))
        );

        // Unknown names still match the wildcard.
        let evt = Event::new("bar");
        let tid = select_event(&model, s, model.key_of("bar"), &(), &evt).unwrap();
        assert_eq!(
            model.transition(tid).target,
            crate::types::TargetSpec::External(leaf_by_path(&model, "/m/any_state"))
        );
    }

    #[test]
    fn composite_completion_requires_final_child_and_activities() {
        let model = define::<()>("m")
            .initial("/m/comp/work")
            .state(
                state("comp")
                    .transition(transition().to("/m/done"))
                    .state(state("work"))
                    .state(crate::dsl::final_state("sub_final")),
            )
            .state(state("done"))
            .compile()
            .unwrap();

        let work = leaf_by_path(&model, "/m/comp/work");
        let sub_final = leaf_by_path(&model, "/m/comp/sub_final");
        let evt = Event::new("@completion");

        // "work" is a plain leaf with no activities and no completion
        // transition of its own; comp's region has not reached a final.
        assert!(select_completion(&model, work, &(), &evt, &|_| true, &|_| false).is_none());

        // Once the final substate is active, comp is eligible.
        let tid =
            select_completion(&model, sub_final, &(), &evt, &|_| true, &|_| false).unwrap();
        assert_eq!(model.transition(tid).source, leaf_by_path(&model, "/m/comp"));

        // But not while comp's activities are still running.
        let comp = leaf_by_path(&model, "/m/comp");
        let busy = |s: StateId| s != comp;
        assert!(select_completion(&model, sub_final, &(), &evt, &busy, &|_| false).is_none());
    }
}
