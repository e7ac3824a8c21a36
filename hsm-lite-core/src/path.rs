//! Exit/entry path computation.
//!
//! The exit scope is decided by the *authored* target (composite or leaf);
//! initial and history chains extend the entry list only after the exits are
//! known, so a transition targeting an ancestor re-enters it and re-drills
//! its initial chain.

use std::collections::HashMap;

use crate::types::{NormalizedModel, StateId};

/// Exit set (deepest-first) and entry set (shallowest-first, ending at the
/// authored target) for one external transition.
pub(crate) struct TransitionPath {
    pub exit: Vec<StateId>,
    pub enter: Vec<StateId>,
}

pub(crate) fn compute<I>(
    model: &NormalizedModel<I>,
    active_leaf: StateId,
    declaring: StateId,
    authored_target: StateId,
) -> TransitionPath {
    let mut lca = Some(model.lca(declaring, authored_target));
    // A target at or above the declaring state is exited and re-entered:
    // hoist the boundary to its parent (None exits the whole chain).
    if lca == Some(authored_target) {
        lca = model.state(authored_target).parent;
    }

    let mut exit = Vec::new();
    let mut cursor = Some(active_leaf);
    while let Some(state) = cursor {
        if Some(state) == lca {
            break;
        }
        exit.push(state);
        cursor = model.state(state).parent;
    }

    let chain = model.chain(authored_target);
    let enter = match lca {
        Some(lca) => match chain.iter().position(|&s| s == lca) {
            Some(i) => chain[i + 1..].to_vec(),
            None => chain,
        },
        // Hoisted past the root: the target is the root itself.
        None => chain,
    };

    TransitionPath { exit, enter }
}

/// States strictly below `top` down to `bottom` inclusive, shallowest-first.
pub(crate) fn chain_below<I>(
    model: &NormalizedModel<I>,
    top: StateId,
    bottom: StateId,
) -> Vec<StateId> {
    let chain = model.chain(bottom);
    match chain.iter().position(|&s| s == top) {
        Some(i) => chain[i + 1..].to_vec(),
        None => vec![bottom],
    }
}

/// Follow `initial_target` links from `from` down to a leaf,
/// shallowest-first. `from` itself is not included.
pub(crate) fn initial_chain<I>(model: &NormalizedModel<I>, from: StateId) -> Vec<StateId> {
    let mut out = Vec::new();
    let mut cursor = from;
    while let Some(target) = model.state(cursor).initial_target {
        out.extend(chain_below(model, cursor, target));
        cursor = target;
    }
    out
}

/// Entry extension below an entered composite `target`, honoring history.
///
/// Shallow history re-enters the recorded direct child and then follows its
/// initial chain; deep history re-enters the recorded leaf exactly. With no
/// snapshot both fall back to the default initial chain. Called after the
/// exit sequence ran, so snapshots taken by this very transition apply.
pub(crate) fn history_extension<I>(
    model: &NormalizedModel<I>,
    target: StateId,
    deep: bool,
    history_shallow: &HashMap<StateId, StateId>,
    history_deep: &HashMap<StateId, StateId>,
) -> Vec<StateId> {
    if deep {
        match history_deep.get(&target) {
            Some(&leaf) => chain_below(model, target, leaf),
            None => initial_chain(model, target),
        }
    } else {
        match history_shallow.get(&target) {
            Some(&child) => {
                let mut out = vec![child];
                out.extend(initial_chain(model, child));
                out
            }
            None => initial_chain(model, target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::{define, state, transition};
    use crate::types::NormalizedModel;

    fn by_path(model: &NormalizedModel<()>, path: &str) -> StateId {
        model.states.iter().find(|s| s.path == path).unwrap().id
    }

    fn fixture() -> std::sync::Arc<NormalizedModel<()>> {
        define::<()>("m")
            .initial("p")
            .state(
                state("p")
                    .initial("a")
                    .state(
                        state("a")
                            .initial("a1")
                            .state(state("a1"))
                            .state(state("a2")),
                    )
                    .state(state("b")),
            )
            .state(state("q").transition(transition().on("X").to("/m/p")))
            .compile()
            .unwrap()
    }

    #[test]
    fn lca_bounds_exit_and_entry_sets() {
        let model = fixture();
        let a1 = by_path(&model, "/m/p/a/a1");
        let b = by_path(&model, "/m/p/b");
        let a = by_path(&model, "/m/p/a");
        let p = by_path(&model, "/m/p");

        // a1 → b: LCA is p; exit a1 then a; enter b.
        let path = compute(&model, a1, a1, b);
        assert_eq!(path.exit, vec![a1, a]);
        assert_eq!(path.enter, vec![b]);

        // No state at or above the LCA appears in either set.
        assert!(!path.exit.contains(&p));
        assert!(!path.enter.contains(&p));
    }

    #[test]
    fn ancestor_target_is_exited_and_reentered() {
        let model = fixture();
        let a1 = by_path(&model, "/m/p/a/a1");
        let a = by_path(&model, "/m/p/a");

        // A transition on a1 targeting its parent a exits both and
        // re-enters a.
        let path = compute(&model, a1, a1, a);
        assert_eq!(path.exit, vec![a1, a]);
        assert_eq!(path.enter, vec![a]);
        // Initial re-drill then descends to a1 again.
        assert_eq!(initial_chain(&model, a), vec![a1]);
    }

    #[test]
    fn self_transition_exits_and_reenters_the_leaf() {
        let model = fixture();
        let b = by_path(&model, "/m/p/b");
        let path = compute(&model, b, b, b);
        assert_eq!(path.exit, vec![b]);
        assert_eq!(path.enter, vec![b]);
    }

    #[test]
    fn initial_chain_follows_multi_level_links() {
        let model = fixture();
        let p = by_path(&model, "/m/p");
        let a = by_path(&model, "/m/p/a");
        let a1 = by_path(&model, "/m/p/a/a1");
        assert_eq!(initial_chain(&model, p), vec![a, a1]);
    }

    #[test]
    fn deep_history_restores_exact_leaf() {
        let model = fixture();
        let p = by_path(&model, "/m/p");
        let a = by_path(&model, "/m/p/a");
        let a2 = by_path(&model, "/m/p/a/a2");

        let mut deep = HashMap::new();
        deep.insert(p, a2);
        let shallow = HashMap::new();
        assert_eq!(
            history_extension(&model, p, true, &shallow, &deep),
            vec![a, a2]
        );
        // No snapshot: default initial chain.
        assert_eq!(
            history_extension(&model, p, true, &shallow, &HashMap::new()),
            vec![a, by_path(&model, "/m/p/a/a1")]
        );
    }

    #[test]
    fn shallow_history_restores_child_then_initial() {
        let model = fixture();
        let p = by_path(&model, "/m/p");
        let a = by_path(&model, "/m/p/a");
        let a1 = by_path(&model, "/m/p/a/a1");

        let mut shallow = HashMap::new();
        shallow.insert(p, a);
        assert_eq!(
            history_extension(&model, p, false, &shallow, &HashMap::new()),
            vec![a, a1]
        );
    }
}
