//! Structural verification of the authored definition tree.
//!
//! Returns the full list of findings; an empty list means the tree is fit
//! for lowering. Target resolution and initial-chain checks need the id
//! tables and happen in `lowering`.

use std::collections::HashSet;

use super::Finding;
use crate::dsl::{DefKind, StateDef, TargetDef, TransitionDef, TriggerDef};

pub(super) fn verify<I>(root: &StateDef<I>) -> Vec<Finding> {
    let mut findings = Vec::new();
    if root.name.is_empty() {
        findings.push(Finding::new("machine name must not be empty", None));
    }
    let root_path = format!("/{}", root.name);
    verify_state(root, &root_path, &mut findings);
    findings
}

fn verify_state<I>(state: &StateDef<I>, path: &str, findings: &mut Vec<Finding>) {
    check_name(&state.name, path, findings);

    match state.kind {
        DefKind::Final => verify_final(state, path, findings),
        DefKind::Choice => verify_choice(state, path, findings),
        DefKind::Normal => {}
    }

    for (tag, _) in state.entries.iter().chain(state.exits.iter()) {
        if let Some(tag) = tag {
            check_event_name(tag, "behavior event tag", path, findings);
        }
    }

    for event in &state.defers {
        check_event_name(event, "deferred event name", path, findings);
    }

    for t in &state.transitions {
        verify_transition(t, path, findings);
    }

    let mut seen = HashSet::new();
    for child in &state.children {
        if !seen.insert(child.name.as_str()) {
            findings.push(Finding::new(
                format!("duplicate state name '{}' among siblings", child.name),
                Some(path),
            ));
        }
        let child_path = format!("{}/{}", path, child.name);
        verify_state(child, &child_path, findings);
    }
}

fn verify_final<I>(state: &StateDef<I>, path: &str, findings: &mut Vec<Finding>) {
    if !state.entries.is_empty() || !state.exits.is_empty() || !state.activities.is_empty() {
        findings.push(Finding::new("final state must not have behaviors", Some(path)));
    }
    if !state.transitions.is_empty() {
        findings.push(Finding::new(
            "final state must not have outgoing transitions",
            Some(path),
        ));
    }
    if !state.children.is_empty() || state.initial.is_some() {
        findings.push(Finding::new("final state must not have substates", Some(path)));
    }
    if !state.defers.is_empty() {
        findings.push(Finding::new("final state must not defer events", Some(path)));
    }
}

fn verify_choice<I>(state: &StateDef<I>, path: &str, findings: &mut Vec<Finding>) {
    if !state.children.is_empty() || state.initial.is_some() {
        findings.push(Finding::new("choice must not have substates", Some(path)));
    }
    if !state.entries.is_empty() || !state.exits.is_empty() || !state.activities.is_empty() {
        findings.push(Finding::new("choice must not have behaviors", Some(path)));
    }
    if state.transitions.is_empty() {
        findings.push(Finding::new(
            "choice must have at least one outgoing transition",
            Some(path),
        ));
    }
    let mut has_default = false;
    for t in &state.transitions {
        if !matches!(t.trigger, TriggerDef::Completion) {
            findings.push(Finding::new(
                "choice transitions must be completion transitions (no trigger)",
                Some(path),
            ));
        }
        if t.guard.is_none() {
            has_default = true;
        }
        if matches!(t.target, TargetDef::Internal) {
            findings.push(Finding::new(
                "choice transitions must have a target",
                Some(path),
            ));
        }
    }
    if !state.transitions.is_empty() && !has_default {
        findings.push(Finding::new(
            "choice must have an unguarded default transition",
            Some(path),
        ));
    }
}

fn verify_transition<I>(t: &TransitionDef<I>, path: &str, findings: &mut Vec<Finding>) {
    if let TriggerDef::Event(name) = &t.trigger {
        check_event_name(name, "event name", path, findings);
    }
    let target_path = match &t.target {
        TargetDef::Internal => return,
        TargetDef::Path(p) | TargetDef::ShallowHistory(p) | TargetDef::DeepHistory(p) => p,
    };
    if target_path.is_empty() {
        findings.push(Finding::new("transition target must not be empty", Some(path)));
    }
}

fn check_event_name(name: &str, what: &str, path: &str, findings: &mut Vec<Finding>) {
    if name.is_empty() {
        findings.push(Finding::new(format!("{what} must not be empty"), Some(path)));
    } else if name.starts_with('@') {
        findings.push(Finding::new(
            format!("{what} '{name}' must not start with '@' (reserved)"),
            Some(path),
        ));
    }
}

fn check_name(name: &str, path: &str, findings: &mut Vec<Finding>) {
    if name.is_empty() {
        findings.push(Finding::new("state name must not be empty", Some(path)));
    } else if name.contains('/') {
        findings.push(Finding::new(
            format!("state name '{name}' must not contain '/'"),
            Some(path),
        ));
    } else if name.starts_with('@') {
        findings.push(Finding::new(
            format!("state name '{name}' must not start with '@' (reserved)"),
            Some(path),
        ));
    }
}
