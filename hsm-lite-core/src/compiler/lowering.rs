//! Lowering: authored definition tree → flat normalized tables.
//!
//! One pre-order pass assigns StateIds and paths, a second pass interns
//! event names and behavior tags, and a third resolves transition targets
//! and initial designations against the finished path table.

use std::collections::{HashMap, HashSet};

use sha2::{Digest, Sha256};

use super::{verifier, BuildError, Finding, Findings};
use crate::dsl::{DefKind, StateDef, TagName, TargetDef, TransitionDef, TriggerDef};
use crate::intern::{name_hash, path_hash, NameTable};
use crate::types::{
    ActionFn, ActivityFn, EventId, EventTag, NormalizedModel, State, StateId, StateKind,
    TaggedAction, Transition, TransitionId, Trigger, TargetSpec,
};

/// A definition node flattened into pre-order position.
struct FlatDef<I> {
    name: String,
    kind: DefKind,
    parent: Option<StateId>,
    depth: u32,
    path: String,
    initial: Option<String>,
    entries: Vec<(TagName, ActionFn<I>)>,
    exits: Vec<(TagName, ActionFn<I>)>,
    activities: Vec<ActivityFn<I>>,
    defers: Vec<String>,
    transitions: Vec<TransitionDef<I>>,
    children: Vec<StateId>,
}

fn flatten<I>(
    def: StateDef<I>,
    parent: Option<StateId>,
    depth: u32,
    parent_path: &str,
    out: &mut Vec<FlatDef<I>>,
) -> StateId {
    let StateDef {
        name,
        kind,
        initial,
        entries,
        exits,
        activities,
        defers,
        transitions,
        children,
    } = def;

    let path = format!("{}/{}", parent_path, name);
    let id = out.len() as StateId;
    out.push(FlatDef {
        name,
        kind,
        parent,
        depth,
        path: path.clone(),
        initial,
        entries,
        exits,
        activities,
        defers,
        transitions,
        children: Vec::new(),
    });
    for child in children {
        let child_id = flatten(child, Some(id), depth + 1, &path, out);
        out[id as usize].children.push(child_id);
    }
    id
}

/// Event interning with collision detection against the shared name table.
struct EventTable {
    ids: HashMap<String, EventId>,
    names: Vec<String>,
}

impl EventTable {
    fn new() -> Self {
        Self {
            ids: HashMap::new(),
            names: Vec::new(),
        }
    }

    fn intern(&mut self, name: &str, names: &mut NameTable, findings: &mut Vec<Finding>) -> EventId {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        if let Some(other) = names.insert(name_hash(name), name) {
            findings.push(Finding::new(
                format!("name hash collision between '{other}' and '{name}'"),
                None,
            ));
        }
        let id = self.names.len() as EventId;
        self.ids.insert(name.to_string(), id);
        self.names.push(name.to_string());
        id
    }
}

pub(crate) fn normalize<I>(root: StateDef<I>) -> Result<NormalizedModel<I>, BuildError> {
    let mut findings = verifier::verify(&root);

    let model_name = root.name.clone();
    let mut flat: Vec<FlatDef<I>> = Vec::new();
    flatten(root, None, 0, "", &mut flat);

    // Path table and interner collision checks.
    let mut paths: HashMap<String, StateId> = HashMap::new();
    let mut names = NameTable::new();
    let mut path_names = NameTable::new();
    for (id, def) in flat.iter().enumerate() {
        if let Some(other) = names.insert(name_hash(&def.name), &def.name) {
            findings.push(Finding::new(
                format!("name hash collision between '{other}' and '{}'", def.name),
                Some(&def.path),
            ));
        }
        let segments = def.path.split('/').filter(|s| !s.is_empty());
        if let Some(other) = path_names.insert(path_hash(segments), &def.path) {
            findings.push(Finding::new(
                format!("path hash collision between '{other}' and '{}'", def.path),
                Some(&def.path),
            ));
        }
        paths.insert(def.path.clone(), id as StateId);
    }

    // Intern behavior tags and deferred event names in pre-order.
    let mut events = EventTable::new();
    let mut state_entries: Vec<Vec<TaggedAction<I>>> = Vec::with_capacity(flat.len());
    let mut state_exits: Vec<Vec<TaggedAction<I>>> = Vec::with_capacity(flat.len());
    let mut state_deferred: Vec<HashSet<EventId>> = Vec::with_capacity(flat.len());
    for def in &mut flat {
        let to_tagged = |list: &mut Vec<(TagName, ActionFn<I>)>,
                         events: &mut EventTable,
                         names: &mut NameTable,
                         findings: &mut Vec<Finding>| {
            std::mem::take(list)
                .into_iter()
                .map(|(tag, run)| TaggedAction {
                    tag: match tag {
                        None => EventTag::Any,
                        Some(name) => EventTag::Event(events.intern(&name, names, findings)),
                    },
                    run,
                })
                .collect::<Vec<_>>()
        };
        state_entries.push(to_tagged(&mut def.entries, &mut events, &mut names, &mut findings));
        state_exits.push(to_tagged(&mut def.exits, &mut events, &mut names, &mut findings));
        let deferred: HashSet<EventId> = std::mem::take(&mut def.defers)
            .iter()
            .map(|name| events.intern(name, &mut names, &mut findings))
            .collect();
        state_deferred.push(deferred);
    }

    // Resolve transitions.
    let mut transitions: Vec<Transition<I>> = Vec::new();
    let mut outgoing: Vec<Vec<TransitionId>> = vec![Vec::new(); flat.len()];
    let mut entered_as_target: HashSet<StateId> = HashSet::new();
    for source in 0..flat.len() {
        let defs = std::mem::take(&mut flat[source].transitions);
        for def in defs {
            let id = transitions.len() as TransitionId;
            let TransitionDef {
                trigger,
                guard,
                effect,
                target,
            } = def;
            let trigger = match trigger {
                TriggerDef::Completion => Trigger::Completion,
                TriggerDef::Event(name) => {
                    Trigger::Event(events.intern(&name, &mut names, &mut findings))
                }
                TriggerDef::Any => Trigger::Any,
                TriggerDef::After(f) => Trigger::After(f),
                TriggerDef::At(f) => Trigger::At(f),
                TriggerDef::Every(f) => Trigger::Every(f),
                TriggerDef::When(f) => Trigger::When(f),
            };
            let target = resolve_target(
                source as StateId,
                &target,
                &flat,
                &paths,
                &mut entered_as_target,
                &mut findings,
            );
            outgoing[source].push(id);
            transitions.push(Transition {
                id,
                source: source as StateId,
                trigger,
                guard,
                effect,
                target,
            });
        }
    }

    // An unguarded completion transition back onto its own source can never
    // reach a stable configuration.
    for t in &transitions {
        if matches!(t.trigger, Trigger::Completion)
            && t.guard.is_none()
            && t.target == TargetSpec::External(t.source)
        {
            findings.push(Finding::new(
                "unguarded completion self-transition never stabilizes",
                Some(&flat[t.source as usize].path),
            ));
        }
    }

    // Resolve initial designations.
    let mut initial_targets: Vec<Option<StateId>> = vec![None; flat.len()];
    for (id, def) in flat.iter().enumerate() {
        let Some(spec) = &def.initial else { continue };
        match resolve_initial(id as StateId, spec, def, &paths, &flat) {
            Ok(target) => {
                initial_targets[id] = Some(target);
                entered_as_target.insert(target);
            }
            Err(message) => findings.push(Finding::new(message, Some(&def.path))),
        }
    }

    // A composite entered as the ultimate target needs an initial chain;
    // composites that are only passed through to deeper targets do not.
    entered_as_target.insert(0);
    for &id in &entered_as_target {
        let def = &flat[id as usize];
        if !def.children.is_empty()
            && def.kind == DefKind::Normal
            && initial_targets[id as usize].is_none()
        {
            findings.push(Finding::new(
                "composite has substates but no initial designation",
                Some(&def.path),
            ));
        }
    }

    if !findings.is_empty() {
        return Err(BuildError::Verification(Findings(findings)));
    }

    // Assemble the state table.
    let mut ancestors: Vec<Vec<StateId>> = Vec::with_capacity(flat.len());
    for def in &flat {
        let mut chain = Vec::with_capacity(def.depth as usize);
        let mut cur = def.parent;
        while let Some(p) = cur {
            chain.push(p);
            cur = flat[p as usize].parent;
        }
        chain.reverse();
        ancestors.push(chain);
    }

    let mut states: Vec<State<I>> = Vec::with_capacity(flat.len());
    for (id, def) in flat.iter_mut().enumerate() {
        let kind = match def.kind {
            DefKind::Final => StateKind::Final,
            DefKind::Choice => StateKind::Choice,
            DefKind::Normal if def.children.is_empty() => StateKind::Leaf,
            DefKind::Normal => StateKind::Composite,
        };
        let deferred = state_deferred[id].clone();
        let mut deferred_inherited = deferred.clone();
        for &anc in &ancestors[id] {
            deferred_inherited.extend(state_deferred[anc as usize].iter().copied());
        }
        let out = outgoing[id].clone();
        let timed = out
            .iter()
            .copied()
            .filter(|&t| transitions[t as usize].trigger.is_timed())
            .collect();
        let segments = def.path.split('/').filter(|s| !s.is_empty());
        states.push(State {
            id: id as StateId,
            parent: def.parent,
            depth: def.depth,
            kind,
            name: std::mem::take(&mut def.name),
            name_hash: name_hash(&flat_name(&def.path)),
            path: def.path.clone(),
            path_hash: path_hash(segments),
            initial_target: initial_targets[id],
            entries: std::mem::take(&mut state_entries[id]),
            exits: std::mem::take(&mut state_exits[id]),
            activities: std::mem::take(&mut def.activities),
            deferred,
            deferred_inherited,
            outgoing: out,
            timed,
            children: std::mem::take(&mut def.children),
        });
    }

    let fingerprint = fingerprint(&model_name, &states, &transitions, &events.names);

    Ok(NormalizedModel {
        name: model_name,
        states,
        transitions,
        events: events.ids,
        event_names: events.names,
        root: 0,
        ancestors,
        fingerprint,
    })
}

fn flat_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or_default().to_string()
}

fn resolve_target<I>(
    source: StateId,
    target: &TargetDef,
    flat: &[FlatDef<I>],
    paths: &HashMap<String, StateId>,
    entered: &mut HashSet<StateId>,
    findings: &mut Vec<Finding>,
) -> TargetSpec {
    let source_path = &flat[source as usize].path;
    let (spec_path, history) = match target {
        TargetDef::Internal => return TargetSpec::Internal,
        TargetDef::Path(p) => (p, None),
        TargetDef::ShallowHistory(p) => (p, Some(false)),
        TargetDef::DeepHistory(p) => (p, Some(true)),
    };
    let resolved = match resolve_state_ref(source, spec_path, flat, paths) {
        Ok(id) => id,
        Err(message) => {
            findings.push(Finding::new(message, Some(source_path)));
            return TargetSpec::Internal;
        }
    };
    match history {
        None => {
            entered.insert(resolved);
            TargetSpec::External(resolved)
        }
        Some(deep) => {
            if flat[resolved as usize].children.is_empty() {
                findings.push(Finding::new(
                    format!(
                        "history target '{}' is not a composite",
                        flat[resolved as usize].path
                    ),
                    Some(source_path),
                ));
            }
            // History targets are exempt from the initial-designation rule:
            // a composite reachable only via history restores its snapshot,
            // and without one the entry stops at the composite itself.
            if deep {
                TargetSpec::DeepHistory(resolved)
            } else {
                TargetSpec::ShallowHistory(resolved)
            }
        }
    }
}

/// Resolve a path reference from the scope of `source`.
///
/// Absolute paths match the path table directly. Relative paths try, in
/// order: direct child of the source, sibling under the same parent, then
/// children of each ancestor walking up. Leading `../` segments step the
/// scope up before resolution.
fn resolve_state_ref<I>(
    source: StateId,
    spec: &str,
    flat: &[FlatDef<I>],
    paths: &HashMap<String, StateId>,
) -> Result<StateId, String> {
    if spec.is_empty() {
        return Err("empty target path".to_string());
    }
    if let Some(rest) = spec.strip_prefix('/') {
        if rest.is_empty() || rest.ends_with('/') || rest.contains("//") {
            return Err(format!("malformed absolute path '{spec}'"));
        }
        return paths
            .get(spec)
            .copied()
            .ok_or_else(|| format!("unresolved target '{spec}'"));
    }

    let mut scope = source;
    let mut rest = spec;
    while let Some(stripped) = rest.strip_prefix("../") {
        scope = flat[scope as usize]
            .parent
            .ok_or_else(|| format!("target '{spec}' steps above the machine root"))?;
        rest = stripped;
    }
    if rest.is_empty() || rest.ends_with('/') || rest.contains("//") {
        return Err(format!("malformed target path '{spec}'"));
    }

    let mut cursor = Some(scope);
    while let Some(at) = cursor {
        let candidate = format!("{}/{}", flat[at as usize].path, rest);
        if let Some(&id) = paths.get(&candidate) {
            return Ok(id);
        }
        cursor = flat[at as usize].parent;
    }
    Err(format!("unresolved target '{spec}'"))
}

fn resolve_initial<I>(
    state: StateId,
    spec: &str,
    def: &FlatDef<I>,
    paths: &HashMap<String, StateId>,
    flat: &[FlatDef<I>],
) -> Result<StateId, String> {
    let resolved = if spec.starts_with('/') {
        paths
            .get(spec)
            .copied()
            .ok_or_else(|| format!("unresolved initial target '{spec}'"))?
    } else {
        let candidate = format!("{}/{}", def.path, spec);
        paths
            .get(&candidate)
            .copied()
            .ok_or_else(|| format!("unresolved initial target '{spec}'"))?
    };
    let prefix = format!("{}/", def.path);
    if resolved == state || !flat[resolved as usize].path.starts_with(&prefix) {
        return Err(format!(
            "initial target '{spec}' is not a descendant of the composite"
        ));
    }
    Ok(resolved)
}

fn fingerprint<I>(
    name: &str,
    states: &[State<I>],
    transitions: &[Transition<I>],
    event_names: &[String],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    for s in states {
        hasher.update(s.path.as_bytes());
        hasher.update([s.kind as u8]);
        hasher.update(s.parent.unwrap_or(u32::MAX).to_le_bytes());
        hasher.update(s.initial_target.unwrap_or(u32::MAX).to_le_bytes());
        hasher.update((s.entries.len() as u32).to_le_bytes());
        hasher.update((s.exits.len() as u32).to_le_bytes());
        hasher.update((s.activities.len() as u32).to_le_bytes());
    }
    for t in transitions {
        hasher.update(t.source.to_le_bytes());
        hasher.update(t.trigger.kind_name().as_bytes());
        let (tag, id) = match t.target {
            TargetSpec::Internal => (0u8, u32::MAX),
            TargetSpec::External(s) => (1, s),
            TargetSpec::ShallowHistory(s) => (2, s),
            TargetSpec::DeepHistory(s) => (3, s),
        };
        hasher.update([tag]);
        hasher.update(id.to_le_bytes());
    }
    for e in event_names {
        hasher.update(e.as_bytes());
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use crate::dsl::{define, final_state, state, transition};
    use crate::types::{StateKind, TargetSpec, Trigger};

    #[test]
    fn assigns_preorder_ids_and_paths() {
        let model = define::<()>("m")
            .initial("a")
            .state(
                state("a")
                    .initial("a1")
                    .state(state("a1"))
                    .state(state("a2")),
            )
            .state(state("b"))
            .compile()
            .unwrap();

        assert_eq!(model.states.len(), 5);
        assert_eq!(model.path(0), "/m");
        assert_eq!(model.path(1), "/m/a");
        assert_eq!(model.path(2), "/m/a/a1");
        assert_eq!(model.path(3), "/m/a/a2");
        assert_eq!(model.path(4), "/m/b");
        assert_eq!(model.state(2).depth, 2);
        assert_eq!(model.state(2).parent, Some(1));
        assert_eq!(model.ancestors[2], vec![0, 1]);
        assert_eq!(model.state(0).kind, StateKind::Composite);
        assert_eq!(model.state(4).kind, StateKind::Leaf);
    }

    #[test]
    fn resolves_relative_targets_child_then_sibling_then_ancestor() {
        let model = define::<()>("m")
            .initial("p")
            .state(
                state("p")
                    .initial("c")
                    .transition(transition().on("TO_CHILD").to("c"))
                    .state(state("c").transition(transition().on("UP").to("q"))),
            )
            .state(state("q"))
            .compile()
            .unwrap();

        // p's target "c" resolves to its direct child.
        let to_child = &model.transitions[0];
        assert_eq!(to_child.target, TargetSpec::External(2));
        // c's target "q" ascends to the root's child.
        let up = &model.transitions[1];
        assert_eq!(up.target, TargetSpec::External(3));
    }

    #[test]
    fn resolves_parent_relative_targets() {
        let model = define::<()>("m")
            .initial("p")
            .state(
                state("p")
                    .initial("a")
                    .state(state("a").transition(transition().on("X").to("../b")))
                    .state(state("b")),
            )
            .compile()
            .unwrap();
        assert_eq!(model.transitions[0].target, TargetSpec::External(3));
    }

    #[test]
    fn interns_events_in_authoring_order() {
        let model = define::<()>("m")
            .initial("a")
            .state(
                state("a")
                    .defer("HELD")
                    .transition(transition().on("GO").to("b")),
            )
            .state(state("b").transition(transition().on("HELD").to("a")))
            .compile()
            .unwrap();

        assert_eq!(model.event_id("HELD"), Some(0));
        assert_eq!(model.event_id("GO"), Some(1));
        assert_eq!(model.event_id("MISSING"), None);
        assert!(model.state(1).deferred.contains(&0));
        assert!(model.state(1).deferred_inherited.contains(&0));
    }

    #[test]
    fn inherits_deferred_events_from_ancestors() {
        let model = define::<()>("m")
            .initial("p")
            .state(
                state("p")
                    .defer("HELD")
                    .initial("c")
                    .state(state("c")),
            )
            .compile()
            .unwrap();
        let held = model.event_id("HELD").unwrap();
        let c = model.events.len() as u32; // one event interned
        assert_eq!(c, 1);
        assert!(!model.state(2).deferred.contains(&held));
        assert!(model.state(2).deferred_inherited.contains(&held));
    }

    #[test]
    fn rejects_unresolved_and_malformed_targets() {
        let err = define::<()>("m")
            .initial("a")
            .state(state("a").transition(transition().on("X").to("nowhere")))
            .compile()
            .unwrap_err();
        assert!(err.findings().iter().any(|f| f.message.contains("unresolved")));

        let err = define::<()>("m")
            .initial("a")
            .state(state("a").transition(transition().on("X").to("/m//a")))
            .compile()
            .unwrap_err();
        assert!(err.findings().iter().any(|f| f.message.contains("malformed")));
    }

    #[test]
    fn rejects_targeted_composite_without_initial() {
        let err = define::<()>("m")
            .initial("a")
            .state(state("a").transition(transition().on("X").to("/m/p")))
            .state(state("p").state(state("c")))
            .compile()
            .unwrap_err();
        assert!(err
            .findings()
            .iter()
            .any(|f| f.message.contains("no initial")));
    }

    #[test]
    fn allows_pass_through_composite_without_initial() {
        let model = define::<()>("m")
            .initial("/m/p/c")
            .state(state("p").state(state("c")))
            .compile();
        assert!(model.is_ok());
    }

    #[test]
    fn rejects_history_target_on_leaf() {
        let err = define::<()>("m")
            .initial("a")
            .state(state("a").transition(transition().on("X").to_deep_history("b")))
            .state(state("b"))
            .compile()
            .unwrap_err();
        assert!(err
            .findings()
            .iter()
            .any(|f| f.message.contains("not a composite")));
    }

    #[test]
    fn rejects_unguarded_completion_self_loop() {
        let err = define::<()>("m")
            .initial("a")
            .state(state("a").transition(transition().to("a")))
            .compile()
            .unwrap_err();
        assert!(err
            .findings()
            .iter()
            .any(|f| f.message.contains("never stabilizes")));
    }

    #[test]
    fn timed_transitions_are_indexed_separately() {
        let model = define::<()>("m")
            .initial("a")
            .state(
                state("a")
                    .transition(transition().after(|_| std::time::Duration::from_millis(5)).to("b"))
                    .transition(transition().on("GO").to("b")),
            )
            .state(state("b"))
            .compile()
            .unwrap();
        assert_eq!(model.state(1).outgoing.len(), 2);
        assert_eq!(model.state(1).timed, vec![0]);
        assert!(matches!(model.transitions[0].trigger, Trigger::After(_)));
    }

    #[test]
    fn fingerprint_is_stable_per_shape() {
        let build = || {
            define::<()>("m")
                .initial("a")
                .state(state("a").transition(transition().on("GO").to("end")))
                .state(final_state("end"))
                .compile()
                .unwrap()
        };
        assert_eq!(build().fingerprint, build().fingerprint);
    }
}
