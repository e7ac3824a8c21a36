//! Behavior invocation order and event-tag selection.

mod common;

use hsm_lite_core::{define, state, transition, Machine};

#[derive(Default)]
struct Log {
    lines: Vec<String>,
}

impl Log {
    fn add(&mut self, line: &str) {
        self.lines.push(line.to_string());
    }
}

#[tokio::test]
async fn exit_effect_entry_run_in_order() {
    let model = define::<Log>("machine")
        .initial("state_a")
        .state(
            state("state_a")
                .entry(|_, log: &mut Log, _| log.add("entry_a"))
                .exit(|_, log: &mut Log, _| log.add("exit_a"))
                .transition(
                    transition()
                        .on("next")
                        .effect(|_, log: &mut Log, _| log.add("effect_ab"))
                        .to("state_b"),
                ),
        )
        .state(state("state_b").entry(|_, log: &mut Log, _| log.add("entry_b")))
        .compile()
        .unwrap();

    let machine = Machine::new(model, Log::default());
    machine.start().await.unwrap();
    assert_eq!(machine.with_instance(|log| log.lines.clone()), ["entry_a"]);
    machine.with_instance_mut(|log| log.lines.clear());

    machine.dispatch("next").await.unwrap();
    assert_eq!(
        machine.with_instance(|log| log.lines.clone()),
        ["exit_a", "effect_ab", "entry_b"]
    );
    assert_eq!(machine.state().await, "/machine/state_b");
}

#[tokio::test]
async fn parent_enters_before_child_and_exits_after() {
    let model = define::<Log>("machine")
        .initial("/machine/p/c")
        .state(
            state("p")
                .entry(|_, log: &mut Log, _| log.add("entry_p"))
                .exit(|_, log: &mut Log, _| log.add("exit_p"))
                .state(
                    state("c")
                        .entry(|_, log: &mut Log, _| log.add("entry_c"))
                        .exit(|_, log: &mut Log, _| log.add("exit_c"))
                        .transition(transition().on("out").to("/machine/other")),
                ),
        )
        .state(state("other"))
        .compile()
        .unwrap();

    let machine = Machine::new(model, Log::default());
    machine.start().await.unwrap();
    assert_eq!(
        machine.with_instance(|log| log.lines.clone()),
        ["entry_p", "entry_c"]
    );
    machine.with_instance_mut(|log| log.lines.clear());

    machine.dispatch("out").await.unwrap();
    assert_eq!(
        machine.with_instance(|log| log.lines.clone()),
        ["exit_c", "exit_p"]
    );
}

/// A transition declared on a composite targeting its own child keeps the
/// composite entered: only the child is entered.
#[tokio::test]
async fn composite_to_child_does_not_reenter_composite() {
    let model = define::<Log>("machine")
        .initial("/machine/parent/c1")
        .state(
            state("parent")
                .entry(|_, log: &mut Log, _| log.add("entry_parent"))
                .exit(|_, log: &mut Log, _| log.add("exit_parent"))
                .transition(transition().on("TO_C2").to("c2"))
                .state(state("c1").exit(|_, log: &mut Log, _| log.add("exit_c1")))
                .state(state("c2").entry(|_, log: &mut Log, _| log.add("entry_c2"))),
        )
        .compile()
        .unwrap();

    let machine = Machine::new(model, Log::default());
    machine.start().await.unwrap();
    machine.with_instance_mut(|log| log.lines.clear());

    machine.dispatch("TO_C2").await.unwrap();
    assert_eq!(machine.state().await, "/machine/parent/c2");
    assert_eq!(
        machine.with_instance(|log| log.lines.clone()),
        ["exit_c1", "entry_c2"]
    );
}

#[tokio::test]
async fn guard_rejection_falls_through() {
    let model = define::<Log>("machine")
        .initial("start")
        .state(
            state("start")
                .transition(transition().on("go").guard(|_, _| false).to("blocked"))
                .transition(transition().on("go").guard(|_, _| true).to("allowed")),
        )
        .state(state("blocked"))
        .state(state("allowed"))
        .compile()
        .unwrap();

    let machine = Machine::new(model, Log::default());
    machine.start().await.unwrap();
    machine.dispatch("go").await.unwrap();
    assert_eq!(machine.state().await, "/machine/allowed");
}

/// Tagged entry behaviors run only for their own event; untagged ones run
/// for every event including the start's init marker.
#[tokio::test]
async fn tagged_entries_select_on_event_name() {
    let model = define::<Log>("machine")
        .initial("a")
        .state(
            state("a").transition(transition().on("PING").to("b")).transition(
                transition().on("PONG").to("b"),
            ),
        )
        .state(
            state("b")
                .entry(|_, log: &mut Log, _| log.add("entry_any"))
                .entry_for("PING", |_, log: &mut Log, _| log.add("entry_ping")),
        )
        .compile()
        .unwrap();

    let machine = Machine::new(model, Log::default());
    machine.start().await.unwrap();
    machine.dispatch("PONG").await.unwrap();
    assert_eq!(
        machine.with_instance(|log| log.lines.clone()),
        ["entry_any"]
    );
    machine.with_instance_mut(|log| log.lines.clear());

    let machine2 = {
        let model = define::<Log>("machine")
            .initial("a")
            .state(state("a").transition(transition().on("PING").to("b")))
            .state(
                state("b")
                    .entry(|_, log: &mut Log, _| log.add("entry_any"))
                    .entry_for("PING", |_, log: &mut Log, _| log.add("entry_ping")),
            )
            .compile()
            .unwrap();
        Machine::new(model, Log::default())
    };
    machine2.start().await.unwrap();
    machine2.dispatch("PING").await.unwrap();
    // Both the untagged and the matching tagged behavior run, in authoring
    // order.
    assert_eq!(
        machine2.with_instance(|log| log.lines.clone()),
        ["entry_any", "entry_ping"]
    );
}
