//! HSM-Lite: a hierarchical state machine runtime.
//!
//! A machine is authored as a tree of states (`dsl`), normalized once into
//! flat immutable tables (`compiler` → `NormalizedModel`), and driven per
//! instance by a serialized dispatch loop (`Machine`) with UML-style
//! transition priority, LCA-based entry/exit paths, history pseudostates,
//! event deferral, and per-state timer/activity workers with prompt
//! cancellation.
//!
//! ```no_run
//! use hsm_lite_core::{define, state, transition, Machine};
//!
//! # #[tokio::main] async fn main() -> anyhow::Result<()> {
//! let model = define::<()>("TrafficLight")
//!     .initial("red")
//!     .state(state("red").transition(transition().on("TIMER").to("green")))
//!     .state(state("green").transition(transition().on("TIMER").to("yellow")))
//!     .state(state("yellow").transition(transition().on("TIMER").to("red")))
//!     .compile()?;
//!
//! let machine = Machine::new(model, ());
//! machine.start().await?;
//! machine.dispatch("TIMER").await?;
//! assert_eq!(machine.state().await, "/TrafficLight/green");
//! # Ok(()) }
//! ```

pub mod compiler;
mod defer;
pub mod dsl;
pub mod events;
pub mod intern;
pub mod machine;
mod path;
pub mod providers;
mod resolver;
pub mod timers;
pub mod types;

pub use compiler::{BuildError, Finding, Findings};
pub use dsl::{choice, define, final_state, state, transition, StateDef, TransitionDef};
pub use events::{AuditEvent, Event};
pub use machine::{ActionCtx, Machine, MachineError};
pub use providers::{
    CancelSignal, Clock, Providers, Sleeper, Spawner, SteadyClock, TaskFuture, TaskHandle,
    Timepoint, TokioSleeper, TokioSpawner,
};
pub use types::{
    EventId, MachineConfig, NormalizedModel, StateId, StateKind, TargetSpec, TransitionId,
};
