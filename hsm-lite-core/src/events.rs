//! Runtime event values and the per-instance audit trail.

use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::types::{EventId, TransitionId};

/// Reserved event names. They use a `@` prefix so they can never collide
/// with authored identifiers.
pub const INIT_EVENT: &str = "@init";
pub const COMPLETION_EVENT: &str = "@completion";

/// An event dispatched into a machine.
///
/// Events are identified by name; typed events additionally carry an opaque
/// payload that effects and tagged behaviors can downcast.
#[derive(Clone)]
pub struct Event {
    name: Arc<str>,
    payload: Option<Arc<dyn Any + Send + Sync>>,
}

impl Event {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            payload: None,
        }
    }

    /// A typed event named after `T`, carrying `value` as payload.
    pub fn typed<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            name: Arc::from(std::any::type_name::<T>()),
            payload: Some(Arc::new(value)),
        }
    }

    /// The synthetic event passed to entry behaviors during `start`.
    pub(crate) fn init() -> Self {
        Self::new(INIT_EVENT)
    }

    /// The synthetic marker used when firing completion transitions.
    pub(crate) fn completion() -> Self {
        Self::new(COMPLETION_EVENT)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Downcast the payload of a typed event.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_deref().and_then(|p| p.downcast_ref())
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.name)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

impl From<&str> for Event {
    fn from(name: &str) -> Self {
        Event::new(name)
    }
}

impl From<String> for Event {
    fn from(name: String) -> Self {
        Event::new(name)
    }
}

/// How a dispatched event keys into the model's event table. Unknown names
/// still match `Any` triggers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EventKey {
    Known(EventId),
    Unknown,
}

/// Runtime audit trail — one entry per observable engine action, appended in
/// dispatch order. Paths are absolute for diagnostics.
#[derive(Clone, Debug, Serialize)]
pub enum AuditEvent {
    Started {
        instance_id: Uuid,
    },
    TransitionFired {
        transition: TransitionId,
        from: String,
        to: String,
        event: String,
    },
    /// No applicable transition and no deferral: consumed silently.
    EventIgnored {
        event: String,
    },
    EventDeferred {
        event: String,
    },
    /// Deferral queue at capacity: event dropped.
    DeferralOverflow {
        event: String,
    },
    /// A replayed deferred event no longer matched or deferred anywhere.
    DeferredDiscarded {
        event: String,
    },
    /// A worker result arrived after its state was exited.
    StaleWorkerIgnored {
        state: String,
    },
    ActivityCompleted {
        state: String,
    },
    Stopped,
    Faulted {
        state: String,
    },
}
