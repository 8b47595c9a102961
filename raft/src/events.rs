use serde::Serialize;

use crate::msg::{Millis, NodeId, Term};

/// Milestones recorded by the engine for metrics and logging. Drained with
/// `Simulation::drain_events`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SimEvent {
    LeaderCrashed {
        id: NodeId,
        term: Term,
        at_ms: Millis,
    },
    ElectionStarted {
        at_ms: Millis,
    },
    LeaderElected {
        id: NodeId,
        term: Term,
        at_ms: Millis,
    },
    FirstHeartbeat {
        id: NodeId,
        term: Term,
        at_ms: Millis,
    },
    CommandAccepted {
        index: usize,
        term: Term,
        at_ms: Millis,
    },
    /// The majority ledger grew to include `index`.
    Committed {
        index: usize,
        term: Term,
        at_ms: Millis,
    },
    AutoReset {
        alive: usize,
    },
}
