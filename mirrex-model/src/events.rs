use serde::{Deserialize, Serialize};

/// Notification received from (or synthesized about) a single child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildEvent {
    Up,
    Down,
    Connecting,
    /// Ping latency sample, milliseconds.
    Ping(i64),
    SomeDescendantUp,
    SomeDescendantDown,
}

impl ChildEvent {
    /// Events that stand in for "last heard" state. Ping samples do not
    /// update last_event.
    pub fn is_state(self) -> bool {
        !matches!(self, ChildEvent::Ping(_))
    }
}

/// Aggregate event the replica set propagates to its parent layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEvent {
    Up,
    Down,
    Connecting,
    SomeDescendantUp,
    SomeDescendantDown,
    QuorumMet,
    QuorumLost,
}
