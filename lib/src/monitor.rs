use serde::{Deserialize, Serialize};

use crate::dht_messages::{LockId, NodeId};

/// Lifecycle notifications a node reports to the monitoring collector.
///
/// Start/end pairs let the collector time lookups and key operations; the stability
/// verdicts let it measure how long the ring takes to converge after a membership change.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    Connected { node_id: NodeId },
    Disconnected { node_id: NodeId },
    Stable,
    NotStable,
    StartLookup,
    EndOfLookup,
    StartInsertKey,
    EndInsertKey,
    StartFindKey,
    EndFindKey,
}

impl MonitorEvent {
    pub fn stability(stable: bool) -> Self {
        if stable {
            MonitorEvent::Stable
        } else {
            MonitorEvent::NotStable
        }
    }
}

/// Node to collector.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MonitorMessage {
    pub lock_id: LockId,
    pub event: MonitorEvent,
}

/// Collector to node, acknowledging the message with the same lock id.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorAck {
    pub lock_id: LockId,
}
