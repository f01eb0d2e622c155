use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Position of a node or key on the ring, always reduced to the ring's m bits.
pub type NodeId = u64;

/// Correlation id pairing a request with its response on one channel.
pub type LockId = u64;

/// Handle to a peer on the ring. Identity is the node id alone, so two handles with the
/// same id compare equal even if they were learnt through different addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: String,
    pub port: u16,
}

impl NodeInfo {
    pub fn new(id: NodeId, address: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            address: address.into(),
            port,
        }
    }

    /// `host:port` form suitable for `TcpStream::connect`.
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl PartialEq for NodeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeInfo {}

impl Hash for NodeInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.address, self.port)
    }
}

/// One frame on the wire. Requests that expect an answer get a fresh `lock_id` from the
/// sender; the response travels back under the same id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub lock_id: LockId,
    pub message: DhtMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DhtMessage {
    // First frame on an outbound connection, identifies the connecting node
    Hello {
        node: NodeInfo,
    },
    // Find the node responsible for `id`
    FindSuccessor {
        id: NodeId,
    },
    // Response to FindSuccessor, `None` when the lookup failed on the remote side
    FoundSuccessor {
        node: Option<NodeInfo>,
    },
    // Notify a node that we believe we are its predecessor
    Notify {
        node: NodeInfo,
    },
    // Request for a node's predecessor
    GetPredecessor,
    // Response with a node's predecessor
    Predecessor {
        node: Option<NodeInfo>,
    },
    GetSuccessorList,
    SuccessorList {
        nodes: Vec<NodeInfo>,
    },
    GetDimFingerTable,
    DimFingerTable {
        dim: u32,
    },
    GetInitialSocketPort,
    InitialSocketPort {
        port: u16,
    },
    // Store a key-value pair on the receiving node, ownership is already established
    AddKey {
        key: NodeId,
        value: Vec<u8>,
    },
    // Response to AddKey naming the node that stored the entry
    KeyAdded {
        owner: NodeInfo,
    },
    // Retrieve a value by key from the receiving node's store
    FindKey {
        key: NodeId,
    },
    KeyFound {
        value: Option<Vec<u8>>,
    },
    // Ask the peer to tear the channel down once it has acknowledged
    Close,
    // Acknowledgement for Notify and Close
    TerminatedMethod,
    Error {
        message: String,
    },
}

impl DhtMessage {
    /// Responses complete a pending call on the receiving side instead of being handled.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            DhtMessage::FoundSuccessor { .. }
                | DhtMessage::Predecessor { .. }
                | DhtMessage::SuccessorList { .. }
                | DhtMessage::DimFingerTable { .. }
                | DhtMessage::InitialSocketPort { .. }
                | DhtMessage::KeyAdded { .. }
                | DhtMessage::KeyFound { .. }
                | DhtMessage::TerminatedMethod
                | DhtMessage::Error { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DhtMessage::Hello { .. } => "Hello",
            DhtMessage::FindSuccessor { .. } => "FindSuccessor",
            DhtMessage::FoundSuccessor { .. } => "FoundSuccessor",
            DhtMessage::Notify { .. } => "Notify",
            DhtMessage::GetPredecessor => "GetPredecessor",
            DhtMessage::Predecessor { .. } => "Predecessor",
            DhtMessage::GetSuccessorList => "GetSuccessorList",
            DhtMessage::SuccessorList { .. } => "SuccessorList",
            DhtMessage::GetDimFingerTable => "GetDimFingerTable",
            DhtMessage::DimFingerTable { .. } => "DimFingerTable",
            DhtMessage::GetInitialSocketPort => "GetInitialSocketPort",
            DhtMessage::InitialSocketPort { .. } => "InitialSocketPort",
            DhtMessage::AddKey { .. } => "AddKey",
            DhtMessage::KeyAdded { .. } => "KeyAdded",
            DhtMessage::FindKey { .. } => "FindKey",
            DhtMessage::KeyFound { .. } => "KeyFound",
            DhtMessage::Close => "Close",
            DhtMessage::TerminatedMethod => "TerminatedMethod",
            DhtMessage::Error { .. } => "Error",
        }
    }
}
