use std::time::Duration;

use chord_lib::{IdSpaceError, NodeId};

pub type Result<T> = std::result::Result<T, ChordError>;

#[derive(thiserror::Error, Debug)]
pub enum ChordError {
    /// The peer could not be reached when opening a connection.
    #[error("cannot connect to {address}: {reason}")]
    Connection { address: String, reason: String },

    /// A correlated response did not arrive within the call timeout.
    #[error("no response to {operation} within {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The connection broke while reading or writing.
    #[error("connection to {0} was lost")]
    Disconnected(String),

    /// Oversized or undecodable frame.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("unexpected response to {request}: {response}")]
    UnexpectedResponse {
        request: &'static str,
        response: &'static str,
    },

    #[error("lookup of {0} failed on the remote node")]
    LookupFailed(NodeId),

    /// Another member of the ring already uses this identifier.
    #[error("identifier {0} is already taken in the ring")]
    IdCollision(NodeId),

    #[error("node is shut down")]
    Inactive,

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] IdSpaceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChordError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ChordError::Timeout { .. })
    }

    /// Errors after which the peer should be treated as gone.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            ChordError::Connection { .. } | ChordError::Disconnected(_) | ChordError::Protocol(_)
        )
    }
}
