use async_trait::async_trait;
use chord_lib::{DhtMessage, NodeId, NodeInfo};

use crate::error::Result;

/// Outgoing side of the ring protocol: how a node reaches its peers.
///
/// The production implementation is [`crate::pool::ConnectionPool`]; tests substitute a
/// mock so the protocol logic can be driven without sockets.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkClient: Send + Sync + 'static {
    /// Sends `message` to a known peer and waits for the correlated response.
    async fn call_node(&self, target: &NodeInfo, message: DhtMessage) -> Result<DhtMessage>;

    /// One-off call to a peer known only by address, such as a bootstrap node.
    async fn call_address(&self, address: &str, message: DhtMessage) -> Result<DhtMessage>;

    /// Closes every connection this client holds.
    async fn shutdown(&self);
}

/// Incoming side: what a channel hands requests and failures to.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    /// Computes the response to a request received from a peer.
    async fn handle_request(&self, message: DhtMessage) -> DhtMessage;

    /// Called when the connection to `peer` failed; the peer must be dropped from ring state.
    fn peer_disconnected(&self, peer: NodeId);
}
