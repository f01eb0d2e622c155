//! Chord DHT Node Library
//!
//! This library provides a Chord ring node: identifier routing, stabilization, key storage
//! and the persistent TCP transport between peers. It can be used both as a standalone
//! binary and as a library for integration testing.

macro_rules! log_info {
    ($node:expr, $($arg:tt)*) => ({
        log::info!("[{}] {}", $node, format_args!($($arg)*));
    })
}

macro_rules! log_warn {
    ($node:expr, $($arg:tt)*) => ({
        log::warn!("[{}] {}", $node, format_args!($($arg)*));
    })
}

macro_rules! log_error {
    ($node:expr, $($arg:tt)*) => ({
        log::error!("[{}] {}", $node, format_args!($($arg)*));
    })
}

macro_rules! log_debug {
    ($node:expr, $($arg:tt)*) => ({
        log::debug!("[{}] {}", $node, format_args!($($arg)*));
    })
}

pub mod api;
pub mod channel;
pub mod codec;
pub mod error;
pub mod monitor;
pub mod network_client;
pub mod node;
pub mod pending;
pub mod pool;
pub mod stabilizer;


use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

// Re-export main types for public API
pub use error::{ChordError, Result};
pub use monitor::{Monitor, NoopMonitor, RemoteMonitor};
pub use network_client::{InboundHandler, NetworkClient};
pub use node::{ChordNode, RingSnapshot};
pub use pool::ConnectionPool;
pub use stabilizer::Stabilizer;

// Re-export from lib crate for convenience
pub use chord_lib::{DhtMessage, IdSpace, NodeId, NodeInfo};

/// Configuration for a ChordNode
#[derive(Debug, Clone)]
pub struct Config {
    /// Address peers use to reach this node.
    pub address: String,
    /// Listening port; 0 picks an ephemeral one.
    pub port: u16,
    /// Explicit identifier; otherwise derived from the address and bound port.
    pub node_id: Option<NodeId>,
    /// Bits in the identifier space, which is also the finger table length.
    pub finger_bits: u32,
    pub successor_list_len: usize,
    pub call_timeout: Duration,
    pub fix_fingers_pacing: Duration,
    pub stabilize_interval: Duration,
    pub timeout_backoff: Duration,
    /// How long an unreferenced pooled connection stays open.
    pub idle_connection_linger: Duration,
    pub max_inbound_handlers: usize,
    pub monitor_address: Option<String>,
    pub api_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 0,
            node_id: None,
            finger_bits: 16,
            successor_list_len: 3,
            call_timeout: Duration::from_millis(3000),
            fix_fingers_pacing: Duration::from_millis(200),
            stabilize_interval: Duration::from_millis(1000),
            timeout_backoff: Duration::from_millis(60),
            idle_connection_linger: Duration::from_secs(5),
            max_inbound_handlers: 64,
            monitor_address: None,
            api_port: None,
        }
    }
}

impl ChordNode<ConnectionPool> {
    /// Binds the listener, derives the identifier and starts serving peers.
    ///
    /// The node is not part of any ring yet; call [`ChordNode::join_network`] next.
    pub async fn launch(config: Config) -> Result<Self> {
        let id_space = IdSpace::new(config.finger_bits)?;
        let listener = TcpListener::bind((config.address.as_str(), config.port)).await?;
        let port = listener.local_addr()?.port();
        let id = match config.node_id {
            Some(id) => id_space.reduce(id),
            None => id_space.hash_address(&config.address, port),
        };
        let info = NodeInfo::new(id, config.address.clone(), port);

        let pool = Arc::new(ConnectionPool::new(info.clone(), &config));
        let monitor =
            monitor::connect_monitor(config.monitor_address.as_deref(), config.call_timeout).await;
        let node = ChordNode::new(info, &config, pool.clone())?.with_monitor(monitor);

        pool.attach(Arc::new(node.clone()));
        pool.listen(listener);
        log_info!(
            node.info,
            "Listening on port {} with {}-bit identifiers",
            port,
            id_space.bits()
        );
        Ok(node)
    }

    /// Leaves without a goodbye: background work stops and every socket is dropped without
    /// the close handshake, so peers see the same thing as a crashed process.
    pub async fn abort(&self) {
        if !self.deactivate() {
            return;
        }
        log_warn!(self.info, "Aborting");
        self.network_client.abort().await;
    }
}

impl<T: NetworkClient> ChordNode<T> {
    /// Join an existing network or create a new one
    pub async fn join_network(&self, bootstrap_address: Option<&str>) -> Result<()> {
        self.join(bootstrap_address).await
    }

    /// Starts the periodic stabilization loop for this node.
    pub fn spawn_stabilizer(&self) -> JoinHandle<()> {
        Stabilizer::new(self.clone()).spawn()
    }
}
