use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chord_lib::{IdSpace, NodeId, NodeInfo};
use chord_node::{ChordError, ChordNode, Config, ConnectionPool};
use log::info;
use tokio::task::JoinHandle;

use crate::integration::NetworkInvariants;

struct TestNode {
    node: ChordNode<ConnectionPool>,
    stabilizer: JoinHandle<()>,
}

/// Orchestrates a ring of real nodes on loopback ports.
pub struct TestHarness {
    config: Config,
    nodes: BTreeMap<NodeId, TestNode>,
    departed: Vec<NodeId>,
}

impl TestHarness {
    /// Ring with `bits`-bit identifiers and timings short enough for tests.
    pub fn new(bits: u32) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            config: Config {
                finger_bits: bits,
                successor_list_len: 3,
                call_timeout: Duration::from_millis(500),
                fix_fingers_pacing: Duration::from_millis(2),
                stabilize_interval: Duration::from_millis(20),
                timeout_backoff: Duration::from_millis(10),
                idle_connection_linger: Duration::from_secs(2),
                ..Config::default()
            },
            nodes: BTreeMap::new(),
            departed: Vec::new(),
        }
    }

    pub fn id_space(&self) -> IdSpace {
        match IdSpace::new(self.config.finger_bits) {
            Ok(space) => space,
            Err(e) => panic!("invalid harness configuration: {}", e),
        }
    }

    /// Starts a node with identifier `id` and joins it through the lowest live node.
    pub async fn add_node(&mut self, id: NodeId) -> Result<NodeInfo, ChordError> {
        let bootstrap = self
            .nodes
            .values()
            .next()
            .map(|member| member.node.info.socket_address());
        let node = ChordNode::launch(Config {
            node_id: Some(id),
            ..self.config.clone()
        })
        .await?;
        node.join_network(bootstrap.as_deref()).await?;
        let stabilizer = node.spawn_stabilizer();
        info!("Test harness: node {} joined", node.info);

        let node_info = node.info.clone();
        self.nodes.insert(node_info.id, TestNode { node, stabilizer });
        Ok(node_info)
    }

    /// Shuts a node down gracefully; its peers must notice on their own.
    pub async fn remove_node(&mut self, id: NodeId) {
        if let Some(member) = self.nodes.remove(&id) {
            member.node.shutdown().await;
            let _ = member.stabilizer.await;
            self.departed.push(id);
            info!("Test harness: node {} left", id);
        }
    }

    /// Kills a node without the close handshake; its peers only notice broken or refused
    /// connections.
    pub async fn crash_node(&mut self, id: NodeId) {
        if let Some(member) = self.nodes.remove(&id) {
            member.stabilizer.abort();
            let _ = member.stabilizer.await;
            member.node.abort().await;
            self.departed.push(id);
            info!("Test harness: node {} crashed", id);
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&ChordNode<ConnectionPool>> {
        self.nodes.get(&id).map(|member| &member.node)
    }

    /// Live nodes in identifier order.
    pub fn nodes(&self) -> Vec<&ChordNode<ConnectionPool>> {
        self.nodes.values().map(|member| &member.node).collect()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn departed(&self) -> &[NodeId] {
        &self.departed
    }

    /// The live node that should own `key`.
    pub fn expected_owner(&self, key: NodeId) -> Option<NodeId> {
        self.nodes
            .keys()
            .copied()
            .find(|id| *id >= key)
            .or_else(|| self.nodes.keys().next().copied())
    }

    /// Polls `condition` until it holds or `timeout` passes.
    pub async fn wait_for(&self, timeout: Duration, condition: impl Fn(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if condition(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Waits until every ring invariant holds, returning the last violations otherwise.
    pub async fn wait_for_stabilization(&self, timeout: Duration) -> Result<(), String> {
        let converged = self
            .wait_for(timeout, |harness| {
                NetworkInvariants::check_all(harness).is_empty()
            })
            .await;
        if converged {
            return Ok(());
        }
        let report: Vec<String> = NetworkInvariants::check_all(self)
            .iter()
            .map(|violation| format!("{}: {}", violation.name, violation.description))
            .collect();
        Err(report.join("\n"))
    }

    pub async fn shutdown(mut self) {
        for (_, member) in std::mem::take(&mut self.nodes) {
            member.node.shutdown().await;
            let _ = member.stabilizer.await;
        }
    }
}
