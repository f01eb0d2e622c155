//! Background maintenance loop keeping successor list and finger table current.

use chord_lib::monitor::MonitorEvent;
use chord_lib::{NodeId, NodeInfo};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::error::ChordError;
use crate::network_client::NetworkClient;
use crate::node::ChordNode;

pub struct Stabilizer<T: NetworkClient> {
    node: ChordNode<T>,
}

fn ids(nodes: &[NodeInfo]) -> Vec<NodeId> {
    nodes.iter().map(|node| node.id).collect()
}

impl<T: NetworkClient> Stabilizer<T> {
    pub fn new(node: ChordNode<T>) -> Self {
        Self { node }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs rounds until the node shuts down.
    pub async fn run(self) {
        log_info!(self.node.info, "Stabilization started");
        while self.node.is_active() {
            let stable = self.round().await;
            if !self.node.is_active() {
                break;
            }
            self.node.report(MonitorEvent::stability(stable)).await;
            sleep(self.node.config.stabilize_interval).await;
        }
        log_info!(self.node.info, "Stabilization stopped");
    }

    /// One round: check the predecessor, move keys it now owns, stabilize the successor
    /// list, then refresh every finger once. Returns `true` when nothing changed.
    pub async fn round(&self) -> bool {
        let node = &self.node;
        if let Err(e) = node.check_predecessor().await {
            self.back_off("check predecessor", &e).await;
        }
        if let Err(e) = node.transfer_misplaced_keys().await {
            self.back_off("key transfer", &e).await;
        }

        let mut stable = true;
        if node.get_predecessor().is_some() {
            let before = ids(&node.get_successor_list());
            if let Err(e) = node.list_stabilize().await {
                self.back_off("stabilize", &e).await;
            }
            stable = before == ids(&node.get_successor_list());
        }

        let before = ids(&node.get_finger_table());
        for _ in 0..node.get_dim_finger_table() {
            if !node.is_active() {
                return stable;
            }
            if let Err(e) = node.fix_fingers().await {
                self.back_off("fix fingers", &e).await;
            }
            sleep(node.config.fix_fingers_pacing).await;
        }
        stable && before == ids(&node.get_finger_table())
    }

    async fn back_off(&self, step: &str, error: &ChordError) {
        if error.is_timeout() {
            log_debug!(self.node.info, "{} timed out, backing off", step);
            sleep(self.node.config.timeout_backoff).await;
        } else if !matches!(error, ChordError::Inactive) {
            log_warn!(self.node.info, "{} failed: {}", step, error);
        }
    }
}
