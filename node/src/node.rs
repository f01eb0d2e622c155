use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chord_lib::monitor::MonitorEvent;
use chord_lib::{is_between, DhtMessage, IdSpace, NodeId, NodeInfo};
use serde::Serialize;

use crate::error::{ChordError, Result};
use crate::monitor::{Monitor, NoopMonitor};
use crate::network_client::{InboundHandler, NetworkClient};
use crate::Config;

/// How many fingers a lookup may try before giving up when hops keep failing.
const LOOKUP_ATTEMPTS: usize = 3;

pub(crate) fn lock<U>(mutex: &Mutex<U>) -> MutexGuard<'_, U> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unexpected(request: &'static str, response: &DhtMessage) -> ChordError {
    ChordError::UnexpectedResponse {
        request,
        response: response.kind(),
    }
}

/// Point-in-time view of one node's routing state.
#[derive(Debug, Clone, Serialize)]
pub struct RingSnapshot {
    pub node: NodeInfo,
    pub predecessor: Option<NodeInfo>,
    pub successor_list: Vec<NodeInfo>,
    pub finger_table: Vec<NodeInfo>,
    pub key_count: usize,
}

pub struct ChordNode<T: NetworkClient> {
    pub info: NodeInfo,
    pub id_space: IdSpace,
    pub config: Arc<Config>,
    pub predecessor: Arc<Mutex<Option<NodeInfo>>>,
    /// Nearest live successors in ring order; never empty, `[self]` when alone.
    pub successor_list: Arc<Mutex<Vec<NodeInfo>>>,
    /// `finger_table[i - 1]` caches `find_successor(id + 2^(i-1))`.
    pub finger_table: Arc<Mutex<Vec<NodeInfo>>>,
    pub data: Arc<Mutex<HashMap<NodeId, Vec<u8>>>>,
    pub network_client: Arc<T>,
    next_finger: Arc<AtomicU32>,
    monitor: Arc<dyn Monitor>,
    active: Arc<AtomicBool>,
}

impl<T: NetworkClient> Clone for ChordNode<T> {
    fn clone(&self) -> Self {
        ChordNode {
            info: self.info.clone(),
            id_space: self.id_space,
            config: self.config.clone(),
            predecessor: self.predecessor.clone(),
            successor_list: self.successor_list.clone(),
            finger_table: self.finger_table.clone(),
            data: self.data.clone(),
            network_client: self.network_client.clone(),
            next_finger: self.next_finger.clone(),
            monitor: self.monitor.clone(),
            active: self.active.clone(),
        }
    }
}

impl<T: NetworkClient> ChordNode<T> {
    pub fn new(info: NodeInfo, config: &Config, network_client: Arc<T>) -> Result<Self> {
        let id_space = IdSpace::new(config.finger_bits)?;
        let fingers = id_space.bits() as usize;

        Ok(ChordNode {
            id_space,
            config: Arc::new(config.clone()),
            predecessor: Arc::new(Mutex::new(None)),
            successor_list: Arc::new(Mutex::new(vec![info.clone()])),
            finger_table: Arc::new(Mutex::new(vec![info.clone(); fingers])),
            data: Arc::new(Mutex::new(HashMap::new())),
            network_client,
            next_finger: Arc::new(AtomicU32::new(0)),
            monitor: Arc::new(NoopMonitor),
            active: Arc::new(AtomicBool::new(true)),
            info,
        })
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = monitor;
        self
    }

    #[cfg(test)]
    pub fn new_for_test(id: NodeId, network_client: Arc<T>) -> Self {
        let config = Config {
            finger_bits: 8,
            fix_fingers_pacing: std::time::Duration::from_millis(1),
            stabilize_interval: std::time::Duration::from_millis(1),
            timeout_backoff: std::time::Duration::from_millis(1),
            ..Config::default()
        };
        let info = NodeInfo::new(id, "127.0.0.1", 4000 + id as u16);
        match Self::new(info, &config, network_client) {
            Ok(node) => node,
            Err(e) => panic!("invalid test configuration: {}", e),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Marks the node inactive, returning whether it was active before.
    pub(crate) fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::SeqCst)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(ChordError::Inactive)
        }
    }

    pub(crate) async fn report(&self, event: MonitorEvent) {
        self.monitor.notify(event).await;
    }

    pub fn successor(&self) -> NodeInfo {
        lock(&self.successor_list)
            .first()
            .cloned()
            .unwrap_or_else(|| self.info.clone())
    }

    pub fn get_predecessor(&self) -> Option<NodeInfo> {
        lock(&self.predecessor).clone()
    }

    pub fn get_successor_list(&self) -> Vec<NodeInfo> {
        lock(&self.successor_list).clone()
    }

    pub fn get_finger_table(&self) -> Vec<NodeInfo> {
        lock(&self.finger_table).clone()
    }

    pub fn get_dim_finger_table(&self) -> u32 {
        self.id_space.bits()
    }

    pub fn get_initial_socket_port(&self) -> u16 {
        self.info.port
    }

    pub fn snapshot(&self) -> RingSnapshot {
        RingSnapshot {
            node: self.info.clone(),
            predecessor: self.get_predecessor(),
            successor_list: self.get_successor_list(),
            finger_table: self.get_finger_table(),
            key_count: lock(&self.data).len(),
        }
    }

    pub fn start_new_network(&self) {
        log_info!(self.info, "Starting a new ring");
        *lock(&self.predecessor) = None;
        *lock(&self.successor_list) = vec![self.info.clone()];
        lock(&self.finger_table)
            .iter_mut()
            .for_each(|finger| *finger = self.info.clone());
    }

    /// Enters the ring through `bootstrap`, or starts a new one when there is none.
    pub async fn join(&self, bootstrap: Option<&str>) -> Result<()> {
        self.ensure_active()?;
        match bootstrap {
            None => self.start_new_network(),
            Some(address) => {
                log_info!(self.info, "Joining the ring via {}", address);
                let request = DhtMessage::FindSuccessor { id: self.info.id };
                let successor = match self.network_client.call_address(address, request).await? {
                    DhtMessage::FoundSuccessor { node: Some(node) } => node,
                    DhtMessage::FoundSuccessor { node: None } => {
                        return Err(ChordError::LookupFailed(self.info.id))
                    }
                    other => return Err(unexpected("FindSuccessor", &other)),
                };
                if successor.id == self.info.id {
                    return Err(ChordError::IdCollision(self.info.id));
                }
                self.set_successor(successor.clone());

                // Until notify says otherwise, the successor's predecessor is ours too.
                let predecessor = self
                    .predecessor_of(&successor)
                    .await?
                    .filter(|node| node.id != self.info.id)
                    .unwrap_or_else(|| successor.clone());
                {
                    let mut current = lock(&self.predecessor);
                    if current.is_none() {
                        *current = Some(predecessor);
                    }
                }

                if let Err(e) = self.list_stabilize().await {
                    log_warn!(self.info, "First stabilization after join failed: {}", e);
                }
                log_info!(self.info, "Joined with successor {}", successor);
            }
        }
        self.report(MonitorEvent::Connected {
            node_id: self.info.id,
        })
        .await;
        Ok(())
    }

    /// Calls `target`, dropping it from ring state when the transport fails.
    async fn call_peer(&self, target: &NodeInfo, message: DhtMessage) -> Result<DhtMessage> {
        let result = self.network_client.call_node(target, message).await;
        if let Err(e) = &result {
            if e.is_transport_failure() {
                self.check_disconnected_node(target.id);
            }
        }
        result
    }

    pub async fn find_successor(&self, id: NodeId) -> Result<NodeInfo> {
        let mut last_error = ChordError::LookupFailed(id);
        for _ in 0..LOOKUP_ATTEMPTS {
            let successor = self.successor();
            if is_between(id, self.info.id, successor.id, true) {
                return Ok(successor);
            }
            let next = self.closest_preceding_node(id);
            if next.id == self.info.id {
                return Ok(successor);
            }

            log_debug!(self.info, "Forwarding lookup of {} to {}", id, next);
            match self
                .call_peer(&next, DhtMessage::FindSuccessor { id })
                .await
            {
                Ok(DhtMessage::FoundSuccessor { node: Some(node) }) => return Ok(node),
                Ok(DhtMessage::FoundSuccessor { node: None }) => {
                    return Err(ChordError::LookupFailed(id))
                }
                Ok(other) => return Err(unexpected("FindSuccessor", &other)),
                Err(e) if e.is_transport_failure() => last_error = e,
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    /// Known node strictly inside `(self, id)` that lies furthest from this node, looking at
    /// fingers and successor list alike; this node itself when none qualifies.
    pub fn closest_preceding_node(&self, id: NodeId) -> NodeInfo {
        let fingers = self.get_finger_table();
        let successors = self.get_successor_list();
        fingers
            .into_iter()
            .chain(successors)
            .filter(|node| is_between(node.id, self.info.id, id, false))
            .max_by_key(|node| self.id_space.distance(self.info.id, node.id))
            .unwrap_or_else(|| self.info.clone())
    }

    /// Returns whether `candidate` became the new predecessor.
    pub async fn notify(&self, candidate: NodeInfo) -> bool {
        if candidate.id == self.info.id {
            return false;
        }
        let previous = {
            let mut predecessor = lock(&self.predecessor);
            let accept = match predecessor.as_ref() {
                None => true,
                Some(current) => is_between(candidate.id, current.id, self.info.id, false),
            };
            if !accept {
                log_debug!(
                    self.info,
                    "Notify: keeping predecessor {:?} over {}",
                    predecessor.as_ref().map(|p| p.id),
                    candidate
                );
                return false;
            }
            predecessor.replace(candidate.clone())
        };
        log_info!(
            self.info,
            "Predecessor changed from {:?} to {}",
            previous.map(|p| p.id),
            candidate
        );

        // A lone node learns its first successor this way
        if self.successor().id == self.info.id {
            self.set_successor(candidate.clone());
        }
        true
    }

    /// Sends keys outside `(predecessor, self]` to the predecessor and returns how many
    /// moved. A key is dropped locally only once the predecessor acknowledged it, and the
    /// first failure stops the transfer so the next call picks up what is left.
    pub async fn transfer_misplaced_keys(&self) -> Result<usize> {
        self.ensure_active()?;
        let Some(predecessor) = self.get_predecessor() else {
            return Ok(0);
        };
        if predecessor.id == self.info.id {
            return Ok(0);
        }
        let moving: Vec<(NodeId, Vec<u8>)> = lock(&self.data)
            .iter()
            .filter(|(key, _)| !is_between(**key, predecessor.id, self.info.id, true))
            .map(|(key, value)| (*key, value.clone()))
            .collect();
        if moving.is_empty() {
            return Ok(0);
        }
        log_info!(
            self.info,
            "Transferring {} keys to predecessor {}",
            moving.len(),
            predecessor
        );

        let mut moved = 0;
        for (key, value) in moving {
            let request = DhtMessage::AddKey {
                key,
                value: value.clone(),
            };
            match self.call_peer(&predecessor, request).await {
                Ok(DhtMessage::KeyAdded { .. }) => {
                    let mut data = lock(&self.data);
                    // Keep a value that was overwritten while the transfer was in flight
                    if data.get(&key) == Some(&value) {
                        data.remove(&key);
                    }
                    moved += 1;
                }
                Ok(other) => return Err(unexpected("AddKey", &other)),
                Err(e) => {
                    log_warn!(
                        self.info,
                        "Key transfer to {} interrupted after {} keys: {}",
                        predecessor,
                        moved,
                        e
                    );
                    return Err(e);
                }
            }
        }
        Ok(moved)
    }

    fn set_successor(&self, node: NodeInfo) {
        let limit = self.config.successor_list_len.max(1);
        {
            let mut list = lock(&self.successor_list);
            list.retain(|entry| entry.id != node.id && entry.id != self.info.id);
            list.insert(0, node.clone());
            list.truncate(limit);
        }
        if let Some(first) = lock(&self.finger_table).first_mut() {
            *first = node;
        }
    }

    async fn predecessor_of(&self, node: &NodeInfo) -> Result<Option<NodeInfo>> {
        if node.id == self.info.id {
            return Ok(self.get_predecessor());
        }
        match self.call_peer(node, DhtMessage::GetPredecessor).await? {
            DhtMessage::Predecessor { node } => Ok(node),
            other => Err(unexpected("GetPredecessor", &other)),
        }
    }

    async fn successor_list_of(&self, node: &NodeInfo) -> Result<Vec<NodeInfo>> {
        if node.id == self.info.id {
            return Ok(self.get_successor_list());
        }
        match self.call_peer(node, DhtMessage::GetSuccessorList).await? {
            DhtMessage::SuccessorList { nodes } => Ok(nodes),
            other => Err(unexpected("GetSuccessorList", &other)),
        }
    }

    async fn notify_node(&self, node: &NodeInfo) -> Result<()> {
        if node.id == self.info.id {
            return Ok(());
        }
        let notify = DhtMessage::Notify {
            node: self.info.clone(),
        };
        match self.call_peer(node, notify).await? {
            DhtMessage::TerminatedMethod => Ok(()),
            other => Err(unexpected("Notify", &other)),
        }
    }

    /// Stabilize step: adopt a closer successor if one appeared, notify it, and rebuild the
    /// successor list from the successor's own list.
    pub async fn list_stabilize(&self) -> Result<()> {
        self.ensure_active()?;
        let successor = self.successor();
        if let Some(candidate) = self.predecessor_of(&successor).await? {
            if is_between(candidate.id, self.info.id, successor.id, false) {
                log_info!(
                    self.info,
                    "Stabilize: successor changes from {} to {}",
                    successor,
                    candidate
                );
                self.set_successor(candidate);
            }
        }

        let successor = self.successor();
        self.notify_node(&successor).await?;
        let remote = self.successor_list_of(&successor).await?;
        self.refresh_successor_list(successor, remote);
        Ok(())
    }

    fn refresh_successor_list(&self, successor: NodeInfo, remote: Vec<NodeInfo>) {
        let limit = self.config.successor_list_len.max(1);
        let mut list = vec![successor];
        for node in remote {
            if list.len() >= limit || node.id == self.info.id {
                break;
            }
            if !list.contains(&node) {
                list.push(node);
            }
        }
        *lock(&self.successor_list) = list;
    }

    /// Refreshes the next finger in rotation and returns its 1-based index.
    pub async fn fix_fingers(&self) -> Result<u32> {
        self.ensure_active()?;
        let bits = self.id_space.bits();
        let index = self.next_finger.fetch_add(1, Ordering::SeqCst) % bits + 1;
        let start = self.id_space.finger_start(self.info.id, index);
        let node = self.find_successor(start).await?;
        if let Some(entry) = lock(&self.finger_table).get_mut((index - 1) as usize) {
            *entry = node;
        }
        Ok(index)
    }

    /// Pings the predecessor; a transport failure removes it from ring state.
    pub async fn check_predecessor(&self) -> Result<()> {
        let Some(predecessor) = self.get_predecessor() else {
            return Ok(());
        };
        if predecessor.id == self.info.id {
            return Ok(());
        }
        match self
            .call_peer(&predecessor, DhtMessage::GetDimFingerTable)
            .await?
        {
            DhtMessage::DimFingerTable { .. } => Ok(()),
            other => Err(unexpected("GetDimFingerTable", &other)),
        }
    }

    /// Removes every reference to a departed node from predecessor, successor list and
    /// finger table.
    pub fn check_disconnected_node(&self, id: NodeId) {
        if id == self.info.id {
            return;
        }
        let mut changed = false;
        {
            let mut predecessor = lock(&self.predecessor);
            if predecessor.as_ref().is_some_and(|p| p.id == id) {
                *predecessor = None;
                changed = true;
            }
        }
        let replacement = {
            let mut fingers = lock(&self.finger_table);
            for finger in fingers.iter_mut().filter(|finger| finger.id == id) {
                *finger = self.info.clone();
                changed = true;
            }
            fingers.iter().find(|finger| finger.id != self.info.id).cloned()
        };
        {
            let mut list = lock(&self.successor_list);
            let before = list.len();
            list.retain(|node| node.id != id);
            changed |= list.len() != before;
            if list.is_empty() {
                list.push(replacement.unwrap_or_else(|| self.info.clone()));
            }
        }
        if changed {
            log_info!(
                self.info,
                "Removed disconnected node {} from ring state",
                id
            );
        }
    }

    /// Whether `key` falls in `(predecessor, self]`.
    pub fn is_owner(&self, key: NodeId) -> bool {
        match self.get_predecessor() {
            Some(predecessor) => is_between(key, predecessor.id, self.info.id, true),
            None => self.successor().id == self.info.id,
        }
    }

    pub fn add_key_to_store(&self, key: NodeId, value: Vec<u8>) {
        log_debug!(self.info, "Storing key {}", key);
        lock(&self.data).insert(key, value);
    }

    pub fn retrieve_key_from_store(&self, key: NodeId) -> Option<Vec<u8>> {
        lock(&self.data).get(&key).cloned()
    }

    /// Maps an application key into the identifier space.
    pub fn key_id(&self, key: &[u8]) -> NodeId {
        self.id_space.hash_key(key)
    }

    pub async fn lookup(&self, id: NodeId) -> Result<NodeInfo> {
        self.ensure_active()?;
        self.report(MonitorEvent::StartLookup).await;
        let result = self.find_successor(self.id_space.reduce(id)).await;
        self.report(MonitorEvent::EndOfLookup).await;
        result
    }

    /// Stores `value` on the owner of `key` and returns that owner.
    pub async fn add_key(&self, key: NodeId, value: Vec<u8>) -> Result<NodeInfo> {
        self.ensure_active()?;
        self.report(MonitorEvent::StartInsertKey).await;
        let result = self.insert_at_owner(self.id_space.reduce(key), value).await;
        self.report(MonitorEvent::EndInsertKey).await;
        result
    }

    async fn insert_at_owner(&self, key: NodeId, value: Vec<u8>) -> Result<NodeInfo> {
        let owner = self.find_successor(key).await?;
        if owner.id == self.info.id {
            self.add_key_to_store(key, value);
            return Ok(owner);
        }
        match self.call_peer(&owner, DhtMessage::AddKey { key, value }).await? {
            DhtMessage::KeyAdded { owner } => Ok(owner),
            other => Err(unexpected("AddKey", &other)),
        }
    }

    pub async fn find_key(&self, key: NodeId) -> Result<Option<Vec<u8>>> {
        self.ensure_active()?;
        self.report(MonitorEvent::StartFindKey).await;
        let result = self.find_at_owner(self.id_space.reduce(key)).await;
        self.report(MonitorEvent::EndFindKey).await;
        result
    }

    async fn find_at_owner(&self, key: NodeId) -> Result<Option<Vec<u8>>> {
        let owner = self.find_successor(key).await?;
        if owner.id == self.info.id {
            return Ok(self.retrieve_key_from_store(key));
        }
        match self.call_peer(&owner, DhtMessage::FindKey { key }).await? {
            DhtMessage::KeyFound { value } => Ok(value),
            other => Err(unexpected("FindKey", &other)),
        }
    }

    /// Leaves the ring: stops background work and closes every connection.
    pub async fn shutdown(&self) {
        if !self.deactivate() {
            return;
        }
        log_info!(self.info, "Shutting down");
        self.report(MonitorEvent::Disconnected {
            node_id: self.info.id,
        })
        .await;
        self.network_client.shutdown().await;
    }
}

#[async_trait]
impl<T: NetworkClient> InboundHandler for ChordNode<T> {
    async fn handle_request(&self, message: DhtMessage) -> DhtMessage {
        log_debug!(self.info, "Handling {}", message.kind());
        match message {
            DhtMessage::FindSuccessor { id } => match self.find_successor(id).await {
                Ok(node) => DhtMessage::FoundSuccessor { node: Some(node) },
                Err(e) => {
                    log_warn!(self.info, "Lookup of {} failed: {}", id, e);
                    DhtMessage::FoundSuccessor { node: None }
                }
            },
            DhtMessage::Notify { node } => {
                if self.notify(node).await {
                    // Acknowledge first; the transfer may take one call per key
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.transfer_misplaced_keys().await {
                            log_debug!(this.info, "Key transfer deferred: {}", e);
                        }
                    });
                }
                DhtMessage::TerminatedMethod
            }
            DhtMessage::GetPredecessor => DhtMessage::Predecessor {
                node: self.get_predecessor(),
            },
            DhtMessage::GetSuccessorList => DhtMessage::SuccessorList {
                nodes: self.get_successor_list(),
            },
            DhtMessage::GetDimFingerTable => DhtMessage::DimFingerTable {
                dim: self.get_dim_finger_table(),
            },
            DhtMessage::GetInitialSocketPort => DhtMessage::InitialSocketPort {
                port: self.get_initial_socket_port(),
            },
            DhtMessage::AddKey { key, value } => {
                self.add_key_to_store(key, value);
                DhtMessage::KeyAdded {
                    owner: self.info.clone(),
                }
            }
            DhtMessage::FindKey { key } => DhtMessage::KeyFound {
                value: self.retrieve_key_from_store(key),
            },
            other => {
                log_error!(self.info, "Unsupported request: {:?}", other);
                DhtMessage::Error {
                    message: format!("unsupported request {}", other.kind()),
                }
            }
        }
    }

    fn peer_disconnected(&self, peer: NodeId) {
        self.check_disconnected_node(peer);
    }
}
