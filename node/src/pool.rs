//! Shared, reference-counted connections to peers.
//!
//! At most one outbound channel exists per peer id. Callers borrow it through a
//! [`PooledChannel`] handle that gives the reference back when dropped; once nobody holds
//! the channel it lingers for `idle_connection_linger` and is then closed with the
//! cooperative handshake. Calls addressed to the local node never touch a socket.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chord_lib::{DhtMessage, NodeId, NodeInfo};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::channel::{ChannelOwner, RemoteChannel};
use crate::error::{ChordError, Result};
use crate::network_client::{InboundHandler, NetworkClient};
use crate::Config;

struct PoolEntry {
    channel: Arc<RemoteChannel>,
    refs: usize,
    idle_epoch: u64,
}

#[derive(Default)]
struct PoolState {
    outbound: HashMap<NodeId, PoolEntry>,
    inbound: Vec<Arc<RemoteChannel>>,
    accept_task: Option<JoinHandle<()>>,
    closed: bool,
}

pub(crate) struct PoolShared {
    local: NodeInfo,
    call_timeout: Duration,
    linger: Duration,
    state: Mutex<PoolState>,
    handler: RwLock<Option<Arc<dyn InboundHandler>>>,
    workers: Arc<Semaphore>,
    me: Weak<PoolShared>,
}

#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

/// A borrowed pool entry. Dropping it releases the reference.
pub struct PooledChannel {
    peer: NodeId,
    channel: Arc<RemoteChannel>,
    shared: Arc<PoolShared>,
}

impl PooledChannel {
    pub fn channel(&self) -> &Arc<RemoteChannel> {
        &self.channel
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        self.shared.release(self.peer, &self.channel);
    }
}

/// Result of resolving a peer: either this node itself or a shared remote channel.
pub enum Connection {
    Local(Arc<dyn InboundHandler>),
    Remote(PooledChannel),
}

impl Connection {
    pub fn is_local(&self) -> bool {
        matches!(self, Connection::Local(_))
    }

    pub async fn call(&self, message: DhtMessage) -> Result<DhtMessage> {
        match self {
            Connection::Local(handler) => Ok(handler.handle_request(message).await),
            Connection::Remote(pooled) => pooled.channel.call(message).await,
        }
    }
}

impl ConnectionPool {
    pub fn new(local: NodeInfo, config: &Config) -> Self {
        let shared = Arc::new_cyclic(|me| PoolShared {
            local,
            call_timeout: config.call_timeout,
            linger: config.idle_connection_linger,
            state: Mutex::new(PoolState::default()),
            handler: RwLock::new(None),
            workers: Arc::new(Semaphore::new(config.max_inbound_handlers.max(1))),
            me: me.clone(),
        });
        Self { shared }
    }

    pub fn local(&self) -> &NodeInfo {
        &self.shared.local
    }

    /// Installs the handler that answers inbound requests and hears about failed peers.
    pub fn attach(&self, handler: Arc<dyn InboundHandler>) {
        *self
            .shared
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn detach(&self) {
        self.shared
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Accepts inbound connections on `listener` until the pool shuts down.
    pub fn listen(&self, listener: TcpListener) {
        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        log_debug!(shared.local, "Accepted connection from {}", addr);
                        shared.adopt_inbound(stream);
                    }
                    Err(e) => {
                        log_error!(shared.local, "Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        let previous = self.shared.state().accept_task.replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Resolves `target` to a usable connection, reusing a live channel when one exists.
    pub async fn acquire(&self, target: &NodeInfo) -> Result<Connection> {
        let shared = &self.shared;
        if target.id == shared.local.id {
            return shared
                .handler()
                .map(Connection::Local)
                .ok_or(ChordError::Inactive);
        }
        if shared.state().closed {
            return Err(ChordError::Inactive);
        }
        if let Some(channel) = shared.checkout(target.id) {
            return Ok(Connection::Remote(self.handle(target.id, channel)));
        }

        let channel = match RemoteChannel::connect(
            &target.socket_address(),
            &shared.local,
            Some(target.clone()),
            shared.call_timeout,
            shared.owner(),
        )
        .await
        {
            Ok(channel) => channel,
            Err(e) => {
                log_warn!(shared.local, "Cannot reach {}: {}", target, e);
                shared.on_disconnect(target.id);
                return Err(e);
            }
        };

        let channel = shared.insert_or_join(target.id, channel)?;
        Ok(Connection::Remote(self.handle(target.id, channel)))
    }

    fn handle(&self, peer: NodeId, channel: Arc<RemoteChannel>) -> PooledChannel {
        PooledChannel {
            peer,
            channel,
            shared: self.shared.clone(),
        }
    }

    /// Outstanding references on the pooled channel to `peer`, if one exists.
    pub fn reference_count(&self, peer: NodeId) -> Option<usize> {
        self.shared.state().outbound.get(&peer).map(|entry| entry.refs)
    }

    pub fn outbound_peers(&self) -> Vec<NodeId> {
        self.shared.state().outbound.keys().copied().collect()
    }

    /// Ids announced by peers that connected to this node.
    pub fn inbound_peers(&self) -> Vec<NodeId> {
        self.shared
            .state()
            .inbound
            .iter()
            .filter_map(|channel| channel.peer().map(|peer| peer.id))
            .collect()
    }

    /// Forgets `peer` and tells the ring about it.
    pub fn on_disconnect(&self, peer: NodeId) {
        self.shared.on_disconnect(peer);
    }

    /// Stops listening and drops every connection without the close handshake, leaving
    /// peers to discover the loss on their own.
    pub async fn abort(&self) {
        let channels = self.shared.close_all();
        log_warn!(self.shared.local, "Aborting {} connections", channels.len());
        for channel in channels {
            channel.abort().await;
        }
        self.detach();
        self.shared.workers.close();
    }
}

impl PoolShared {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn owner(&self) -> Weak<dyn ChannelOwner> {
        let owner: Weak<dyn ChannelOwner> = self.me.clone();
        owner
    }

    fn handler(&self) -> Option<Arc<dyn InboundHandler>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Refuses further work and hands back every channel still open.
    fn close_all(&self) -> Vec<Arc<RemoteChannel>> {
        let (accept_task, channels) = {
            let mut state = self.state();
            state.closed = true;
            let mut channels: Vec<_> = state
                .outbound
                .drain()
                .map(|(_, entry)| entry.channel)
                .collect();
            channels.append(&mut state.inbound);
            (state.accept_task.take(), channels)
        };
        if let Some(task) = accept_task {
            task.abort();
        }
        channels
    }

    fn checkout(&self, peer: NodeId) -> Option<Arc<RemoteChannel>> {
        let mut state = self.state();
        match state.outbound.get_mut(&peer) {
            Some(entry) if entry.channel.is_connected() => {
                entry.refs += 1;
                Some(entry.channel.clone())
            }
            Some(_) => {
                state.outbound.remove(&peer);
                None
            }
            None => None,
        }
    }

    /// Registers a freshly opened channel, unless a concurrent caller got there first.
    fn insert_or_join(
        &self,
        peer: NodeId,
        channel: Arc<RemoteChannel>,
    ) -> Result<Arc<RemoteChannel>> {
        let mut state = self.state();
        if state.closed {
            drop(state);
            tokio::spawn(async move { channel.close().await });
            return Err(ChordError::Inactive);
        }
        if let Some(entry) = state.outbound.get_mut(&peer) {
            if entry.channel.is_connected() {
                entry.refs += 1;
                let existing = entry.channel.clone();
                drop(state);
                tokio::spawn(async move { channel.close().await });
                return Ok(existing);
            }
        }
        state.outbound.insert(
            peer,
            PoolEntry {
                channel: channel.clone(),
                refs: 1,
                idle_epoch: 0,
            },
        );
        Ok(channel)
    }

    fn release(&self, peer: NodeId, channel: &Arc<RemoteChannel>) {
        let mut state = self.state();
        let Some(entry) = state.outbound.get_mut(&peer) else {
            return;
        };
        if !Arc::ptr_eq(&entry.channel, channel) {
            return;
        }
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        if self.linger.is_zero() {
            if let Some(entry) = state.outbound.remove(&peer) {
                drop(state);
                runtime.spawn(async move { entry.channel.close().await });
            }
            return;
        }

        entry.idle_epoch += 1;
        let epoch = entry.idle_epoch;
        drop(state);
        let me = self.me.clone();
        let linger = self.linger;
        runtime.spawn(async move {
            tokio::time::sleep(linger).await;
            if let Some(shared) = me.upgrade() {
                shared.expire_idle(peer, epoch).await;
            }
        });
    }

    async fn expire_idle(&self, peer: NodeId, epoch: u64) {
        let expired = {
            let mut state = self.state();
            match state.outbound.get(&peer) {
                Some(entry) if entry.refs == 0 && entry.idle_epoch == epoch => {
                    state.outbound.remove(&peer).map(|entry| entry.channel)
                }
                _ => None,
            }
        };
        if let Some(channel) = expired {
            log_debug!(self.local, "Closing idle channel to {}", peer);
            channel.close().await;
        }
    }

    fn adopt_inbound(&self, stream: TcpStream) {
        let channel = RemoteChannel::spawn(
            stream,
            &self.local,
            None,
            self.call_timeout,
            self.owner(),
        );
        let mut state = self.state();
        if state.closed {
            drop(state);
            tokio::spawn(async move { channel.close().await });
            return;
        }
        state.inbound.push(channel);
    }

    fn forget(&self, channel: &Arc<RemoteChannel>) {
        let mut state = self.state();
        state.inbound.retain(|other| !Arc::ptr_eq(other, channel));
        if let Some(peer) = channel.peer() {
            let same = state
                .outbound
                .get(&peer.id)
                .is_some_and(|entry| Arc::ptr_eq(&entry.channel, channel));
            if same {
                state.outbound.remove(&peer.id);
            }
        }
    }

    fn on_disconnect(&self, peer: NodeId) {
        if peer == self.local.id {
            return;
        }
        self.state().outbound.remove(&peer);
        if let Some(handler) = self.handler() {
            handler.peer_disconnected(peer);
        }
    }
}

impl ChannelOwner for PoolShared {
    fn handler(&self) -> Option<Arc<dyn InboundHandler>> {
        PoolShared::handler(self)
    }

    fn workers(&self) -> Arc<Semaphore> {
        self.workers.clone()
    }

    fn channel_identified(&self, channel: &Arc<RemoteChannel>) {
        let Some(peer) = channel.peer() else {
            return;
        };
        if peer.id == self.local.id {
            log_warn!(
                self.local,
                "Refusing connection from {} carrying our own id",
                channel.remote_addr()
            );
            self.forget(channel);
            let channel = channel.clone();
            tokio::spawn(async move { channel.close().await });
        }
    }

    fn channel_lost(&self, channel: &Arc<RemoteChannel>) {
        self.forget(channel);
        if let Some(peer) = channel.peer() {
            self.on_disconnect(peer.id);
        }
    }

    fn channel_closed_by_peer(&self, channel: &Arc<RemoteChannel>) {
        self.forget(channel);
    }
}

#[async_trait]
impl NetworkClient for ConnectionPool {
    async fn call_node(&self, target: &NodeInfo, message: DhtMessage) -> Result<DhtMessage> {
        let connection = self.acquire(target).await?;
        connection.call(message).await
    }

    async fn call_address(&self, address: &str, message: DhtMessage) -> Result<DhtMessage> {
        let shared = &self.shared;
        let channel = RemoteChannel::connect(
            address,
            &shared.local,
            None,
            shared.call_timeout,
            shared.owner(),
        )
        .await?;
        let result = channel.call(message).await;
        channel.close().await;
        result
    }

    async fn shutdown(&self) {
        let channels = self.shared.close_all();
        log_info!(self.shared.local, "Closing {} connections", channels.len());

        let closing: Vec<_> = channels
            .into_iter()
            .map(|channel| tokio::spawn(async move { channel.close().await }))
            .collect();
        for task in closing {
            let _ = task.await;
        }
        self.detach();
        self.shared.workers.close();
    }
}
