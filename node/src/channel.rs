//! One persistent, framed connection to a peer.
//!
//! Either side may issue requests on the same socket. A dedicated receive loop completes
//! pending calls when responses arrive and hands requests to the node's handler on spawned
//! tasks, so several inbound requests can be in progress at once and may finish out of
//! arrival order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use chord_lib::{DhtMessage, Envelope, LockId, NodeInfo};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::time::timeout;

use crate::codec;
use crate::error::{ChordError, Result};
use crate::network_client::InboundHandler;
use crate::pending::PendingCalls;

/// What a channel reports to and borrows from whoever keeps track of it.
pub(crate) trait ChannelOwner: Send + Sync + 'static {
    fn handler(&self) -> Option<Arc<dyn InboundHandler>>;

    /// Permits bounding how many inbound requests execute concurrently.
    fn workers(&self) -> Arc<Semaphore>;

    /// The peer announced itself with a `Hello`.
    fn channel_identified(&self, channel: &Arc<RemoteChannel>);

    /// The connection failed without a close handshake.
    fn channel_lost(&self, channel: &Arc<RemoteChannel>);

    /// The peer asked for the channel to be closed and it has been torn down.
    fn channel_closed_by_peer(&self, channel: &Arc<RemoteChannel>);
}

pub struct RemoteChannel {
    local: NodeInfo,
    remote_addr: String,
    peer: RwLock<Option<NodeInfo>>,
    writer: Mutex<OwnedWriteHalf>,
    pending: PendingCalls<DhtMessage>,
    call_timeout: Duration,
    connected: AtomicBool,
    closing: AtomicBool,
    shutdown: Notify,
}

impl RemoteChannel {
    /// Opens a connection to `address` and announces `local` to the peer.
    pub(crate) async fn connect(
        address: &str,
        local: &NodeInfo,
        peer: Option<NodeInfo>,
        call_timeout: Duration,
        owner: Weak<dyn ChannelOwner>,
    ) -> Result<Arc<Self>> {
        let stream = match timeout(call_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ChordError::Connection {
                    address: address.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ChordError::Connection {
                    address: address.to_string(),
                    reason: format!("timed out after {:?}", call_timeout),
                })
            }
        };

        let channel = Self::spawn(stream, local, peer, call_timeout, owner);
        channel
            .send(Envelope {
                lock_id: 0,
                message: DhtMessage::Hello {
                    node: local.clone(),
                },
            })
            .await?;
        log_debug!(local, "Connected to {}", address);
        Ok(channel)
    }

    /// Wraps an established stream and starts its receive loop.
    pub(crate) fn spawn(
        stream: TcpStream,
        local: &NodeInfo,
        peer: Option<NodeInfo>,
        call_timeout: Duration,
        owner: Weak<dyn ChannelOwner>,
    ) -> Arc<Self> {
        if let Err(e) = stream.set_nodelay(true) {
            log_debug!(local, "Could not disable Nagle: {}", e);
        }
        let remote_addr = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (read_half, write_half) = stream.into_split();

        let channel = Arc::new(Self {
            local: local.clone(),
            remote_addr,
            peer: RwLock::new(peer),
            writer: Mutex::new(write_half),
            pending: PendingCalls::new(),
            call_timeout,
            connected: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        tokio::spawn(channel.clone().read_loop(read_half, owner));
        channel
    }

    pub fn peer(&self) -> Option<NodeInfo> {
        self.peer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_peer(&self, node: NodeInfo) {
        *self.peer.write().unwrap_or_else(PoisonError::into_inner) = Some(node);
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.pending.in_flight()
    }

    fn describe_peer(&self) -> String {
        match self.peer() {
            Some(peer) => peer.to_string(),
            None => self.remote_addr.clone(),
        }
    }

    /// Writes one frame. Frames from concurrent callers never interleave.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        let mut writer = self.writer.lock().await;
        codec::write_frame(&mut *writer, &envelope)
            .await
            .map_err(|e| match e {
                ChordError::Io(io) => {
                    ChordError::Disconnected(format!("{} ({})", self.describe_peer(), io))
                }
                other => other,
            })
    }

    /// Sends a request and waits for the response carrying the same lock id.
    pub async fn call(&self, message: DhtMessage) -> Result<DhtMessage> {
        if !self.is_connected() {
            return Err(ChordError::Disconnected(self.describe_peer()));
        }
        let operation = message.kind();
        let (lock_id, slot) = self.pending.register();
        if let Err(e) = self.send(Envelope { lock_id, message }).await {
            self.pending.cancel(lock_id);
            return Err(e);
        }
        self.pending
            .wait(lock_id, slot, operation, self.call_timeout)
            .await
    }

    /// Cooperative close: asks the peer to acknowledge before the socket goes away.
    /// Closing an already closing channel returns immediately.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.is_connected() {
            let (lock_id, slot) = self.pending.register();
            match self
                .send(Envelope {
                    lock_id,
                    message: DhtMessage::Close,
                })
                .await
            {
                Ok(()) => {
                    if let Err(e) = self
                        .pending
                        .wait(lock_id, slot, "Close", self.call_timeout)
                        .await
                    {
                        log_debug!(
                            self.local,
                            "Close of {} not acknowledged: {}",
                            self.describe_peer(),
                            e
                        );
                    }
                }
                Err(e) => {
                    self.pending.cancel(lock_id);
                    log_debug!(self.local, "Could not send Close: {}", e);
                }
            }
        }
        self.teardown().await;
        log_debug!(self.local, "Closed channel to {}", self.describe_peer());
    }

    /// Drops the connection without the close handshake. The peer sees the socket go away
    /// and treats it as a failure.
    pub(crate) async fn abort(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown().await;
        log_debug!(self.local, "Aborted channel to {}", self.describe_peer());
    }

    async fn teardown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.pending.fail_all();
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                log_debug!(self.local, "Shutdown error (non-critical): {}", e);
            }
        }
        self.shutdown.notify_one();
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        owner: Weak<dyn ChannelOwner>,
    ) {
        loop {
            let frame = tokio::select! {
                frame = codec::read_frame::<_, Envelope>(&mut reader) => frame,
                _ = self.shutdown.notified() => break,
            };
            match frame {
                Ok(envelope) => {
                    if !self.dispatch(envelope, &owner).await {
                        break;
                    }
                }
                Err(e) => {
                    if !self.closing.load(Ordering::SeqCst) {
                        if let ChordError::Protocol(_) = e {
                            log_error!(
                                self.local,
                                "Dropping connection to {}: {}",
                                self.describe_peer(),
                                e
                            );
                        } else {
                            log_debug!(
                                self.local,
                                "Read from {} failed: {}",
                                self.describe_peer(),
                                e
                            );
                        }
                        self.lost(&owner).await;
                    }
                    break;
                }
            }
        }
    }

    /// Returns `false` once the receive loop should stop.
    async fn dispatch(
        self: &Arc<Self>,
        envelope: Envelope,
        owner: &Weak<dyn ChannelOwner>,
    ) -> bool {
        let Envelope { lock_id, message } = envelope;
        match message {
            DhtMessage::Hello { node } => {
                log_debug!(self.local, "{} identified as {}", self.remote_addr, node);
                self.set_peer(node);
                if let Some(owner) = owner.upgrade() {
                    owner.channel_identified(self);
                }
                true
            }
            DhtMessage::Close => {
                self.acknowledge_close(lock_id).await;
                if let Some(owner) = owner.upgrade() {
                    owner.channel_closed_by_peer(self);
                }
                false
            }
            message if message.is_response() => {
                if !self.pending.fulfill(lock_id, message) {
                    log_debug!(
                        self.local,
                        "Ignoring response {} from {}, nobody is waiting for it",
                        lock_id,
                        self.describe_peer()
                    );
                }
                true
            }
            request => {
                let Some(owner) = owner.upgrade() else {
                    // Nobody left to serve requests, release local waiters and hang up
                    log_debug!(
                        self.local,
                        "Owner gone, dropping channel to {}",
                        self.describe_peer()
                    );
                    self.teardown().await;
                    return false;
                };
                self.spawn_handler(lock_id, request, owner.handler(), owner.workers());
                true
            }
        }
    }

    fn spawn_handler(
        self: &Arc<Self>,
        lock_id: LockId,
        request: DhtMessage,
        handler: Option<Arc<dyn InboundHandler>>,
        workers: Arc<Semaphore>,
    ) {
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            let response = match handler {
                Some(handler) => {
                    let Ok(_permit) = workers.acquire_owned().await else {
                        return;
                    };
                    handler.handle_request(request).await
                }
                None => DhtMessage::Error {
                    message: "node is not serving requests".to_string(),
                },
            };
            if let Err(e) = channel
                .send(Envelope {
                    lock_id,
                    message: response,
                })
                .await
            {
                log_debug!(channel.local, "Failed to answer request {}: {}", lock_id, e);
            }
        });
    }

    async fn acknowledge_close(&self, lock_id: LockId) {
        self.closing.store(true, Ordering::SeqCst);
        if let Err(e) = self
            .send(Envelope {
                lock_id,
                message: DhtMessage::TerminatedMethod,
            })
            .await
        {
            log_debug!(self.local, "Could not acknowledge Close: {}", e);
        }
        self.teardown().await;
        log_debug!(
            self.local,
            "Channel to {} closed by peer",
            self.describe_peer()
        );
    }

    async fn lost(self: &Arc<Self>, owner: &Weak<dyn ChannelOwner>) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let abandoned = self.pending.fail_all();
        log_warn!(
            self.local,
            "Lost connection to {} ({} calls abandoned)",
            self.describe_peer(),
            abandoned
        );
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                log_debug!(self.local, "Shutdown error (non-critical): {}", e);
            }
        }
        if let Some(owner) = owner.upgrade() {
            owner.channel_lost(self);
        }
    }
}
