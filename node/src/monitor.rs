//! Lifecycle notifications for an external collector.
//!
//! A node always has a monitor. Without a reachable collector it is [`NoopMonitor`], so the
//! protocol code reports events unconditionally. [`RemoteMonitor`] sends each event over its
//! own framed TCP link and waits (bounded) for the collector's acknowledgement.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chord_lib::monitor::{MonitorAck, MonitorEvent, MonitorMessage};
use log::{debug, info, warn};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::codec;
use crate::error::{ChordError, Result};
use crate::pending::PendingCalls;

#[async_trait]
pub trait Monitor: Send + Sync + 'static {
    async fn notify(&self, event: MonitorEvent);
}

pub struct NoopMonitor;

#[async_trait]
impl Monitor for NoopMonitor {
    async fn notify(&self, _event: MonitorEvent) {}
}

pub struct RemoteMonitor {
    address: String,
    writer: Mutex<OwnedWriteHalf>,
    pending: Arc<PendingCalls<()>>,
    connected: Arc<AtomicBool>,
    ack_timeout: Duration,
}

impl RemoteMonitor {
    pub async fn connect(address: &str, ack_timeout: Duration) -> Result<Self> {
        let stream = match tokio::time::timeout(ack_timeout, TcpStream::connect(address)).await {
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
                    reason: format!("timed out after {:?}", ack_timeout),
                })
            }
        };
        let (reader, writer) = stream.into_split();
        let pending = Arc::new(PendingCalls::new());
        let connected = Arc::new(AtomicBool::new(true));
        tokio::spawn(receive_acks(
            address.to_string(),
            reader,
            pending.clone(),
            connected.clone(),
        ));

        Ok(Self {
            address: address.to_string(),
            writer: Mutex::new(writer),
            pending,
            connected,
            ack_timeout,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn receive_acks(
    address: String,
    mut reader: OwnedReadHalf,
    pending: Arc<PendingCalls<()>>,
    connected: Arc<AtomicBool>,
) {
    loop {
        match codec::read_frame::<_, MonitorAck>(&mut reader).await {
            Ok(ack) => {
                if !pending.fulfill(ack.lock_id, ()) {
                    debug!("Stale monitor ack {} from {}", ack.lock_id, address);
                }
            }
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                pending.fail_all();
                warn!(
                    "Monitor at {} went away ({}); no further events will be sent",
                    address, e
                );
                break;
            }
        }
    }
}

#[async_trait]
impl Monitor for RemoteMonitor {
    async fn notify(&self, event: MonitorEvent) {
        if !self.is_connected() {
            return;
        }
        let (lock_id, slot) = self.pending.register();
        let sent = {
            let mut writer = self.writer.lock().await;
            codec::write_frame(&mut *writer, &MonitorMessage { lock_id, event }).await
        };
        if let Err(e) = sent {
            self.pending.cancel(lock_id);
            self.connected.store(false, Ordering::SeqCst);
            warn!(
                "Failed to report {:?} to monitor at {}: {}",
                event, self.address, e
            );
            return;
        }
        if let Err(e) = self
            .pending
            .wait(lock_id, slot, "MonitorEvent", self.ack_timeout)
            .await
        {
            debug!("Monitor did not acknowledge {:?}: {}", event, e);
        }
    }
}

/// Connects to the collector at `address`, falling back to [`NoopMonitor`] when there is
/// none or it cannot be reached.
pub async fn connect_monitor(address: Option<&str>, ack_timeout: Duration) -> Arc<dyn Monitor> {
    let Some(address) = address else {
        return Arc::new(NoopMonitor);
    };
    match RemoteMonitor::connect(address, ack_timeout).await {
        Ok(monitor) => {
            info!("Reporting lifecycle events to monitor at {}", address);
            Arc::new(monitor)
        }
        Err(e) => {
            warn!("Monitor unavailable ({}); continuing without it", e);
            Arc::new(NoopMonitor)
        }
    }
}
