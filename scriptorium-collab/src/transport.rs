//! Signal transport: fire-and-forget multicast between peers.
//!
//! Outbound messages carry an explicit recipient list; inbound messages
//! arrive as [`SynSignal`]s on an `mpsc` receiver handed out when the peer
//! connects. Delivery is best effort: a full or closed inbox drops the
//! signal, which the presence timers eventually notice.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

use scriptorium_core::PeerId;

use crate::protocol::{ProtocolError, SynMessage, SynSignal};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(String),
    #[error(transparent)]
    Codec(#[from] ProtocolError),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// The identity signals from this transport are stamped with.
    fn local_peer(&self) -> PeerId;

    /// Send `message` to each of its recipients.
    async fn send_signal(&self, message: SynMessage) -> Result<(), TransportError>;
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: u64,
    pub dropped: u64,
}

struct NetworkInner {
    inboxes: RwLock<HashMap<PeerId, mpsc::Sender<SynSignal>>>,
    capacity: usize,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// In-process network joining any number of peers.
#[derive(Clone)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                inboxes: RwLock::new(HashMap::new()),
                capacity,
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Attach `peer`, replacing any earlier attachment.
    pub async fn connect(&self, peer: PeerId) -> (LoopbackTransport, mpsc::Receiver<SynSignal>) {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        self.inner.inboxes.write().await.insert(peer, tx);
        log::debug!("Peer {} attached to loopback network", peer.short());
        (LoopbackTransport { me: peer, network: self.clone() }, rx)
    }

    /// Detach `peer`. Its inbox closes once drained and its sends fail.
    pub async fn disconnect(&self, peer: &PeerId) {
        self.inner.inboxes.write().await.remove(peer);
        log::debug!("Peer {} detached from loopback network", peer.short());
    }

    pub async fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.inboxes.read().await.contains_key(peer)
    }

    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new(256)
    }
}

pub struct LoopbackTransport {
    me: PeerId,
    network: LoopbackNetwork,
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn local_peer(&self) -> PeerId {
        self.me
    }

    async fn send_signal(&self, message: SynMessage) -> Result<(), TransportError> {
        let inner = &self.network.inner;
        let inboxes = inner.inboxes.read().await;
        if !inboxes.contains_key(&self.me) {
            return Err(TransportError::Closed);
        }
        let signal = SynSignal { provenance: self.me, message: message.workspace_message };
        for recipient in &message.recipients {
            let delivered = inboxes
                .get(recipient)
                .map(|tx| tx.try_send(signal.clone()).is_ok())
                .unwrap_or(false);
            if delivered {
                inner.delivered.fetch_add(1, Ordering::Relaxed);
            } else {
                inner.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Dropped signal from {} to {}", self.me.short(), recipient.short());
            }
        }
        Ok(())
    }
}
