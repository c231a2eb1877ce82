//! The relay server: accepts WebSocket connections and routes signals
//! between registered peers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use scriptorium_core::PeerId;

use super::RelayFrame;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per peer before deliveries to it are dropped
    pub peer_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9191".to_string(),
            peer_buffer: 256,
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by `SCRIPTORIUM_RELAY_ADDR` and
    /// `SCRIPTORIUM_RELAY_BUFFER`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("SCRIPTORIUM_RELAY_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(raw) = std::env::var("SCRIPTORIUM_RELAY_BUFFER") {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => config.peer_buffer = n,
                _ => log::warn!("Ignoring invalid SCRIPTORIUM_RELAY_BUFFER={raw}"),
            }
        }
        config
    }
}

/// Relay counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub routed: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    routed: AtomicU64,
    dropped: AtomicU64,
}

struct Registration {
    connection: Uuid,
    outbound: mpsc::Sender<Arc<Vec<u8>>>,
}

type PeerTable = Arc<RwLock<HashMap<PeerId, Registration>>>;

pub struct SignalRelay {
    config: RelayConfig,
    peers: PeerTable,
    stats: Arc<AtomicRelayStats>,
}

impl SignalRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            peers: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(AtomicRelayStats::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Signal relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let peers = self.peers.clone();
            let stats = self.stats.clone();
            let buffer = self.config.peer_buffer;
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, peers, stats, buffer).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        peers: PeerTable,
        stats: Arc<AtomicRelayStats>,
        buffer: usize,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let connection = Uuid::new_v4();
        let (outbound, mut outbound_rx) = mpsc::channel::<Arc<Vec<u8>>>(buffer.max(1));

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("WebSocket connection {connection} established from {addr}");

        let mut peer: Option<PeerId> = None;
        let result: Result<(), BoxError> = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            match RelayFrame::decode(&bytes) {
                                Ok(RelayFrame::Hello { peer: id }) => match peer {
                                    Some(registered) => log::warn!(
                                        "Ignoring Hello as {} on connection {connection}, already registered as {}",
                                        id.short(),
                                        registered.short()
                                    ),
                                    None => {
                                        Self::register(&peers, id, connection, outbound.clone()).await;
                                        peer = Some(id);
                                    }
                                },
                                Ok(RelayFrame::Signal { recipients, message }) => match peer {
                                    Some(from) => Self::route(&peers, &stats, from, &recipients, message).await,
                                    None => log::warn!("Signal before Hello on connection {connection}"),
                                },
                                Ok(RelayFrame::Delivery { .. }) => {
                                    log::warn!("Client frame of the wrong direction on connection {connection}");
                                }
                                Err(e) => log::warn!("Undecodable frame on connection {connection}: {e}"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break Ok(()),
                        Some(Ok(_)) => {}
                    }
                }
                Some(frame) = outbound_rx.recv() => {
                    if let Err(e) = ws_sender.send(Message::Binary(frame.to_vec().into())).await {
                        break Err(e.into());
                    }
                }
            }
        };

        if let Some(id) = peer {
            let mut table = peers.write().await;
            if table.get(&id).is_some_and(|r| r.connection == connection) {
                table.remove(&id);
                log::info!("Peer {} disconnected from relay", id.short());
            }
        }
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }

    async fn register(peers: &PeerTable, peer: PeerId, connection: Uuid, outbound: mpsc::Sender<Arc<Vec<u8>>>) {
        let previous = peers
            .write()
            .await
            .insert(peer, Registration { connection, outbound });
        if previous.is_some() {
            log::info!("Peer {} re-registered on connection {connection}", peer.short());
        } else {
            log::info!("Peer {} registered on connection {connection}", peer.short());
        }
    }

    async fn route(
        peers: &PeerTable,
        stats: &AtomicRelayStats,
        from: PeerId,
        recipients: &[PeerId],
        message: Vec<u8>,
    ) {
        let delivery = match (RelayFrame::Delivery { provenance: from, message }).encode() {
            Ok(bytes) => Arc::new(bytes),
            Err(e) => {
                log::error!("Failed to encode delivery from {}: {e}", from.short());
                return;
            }
        };
        let table = peers.read().await;
        for recipient in recipients {
            let delivered = table
                .get(recipient)
                .map(|r| r.outbound.try_send(delivery.clone()).is_ok())
                .unwrap_or(false);
            if delivered {
                stats.routed.fetch_add(1, Ordering::Relaxed);
            } else {
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Dropped delivery {} -> {}", from.short(), recipient.short());
            }
        }
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            routed: self.stats.routed.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}
