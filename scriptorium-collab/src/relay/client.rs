//! Relay client: a [`Transport`] over a WebSocket connection to a
//! [`SignalRelay`](super::SignalRelay).
//!
//! Deliveries are decoded at this boundary. A message with an unknown
//! payload tag, or otherwise undecodable, is logged and dropped before it
//! reaches the session coordinator.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use scriptorium_core::PeerId;

use super::RelayFrame;
use crate::protocol::{SynMessage, SynSignal, WorkspaceMessage};
use crate::transport::{Transport, TransportError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

pub struct RelayTransport {
    me: PeerId,
    outgoing: mpsc::Sender<Vec<u8>>,
    state: Arc<RwLock<ConnectionState>>,
}

impl RelayTransport {
    /// Connect to the relay at `url` (e.g. `ws://127.0.0.1:9191`) as `me`.
    ///
    /// Returns the transport and the receiver inbound signals arrive on.
    pub async fn connect(
        url: &str,
        me: PeerId,
        inbox_capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<SynSignal>), TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let (signal_tx, signal_rx) = mpsc::channel::<SynSignal>(inbox_capacity.max(1));
        let state = Arc::new(RwLock::new(ConnectionState::Connected));

        // Writer task: forward outgoing frames to the WebSocket
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: decode deliveries into signals
        let reader_state = state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let Some(signal) = decode_delivery(&bytes) else {
                            continue;
                        };
                        if signal_tx.send(signal).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *reader_state.write().await = ConnectionState::Disconnected;
            log::info!("Relay connection of {} closed", me.short());
        });

        let hello = RelayFrame::Hello { peer: me }.encode()?;
        out_tx.send(hello).await.map_err(|_| TransportError::Closed)?;
        log::info!("Peer {} connected to relay {url}", me.short());

        Ok((Self { me, outgoing: out_tx, state }, signal_rx))
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }
}

fn decode_delivery(bytes: &[u8]) -> Option<SynSignal> {
    let (provenance, message) = match RelayFrame::decode(bytes) {
        Ok(RelayFrame::Delivery { provenance, message }) => (provenance, message),
        Ok(_) => {
            log::warn!("Relay sent a frame of the wrong direction");
            return None;
        }
        Err(e) => {
            log::warn!("Undecodable relay frame: {e}");
            return None;
        }
    };
    match WorkspaceMessage::decode(&message) {
        Ok(message) => Some(SynSignal { provenance, message }),
        Err(e) => {
            log::warn!("Rejected message from {}: {e}", provenance.short());
            None
        }
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn local_peer(&self) -> PeerId {
        self.me
    }

    async fn send_signal(&self, message: SynMessage) -> Result<(), TransportError> {
        if *self.state.read().await == ConnectionState::Disconnected {
            return Err(TransportError::Closed);
        }
        let frame = RelayFrame::Signal {
            recipients: message.recipients,
            message: message.workspace_message.encode()?,
        };
        self.outgoing
            .send(frame.encode()?)
            .await
            .map_err(|_| TransportError::Closed)
    }
}
