//! WebSocket signal relay.
//!
//! ```text
//!  RelayTransport (A) ──Hello{A}──►┐
//!  RelayTransport (B) ──Hello{B}──►├── SignalRelay
//!                                  │     peer → outbound queue
//!  A: Signal{[B], msg} ──────────► │
//!                                  └──► B: Delivery{provenance: A, msg}
//! ```
//!
//! The relay never decodes session messages. It stamps each delivery with
//! the peer registered on the sending connection, so a client cannot
//! forge another peer's provenance after its `Hello`.

pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};

use scriptorium_core::PeerId;

use crate::protocol::ProtocolError;

pub use client::RelayTransport;
pub use server::{RelayConfig, RelayStats, SignalRelay};

/// Frames exchanged between relay clients and the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// Client → relay, first frame: register this connection as `peer`.
    Hello { peer: PeerId },
    /// Client → relay: forward an encoded `WorkspaceMessage`.
    Signal { recipients: Vec<PeerId>, message: Vec<u8> },
    /// Relay → client: an encoded `WorkspaceMessage` from `provenance`.
    Delivery { provenance: PeerId, message: Vec<u8> },
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(frame)
    }
}
