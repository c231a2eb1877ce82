//! Session message protocol.
//!
//! Wire format (bincode-encoded `WireMessage`):
//! ```text
//! ┌────────────────┬──────────┬──────────────────────┐
//! │ workspace_hash │ tag      │ body                 │
//! │ 32 bytes       │ 1 byte   │ variable (per tag)   │
//! └────────────────┴──────────┴──────────────────────┘
//! ```
//!
//! The tag is decoded explicitly so that a peer speaking a newer or broken
//! dialect is rejected with [`ProtocolError::UnknownPayload`] at the
//! boundary instead of being misread.
//!
//! Dispatch is a pure function of the local role and the received payload:
//! [`dispatch`] returns the [`Effect`]s the session coordinator must carry
//! out, and performs none of them itself.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use scriptorium_core::{Hash, PeerId, WorkspaceHash};

/// Payload tags on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadTag {
    JoinWorkspace = 1,
    LeaveWorkspace = 2,
    ChangeNotice = 3,
    SyncReq = 4,
    Heartbeat = 5,
    FolkLore = 6,
}

impl TryFrom<u8> for PayloadTag {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            1 => PayloadTag::JoinWorkspace,
            2 => PayloadTag::LeaveWorkspace,
            3 => PayloadTag::ChangeNotice,
            4 => PayloadTag::SyncReq,
            5 => PayloadTag::Heartbeat,
            6 => PayloadTag::FolkLore,
            other => return Err(ProtocolError::UnknownPayload(format!("tag {other}"))),
        })
    }
}

/// Everything peers in a session say to each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePayload {
    /// Folk → scribe: let me in.
    JoinWorkspace,
    /// Folk → scribe, or scribe → folks: I'm leaving.
    LeaveWorkspace,
    /// Opaque CRDT changes for the document and for ephemeral state.
    ChangeNotice {
        state_changes: Vec<Vec<u8>>,
        ephemeral_changes: Vec<Vec<u8>>,
    },
    /// Opaque CRDT sync messages; the receiver answers with what we lack.
    SyncReq {
        sync_message: Option<Vec<u8>>,
        ephemeral_sync_message: Option<Vec<u8>>,
    },
    /// Folk → scribe liveness signal.
    Heartbeat { known_participants: Vec<PeerId> },
    /// Scribe → participants: these folks timed out.
    FolkLore { gone: Vec<PeerId> },
}

impl MessagePayload {
    pub fn tag(&self) -> PayloadTag {
        match self {
            MessagePayload::JoinWorkspace => PayloadTag::JoinWorkspace,
            MessagePayload::LeaveWorkspace => PayloadTag::LeaveWorkspace,
            MessagePayload::ChangeNotice { .. } => PayloadTag::ChangeNotice,
            MessagePayload::SyncReq { .. } => PayloadTag::SyncReq,
            MessagePayload::Heartbeat { .. } => PayloadTag::Heartbeat,
            MessagePayload::FolkLore { .. } => PayloadTag::FolkLore,
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            MessagePayload::JoinWorkspace | MessagePayload::LeaveWorkspace => Ok(Vec::new()),
            MessagePayload::ChangeNotice { state_changes, ephemeral_changes } => {
                encode(&(state_changes, ephemeral_changes))
            }
            MessagePayload::SyncReq { sync_message, ephemeral_sync_message } => {
                encode(&(sync_message, ephemeral_sync_message))
            }
            MessagePayload::Heartbeat { known_participants } => encode(known_participants),
            MessagePayload::FolkLore { gone } => encode(gone),
        }
    }

    fn decode_body(tag: PayloadTag, body: &[u8]) -> Result<Self, ProtocolError> {
        Ok(match tag {
            PayloadTag::JoinWorkspace => MessagePayload::JoinWorkspace,
            PayloadTag::LeaveWorkspace => MessagePayload::LeaveWorkspace,
            PayloadTag::ChangeNotice => {
                let (state_changes, ephemeral_changes) = decode(body)?;
                MessagePayload::ChangeNotice { state_changes, ephemeral_changes }
            }
            PayloadTag::SyncReq => {
                let (sync_message, ephemeral_sync_message) = decode(body)?;
                MessagePayload::SyncReq { sync_message, ephemeral_sync_message }
            }
            PayloadTag::Heartbeat => MessagePayload::Heartbeat { known_participants: decode(body)? },
            PayloadTag::FolkLore => MessagePayload::FolkLore { gone: decode(body)? },
        })
    }
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    workspace_hash: Hash,
    tag: u8,
    body: Vec<u8>,
}

/// A payload bound to the workspace it concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceMessage {
    pub workspace_hash: WorkspaceHash,
    pub payload: MessagePayload,
}

impl WorkspaceMessage {
    pub fn new(workspace_hash: WorkspaceHash, payload: MessagePayload) -> Self {
        Self { workspace_hash, payload }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(&WireMessage {
            workspace_hash: self.workspace_hash,
            tag: self.payload.tag() as u8,
            body: self.payload.encode_body()?,
        })
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let wire: WireMessage = decode(bytes)?;
        let tag = PayloadTag::try_from(wire.tag)?;
        Ok(Self {
            workspace_hash: wire.workspace_hash,
            payload: MessagePayload::decode_body(tag, &wire.body)?,
        })
    }
}

/// Outbound envelope: an explicit multicast recipient list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynMessage {
    pub recipients: Vec<PeerId>,
    pub workspace_message: WorkspaceMessage,
}

impl SynMessage {
    pub fn new(recipients: Vec<PeerId>, workspace_hash: WorkspaceHash, payload: MessagePayload) -> Self {
        Self {
            recipients,
            workspace_message: WorkspaceMessage::new(workspace_hash, payload),
        }
    }
}

/// Inbound form: a message bound to its verified sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynSignal {
    pub provenance: PeerId,
    pub message: WorkspaceMessage,
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Encode(String),
    #[error("Deserialization error: {0}")]
    Decode(String),
    #[error("Unknown payload: {0}")]
    UnknownPayload(String),
    #[error("Message for workspace {got} received in a session on {expected}")]
    ForeignWorkspace { expected: WorkspaceHash, got: WorkspaceHash },
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Decode(e.to_string()))?;
    Ok(value)
}

// ───────────────────────────────────────────────────────────────────
// Dispatch
// ───────────────────────────────────────────────────────────────────

/// A peer's role in the session it is (or is not) part of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    NoSession,
    Joining,
    Scribe,
    Folk,
}

/// What the local peer knows when a signal arrives.
#[derive(Debug, Clone, Copy)]
pub struct DispatchContext {
    pub role: Role,
    pub me: PeerId,
    /// Scribe of the active session, if any.
    pub scribe: Option<PeerId>,
    /// Workspace of the active session, if any.
    pub workspace_hash: Option<WorkspaceHash>,
}

/// A side effect requested by [`dispatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Scribe: insert or refresh a folk's presence and mark it in session.
    SeeFolk(PeerId),
    /// Scribe: forget a folk that left.
    RemoveFolk(PeerId),
    ApplyStateChanges { from: PeerId, changes: Vec<Vec<u8>> },
    ApplyEphemeralChanges { from: PeerId, changes: Vec<Vec<u8>> },
    /// Scribe: forward a folk's changes to every other folk in session.
    RelayChanges {
        from: PeerId,
        state_changes: Vec<Vec<u8>>,
        ephemeral_changes: Vec<Vec<u8>>,
    },
    /// Send `to` the changes it lacks; optionally ask for what we lack.
    AnswerSync {
        to: PeerId,
        sync_message: Option<Vec<u8>>,
        ephemeral_sync_message: Option<Vec<u8>>,
        request_back: bool,
    },
    /// Folk: learned of a fellow participant.
    NoteParticipant(PeerId),
    /// Folk: the scribe reported these participants gone.
    ForgetParticipants(Vec<PeerId>),
    /// Folk: send the scribe a heartbeat now.
    AnnouncePresence,
    /// Tear down the local session.
    EndSession { reason: &'static str },
    /// Nothing to do; logged by the caller.
    Ignore { reason: &'static str },
}

/// Map `(role, payload)` to the side effects the coordinator must perform.
///
/// Signals for another workspace are rejected. Signals that make no sense
/// for the current role produce [`Effect::Ignore`]: stale and duplicate
/// messages are expected on a lossy peer-to-peer transport.
pub fn dispatch(ctx: &DispatchContext, signal: &SynSignal) -> Result<Vec<Effect>, ProtocolError> {
    let from = signal.provenance;
    let payload = &signal.message.payload;

    let expected = match (ctx.role, ctx.workspace_hash) {
        (Role::Scribe | Role::Folk, Some(ws)) => ws,
        _ => return Ok(vec![Effect::Ignore { reason: "no active session" }]),
    };
    if signal.message.workspace_hash != expected {
        return Err(ProtocolError::ForeignWorkspace {
            expected,
            got: signal.message.workspace_hash,
        });
    }
    if from == ctx.me {
        return Ok(vec![Effect::Ignore { reason: "own signal" }]);
    }

    Ok(match ctx.role {
        Role::Scribe => dispatch_as_scribe(from, payload),
        Role::Folk => dispatch_as_folk(from, ctx.scribe, ctx.me, payload),
        Role::NoSession | Role::Joining => vec![Effect::Ignore { reason: "no active session" }],
    })
}

fn dispatch_as_scribe(from: PeerId, payload: &MessagePayload) -> Vec<Effect> {
    match payload {
        MessagePayload::LeaveWorkspace => vec![Effect::RemoveFolk(from)],
        MessagePayload::JoinWorkspace => vec![
            Effect::SeeFolk(from),
            Effect::AnswerSync {
                to: from,
                sync_message: None,
                ephemeral_sync_message: None,
                request_back: true,
            },
        ],
        MessagePayload::SyncReq { sync_message, ephemeral_sync_message } => vec![
            Effect::SeeFolk(from),
            Effect::AnswerSync {
                to: from,
                sync_message: sync_message.clone(),
                ephemeral_sync_message: ephemeral_sync_message.clone(),
                request_back: true,
            },
        ],
        MessagePayload::ChangeNotice { state_changes, ephemeral_changes } => {
            let mut effects = vec![Effect::SeeFolk(from)];
            effects.extend(apply_changes(from, state_changes, ephemeral_changes));
            if !state_changes.is_empty() || !ephemeral_changes.is_empty() {
                effects.push(Effect::RelayChanges {
                    from,
                    state_changes: state_changes.clone(),
                    ephemeral_changes: ephemeral_changes.clone(),
                });
            }
            effects
        }
        MessagePayload::Heartbeat { .. } => vec![Effect::SeeFolk(from)],
        MessagePayload::FolkLore { .. } => vec![
            Effect::SeeFolk(from),
            Effect::Ignore { reason: "folk lore is only sent by the scribe" },
        ],
    }
}

fn dispatch_as_folk(
    from: PeerId,
    scribe: Option<PeerId>,
    me: PeerId,
    payload: &MessagePayload,
) -> Vec<Effect> {
    let from_scribe = scribe == Some(from);
    match payload {
        MessagePayload::LeaveWorkspace if from_scribe => {
            vec![Effect::EndSession { reason: "scribe left the session" }]
        }
        MessagePayload::LeaveWorkspace => vec![Effect::ForgetParticipants(vec![from])],
        MessagePayload::JoinWorkspace => {
            vec![Effect::Ignore { reason: "join request sent to a folk" }]
        }
        MessagePayload::Heartbeat { .. } => {
            vec![Effect::Ignore { reason: "heartbeat sent to a folk" }]
        }
        MessagePayload::SyncReq { sync_message, ephemeral_sync_message } => vec![
            Effect::NoteParticipant(from),
            Effect::AnswerSync {
                to: from,
                sync_message: sync_message.clone(),
                ephemeral_sync_message: ephemeral_sync_message.clone(),
                request_back: false,
            },
        ],
        MessagePayload::ChangeNotice { state_changes, ephemeral_changes } => {
            let mut effects = vec![Effect::NoteParticipant(from)];
            effects.extend(apply_changes(from, state_changes, ephemeral_changes));
            effects
        }
        MessagePayload::FolkLore { gone } if from_scribe => {
            let mut effects = Vec::with_capacity(2);
            let others: Vec<PeerId> = gone.iter().copied().filter(|p| *p != me).collect();
            if !others.is_empty() {
                effects.push(Effect::ForgetParticipants(others));
            }
            // Named gone while still listening: heartbeat so the scribe readmits us.
            if gone.contains(&me) {
                effects.push(Effect::AnnouncePresence);
            }
            effects
        }
        MessagePayload::FolkLore { .. } => {
            vec![Effect::Ignore { reason: "folk lore from a peer that is not the scribe" }]
        }
    }
}

fn apply_changes(from: PeerId, state: &[Vec<u8>], ephemeral: &[Vec<u8>]) -> Vec<Effect> {
    let mut effects = Vec::with_capacity(2);
    if !state.is_empty() {
        effects.push(Effect::ApplyStateChanges { from, changes: state.to_vec() });
    }
    if !ephemeral.is_empty() {
        effects.push(Effect::ApplyEphemeralChanges { from, changes: ephemeral.to_vec() });
    }
    effects
}
