//! # scriptorium-collab — session coordination for collaborative editing
//!
//! Peers editing the same workspace form a session. One peer, the scribe,
//! owns the authoritative document and is the only one allowed to commit;
//! the others are folk that stream their changes to it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   SyncReq / ChangeNotice   ┌──────────────┐
//! │ Folk         │ ─────────────────────────► │ Scribe       │
//! │ SessionMgr   │ ◄───────────────────────── │ SessionMgr   │
//! └──────┬───────┘   ChangeNotice / FolkLore  └──────┬───────┘
//!        │  Heartbeat                                │ commit_changes
//!        ▼                                           ▼
//! ┌──────────────┐                            ┌──────────────┐
//! │ Transport    │ (loopback or relay)        │WorkspaceStore│
//! └──────────────┘                            └──────┬───────┘
//!                                                    │ Ledger
//!                                             ┌──────┴───────┐
//!                                             │ MemoryLedger │
//!                                             │ RocksLedger  │
//!                                             └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — workspace messages and the pure signal dispatcher
//! - [`store`] — local mirror of ledger workspaces and commits
//! - [`ledger`] — the remote ledger interface and an in-memory ledger
//! - [`storage`] — RocksDB-backed ledger
//! - [`engine`] — CRDT document replicas (Yrs)
//! - [`presence`] — folk liveness and periodic timers
//! - [`session`] — the session coordinator
//! - [`scribe`] — commit building
//! - [`transport`] — signal delivery and the loopback network
//! - [`relay`] — WebSocket signal relay and its client transport

pub mod engine;
pub mod ledger;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod scribe;
pub mod session;
pub mod storage;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use engine::{CrdtEngine, EngineError, Replica, YrsEngine};
pub use ledger::{Ledger, LedgerError, MemoryLedger, SessionInfo};
pub use presence::{PresenceConfig, PresenceTable};
pub use protocol::{MessagePayload, ProtocolError, Role, SynMessage, SynSignal, WorkspaceMessage};
pub use relay::{RelayConfig, RelayStats, RelayTransport, SignalRelay};
pub use scribe::{commit_changes, CommitOutcome};
pub use session::{SessionConfig, SessionError, SessionEvent, SessionManager};
pub use storage::{LedgerStoreConfig, RocksLedger};
pub use store::{StoreError, WorkspaceStore};
pub use transport::{LoopbackNetwork, LoopbackTransport, Transport, TransportError};
