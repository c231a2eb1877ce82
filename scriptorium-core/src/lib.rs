//! # scriptorium-core — data model for collaborative document history
//!
//! Workspaces are named document lineages. Their history is a DAG of
//! immutable, content-addressed commits; a workspace's tip is a separate
//! pointer into that DAG.
//!
//! ```text
//!   Workspace ──tip──► Commit(m)
//!                       ├── Commit(b) ── Commit(a) ── Commit(root)
//!                       └── Commit(c) ──────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] — `Hash`, `PeerId`, `SessionId`
//! - [`commit`] — history nodes
//! - [`workspace`] — lineages and tip pointers
//! - [`record`] — ledger records (hash + encoded entry)
//! - [`dag`] — ancestry queries

pub mod commit;
pub mod dag;
pub mod error;
pub mod record;
pub mod types;
pub mod workspace;

pub use commit::Commit;
pub use dag::CommitGraph;
pub use error::CoreError;
pub use record::{Record, RecordKind};
pub use types::{CommitHash, Hash, PeerId, SessionId, WorkspaceHash};
pub use workspace::{KnownWorkspace, Workspace, WorkspaceTip};
