//! Persistent ledger backends.
//!
//! ```text
//! ┌───────────────┐  Ledger trait  ┌──────────────────────────────────────┐
//! │ WorkspaceStore│ ─────────────► │ RocksLedger                          │
//! │ SessionManager│                │ CF "workspaces"   — workspace entries│
//! └───────────────┘                │ CF "commits"      — LZ4 entries      │
//!                                  │ CF "tips"         — tip pointers     │
//!                                  │ CF "participants" — joined peers     │
//!                                  │ CF "sessions"     — live sessions    │
//!                                  └──────────────────────────────────────┘
//! ```

pub mod rocks;

pub use rocks::{LedgerStoreConfig, RocksLedger};
