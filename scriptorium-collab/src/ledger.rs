//! The ledger: the shared, content-addressed record store all peers see.
//!
//! ```text
//!  WorkspaceStore ──► Ledger ──┬── MemoryLedger  (tests, single process)
//!  SessionManager ──►          └── RocksLedger   (storage::rocks, durable)
//! ```
//!
//! The ledger holds three kinds of state:
//! - immutable workspace and commit records, keyed by content hash
//! - one mutable tip pointer per workspace
//! - the session directory (ephemeral sessions and their scribes)
//!
//! Every call may fail with [`LedgerError::Unavailable`]; callers treat that
//! as a recoverable network failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use scriptorium_core::{
    Commit, CommitHash, CoreError, Hash, PeerId, Record, SessionId, Workspace, WorkspaceHash,
};

/// Input for creating a workspace record and its initial tip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateWorkspaceInput {
    pub workspace: Workspace,
    pub initial_tip_hash: CommitHash,
}

/// Input for moving a workspace tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateWorkspaceTipInput {
    pub workspace_hash: WorkspaceHash,
    pub new_tip_hash: CommitHash,
}

/// Result of joining a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinWorkspaceOutput {
    /// Record of the workspace's current tip commit.
    pub current_tip: Record,
    pub participants: Vec<PeerId>,
}

/// A session as published in the ledger's session directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub workspace_hash: WorkspaceHash,
    pub scribe: PeerId,
    /// Workspace tip when the session was created.
    pub initial_tip: CommitHash,
}

/// Ledger errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Tip {0} does not reference a known commit")]
    InvalidTip(CommitHash),
    #[error("Commit {commit} names unknown parent {parent}")]
    DanglingParent { commit: CommitHash, parent: CommitHash },
    #[error(transparent)]
    Codec(#[from] CoreError),
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Remote record store and session directory.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Store a workspace record and point its tip at `initial_tip_hash`.
    async fn create_workspace(&self, input: CreateWorkspaceInput) -> Result<Record, LedgerError>;

    /// Store a commit record. Every parent must already be stored.
    async fn create_commit(&self, commit: Commit) -> Result<Record, LedgerError>;

    async fn update_workspace_tip(&self, input: UpdateWorkspaceTipInput) -> Result<(), LedgerError>;

    async fn get_all_workspaces(&self) -> Result<Vec<Record>, LedgerError>;

    async fn get_all_commits(&self) -> Result<Vec<Record>, LedgerError>;

    async fn get_workspace_tip(&self, workspace_hash: WorkspaceHash) -> Result<CommitHash, LedgerError>;

    /// Register `peer` as a participant and return the current tip.
    async fn join_workspace(
        &self,
        workspace_hash: WorkspaceHash,
        peer: PeerId,
    ) -> Result<JoinWorkspaceOutput, LedgerError>;

    async fn leave_workspace(&self, workspace_hash: WorkspaceHash, peer: PeerId) -> Result<(), LedgerError>;

    /// Open sessions on a workspace, oldest first.
    async fn get_sessions(&self, workspace_hash: WorkspaceHash) -> Result<Vec<SessionInfo>, LedgerError>;

    /// Publish a new session with `scribe` as its coordinator.
    async fn new_session(&self, workspace_hash: WorkspaceHash, scribe: PeerId) -> Result<SessionInfo, LedgerError>;

    async fn get_session(&self, session_id: SessionId) -> Result<SessionInfo, LedgerError>;

    async fn close_session(&self, session_id: SessionId) -> Result<(), LedgerError>;
}

#[derive(Default)]
struct MemoryState {
    workspaces: HashMap<WorkspaceHash, Record>,
    commits: HashMap<CommitHash, Record>,
    tips: HashMap<WorkspaceHash, CommitHash>,
    participants: HashMap<WorkspaceHash, Vec<PeerId>>,
    sessions: HashMap<WorkspaceHash, Vec<SessionInfo>>,
}

/// In-process ledger shared by every peer holding a clone of its `Arc`.
///
/// `set_available(false)` makes every call fail with
/// [`LedgerError::Unavailable`], and `write_count` counts successful
/// mutating calls, so tests can assert that a rejected operation wrote
/// nothing.
#[derive(Default)]
pub struct MemoryLedger {
    state: RwLock<MemoryState>,
    unavailable: AtomicBool,
    writes: AtomicU64,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of successful mutating calls so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), LedgerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("memory ledger switched off".into()));
        }
        Ok(())
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

fn sorted(records: &HashMap<Hash, Record>) -> Vec<Record> {
    let mut out: Vec<Record> = records.values().cloned().collect();
    out.sort_by_key(|r| r.hash);
    out
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn create_workspace(&self, input: CreateWorkspaceInput) -> Result<Record, LedgerError> {
        self.check_available()?;
        let record = Record::workspace(&input.workspace)?;
        let mut state = self.state.write().await;
        if !state.commits.contains_key(&input.initial_tip_hash) {
            return Err(LedgerError::InvalidTip(input.initial_tip_hash));
        }
        state.workspaces.insert(record.hash, record.clone());
        state.tips.insert(record.hash, input.initial_tip_hash);
        self.wrote();
        Ok(record)
    }

    async fn create_commit(&self, commit: Commit) -> Result<Record, LedgerError> {
        self.check_available()?;
        let record = Record::commit(&commit)?;
        let mut state = self.state.write().await;
        if let Some(parent) = commit
            .previous_commit_hashes
            .iter()
            .find(|p| !state.commits.contains_key(p))
        {
            return Err(LedgerError::DanglingParent { commit: record.hash, parent: *parent });
        }
        state.commits.insert(record.hash, record.clone());
        self.wrote();
        Ok(record)
    }

    async fn update_workspace_tip(&self, input: UpdateWorkspaceTipInput) -> Result<(), LedgerError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if !state.workspaces.contains_key(&input.workspace_hash) {
            return Err(LedgerError::NotFound(format!("workspace {}", input.workspace_hash)));
        }
        if !state.commits.contains_key(&input.new_tip_hash) {
            return Err(LedgerError::InvalidTip(input.new_tip_hash));
        }
        state.tips.insert(input.workspace_hash, input.new_tip_hash);
        self.wrote();
        Ok(())
    }

    async fn get_all_workspaces(&self) -> Result<Vec<Record>, LedgerError> {
        self.check_available()?;
        Ok(sorted(&self.state.read().await.workspaces))
    }

    async fn get_all_commits(&self) -> Result<Vec<Record>, LedgerError> {
        self.check_available()?;
        Ok(sorted(&self.state.read().await.commits))
    }

    async fn get_workspace_tip(&self, workspace_hash: WorkspaceHash) -> Result<CommitHash, LedgerError> {
        self.check_available()?;
        self.state
            .read()
            .await
            .tips
            .get(&workspace_hash)
            .copied()
            .ok_or_else(|| LedgerError::NotFound(format!("workspace {workspace_hash}")))
    }

    async fn join_workspace(
        &self,
        workspace_hash: WorkspaceHash,
        peer: PeerId,
    ) -> Result<JoinWorkspaceOutput, LedgerError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let tip = *state
            .tips
            .get(&workspace_hash)
            .ok_or_else(|| LedgerError::NotFound(format!("workspace {workspace_hash}")))?;
        let current_tip = state
            .commits
            .get(&tip)
            .cloned()
            .ok_or(LedgerError::InvalidTip(tip))?;
        let participants = state.participants.entry(workspace_hash).or_default();
        if !participants.contains(&peer) {
            participants.push(peer);
        }
        let participants = participants.clone();
        self.wrote();
        Ok(JoinWorkspaceOutput { current_tip, participants })
    }

    async fn leave_workspace(&self, workspace_hash: WorkspaceHash, peer: PeerId) -> Result<(), LedgerError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if let Some(participants) = state.participants.get_mut(&workspace_hash) {
            participants.retain(|p| *p != peer);
        }
        self.wrote();
        Ok(())
    }

    async fn get_sessions(&self, workspace_hash: WorkspaceHash) -> Result<Vec<SessionInfo>, LedgerError> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .await
            .sessions
            .get(&workspace_hash)
            .cloned()
            .unwrap_or_default())
    }

    async fn new_session(&self, workspace_hash: WorkspaceHash, scribe: PeerId) -> Result<SessionInfo, LedgerError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let initial_tip = *state
            .tips
            .get(&workspace_hash)
            .ok_or_else(|| LedgerError::NotFound(format!("workspace {workspace_hash}")))?;
        let info = SessionInfo { session_id: SessionId::new(), workspace_hash, scribe, initial_tip };
        state.sessions.entry(workspace_hash).or_default().push(info);
        self.wrote();
        Ok(info)
    }

    async fn get_session(&self, session_id: SessionId) -> Result<SessionInfo, LedgerError> {
        self.check_available()?;
        self.state
            .read()
            .await
            .sessions
            .values()
            .flatten()
            .find(|s| s.session_id == session_id)
            .copied()
            .ok_or_else(|| LedgerError::NotFound(format!("session {session_id}")))
    }

    async fn close_session(&self, session_id: SessionId) -> Result<(), LedgerError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        for sessions in state.sessions.values_mut() {
            sessions.retain(|s| s.session_id != session_id);
        }
        self.wrote();
        Ok(())
    }
}
