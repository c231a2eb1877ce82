//! Local mirror of the ledger's workspaces and commits.
//!
//! The store validates writes against what it already knows before they
//! reach the ledger: a workspace must point at a known commit and every
//! commit parent must be known. Missing references trigger one refresh
//! from the ledger before the write is rejected.
//!
//! Observers call [`WorkspaceStore::subscribe`] and are woken whenever the
//! mirrored mappings change.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{watch, RwLock};

use scriptorium_core::{
    Commit, CommitGraph, CommitHash, CoreError, KnownWorkspace, PeerId, Workspace, WorkspaceHash,
};

use crate::ledger::{CreateWorkspaceInput, Ledger, LedgerError, UpdateWorkspaceTipInput};

/// Monotonic version of the store's mappings.
pub type StoreVersion = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Tip {0} does not reference a known commit")]
    InvalidTip(CommitHash),
    #[error("Commit {commit} names unknown parent {parent}")]
    DanglingParent { commit: CommitHash, parent: CommitHash },
    #[error("Unknown workspace {0}")]
    UnknownWorkspace(WorkspaceHash),
    #[error("Network error: {0}")]
    Network(LedgerError),
    #[error(transparent)]
    Codec(#[from] CoreError),
}

impl From<LedgerError> for StoreError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InvalidTip(tip) => StoreError::InvalidTip(tip),
            LedgerError::DanglingParent { commit, parent } => StoreError::DanglingParent { commit, parent },
            LedgerError::Codec(e) => StoreError::Codec(e),
            other => StoreError::Network(other),
        }
    }
}

/// A ledger `NotFound` on a workspace-addressed call means the workspace
/// itself is unknown.
fn workspace_error(workspace_hash: WorkspaceHash, e: LedgerError) -> StoreError {
    match e {
        LedgerError::NotFound(_) => StoreError::UnknownWorkspace(workspace_hash),
        other => other.into(),
    }
}

/// Outcome of joining a workspace through the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceJoin {
    pub current_tip: CommitHash,
    pub participants: Vec<PeerId>,
}

#[derive(Default)]
struct Mirror {
    workspaces: HashMap<WorkspaceHash, Workspace>,
    tips: HashMap<WorkspaceHash, CommitHash>,
    commits: HashMap<CommitHash, Commit>,
}

pub struct WorkspaceStore {
    ledger: Arc<dyn Ledger>,
    me: PeerId,
    mirror: RwLock<Mirror>,
    version: watch::Sender<StoreVersion>,
}

impl WorkspaceStore {
    pub fn new(ledger: Arc<dyn Ledger>, me: PeerId) -> Self {
        let (version, _) = watch::channel(0);
        Self { ledger, me, mirror: RwLock::new(Mirror::default()), version }
    }

    pub fn me(&self) -> PeerId {
        self.me
    }

    /// Receiver woken on every change to the mirrored mappings.
    pub fn subscribe(&self) -> watch::Receiver<StoreVersion> {
        self.version.subscribe()
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    // ─── Writes ───────────────────────────────────────────────────────

    /// Create a workspace whose tip is `initial_tip`.
    pub async fn create_workspace(
        &self,
        workspace: Workspace,
        initial_tip: CommitHash,
    ) -> Result<WorkspaceHash, StoreError> {
        if !self.ensure_commits_known(&[initial_tip]).await? {
            return Err(StoreError::InvalidTip(initial_tip));
        }
        let record = self
            .ledger
            .create_workspace(CreateWorkspaceInput {
                workspace: workspace.clone(),
                initial_tip_hash: initial_tip,
            })
            .await?;

        {
            let mut mirror = self.mirror.write().await;
            mirror.workspaces.insert(record.hash, workspace);
            mirror.tips.insert(record.hash, initial_tip);
        }
        self.bump();
        log::info!("Created workspace {} at tip {}", record.hash.short(), initial_tip.short());
        Ok(record.hash)
    }

    /// Store a commit. Identical commits resolve to the same hash and are
    /// written once.
    pub async fn create_commit(&self, commit: Commit) -> Result<CommitHash, StoreError> {
        let hash = commit.hash()?;
        if self.mirror.read().await.commits.contains_key(&hash) {
            return Ok(hash);
        }
        if !self.ensure_commits_known(&commit.previous_commit_hashes).await? {
            let mirror = self.mirror.read().await;
            let parent = commit
                .previous_commit_hashes
                .iter()
                .find(|p| !mirror.commits.contains_key(p))
                .copied()
                .unwrap_or_default();
            return Err(StoreError::DanglingParent { commit: hash, parent });
        }

        let record = self.ledger.create_commit(commit.clone()).await?;
        if record.hash != hash {
            return Err(CoreError::HashMismatch { claimed: record.hash, actual: hash }.into());
        }
        self.mirror.write().await.commits.insert(hash, commit);
        self.bump();
        log::debug!("Stored commit {}", hash.short());
        Ok(hash)
    }

    /// Create the first commit of a lineage, authored by this peer.
    pub async fn create_root_commit(
        &self,
        state: Vec<u8>,
        meta: Option<Vec<u8>>,
    ) -> Result<(CommitHash, Commit), StoreError> {
        let commit = Commit::root(state, self.me, meta);
        let hash = self.create_commit(commit.clone()).await?;
        Ok((hash, commit))
    }

    /// Move a workspace tip. Callers pass a descendant of the current tip;
    /// ancestry is not checked here.
    pub async fn update_workspace_tip(
        &self,
        workspace_hash: WorkspaceHash,
        new_tip: CommitHash,
    ) -> Result<(), StoreError> {
        self.ledger
            .update_workspace_tip(UpdateWorkspaceTipInput { workspace_hash, new_tip_hash: new_tip })
            .await
            .map_err(|e| workspace_error(workspace_hash, e))?;
        self.mirror.write().await.tips.insert(workspace_hash, new_tip);
        self.bump();
        log::debug!("Workspace {} tip -> {}", workspace_hash.short(), new_tip.short());
        Ok(())
    }

    // ─── Refresh ──────────────────────────────────────────────────────

    /// Merge the ledger's workspaces and tips into the local mapping and
    /// return every workspace known. Entries the ledger no longer lists are
    /// kept; tips it reports overwrite ours.
    pub async fn fetch_all_workspaces(&self) -> Result<HashMap<WorkspaceHash, Workspace>, StoreError> {
        let records = self.ledger.get_all_workspaces().await?;
        let mut fetched = Vec::with_capacity(records.len());
        for record in records {
            record.verify()?;
            let tip = self.ledger.get_workspace_tip(record.hash).await?;
            fetched.push((record.hash, record.decode_workspace()?, tip));
        }

        let workspaces = {
            let mut mirror = self.mirror.write().await;
            for (hash, workspace, tip) in fetched {
                mirror.workspaces.insert(hash, workspace);
                mirror.tips.insert(hash, tip);
            }
            mirror.workspaces.clone()
        };
        self.bump();
        Ok(workspaces)
    }

    /// Merge the ledger's commits into the local mapping and return every
    /// commit known. Commits are immutable, so merging by hash never loses
    /// information.
    pub async fn fetch_all_commits(&self) -> Result<HashMap<CommitHash, Commit>, StoreError> {
        let records = self.ledger.get_all_commits().await?;
        let mut fetched = Vec::with_capacity(records.len());
        for record in records {
            record.verify()?;
            fetched.push((record.hash, record.decode_commit()?));
        }

        let commits = {
            let mut mirror = self.mirror.write().await;
            mirror.commits.extend(fetched);
            mirror.commits.clone()
        };
        self.bump();
        Ok(commits)
    }

    /// Register as a participant and mirror the current tip commit.
    pub async fn join_workspace(&self, workspace_hash: WorkspaceHash) -> Result<WorkspaceJoin, StoreError> {
        let out = self
            .ledger
            .join_workspace(workspace_hash, self.me)
            .await
            .map_err(|e| workspace_error(workspace_hash, e))?;
        out.current_tip.verify()?;
        let tip_commit = out.current_tip.decode_commit()?;
        let current_tip = out.current_tip.hash;

        {
            let mut mirror = self.mirror.write().await;
            mirror.commits.insert(current_tip, tip_commit);
            mirror.tips.insert(workspace_hash, current_tip);
        }
        self.bump();
        Ok(WorkspaceJoin { current_tip, participants: out.participants })
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub async fn known_workspaces(&self) -> HashMap<WorkspaceHash, Workspace> {
        self.mirror.read().await.workspaces.clone()
    }

    pub async fn known_commits(&self) -> HashMap<CommitHash, Commit> {
        self.mirror.read().await.commits.clone()
    }

    pub async fn commit(&self, hash: &CommitHash) -> Option<Commit> {
        self.mirror.read().await.commits.get(hash).cloned()
    }

    /// Workspace together with its last known tip.
    pub async fn workspace(&self, hash: &WorkspaceHash) -> Option<KnownWorkspace> {
        let mirror = self.mirror.read().await;
        let current_tip = *mirror.tips.get(hash)?;
        let workspace = mirror.workspaces.get(hash)?.clone();
        Some(KnownWorkspace { workspace, current_tip })
    }

    pub async fn tip(&self, hash: &WorkspaceHash) -> Option<CommitHash> {
        self.mirror.read().await.tips.get(hash).copied()
    }

    /// Run `f` against a DAG view of the mirrored commits.
    pub async fn with_graph<R>(&self, f: impl FnOnce(&CommitGraph<'_>) -> R) -> R {
        let mirror = self.mirror.read().await;
        f(&CommitGraph::new(&mirror.commits))
    }

    /// Whether every hash is mirrored, refreshing once from the ledger if not.
    async fn ensure_commits_known(&self, hashes: &[CommitHash]) -> Result<bool, StoreError> {
        let all_known = |commits: &HashMap<CommitHash, Commit>| hashes.iter().all(|h| commits.contains_key(h));
        if all_known(&self.mirror.read().await.commits) {
            return Ok(true);
        }
        let commits = self.fetch_all_commits().await?;
        Ok(all_known(&commits))
    }
}
