//! Scribe-side commit building.
//!
//! A commit captures the session's document state at one point in time:
//! snapshot, authors and the change-sequence watermark are taken together
//! under the session lock. The lock is released for the ledger writes, so
//! changes arriving meanwhile are applied as usual and stay uncommitted
//! until the next commit.

use scriptorium_core::{Commit, CommitHash, WorkspaceHash};

use crate::protocol::Role;
use crate::session::{SessionError, SessionEvent, SessionInner, SessionManager};

/// Result of [`commit_changes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { hash: CommitHash },
    /// Only the scribe commits. Nothing was written.
    RoleMismatch,
    /// No document change since the last commit.
    NothingToCommit,
    /// Another commit of this session has not finished yet.
    InProgress,
}

struct PendingCommit {
    generation: u64,
    workspace_hash: WorkspaceHash,
    watermark: u64,
    commit: Commit,
}

/// Persist the session's uncommitted changes as a commit and advance the
/// workspace tip to it.
pub async fn commit_changes(session: &SessionManager) -> Result<CommitOutcome, SessionError> {
    let inner = session.inner();
    let pending = {
        let mut state = inner.state.lock().await;
        let role = state.role;
        let generation = state.generation;
        let active = state.active.as_mut().ok_or(SessionError::NoSession)?;

        if role != Role::Scribe {
            log::warn!(
                "Peer {} asked to commit session {} but is not its scribe",
                inner.me.short(),
                active.info.session_id
            );
            return Ok(CommitOutcome::RoleMismatch);
        }
        if active.commit_in_flight {
            return Ok(CommitOutcome::InProgress);
        }
        if active.contributions.is_empty() {
            return Ok(CommitOutcome::NothingToCommit);
        }

        active.commit_in_flight = true;
        PendingCommit {
            generation,
            workspace_hash: active.info.workspace_hash,
            watermark: active.change_seq,
            commit: Commit {
                state: active.state.save_snapshot(),
                previous_commit_hashes: vec![active.parent()],
                authors: active.authors(),
                witnesses: active.folks.in_session(),
                meta: None,
            },
        }
    };

    let written = write_commit(inner, &pending).await;

    let mut state = inner.state.lock().await;
    let same_session = state.generation == pending.generation;
    let active = state.active.as_mut().filter(|_| same_session);

    let hash = match written {
        Ok(hash) => hash,
        Err(e) => {
            if let Some(active) = active {
                active.commit_in_flight = false;
            }
            log::warn!("Commit on {} failed: {e}", pending.workspace_hash.short());
            return Err(e);
        }
    };

    match active {
        Some(active) => {
            active.commit_in_flight = false;
            active.commits.push(hash);
            active.contributions.retain(|(seq, _)| *seq > pending.watermark);
        }
        None => log::info!("Session ended while commit {} was being written", hash.short()),
    }
    drop(state);

    log::info!(
        "Committed {} on workspace {} ({} author(s), {} witness(es))",
        hash.short(),
        pending.workspace_hash.short(),
        pending.commit.authors.len(),
        pending.commit.witnesses.len()
    );
    inner.emit(SessionEvent::Committed(hash));
    Ok(CommitOutcome::Committed { hash })
}

async fn write_commit(inner: &SessionInner, pending: &PendingCommit) -> Result<CommitHash, SessionError> {
    let hash = inner.store.create_commit(pending.commit.clone()).await?;
    inner.store.update_workspace_tip(pending.workspace_hash, hash).await?;
    Ok(hash)
}
