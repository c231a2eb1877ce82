//! Immutable, content-addressed history nodes.
//!
//! A commit's identity is the BLAKE3 hash of its bincode encoding, so two
//! structurally equal commits always share an address and creating the same
//! commit twice is a no-op.

use serde::{Deserialize, Serialize};

use crate::error::{self, CoreError};
use crate::types::{CommitHash, Hash, PeerId};

/// One snapshot node in a workspace's history DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Opaque CRDT snapshot of the document at this point.
    pub state: Vec<u8>,
    /// Parents. Empty for the first commit of a lineage, several at merge points.
    pub previous_commit_hashes: Vec<CommitHash>,
    /// Peers whose changes are included.
    pub authors: Vec<PeerId>,
    /// Peers who observed the session when the commit was made.
    pub witnesses: Vec<PeerId>,
    /// Opaque application metadata.
    pub meta: Option<Vec<u8>>,
}

impl Commit {
    /// A parentless commit starting a new lineage.
    pub fn root(state: Vec<u8>, author: PeerId, meta: Option<Vec<u8>>) -> Self {
        Self {
            state,
            previous_commit_hashes: Vec::new(),
            authors: vec![author],
            witnesses: Vec::new(),
            meta,
        }
    }

    pub fn is_root(&self) -> bool {
        self.previous_commit_hashes.is_empty()
    }

    /// Content address of this commit.
    pub fn hash(&self) -> Result<CommitHash, CoreError> {
        Ok(Hash::of(&self.encode()?))
    }

    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        error::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        error::decode(bytes)
    }
}
