//! Named document lineages.

use serde::{Deserialize, Serialize};

use crate::error::{self, CoreError};
use crate::types::{CommitHash, Hash, WorkspaceHash};

/// The immutable part of a workspace. Its tip lives in a separate pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub name: String,
    /// Opaque auxiliary data.
    pub meta: Option<Vec<u8>>,
}

impl Workspace {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), meta: None }
    }

    pub fn with_meta(name: impl Into<String>, meta: Vec<u8>) -> Self {
        Self { name: name.into(), meta: Some(meta) }
    }

    pub fn hash(&self) -> Result<WorkspaceHash, CoreError> {
        Ok(Hash::of(&self.encode()?))
    }

    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        error::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        error::decode(bytes)
    }
}

/// Mutable tip pointer of a workspace, updated by follow-up writes only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceTip {
    pub workspace_hash: WorkspaceHash,
    pub tip: CommitHash,
}

/// A workspace together with its latest known tip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownWorkspace {
    pub workspace: Workspace,
    pub current_tip: CommitHash,
}
