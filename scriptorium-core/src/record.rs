//! Ledger records: a content hash plus an opaque encoded entry.
//!
//! The ledger stores workspaces and commits as independent entries. A record
//! never embeds a workspace's tip; tips are separate pointer writes.

use serde::{Deserialize, Serialize};

use crate::commit::Commit;
use crate::error::CoreError;
use crate::types::Hash;
use crate::workspace::Workspace;

/// Which entry type a record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Workspace,
    Commit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub hash: Hash,
    pub kind: RecordKind,
    pub entry: Vec<u8>,
}

impl Record {
    pub fn workspace(workspace: &Workspace) -> Result<Self, CoreError> {
        let entry = workspace.encode()?;
        Ok(Self { hash: Hash::of(&entry), kind: RecordKind::Workspace, entry })
    }

    pub fn commit(commit: &Commit) -> Result<Self, CoreError> {
        let entry = commit.encode()?;
        Ok(Self { hash: Hash::of(&entry), kind: RecordKind::Commit, entry })
    }

    /// Check that the entry really hashes to the claimed address.
    pub fn verify(&self) -> Result<(), CoreError> {
        let actual = Hash::of(&self.entry);
        if actual != self.hash {
            log::warn!("Record {} failed verification (content hashes to {})", self.hash, actual);
            return Err(CoreError::HashMismatch { claimed: self.hash, actual });
        }
        Ok(())
    }

    pub fn decode_workspace(&self) -> Result<Workspace, CoreError> {
        self.expect_kind(RecordKind::Workspace)?;
        Workspace::decode(&self.entry)
    }

    pub fn decode_commit(&self) -> Result<Commit, CoreError> {
        self.expect_kind(RecordKind::Commit)?;
        Commit::decode(&self.entry)
    }

    fn expect_kind(&self, expected: RecordKind) -> Result<(), CoreError> {
        if self.kind != expected {
            return Err(CoreError::KindMismatch { expected, found: self.kind });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PeerId;

    #[test]
    fn test_commit_record_decodes_to_original() {
        let commit = Commit::root(vec![4, 5, 6], PeerId::random(), Some(vec![1]));
        let record = Record::commit(&commit).unwrap();
        assert_eq!(record.hash, commit.hash().unwrap());
        assert_eq!(record.decode_commit().unwrap(), commit);
        record.verify().unwrap();
    }

    #[test]
    fn test_workspace_record_decodes_to_original() {
        let ws = Workspace::new("draft");
        let record = Record::workspace(&ws).unwrap();
        assert_eq!(record.hash, ws.hash().unwrap());
        assert_eq!(record.decode_workspace().unwrap(), ws);
    }

    #[test]
    fn test_kind_mismatch() {
        let record = Record::workspace(&Workspace::new("draft")).unwrap();
        assert_eq!(
            record.decode_commit(),
            Err(CoreError::KindMismatch {
                expected: RecordKind::Commit,
                found: RecordKind::Workspace,
            })
        );
    }

    #[test]
    fn test_verify_detects_tampering() {
        let mut record = Record::workspace(&Workspace::new("draft")).unwrap();
        record.entry.push(0);
        assert!(matches!(record.verify(), Err(CoreError::HashMismatch { .. })));
    }
}
