//! Pluggable CRDT engine.
//!
//! The coordinator never looks inside document state. It moves opaque
//! change, snapshot and sync-message bytes between peers and asks a
//! [`Replica`] to merge them. [`YrsEngine`] backs replicas with a `yrs::Doc`
//! and uses the Yjs v1 update encoding on the wire.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Update};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Malformed CRDT payload: {0}")]
    Decode(String),
    #[error("Failed to apply CRDT update: {0}")]
    Apply(String),
}

/// One live copy of a document.
pub trait Replica: Send {
    /// Merge opaque changes. Merging is commutative and idempotent.
    fn apply_changes(&mut self, changes: &[Vec<u8>]) -> Result<(), EngineError>;

    /// Full state, loadable with [`CrdtEngine::load`].
    fn save_snapshot(&self) -> Vec<u8>;

    /// Summary of what this replica has, for a peer to diff against.
    fn sync_message(&self) -> Vec<u8>;

    /// Changes the sender of `sync_message` is missing, or everything when
    /// `sync_message` is `None`. `Ok(None)` means there is nothing to send.
    fn changes_for(&self, sync_message: Option<&[u8]>) -> Result<Option<Vec<u8>>, EngineError>;
}

/// Factory for replicas.
pub trait CrdtEngine: Send + Sync {
    /// A replica holding the empty initial state.
    fn init_state(&self) -> Box<dyn Replica>;

    /// A replica restored from a snapshot.
    fn load(&self, snapshot: &[u8]) -> Result<Box<dyn Replica>, EngineError>;
}

/// v1 encoding of an update with no blocks and an empty delete set.
const EMPTY_UPDATE_V1: [u8; 2] = [0, 0];

#[derive(Debug, Clone, Copy, Default)]
pub struct YrsEngine;

impl YrsEngine {
    pub fn new() -> Self {
        Self
    }
}

impl CrdtEngine for YrsEngine {
    fn init_state(&self) -> Box<dyn Replica> {
        Box::new(YrsReplica { doc: yrs::Doc::new() })
    }

    fn load(&self, snapshot: &[u8]) -> Result<Box<dyn Replica>, EngineError> {
        let mut replica = YrsReplica { doc: yrs::Doc::new() };
        replica.apply_one(snapshot)?;
        Ok(Box::new(replica))
    }
}

pub struct YrsReplica {
    doc: yrs::Doc,
}

impl YrsReplica {
    fn apply_one(&mut self, change: &[u8]) -> Result<(), EngineError> {
        let update = Update::decode_v1(change).map_err(|e| EngineError::Decode(e.to_string()))?;
        let mut txn = yrs::Transact::transact_mut(&self.doc);
        txn.apply_update(update).map_err(|e| EngineError::Apply(e.to_string()))
    }
}

impl Replica for YrsReplica {
    fn apply_changes(&mut self, changes: &[Vec<u8>]) -> Result<(), EngineError> {
        for change in changes {
            self.apply_one(change)?;
        }
        Ok(())
    }

    fn save_snapshot(&self) -> Vec<u8> {
        let txn = yrs::Transact::transact(&self.doc);
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn sync_message(&self) -> Vec<u8> {
        let txn = yrs::Transact::transact(&self.doc);
        txn.state_vector().encode_v1()
    }

    fn changes_for(&self, sync_message: Option<&[u8]>) -> Result<Option<Vec<u8>>, EngineError> {
        let remote = match sync_message {
            Some(bytes) => StateVector::decode_v1(bytes).map_err(|e| EngineError::Decode(e.to_string()))?,
            None => StateVector::default(),
        };
        let txn = yrs::Transact::transact(&self.doc);
        let diff = txn.encode_diff_v1(&remote);
        if diff.as_slice() == EMPTY_UPDATE_V1 {
            return Ok(None);
        }
        Ok(Some(diff))
    }
}
