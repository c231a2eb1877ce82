use thiserror::Error;

use crate::types::Hash;
use crate::record::RecordKind;

/// Errors raised while encoding, decoding or verifying records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Expected a {expected:?} record, found {found:?}")]
    KindMismatch { expected: RecordKind, found: RecordKind },

    #[error("Record content hashes to {actual}, but is addressed as {claimed}")]
    HashMismatch { claimed: Hash, actual: Hash },
}

/// Encode a serde value with the workspace-wide bincode configuration.
pub(crate) fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, CoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| CoreError::Encode(e.to_string()))
}

/// Decode a serde value with the workspace-wide bincode configuration.
pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, CoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| CoreError::Decode(e.to_string()))?;
    Ok(value)
}
