//! Metadata <-> bytes codec seam.

use std::fmt::Debug;

use serde_json::{json, Value};
use thiserror::Error;

use crate::metadata::Metadata;

/// Error raised while encoding or decoding metadata.
#[derive(Debug, Clone, Error)]
#[error("Codec error: {reason}")]
pub struct CodecError {
    reason: String,
}

impl CodecError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Encodes metadata into a batch's packed buffer and decodes it back on the
/// consume side.
///
/// Implementations append to `out` without touching what precedes their own
/// bytes; the batch records how many bytes each call produced.
pub trait Serializer: Debug + Send + Sync {
    fn serialize(&self, out: &mut Vec<u8>, metadata: &Metadata) -> Result<(), CodecError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Metadata, CodecError>;

    /// Self-description exchanged with topic managers so remote peers can
    /// instantiate an equivalent codec through their registry.
    fn metadata(&self) -> Metadata;
}

/// Default serializer: compact JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, out: &mut Vec<u8>, metadata: &Metadata) -> Result<(), CodecError> {
        serde_json::to_writer(out, metadata.json()).map_err(|e| CodecError::new(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Metadata, CodecError> {
        let json: Value =
            serde_json::from_slice(bytes).map_err(|e| CodecError::new(e.to_string()))?;
        Ok(Metadata::from(json))
    }

    fn metadata(&self) -> Metadata {
        Metadata::from(json!({"__type__": "json"}))
    }
}
