//! Opaque event payloads and their consume-side provisioning seams.

use std::fmt::Debug;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::metadata::Metadata;
use crate::serializer::CodecError;

/// The large, opaque half of an event: a list of byte segments.
///
/// The producer records segment handles without copying their contents;
/// the refcount inside each [`Bytes`] keeps the memory alive until the
/// owning batch has been transferred.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Data {
    segments: Vec<Bytes>,
}

impl Data {
    /// Data with no segments.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_segments(segments: Vec<Bytes>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[Bytes] {
        &self.segments
    }

    /// Total number of payload bytes across all segments.
    pub fn size(&self) -> u64 {
        self.segments.iter().map(|s| s.len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Concatenate all segments into one contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size() as usize);
        for seg in &self.segments {
            out.extend_from_slice(seg);
        }
        out
    }
}

impl From<Bytes> for Data {
    fn from(segment: Bytes) -> Self {
        Self {
            segments: vec![segment],
        }
    }
}

impl From<Vec<u8>> for Data {
    fn from(segment: Vec<u8>) -> Self {
        Self::from(Bytes::from(segment))
    }
}

impl From<&[u8]> for Data {
    fn from(segment: &[u8]) -> Self {
        Self::from(Bytes::copy_from_slice(segment))
    }
}

/// Storage-assigned description of where an event's data lives.
///
/// Descriptors are produced by the topic's storage backend and shipped to
/// consumers in place of the raw payload; a [`DataSelector`] then decides
/// which part of the described region the consumer actually wants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataDescriptor {
    location: Bytes,
    size: u64,
}

impl DataDescriptor {
    pub fn new(location: Bytes, size: u64) -> Self {
        Self { location, size }
    }

    /// Backend-opaque location token.
    pub fn location(&self) -> &Bytes {
        &self.location
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Append the wire encoding: `[size: u64 le][loc_len: u64 le][loc bytes]`.
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u64_le(self.size);
        out.put_u64_le(self.location.len() as u64);
        out.put_slice(&self.location);
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < 16 {
            return Err(CodecError::new(format!(
                "data descriptor truncated: {} bytes",
                bytes.len()
            )));
        }
        let size = bytes.get_u64_le();
        let loc_len = bytes.get_u64_le() as usize;
        if bytes.len() < loc_len {
            return Err(CodecError::new(format!(
                "data descriptor location truncated: expected {loc_len} bytes, got {}",
                bytes.len()
            )));
        }
        let location = Bytes::copy_from_slice(&bytes[..loc_len]);
        Ok(Self { location, size })
    }
}

/// Error raised while provisioning memory for consumed data.
#[derive(Debug, Clone, Error)]
#[error("Data provisioning error: {reason}")]
pub struct ProvisionError {
    reason: String,
}

impl ProvisionError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Decides which part of a described data region a consumer wants.
///
/// Returning `None` skips the data transfer for that event entirely.
pub trait DataSelector: Debug + Send + Sync {
    fn select(&self, metadata: &Metadata, descriptor: &DataDescriptor) -> Option<DataDescriptor>;
}

/// Allocates consumer-side memory for a selected data region.
pub trait DataBroker: Debug + Send + Sync {
    fn allocate(
        &self,
        metadata: &Metadata,
        descriptor: &DataDescriptor,
    ) -> Result<Data, ProvisionError>;
}

/// Default selector: no data is requested.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDataSelector;

impl DataSelector for NullDataSelector {
    fn select(&self, _metadata: &Metadata, _descriptor: &DataDescriptor) -> Option<DataDescriptor> {
        None
    }
}

/// Default broker: allocates nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDataBroker;

impl DataBroker for NullDataBroker {
    fn allocate(
        &self,
        _metadata: &Metadata,
        _descriptor: &DataDescriptor,
    ) -> Result<Data, ProvisionError> {
        Ok(Data::new())
    }
}
