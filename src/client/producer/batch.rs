//! Packed, bulk-exposable event batches.

use bytes::{BufMut, Bytes, BytesMut};

use crate::client::error::Error;
use crate::data::Data;
use crate::event::EventId;
use crate::metadata::Metadata;
use crate::promise::Promise;
use crate::serializer::Serializer;
use crate::transport::{BulkEngine, BulkHandle, BulkMode, TransportError};

/// A packed sequence of (metadata, data segments, promise) triples.
///
/// Append-only until it is taken off its queue; afterwards exactly one of
/// [`EventBatch::complete`] and [`EventBatch::fail`] consumes it. The wire
/// frame exposed by [`EventBatch::expose`] is:
///
/// ```text
/// [0 .. count*8)          meta_sizes    (u64 le)
/// [.. data_offset)        meta_buffer   (concatenated blobs)
/// [data_offset ..)        data_offsets  (u64 le)
/// [.. + count*8)          data_sizes    (u64 le)
/// [.. end)                data_segments (raw bytes, empty segments skipped)
/// ```
#[derive(Debug, Default)]
pub(crate) struct EventBatch {
    meta_sizes: Vec<u64>,
    meta_buffer: Vec<u8>,
    data_offsets: Vec<u64>,
    data_sizes: Vec<u64>,
    data_segments: Vec<Bytes>,
    total_data_size: u64,
    promises: Vec<Promise<EventId>>,
}

impl EventBatch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append one event. On a serialization failure the batch is left
    /// untouched and the promise has already been failed.
    pub(crate) fn push(
        &mut self,
        metadata: &Metadata,
        serializer: &dyn Serializer,
        data: &Data,
        promise: Promise<EventId>,
    ) -> Result<(), Error> {
        let meta_start = self.meta_buffer.len();
        if let Err(e) = serializer.serialize(&mut self.meta_buffer, metadata) {
            self.meta_buffer.truncate(meta_start);
            let error = Error::from(e);
            promise.set_error(error.clone());
            return Err(error);
        }
        self.meta_sizes
            .push((self.meta_buffer.len() - meta_start) as u64);
        self.data_offsets.push(self.total_data_size);
        let mut data_size = 0u64;
        for segment in data.segments() {
            data_size += segment.len() as u64;
            self.data_segments.push(segment.clone());
        }
        self.data_sizes.push(data_size);
        self.total_data_size += data_size;
        self.promises.push(promise);
        Ok(())
    }

    pub(crate) fn count(&self) -> u64 {
        self.meta_sizes.len() as u64
    }

    pub(crate) fn total_data_size(&self) -> u64 {
        self.total_data_size
    }

    /// Byte offset within the exposed frame at which raw data begins.
    pub(crate) fn data_offset(&self) -> u64 {
        self.meta_sizes.len() as u64 * 8 + self.meta_buffer.len() as u64
    }

    /// Register the frame with the transport as a read-only bulk.
    ///
    /// Control arrays are packed into fresh little-endian buffers; the data
    /// segments travel as-is, no copies. An empty batch has no frame and
    /// yields `None`.
    pub(crate) fn expose(
        &self,
        engine: &dyn BulkEngine,
    ) -> Result<Option<BulkHandle>, TransportError> {
        if self.count() == 0 {
            return Ok(None);
        }
        let mut segments = Vec::with_capacity(4 + self.data_segments.len());
        segments.push(pack_u64_le(&self.meta_sizes));
        segments.push(Bytes::copy_from_slice(&self.meta_buffer));
        segments.push(pack_u64_le(&self.data_offsets));
        segments.push(pack_u64_le(&self.data_sizes));
        for segment in &self.data_segments {
            if !segment.is_empty() {
                segments.push(segment.clone());
            }
        }
        engine.expose(segments, BulkMode::ReadOnly).map(Some)
    }

    /// Fulfill every promise with consecutive ids starting at `first_id`.
    pub(crate) fn complete(self, first_id: EventId) {
        for (index, promise) in self.promises.into_iter().enumerate() {
            promise.set_value(first_id + index as u64);
        }
    }

    /// Fail every promise with the same error.
    pub(crate) fn fail(self, error: Error) {
        for promise in self.promises {
            promise.set_error(error.clone());
        }
    }
}

fn pack_u64_le(values: &[u64]) -> Bytes {
    let mut buf = BytesMut::with_capacity(values.len() * 8);
    for value in values {
        buf.put_u64_le(*value);
    }
    buf.freeze()
}
