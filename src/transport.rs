//! Collaborator interfaces: one-sided bulk transfers and the RPC surface of
//! remote topic managers.
//!
//! The crate never talks to a network itself. Embedders provide a
//! [`BulkEngine`] and one [`TopicManagerEndpoint`] per partition provider;
//! everything here is object safe and returns [`BoxFuture`]s so tests can
//! substitute mocks.

use std::fmt::Debug;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use thiserror::Error;
use uuid::Uuid;

use crate::event::EventId;
use crate::metadata::Metadata;

/// Transport-level bulk transfer failure.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Bulk registration failed: {0}")]
    Expose(String),

    #[error("Bulk transfer failed: {0}")]
    Transfer(String),

    #[error("Bulk region out of bounds: [{offset}, {offset}+{size}) exceeds {len} bytes")]
    OutOfBounds { offset: u64, size: u64, len: u64 },
}

/// Failure of the RPC machinery itself (the remote side never replied).
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request error: {0}")]
    Request(String),
}

/// Non-success reported by the remote topic manager.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ServerError {
    pub message: String,
}

impl ServerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Reply of a remote procedure. The outer error is the transport failing to
/// deliver; the inner error is the server's own verdict.
pub type Reply<T> = Result<Result<T, ServerError>, RpcError>;

/// Access mode requested when registering memory with the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// A transport-registered, remotely readable view over one or more memory
/// regions. Offsets address the concatenation of the registered segments.
pub trait ExposedBulk: Debug + Send + Sync {
    /// Total number of bytes covered by this handle.
    fn size(&self) -> u64;

    /// One-sided read of `size` bytes starting at `offset`.
    fn read(&self, offset: u64, size: u64) -> BoxFuture<'_, Result<Bytes, TransportError>>;
}

pub type BulkHandle = Arc<dyn ExposedBulk>;

/// Registers memory with the transport.
pub trait BulkEngine: Debug + Send + Sync {
    fn expose(&self, segments: Vec<Bytes>, mode: BulkMode) -> Result<BulkHandle, TransportError>;
}

/// A remotely readable sub-region of an exposed bulk.
#[derive(Debug, Clone)]
pub struct BulkRef {
    pub bulk: BulkHandle,
    pub offset: u64,
    pub size: u64,
}

impl BulkRef {
    /// The whole region behind a handle.
    pub fn whole(bulk: BulkHandle) -> Self {
        let size = bulk.size();
        Self {
            bulk,
            offset: 0,
            size,
        }
    }

    pub async fn pull(&self) -> Result<Bytes, TransportError> {
        self.bulk.read(self.offset, self.size).await
    }
}

/// Arguments of the `send_batch` RPC. `bulk` exposes the packed batch frame;
/// `data_offset` is the byte offset at which the raw data region starts, so
/// the server can skip straight to it.
#[derive(Debug, Clone)]
pub struct SendBatchArgs {
    pub topic_name: String,
    pub producer_name: String,
    pub count: u64,
    pub total_data_size: u64,
    pub data_offset: u64,
    pub bulk: BulkHandle,
}

/// Arguments of the long-lived `request_events` RPC.
#[derive(Debug, Clone)]
pub struct RequestEventsArgs {
    pub topic_name: String,
    pub target_index: usize,
    pub consumer_id: Uuid,
    pub consumer_name: String,
    /// 0 = no limit.
    pub max_events: u64,
    /// Preferred events per callback; 0 lets the server decide.
    pub batch_size: u64,
}

/// One batch streamed back to a consumer while `request_events` is open.
#[derive(Debug, Clone)]
pub struct BatchDelivery {
    pub target_index: usize,
    pub count: u64,
    pub first_id: EventId,
    pub meta_sizes: BulkRef,
    pub meta: BulkRef,
    pub data_desc_sizes: BulkRef,
    pub data_desc: BulkRef,
}

/// Client-side sink invoked by the server for every streamed batch.
pub trait EventSink: Send + Sync {
    fn recv_batch(&self, batch: BatchDelivery) -> BoxFuture<'_, Result<(), RpcError>>;
}

/// Plugin descriptions returned when a topic is created or opened, letting
/// the client instantiate the same policies the topic was declared with.
#[derive(Debug, Clone)]
pub struct TopicAccept {
    pub validator: Metadata,
    pub selector: Metadata,
    pub serializer: Metadata,
}

/// RPC surface of one remote topic-manager provider.
pub trait TopicManagerEndpoint: Debug + Send + Sync {
    /// Stable address of the hosting process, used for partition identity.
    fn addr(&self) -> &str;

    fn create_topic(
        &self,
        name: &str,
        config: Metadata,
        validator: Metadata,
        selector: Metadata,
        serializer: Metadata,
    ) -> BoxFuture<'_, Reply<TopicAccept>>;

    fn open_topic(&self, name: &str) -> BoxFuture<'_, Reply<TopicAccept>>;

    fn send_batch(&self, args: SendBatchArgs) -> BoxFuture<'_, Reply<EventId>>;

    /// Stays open until the window is exhausted or the consumer is removed;
    /// `sink` receives every streamed batch in the meantime.
    fn request_events(
        &self,
        args: RequestEventsArgs,
        sink: Arc<dyn EventSink>,
    ) -> BoxFuture<'_, Reply<()>>;

    fn remove_consumer(&self, consumer_id: Uuid) -> BoxFuture<'_, Reply<()>>;
}

/// Identity of a partition target inside process-local maps.
pub type PartitionIdentity = (String, u16);

/// A partition target: the endpoint hosting it plus the provider id owning a
/// share of the topic's events.
#[derive(Debug, Clone)]
pub struct PartitionTarget {
    endpoint: Arc<dyn TopicManagerEndpoint>,
    provider_id: u16,
}

impl PartitionTarget {
    pub fn new(endpoint: Arc<dyn TopicManagerEndpoint>, provider_id: u16) -> Self {
        Self {
            endpoint,
            provider_id,
        }
    }

    pub fn endpoint(&self) -> &Arc<dyn TopicManagerEndpoint> {
        &self.endpoint
    }

    pub fn provider_id(&self) -> u16 {
        self.provider_id
    }

    pub fn identity(&self) -> PartitionIdentity {
        (self.endpoint.addr().to_owned(), self.provider_id)
    }
}

pub mod mem {
    //! In-process transport: bulk handles that read the registered segments
    //! directly. Useful for tests and single-process embeddings.

    use super::*;

    /// Engine whose handles serve reads straight from the registered
    /// segments; registration never fails.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct MemEngine;

    impl BulkEngine for MemEngine {
        fn expose(
            &self,
            segments: Vec<Bytes>,
            _mode: BulkMode,
        ) -> Result<BulkHandle, TransportError> {
            Ok(Arc::new(MemBulk::new(segments)))
        }
    }

    /// A bulk view over a list of segments, addressed as one contiguous
    /// byte range.
    #[derive(Debug)]
    pub struct MemBulk {
        segments: Vec<Bytes>,
        size: u64,
    }

    impl MemBulk {
        pub fn new(segments: Vec<Bytes>) -> Self {
            let size = segments.iter().map(|s| s.len() as u64).sum();
            Self { segments, size }
        }

        fn copy_out(&self, offset: u64, size: u64) -> Result<Bytes, TransportError> {
            if offset + size > self.size {
                return Err(TransportError::OutOfBounds {
                    offset,
                    size,
                    len: self.size,
                });
            }
            let mut out = Vec::with_capacity(size as usize);
            let mut skip = offset as usize;
            let mut remaining = size as usize;
            for seg in &self.segments {
                if remaining == 0 {
                    break;
                }
                if skip >= seg.len() {
                    skip -= seg.len();
                    continue;
                }
                let take = (seg.len() - skip).min(remaining);
                out.extend_from_slice(&seg[skip..skip + take]);
                skip = 0;
                remaining -= take;
            }
            Ok(Bytes::from(out))
        }
    }

    impl ExposedBulk for MemBulk {
        fn size(&self) -> u64 {
            self.size
        }

        fn read(&self, offset: u64, size: u64) -> BoxFuture<'_, Result<Bytes, TransportError>> {
            Box::pin(async move { self.copy_out(offset, size) })
        }
    }
}
