//! Events as observed by consumers.

use crate::data::{Data, DataDescriptor};
use crate::metadata::Metadata;

/// Server-assigned event identifier, strictly monotone per partition.
pub type EventId = u64;

/// A fully reconstructed event delivered to a consumer.
#[derive(Debug, Clone)]
pub struct Event {
    id: EventId,
    partition: usize,
    metadata: Metadata,
    descriptor: DataDescriptor,
    data: Data,
}

impl Event {
    pub(crate) fn new(
        id: EventId,
        partition: usize,
        metadata: Metadata,
        descriptor: DataDescriptor,
        data: Data,
    ) -> Self {
        Self {
            id,
            partition,
            metadata,
            descriptor,
            data,
        }
    }

    /// The identifier assigned by the partition that accepted this event.
    pub fn id(&self) -> EventId {
        self.id
    }

    /// Index of the partition target this event was pulled from.
    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn descriptor(&self) -> &DataDescriptor {
        &self.descriptor
    }

    /// Data provisioned by the consumer's broker; empty unless a selector
    /// requested regions.
    pub fn data(&self) -> &Data {
        &self.data
    }
}
