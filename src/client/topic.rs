//! Handles to topics and the policies bound to them.

use std::fmt;
use std::sync::Arc;

use crate::client::consumer::ConsumerBuilder;
use crate::client::producer::ProducerBuilder;
use crate::client::Client;
use crate::metadata::Metadata;
use crate::selector::TargetSelector;
use crate::serializer::Serializer;
use crate::transport::{BulkEngine, PartitionTarget};
use crate::validator::Validator;

/// Plugin declarations sent when creating a topic. Empty metadata selects
/// the registry's `"default"` entry for that concern.
#[derive(Debug, Clone, Default)]
pub struct TopicConfig {
    /// Storage backend configuration, interpreted by the topic manager.
    pub backend: Metadata,
    pub validator: Metadata,
    pub selector: Metadata,
    pub serializer: Metadata,
}

/// A topic as seen by one client: its name, the policy plugins it was
/// declared with, and the partition targets serving it.
///
/// Cloning is cheap; clones share the same plugins.
#[derive(Clone)]
pub struct TopicHandle {
    inner: Arc<TopicInner>,
}

struct TopicInner {
    name: String,
    client: Client,
    validator: Arc<dyn Validator>,
    selector: Arc<dyn TargetSelector>,
    serializer: Arc<dyn Serializer>,
    targets: Vec<PartitionTarget>,
}

impl TopicHandle {
    pub(crate) fn new(
        name: &str,
        client: &Client,
        validator: Arc<dyn Validator>,
        selector: Arc<dyn TargetSelector>,
        serializer: Arc<dyn Serializer>,
        targets: Vec<PartitionTarget>,
    ) -> Self {
        Self {
            inner: Arc::new(TopicInner {
                name: name.to_owned(),
                client: client.clone(),
                validator,
                selector,
                serializer,
                targets,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    pub fn validator(&self) -> &Arc<dyn Validator> {
        &self.inner.validator
    }

    pub fn selector(&self) -> &Arc<dyn TargetSelector> {
        &self.inner.selector
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.inner.serializer
    }

    pub fn targets(&self) -> &[PartitionTarget] {
        &self.inner.targets
    }

    pub(crate) fn engine(&self) -> &Arc<dyn BulkEngine> {
        self.inner.client.engine()
    }

    /// Start building a producer for this topic.
    pub fn producer(&self, name: impl Into<String>) -> ProducerBuilder {
        ProducerBuilder::new(self.clone(), name.into())
    }

    /// Start building a consumer for this topic.
    pub fn consumer(&self, name: impl Into<String>) -> ConsumerBuilder {
        ConsumerBuilder::new(self.clone(), name.into())
    }
}

impl fmt::Debug for TopicHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicHandle")
            .field("name", &self.inner.name)
            .field("partitions", &self.inner.targets.len())
            .finish()
    }
}
