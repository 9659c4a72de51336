//! Client entry points: connect to a service, create or open topics.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tracing::debug;

use crate::plugin::PluginRegistry;
use crate::selector::SelectionError;
use crate::transport::{BulkEngine, PartitionTarget, Reply, TopicAccept};

pub mod consumer;
pub mod error;
pub mod producer;
pub mod topic;

use error::{Error, Result};
use topic::{TopicConfig, TopicHandle};

/// Process-wide client state: the bulk engine and the plugin registry.
///
/// Cloning is cheap; clones share both.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    engine: Arc<dyn BulkEngine>,
    registry: PluginRegistry,
}

impl Client {
    /// A client with the default plugin registry.
    pub fn new(engine: Arc<dyn BulkEngine>) -> Self {
        Self::with_registry(engine, PluginRegistry::with_defaults())
    }

    pub fn with_registry(engine: Arc<dyn BulkEngine>, registry: PluginRegistry) -> Self {
        Self {
            inner: Arc::new(ClientInner { engine, registry }),
        }
    }

    pub fn engine(&self) -> &Arc<dyn BulkEngine> {
        &self.inner.engine
    }

    /// Registration tables used to instantiate topic policies.
    pub fn registry(&self) -> &PluginRegistry {
        &self.inner.registry
    }

    /// Bind this client to a set of partition targets.
    ///
    /// Target discovery is the embedder's concern; whatever registry or
    /// group membership mechanism is in use reduces to this list.
    pub fn connect(&self, targets: Vec<PartitionTarget>) -> ServiceHandle {
        ServiceHandle {
            client: self.clone(),
            targets,
        }
    }
}

/// A connected service: the partition targets topics are spread over.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    client: Client,
    targets: Vec<PartitionTarget>,
}

impl ServiceHandle {
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn targets(&self) -> &[PartitionTarget] {
        &self.targets
    }

    /// Declare a topic and obtain a handle to it.
    ///
    /// The declaration is routed to one manager by topic name; the reply
    /// carries the plugin metadata the topic was accepted with, which is
    /// resolved through the client's registry.
    pub async fn create_topic(&self, name: &str, config: TopicConfig) -> Result<TopicHandle> {
        let target = self.route(name)?;
        debug!(topic = name, partition = ?target.identity(), "creating topic");
        let accept = unwrap_reply(
            target
                .endpoint()
                .create_topic(
                    name,
                    config.backend,
                    config.validator,
                    config.selector,
                    config.serializer,
                )
                .await,
        )?;
        self.topic_from_accept(name, accept)
    }

    /// Open an existing topic.
    pub async fn open_topic(&self, name: &str) -> Result<TopicHandle> {
        let target = self.route(name)?;
        debug!(topic = name, partition = ?target.identity(), "opening topic");
        let accept = unwrap_reply(target.endpoint().open_topic(name).await)?;
        self.topic_from_accept(name, accept)
    }

    fn route(&self, name: &str) -> Result<&PartitionTarget> {
        if self.targets.is_empty() {
            return Err(SelectionError::new("service has no partition targets").into());
        }
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        let index = (hasher.finish() % self.targets.len() as u64) as usize;
        Ok(&self.targets[index])
    }

    fn topic_from_accept(&self, name: &str, accept: TopicAccept) -> Result<TopicHandle> {
        let registry = self.client.registry();
        let validator = registry.validator_from_metadata(&accept.validator)?;
        let selector = registry.selector_from_metadata(&accept.selector)?;
        let serializer = registry.serializer_from_metadata(&accept.serializer)?;
        selector.set_targets(self.targets.clone());
        Ok(TopicHandle::new(
            name,
            &self.client,
            validator,
            selector,
            serializer,
            self.targets.clone(),
        ))
    }
}

fn unwrap_reply<T>(reply: Reply<T>) -> Result<T> {
    match reply {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(server)) => Err(Error::Server(server)),
        Err(rpc) => Err(Error::Rpc(rpc)),
    }
}
