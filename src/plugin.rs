//! Explicit registration tables for topic policy plugins.
//!
//! Plugins are resolved by the `"__type__"` field of a metadata document;
//! a missing field selects the `"default"` entry. There is no hidden static
//! state: every [`crate::client::Client`] owns its own registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::metadata::Metadata;
use crate::selector::{RoundRobinSelector, TargetSelector};
use crate::serializer::{JsonSerializer, Serializer};
use crate::validator::{AcceptAllValidator, ObjectValidator, Validator};

/// Error raised while resolving or constructing a plugin.
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct PluginError {
    reason: String,
}

impl PluginError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

type Ctor<T> = Arc<dyn Fn(&Metadata) -> Result<Arc<T>, PluginError> + Send + Sync>;

struct Table<T: ?Sized> {
    kind: &'static str,
    ctors: RwLock<HashMap<String, Ctor<T>>>,
}

impl<T: ?Sized> Table<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            ctors: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, name: impl Into<String>, ctor: Ctor<T>) {
        self.ctors.write().insert(name.into(), ctor);
    }

    fn from_metadata(&self, metadata: &Metadata) -> Result<Arc<T>, PluginError> {
        let name = match metadata.field("__type__") {
            None => "default",
            Some(v) => v.as_str().ok_or_else(|| {
                PluginError::new(format!(
                    "invalid __type__ for {} (expected string): {v}",
                    self.kind
                ))
            })?,
        };
        let ctor = self.ctors.read().get(name).map(Arc::clone).ok_or_else(|| {
            PluginError::new(format!("unknown {} type \"{name}\"", self.kind))
        })?;
        ctor(metadata)
    }
}

impl<T: ?Sized> fmt::Debug for Table<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("kind", &self.kind)
            .field("names", &self.ctors.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Registration tables for validators, target selectors, and serializers.
#[derive(Debug)]
pub struct PluginRegistry {
    validators: Table<dyn Validator>,
    selectors: Table<dyn TargetSelector>,
    serializers: Table<dyn Serializer>,
}

impl PluginRegistry {
    /// An empty registry; most callers want [`PluginRegistry::with_defaults`].
    pub fn new() -> Self {
        Self {
            validators: Table::new("validator"),
            selectors: Table::new("selector"),
            serializers: Table::new("serializer"),
        }
    }

    /// A registry preloaded with the built-in plugins.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register_validator("default", |_| Ok(Arc::new(AcceptAllValidator)));
        registry.register_validator("object", |_| Ok(Arc::new(ObjectValidator)));
        registry.register_selector("default", |_| Ok(Arc::new(RoundRobinSelector::default())));
        registry.register_serializer("default", |_| Ok(Arc::new(JsonSerializer)));
        registry.register_serializer("json", |_| Ok(Arc::new(JsonSerializer)));
        registry
    }

    pub fn register_validator(
        &self,
        name: impl Into<String>,
        ctor: impl Fn(&Metadata) -> Result<Arc<dyn Validator>, PluginError> + Send + Sync + 'static,
    ) {
        self.validators.register(name, Arc::new(ctor));
    }

    pub fn register_selector(
        &self,
        name: impl Into<String>,
        ctor: impl Fn(&Metadata) -> Result<Arc<dyn TargetSelector>, PluginError>
            + Send
            + Sync
            + 'static,
    ) {
        self.selectors.register(name, Arc::new(ctor));
    }

    pub fn register_serializer(
        &self,
        name: impl Into<String>,
        ctor: impl Fn(&Metadata) -> Result<Arc<dyn Serializer>, PluginError> + Send + Sync + 'static,
    ) {
        self.serializers.register(name, Arc::new(ctor));
    }

    pub fn validator_from_metadata(
        &self,
        metadata: &Metadata,
    ) -> Result<Arc<dyn Validator>, PluginError> {
        self.validators.from_metadata(metadata)
    }

    pub fn selector_from_metadata(
        &self,
        metadata: &Metadata,
    ) -> Result<Arc<dyn TargetSelector>, PluginError> {
        self.selectors.from_metadata(metadata)
    }

    pub fn serializer_from_metadata(
        &self,
        metadata: &Metadata,
    ) -> Result<Arc<dyn Serializer>, PluginError> {
        self.serializers.from_metadata(metadata)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
