//! Partition routing policies.

use std::collections::hash_map::DefaultHasher;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;
use serde_json::json;
use thiserror::Error;

use crate::metadata::Metadata;
use crate::transport::PartitionTarget;

/// Error raised when no partition target can be chosen for an event.
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct SelectionError {
    reason: String,
}

impl SelectionError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Chooses the partition target an event is routed to.
///
/// The topic hands the selector its target list once (`set_targets`);
/// selection itself must be callable concurrently from producer tasks.
pub trait TargetSelector: Debug + Send + Sync {
    fn set_targets(&self, targets: Vec<PartitionTarget>);

    fn select_target_for(&self, metadata: &Metadata) -> Result<PartitionTarget, SelectionError>;

    /// Self-description exchanged with topic managers.
    fn metadata(&self) -> Metadata;
}

/// Default selector: rotates through the targets.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    state: RwLock<RoundRobinState>,
}

#[derive(Debug, Default)]
struct RoundRobinState {
    targets: Vec<PartitionTarget>,
    next: usize,
}

impl TargetSelector for RoundRobinSelector {
    fn set_targets(&self, targets: Vec<PartitionTarget>) {
        let mut state = self.state.write();
        state.targets = targets;
        state.next = 0;
    }

    fn select_target_for(&self, _metadata: &Metadata) -> Result<PartitionTarget, SelectionError> {
        let mut state = self.state.write();
        if state.targets.is_empty() {
            return Err(SelectionError::new("no partition targets available"));
        }
        let index = state.next % state.targets.len();
        state.next = state.next.wrapping_add(1);
        Ok(state.targets[index].clone())
    }

    fn metadata(&self) -> Metadata {
        Metadata::from(json!({"__type__": "default"}))
    }
}

/// Selector hashing a metadata field so equal keys land on one partition.
#[derive(Debug)]
pub struct KeyHashSelector {
    field: String,
    targets: RwLock<Vec<PartitionTarget>>,
}

impl KeyHashSelector {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            targets: RwLock::new(Vec::new()),
        }
    }
}

impl TargetSelector for KeyHashSelector {
    fn set_targets(&self, targets: Vec<PartitionTarget>) {
        *self.targets.write() = targets;
    }

    fn select_target_for(&self, metadata: &Metadata) -> Result<PartitionTarget, SelectionError> {
        let targets = self.targets.read();
        if targets.is_empty() {
            return Err(SelectionError::new("no partition targets available"));
        }
        let key = metadata.field(&self.field).ok_or_else(|| {
            SelectionError::new(format!("metadata has no \"{}\" field", self.field))
        })?;
        let mut hasher = DefaultHasher::new();
        key.to_string().hash(&mut hasher);
        let index = (hasher.finish() % targets.len() as u64) as usize;
        Ok(targets[index].clone())
    }

    fn metadata(&self) -> Metadata {
        Metadata::from(json!({"__type__": "key_hash", "field": self.field}))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::transport::testing::NullEndpoint;

    fn targets(n: u16) -> Vec<PartitionTarget> {
        (0..n)
            .map(|i| PartitionTarget::new(Arc::new(NullEndpoint::new("node-0")), i))
            .collect()
    }

    #[test]
    fn round_robin_rotates() {
        let selector = RoundRobinSelector::default();
        selector.set_targets(targets(3));
        let metadata = Metadata::default();
        let picked: Vec<u16> = (0..6)
            .map(|_| {
                selector
                    .select_target_for(&metadata)
                    .unwrap()
                    .provider_id()
            })
            .collect();
        assert_eq!(picked, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn empty_target_list_is_an_error() {
        let selector = RoundRobinSelector::default();
        assert!(selector.select_target_for(&Metadata::default()).is_err());
    }

    #[test]
    fn key_hash_is_sticky() {
        let selector = KeyHashSelector::new("name");
        selector.set_targets(targets(4));
        let metadata = Metadata::from_json_str(r#"{"name":"alice"}"#).unwrap();
        let first = selector.select_target_for(&metadata).unwrap().provider_id();
        for _ in 0..4 {
            assert_eq!(
                selector.select_target_for(&metadata).unwrap().provider_id(),
                first
            );
        }
    }
}
