//! Per-event admission checks.

use std::fmt::Debug;

use serde_json::json;
use thiserror::Error;

use crate::data::Data;
use crate::metadata::Metadata;

/// Error raised when an event is rejected before batching.
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct ValidationError {
    reason: String,
}

impl ValidationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Validates an event before it is routed to a partition.
///
/// A failed validation is surfaced through the promise of the offending
/// push only; it never affects other events.
pub trait Validator: Debug + Send + Sync {
    fn validate(&self, metadata: &Metadata, data: &Data) -> Result<(), ValidationError>;

    /// Self-description exchanged with topic managers.
    fn metadata(&self) -> Metadata;
}

/// Default validator: accepts every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllValidator;

impl Validator for AcceptAllValidator {
    fn validate(&self, _metadata: &Metadata, _data: &Data) -> Result<(), ValidationError> {
        Ok(())
    }

    fn metadata(&self) -> Metadata {
        Metadata::from(json!({"__type__": "default"}))
    }
}

/// Validator requiring the metadata document to be a JSON object.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectValidator;

impl Validator for ObjectValidator {
    fn validate(&self, metadata: &Metadata, _data: &Data) -> Result<(), ValidationError> {
        if metadata.json().is_object() {
            Ok(())
        } else {
            Err(ValidationError::new("metadata is not a JSON object"))
        }
    }

    fn metadata(&self) -> Metadata {
        Metadata::from(json!({"__type__": "object"}))
    }
}
