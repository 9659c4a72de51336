//! JSON metadata documents attached to events.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

/// Error raised when constructing a [`Metadata`] from an invalid document.
#[derive(Debug, Clone, Error)]
#[error("Invalid metadata: {reason}")]
pub struct InvalidMetadata {
    reason: String,
}

impl InvalidMetadata {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// An immutable, structured metadata document.
///
/// Metadata is the small, structured half of an event. In memory it is a
/// JSON document; on the wire it is whatever byte sequence the topic's
/// serializer produces. Cloning is cheap (the document is shared).
#[derive(Debug, Clone)]
pub struct Metadata {
    json: Arc<Value>,
}

impl Metadata {
    /// Parse a JSON document.
    pub fn from_json_str(s: &str) -> Result<Self, InvalidMetadata> {
        let json: Value =
            serde_json::from_str(s).map_err(|e| InvalidMetadata::new(e.to_string()))?;
        Ok(Self::from(json))
    }

    /// Build metadata from any serializable value.
    pub fn from_serialize<T: serde::Serialize>(value: &T) -> Result<Self, InvalidMetadata> {
        let json =
            serde_json::to_value(value).map_err(|e| InvalidMetadata::new(e.to_string()))?;
        Ok(Self::from(json))
    }

    /// The underlying JSON document.
    pub fn json(&self) -> &Value {
        &self.json
    }

    /// Look up a top-level field, if the document is an object.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.json.as_object().and_then(|o| o.get(name))
    }

    /// Serialize back to compact JSON text.
    pub fn to_json_string(&self) -> String {
        self.json.to_string()
    }
}

impl Default for Metadata {
    /// An empty JSON object.
    fn default() -> Self {
        Self::from(Value::Object(Default::default()))
    }
}

impl From<Value> for Metadata {
    fn from(json: Value) -> Self {
        Self {
            json: Arc::new(json),
        }
    }
}

impl PartialEq for Metadata {
    fn eq(&self, other: &Self) -> bool {
        self.json == other.json
    }
}

impl Eq for Metadata {}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.json)
    }
}
