use thiserror::Error;

pub use crate::data::ProvisionError;
pub use crate::metadata::InvalidMetadata;
pub use crate::plugin::PluginError;
pub use crate::selector::SelectionError;
pub use crate::serializer::CodecError;
pub use crate::transport::{RpcError, ServerError, TransportError};
pub use crate::validator::ValidationError;

/// Errors surfaced to users of this crate.
///
/// Failures are `Clone` because one batch-level failure fans out to every
/// promise of the batch.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Partition selection error: {0}")]
    PartitionSelection(#[from] SelectionError),

    #[error("Bulk transfer error: {0}")]
    Exposure(#[from] TransportError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid metadata: {0}")]
    Metadata(#[from] InvalidMetadata),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("Data provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    /// A promise was dropped before fulfillment. Producers and consumers
    /// never do this on purpose; observing it means the owning pipeline was
    /// torn down abnormally.
    #[error("Promise dropped before fulfillment")]
    PromiseDropped,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
