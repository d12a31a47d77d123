use thiserror::Error;

use crate::topology::NodeId;

/// Errors surfaced by the conflict manager.
///
/// The enum is `Clone` because a single version request outcome is shared
/// between every caller that joined the request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RiftmendError {
    #[error("Cache {cache} unable to process request as the conflict manager has been stopped")]
    NotRunning { cache: String },

    #[error("Conflict resolution is already in progress")]
    AlreadyInProgress,

    #[error("Cache {cache} unable to retrieve conflicts while state transfer is in progress")]
    StateTransferInProgress { cache: String },

    #[error("Unable to retrieve key {key} from {node}: {response}")]
    Protocol {
        key: String,
        node: NodeId,
        response: String,
    },

    #[error("Remote execution failed: {0}")]
    Remote(String),

    #[error("Timed out waiting for replicas of segment {segment}")]
    Timeout { segment: usize },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Merge policy configuration error: {0}")]
    MergeConfig(String),

    #[error("Failed to write resolved entry for key {key}: {reason}")]
    WriteFailure { key: String, reason: String },

    #[error("All returned conflicts are absent entries")]
    InconsistentRecord,

    #[error("Interrupted while waiting: {0}")]
    Interrupted(String),
}

pub type Result<T> = std::result::Result<T, RiftmendError>;
