//! Error types for the volume runtime core.

use thiserror::Error;

/// Errors returned by the volume runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VolumeError {
    /// The request is malformed (missing ID, zero size, ...).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested volume class is not configured.
    #[error("Volume class not found: {0}")]
    ClassNotFound(String),

    /// A volume with the same ID but a different spec already exists.
    #[error("Volume already exists with a different spec: {0}")]
    AlreadyExists(String),

    /// The operation is not legal in the volume's current lifecycle state.
    #[error("Invalid volume state for operation: {0}")]
    InvalidState(String),

    /// The volume does not exist.
    #[error("Volume not found: {0}")]
    NotFound(String),

    /// Volumes can only grow.
    #[error("Shrinking volume {id} from {current_bytes} to {requested_bytes} bytes is not supported")]
    ShrinkNotSupported {
        id: String,
        current_bytes: u64,
        requested_bytes: u64,
    },

    /// The metadata store or the cluster is temporarily unreachable.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// A stored volume record could not be decoded.
    #[error("Corrupt metadata for volume {id}: {reason}")]
    CorruptMetadata { id: String, reason: String },

    /// The key-encryption-key could not be loaded.
    #[error("Key unavailable: {0}")]
    KeyUnavailable(String),

    /// Wrapping or unwrapping a data encryption key failed.
    #[error("Crypto failure: {0}")]
    CryptoFailure(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for volume runtime operations.
pub type Result<T> = std::result::Result<T, VolumeError>;

/// Errors reported by cluster calls, classified by whether retrying can help.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// Transient cluster or network fault, including deadline exceeded.
    #[error("Retryable cluster error: {0}")]
    Retryable(String),

    /// The cluster rejected the request permanently.
    #[error("Fatal cluster error: {0}")]
    Fatal(String),

    /// The image exists with a different size.
    #[error("Image {id} exists with size {existing_bytes}, requested {requested_bytes}")]
    ConflictingSpec {
        id: String,
        existing_bytes: u64,
        requested_bytes: u64,
    },

    /// The requested size is smaller than the current size.
    #[error("Image {id} is {current_bytes} bytes, cannot shrink to {requested_bytes}")]
    ShrinkNotSupported {
        id: String,
        current_bytes: u64,
        requested_bytes: u64,
    },

    /// The image does not exist.
    #[error("Image not found: {0}")]
    NotFound(String),
}

impl ClusterError {
    /// Whether the failed call may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClusterError::Retryable(_))
    }
}

impl From<ClusterError> for VolumeError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::Retryable(msg) => VolumeError::Unavailable(msg),
            ClusterError::Fatal(msg) => VolumeError::Internal(msg),
            ClusterError::ConflictingSpec { id, .. } => VolumeError::AlreadyExists(id),
            ClusterError::ShrinkNotSupported { id, current_bytes, requested_bytes } => {
                VolumeError::ShrinkNotSupported { id, current_bytes, requested_bytes }
            }
            ClusterError::NotFound(id) => VolumeError::NotFound(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VolumeError::NotFound("vol-123".into());
        assert_eq!(err.to_string(), "Volume not found: vol-123");
    }

    #[test]
    fn test_cluster_error_conversion() {
        let err: VolumeError = ClusterError::Retryable("ETIMEDOUT".into()).into();
        assert_eq!(err, VolumeError::Unavailable("ETIMEDOUT".into()));

        let err: VolumeError = ClusterError::ShrinkNotSupported {
            id: "vol".into(),
            current_bytes: 2,
            requested_bytes: 1,
        }
        .into();
        assert!(matches!(err, VolumeError::ShrinkNotSupported { current_bytes: 2, .. }));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ClusterError::Retryable("x".into()).is_retryable());
        assert!(!ClusterError::Fatal("x".into()).is_retryable());
        assert!(!ClusterError::NotFound("x".into()).is_retryable());
    }
}
