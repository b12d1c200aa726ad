//! Backing image provisioning.
//!
//! An [`ImageProvisioner`] owns the block images behind volumes. Every call
//! is idempotent where the operation allows it, so the lifecycle manager can
//! retry freely after a [`ClusterError::Retryable`] failure.

mod mock;
mod rbd;

pub use mock::MockProvisioner;
pub use rbd::RbdProvisioner;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::ClusterError;
use crate::types::VolumeAccess;

/// Result of a cluster call.
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Snapshot every source image must carry to be cloned from.
pub const SOURCE_SNAPSHOT: &str = "base";

/// Creates, resizes and removes backing images.
#[async_trait]
pub trait ImageProvisioner: Send + Sync {
    /// Create the image for volume `id`.
    ///
    /// With `source`, the image is cloned from `<source>@base` and grown to
    /// `size_bytes`. An existing image of the requested size is success; an
    /// existing image of another size is `ConflictingSpec`.
    async fn create_image(
        &self,
        id: &str,
        size_bytes: u64,
        labels: &HashMap<String, String>,
        source: Option<&str>,
    ) -> ClusterResult<()>;

    /// Remove the image. A missing image is success.
    async fn delete_image(&self, id: &str) -> ClusterResult<()>;

    /// Grow the image. Equal size is a no-op, a smaller size is
    /// `ShrinkNotSupported`, a missing image is `NotFound`.
    async fn resize_image(&self, id: &str, new_size_bytes: u64) -> ClusterResult<()>;

    /// Current size of the image, `None` if it does not exist.
    async fn image_size(&self, id: &str) -> ClusterResult<Option<u64>>;

    /// Access information identifying the image of volume `id`.
    fn access(&self, id: &str) -> VolumeAccess;
}
