//! RBD image provisioner.
//!
//! Images are named after the volume ID inside the configured pool, so the
//! handle of a volume is always `<pool>/<volume id>`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::{ClusterResult, ImageProvisioner, SOURCE_SNAPSHOT};
use crate::ceph::CephCluster;
use crate::error::ClusterError;
use crate::types::VolumeAccess;

/// Driver name reported in the access information.
pub const DRIVER_NAME: &str = "ceph";

/// Subset of `rbd info --format json`.
#[derive(Debug, Deserialize)]
struct RbdImageInfo {
    size: u64,
}

/// Provisioner driving the `rbd` CLI.
pub struct RbdProvisioner {
    cluster: Arc<CephCluster>,
}

impl RbdProvisioner {
    pub fn new(cluster: Arc<CephCluster>) -> Self {
        Self { cluster }
    }

    /// Full image spec: pool/image
    fn image_spec(&self, id: &str) -> String {
        format!("{}/{}", self.cluster.pool(), id)
    }

    /// Size argument in bytes.
    fn size_arg(size_bytes: u64) -> String {
        format!("{}B", size_bytes)
    }

    async fn grow(&self, image_spec: &str, size_bytes: u64) -> ClusterResult<()> {
        self.cluster
            .rbd(&["resize", "--size", &Self::size_arg(size_bytes), image_spec])
            .await?;
        Ok(())
    }

    async fn set_labels(&self, image_spec: &str, labels: &HashMap<String, String>) -> ClusterResult<()> {
        for (key, value) in labels {
            self.cluster
                .rbd(&["image-meta", "set", image_spec, key, value])
                .await?;
        }
        Ok(())
    }

    /// Reconcile with an image that already exists.
    async fn adopt_existing(
        &self,
        id: &str,
        existing_bytes: u64,
        size_bytes: u64,
        source: Option<&str>,
    ) -> ClusterResult<()> {
        if existing_bytes == size_bytes {
            debug!(volume_id = %id, "Image already exists with requested size");
            return Ok(());
        }

        // A clone whose grow step did not complete
        if source.is_some() && existing_bytes < size_bytes {
            info!(volume_id = %id, existing_bytes, size_bytes, "Finishing grow of cloned image");
            return self.grow(&self.image_spec(id), size_bytes).await;
        }

        Err(ClusterError::ConflictingSpec {
            id: id.to_string(),
            existing_bytes,
            requested_bytes: size_bytes,
        })
    }
}

#[async_trait]
impl ImageProvisioner for RbdProvisioner {
    #[instrument(skip(self, labels), fields(volume_id = %id, size_bytes = %size_bytes))]
    async fn create_image(
        &self,
        id: &str,
        size_bytes: u64,
        labels: &HashMap<String, String>,
        source: Option<&str>,
    ) -> ClusterResult<()> {
        if let Some(existing) = self.image_size(id).await? {
            self.adopt_existing(id, existing, size_bytes, source).await?;
            return self.set_labels(&self.image_spec(id), labels).await;
        }

        let image_spec = self.image_spec(id);
        let created = match source {
            Some(source) => {
                let snapshot = format!("{}@{}", self.image_spec(source), SOURCE_SNAPSHOT);
                info!(source = %snapshot, dest = %image_spec, "Cloning RBD image");
                self.cluster.rbd(&["clone", &snapshot, &image_spec]).await
            }
            None => {
                info!(image = %image_spec, "Creating RBD image");
                self.cluster
                    .rbd(&["create", "--size", &Self::size_arg(size_bytes), &image_spec])
                    .await
            }
        };

        match created {
            Ok(_) => {}
            // Lost a race with another creator, or a missing clone source
            Err(ClusterError::Fatal(msg)) if msg.contains("exists") => {
                let existing = self.image_size(id).await?.ok_or(ClusterError::Fatal(msg))?;
                self.adopt_existing(id, existing, size_bytes, source).await?;
            }
            Err(ClusterError::NotFound(msg)) => {
                return Err(ClusterError::Fatal(format!("source image unavailable: {}", msg)));
            }
            Err(e) => return Err(e),
        }

        if source.is_some() {
            let cloned = self.image_size(id).await?.unwrap_or_default();
            if cloned < size_bytes {
                self.grow(&image_spec, size_bytes).await?;
            } else if cloned > size_bytes {
                return Err(ClusterError::Fatal(format!(
                    "source image is {} bytes, larger than the requested {}",
                    cloned, size_bytes
                )));
            }
        }

        self.set_labels(&image_spec, labels).await?;

        info!(volume_id = %id, "RBD image created");
        Ok(())
    }

    #[instrument(skip(self), fields(volume_id = %id))]
    async fn delete_image(&self, id: &str) -> ClusterResult<()> {
        let image_spec = self.image_spec(id);

        // Snapshots block removal
        match self.cluster.rbd(&["snap", "purge", &image_spec]).await {
            Ok(_) => {}
            Err(ClusterError::NotFound(_)) => {
                debug!(image = %image_spec, "Image already gone");
                return Ok(());
            }
            Err(e) => warn!(image = %image_spec, error = %e, "Failed to purge snapshots"),
        }

        match self.cluster.rbd(&["rm", &image_spec]).await {
            Ok(_) | Err(ClusterError::NotFound(_)) => {
                info!(volume_id = %id, "RBD image deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(volume_id = %id, new_size_bytes = %new_size_bytes))]
    async fn resize_image(&self, id: &str, new_size_bytes: u64) -> ClusterResult<()> {
        let current = self
            .image_size(id)
            .await?
            .ok_or_else(|| ClusterError::NotFound(id.to_string()))?;

        if new_size_bytes < current {
            return Err(ClusterError::ShrinkNotSupported {
                id: id.to_string(),
                current_bytes: current,
                requested_bytes: new_size_bytes,
            });
        }
        if new_size_bytes == current {
            return Ok(());
        }

        self.grow(&self.image_spec(id), new_size_bytes).await?;
        info!(volume_id = %id, "RBD image resized");
        Ok(())
    }

    async fn image_size(&self, id: &str) -> ClusterResult<Option<u64>> {
        let image_spec = self.image_spec(id);
        let output = match self
            .cluster
            .rbd(&["info", &image_spec, "--format", "json"])
            .await
        {
            Ok(output) => output,
            Err(ClusterError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let info: RbdImageInfo = serde_json::from_str(&output.stdout)
            .map_err(|e| ClusterError::Fatal(format!("failed to parse rbd info output: {}", e)))?;
        Ok(Some(info.size))
    }

    fn access(&self, id: &str) -> VolumeAccess {
        let config = self.cluster.config();
        let mut attributes = HashMap::new();
        attributes.insert("monitors".to_string(), config.monitor_list().join(","));
        attributes.insert("pool".to_string(), config.pool.clone());
        attributes.insert("image".to_string(), id.to_string());

        VolumeAccess {
            driver: DRIVER_NAME.to_string(),
            handle: self.image_spec(id),
            attributes,
            secret_data: HashMap::new(),
        }
    }
}
