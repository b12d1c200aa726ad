//! Metadata store on a RADOS object map.
//!
//! All records live in the omap of a single object, one key per volume:
//!
//! ```text
//! <pool>/volumes
//!   ├── vol-1 → {"id":"vol-1","class_name":"fast",...}
//!   └── vol-2 → {...}
//! ```
//!
//! Setting a single omap key is atomic, which is all the lifecycle manager
//! relies on.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, instrument};

use super::{decode, encode, MetadataStore};
use crate::ceph::CephCluster;
use crate::error::{ClusterError, Result, VolumeError};
use crate::types::{ListFilter, Volume};

/// Name of the object holding the volume records.
pub const VOLUMES_OBJECT: &str = "volumes";

/// Records fetched concurrently while listing.
const LIST_CONCURRENCY: usize = 8;

/// Metadata store backed by the omap of [`VOLUMES_OBJECT`].
pub struct OmapStore {
    cluster: Arc<CephCluster>,
    object: String,
}

impl OmapStore {
    pub fn new(cluster: Arc<CephCluster>) -> Self {
        Self {
            cluster,
            object: VOLUMES_OBJECT.to_string(),
        }
    }

    /// Use a different object, e.g. to share a pool between runtimes.
    pub fn with_object(mut self, object: impl Into<String>) -> Self {
        self.object = object.into();
        self
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let pool = self.cluster.pool();
        match self
            .cluster
            .rados(&["-p", pool, "listomapkeys", &self.object], None)
            .await
        {
            Ok(output) => Ok(output
                .stdout
                .lines()
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect()),
            // The object is created by the first put
            Err(ClusterError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(unavailable(e)),
        }
    }
}

fn unavailable(err: ClusterError) -> VolumeError {
    VolumeError::Unavailable(format!("metadata store: {}", err))
}

#[async_trait]
impl MetadataStore for OmapStore {
    #[instrument(skip(self, record), fields(volume_id = %record.id, state = %record.state))]
    async fn put(&self, record: &Volume) -> Result<()> {
        let data = encode(record)?;
        let pool = self.cluster.pool();

        // Without an explicit value rados reads it from stdin
        self.cluster
            .rados(
                &["-p", pool, "setomapval", &self.object, &record.id],
                Some(&data),
            )
            .await
            .map_err(unavailable)?;

        debug!("Record stored");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, id: &str) -> Result<Option<Volume>> {
        let out = tempfile::NamedTempFile::new()
            .map_err(|e| VolumeError::Internal(format!("failed to create temp file: {}", e)))?;
        let out_path = out.path().display().to_string();
        let pool = self.cluster.pool();

        match self
            .cluster
            .rados(&["-p", pool, "getomapval", &self.object, id, &out_path], None)
            .await
        {
            Ok(_) => {}
            Err(ClusterError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(unavailable(e)),
        }

        let data = tokio::fs::read(out.path())
            .await
            .map_err(|e| VolumeError::Unavailable(format!("failed to read omap value: {}", e)))?;

        decode(id, &data).map(Some)
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> Result<()> {
        let pool = self.cluster.pool();
        match self
            .cluster
            .rados(&["-p", pool, "rmomapkey", &self.object, id], None)
            .await
        {
            Ok(_) | Err(ClusterError::NotFound(_)) => Ok(()),
            Err(e) => Err(unavailable(e)),
        }
    }

    #[instrument(skip(self))]
    async fn list(&self, filter: &ListFilter) -> Result<Vec<Volume>> {
        if let Some(ref id) = filter.id {
            let volume = self.get(id).await?;
            return Ok(volume.into_iter().filter(|v| filter.matches(v)).collect());
        }

        let keys: Vec<String> = self
            .keys()
            .await?
            .into_iter()
            .filter(|k| {
                filter
                    .id_prefix
                    .as_deref()
                    .map_or(true, |prefix| k.starts_with(prefix))
            })
            .collect();

        debug!(count = keys.len(), "Fetching records");

        // A key removed between listing and fetching yields None and is skipped
        let records: Vec<Option<Volume>> = stream::iter(keys)
            .map(|key| async move { self.get(&key).await })
            .buffer_unordered(LIST_CONCURRENCY)
            .try_collect()
            .await?;

        Ok(records
            .into_iter()
            .flatten()
            .filter(|v| filter.matches(v))
            .collect())
    }
}
