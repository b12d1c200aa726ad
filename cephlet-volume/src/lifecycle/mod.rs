//! Volume lifecycle management.
//!
//! The [`VolumeManager`] owns the state machine of every volume:
//!
//! ```text
//!   create ──► Pending ──► Available ──► Deleting ──► (removed)
//!                 │  │                       ▲
//!                 │  └──► Error ─────────────┤
//!                 └──────────────────────────┘
//! ```
//!
//! Records are persisted before any RPC returns. Image creation runs in the
//! background on the [`ProvisionQueue`]; its outcome is only ever recorded
//! on the record. The store is the single source of truth: records are
//! re-read, never cached.

mod locks;
mod queue;
mod task;

pub use queue::{ProvisionHandler, ProvisionQueue, QueueConfig, RetryPolicy};

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use zeroize::Zeroize;

use crate::classes::VolumeClassSet;
use crate::error::{Result, VolumeError};
use crate::keys::KeyManager;
use crate::metadata::MetadataStore;
use crate::provisioner::ImageProvisioner;
use crate::types::{
    EncryptionRef, ListFilter, Volume, VolumeClass, VolumeSpec, VolumeState,
    SECRET_ENCRYPTION_KEY,
};

use locks::RecordLocks;
use task::ProvisionTask;

/// Tuning of the lifecycle manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleConfig {
    pub queue: QueueConfig,
    pub retry: RetryPolicy,
}

/// What `resume` found after a restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeSummary {
    /// Pending volumes queued for provisioning
    pub requeued: usize,
    /// Deleting volumes whose removal completed
    pub deleted: usize,
    /// Deleting volumes whose removal failed again
    pub failed: usize,
}

/// Entry point for all volume operations.
pub struct VolumeManager {
    store: Arc<dyn MetadataStore>,
    provisioner: Arc<dyn ImageProvisioner>,
    keys: Arc<dyn KeyManager>,
    classes: Arc<VolumeClassSet>,
    locks: Arc<RecordLocks>,
    queue: ProvisionQueue,
    /// Cluster credentials attached to available volumes on read
    cluster_secrets: HashMap<String, Vec<u8>>,
}

impl VolumeManager {
    /// Create a manager with default tuning. Spawns the provisioning workers.
    pub fn new(
        store: Arc<dyn MetadataStore>,
        provisioner: Arc<dyn ImageProvisioner>,
        keys: Arc<dyn KeyManager>,
        classes: Arc<VolumeClassSet>,
    ) -> Self {
        Self::with_config(store, provisioner, keys, classes, LifecycleConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn MetadataStore>,
        provisioner: Arc<dyn ImageProvisioner>,
        keys: Arc<dyn KeyManager>,
        classes: Arc<VolumeClassSet>,
        config: LifecycleConfig,
    ) -> Self {
        let locks = Arc::new(RecordLocks::default());
        let task = ProvisionTask {
            store: store.clone(),
            provisioner: provisioner.clone(),
            locks: locks.clone(),
            policy: config.retry,
        };
        let queue = ProvisionQueue::start(Arc::new(task), config.queue);

        Self {
            store,
            provisioner,
            keys,
            classes,
            locks,
            queue,
            cluster_secrets: HashMap::new(),
        }
    }

    /// Credentials handed out with every available volume.
    pub fn with_cluster_secrets(mut self, secrets: HashMap<String, Vec<u8>>) -> Self {
        self.cluster_secrets = secrets;
        self
    }

    /// Create a volume, or return the existing one for a repeated request.
    ///
    /// The returned record is `Pending` for a fresh volume; provisioning
    /// continues in the background.
    #[instrument(skip(self, spec), fields(volume_id = %spec.id, class = %spec.class_name, size_bytes = spec.size_bytes))]
    pub async fn create_volume(&self, spec: VolumeSpec) -> Result<Volume> {
        spec.validate()?;
        if !self.classes.contains(&spec.class_name) {
            return Err(VolumeError::ClassNotFound(spec.class_name.clone()));
        }

        let guard = self.locks.lock(&spec.id).await;

        if let Some(existing) = self.store.get(&spec.id).await? {
            drop(guard);
            if !existing.matches_spec(&spec) {
                return Err(VolumeError::AlreadyExists(spec.id.clone()));
            }
            if existing.state == VolumeState::Pending {
                // Picks up records whose task was lost, e.g. across a restart
                if let Err(e) = self.queue.submit(&existing.id).await {
                    warn!(error = %e, "Could not requeue pending volume");
                }
            }
            debug!(state = %existing.state, "Volume already exists");
            return Ok(self.expose(existing));
        }

        let encryption = if spec.encryption {
            let mut dek = self.keys.generate_dek()?;
            let wrapped = self.keys.wrap_dek(&dek);
            dek.zeroize();
            Some(EncryptionRef { wrapped_dek: wrapped? })
        } else {
            None
        };

        let record = Volume::pending(&spec, encryption);
        self.store.put(&record).await?;
        // Workers take the same lock to record their outcome
        drop(guard);
        self.queue.submit(&record.id).await?;

        info!("Volume accepted");
        Ok(record)
    }

    /// Grow an available volume.
    #[instrument(skip(self))]
    pub async fn expand_volume(&self, id: &str, new_size_bytes: u64) -> Result<Volume> {
        if new_size_bytes == 0 {
            return Err(VolumeError::InvalidArgument(
                "volume size must be greater than 0".into(),
            ));
        }

        let _guard = self.locks.lock(id).await;

        let mut record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| VolumeError::NotFound(id.to_string()))?;

        if record.state != VolumeState::Available {
            return Err(VolumeError::InvalidState(format!(
                "volume {} is {}, only available volumes can be expanded",
                id, record.state
            )));
        }
        if new_size_bytes < record.size_bytes {
            return Err(VolumeError::ShrinkNotSupported {
                id: id.to_string(),
                current_bytes: record.size_bytes,
                requested_bytes: new_size_bytes,
            });
        }
        if new_size_bytes == record.size_bytes {
            return Ok(self.expose(record));
        }

        self.provisioner.resize_image(id, new_size_bytes).await?;

        record.size_bytes = new_size_bytes;
        record.generation += 1;
        self.store.put(&record).await?;

        info!(size_bytes = new_size_bytes, "Volume expanded");
        Ok(self.expose(record))
    }

    /// Delete a volume and its image. Unknown IDs succeed.
    #[instrument(skip(self))]
    pub async fn delete_volume(&self, id: &str) -> Result<()> {
        let _guard = self.locks.lock(id).await;

        let Some(mut record) = self.store.get(id).await? else {
            debug!("Volume already deleted");
            return Ok(());
        };

        // Nothing usable was handed out for these, so image errors do not block removal
        let best_effort = matches!(record.state, VolumeState::Pending | VolumeState::Error);

        if record.state != VolumeState::Deleting {
            record.transition(VolumeState::Deleting)?;
            self.store.put(&record).await?;
        }

        if let Err(e) = self.provisioner.delete_image(id).await {
            if !best_effort {
                warn!(error = %e, "Failed to delete image, volume stays deleting");
                return Err(e.into());
            }
            warn!(error = %e, "Ignoring image deletion failure");
        }

        self.store.delete(id).await?;
        info!("Volume deleted");
        Ok(())
    }

    /// Configured volume classes, in configured order.
    pub fn list_volume_classes(&self) -> &[VolumeClass] {
        self.classes.as_slice()
    }

    /// Volumes passing `filter`, in any state.
    pub async fn list_volumes(&self, filter: &ListFilter) -> Result<Vec<Volume>> {
        Ok(self
            .store
            .list(filter)
            .await?
            .into_iter()
            .map(|volume| self.expose(volume))
            .collect())
    }

    /// A single volume.
    pub async fn get_volume(&self, id: &str) -> Result<Volume> {
        let volume = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| VolumeError::NotFound(id.to_string()))?;
        Ok(self.expose(volume))
    }

    /// Pick up work left behind by a previous process.
    ///
    /// Pending volumes are queued again and deletions that were cut short
    /// are completed.
    pub async fn resume(&self) -> Result<ResumeSummary> {
        let mut summary = ResumeSummary::default();

        for volume in self.store.list(&ListFilter::all()).await? {
            match volume.state {
                VolumeState::Pending => {
                    if self.queue.submit(&volume.id).await? {
                        summary.requeued += 1;
                    }
                }
                VolumeState::Deleting => match self.delete_volume(&volume.id).await {
                    Ok(()) => summary.deleted += 1,
                    Err(e) => {
                        warn!(volume_id = %volume.id, error = %e, "Failed to finish deletion");
                        summary.failed += 1;
                    }
                },
                VolumeState::Available | VolumeState::Error => {}
            }
        }

        info!(
            requeued = summary.requeued,
            deleted = summary.deleted,
            failed = summary.failed,
            "Volume state resumed"
        );
        Ok(summary)
    }

    /// Stop the provisioning workers. Unfinished volumes stay `Pending`.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }

    /// Attach read-time secrets to an available volume.
    fn expose(&self, mut volume: Volume) -> Volume {
        if volume.state != VolumeState::Available {
            return volume;
        }

        // A key that no longer unwraps only costs this volume its key
        let dek = match volume.encryption {
            Some(ref encryption) => match self.keys.unwrap_dek(&encryption.wrapped_dek) {
                Ok(dek) => Some(dek),
                Err(e) => {
                    warn!(volume_id = %volume.id, error = %e, "Failed to unwrap encryption key");
                    None
                }
            },
            None => None,
        };

        if let Some(ref mut access) = volume.access {
            access.secret_data.extend(
                self.cluster_secrets
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
            if let Some(dek) = dek {
                access
                    .secret_data
                    .insert(SECRET_ENCRYPTION_KEY.to_string(), dek);
            }
        }

        volume
    }
}
