//! Background provisioning of a single volume.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::locks::RecordLocks;
use super::queue::{ProvisionHandler, RetryPolicy};
use crate::error::ClusterError;
use crate::metadata::MetadataStore;
use crate::provisioner::ImageProvisioner;
use crate::types::{Volume, VolumeState};

/// How a provisioning run ended.
#[derive(Debug)]
enum Outcome {
    Created,
    Failed(ClusterError),
    /// Shut down while waiting to retry
    Interrupted,
}

/// Drives a `Pending` record to `Available` or `Error`.
pub(crate) struct ProvisionTask {
    pub(crate) store: Arc<dyn MetadataStore>,
    pub(crate) provisioner: Arc<dyn ImageProvisioner>,
    pub(crate) locks: Arc<RecordLocks>,
    pub(crate) policy: RetryPolicy,
}

impl ProvisionTask {
    async fn create_with_retry(
        &self,
        record: &Volume,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Outcome {
        let mut attempt = 1;
        loop {
            let call = self.provisioner.create_image(
                &record.id,
                record.size_bytes,
                &record.labels,
                record.image_ref.as_deref(),
            );
            let result = tokio::time::timeout(self.policy.call_timeout, call)
                .await
                .unwrap_or_else(|_| {
                    Err(ClusterError::Retryable(format!(
                        "create_image exceeded deadline of {:?}",
                        self.policy.call_timeout
                    )))
                });

            match result {
                Ok(()) => return Outcome::Created,
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let backoff = self.policy.backoff(attempt);
                    warn!(
                        attempt,
                        retry_in_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Image creation failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => return Outcome::Interrupted,
                    }
                    attempt += 1;
                }
                Err(e) => return Outcome::Failed(e),
            }
        }
    }

    /// Persist the outcome unless the record moved on in the meantime.
    ///
    /// `uid` identifies the record the image was created for; a record
    /// recreated under the same ID does not inherit the outcome.
    async fn record_outcome(&self, id: &str, uid: &str, outcome: Outcome) {
        let _guard = self.locks.lock(id).await;

        let current = match self.store.get(id).await {
            Ok(current) => current,
            Err(e) => {
                error!(error = %e, "Failed to re-read record, leaving it pending");
                return;
            }
        };

        let mut record = match current {
            Some(record) if record.state == VolumeState::Pending && record.uid == uid => record,
            other => {
                debug!(
                    state = ?other.as_ref().map(|r| r.state),
                    "Record left pending meanwhile, discarding result"
                );
                let abandoned =
                    other.map_or(true, |r| r.uid != uid || r.state == VolumeState::Deleting);
                if abandoned && matches!(outcome, Outcome::Created) {
                    // The deletion may have run before the image existed, and a
                    // recreated volume must get an image of its own
                    if let Err(e) = self.provisioner.delete_image(id).await {
                        warn!(error = %e, "Failed to remove image of deleted volume");
                    }
                }
                return;
            }
        };

        let transition = match outcome {
            Outcome::Created => record.mark_available(self.provisioner.access(id)),
            Outcome::Failed(ref e) => record.mark_error(e.to_string()),
            Outcome::Interrupted => return,
        };
        if let Err(e) = transition {
            error!(error = %e, "Invalid provisioning transition");
            return;
        }

        match self.store.put(&record).await {
            Ok(()) => match outcome {
                Outcome::Failed(e) => {
                    warn!(state = %record.state, error = %e, "Volume provisioning failed")
                }
                _ => info!(state = %record.state, "Volume provisioned"),
            },
            Err(e) => error!(error = %e, "Failed to persist provisioning result"),
        }
    }
}

#[async_trait]
impl ProvisionHandler for ProvisionTask {
    #[instrument(skip(self, shutdown), fields(volume_id = %id))]
    async fn provision(&self, id: &str, shutdown: &mut watch::Receiver<bool>) {
        let record = match self.store.get(id).await {
            Ok(Some(record)) if record.state == VolumeState::Pending => record,
            Ok(Some(record)) => {
                debug!(state = %record.state, "Volume no longer pending");
                return;
            }
            Ok(None) => {
                debug!("Volume gone before provisioning");
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to read record");
                return;
            }
        };

        let outcome = self.create_with_retry(&record, shutdown).await;
        if matches!(outcome, Outcome::Interrupted) {
            info!("Provisioning interrupted by shutdown, volume stays pending");
            return;
        }

        self.record_outcome(id, &record.uid, outcome).await;
    }
}
