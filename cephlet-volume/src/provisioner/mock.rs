//! In-memory provisioner for testing and development.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::{ClusterResult, ImageProvisioner};
use crate::error::ClusterError;
use crate::types::VolumeAccess;

/// Image held by the mock provisioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockImage {
    pub size_bytes: u64,
    pub labels: HashMap<String, String>,
    pub source: Option<String>,
}

/// Provisioner simulating images in memory.
///
/// Failures can be scripted per operation, and every call can be slowed
/// down to widen race windows in concurrency tests. Useful for:
/// - Unit and integration testing
/// - Running the daemon without a cluster
pub struct MockProvisioner {
    pool: String,
    images: Mutex<HashMap<String, MockImage>>,
    sources: Mutex<HashMap<String, u64>>,
    create_failures: Mutex<VecDeque<ClusterError>>,
    delete_failures: Mutex<VecDeque<ClusterError>>,
    create_delays: Mutex<VecDeque<Duration>>,
    delay: Duration,
    create_calls: AtomicUsize,
    images_created: AtomicUsize,
}

impl MockProvisioner {
    pub fn new() -> Self {
        info!("Creating mock image provisioner");
        Self {
            pool: "mock".to_string(),
            images: Mutex::new(HashMap::new()),
            sources: Mutex::new(HashMap::new()),
            create_failures: Mutex::new(VecDeque::new()),
            delete_failures: Mutex::new(VecDeque::new()),
            create_delays: Mutex::new(VecDeque::new()),
            delay: Duration::ZERO,
            create_calls: AtomicUsize::new(0),
            images_created: AtomicUsize::new(0),
        }
    }

    /// Delay every call by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Register a source image that volumes can be cloned from.
    pub fn with_source_image(self, name: impl Into<String>, size_bytes: u64) -> Self {
        lock(&self.sources).insert(name.into(), size_bytes);
        self
    }

    /// Make the next `count` create calls fail with `error`.
    pub fn fail_next_create(&self, count: usize, error: ClusterError) {
        let mut failures = lock(&self.create_failures);
        failures.extend(std::iter::repeat(error).take(count));
    }

    /// Slow down the next `create_image` call by `delay` on top of the
    /// regular latency.
    pub fn delay_next_create(&self, delay: Duration) {
        lock(&self.create_delays).push_back(delay);
    }

    /// Make the next `count` delete calls fail with `error`.
    pub fn fail_next_delete(&self, count: usize, error: ClusterError) {
        let mut failures = lock(&self.delete_failures);
        failures.extend(std::iter::repeat(error).take(count));
    }

    /// Number of `create_image` calls, including failed ones.
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of images actually brought into existence.
    pub fn images_created(&self) -> usize {
        self.images_created.load(Ordering::SeqCst)
    }

    pub fn image(&self, id: &str) -> Option<MockImage> {
        lock(&self.images).get(id).cloned()
    }

    pub fn image_count(&self) -> usize {
        lock(&self.images).len()
    }

    /// Place an image directly, e.g. one left behind by an earlier process.
    pub fn insert_image(&self, id: impl Into<String>, size_bytes: u64) {
        lock(&self.images).insert(
            id.into(),
            MockImage {
                size_bytes,
                labels: HashMap::new(),
                source: None,
            },
        );
    }

    async fn simulate_latency(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

impl Default for MockProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ImageProvisioner for MockProvisioner {
    #[instrument(skip(self, labels), fields(volume_id = %id, size_bytes = %size_bytes))]
    async fn create_image(
        &self,
        id: &str,
        size_bytes: u64,
        labels: &HashMap<String, String>,
        source: Option<&str>,
    ) -> ClusterResult<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let extra = lock(&self.create_delays).pop_front();
        if let Some(extra) = extra {
            tokio::time::sleep(extra).await;
        }

        if let Some(error) = lock(&self.create_failures).pop_front() {
            debug!(error = %error, "Injected create failure");
            return Err(error);
        }

        if let Some(source) = source {
            let source_bytes = lock(&self.sources).get(source).copied().ok_or_else(|| {
                ClusterError::Fatal(format!("source image {}@base not found", source))
            })?;
            if source_bytes > size_bytes {
                return Err(ClusterError::Fatal(format!(
                    "source image is {} bytes, larger than the requested {}",
                    source_bytes, size_bytes
                )));
            }
        }

        let mut images = lock(&self.images);
        if let Some(existing) = images.get_mut(id) {
            if existing.size_bytes != size_bytes {
                return Err(ClusterError::ConflictingSpec {
                    id: id.to_string(),
                    existing_bytes: existing.size_bytes,
                    requested_bytes: size_bytes,
                });
            }
            existing.labels = labels.clone();
            return Ok(());
        }

        images.insert(
            id.to_string(),
            MockImage {
                size_bytes,
                labels: labels.clone(),
                source: source.map(str::to_string),
            },
        );
        self.images_created.fetch_add(1, Ordering::SeqCst);

        info!(volume_id = %id, "Mock image created");
        Ok(())
    }

    async fn delete_image(&self, id: &str) -> ClusterResult<()> {
        self.simulate_latency().await;

        if let Some(error) = lock(&self.delete_failures).pop_front() {
            return Err(error);
        }

        lock(&self.images).remove(id);
        Ok(())
    }

    async fn resize_image(&self, id: &str, new_size_bytes: u64) -> ClusterResult<()> {
        self.simulate_latency().await;

        let mut images = lock(&self.images);
        let image = images
            .get_mut(id)
            .ok_or_else(|| ClusterError::NotFound(id.to_string()))?;

        if new_size_bytes < image.size_bytes {
            return Err(ClusterError::ShrinkNotSupported {
                id: id.to_string(),
                current_bytes: image.size_bytes,
                requested_bytes: new_size_bytes,
            });
        }
        image.size_bytes = new_size_bytes;
        Ok(())
    }

    async fn image_size(&self, id: &str) -> ClusterResult<Option<u64>> {
        Ok(lock(&self.images).get(id).map(|image| image.size_bytes))
    }

    fn access(&self, id: &str) -> VolumeAccess {
        let mut attributes = HashMap::new();
        attributes.insert("pool".to_string(), self.pool.clone());
        attributes.insert("image".to_string(), id.to_string());

        VolumeAccess {
            driver: "mock".to_string(),
            handle: format!("{}/{}", self.pool, id),
            attributes,
            secret_data: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let provisioner = MockProvisioner::new();
        let labels = HashMap::new();

        provisioner.create_image("vol-1", 1024, &labels, None).await.unwrap();
        provisioner.create_image("vol-1", 1024, &labels, None).await.unwrap();
        assert_eq!(provisioner.images_created(), 1);
        assert_eq!(provisioner.create_calls(), 2);

        let err = provisioner
            .create_image("vol-1", 2048, &labels, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::ConflictingSpec { existing_bytes: 1024, .. }));
    }

    #[tokio::test]
    async fn test_resize_rules() {
        let provisioner = MockProvisioner::new();
        provisioner.insert_image("vol-1", 1024);

        provisioner.resize_image("vol-1", 1024).await.unwrap();
        provisioner.resize_image("vol-1", 4096).await.unwrap();
        assert_eq!(provisioner.image_size("vol-1").await.unwrap(), Some(4096));

        assert!(matches!(
            provisioner.resize_image("vol-1", 10).await,
            Err(ClusterError::ShrinkNotSupported { current_bytes: 4096, .. })
        ));
        assert!(matches!(
            provisioner.resize_image("vol-2", 10).await,
            Err(ClusterError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_missing_image() {
        let provisioner = MockProvisioner::new();
        provisioner.delete_image("vol-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let provisioner = MockProvisioner::new();
        provisioner.fail_next_create(2, ClusterError::Retryable("ETIMEDOUT".into()));

        let labels = HashMap::new();
        assert!(provisioner.create_image("vol-1", 1, &labels, None).await.is_err());
        assert!(provisioner.create_image("vol-1", 1, &labels, None).await.is_err());
        assert!(provisioner.create_image("vol-1", 1, &labels, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_clone_from_source() {
        let provisioner = MockProvisioner::new().with_source_image("ubuntu-22.04", 512);
        let labels = HashMap::new();

        provisioner
            .create_image("vol-1", 1024, &labels, Some("ubuntu-22.04"))
            .await
            .unwrap();
        let image = provisioner.image("vol-1").unwrap();
        assert_eq!(image.size_bytes, 1024);
        assert_eq!(image.source.as_deref(), Some("ubuntu-22.04"));

        assert!(matches!(
            provisioner.create_image("vol-2", 1024, &labels, Some("missing")).await,
            Err(ClusterError::Fatal(_))
        ));
    }
}
