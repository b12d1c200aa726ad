//! Bounded work queue feeding a fixed pool of provisioning workers.
//!
//! Admission is single-flight: an ID that is queued or being worked on is
//! not admitted again until its task finishes. Submitting it meanwhile
//! makes the worker run the task once more when the current run ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, VolumeError};

/// Retry behaviour of provisioning calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Deadline of a single provisioning call
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based), doubling up to the cap.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        std::cmp::min(self.initial_backoff.saturating_mul(factor), self.max_backoff)
    }
}

/// Sizing of the provisioning queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub workers: usize,
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            capacity: 1024,
        }
    }
}

/// Work executed for every admitted volume ID.
#[async_trait]
pub trait ProvisionHandler: Send + Sync + 'static {
    /// Process one volume. `shutdown` turns `true` when the queue stops; a
    /// handler waiting between retries should give up at that point.
    async fn provision(&self, id: &str, shutdown: &mut watch::Receiver<bool>);
}

/// Queue of volume IDs awaiting provisioning.
pub struct ProvisionQueue {
    sender: Mutex<Option<mpsc::Sender<String>>>,
    /// IDs queued or running, with whether another run was requested
    in_flight: Arc<Mutex<HashMap<String, bool>>>,
    shutdown_tx: watch::Sender<bool>,
    workers: AsyncMutex<Vec<JoinHandle<()>>>,
}

impl ProvisionQueue {
    /// Spawn the workers. Must be called inside a Tokio runtime.
    pub fn start(handler: Arc<dyn ProvisionHandler>, config: QueueConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let rx = Arc::new(AsyncMutex::new(rx));
        let in_flight = Arc::new(Mutex::new(HashMap::new()));

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    rx.clone(),
                    handler.clone(),
                    in_flight.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        info!(workers = config.workers.max(1), capacity = config.capacity, "Provision queue started");

        Self {
            sender: Mutex::new(Some(tx)),
            in_flight,
            shutdown_tx,
            workers: AsyncMutex::new(workers),
        }
    }

    /// Admit `id` for provisioning.
    ///
    /// Returns `false` if the ID is already queued or running; it is then
    /// run again once the current run ends. Waits for room when the queue
    /// is full.
    pub async fn submit(&self, id: &str) -> Result<bool> {
        let sender = lock(&self.sender)
            .clone()
            .ok_or_else(|| VolumeError::Unavailable("volume runtime is shutting down".into()))?;

        {
            let mut in_flight = lock(&self.in_flight);
            if let Some(rerun) = in_flight.get_mut(id) {
                *rerun = true;
                debug!(volume_id = %id, "Provisioning already in flight");
                return Ok(false);
            }
            in_flight.insert(id.to_string(), false);
        }

        if sender.send(id.to_string()).await.is_err() {
            lock(&self.in_flight).remove(id);
            return Err(VolumeError::Unavailable("volume runtime is shutting down".into()));
        }

        debug!(volume_id = %id, "Provisioning queued");
        Ok(true)
    }

    /// Whether `id` is queued or being provisioned.
    pub fn is_in_flight(&self, id: &str) -> bool {
        lock(&self.in_flight).contains_key(id)
    }

    /// Stop admitting work and wait for the workers to exit.
    ///
    /// Queued IDs that were not started are dropped; their records stay
    /// `Pending`.
    pub async fn shutdown(&self) {
        lock(&self.sender).take();
        let _ = self.shutdown_tx.send(true);

        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Provisioning worker panicked");
            }
        }

        info!("Provision queue stopped");
    }
}

async fn run_worker(
    worker: usize,
    rx: Arc<AsyncMutex<mpsc::Receiver<String>>>,
    handler: Arc<dyn ProvisionHandler>,
    in_flight: Arc<Mutex<HashMap<String, bool>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                id = rx.recv() => id,
                _ = shutdown.changed() => None,
            }
        };

        let Some(id) = next else {
            break;
        };

        if *shutdown.borrow() {
            lock(&in_flight).remove(&id);
            break;
        }

        debug!(worker, volume_id = %id, "Provisioning started");
        loop {
            handler.provision(&id, &mut shutdown).await;

            let mut slots = lock(&in_flight);
            match slots.get_mut(&id) {
                Some(rerun) if *rerun && !*shutdown.borrow() => {
                    *rerun = false;
                    debug!(worker, volume_id = %id, "Provisioning requested again");
                }
                _ => {
                    slots.remove(&id);
                    break;
                }
            }
        }
    }

    debug!(worker, "Provisioning worker exiting");
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl ProvisionHandler for CountingHandler {
        async fn provision(&self, _id: &str, shutdown: &mut watch::Receiver<bool>) {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = shutdown.changed() => return,
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn handler(delay: Duration) -> Arc<CountingHandler> {
        Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(10), Duration::from_secs(5));
        assert_eq!(policy.backoff(100), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_single_flight_admission() {
        let handler = handler(Duration::from_millis(100));
        let queue = ProvisionQueue::start(handler.clone(), QueueConfig::default());

        assert!(queue.submit("vol-1").await.unwrap());
        assert!(queue.is_in_flight("vol-1"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(!queue.is_in_flight("vol-1"));

        // Admitted again once finished
        assert!(queue.submit("vol-1").await.unwrap());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_while_running_runs_again() {
        let handler = handler(Duration::from_millis(200));
        let queue = ProvisionQueue::start(handler.clone(), QueueConfig::default());

        assert!(queue.submit("vol-1").await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!queue.submit("vol-1").await.unwrap());
        assert!(!queue.submit("vol-1").await.unwrap());

        // Still in the first run
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert!(!queue.is_in_flight("vol-1"));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let handler = handler(Duration::from_secs(60));
        let queue = ProvisionQueue::start(handler.clone(), QueueConfig { workers: 1, capacity: 4 });

        queue.submit("vol-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(5), queue.shutdown())
            .await
            .unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            queue.submit("vol-2").await,
            Err(VolumeError::Unavailable(_))
        ));
    }
}
