//! Configuration management for the volume runtime daemon.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use cephlet_volume::{CephConfig, LifecycleConfig, QueueConfig, RetryPolicy};

use crate::cli::Args;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cephlet/volume.yaml";

/// Default listen socket.
pub const DEFAULT_ADDRESS: &str = "/var/run/cephlet-volume.sock";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// gRPC server configuration
    pub server: ServerConfig,
    /// Volume handling
    pub volume: VolumeConfig,
    /// Ceph connection
    pub ceph: CephConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Defaults plus CLI arguments, when no config file is available.
    pub fn default_with_cli(args: &Args) -> Self {
        Self::default().with_cli_overrides(args)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref address) = args.address {
            self.server.address = address.clone();
        }

        if let Some(ref path) = args.supported_volume_classes {
            self.volume.classes_path = Some(path.clone());
        }

        if let Some(workers) = args.workers {
            self.volume.workers = workers;
        }

        if args.dev {
            self.volume.backend = Backend::Mock;
        }

        if let Some(ref monitors) = args.ceph_monitors {
            self.ceph.monitors = monitors.clone();
        }
        if let Some(ref user) = args.ceph_user {
            self.ceph.user = user.clone();
        }
        if let Some(ref key_file) = args.ceph_key_file {
            self.ceph.key_file = Some(key_file.clone());
        }
        if let Some(ref keyring_file) = args.ceph_keyring_file {
            self.ceph.keyring_file = Some(keyring_file.clone());
        }
        if let Some(ref pool) = args.ceph_pool {
            self.ceph.pool = pool.clone();
        }
        if let Some(ref client) = args.ceph_client {
            self.ceph.client = client.clone();
        }
        if let Some(ref kek_path) = args.ceph_kek_path {
            self.ceph.kek_path = Some(kek_path.clone());
        }

        self
    }

    /// Check that the daemon can start with this configuration.
    pub fn validate(&self) -> Result<()> {
        if self.server.address.is_empty() {
            anyhow::bail!("listen address must not be empty");
        }
        if self.volume.classes_path.is_none() {
            anyhow::bail!("a supported volume classes file is required");
        }
        if self.volume.workers == 0 {
            anyhow::bail!("at least one provisioning worker is required");
        }

        if self.volume.backend == Backend::Ceph {
            self.ceph.validate().context("invalid Ceph configuration")?;
            if self.ceph.kek_path.is_none() {
                anyhow::bail!("a key-encryption-key file is required");
            }
        }

        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// UNIX socket path (optionally unix://) or host:port
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
        }
    }
}

/// Volume handling configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Storage backend
    pub backend: Backend,
    /// JSON file listing the supported volume classes
    pub classes_path: Option<String>,
    /// Provisioning workers
    pub workers: usize,
    /// Volumes waiting for a worker before admission blocks
    pub queue_capacity: usize,
    /// Retry behaviour of image creation
    pub retry: RetryConfig,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        let queue = QueueConfig::default();
        Self {
            backend: Backend::Ceph,
            classes_path: None,
            workers: queue.workers,
            queue_capacity: queue.capacity,
            retry: RetryConfig::default(),
        }
    }
}

impl VolumeConfig {
    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            queue: QueueConfig {
                workers: self.workers,
                capacity: self.queue_capacity,
            },
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
                call_timeout: Duration::from_secs(self.retry.call_timeout_secs),
            },
        }
    }
}

/// Storage backend type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// RBD images with omap metadata
    #[default]
    Ceph,
    /// In-memory store and mock provisioner for development
    Mock,
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub call_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
            call_timeout_secs: policy.call_timeout.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.address, DEFAULT_ADDRESS);
        assert_eq!(config.volume.backend, Backend::Ceph);
        assert_eq!(config.volume.lifecycle(), LifecycleConfig::default());
        assert_eq!(config.ceph.pool, "rbd");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
server:
  address: unix:///run/cephlet/volume.sock
volume:
  classes_path: /etc/cephlet/classes.json
  workers: 8
  retry:
    max_attempts: 3
ceph:
  monitors: 10.0.0.1:6789,10.0.0.2:6789
  user: cephlet
  keyring_file: /etc/ceph/ceph.client.cephlet.keyring
  pool: volumes
  kek_path: /etc/cephlet/kek
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.address, "unix:///run/cephlet/volume.sock");
        assert_eq!(config.volume.workers, 8);
        assert_eq!(config.volume.retry.max_attempts, 3);
        // Unset fields keep their defaults
        assert_eq!(config.volume.retry.max_backoff_ms, 5000);
        assert_eq!(config.ceph.user, "cephlet");
        assert_eq!(config.ceph.monitor_list().len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_overrides_file_values() {
        let args = Args {
            address: Some("127.0.0.1:9090".to_string()),
            ceph_pool: Some("fast-pool".to_string()),
            supported_volume_classes: Some("/tmp/classes.json".to_string()),
            dev: true,
            ..Default::default()
        };

        let config = Config::default().with_cli_overrides(&args);
        assert_eq!(config.server.address, "127.0.0.1:9090");
        assert_eq!(config.ceph.pool, "fast-pool");
        assert_eq!(config.volume.backend, Backend::Mock);

        // Dev mode needs no cluster settings
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config.volume.classes_path = Some("/etc/cephlet/classes.json".to_string());
        // Ceph backend without monitors
        assert!(config.validate().is_err());

        config.ceph.monitors = "10.0.0.1:6789".to_string();
        assert!(config.validate().is_err());

        config.ceph.kek_path = Some("/etc/cephlet/kek".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file() {
        assert!(Config::load("/nonexistent/volume.yaml").is_err());
    }
}
