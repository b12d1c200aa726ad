//! Shared handle to the Ceph cluster.
//!
//! Cluster operations are carried out with the `rbd` and `rados` command line
//! tools. Every invocation carries the monitor, user and key arguments of the
//! handle and is bounded by a deadline; a missed deadline is a retryable
//! failure. The handle is cheap to share behind an `Arc` and safe to use from
//! many tasks at once.
//!
//! ## Prerequisites
//! - `ceph-common` installed (provides `rbd` and `rados`)
//! - an existing pool and a client key allowed to use it

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{ClusterError, Result, VolumeError};
use crate::types::{SECRET_USER_ID, SECRET_USER_KEY};

/// Default deadline for a single cluster command.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// stderr fragments of failures worth retrying.
const TRANSIENT_MARKERS: &[&str] = &[
    "Connection timed out",
    "connection timed out",
    "Connection refused",
    "Resource temporarily unavailable",
    "Device or resource busy",
    "ETIMEDOUT",
    "EAGAIN",
    "EBUSY",
    "error connecting to the cluster",
    "couldn't connect to the cluster",
];

/// stderr fragments of a client that could not be set up at all: missing
/// credentials, pool or configuration.
const SETUP_FAILURE_MARKERS: &[&str] = &[
    "unable to find a keyring",
    "failed to load keyring",
    "error opening pool",
    "global_init",
    "Permission denied",
    "(1) Operation not permitted",
    "(13)",
];

/// Warnings printed when no ceph.conf exists. The tool carries on with the
/// command line settings, so these never decide the outcome.
const CONFIG_WARNING_MARKERS: &[&str] = &[
    "did not load config file",
    "Errors while parsing config file",
    "parse_file:",
];

/// Operations whose ENOENT means the target image, object or key is missing.
const NOT_FOUND_OPERATIONS: &[&str] = &[
    "error opening image",
    "delete error",
    "clone error",
    "error getting omap value",
    "error getting omap key",
    "error removing omap key",
];

const ENOENT: &str = "(2) No such file or directory";

/// Ceph connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CephConfig {
    /// Monitor addresses, comma separated (e.g. "10.0.0.1:6789,10.0.0.2:6789")
    pub monitors: String,
    /// Client user (without the "client." prefix)
    pub user: String,
    /// File holding the bare base64 key of the user
    pub key_file: Option<String>,
    /// Ceph keyring; used when no key file is given
    pub keyring_file: Option<String>,
    /// RBD pool holding images and the metadata object
    pub pool: String,
    /// Client name handed to consumers in the access secrets
    pub client: String,
    /// Key-encryption-key file for volume encryption
    pub kek_path: Option<String>,
    /// Deadline for a single cluster call, in seconds
    pub call_timeout_secs: u64,
    /// rbd binary
    pub rbd_path: String,
    /// rados binary
    pub rados_path: String,
}

impl Default for CephConfig {
    fn default() -> Self {
        Self {
            monitors: String::new(),
            user: "admin".to_string(),
            key_file: None,
            keyring_file: None,
            pool: "rbd".to_string(),
            client: String::new(),
            kek_path: None,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT.as_secs(),
            rbd_path: "rbd".to_string(),
            rados_path: "rados".to_string(),
        }
    }
}

impl CephConfig {
    /// Check the settings needed to reach the cluster.
    pub fn validate(&self) -> Result<()> {
        if self.monitors.trim().is_empty() {
            return Err(VolumeError::InvalidArgument("at least one Ceph monitor is required".into()));
        }
        if self.pool.is_empty() {
            return Err(VolumeError::InvalidArgument("Ceph pool name is required".into()));
        }
        if self.user.is_empty() {
            return Err(VolumeError::InvalidArgument("Ceph user is required".into()));
        }
        Ok(())
    }

    /// Monitor list as individual addresses.
    pub fn monitor_list(&self) -> Vec<String> {
        self.monitors
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Extract the `key = <base64>` entry from a Ceph keyring.
pub fn key_from_keyring(content: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("key"))
        .find_map(|line| {
            let (name, value) = line.split_once('=')?;
            (name.trim() == "key").then(|| value.trim().to_string())
        })
        .filter(|key| !key.is_empty())
}

/// Output of a successful cluster command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
}

/// Classify a failed command from its stderr.
///
/// Setup and connection failures win over anything else; only an ENOENT
/// reported by the operation itself counts as not found.
pub fn classify_failure(stderr: &str) -> ClusterError {
    let message = stderr.trim().to_string();
    let lines: Vec<&str> = stderr
        .lines()
        .filter(|line| !CONFIG_WARNING_MARKERS.iter().any(|m| line.contains(m)))
        .collect();
    let mentions = |markers: &[&str]| {
        lines
            .iter()
            .any(|line| markers.iter().any(|m| line.contains(m)))
    };

    if mentions(SETUP_FAILURE_MARKERS) {
        ClusterError::Fatal(message)
    } else if mentions(TRANSIENT_MARKERS) {
        ClusterError::Retryable(message)
    } else if lines.iter().any(|line| is_missing_target(line)) {
        ClusterError::NotFound(message)
    } else {
        ClusterError::Fatal(message)
    }
}

fn is_missing_target(line: &str) -> bool {
    line.contains("No such key")
        || (line.contains(ENOENT) && NOT_FOUND_OPERATIONS.iter().any(|op| line.contains(op)))
}

/// Shared cluster handle.
#[derive(Debug, Clone)]
pub struct CephCluster {
    config: CephConfig,
    /// User key, resolved once from the key file or keyring
    key: Option<String>,
    call_timeout: Duration,
}

impl CephCluster {
    /// Create a handle, resolving the user key.
    pub fn new(config: CephConfig) -> Result<Self> {
        config.validate()?;

        let key = match (&config.key_file, &config.keyring_file) {
            (Some(path), _) => {
                let key = std::fs::read_to_string(path).map_err(|e| {
                    VolumeError::Unavailable(format!("failed to read Ceph key file {}: {}", path, e))
                })?;
                Some(key.trim().to_string())
            }
            (None, Some(path)) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    VolumeError::Unavailable(format!("failed to read Ceph keyring {}: {}", path, e))
                })?;
                let key = key_from_keyring(&content).ok_or_else(|| {
                    VolumeError::InvalidArgument(format!("no key entry in keyring {}", path))
                })?;
                Some(key)
            }
            (None, None) => {
                warn!("No Ceph key configured, relying on the default keyring");
                None
            }
        };

        Ok(Self {
            call_timeout: Duration::from_secs(config.call_timeout_secs.max(1)),
            config,
            key,
        })
    }

    pub fn config(&self) -> &CephConfig {
        &self.config
    }

    pub fn pool(&self) -> &str {
        &self.config.pool
    }

    /// Override the per-call deadline.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Secrets a consumer needs to map an image.
    pub fn secret_data(&self) -> HashMap<String, Vec<u8>> {
        let mut secrets = HashMap::new();
        let user_id = if self.config.client.is_empty() {
            &self.config.user
        } else {
            &self.config.client
        };
        secrets.insert(SECRET_USER_ID.to_string(), user_id.as_bytes().to_vec());
        if let Some(ref key) = self.key {
            secrets.insert(SECRET_USER_KEY.to_string(), key.as_bytes().to_vec());
        }
        secrets
    }

    /// Common authentication arguments.
    fn auth_args(&self) -> Vec<String> {
        let mut args = vec![
            "--mon-host".to_string(),
            self.config.monitor_list().join(","),
            "--id".to_string(),
            self.config.user.clone(),
        ];

        if let Some(ref path) = self.config.key_file {
            args.push("--keyfile".to_string());
            args.push(path.clone());
        } else if let Some(ref path) = self.config.keyring_file {
            args.push("--keyring".to_string());
            args.push(path.clone());
        }

        args
    }

    /// Run an `rbd` subcommand.
    pub async fn rbd(&self, args: &[&str]) -> std::result::Result<CommandOutput, ClusterError> {
        self.run(&self.config.rbd_path, args, None).await
    }

    /// Run a `rados` subcommand, optionally feeding `stdin`.
    pub async fn rados(
        &self,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> std::result::Result<CommandOutput, ClusterError> {
        self.run(&self.config.rados_path, args, stdin).await
    }

    async fn run(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> std::result::Result<CommandOutput, ClusterError> {
        let auth_args = self.auth_args();

        debug!(command = %program, args = ?args, "Executing cluster command");

        let mut command = Command::new(program);
        command
            .args(args)
            .args(&auth_args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let call = async {
            let mut child = command.spawn().map_err(|e| {
                ClusterError::Fatal(format!("failed to execute {}: {}", program, e))
            })?;

            if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
                pipe.write_all(input).await.map_err(|e| {
                    ClusterError::Retryable(format!("failed to write to {}: {}", program, e))
                })?;
                // Close stdin so the tool sees EOF
                drop(pipe);
            }

            child.wait_with_output().await.map_err(|e| {
                ClusterError::Retryable(format!("failed to wait for {}: {}", program, e))
            })
        };

        let output = tokio::time::timeout(self.call_timeout, call)
            .await
            .map_err(|_| {
                ClusterError::Retryable(format!(
                    "{} {} exceeded deadline of {:?}",
                    program,
                    args.first().copied().unwrap_or_default(),
                    self.call_timeout
                ))
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(command = %program, stderr = %stderr, "Cluster command failed");
            return Err(classify_failure(&stderr));
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config() -> CephConfig {
        CephConfig {
            monitors: "10.0.0.1:6789, 10.0.0.2:6789".to_string(),
            user: "cephlet".to_string(),
            pool: "volumes".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_key_from_keyring() {
        let keyring = "[client.admin]\n\tkey = AQBkZXZlbG9wbWVudGtleQ==\n\tcaps mon = \"allow *\"\n";
        assert_eq!(
            key_from_keyring(keyring).as_deref(),
            Some("AQBkZXZlbG9wbWVudGtleQ==")
        );
        assert_eq!(key_from_keyring("[client.admin]\n"), None);
        assert_eq!(key_from_keyring("keyring = /etc/ceph\n"), None);
    }

    #[test]
    fn test_auth_args_prefer_key_file() {
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(key_file, "AQBkZXZlbG9wbWVudGtleQ==").unwrap();

        let cluster = CephCluster::new(CephConfig {
            key_file: Some(key_file.path().display().to_string()),
            keyring_file: Some("/etc/ceph/ceph.keyring".to_string()),
            ..config()
        })
        .unwrap();

        let args = cluster.auth_args();
        assert_eq!(args[0], "--mon-host");
        assert_eq!(args[1], "10.0.0.1:6789,10.0.0.2:6789");
        assert!(args.contains(&"--id".to_string()));
        assert!(args.contains(&"cephlet".to_string()));
        assert!(args.contains(&"--keyfile".to_string()));
        assert!(!args.contains(&"--keyring".to_string()));

        let secrets = cluster.secret_data();
        assert_eq!(secrets[SECRET_USER_KEY], b"AQBkZXZlbG9wbWVudGtleQ==".to_vec());
        assert_eq!(secrets[SECRET_USER_ID], b"cephlet".to_vec());
    }

    #[test]
    fn test_keyring_without_key_is_rejected() {
        let mut keyring = tempfile::NamedTempFile::new().unwrap();
        writeln!(keyring, "[client.cephlet]").unwrap();

        let result = CephCluster::new(CephConfig {
            keyring_file: Some(keyring.path().display().to_string()),
            ..config()
        });
        assert!(matches!(result, Err(VolumeError::InvalidArgument(_))));
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());
        assert!(CephConfig::default().validate().is_err());
        assert!(CephConfig { pool: String::new(), ..config() }.validate().is_err());
    }

    #[test]
    fn test_classify_failure() {
        let cases: &[(&str, &str)] = &[
            ("rbd: error opening image vol: (2) No such file or directory", "not_found"),
            ("rbd: delete error: (2) No such file or directory", "not_found"),
            ("error getting omap value volumes/volumes/vol-1: (2) No such file or directory", "not_found"),
            ("error getting omap key set volumes/volumes: (2) No such file or directory", "not_found"),
            ("No such key: volumes/volumes/vol-1", "not_found"),
            (
                "did not load config file, using default settings.\n\
                 rbd: error opening image vol: (2) No such file or directory",
                "not_found",
            ),
            ("rbd: error opening pool volumes: (2) No such file or directory", "fatal"),
            (
                "auth: unable to find a keyring on /etc/ceph/keyring: (2) No such file or directory\n\
                 rbd: couldn't connect to the cluster!",
                "fatal",
            ),
            (
                "global_init: unable to open config file from search list /etc/ceph/ceph.conf: (2) No such file or directory",
                "fatal",
            ),
            ("rbd: error opening image vol: (13) Permission denied", "fatal"),
            ("rbd: couldn't connect to the cluster!", "retryable"),
            ("monclient: connection timed out", "retryable"),
            ("rbd: invalid size argument", "fatal"),
            ("parse_file: filesystem error: cannot get file size: No such file or directory", "fatal"),
        ];

        for (stderr, expected) in cases {
            let kind = match classify_failure(stderr) {
                ClusterError::NotFound(_) => "not_found",
                ClusterError::Retryable(_) => "retryable",
                ClusterError::Fatal(_) => "fatal",
                other => panic!("unexpected classification {:?}", other),
            };
            assert_eq!(kind, *expected, "stderr: {}", stderr);
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_fatal() {
        let cluster = CephCluster::new(CephConfig {
            rbd_path: "/nonexistent/rbd".to_string(),
            ..config()
        })
        .unwrap();

        let err = cluster.rbd(&["ls"]).await.unwrap_err();
        assert!(matches!(err, ClusterError::Fatal(_)));
    }
}
