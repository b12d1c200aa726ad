//! gRPC server setup and lifecycle.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{info, warn};

use cephlet_proto::VolumeRuntimeServer;
use cephlet_volume::{
    CephCluster, FileKeyManager, ImageProvisioner, KeyManager, MemoryStore, MetadataStore,
    MockProvisioner, OmapStore, RbdProvisioner, StaticKeyManager, VolumeClassSet,
    VolumeManager,
};

use crate::config::{Backend, Config};
use crate::service::VolumeRuntimeService;

/// Where the server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl ListenAddress {
    /// Parse `unix:///path`, `/path` or `host:port`.
    pub fn parse(address: &str) -> Result<Self> {
        if let Some(path) = address.strip_prefix("unix://") {
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if address.starts_with('/') || address.starts_with('.') {
            return Ok(Self::Unix(PathBuf::from(address)));
        }
        let addr = address
            .parse()
            .with_context(|| format!("Invalid listen address: {}", address))?;
        Ok(Self::Tcp(addr))
    }
}

/// Backends selected by the configuration.
struct Backends {
    store: Arc<dyn MetadataStore>,
    provisioner: Arc<dyn ImageProvisioner>,
    cluster_secrets: HashMap<String, Vec<u8>>,
}

fn build_backends(config: &Config) -> Result<Backends> {
    match config.volume.backend {
        Backend::Mock => {
            info!("Using in-memory store and mock provisioner");
            Ok(Backends {
                store: Arc::new(MemoryStore::new()),
                provisioner: Arc::new(MockProvisioner::new()),
                cluster_secrets: HashMap::new(),
            })
        }
        Backend::Ceph => {
            let cluster = Arc::new(
                CephCluster::new(config.ceph.clone()).context("Failed to set up Ceph client")?,
            );
            info!(
                monitors = %config.ceph.monitors,
                pool = %config.ceph.pool,
                user = %config.ceph.user,
                "Using Ceph backend"
            );
            Ok(Backends {
                store: Arc::new(OmapStore::new(cluster.clone())),
                provisioner: Arc::new(RbdProvisioner::new(cluster.clone())),
                cluster_secrets: cluster.secret_data(),
            })
        }
    }
}

fn build_keys(config: &Config) -> Result<Arc<dyn KeyManager>> {
    match config.ceph.kek_path {
        Some(ref path) => Ok(Arc::new(
            FileKeyManager::load(path).context("Failed to load key-encryption key")?,
        )),
        None => {
            warn!("No key-encryption key configured, encryption keys are NOT protected");
            Ok(Arc::new(StaticKeyManager::default()))
        }
    }
}

/// Run the gRPC server until SIGINT or SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    config.validate()?;

    let classes_path = config
        .volume
        .classes_path
        .as_deref()
        .context("a supported volume classes file is required")?;
    let classes = Arc::new(VolumeClassSet::load(classes_path).context("Failed to load volume classes")?);

    let backends = build_backends(&config)?;
    let keys = build_keys(&config)?;

    let manager = Arc::new(
        VolumeManager::with_config(
            backends.store,
            backends.provisioner,
            keys,
            classes,
            config.volume.lifecycle(),
        )
        .with_cluster_secrets(backends.cluster_secrets),
    );

    manager
        .resume()
        .await
        .context("Failed to resume volumes from the metadata store")?;

    let service = VolumeRuntimeServer::new(VolumeRuntimeService::new(manager.clone()));
    let address = ListenAddress::parse(&config.server.address)?;

    let served = match address {
        ListenAddress::Unix(ref path) => {
            let listener = bind_unix(path)?;
            info!(socket = %path.display(), "Starting gRPC server");
            Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown_signal())
                .await
        }
        ListenAddress::Tcp(addr) => {
            info!(address = %addr, "Starting gRPC server");
            Server::builder()
                .add_service(service)
                .serve_with_shutdown(addr, shutdown_signal())
                .await
        }
    };

    info!("Stopping provisioning workers");
    manager.shutdown().await;

    if let ListenAddress::Unix(ref path) = address {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(socket = %path.display(), error = %e, "Failed to remove socket");
        }
    }

    served.context("gRPC server failed")?;
    info!("Volume runtime stopped");
    Ok(())
}

/// Bind the socket, replacing a stale one from an earlier run.
fn bind_unix(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create socket directory {}", parent.display()))?;
    }
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    }
    UnixListener::bind(path).with_context(|| format!("Failed to bind {}", path.display()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
