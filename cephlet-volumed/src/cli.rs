//! Command-line argument parsing.

use clap::Parser;

/// cephlet Volume Runtime - Ceph backed block volumes over gRPC
#[derive(Parser, Debug, Default)]
#[command(name = "cephlet-volumed")]
#[command(about = "cephlet Volume Runtime - Ceph backed block volumes over gRPC")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    /// Listen address: a UNIX socket path (optionally unix://) or host:port
    #[arg(long)]
    pub address: Option<String>,

    /// JSON file listing the supported volume classes
    #[arg(long)]
    pub supported_volume_classes: Option<String>,

    /// Enable development mode (in-memory store, mock provisioner)
    #[arg(long)]
    pub dev: bool,

    /// Number of provisioning workers
    #[arg(long)]
    pub workers: Option<usize>,

    // ========================================================================
    // Ceph connection
    // ========================================================================
    /// Ceph monitor addresses, comma separated
    #[arg(long, env = "CEPH_MONITORS")]
    pub ceph_monitors: Option<String>,

    /// Ceph user (without the "client." prefix)
    #[arg(long, env = "CEPH_USERNAME")]
    pub ceph_user: Option<String>,

    /// File holding the key of the Ceph user
    #[arg(long, env = "CEPH_KEY")]
    pub ceph_key_file: Option<String>,

    /// Ceph keyring, used when no key file is given
    #[arg(long, env = "CEPH_KEYRING_FILENAME")]
    pub ceph_keyring_file: Option<String>,

    /// Pool holding the images and the metadata object
    #[arg(long, env = "CEPH_POOLNAME")]
    pub ceph_pool: Option<String>,

    /// Client name handed to volume consumers
    #[arg(long, env = "CEPH_CLIENTNAME")]
    pub ceph_client: Option<String>,

    /// Key-encryption-key file for volume encryption
    #[arg(long, env = "CEPH_KEK_PATH")]
    pub ceph_kek_path: Option<String>,
}
