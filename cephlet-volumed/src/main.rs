//! # cephlet Volume Runtime
//!
//! Serves the `VolumeRuntime` gRPC API for block volumes backed by a Ceph
//! cluster: RBD images hold the data, the omap of a RADOS object holds the
//! volume records, and a key-encryption key protects per-volume keys.
//!
//! ## Usage
//! ```bash
//! cephlet-volumed \
//!     --address unix:///var/run/cephlet-volume.sock \
//!     --supported-volume-classes /etc/cephlet/classes.json \
//!     --ceph-monitors 10.0.0.1:6789 --ceph-pool volumes \
//!     --ceph-keyring-file /etc/ceph/ceph.client.admin.keyring \
//!     --ceph-kek-path /etc/cephlet/kek
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use cephlet_common::LogFormat;

mod cli;
mod config;
mod server;
mod service;

use cli::Args;
use config::{Config, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    let format = if args.log_json { LogFormat::Json } else { LogFormat::Pretty };
    cephlet_common::init(&args.log_level, format)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting cephlet volume runtime"
    );

    // Load configuration
    let config = match &args.config {
        Some(config_path) => match Config::load(config_path) {
            Ok(cfg) => {
                info!(config_path = %config_path, "Configuration loaded");
                cfg.with_cli_overrides(&args)
            }
            Err(e) => {
                error!(error = %e, path = %config_path, "Failed to load configuration");
                return Err(e);
            }
        },
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => {
                info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
                cfg.with_cli_overrides(&args)
            }
            Err(_) => {
                info!("No config file found, using CLI arguments and defaults");
                Config::default_with_cli(&args)
            }
        },
    };

    info!(
        address = %config.server.address,
        backend = ?config.volume.backend,
        workers = config.volume.workers,
        "Volume runtime configured"
    );

    if let Err(e) = server::run(config).await {
        error!(error = %e, "Server failed");
        return Err(e);
    }

    Ok(())
}
