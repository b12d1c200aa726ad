//! # cephlet Common
//!
//! Shared utilities for the cephlet daemons.
//!
//! ## Logging
//!
//! ```rust,no_run
//! use cephlet_common::{init, LogFormat};
//!
//! init("info", LogFormat::Json).unwrap();
//! tracing::info!(volume_id = "vol-1", "Volume created");
//! ```

pub mod logging;

pub use logging::{init, init_logging, init_logging_json, LogFormat};
