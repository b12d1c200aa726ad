//! # cephlet Volume
//!
//! Runtime core for block volumes backed by a Ceph cluster.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               VolumeManager                 │
//! │  (create, expand, delete, list, resume)     │
//! └──────┬──────────────┬──────────────┬────────┘
//!        │              │              │
//!        ▼              ▼              ▼
//! ┌────────────┐ ┌──────────────┐ ┌────────────┐
//! │ KeyManager │ │ImageProvision│ │ Metadata   │
//! │ (KEK/DEK)  │ │ (rbd images) │ │ Store(omap)│
//! └────────────┘ └──────┬───────┘ └─────┬──────┘
//!                       └──────┬────────┘
//!                              ▼
//!                        CephCluster
//!                     (rbd / rados CLI)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cephlet_volume::{
//!     MemoryStore, MockProvisioner, StaticKeyManager, VolumeClass, VolumeClassSet,
//!     VolumeManager, VolumeSpec,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let classes = VolumeClassSet::new(vec![VolumeClass::new("fast", 100, 100)]).unwrap();
//!     let manager = VolumeManager::new(
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(MockProvisioner::new()),
//!         Arc::new(StaticKeyManager::default()),
//!         Arc::new(classes),
//!     );
//!
//!     let volume = manager
//!         .create_volume(VolumeSpec::new("vol-1", "fast", 1 << 30))
//!         .await
//!         .unwrap();
//!     println!("{} is {}", volume.id, volume.state);
//! }
//! ```

pub mod ceph;
pub mod classes;
pub mod error;
pub mod keys;
pub mod lifecycle;
pub mod metadata;
pub mod provisioner;
pub mod types;

pub use ceph::{CephCluster, CephConfig};
pub use classes::VolumeClassSet;
pub use error::{ClusterError, Result, VolumeError};
pub use keys::{FileKeyManager, KeyManager, StaticKeyManager};
pub use lifecycle::{
    LifecycleConfig, QueueConfig, ResumeSummary, RetryPolicy, VolumeManager,
};
pub use metadata::{MemoryStore, MetadataStore, OmapStore};
pub use provisioner::{ImageProvisioner, MockProvisioner, RbdProvisioner};
pub use types::*;
