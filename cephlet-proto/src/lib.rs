//! # cephlet Proto
//!
//! Generated Rust code from the protobuf definitions of the volume runtime API.
//!
//! The `VolumeRuntime` service and its message types are what the daemon
//! serves on its UNIX socket.

// Include generated code
pub mod generated {
    pub mod cephlet {
        pub mod volume {
            pub mod v1alpha1 {
                include!("generated/cephlet.volume.v1alpha1.rs");
            }
        }
    }
}

// Re-export for convenience
pub use generated::cephlet::volume::v1alpha1::*;
pub use generated::cephlet::volume::v1alpha1::volume_runtime_server::{
    VolumeRuntime, VolumeRuntimeServer,
};
