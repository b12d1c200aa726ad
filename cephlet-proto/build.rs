//! Build script for generating Rust code from protobuf definitions.
//!
//! The generated code is checked in under `src/generated`, so a normal build
//! does not need `protoc`. Enable the `codegen` feature to regenerate it after
//! editing `proto/volume.proto`.

use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/volume.proto");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_CODEGEN");

    if std::env::var_os("CARGO_FEATURE_CODEGEN").is_none() {
        return Ok(());
    }

    let out_dir = PathBuf::from("src/generated");
    std::fs::create_dir_all(&out_dir)?;

    let proto = PathBuf::from("proto/volume.proto");
    if !proto.exists() {
        println!("cargo:warning=Proto file not found: {:?}", proto);
        return Ok(());
    }

    // Only the server side is served by the daemon.
    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .out_dir(&out_dir)
        .compile(&[proto], &[PathBuf::from("proto")])?;

    Ok(())
}
