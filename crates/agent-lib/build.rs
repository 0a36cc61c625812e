//! Build script for regenerating protobuf code
//!
//! The checked-in bindings under `src/proto` are used by default. Building with
//! the `proto-gen` feature regenerates them from `proto/` with tonic-build.

use std::path::PathBuf;
use std::process::Command;

const PROTOS: &[&str] = &[
    "../../proto/perfscope/v1/profiler.proto",
    "../../proto/runtime/v1/api.proto",
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    for proto in PROTOS {
        println!("cargo:rerun-if-changed={}", proto);
    }

    if std::env::var_os("CARGO_FEATURE_PROTO_GEN").is_none() {
        return Ok(());
    }

    // Check if protoc is available
    let protoc_available =
        std::env::var("PROTOC").is_ok() || Command::new("protoc").arg("--version").output().is_ok();

    if !protoc_available {
        return Err("proto-gen requires protoc on PATH or the PROTOC env var".into());
    }

    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .out_dir(&out_dir)
        .compile(PROTOS, &["../../proto"])?;

    Ok(())
}
