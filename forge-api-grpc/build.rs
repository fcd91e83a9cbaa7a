use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());

    tonic_build::configure()
        .file_descriptor_set_path(out_dir.join("services.bin"))
        .include_file("mod.rs")
        .compile(
            &[
                "proto/forge/common/common.proto",
                "proto/forge/orchestrator/v1/orchestrator_service.proto",
                "proto/forge/worker/v1/worker_service.proto",
            ],
            &["proto"],
        )
        .unwrap();

    Ok(())
}
