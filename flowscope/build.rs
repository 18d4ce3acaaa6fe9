use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let target_dir = "target/bpfel-unknown-none/release";
    let elf_path = PathBuf::from(target_dir).join("flowscope-ebpf");
    println!("cargo:rustc-env=EBPF_PROGRAM_PATH={}", elf_path.display());
    println!("cargo:rerun-if-changed={}", elf_path.display());

    let mut config = prost_build::Config::new();
    config.protoc_executable(protoc_bin_vendored::protoc_bin_path()?);

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .type_attribute(".flowscope.v1", "#[derive(serde::Serialize)]")
        .compile_protos_with_config(config, &["proto/flowscope.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/flowscope.proto");
    println!("cargo:rerun-if-changed=build.rs");

    Ok(())
}
