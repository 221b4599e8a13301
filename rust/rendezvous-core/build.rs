fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_file = "../../proto/rendezvous.proto";
    let proto_dir = "../../proto";

    // Rerun if proto file changes
    println!("cargo:rerun-if-changed={}", proto_file);
    println!("cargo:rerun-if-env-changed=PROTOC");

    // Fall back to the vendored protoc when none is provided
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&[proto_file], &[proto_dir])?;

    Ok(())
}
