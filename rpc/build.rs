extern crate tonic_build;

fn main() {
    println!("cargo:rerun-if-changed=proto/csi.proto");

    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .compile(&["proto/csi.proto"], &["proto"])
        .unwrap_or_else(|e| panic!("CSI protobuf compilation failed: {}", e));
}
