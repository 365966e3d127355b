fn main() -> std::io::Result<()> {
    println!("cargo:rerun-if-changed=proto/sample.proto");
    prost_build::compile_protos(&["proto/sample.proto"], &["proto/"])
}
