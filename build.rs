fn main() -> std::io::Result<()> {
    prost_build::compile_protos(&["proto/swim.proto"], &["proto"])?;
    println!("cargo:rerun-if-changed=proto/swim.proto");
    Ok(())
}
