fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }
    tonic_build::configure()
        .message_attribute(".", "#[derive(Eq)]")
        .enum_attribute(".ledger.Command.op", "#[derive(Eq)]")
        .compile_protos(&["proto/ledger.proto"], &["proto"])?;
    Ok(())
}
