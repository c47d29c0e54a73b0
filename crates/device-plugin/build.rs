fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Server side is what the plugin exposes; the client side is needed for
    // kubelet registration and for driving the plugin in integration tests.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/deviceplugin.proto"], &["proto"])?;
    Ok(())
}
