fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Worker proto: server stubs (control plane and SDK clients connect to us)
    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_protos(&["osbox/worker/v1/worker.proto"], &["../../proto"])?;

    // Agent proto: client stubs (we connect to guest agents over vsock)
    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&["osbox/agent/v1/agent.proto"], &["../../proto"])?;

    Ok(())
}
