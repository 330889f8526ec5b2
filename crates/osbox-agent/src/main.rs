mod exec;
mod files;
mod pty;
mod service;
mod vsock;

pub mod proto {
    tonic::include_proto!("osbox.agent.v1");
}

use std::sync::Arc;

use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let pty_manager = Arc::new(pty::PtyManager::new());
    tokio::spawn(pty::run_watchdog(Arc::clone(&pty_manager)));

    let service = service::GuestAgentService::new(pty_manager);

    let control_port: u32 = std::env::var("OSBOX_AGENT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(vsock::CONTROL_PORT);

    let use_tcp = std::env::var("OSBOX_AGENT_DEV").is_ok() || !vsock::is_available();

    if use_tcp {
        let tcp_port: u16 = std::env::var("OSBOX_AGENT_DEV_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(50052);
        let addr = format!("0.0.0.0:{tcp_port}");
        info!("guest agent ready on TCP {addr} (dev mode)");
        vsock::serve_tcp(&addr, service).await?;
    } else {
        info!("guest agent ready on vsock port {control_port}");
        vsock::serve_vsock(control_port, service).await?;
    }

    Ok(())
}
