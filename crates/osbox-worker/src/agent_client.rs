use std::time::Duration;

use hyper_util::rt::TokioIo;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, info};

use crate::error::WorkerError;

pub mod agent_proto {
    tonic::include_proto!("osbox.agent.v1");
}

pub type AgentGrpcClient = agent_proto::guest_agent_client::GuestAgentClient<Channel>;

/// Fixed vsock port for the agent control channel.
pub const AGENT_CONTROL_PORT: u32 = 1024;

/// Unix socket the host opens to reach a guest vsock port: Firecracker
/// bridges `<vsock-base>_<port>` to the listener inside the VM.
pub fn control_socket_path(vsock_path: &str) -> String {
    format!("{}_{}", vsock_path, AGENT_CONTROL_PORT)
}

/// Client for the guest agent inside one Firecracker microVM.
///
/// Production connects through the Firecracker vsock UDS bridge; with
/// `OSBOX_AGENT_DEV=1` it connects over TCP to a locally-running agent.
pub struct AgentClient {
    vsock_path: String,
}

impl AgentClient {
    pub fn new(vsock_path: &str) -> Self {
        Self {
            vsock_path: vsock_path.to_string(),
        }
    }

    fn dev_endpoint() -> Option<String> {
        if std::env::var("OSBOX_AGENT_DEV").is_err() {
            return None;
        }
        let port = std::env::var("OSBOX_AGENT_DEV_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(50052);
        Some(format!("http://127.0.0.1:{}", port))
    }

    /// Connect and return a reusable gRPC client handle.
    pub async fn connect(&self) -> Result<AgentGrpcClient, WorkerError> {
        let channel = if let Some(endpoint) = Self::dev_endpoint() {
            Endpoint::from_shared(endpoint.clone())
                .map_err(|e| WorkerError::AgentUnavailable(format!("invalid endpoint: {}", e)))?
                .connect_timeout(Duration::from_secs(2))
                .timeout(Duration::from_secs(300))
                .connect()
                .await
                .map_err(|e| {
                    WorkerError::AgentUnavailable(format!("connect {}: {}", endpoint, e))
                })?
        } else {
            self.connect_uds().await?
        };

        Ok(agent_proto::guest_agent_client::GuestAgentClient::new(
            channel,
        ))
    }

    async fn connect_uds(&self) -> Result<Channel, WorkerError> {
        let socket_path = control_socket_path(&self.vsock_path);
        debug!(path = %socket_path, "connecting to guest agent over vsock UDS");

        // The URI is required by tonic but never resolved; the connector
        // dials the Unix socket.
        let channel = Endpoint::from_static("http://vsock.agent")
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(300))
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = socket_path.clone();
                async move {
                    let stream = tokio::net::UnixStream::connect(path).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(stream))
                }
            }))
            .await
            .map_err(|e| {
                WorkerError::AgentUnavailable(format!(
                    "connect {}: {}",
                    control_socket_path(&self.vsock_path),
                    e
                ))
            })?;

        Ok(channel)
    }

    /// Poll the agent's Ping RPC until it answers ready. Used as the boot
    /// handshake; connect failures while the guest is still starting its
    /// listener are absorbed by the retry loop.
    pub async fn wait_for_ping(&self, timeout: Duration) -> Result<(), WorkerError> {
        let start = tokio::time::Instant::now();
        let interval = Duration::from_millis(100);

        while start.elapsed() < timeout {
            if let Ok(mut client) = self.connect().await {
                match client.ping(()).await {
                    Ok(response) => {
                        if response.into_inner().ready {
                            info!(
                                elapsed_ms = start.elapsed().as_millis() as u64,
                                "guest agent answered ping"
                            );
                            return Ok(());
                        }
                    }
                    _ => {}
                }
            }
            tokio::time::sleep(interval).await;
        }

        Err(WorkerError::AgentTimeout(format!(
            "no ping answer within {:?}",
            timeout
        )))
    }
}

/// Write the sealed environment and the proxy CA into a freshly-booted
/// guest. Real secret values are absent from both payloads.
pub async fn seed_guest(
    vsock_path: &str,
    guest_env: &std::collections::HashMap<String, String>,
    ca_pem: &str,
) -> Result<(), WorkerError> {
    use crate::proxy::session::{render_etc_environment, GUEST_CA_PATH};

    let mut client = AgentClient::new(vsock_path).connect().await?;

    client
        .write_file(agent_proto::WriteFileRequest {
            path: "/etc/environment".to_string(),
            content: render_etc_environment(guest_env).into_bytes(),
        })
        .await
        .map_err(WorkerError::from_agent_status)?;

    client
        .write_file(agent_proto::WriteFileRequest {
            path: GUEST_CA_PATH.to_string(),
            content: ca_pem.as_bytes().to_vec(),
        })
        .await
        .map_err(WorkerError::from_agent_status)?;

    Ok(())
}
