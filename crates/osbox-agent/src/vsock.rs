use std::io;

use tonic::transport::Server;

use crate::proto::guest_agent_server::GuestAgentServer;
use crate::service::GuestAgentService;

/// Fixed vsock port of the control channel.
pub const CONTROL_PORT: u32 = 1024;

/// PTY data ports are allocated from this half-open range.
pub const DATA_PORT_MIN: u32 = 2000;
pub const DATA_PORT_MAX: u32 = 65000;

/// Returns whether vsock is available on this platform.
pub fn is_available() -> bool {
    #[cfg(all(target_os = "linux", feature = "vsock"))]
    {
        std::path::Path::new("/dev/vsock").exists()
    }
    #[cfg(not(all(target_os = "linux", feature = "vsock")))]
    {
        false
    }
}

/// Serve the control channel over TCP (local development).
pub async fn serve_tcp(
    addr: &str,
    service: GuestAgentService,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = addr.parse()?;
    Server::builder()
        .add_service(GuestAgentServer::new(service))
        .serve(addr)
        .await?;
    Ok(())
}

/// Serve the control channel over vsock (production, inside the microVM).
///
/// The listener is bound before this function reports anything as ready, so
/// a host connecting immediately after boot is queued, not refused.
#[cfg(all(target_os = "linux", feature = "vsock"))]
pub async fn serve_vsock(
    port: u32,
    service: GuestAgentService,
) -> Result<(), Box<dyn std::error::Error>> {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
    use tokio_vsock::{VsockListener, VsockStream};
    use tonic::transport::server::Connected;

    // tonic tags incoming connections with Connected metadata; vsock peers
    // carry nothing worth reporting, so this newtype only forwards I/O.
    // VsockStream is Unpin, which keeps the forwarding to plain Pin::new.
    struct AgentConn(VsockStream);

    impl Connected for AgentConn {
        type ConnectInfo = ();
        fn connect_info(&self) -> Self::ConnectInfo {}
    }

    impl AsyncRead for AgentConn {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for AgentConn {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            data: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, data)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_shutdown(cx)
        }
    }

    let mut listener = VsockListener::bind(u32::MAX, port)?;
    let connections: async_stream::__private::AsyncStream<
        Result<AgentConn, Box<dyn std::error::Error + Send + Sync>>,
        _,
    > = async_stream::try_stream! {
        loop {
            let (stream, _peer) = listener
                .accept()
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?;
            yield AgentConn(stream);
        }
    };
    tokio::pin!(connections);

    Server::builder()
        .add_service(GuestAgentServer::new(service))
        .serve_with_incoming(connections)
        .await?;

    Ok(())
}

/// Fallback when vsock is not available.
#[cfg(not(all(target_os = "linux", feature = "vsock")))]
pub async fn serve_vsock(
    _port: u32,
    _service: GuestAgentService,
) -> Result<(), Box<dyn std::error::Error>> {
    Err("vsock is not available on this platform, set OSBOX_AGENT_DEV=1 to use TCP".into())
}

/// Byte stream accepted on a PTY data port, vsock or TCP alike.
pub trait DataIo: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin> DataIo for T {}

/// Listener for one PTY data port. The contract: `bind` succeeding means the
/// port is accepting, so it is safe to report the port to the host.
pub enum DataListener {
    #[cfg(all(target_os = "linux", feature = "vsock"))]
    Vsock(tokio_vsock::VsockListener),
    Tcp(tokio::net::TcpListener),
}

impl DataListener {
    pub async fn bind(port: u32) -> io::Result<Self> {
        #[cfg(all(target_os = "linux", feature = "vsock"))]
        if is_available() {
            return Ok(DataListener::Vsock(tokio_vsock::VsockListener::bind(
                u32::MAX, port,
            )?));
        }
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port as u16)).await?;
        Ok(DataListener::Tcp(listener))
    }

    pub async fn accept(&mut self) -> io::Result<Box<dyn DataIo>> {
        match self {
            #[cfg(all(target_os = "linux", feature = "vsock"))]
            DataListener::Vsock(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            DataListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_port_range_is_sane() {
        assert!(DATA_PORT_MIN >= 2000);
        assert!(DATA_PORT_MAX <= 65000);
        assert!(DATA_PORT_MIN < DATA_PORT_MAX);
        assert!(CONTROL_PORT < DATA_PORT_MIN);
    }

    #[tokio::test]
    async fn tcp_data_listener_accepts_after_bind() {
        // Port 0 is outside the contract but fine for an ephemeral test bind.
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut listener = DataListener::Tcp(listener);

        let connect = tokio::spawn(async move {
            tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap()
        });
        let accepted = listener.accept().await;
        assert!(accepted.is_ok());
        connect.await.unwrap();
    }
}
