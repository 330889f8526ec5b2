//! Transparent HTTPS secrets proxy.
//!
//! One CONNECT listener serves every sandbox on the worker. The caller is
//! identified by its guest IP; its sealed tokens are substituted with real
//! values on the client→upstream byte stream, after the MITM TLS handshake.

pub mod ca;
pub mod replace;
pub mod session;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use crate::error::WorkerError;
use ca::CertAuthority;
use replace::StreamReplacer;
use session::{host_allowed, SessionMap};

const MAX_REQUEST_HEAD: usize = 8192;
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PUMP_BUF_SIZE: usize = 16 * 1024;

const RESP_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const RESP_FORBIDDEN: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\n";
const RESP_METHOD_NOT_ALLOWED: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\n\r\n";

pub struct SecretsProxy {
    ca: Arc<CertAuthority>,
    sessions: Arc<SessionMap>,
    /// Worker-level allowlist applied to peers without a session.
    global_allowlist: Vec<String>,
    upstream_config: Arc<rustls::ClientConfig>,
}

impl SecretsProxy {
    pub fn new(ca: Arc<CertAuthority>, sessions: Arc<SessionMap>, global_allowlist: Vec<String>) -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let upstream_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        Self {
            ca,
            sessions,
            global_allowlist,
            upstream_config,
        }
    }

    /// Replace the upstream trust anchors. Tests point this at a local TLS
    /// server with a self-signed certificate.
    pub fn with_upstream_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.upstream_config = config;
        self
    }

    /// Accept loop. One task per connection; the listener itself never does
    /// TLS or I/O beyond accept.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "secrets proxy listening");
        }
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let proxy = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = proxy.handle_conn(stream, peer).await {
                            debug!(peer = %peer, error = %e, "proxy connection closed with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "proxy accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_conn(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), WorkerError> {
        let head = read_request_head(&mut stream).await?;

        let Some((host, port)) = parse_connect(&head) else {
            let _ = stream.write_all(RESP_METHOD_NOT_ALLOWED).await;
            return Ok(());
        };

        let peer_ip = peer.ip().to_string();
        let proxy_session = self.sessions.get(&peer_ip);

        let allowed = match &proxy_session {
            Some(s) => host_allowed(&s.allowed_hosts, &host),
            None => host_allowed(&self.global_allowlist, &host),
        };
        if !allowed {
            debug!(peer = %peer_ip, host = %host, "egress denied");
            let _ = stream.write_all(RESP_FORBIDDEN).await;
            return Err(WorkerError::EgressDenied(host));
        }

        stream
            .write_all(RESP_ESTABLISHED)
            .await
            .map_err(|e| WorkerError::io("writing 200 to client", e))?;

        // Leaf signing can block on RSA keygen for an uncached host.
        let ca = Arc::clone(&self.ca);
        let leaf_host = host.clone();
        let server_config = tokio::task::spawn_blocking(move || ca.server_config_for(&leaf_host))
            .await
            .map_err(|e| WorkerError::ProxyTlsError(format!("leaf signing task: {}", e)))??;

        let client_tls = TlsAcceptor::from(server_config)
            .accept(stream)
            .await
            .map_err(|e| WorkerError::ProxyTlsError(format!("client handshake: {}", e)))?;

        let upstream_tcp = tokio::time::timeout(
            UPSTREAM_CONNECT_TIMEOUT,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map_err(|_| WorkerError::ProxyTlsError(format!("upstream {} timed out", host)))?
        .map_err(|e| WorkerError::io(format!("connecting upstream {}", host), e))?;

        let server_name = rustls::pki_types::ServerName::try_from(host.clone())
            .map_err(|e| WorkerError::ProxyTlsError(format!("invalid SNI {}: {}", host, e)))?;
        let upstream_tls = TlsConnector::from(Arc::clone(&self.upstream_config))
            .connect(server_name, upstream_tcp)
            .await
            .map_err(|e| WorkerError::ProxyTlsError(format!("upstream handshake {}: {}", host, e)))?;

        let substitutions = proxy_session
            .as_ref()
            .map(|s| s.substitutions.clone())
            .unwrap_or_default();

        debug!(
            peer = %peer_ip,
            host = %host,
            substitutions = substitutions.len(),
            "tunnel established"
        );

        pump(client_tls, upstream_tls, &substitutions).await;
        Ok(())
    }
}

/// Shuttle bytes between the two TLS streams until either side closes.
/// Upstream→client is piped unmodified; client→upstream goes through the
/// token replacer. Byte order per direction is preserved.
async fn pump<C, U>(client: C, upstream: U, substitutions: &HashMap<String, String>)
where
    C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    U: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);
    let mut replacer = StreamReplacer::new(substitutions);

    let client_to_upstream = async move {
        let mut buf = [0u8; PUMP_BUF_SIZE];
        loop {
            let n = match client_rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let out = replacer.feed(&buf[..n]);
            if !out.is_empty() && upstream_wr.write_all(&out).await.is_err() {
                break;
            }
        }
        let rest = replacer.finish();
        if !rest.is_empty() {
            let _ = upstream_wr.write_all(&rest).await;
        }
        let _ = upstream_wr.shutdown().await;
    };

    let upstream_to_client = async move {
        let _ = tokio::io::copy(&mut upstream_rd, &mut client_wr).await;
        let _ = client_wr.shutdown().await;
    };

    tokio::join!(client_to_upstream, upstream_to_client);
}

async fn read_request_head(stream: &mut TcpStream) -> Result<String, WorkerError> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while head.len() < MAX_REQUEST_HEAD {
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| WorkerError::io("reading request head", e))?;
        if n == 0 {
            break;
        }
        head.push(byte[0]);
        if head.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// Parse a `CONNECT host:port` request line. Anything else is rejected.
fn parse_connect(head: &str) -> Option<(String, u16)> {
    let line = head.lines().next()?;
    let mut parts = line.split_whitespace();
    if parts.next()? != "CONNECT" {
        return None;
    }
    let target = parts.next()?;
    match target.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().ok()?;
            if host.is_empty() {
                return None;
            }
            Some((host.to_string(), port))
        }
        None => Some((target.to_string(), 443)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session::ProxySession;
    use std::sync::Once;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    static INIT_CRYPTO: Once = Once::new();

    fn init_crypto_provider() {
        INIT_CRYPTO.call_once(|| {
            rustls::crypto::ring::default_provider()
                .install_default()
                .ok();
        });
    }

    #[test]
    fn parse_connect_accepts_host_port() {
        assert_eq!(
            parse_connect("CONNECT httpbin.org:443 HTTP/1.1\r\n\r\n"),
            Some(("httpbin.org".to_string(), 443))
        );
        assert_eq!(
            parse_connect("CONNECT example.com:8443 HTTP/1.1\r\n"),
            Some(("example.com".to_string(), 8443))
        );
    }

    #[test]
    fn parse_connect_defaults_to_443() {
        assert_eq!(
            parse_connect("CONNECT example.com HTTP/1.1\r\n"),
            Some(("example.com".to_string(), 443))
        );
    }

    #[test]
    fn parse_connect_rejects_other_methods() {
        assert!(parse_connect("GET / HTTP/1.1\r\n").is_none());
        assert!(parse_connect("POST http://x/ HTTP/1.1\r\n").is_none());
        assert!(parse_connect("").is_none());
    }

    struct TestProxy {
        addr: SocketAddr,
        sessions: Arc<SessionMap>,
    }

    async fn spawn_proxy(upstream_config: Option<Arc<rustls::ClientConfig>>) -> TestProxy {
        init_crypto_provider();
        let dir = tempfile::tempdir().unwrap();
        // 2048-bit test root; keygen at 4096 is too slow for unit tests.
        let ca = Arc::new(CertAuthority::create(dir.path(), 2048).unwrap());
        let sessions = Arc::new(SessionMap::new());
        let mut proxy = SecretsProxy::new(Arc::clone(&ca), Arc::clone(&sessions), vec![]);
        if let Some(config) = upstream_config {
            proxy = proxy.with_upstream_config(config);
        }
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::new(proxy).serve(listener));
        // tempdir must outlive the proxy task's CA; leak it for test lifetime
        std::mem::forget(dir);
        TestProxy { addr, sessions }
    }

    #[tokio::test]
    async fn non_connect_request_gets_405() {
        let proxy = spawn_proxy(None).await;
        let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 405"));
    }

    #[tokio::test]
    async fn denied_host_gets_403() {
        let proxy = spawn_proxy(None).await;
        proxy.sessions.insert(
            "127.0.0.1",
            ProxySession {
                sandbox_id: "sb_a".into(),
                substitutions: HashMap::new(),
                allowed_hosts: vec!["httpbin.org".into()],
            },
        );

        let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
        stream
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 403"));
    }

    /// Full MITM loop: client → proxy (TLS as server) → local TLS upstream.
    /// The sealed token in the request bytes must arrive at the upstream as
    /// the real value; the token never reaches upstream bytes.
    #[tokio::test]
    async fn end_to_end_with_known_ca() {
        init_crypto_provider();

        // Upstream echo server over TLS.
        let upstream_cert =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let upstream_key = rustls::pki_types::PrivatePkcs8KeyDer::from(
            upstream_cert.key_pair.serialize_der(),
        );
        let upstream_server_config = Arc::new(
            rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(
                    vec![upstream_cert.cert.der().clone()],
                    upstream_key.into(),
                )
                .unwrap(),
        );
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream_listener.local_addr().unwrap().port();
        let acceptor = TlsAcceptor::from(upstream_server_config);
        let received_by_upstream = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let received_clone = Arc::clone(&received_by_upstream);
        tokio::spawn(async move {
            let (tcp, _) = upstream_listener.accept().await.unwrap();
            let mut tls = acceptor.accept(tcp).await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = tls.read(&mut buf).await.unwrap();
            received_clone.lock().await.extend_from_slice(&buf[..n]);
            tls.write_all(b"ok").await.unwrap();
            tls.shutdown().await.ok();
        });

        let mut upstream_roots = rustls::RootCertStore::empty();
        upstream_roots
            .add(upstream_cert.cert.der().clone())
            .unwrap();
        let upstream_client_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(upstream_roots)
                .with_no_client_auth(),
        );

        // Proxy with a CA we hold on to.
        let ca_dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(CertAuthority::create(ca_dir.path(), 2048).unwrap());
        let sessions = Arc::new(SessionMap::new());
        let proxy = SecretsProxy::new(Arc::clone(&ca), Arc::clone(&sessions), vec![])
            .with_upstream_config(upstream_client_config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::new(proxy).serve(listener));

        let token = "osb_sealed_00112233445566778899aabbccddeeff";
        sessions.insert(
            "127.0.0.1",
            ProxySession {
                sandbox_id: "sb_mitm".into(),
                substitutions: HashMap::from([(token.to_string(), "sk-real-123".to_string())]),
                allowed_hosts: vec!["localhost".into()],
            },
        );

        // CONNECT, then TLS-handshake against the proxy trusting its CA.
        let mut tcp = TcpStream::connect(proxy_addr).await.unwrap();
        tcp.write_all(
            format!("CONNECT localhost:{} HTTP/1.1\r\n\r\n", upstream_port).as_bytes(),
        )
        .await
        .unwrap();
        let mut established = [0u8; 39];
        tcp.read_exact(&mut established).await.unwrap();
        assert!(String::from_utf8_lossy(&established).starts_with("HTTP/1.1 200"));

        let mut client_roots = rustls::RootCertStore::empty();
        let ca_der = rustls_pemfile::certs(&mut ca.ca_pem().as_bytes())
            .next()
            .unwrap()
            .unwrap();
        client_roots.add(ca_der).unwrap();
        let client_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(client_roots)
                .with_no_client_auth(),
        );
        let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
        let mut tls = TlsConnector::from(client_config)
            .connect(server_name, tcp)
            .await
            .expect("client must trust the proxy leaf via the CA");

        let request = format!("x-t: {}\r\n", token);
        tls.write_all(request.as_bytes()).await.unwrap();

        let mut reply = [0u8; 2];
        tls.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ok");

        let received = received_by_upstream.lock().await.clone();
        let received_str = String::from_utf8_lossy(&received);
        assert!(received_str.contains("sk-real-123"));
        assert!(!received_str.contains("osb_sealed_"));
    }
}
