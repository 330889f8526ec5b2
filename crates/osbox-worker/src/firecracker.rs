use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::error::WorkerError;

/// How long one VMM API exchange may take end to end.
const VMM_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to a running Firecracker process.
pub struct FirecrackerVm {
    pub sandbox_id: String,
    pub api_socket_path: String,
    pub vsock_path: String,
    child: Child,
}

impl FirecrackerVm {
    /// Spawn Firecracker with a pre-written machine configuration file.
    pub async fn spawn_with_config(
        sandbox_id: &str,
        api_socket_path: &str,
        vsock_path: &str,
        config_path: &str,
    ) -> Result<Self, WorkerError> {
        Self::spawn(sandbox_id, api_socket_path, vsock_path, Some(config_path)).await
    }

    /// Spawn Firecracker with no configuration; the caller drives it through
    /// the API socket (snapshot-load mode).
    pub async fn spawn_bare(
        sandbox_id: &str,
        api_socket_path: &str,
        vsock_path: &str,
    ) -> Result<Self, WorkerError> {
        Self::spawn(sandbox_id, api_socket_path, vsock_path, None).await
    }

    async fn spawn(
        sandbox_id: &str,
        api_socket_path: &str,
        vsock_path: &str,
        config_path: Option<&str>,
    ) -> Result<Self, WorkerError> {
        // A stale API socket makes Firecracker refuse to start.
        let _ = tokio::fs::remove_file(api_socket_path).await;

        let mut cmd = Command::new("firecracker");
        cmd.arg("--api-sock").arg(api_socket_path);
        if let Some(config) = config_path {
            cmd.arg("--config-file").arg(config);
        }

        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::io("spawning firecracker", e))?;

        info!(
            sandbox_id = %sandbox_id,
            pid = ?child.id(),
            config = ?config_path,
            "Firecracker process started"
        );

        Ok(Self {
            sandbox_id: sandbox_id.to_string(),
            api_socket_path: api_socket_path.to_string(),
            vsock_path: vsock_path.to_string(),
            child,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Whether the Firecracker process is still alive.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Kill the process: SIGTERM, wait up to 5 seconds, then SIGKILL.
    /// Socket files are removed; the sandbox directory is left alone (it may
    /// hold snapshot files the hibernation engine still needs).
    pub async fn destroy(mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            let graceful =
                tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await;
            if graceful.is_err() {
                warn!(
                    sandbox_id = %self.sandbox_id,
                    "Firecracker did not exit gracefully, sending SIGKILL"
                );
                let _ = self.child.kill().await;
            }
        }

        #[cfg(not(unix))]
        {
            let _ = self.child.kill().await;
        }

        let _ = tokio::fs::remove_file(&self.api_socket_path).await;
        if Path::new(&self.vsock_path).exists() {
            let _ = tokio::fs::remove_file(&self.vsock_path).await;
        }

        info!(sandbox_id = %self.sandbox_id, "Firecracker process destroyed");
    }
}

/// Client for Firecracker's HTTP API, served on a Unix socket.
///
/// The VMM speaks a tiny HTTP/1.1 dialect: one request per connection, small
/// JSON bodies, no chunking. A short blocking exchange per call keeps this
/// free of HTTP machinery.
pub struct FirecrackerApi {
    socket: String,
}

impl FirecrackerApi {
    pub fn new(api_socket_path: &str) -> Self {
        Self {
            socket: api_socket_path.to_string(),
        }
    }

    /// Wait for the API socket to appear after spawn.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<(), WorkerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if Path::new(&self.socket).exists() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(WorkerError::VmmApiError(format!(
            "VMM never opened {} within {:?}",
            self.socket, timeout
        )))
    }

    /// `PATCH /vm` with `state: "Paused"`.
    pub async fn pause(&self) -> Result<(), WorkerError> {
        self.call("PATCH", "/vm", r#"{"state":"Paused"}"#).await
    }

    /// `PATCH /vm` with `state: "Resumed"`.
    pub async fn resume(&self) -> Result<(), WorkerError> {
        self.call("PATCH", "/vm", r#"{"state":"Resumed"}"#).await
    }

    /// `PUT /snapshot/create`: write VMM state + guest memory of a paused VM.
    pub async fn create_snapshot(
        &self,
        state_path: &str,
        mem_path: &str,
    ) -> Result<(), WorkerError> {
        let body = format!(
            r#"{{"snapshot_type":"Full","snapshot_path":"{}","mem_file_path":"{}"}}"#,
            state_path, mem_path
        );
        self.call("PUT", "/snapshot/create", &body).await
    }

    /// `PUT /snapshot/load`: restore a VM from state + memory files. The VM
    /// comes up paused; resume separately.
    pub async fn load_snapshot(
        &self,
        state_path: &str,
        mem_path: &str,
    ) -> Result<(), WorkerError> {
        let body = format!(
            r#"{{"snapshot_path":"{}","mem_file_path":"{}","enable_diff_snapshots":false,"resume_vm":false}}"#,
            state_path, mem_path
        );
        self.call("PUT", "/snapshot/load", &body).await
    }

    async fn call(&self, method: &str, endpoint: &str, body: &str) -> Result<(), WorkerError> {
        let socket = self.socket.clone();
        let payload = render_request(method, endpoint, body);

        let raw = tokio::task::spawn_blocking(move || blocking_exchange(&socket, &payload))
            .await
            .map_err(|e| WorkerError::VmmApiError(format!("API exchange task: {}", e)))??;

        let reply = VmmReply::parse(&raw)?;
        if !reply.ok() {
            return Err(WorkerError::VmmApiError(format!(
                "{} {} failed with {}: {}",
                method,
                endpoint,
                reply.status,
                reply.body.trim()
            )));
        }
        Ok(())
    }
}

/// Render one request. Firecracker only needs the JSON content headers when a
/// body is attached.
fn render_request(method: &str, endpoint: &str, body: &str) -> Vec<u8> {
    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: localhost\r\nAccept: application/json\r\n",
        method, endpoint
    );
    if !body.is_empty() {
        request.push_str("Content-Type: application/json\r\n");
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    request.push_str("\r\n");
    request.push_str(body);
    request.into_bytes()
}

/// Write the request, then read until the reply is whole or the socket goes
/// quiet. Runs on the blocking pool; callers stay async.
fn blocking_exchange(socket: &str, payload: &[u8]) -> Result<Vec<u8>, WorkerError> {
    use std::io::{ErrorKind, Read, Write};

    let mut conn = std::os::unix::net::UnixStream::connect(socket)
        .map_err(|e| WorkerError::VmmApiError(format!("no VMM listening at {}: {}", socket, e)))?;
    conn.write_all(payload)
        .map_err(|e| WorkerError::VmmApiError(format!("sending API request: {}", e)))?;
    conn.set_read_timeout(Some(VMM_REPLY_TIMEOUT)).ok();

    let mut raw = Vec::with_capacity(512);
    let mut chunk = [0u8; 2048];
    while !reply_complete(&raw) {
        match conn.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => raw.extend_from_slice(&chunk[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
            Err(e) => {
                return Err(WorkerError::VmmApiError(format!("reading API reply: {}", e)))
            }
        }
    }
    Ok(raw)
}

/// A reply is whole once the blank line has arrived and, if a Content-Length
/// header was declared, that many body bytes followed it.
fn reply_complete(raw: &[u8]) -> bool {
    let Some(body_at) = body_offset(raw) else {
        return false;
    };
    match declared_length(&raw[..body_at]) {
        Some(expected) => raw.len() - body_at >= expected,
        None => true,
    }
}

/// Byte offset of the body, one past the header/body separator.
fn body_offset(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn declared_length(head: &[u8]) -> Option<usize> {
    let head = String::from_utf8_lossy(head);
    head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("content-length") {
            return None;
        }
        value.trim().parse().ok()
    })
}

/// One parsed VMM reply.
struct VmmReply {
    status: u16,
    body: String,
}

impl VmmReply {
    fn parse(raw: &[u8]) -> Result<Self, WorkerError> {
        let text = String::from_utf8_lossy(raw);
        let status_line = text.lines().next().unwrap_or_default();
        // "HTTP/1.1 204 No Content"
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .ok_or_else(|| {
                WorkerError::VmmApiError(format!("malformed VMM status line: {:?}", status_line))
            })?;

        let body = body_offset(raw)
            .map(|at| String::from_utf8_lossy(&raw[at..]).into_owned())
            .unwrap_or_default();

        Ok(Self { status, body })
    }

    fn ok(&self) -> bool {
        self.status < 300
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_request_without_body_has_no_content_headers() {
        let raw = render_request("PATCH", "/vm", "");
        let text = String::from_utf8(raw).unwrap();
        assert!(text.starts_with("PATCH /vm HTTP/1.1\r\n"));
        assert!(!text.contains("Content-Length"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn render_request_with_body_declares_length() {
        let raw = render_request("PUT", "/snapshot/create", r#"{"a":1}"#);
        let text = String::from_utf8(raw).unwrap();
        assert!(text.contains("Content-Length: 7\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"a\":1}"));
    }

    #[test]
    fn body_offset_finds_separator() {
        assert_eq!(body_offset(b"HTTP/1.1 200 OK\r\n\r\nhi"), Some(19));
        assert_eq!(body_offset(b"HTTP/1.1 200 OK\r\n"), None);
        assert_eq!(body_offset(b""), None);
    }

    #[test]
    fn reply_complete_waits_for_declared_body() {
        let partial = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 10\r\n\r\n{\"fault";
        assert!(!reply_complete(partial));

        let whole = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 10\r\n\r\n0123456789";
        assert!(reply_complete(whole));
    }

    #[test]
    fn reply_complete_without_length_ends_at_blank_line() {
        assert!(reply_complete(b"HTTP/1.1 204 No Content\r\n\r\n"));
        assert!(!reply_complete(b"HTTP/1.1 204 No Content\r\n"));
    }

    #[test]
    fn declared_length_is_case_insensitive_and_trimmed() {
        assert_eq!(declared_length(b"content-length: 12\r\n"), Some(12));
        assert_eq!(declared_length(b"CONTENT-LENGTH:   7  \r\n"), Some(7));
        assert_eq!(declared_length(b"Content-Type: application/json\r\n"), None);
        assert_eq!(declared_length(b"Content-Length: nope\r\n"), None);
    }

    #[test]
    fn parse_reply_extracts_status_and_body() {
        let reply = VmmReply::parse(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 9\r\n\r\n{\"err\":1}")
            .unwrap();
        assert_eq!(reply.status, 400);
        assert_eq!(reply.body, r#"{"err":1}"#);
        assert!(!reply.ok());
    }

    #[test]
    fn parse_reply_no_content() {
        let reply = VmmReply::parse(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap();
        assert_eq!(reply.status, 204);
        assert!(reply.body.is_empty());
        assert!(reply.ok());
    }

    #[test]
    fn parse_reply_rejects_garbage() {
        assert!(VmmReply::parse(b"").is_err());
        assert!(VmmReply::parse(b"not http at all").is_err());
        assert!(VmmReply::parse(b"HTTP/1.1 abc OK\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn wait_for_ready_times_out_without_socket() {
        let api = FirecrackerApi::new("/tmp/osbox-missing-api.sock");
        let result = api.wait_for_ready(Duration::from_millis(200)).await;
        assert!(matches!(result, Err(WorkerError::VmmApiError(_))));
    }

    #[tokio::test]
    async fn wait_for_ready_sees_existing_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("fc.sock");
        std::fs::write(&sock, b"").unwrap();

        let api = FirecrackerApi::new(sock.to_str().unwrap());
        assert!(api.wait_for_ready(Duration::from_millis(500)).await.is_ok());
    }

    #[tokio::test]
    async fn api_calls_fail_on_missing_socket() {
        let api = FirecrackerApi::new("/tmp/osbox-no-vmm.sock");
        assert!(api.pause().await.is_err());
        assert!(api.resume().await.is_err());
        assert!(api.create_snapshot("/s", "/m").await.is_err());
        assert!(api.load_snapshot("/s", "/m").await.is_err());
    }

    #[tokio::test]
    async fn call_round_trips_against_a_mock_vmm() {
        use std::io::{Read, Write};

        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("fc.sock");
        let listener = std::os::unix::net::UnixListener::bind(&sock).unwrap();

        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 2048];
            let n = conn.read(&mut buf).unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).into_owned();
            conn.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap();
            request
        });

        let api = FirecrackerApi::new(sock.to_str().unwrap());
        api.pause().await.unwrap();

        let request = server.join().unwrap();
        assert!(request.starts_with("PATCH /vm HTTP/1.1\r\n"));
        assert!(request.contains(r#"{"state":"Paused"}"#));
    }
}
