use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::process::Command;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{watch, RwLock};
use tonic::Status;
use tracing::{debug, info, warn};

use crate::vsock::{DataListener, DATA_PORT_MAX, DATA_PORT_MIN};

const CHUNK_SIZE: usize = 8192;
const MAX_SESSIONS: usize = 16;
const BIND_ATTEMPTS: u32 = 64;
const DEFAULT_SHELL: &str = "/bin/sh";
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);

/// Wrapper around the PTY master fd that can cross task boundaries.
struct MasterFd {
    fd: OwnedFd,
}

// SAFETY: the fd is only used through short read/write calls in
// spawn_blocking; the kernel serializes access to the PTY.
unsafe impl Send for MasterFd {}
unsafe impl Sync for MasterFd {}

impl AsRawFd for MasterFd {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.fd.as_raw_fd()
    }
}

struct PtySession {
    id: String,
    child_pid: u32,
    data_port: u32,
    master: MasterFd,
    /// Flipping this tells both byte pumps (and a pending accept) to stop.
    shutdown: watch::Sender<bool>,
}

/// Owns every PTY session in the guest. Each session holds exactly one vsock
/// data port, freed when the session dies.
pub struct PtyManager {
    sessions: RwLock<HashMap<String, Arc<PtySession>>>,
    next_id: AtomicU64,
    next_port: AtomicU32,
}

impl Default for PtyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PtyManager {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_port: AtomicU32::new(0),
        }
    }

    /// Allocate a PTY running `shell`, sized `cols`×`rows`. The data port is
    /// bound (and therefore accepting) before this returns; a bind failure
    /// rolls everything back, leaving no process and no session.
    pub async fn create(
        self: &Arc<Self>,
        cols: u32,
        rows: u32,
        shell: &str,
    ) -> Result<(String, u32), Status> {
        if self.sessions.read().await.len() >= MAX_SESSIONS {
            return Err(Status::resource_exhausted(format!(
                "maximum {MAX_SESSIONS} concurrent PTY sessions reached"
            )));
        }

        let shell = if shell.is_empty() { DEFAULT_SHELL } else { shell };
        let (master, child_pid) = spawn_shell(shell, cols, rows)?;

        // Listener before reply: the host may connect the moment it learns
        // the port.
        let (listener, data_port) = match self.bind_data_port().await {
            Ok(bound) => bound,
            Err(e) => {
                kill_session_process(child_pid).await;
                return Err(e);
            }
        };

        let id_num = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session_id = format!("pty_{id_num:04}");
        let (shutdown, _) = watch::channel(false);

        let session = Arc::new(PtySession {
            id: session_id.clone(),
            child_pid,
            data_port,
            master: MasterFd { fd: master },
            shutdown,
        });
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), Arc::clone(&session));

        let manager = Arc::clone(self);
        tokio::spawn(run_session(manager, session, listener));

        info!(session_id = %session_id, child_pid, data_port, shell, "PTY session created");
        Ok((session_id, data_port))
    }

    async fn bind_data_port(&self) -> Result<(DataListener, u32), Status> {
        let span = DATA_PORT_MAX - DATA_PORT_MIN;
        for _ in 0..BIND_ATTEMPTS {
            let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % span;
            let port = DATA_PORT_MIN + offset;
            match DataListener::bind(port).await {
                Ok(listener) => return Ok((listener, port)),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
                Err(e) => {
                    return Err(Status::internal(format!("binding data port {port}: {e}")))
                }
            }
        }
        Err(Status::resource_exhausted(
            "no free PTY data port".to_string(),
        ))
    }

    pub async fn resize(&self, session_id: &str, cols: u32, rows: u32) -> Result<(), Status> {
        let session = self.get(session_id).await?;
        let winsize = libc::winsize {
            ws_row: rows as u16,
            ws_col: cols as u16,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: master fd is valid for the session's lifetime.
        let rc = unsafe {
            libc::ioctl(session.master.as_raw_fd(), libc::TIOCSWINSZ, &winsize)
        };
        if rc != 0 {
            return Err(Status::internal(format!(
                "TIOCSWINSZ failed: {}",
                io::Error::last_os_error()
            )));
        }
        debug!(session_id, cols, rows, "PTY resized");
        Ok(())
    }

    /// Terminate a session: signal the shell's process group, stop the pumps,
    /// free the data port.
    pub async fn kill(&self, session_id: &str) -> Result<(), Status> {
        let session = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| Status::not_found(format!("PTY session {session_id} not found")))?;

        let _ = session.shutdown.send(true);
        kill_session_process(session.child_pid).await;
        info!(session_id = %session.id, "PTY session killed");
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Arc<PtySession>, Status> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("PTY session {session_id} not found")))
    }

    /// Reap sessions whose shell died on its own (guest exit without
    /// PtyKill). Returns the ids that were collected.
    pub async fn reap_dead(&self) -> Vec<String> {
        let candidates: Vec<Arc<PtySession>> =
            self.sessions.read().await.values().cloned().collect();

        let mut reaped = Vec::new();
        for session in candidates {
            if process_alive(session.child_pid) {
                continue;
            }
            warn!(session_id = %session.id, "reaping PTY session with dead shell");
            // Collect the zombie.
            unsafe {
                libc::waitpid(session.child_pid as i32, std::ptr::null_mut(), libc::WNOHANG);
            }
            let _ = session.shutdown.send(true);
            self.sessions.write().await.remove(&session.id);
            reaped.push(session.id.clone());
        }
        reaped
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Background watchdog that reaps zombie PTY sessions.
pub async fn run_watchdog(manager: Arc<PtyManager>) {
    let mut interval = tokio::time::interval(WATCHDOG_INTERVAL);
    loop {
        interval.tick().await;
        manager.reap_dead().await;
    }
}

fn process_alive(pid: u32) -> bool {
    let rc = unsafe { libc::waitpid(pid as i32, std::ptr::null_mut(), libc::WNOHANG) };
    // 0 = still running; pid = just reaped; -1 = gone (or never ours).
    rc == 0
}

/// Spawn a shell attached to a fresh PTY sized cols×rows.
/// Returns (master fd, child pid).
fn spawn_shell(shell: &str, cols: u32, rows: u32) -> Result<(OwnedFd, u32), Status> {
    let winsize = nix::pty::Winsize {
        ws_row: rows as u16,
        ws_col: cols as u16,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let pty = nix::pty::openpty(Some(&winsize), None)
        .map_err(|e| Status::internal(format!("openpty failed: {e}")))?;

    let slave_raw = pty.slave.as_raw_fd();

    let mut cmd = Command::new(shell);
    cmd.env("TERM", "xterm");
    cmd.env("HOME", "/workspace");
    cmd.current_dir("/workspace");

    unsafe {
        use std::os::unix::process::CommandExt;
        cmd.pre_exec(move || {
            // New session with the slave as controlling terminal.
            libc::setsid();
            libc::ioctl(slave_raw, libc::TIOCSCTTY as _, 0);

            libc::dup2(slave_raw, 0);
            libc::dup2(slave_raw, 1);
            libc::dup2(slave_raw, 2);
            if slave_raw > 2 {
                libc::close(slave_raw);
            }
            Ok(())
        });
    }

    let child = cmd
        .spawn()
        .map_err(|e| Status::internal(format!("failed to spawn shell: {e}")))?;
    let child_pid = child.id();

    // Child has its own copy of the slave.
    drop(pty.slave);

    // Non-blocking master for the read pump.
    {
        use nix::fcntl::{fcntl, FcntlArg, OFlag};
        let flags = fcntl(pty.master.as_raw_fd(), FcntlArg::F_GETFL)
            .map_err(|e| Status::internal(format!("fcntl F_GETFL failed: {e}")))?;
        fcntl(
            pty.master.as_raw_fd(),
            FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
        )
        .map_err(|e| Status::internal(format!("fcntl F_SETFL failed: {e}")))?;
    }

    // The process is managed by pid/signals; the handle would double-reap.
    std::mem::forget(child);

    Ok((pty.master, child_pid))
}

/// SIGHUP the process group, wait up to 5 seconds, then SIGKILL.
async fn kill_session_process(pid: u32) {
    let pid = pid as i32;
    unsafe {
        libc::kill(-pid, libc::SIGHUP);
    }

    tokio::task::spawn_blocking(move || {
        let start = Instant::now();
        loop {
            let rc = unsafe { libc::waitpid(pid, std::ptr::null_mut(), libc::WNOHANG) };
            if rc != 0 {
                return;
            }
            if start.elapsed() > Duration::from_secs(5) {
                warn!(pid, "PTY shell ignored SIGHUP, sending SIGKILL");
                unsafe {
                    libc::kill(-pid, libc::SIGKILL);
                    libc::waitpid(pid, std::ptr::null_mut(), 0);
                }
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    })
    .await
    .ok();
}

/// Accept the (single) data connection, then run the two byte pumps until
/// either side or the shutdown signal ends the session. Sockets are closed
/// explicitly after the child is waited on, never left to process exit.
async fn run_session(
    manager: Arc<PtyManager>,
    session: Arc<PtySession>,
    mut listener: DataListener,
) {
    let mut shutdown_rx = session.shutdown.subscribe();

    let stream = tokio::select! {
        accepted = listener.accept() => match accepted {
            Ok(stream) => stream,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "data port accept failed");
                manager.sessions.write().await.remove(&session.id);
                kill_session_process(session.child_pid).await;
                return;
            }
        },
        _ = shutdown_rx.changed() => {
            // Killed before the host ever connected; listener drops here.
            return;
        }
    };

    debug!(session_id = %session.id, port = session.data_port, "data connection accepted");
    pump(&session, stream).await;

    // Normal end of session: shell exited or host hung up.
    if manager.sessions.write().await.remove(&session.id).is_some() {
        kill_session_process(session.child_pid).await;
        info!(session_id = %session.id, "PTY session ended");
    }
}

/// Two independent byte pumps with a shared shutdown signal.
async fn pump(session: &Arc<PtySession>, stream: Box<dyn crate::vsock::DataIo>) {
    let (mut sock_rd, mut sock_wr) = tokio::io::split(stream);
    let master_raw = session.master.as_raw_fd();
    let shutdown_tx = session.shutdown.clone();
    let mut shutdown_a = session.shutdown.subscribe();
    let mut shutdown_b = session.shutdown.subscribe();

    // PTY master → socket.
    let shutdown_from_a = shutdown_tx.clone();
    let master_to_sock = async move {
        loop {
            if *shutdown_a.borrow() {
                break;
            }
            let read = tokio::task::spawn_blocking(move || {
                let mut buf = [0u8; CHUNK_SIZE];
                let mut file = unsafe { std::fs::File::from_raw_fd(master_raw) };
                let result = file.read(&mut buf);
                std::mem::forget(file);
                match result {
                    Ok(n) => Ok(buf[..n].to_vec()),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Vec::new()),
                    Err(e) => Err(e),
                }
            })
            .await;

            match read {
                Ok(Ok(data)) if data.is_empty() => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                        _ = shutdown_a.changed() => break,
                    }
                }
                Ok(Ok(data)) => {
                    if sock_wr.write_all(&data).await.is_err() {
                        break;
                    }
                }
                // EIO: every slave closed, the shell is gone.
                Ok(Err(_)) | Err(_) => break,
            }
        }
        let _ = shutdown_from_a.send(true);
        let _ = sock_wr.shutdown().await;
    };

    // Socket → PTY master.
    let shutdown_from_b = shutdown_tx.clone();
    let sock_to_master = async move {
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            let n = tokio::select! {
                read = sock_rd.read(&mut buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                },
                _ = shutdown_b.changed() => break,
            };
            let data = buf[..n].to_vec();
            let wrote = tokio::task::spawn_blocking(move || {
                let mut file = unsafe { std::fs::File::from_raw_fd(master_raw) };
                let result = file.write_all(&data);
                std::mem::forget(file);
                result
            })
            .await;
            if !matches!(wrote, Ok(Ok(()))) {
                break;
            }
        }
        let _ = shutdown_from_b.send(true);
    };

    tokio::join!(master_to_sock, sock_to_master);
}
