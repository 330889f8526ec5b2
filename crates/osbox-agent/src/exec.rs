use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;
use tracing::{debug, warn};

use crate::proto::{exec_event, ExecEvent, ExecRequest, ExecResponse, ExitEvent};

const CHUNK_SIZE: usize = 8192;
const DEFAULT_CWD: &str = "/workspace";
const KILL_GRACE: Duration = Duration::from_secs(5);

fn build_command(request: &ExecRequest) -> Result<Command, Status> {
    if request.argv.is_empty() {
        return Err(Status::invalid_argument("argv must not be empty"));
    }

    let mut cmd = Command::new(&request.argv[0]);
    if request.argv.len() > 1 {
        cmd.args(&request.argv[1..]);
    }

    let cwd = if request.cwd.is_empty() {
        DEFAULT_CWD
    } else {
        &request.cwd
    };
    cmd.current_dir(cwd);

    // Guest base env with HOME pinned to the workspace; caller vars appended.
    cmd.env("HOME", DEFAULT_CWD);
    for (key, value) in &request.env {
        cmd.env(key, value);
    }

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    // Own process group, so a deadline kill takes the whole tree down.
    #[cfg(unix)]
    cmd.process_group(0);

    Ok(cmd)
}

fn deadline_for(request: &ExecRequest) -> tokio::time::Instant {
    if request.timeout_seconds > 0 {
        tokio::time::Instant::now() + Duration::from_secs(request.timeout_seconds as u64)
    } else {
        tokio::time::Instant::now() + Duration::from_secs(365 * 24 * 3600)
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .unwrap_or_else(|| status.signal().map(|s| 128 + s).unwrap_or(-1))
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}

/// Kill the whole process group: SIGTERM, grace period, SIGKILL.
async fn kill_group(pid: u32, child: &mut Child) {
    #[cfg(unix)]
    {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
            warn!(pid, "process group ignored SIGTERM, sending SIGKILL");
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
            let _ = child.wait().await;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill().await;
    }
}

/// Run argv to completion and return the collected output. A non-zero exit
/// code is a normal response; only spawn failures are RPC errors.
pub async fn exec(request: ExecRequest) -> Result<ExecResponse, Status> {
    let mut cmd = build_command(&request)?;
    let mut child = cmd
        .spawn()
        .map_err(|e| Status::internal(format!("failed to spawn process: {e}")))?;
    let pid = child.id().unwrap_or(0);
    debug!(pid, argv = ?request.argv, "exec started");

    let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr was piped");
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let deadline = deadline_for(&request);
    let timed_out = tokio::select! {
        _ = child.wait() => false,
        _ = tokio::time::sleep_until(deadline) => {
            warn!(pid, timeout_seconds = request.timeout_seconds, "exec timed out, killing process group");
            kill_group(pid, &mut child).await;
            true
        }
    };

    let exit_code = if timed_out {
        -1
    } else {
        child.wait().await.map(exit_code_of).unwrap_or(-1)
    };

    Ok(ExecResponse {
        stdout: stdout_task.await.unwrap_or_default(),
        stderr: stderr_task.await.unwrap_or_default(),
        exit_code,
    })
}

/// Spawn a streaming exec; chunks as they arrive, exit code as the last event.
pub fn spawn_exec_stream(request: ExecRequest) -> ReceiverStream<Result<ExecEvent, Status>> {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(run_exec_stream(request, tx));
    ReceiverStream::new(rx)
}

async fn run_exec_stream(request: ExecRequest, tx: mpsc::Sender<Result<ExecEvent, Status>>) {
    let start = Instant::now();
    let mut seq: u64 = 0;

    let mut cmd = match build_command(&request) {
        Ok(cmd) => cmd,
        Err(status) => {
            let _ = tx.send(Err(status)).await;
            return;
        }
    };

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let _ = tx
                .send(Err(Status::internal(format!("failed to spawn process: {e}"))))
                .await;
            return;
        }
    };

    let pid = child.id().unwrap_or(0);
    debug!(pid, "spawned streaming exec");

    let mut stdout = child.stdout.take().expect("stdout was piped");
    let mut stderr = child.stderr.take().expect("stderr was piped");

    let deadline = deadline_for(&request);
    let timeout = tokio::time::sleep_until(deadline);
    tokio::pin!(timeout);

    let mut stdout_buf = [0u8; CHUNK_SIZE];
    let mut stderr_buf = [0u8; CHUNK_SIZE];
    let mut stdout_done = false;
    let mut stderr_done = false;
    let mut timed_out = false;

    loop {
        if stdout_done && stderr_done {
            break;
        }

        tokio::select! {
            result = stdout.read(&mut stdout_buf), if !stdout_done => {
                match result {
                    Ok(0) => stdout_done = true,
                    Ok(n) => {
                        seq += 1;
                        let event = ExecEvent {
                            seq,
                            event: Some(exec_event::Event::Stdout(stdout_buf[..n].to_vec())),
                        };
                        if tx.send(Ok(event)).await.is_err() {
                            kill_group(pid, &mut child).await;
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("stdout read error: {e}");
                        stdout_done = true;
                    }
                }
            }
            result = stderr.read(&mut stderr_buf), if !stderr_done => {
                match result {
                    Ok(0) => stderr_done = true,
                    Ok(n) => {
                        seq += 1;
                        let event = ExecEvent {
                            seq,
                            event: Some(exec_event::Event::Stderr(stderr_buf[..n].to_vec())),
                        };
                        if tx.send(Ok(event)).await.is_err() {
                            kill_group(pid, &mut child).await;
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("stderr read error: {e}");
                        stderr_done = true;
                    }
                }
            }
            _ = &mut timeout, if !timed_out => {
                timed_out = true;
                warn!(pid, timeout_seconds = request.timeout_seconds,
                    "streaming exec timed out, killing process group");
                kill_group(pid, &mut child).await;
                // Group death closes the pipes; the loop drains to EOF.
            }
        }
    }

    let exit_status = child.wait().await;
    let exit_code = if timed_out {
        -1
    } else {
        exit_status.map(exit_code_of).unwrap_or(-1)
    };

    seq += 1;
    let _ = tx
        .send(Ok(ExecEvent {
            seq,
            event: Some(exec_event::Event::Exit(ExitEvent {
                exit_code,
                duration_ms: start.elapsed().as_millis() as u64,
            })),
        }))
        .await;
}
