use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{ProcessesToUpdate, System};
use tracing::{info, warn};

use crate::checkpoint::{CheckpointInfo, LOCAL_SCHEME};
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::netpool::{tap_name_for, NetLease};
use crate::network;
use crate::registry::SessionRegistry;
use crate::sandbox::{Sandbox, SandboxSpec, SandboxStatus, SandboxTable};

/// What a sandbox directory left on NVMe amounts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirKind {
    /// mem.file + state.file + workspace.ext4: a full restorable snapshot.
    FullSnapshot,
    /// Only workspace.ext4: cold-restartable.
    WorkspaceOnly,
    /// Nothing usable.
    Empty,
}

pub fn classify_dir(dir: &Path) -> DirKind {
    let workspace = dir.join("workspace.ext4").is_file();
    if !workspace {
        return DirKind::Empty;
    }
    if dir.join("mem.file").is_file() && dir.join("state.file").is_file() {
        DirKind::FullSnapshot
    } else {
        DirKind::WorkspaceOnly
    }
}

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub processes_killed: usize,
    pub promoted_full: usize,
    pub promoted_workspace_only: usize,
    pub reconciled_stopped: usize,
}

/// Reconcile on-disk state with the session registry after an unclean exit.
pub async fn run(
    config: &WorkerConfig,
    sandboxes: &SandboxTable,
    registry: &Arc<dyn SessionRegistry>,
) -> Result<RecoveryReport, WorkerError> {
    let mut report = RecoveryReport::default();

    report.processes_killed = kill_stray_firecracker(&config.data_dir).await;

    let sandboxes_dir = config.sandboxes_dir();
    let mut seen = Vec::new();

    if Path::new(&sandboxes_dir).exists() {
        let mut entries = tokio::fs::read_dir(&sandboxes_dir)
            .await
            .map_err(|e| WorkerError::io(format!("reading {}", sandboxes_dir), e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WorkerError::io("reading sandbox entry", e))?
        {
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let sandbox_id = entry.file_name().to_string_lossy().into_owned();
            seen.push(sandbox_id.clone());

            // The previous worker's TAP may have survived it.
            network::delete_tap(&tap_name_for(&sandbox_id)).await;

            let dir = entry.path();
            match classify_dir(&dir) {
                DirKind::FullSnapshot => {
                    let info = local_checkpoint(&dir, true).await;
                    promote(config, sandboxes, registry, &sandbox_id, &dir, info).await;
                    report.promoted_full += 1;
                }
                DirKind::WorkspaceOnly => {
                    let info = local_checkpoint(&dir, false).await;
                    promote(config, sandboxes, registry, &sandbox_id, &dir, info).await;
                    report.promoted_workspace_only += 1;
                }
                DirKind::Empty => {
                    info!(sandbox_id = %sandbox_id, "sandbox directory unusable, removing");
                    let _ = tokio::fs::remove_dir_all(&dir).await;
                }
            }
        }
    }

    // Sessions the registry claims are running here, with no directory to
    // show for it, were lost with the crash.
    for record in registry.sessions_for_worker(&config.worker_id).await {
        if record.status == "running" && !seen.contains(&record.sandbox_id) {
            warn!(sandbox_id = %record.sandbox_id, "registry says running but no directory exists");
            registry
                .mark_stopped(&record.sandbox_id, "lost in worker crash: no sandbox directory")
                .await;
            report.reconciled_stopped += 1;
        }
    }

    info!(
        killed = report.processes_killed,
        full = report.promoted_full,
        workspace_only = report.promoted_workspace_only,
        stopped = report.reconciled_stopped,
        "crash recovery complete"
    );
    Ok(report)
}

/// Build a `local://` checkpoint for files already sitting on NVMe.
async fn local_checkpoint(dir: &Path, full: bool) -> CheckpointInfo {
    let key = |name: &str| format!("{}{}", LOCAL_SCHEME, dir.join(name).to_string_lossy());
    let mut size_bytes = 0u64;
    let names: &[&str] = if full {
        &["mem.file", "state.file", "workspace.ext4"]
    } else {
        &["workspace.ext4"]
    };
    for name in names {
        if let Ok(meta) = tokio::fs::metadata(dir.join(name)).await {
            size_bytes += meta.len();
        }
    }
    CheckpointInfo {
        mem_key: full.then(|| key("mem.file")),
        state_key: full.then(|| key("state.file")),
        workspace_key: key("workspace.ext4"),
        size_bytes,
        region: "local".to_string(),
    }
}

/// Register the synthetic snapshot, seed the local table as hibernated, and
/// tell the registry.
async fn promote(
    config: &WorkerConfig,
    sandboxes: &SandboxTable,
    registry: &Arc<dyn SessionRegistry>,
    sandbox_id: &str,
    dir: &Path,
    info: CheckpointInfo,
) {
    let record = registry.lookup(sandbox_id).await;
    let template = record
        .as_ref()
        .map(|r| r.template.clone())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "base".to_string());

    let net_slot = read_lease(dir).await.map(|lease| lease.slot);

    let mut sandbox = Sandbox::new(
        sandbox_id.to_string(),
        SandboxSpec {
            template,
            vcpu_count: 1,
            memory_mib: 512,
            disk_mib: 1024,
            env: Default::default(),
            allowed_hosts: vec![],
            port: 0,
            timeout: config.default_timeout,
            hibernation_enabled: true,
        },
    );
    sandbox.status = SandboxStatus::Hibernated;
    sandbox.net_slot = net_slot;
    sandbox.checkpoint = Some(info.clone());

    if let Err(e) = sandboxes.insert(sandbox).await {
        warn!(sandbox_id = %sandbox_id, error = %e, "failed to seed recovered sandbox");
        return;
    }
    registry.mark_hibernated(sandbox_id, &info).await;
    info!(
        sandbox_id = %sandbox_id,
        full = info.is_full(),
        "promoted crashed sandbox to hibernated"
    );
}

async fn read_lease(dir: &Path) -> Option<NetLease> {
    let bytes = tokio::fs::read(dir.join("net.json")).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Kill Firecracker processes left over from an unclean exit. Ours are
/// recognizable by the data directory in their argument list.
async fn kill_stray_firecracker(data_dir: &str) -> usize {
    let data_dir = data_dir.to_string();
    tokio::task::spawn_blocking(move || {
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);

        let mut killed = 0;
        for process in sys.processes().values() {
            let name = process.name().to_string_lossy();
            if name != "firecracker" {
                continue;
            }
            let ours = process
                .cmd()
                .iter()
                .any(|arg| arg.to_string_lossy().contains(&data_dir));
            if !ours {
                continue;
            }
            warn!(pid = process.pid().as_u32(), "killing stray firecracker process");
            if process.kill() {
                killed += 1;
            }
        }
        killed
    })
    .await
    .unwrap_or(0)
}

/// Wait a moment for killed processes to release their sockets.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}
