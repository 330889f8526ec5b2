use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::agent_client;
use crate::checkpoint::{CheckpointInfo, CheckpointStore, SnapshotFiles};
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::events::{self, EventSender, WorkerEvent};
use crate::id;
use crate::netpool::NetworkPool;
use crate::provision;
use crate::proxy::ca::CertAuthority;
use crate::proxy::session::{ProxySession, SessionMap};
use crate::sandbox::{SandboxStatus, SandboxTable};
use crate::supervisor::Supervisor;

/// How long a caller waits for the pause→snapshot→handoff section before
/// giving up. The section itself keeps running; once the VM is paused it is
/// never cancelled mid-flight, so the sandbox always settles in `running` or
/// `hibernated`.
const HIBERNATE_TIMEOUT: Duration = Duration::from_secs(120);

/// Where a woken sandbox can be reached.
#[derive(Debug, Clone)]
pub struct ConnectCoords {
    pub endpoint: String,
    pub token: String,
}

/// Drives pause → snapshot → upload, and the reverse.
pub struct HibernationEngine {
    config: Arc<WorkerConfig>,
    supervisor: Arc<Supervisor>,
    store: Arc<CheckpointStore>,
    sandboxes: Arc<SandboxTable>,
    sessions: Arc<SessionMap>,
    pool: Arc<NetworkPool>,
    ca: Arc<CertAuthority>,
    events: EventSender,
}

impl HibernationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<WorkerConfig>,
        supervisor: Arc<Supervisor>,
        store: Arc<CheckpointStore>,
        sandboxes: Arc<SandboxTable>,
        sessions: Arc<SessionMap>,
        pool: Arc<NetworkPool>,
        ca: Arc<CertAuthority>,
        events: EventSender,
    ) -> Self {
        Self {
            config,
            supervisor,
            store,
            sandboxes,
            sessions,
            pool,
            ca,
            events,
        }
    }

    /// Hibernate a running sandbox.
    ///
    /// With `wait` the returned info carries the uploaded object keys; without
    /// it the call returns as soon as the snapshot files are on NVMe and the
    /// upload completion is announced through `OnHibernate`.
    pub async fn hibernate(
        &self,
        sandbox_id: &str,
        wait: bool,
    ) -> Result<CheckpointInfo, WorkerError> {
        match self.sandboxes.status(sandbox_id).await? {
            SandboxStatus::Running => {}
            SandboxStatus::Hibernated | SandboxStatus::Hibernating => {
                return Err(WorkerError::SandboxAlreadyHibernated(sandbox_id.to_string()))
            }
            other => {
                return Err(WorkerError::SandboxNotRunning {
                    id: sandbox_id.to_string(),
                    status: other.to_string(),
                })
            }
        }
        self.sandboxes
            .transition(sandbox_id, SandboxStatus::Hibernating)
            .await?;

        // The critical section runs in its own task: a caller dropping this
        // future must not leave the VM paused halfway through a snapshot.
        let this = self.clone_parts();
        let id = sandbox_id.to_string();
        let handle = tokio::spawn(async move { this.hibernate_critical(&id, wait).await });

        match tokio::time::timeout(HIBERNATE_TIMEOUT, handle).await {
            Ok(joined) => joined
                .map_err(|e| WorkerError::SnapshotFailed(format!("hibernate task: {}", e)))?,
            Err(_) => Err(WorkerError::SnapshotFailed(format!(
                "hibernate of {} still in flight after {:?}",
                sandbox_id, HIBERNATE_TIMEOUT
            ))),
        }
    }

    fn clone_parts(&self) -> Arc<EngineInner> {
        Arc::new(EngineInner {
            config: Arc::clone(&self.config),
            supervisor: Arc::clone(&self.supervisor),
            store: Arc::clone(&self.store),
            sandboxes: Arc::clone(&self.sandboxes),
            sessions: Arc::clone(&self.sessions),
            events: self.events.clone(),
        })
    }

    /// Wake a hibernated sandbox: full restore when memory+state exist,
    /// cold boot from the workspace otherwise. Waking an already-running
    /// sandbox returns fresh coordinates without side effects.
    pub async fn wake(
        &self,
        sandbox_id: &str,
        timeout: Option<Duration>,
    ) -> Result<ConnectCoords, WorkerError> {
        match self.sandboxes.status(sandbox_id).await? {
            SandboxStatus::Running => return Ok(self.coords()),
            SandboxStatus::Hibernated => {}
            other => {
                return Err(WorkerError::SandboxNotRunning {
                    id: sandbox_id.to_string(),
                    status: other.to_string(),
                })
            }
        }

        let (checkpoint, slot) = self
            .sandboxes
            .with(sandbox_id, |sb| (sb.checkpoint.clone(), sb.net_slot))
            .await?;
        let checkpoint =
            checkpoint.ok_or_else(|| WorkerError::SnapshotMissing(sandbox_id.to_string()))?;

        self.sandboxes
            .transition(sandbox_id, SandboxStatus::Waking)
            .await?;

        match self.wake_inner(sandbox_id, &checkpoint, slot).await {
            Ok(()) => {
                self.sandboxes
                    .transition(sandbox_id, SandboxStatus::Running)
                    .await?;
                let timeout = match timeout {
                    Some(t) => t,
                    None => self.sandboxes.with(sandbox_id, |sb| sb.spec.timeout).await?,
                };
                self.sandboxes
                    .update(sandbox_id, |sb| sb.reset_deadline(timeout))
                    .await?;
                info!(sandbox_id = %sandbox_id, "sandbox awake");
                Ok(self.coords())
            }
            Err(e) => {
                error!(sandbox_id = %sandbox_id, error = %e, "wake failed");
                let _ = self
                    .sandboxes
                    .transition(sandbox_id, SandboxStatus::Hibernated)
                    .await;
                Err(e)
            }
        }
    }

    async fn wake_inner(
        &self,
        sandbox_id: &str,
        checkpoint: &CheckpointInfo,
        slot: Option<u16>,
    ) -> Result<(), WorkerError> {
        let paths = self.store.get_snapshot(sandbox_id, checkpoint).await?;

        // A restored VM keeps its in-memory network state, so a full restore
        // must get the exact TAP/IP/CID back. A cold boot only prefers it.
        let lease = match slot {
            Some(slot) => self.pool.reclaim(slot, sandbox_id)?,
            None if !checkpoint.is_full() => self.pool.allocate(sandbox_id)?,
            None => {
                return Err(WorkerError::SnapshotMissing(format!(
                    "{} (network lease unknown)",
                    sandbox_id
                )))
            }
        };

        let sandbox_dir = self.config.sandbox_dir(sandbox_id);
        let workspace_path = format!("{}/workspace.ext4", sandbox_dir);
        tokio::fs::create_dir_all(&sandbox_dir)
            .await
            .map_err(|e| WorkerError::io(format!("creating {}", sandbox_dir), e))?;

        // A snapshot served from the cache has to land where the VM's drive
        // config expects it; local snapshots are already in place.
        if paths.workspace_path != std::path::Path::new(&workspace_path) {
            tokio::fs::copy(&paths.workspace_path, &workspace_path)
                .await
                .map_err(|e| WorkerError::io("placing workspace image", e))?;
        }

        let result = if checkpoint.is_full() {
            let mem = paths.mem_path.as_ref().unwrap().to_string_lossy().into_owned();
            let state = paths.state_path.as_ref().unwrap().to_string_lossy().into_owned();

            // Uncancelable from here: load-snapshot must run to completion.
            let supervisor = Arc::clone(&self.supervisor);
            let id = sandbox_id.to_string();
            let lease_clone = lease.clone();
            let handle = tokio::spawn(async move {
                supervisor
                    .boot_from_snapshot(&id, lease_clone, &mem, &state)
                    .await
            });
            handle
                .await
                .map_err(|e| WorkerError::SnapshotFailed(format!("wake task: {}", e)))?
                .map(|_| ())
        } else {
            self.cold_boot(sandbox_id, lease.clone(), &workspace_path).await
        };

        if let Err(e) = result {
            // boot paths release the lease themselves on failure
            return Err(e);
        }

        // The proxy session died with the old VM; the guest's tokens did not.
        self.restore_proxy_session(sandbox_id, &lease.guest_ip).await?;
        self.sandboxes
            .update(sandbox_id, |sb| {
                sb.net_slot = Some(lease.slot);
                sb.guest_ip = Some(lease.guest_ip.clone());
            })
            .await?;
        Ok(())
    }

    async fn cold_boot(
        &self,
        sandbox_id: &str,
        lease: crate::netpool::NetLease,
        workspace_path: &str,
    ) -> Result<(), WorkerError> {
        let (template, vcpu, memory, guest_env) = self
            .sandboxes
            .with(sandbox_id, |sb| {
                (
                    sb.spec.template.clone(),
                    sb.spec.vcpu_count,
                    sb.spec.memory_mib,
                    sb.guest_env.clone(),
                )
            })
            .await?;

        // Fresh rootfs; the workspace image carries the state that matters.
        let sandbox_dir = self.config.sandbox_dir(sandbox_id);
        let base = provision::resolve_template(&self.config.images_dir(), &template)?;
        let rootfs_path = format!("{}/rootfs.ext4", sandbox_dir);
        let _ = tokio::fs::remove_file(&rootfs_path).await;
        let output = tokio::process::Command::new("cp")
            .arg("--reflink=auto")
            .arg(base.as_os_str())
            .arg(&rootfs_path)
            .output()
            .await
            .map_err(|e| WorkerError::io("cloning rootfs for cold boot", e))?;
        if !output.status.success() {
            return Err(WorkerError::io(
                format!("cp rootfs: {}", String::from_utf8_lossy(&output.stderr).trim()),
                std::io::Error::new(std::io::ErrorKind::Other, "cp failed"),
            ));
        }

        self.supervisor
            .boot_with_lease(sandbox_id, vcpu, memory, &rootfs_path, workspace_path, lease)
            .await?;

        // Fresh rootfs means the sealed env and CA are gone; reseed them.
        if let Err(e) = agent_client::seed_guest(
            &self.supervisor.vsock_path(sandbox_id),
            &guest_env,
            self.ca.ca_pem(),
        )
        .await
        {
            let _ = self.supervisor.kill(sandbox_id).await;
            return Err(e);
        }
        Ok(())
    }

    async fn restore_proxy_session(
        &self,
        sandbox_id: &str,
        guest_ip: &str,
    ) -> Result<(), WorkerError> {
        let (env, guest_env, allowed_hosts) = self
            .sandboxes
            .with(sandbox_id, |sb| {
                (
                    sb.spec.env.clone(),
                    sb.guest_env.clone(),
                    sb.spec.allowed_hosts.clone(),
                )
            })
            .await?;

        // token -> real value, from the same tokens the guest already holds.
        let mut substitutions = HashMap::new();
        for (key, real) in &env {
            if let Some(token) = guest_env.get(key) {
                substitutions.insert(token.clone(), real.clone());
            }
        }

        self.sessions.insert(
            guest_ip,
            ProxySession {
                sandbox_id: sandbox_id.to_string(),
                substitutions,
                allowed_hosts,
            },
        );
        Ok(())
    }

    /// Kill a sandbox in any state: terminate the VM if one exists, release
    /// all resources, drop its snapshots, mark it stopped.
    pub async fn kill(&self, sandbox_id: &str, reason: &str) -> Result<(), WorkerError> {
        info!(sandbox_id = %sandbox_id, reason = %reason, "killing sandbox");

        if let Some(guest_ip) = self
            .sandboxes
            .with(sandbox_id, |sb| sb.guest_ip.clone())
            .await?
        {
            self.sessions.remove(&guest_ip);
        }

        if self.supervisor.has_vm(sandbox_id).await {
            self.supervisor.kill(sandbox_id).await?;
        }

        let _ = provision::cleanup(&self.config.sandbox_dir(sandbox_id)).await;
        self.store.delete_all(sandbox_id).await;

        let _ = self
            .sandboxes
            .update(sandbox_id, |sb| sb.status = SandboxStatus::Stopped)
            .await;

        events::emit(
            &self.events,
            WorkerEvent::Killed {
                sandbox_id: sandbox_id.to_string(),
                reason: reason.to_string(),
            },
        );
        Ok(())
    }

    /// Periodic crash-consistent backup of running sandboxes' workspaces:
    /// fsync, copy, upload the copy.
    pub async fn run_autosaver(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            for sandbox_id in self
                .sandboxes
                .ids_with_status(SandboxStatus::Running)
                .await
            {
                if let Err(e) = self.autosave(&sandbox_id).await {
                    warn!(sandbox_id = %sandbox_id, error = %e, "workspace autosave failed");
                }
            }
        }
    }

    async fn autosave(&self, sandbox_id: &str) -> Result<(), WorkerError> {
        let sandbox_dir = self.config.sandbox_dir(sandbox_id);
        let workspace = format!("{}/workspace.ext4", sandbox_dir);
        let copy = format!("{}/workspace.autosave.ext4", sandbox_dir);

        fsync_file(&workspace).await?;
        tokio::fs::copy(&workspace, &copy)
            .await
            .map_err(|e| WorkerError::io("copying workspace for autosave", e))?;

        let epoch = unix_epoch_secs();
        let result = self
            .store
            .put_workspace_only(sandbox_id, epoch, &copy)
            .await;
        let _ = tokio::fs::remove_file(&copy).await;
        result?;
        Ok(())
    }

    fn coords(&self) -> ConnectCoords {
        ConnectCoords {
            endpoint: self.config.endpoint.clone(),
            token: id::generate_token(),
        }
    }
}

/// The subset of the engine the detached hibernate task needs.
struct EngineInner {
    config: Arc<WorkerConfig>,
    supervisor: Arc<Supervisor>,
    store: Arc<CheckpointStore>,
    sandboxes: Arc<SandboxTable>,
    sessions: Arc<SessionMap>,
    events: EventSender,
}

impl EngineInner {
    async fn hibernate_critical(
        self: &Arc<Self>,
        sandbox_id: &str,
        wait: bool,
    ) -> Result<CheckpointInfo, WorkerError> {
        let sandbox_dir = self.config.sandbox_dir(sandbox_id);
        let mem_path = format!("{}/mem.file", sandbox_dir);
        let state_path = format!("{}/state.file", sandbox_dir);
        let workspace_path = format!("{}/workspace.ext4", sandbox_dir);

        if let Err(e) = self.supervisor.pause(sandbox_id).await {
            // Nothing happened yet; the sandbox goes straight back to running.
            let _ = self
                .sandboxes
                .transition(sandbox_id, crate::sandbox::SandboxStatus::Running)
                .await;
            return Err(e);
        }

        let snapshot_result = async {
            self.supervisor
                .create_snapshot(sandbox_id, &mem_path, &state_path)
                .await?;
            fsync_file(&workspace_path).await?;
            Ok::<(), WorkerError>(())
        }
        .await;

        if let Err(e) = snapshot_result {
            warn!(sandbox_id = %sandbox_id, error = %e, "hibernate rolled back, resuming VM");
            let _ = self.supervisor.resume(sandbox_id).await;
            let _ = self
                .sandboxes
                .transition(sandbox_id, crate::sandbox::SandboxStatus::Running)
                .await;
            return Err(e);
        }

        // Files are on NVMe: from here the sandbox is hibernated and the
        // upload races in the background.
        let epoch = unix_epoch_secs();
        let files = SnapshotFiles {
            mem_path: Some(mem_path.clone()),
            state_path: Some(state_path.clone()),
            workspace_path: workspace_path.clone(),
        };
        let upload_rx = self
            .store
            .spawn_put_snapshot(sandbox_id.to_string(), epoch, files)
            .await;

        // Remember the lease before the VM (and its bookkeeping) goes away.
        let lease = self.supervisor.lease_of(sandbox_id).await;
        if let Some(guest_ip) = lease.as_ref().map(|l| l.guest_ip.clone()) {
            self.sessions.remove(&guest_ip);
        }

        // Local-file info, valid before (and without) object storage.
        let local_info = CheckpointInfo {
            mem_key: Some(format!("local://{}", mem_path)),
            state_key: Some(format!("local://{}", state_path)),
            workspace_key: format!("local://{}", workspace_path),
            size_bytes: file_sizes(&[&mem_path, &state_path, &workspace_path]).await,
            region: "local".to_string(),
        };
        self.sandboxes
            .update(sandbox_id, |sb| {
                sb.net_slot = lease.as_ref().map(|l| l.slot);
                sb.checkpoint = Some(local_info.clone());
            })
            .await?;
        self.sandboxes
            .transition(sandbox_id, crate::sandbox::SandboxStatus::Hibernated)
            .await?;

        self.supervisor.kill(sandbox_id).await?;
        info!(sandbox_id = %sandbox_id, epoch, "sandbox hibernated, upload in flight");

        if wait {
            let info = self.await_upload(sandbox_id, upload_rx).await?;
            Ok(info)
        } else {
            let inner = Arc::clone(self);
            let id = sandbox_id.to_string();
            tokio::spawn(async move {
                let _ = inner.await_upload(&id, upload_rx).await;
            });
            Ok(local_info)
        }
    }

    /// Wait for the upload, record the durable keys, fire `OnHibernate`.
    async fn await_upload(
        &self,
        sandbox_id: &str,
        rx: oneshot::Receiver<Result<CheckpointInfo, WorkerError>>,
    ) -> Result<CheckpointInfo, WorkerError> {
        let info = rx
            .await
            .map_err(|_| WorkerError::UploadFailed("upload task dropped".to_string()))??;

        // Keep the durable keys unless the sandbox moved on (woke) meanwhile.
        let _ = self
            .sandboxes
            .update(sandbox_id, |sb| {
                if sb.status == crate::sandbox::SandboxStatus::Hibernated {
                    sb.checkpoint = Some(info.clone());
                }
            })
            .await;

        events::emit(
            &self.events,
            WorkerEvent::Hibernated {
                sandbox_id: sandbox_id.to_string(),
                checkpoint: info.clone(),
            },
        );
        Ok(info)
    }
}

async fn fsync_file(path: &str) -> Result<(), WorkerError> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| WorkerError::io(format!("opening {} for fsync", path), e))?;
    file.sync_all()
        .await
        .map_err(|e| WorkerError::io(format!("fsync {}", path), e))
}

async fn file_sizes(paths: &[&str]) -> u64 {
    let mut total = 0;
    for path in paths {
        if let Ok(meta) = tokio::fs::metadata(path).await {
            total += meta.len();
        }
    }
    total
}

fn unix_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
