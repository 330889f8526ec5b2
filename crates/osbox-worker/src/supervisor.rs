use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::agent_client::AgentClient;
use crate::config::{VmConfig, WorkerConfig};
use crate::error::WorkerError;
use crate::events::{self, EventSender, WorkerEvent};
use crate::firecracker::{FirecrackerApi, FirecrackerVm};
use crate::netpool::{NetLease, NetworkPool};
use crate::network;

/// How long the agent gets to answer its first Ping after boot.
const BOOT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the Firecracker API socket gets to appear after spawn.
const API_READY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Booting,
    Running,
    Paused,
    Snapshotting,
    Failed,
    Exited,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmState::Booting => "booting",
            VmState::Running => "running",
            VmState::Paused => "paused",
            VmState::Snapshotting => "snapshotting",
            VmState::Failed => "failed",
            VmState::Exited => "exited",
        };
        write!(f, "{}", s)
    }
}

/// The live Firecracker process and its host resources. Exclusively owned by
/// the supervisor; everyone else looks it up by sandbox id.
pub struct VmInstance {
    pub sandbox_id: String,
    pub state: VmState,
    pub lease: NetLease,
    pub vsock_path: String,
    pub api: FirecrackerApi,
    vm: Option<FirecrackerVm>,
}

/// Owns every Firecracker process on this worker. Operations on one VM
/// serialize through that VM's mutex; different VMs proceed in parallel.
pub struct Supervisor {
    config: Arc<WorkerConfig>,
    pool: Arc<NetworkPool>,
    events: EventSender,
    vms: RwLock<HashMap<String, Arc<Mutex<VmInstance>>>>,
}

impl Supervisor {
    pub fn new(config: Arc<WorkerConfig>, pool: Arc<NetworkPool>, events: EventSender) -> Self {
        Self {
            config,
            pool,
            events,
            vms: RwLock::new(HashMap::new()),
        }
    }

    pub async fn has_vm(&self, sandbox_id: &str) -> bool {
        self.vms.read().await.contains_key(sandbox_id)
    }

    pub async fn lease_of(&self, sandbox_id: &str) -> Option<NetLease> {
        let vms = self.vms.read().await;
        let instance = vms.get(sandbox_id)?;
        let lease = instance.lock().await.lease.clone();
        Some(lease)
    }

    pub fn vsock_path(&self, sandbox_id: &str) -> String {
        format!("{}/vsock.sock", self.config.sandbox_dir(sandbox_id))
    }

    pub fn api_socket_path(&self, sandbox_id: &str) -> String {
        format!("{}/fc.sock", self.config.sandbox_dir(sandbox_id))
    }

    /// Cold-boot a VM: allocate TAP/IP/CID, write the machine config, spawn
    /// Firecracker, and wait for the agent to answer Ping. Returns the lease
    /// on success; every resource is released on failure.
    pub async fn boot(
        &self,
        sandbox_id: &str,
        vcpu_count: u32,
        memory_mib: u32,
        rootfs_path: &str,
        workspace_path: &str,
    ) -> Result<NetLease, WorkerError> {
        let lease = self.pool.allocate(sandbox_id)?;
        self.boot_with_lease(sandbox_id, vcpu_count, memory_mib, rootfs_path, workspace_path, lease)
            .await
    }

    /// Cold-boot with a pre-reserved lease (wake path: the sandbox's prior
    /// network identity must be reused).
    pub async fn boot_with_lease(
        &self,
        sandbox_id: &str,
        vcpu_count: u32,
        memory_mib: u32,
        rootfs_path: &str,
        workspace_path: &str,
        lease: NetLease,
    ) -> Result<NetLease, WorkerError> {
        let instance = self.insert_booting(sandbox_id, &lease).await?;

        let result = self
            .cold_boot_inner(sandbox_id, vcpu_count, memory_mib, rootfs_path, workspace_path, &lease, &instance)
            .await;

        match result {
            Ok(()) => {
                instance.lock().await.state = VmState::Running;
                info!(sandbox_id = %sandbox_id, guest_ip = %lease.guest_ip, "VM running");
                Ok(lease)
            }
            Err(e) => {
                error!(sandbox_id = %sandbox_id, error = %e, "boot failed");
                self.fail_boot(sandbox_id, &instance, &lease).await;
                Err(e)
            }
        }
    }

    async fn cold_boot_inner(
        &self,
        sandbox_id: &str,
        vcpu_count: u32,
        memory_mib: u32,
        rootfs_path: &str,
        workspace_path: &str,
        lease: &NetLease,
        instance: &Arc<Mutex<VmInstance>>,
    ) -> Result<(), WorkerError> {
        network::setup(sandbox_id, lease).await?;

        let sandbox_dir = self.config.sandbox_dir(sandbox_id);
        let config_path = format!("{}/config.json", sandbox_dir);
        let api_socket_path = self.api_socket_path(sandbox_id);
        let vsock_path = self.vsock_path(sandbox_id);

        let vm_config = VmConfig {
            sandbox_id: sandbox_id.to_string(),
            kernel_path: self.config.kernel_path.clone(),
            rootfs_path: rootfs_path.to_string(),
            workspace_path: workspace_path.to_string(),
            vcpu_count,
            mem_size_mib: memory_mib,
            vsock_uds_path: vsock_path.clone(),
            guest_cid: lease.guest_cid,
            tap_dev_name: lease.tap_name.clone(),
            guest_mac: lease.guest_mac.clone(),
            guest_ip: lease.guest_ip.clone(),
            gateway_ip: lease.gateway_ip.clone(),
        };
        let json = vm_config
            .to_json()
            .map_err(|e| WorkerError::VmmApiError(format!("serializing machine config: {}", e)))?;
        tokio::fs::write(&config_path, &json)
            .await
            .map_err(|e| WorkerError::io(format!("writing {}", config_path), e))?;

        let lease_json = serde_json::to_string(lease)
            .map_err(|e| WorkerError::VmmApiError(format!("serializing lease: {}", e)))?;
        tokio::fs::write(format!("{}/net.json", sandbox_dir), lease_json)
            .await
            .map_err(|e| WorkerError::io("writing net.json", e))?;

        let vm =
            FirecrackerVm::spawn_with_config(sandbox_id, &api_socket_path, &vsock_path, &config_path)
                .await?;
        instance.lock().await.vm = Some(vm);

        FirecrackerApi::new(&api_socket_path)
            .wait_for_ready(API_READY_TIMEOUT)
            .await?;

        let agent = AgentClient::new(&vsock_path);
        agent
            .wait_for_ping(BOOT_HANDSHAKE_TIMEOUT)
            .await
            .map_err(|_| WorkerError::BootTimeout(sandbox_id.to_string()))?;

        Ok(())
    }

    /// Boot in snapshot-load mode. The resumed VM retains its prior network
    /// interfaces, so the TAP with the same name and IP is re-established
    /// before the snapshot loads.
    pub async fn boot_from_snapshot(
        &self,
        sandbox_id: &str,
        lease: NetLease,
        mem_path: &str,
        state_path: &str,
    ) -> Result<NetLease, WorkerError> {
        let instance = self.insert_booting(sandbox_id, &lease).await?;

        let result = self
            .snapshot_boot_inner(sandbox_id, &lease, mem_path, state_path)
            .await;

        match result {
            Ok(vm) => {
                let mut guard = instance.lock().await;
                guard.vm = Some(vm);
                guard.state = VmState::Running;
                info!(sandbox_id = %sandbox_id, "VM resumed from snapshot");
                Ok(lease)
            }
            Err(e) => {
                error!(sandbox_id = %sandbox_id, error = %e, "snapshot boot failed");
                self.fail_boot(sandbox_id, &instance, &lease).await;
                Err(e)
            }
        }
    }

    async fn snapshot_boot_inner(
        &self,
        sandbox_id: &str,
        lease: &NetLease,
        mem_path: &str,
        state_path: &str,
    ) -> Result<FirecrackerVm, WorkerError> {
        network::setup(sandbox_id, lease).await?;

        let api_socket_path = self.api_socket_path(sandbox_id);
        let vsock_path = self.vsock_path(sandbox_id);

        let vm = FirecrackerVm::spawn_bare(sandbox_id, &api_socket_path, &vsock_path).await?;

        let api = FirecrackerApi::new(&api_socket_path);
        let load = async {
            api.wait_for_ready(API_READY_TIMEOUT).await?;
            api.load_snapshot(state_path, mem_path).await?;
            api.resume().await?;
            AgentClient::new(&vsock_path)
                .wait_for_ping(BOOT_HANDSHAKE_TIMEOUT)
                .await
                .map_err(|_| WorkerError::BootTimeout(sandbox_id.to_string()))
        };

        match load.await {
            Ok(()) => Ok(vm),
            Err(e) => {
                vm.destroy().await;
                Err(e)
            }
        }
    }

    async fn insert_booting(
        &self,
        sandbox_id: &str,
        lease: &NetLease,
    ) -> Result<Arc<Mutex<VmInstance>>, WorkerError> {
        let mut vms = self.vms.write().await;
        if vms.contains_key(sandbox_id) {
            // Exactly one Firecracker process per sandbox.
            self.pool.release(lease.slot);
            return Err(WorkerError::SandboxExists(sandbox_id.to_string()));
        }
        let instance = Arc::new(Mutex::new(VmInstance {
            sandbox_id: sandbox_id.to_string(),
            state: VmState::Booting,
            lease: lease.clone(),
            vsock_path: self.vsock_path(sandbox_id),
            api: FirecrackerApi::new(&self.api_socket_path(sandbox_id)),
            vm: None,
        }));
        vms.insert(sandbox_id.to_string(), Arc::clone(&instance));
        Ok(instance)
    }

    async fn fail_boot(
        &self,
        sandbox_id: &str,
        instance: &Arc<Mutex<VmInstance>>,
        lease: &NetLease,
    ) {
        {
            let mut guard = instance.lock().await;
            guard.state = VmState::Failed;
            if let Some(vm) = guard.vm.take() {
                vm.destroy().await;
            }
            guard.state = VmState::Exited;
        }
        self.vms.write().await.remove(sandbox_id);
        network::teardown(sandbox_id, lease).await;
        self.pool.release(lease.slot);
    }

    async fn get(&self, sandbox_id: &str) -> Result<Arc<Mutex<VmInstance>>, WorkerError> {
        self.vms
            .read()
            .await
            .get(sandbox_id)
            .cloned()
            .ok_or_else(|| WorkerError::SandboxNotFound(sandbox_id.to_string()))
    }

    /// Pause the VM. Idempotent: pausing a paused VM is a no-op.
    pub async fn pause(&self, sandbox_id: &str) -> Result<(), WorkerError> {
        let instance = self.get(sandbox_id).await?;
        let mut guard = instance.lock().await;
        match guard.state {
            VmState::Paused => Ok(()),
            VmState::Running => {
                guard.api.pause().await?;
                guard.state = VmState::Paused;
                Ok(())
            }
            other => Err(WorkerError::SandboxNotRunning {
                id: sandbox_id.to_string(),
                status: other.to_string(),
            }),
        }
    }

    /// Resume the VM. Idempotent: resuming a running VM is a no-op.
    pub async fn resume(&self, sandbox_id: &str) -> Result<(), WorkerError> {
        let instance = self.get(sandbox_id).await?;
        let mut guard = instance.lock().await;
        match guard.state {
            VmState::Running => Ok(()),
            VmState::Paused => {
                guard.api.resume().await?;
                guard.state = VmState::Running;
                Ok(())
            }
            other => Err(WorkerError::SandboxNotRunning {
                id: sandbox_id.to_string(),
                status: other.to_string(),
            }),
        }
    }

    /// Write VMM state + guest memory of a paused VM to the given paths.
    /// Returns the byte sizes of (mem, state). A failed snapshot never leaves
    /// the VM in `Snapshotting`.
    pub async fn create_snapshot(
        &self,
        sandbox_id: &str,
        mem_path: &str,
        state_path: &str,
    ) -> Result<(u64, u64), WorkerError> {
        let instance = self.get(sandbox_id).await?;
        let mut guard = instance.lock().await;

        if guard.state != VmState::Paused {
            return Err(WorkerError::SnapshotFailed(format!(
                "VM must be paused to snapshot (state: {})",
                guard.state
            )));
        }

        guard.state = VmState::Snapshotting;
        let result = guard.api.create_snapshot(state_path, mem_path).await;
        guard.state = VmState::Paused;
        result?;

        let mem_size = tokio::fs::metadata(mem_path)
            .await
            .map_err(|e| WorkerError::io(format!("stat {}", mem_path), e))?
            .len();
        let state_size = tokio::fs::metadata(state_path)
            .await
            .map_err(|e| WorkerError::io(format!("stat {}", state_path), e))?
            .len();

        info!(
            sandbox_id = %sandbox_id,
            mem_size,
            state_size,
            "snapshot files written"
        );
        Ok((mem_size, state_size))
    }

    /// Kill the VM and release every host resource it held. Never fails to
    /// release the TAP, sockets and IP reservation, even on partial failure.
    pub async fn kill(&self, sandbox_id: &str) -> Result<(), WorkerError> {
        let instance = self.vms.write().await.remove(sandbox_id);
        let Some(instance) = instance else {
            return Err(WorkerError::SandboxNotFound(sandbox_id.to_string()));
        };

        let mut guard = instance.lock().await;
        if let Some(vm) = guard.vm.take() {
            vm.destroy().await;
        }
        guard.state = VmState::Exited;

        network::teardown(sandbox_id, &guard.lease).await;
        self.pool.release(guard.lease.slot);

        info!(sandbox_id = %sandbox_id, "VM killed and resources released");
        Ok(())
    }

    /// Find VMs whose Firecracker process died underneath us, release their
    /// resources, emit `VmExited`, and return their sandbox ids.
    pub async fn sweep_exited(&self) -> Vec<String> {
        let candidates: Vec<(String, Arc<Mutex<VmInstance>>)> = {
            let vms = self.vms.read().await;
            vms.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
        };

        let mut exited = Vec::new();
        for (sandbox_id, instance) in candidates {
            let mut guard = instance.lock().await;
            let dead = match guard.vm.as_mut() {
                Some(vm) => !vm.is_running(),
                None => continue,
            };
            if !dead || guard.state == VmState::Booting {
                continue;
            }

            warn!(sandbox_id = %sandbox_id, state = %guard.state, "firecracker exited unexpectedly");
            if let Some(vm) = guard.vm.take() {
                vm.destroy().await;
            }
            guard.state = VmState::Exited;
            network::teardown(&sandbox_id, &guard.lease).await;
            self.pool.release(guard.lease.slot);
            drop(guard);

            self.vms.write().await.remove(&sandbox_id);
            events::emit(
                &self.events,
                WorkerEvent::VmExited {
                    sandbox_id: sandbox_id.clone(),
                },
            );
            exited.push(sandbox_id);
        }
        exited
    }

    pub async fn active_count(&self) -> usize {
        self.vms.read().await.len()
    }
}
