use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::agent_client::{AgentClient, AgentGrpcClient};
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::hibernate::HibernationEngine;
use crate::registry::SessionRegistry;
use crate::sandbox::{SandboxStatus, SandboxTable};
use crate::supervisor::Supervisor;

/// Demultiplexes sandbox-addressed calls to the right guest agent and owns
/// the rolling deadlines.
///
/// The router holds no VMs itself: it resolves `sandbox id → agent channel`
/// through the supervisor's bookkeeping and keeps only a connection cache.
pub struct Router {
    config: Arc<WorkerConfig>,
    sandboxes: Arc<SandboxTable>,
    supervisor: Arc<Supervisor>,
    engine: Arc<HibernationEngine>,
    registry: Arc<dyn SessionRegistry>,
    clients: RwLock<HashMap<String, AgentGrpcClient>>,
}

impl Router {
    pub fn new(
        config: Arc<WorkerConfig>,
        sandboxes: Arc<SandboxTable>,
        supervisor: Arc<Supervisor>,
        engine: Arc<HibernationEngine>,
        registry: Arc<dyn SessionRegistry>,
    ) -> Self {
        Self {
            config,
            sandboxes,
            supervisor,
            engine,
            registry,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Record activity on a sandbox: reset `last_activity`, roll the deadline.
    pub async fn touch(&self, sandbox_id: &str) {
        let roll = self.config.roll_amount;
        let cap = self.config.roll_cap;
        let _ = self
            .sandboxes
            .update(sandbox_id, |sb| sb.touch(roll, cap))
            .await;
    }

    /// Resolve a sandbox to a connected agent client. A call addressed to a
    /// hibernated sandbox blocks on wake first.
    pub async fn agent(&self, sandbox_id: &str) -> Result<AgentGrpcClient, WorkerError> {
        match self.sandboxes.status(sandbox_id).await? {
            SandboxStatus::Running => {}
            SandboxStatus::Hibernated => {
                info!(sandbox_id = %sandbox_id, "auto-waking for incoming call");
                self.engine.wake(sandbox_id, None).await?;
            }
            other => {
                return Err(WorkerError::SandboxNotRunning {
                    id: sandbox_id.to_string(),
                    status: other.to_string(),
                })
            }
        }

        self.touch(sandbox_id).await;

        if let Some(client) = self.clients.read().await.get(sandbox_id) {
            return Ok(client.clone());
        }
        self.reconnect(sandbox_id).await
    }

    /// Drop any cached channel and dial the agent fresh.
    pub async fn reconnect(&self, sandbox_id: &str) -> Result<AgentGrpcClient, WorkerError> {
        self.clients.write().await.remove(sandbox_id);

        let vsock_path = self.supervisor.vsock_path(sandbox_id);
        let client = AgentClient::new(&vsock_path).connect().await?;
        self.clients
            .write()
            .await
            .insert(sandbox_id.to_string(), client.clone());
        Ok(client)
    }

    pub async fn forget(&self, sandbox_id: &str) {
        self.clients.write().await.remove(sandbox_id);
    }

    /// Run one agent RPC with the router's demux rules: auto-wake, activity
    /// tracking, a single retry on a dropped transport, and one-point mapping
    /// of transport errors to domain errors.
    pub async fn call<T, F, Fut>(&self, sandbox_id: &str, mut f: F) -> Result<T, WorkerError>
    where
        F: FnMut(AgentGrpcClient) -> Fut,
        Fut: Future<Output = Result<T, tonic::Status>>,
    {
        let client = self.agent(sandbox_id).await?;
        match f(client).await {
            Ok(value) => Ok(value),
            Err(status)
                if matches!(
                    status.code(),
                    tonic::Code::Unavailable | tonic::Code::Cancelled
                ) =>
            {
                // One retry against a fresh connection; no loops.
                let client = self.reconnect(sandbox_id).await?;
                f(client).await.map_err(WorkerError::from_agent_status)
            }
            Err(status) => Err(WorkerError::from_agent_status(status)),
        }
    }

    /// Background scanner: drains VM-exit events, enforces deadlines,
    /// evicts sandboxes hibernated elsewhere. The tick itself never blocks
    /// on hibernation; expiry work is dispatched onto tasks.
    pub async fn run_scanner(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.scan_once().await;
        }
    }

    pub async fn scan_once(&self) {
        // VMs whose Firecracker died underneath us.
        for sandbox_id in self.supervisor.sweep_exited().await {
            warn!(sandbox_id = %sandbox_id, "marking sandbox failed after vm exit");
            let _ = self
                .sandboxes
                .transition(&sandbox_id, SandboxStatus::Error)
                .await;
            self.forget(&sandbox_id).await;
        }

        let now = Instant::now();
        for (sandbox_id, status, deadline, hibernation_enabled) in
            self.sandboxes.scan_view().await
        {
            if status != SandboxStatus::Running {
                // Cache hygiene: never keep a channel to a VM that is gone.
                self.forget(&sandbox_id).await;
                continue;
            }
            if now <= deadline {
                continue;
            }

            let engine = Arc::clone(&self.engine);
            if hibernation_enabled {
                info!(sandbox_id = %sandbox_id, "deadline expired, hibernating");
                tokio::spawn(async move {
                    if let Err(e) = engine.hibernate(&sandbox_id, false).await {
                        warn!(sandbox_id = %sandbox_id, error = %e, "timeout hibernation failed");
                    }
                });
            } else {
                info!(sandbox_id = %sandbox_id, "deadline expired, killing");
                tokio::spawn(async move {
                    if let Err(e) = engine.kill(&sandbox_id, "rolling timeout expired").await {
                        warn!(sandbox_id = %sandbox_id, error = %e, "timeout kill failed");
                    }
                });
            }
        }

        // A sandbox the registry shows hibernated on another worker no longer
        // belongs in this worker's map.
        for sandbox_id in self.sandboxes.ids_with_status(SandboxStatus::Hibernated).await {
            if let Some(record) = self.registry.lookup(&sandbox_id).await {
                if record.status == "hibernated"
                    && !record.worker_id.is_empty()
                    && record.worker_id != self.config.worker_id
                {
                    info!(sandbox_id = %sandbox_id, worker = %record.worker_id, "evicting sandbox hibernated elsewhere");
                    self.sandboxes.remove(&sandbox_id).await;
                    self.forget(&sandbox_id).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::events;
    use crate::netpool::NetworkPool;
    use crate::proxy::ca::CertAuthority;
    use crate::proxy::session::SessionMap;
    use crate::registry::{InMemoryRegistry, SessionRecord};
    use crate::sandbox::{Sandbox, SandboxSpec};
    use std::time::Duration;

    struct Fixture {
        router: Arc<Router>,
        sandboxes: Arc<SandboxTable>,
        registry: Arc<InMemoryRegistry>,
    }

    fn shared_test_ca() -> Arc<CertAuthority> {
        static CA: std::sync::OnceLock<Arc<CertAuthority>> = std::sync::OnceLock::new();
        CA.get_or_init(|| {
            let dir = tempfile::tempdir().unwrap();
            let ca = Arc::new(CertAuthority::create(dir.path(), 2048).unwrap());
            std::mem::forget(dir);
            ca
        })
        .clone()
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_str().unwrap().to_string();
        std::mem::forget(dir);

        let config = Arc::new(WorkerConfig {
            worker_id: "wrk_router".into(),
            grpc_port: 50051,
            proxy_port: 3128,
            data_dir,
            kernel_path: "/tmp/vmlinux".into(),
            endpoint: "http://127.0.0.1:50051".into(),
            s3: None,
            default_timeout: Duration::from_secs(300),
            roll_amount: Duration::from_secs(60),
            roll_cap: Duration::from_secs(3600),
            scan_interval: Duration::from_secs(30),
        });
        let (events, _rx) = events::channel(64);
        let pool = Arc::new(NetworkPool::new());
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&config),
            Arc::clone(&pool),
            events.clone(),
        ));
        let store = Arc::new(CheckpointStore::new(None, config.checkpoints_dir()).await);
        let sandboxes = Arc::new(SandboxTable::new());
        let sessions = Arc::new(SessionMap::new());
        let ca = shared_test_ca();
        let engine = Arc::new(HibernationEngine::new(
            Arc::clone(&config),
            Arc::clone(&supervisor),
            store,
            Arc::clone(&sandboxes),
            sessions,
            pool,
            ca,
            events,
        ));
        let registry = Arc::new(InMemoryRegistry::new());
        let registry_dyn: Arc<dyn SessionRegistry> = registry.clone();
        let router = Arc::new(Router::new(
            config,
            Arc::clone(&sandboxes),
            supervisor,
            engine,
            registry_dyn,
        ));
        Fixture {
            router,
            sandboxes,
            registry,
        }
    }

    fn spec(timeout: Duration, hibernation_enabled: bool) -> SandboxSpec {
        SandboxSpec {
            template: "base".into(),
            vcpu_count: 1,
            memory_mib: 128,
            disk_mib: 64,
            env: HashMap::new(),
            allowed_hosts: vec![],
            port: 0,
            timeout,
            hibernation_enabled,
        }
    }

    #[tokio::test]
    async fn agent_for_unknown_sandbox_is_not_found() {
        let fx = fixture().await;
        let result = fx.router.agent("sb_ghost").await;
        assert!(matches!(result, Err(WorkerError::SandboxNotFound(_))));
    }

    #[tokio::test]
    async fn agent_for_creating_sandbox_is_not_running() {
        let fx = fixture().await;
        fx.sandboxes
            .insert(Sandbox::new("sb_new".into(), spec(Duration::from_secs(60), true)))
            .await
            .unwrap();

        let result = fx.router.agent("sb_new").await;
        assert!(matches!(result, Err(WorkerError::SandboxNotRunning { .. })));
    }

    #[tokio::test]
    async fn auto_wake_without_snapshot_surfaces_snapshot_missing() {
        let fx = fixture().await;
        let mut sandbox = Sandbox::new("sb_h".into(), spec(Duration::from_secs(60), true));
        sandbox.status = SandboxStatus::Hibernated;
        fx.sandboxes.insert(sandbox).await.unwrap();

        let result = fx.router.agent("sb_h").await;
        assert!(matches!(result, Err(WorkerError::SnapshotMissing(_))));
    }

    #[tokio::test]
    async fn touch_extends_deadline() {
        let fx = fixture().await;
        fx.sandboxes
            .insert(Sandbox::new("sb_t".into(), spec(Duration::from_secs(10), true)))
            .await
            .unwrap();

        let before = fx
            .sandboxes
            .with("sb_t", |sb| sb.deadline)
            .await
            .unwrap();
        fx.router.touch("sb_t").await;
        let after = fx.sandboxes.with("sb_t", |sb| sb.deadline).await.unwrap();
        assert!(after > before);
    }

    #[tokio::test]
    async fn expired_sandbox_without_hibernation_is_killed() {
        let fx = fixture().await;
        let mut sandbox = Sandbox::new("sb_kill".into(), spec(Duration::from_millis(1), false));
        sandbox.status = SandboxStatus::Running;
        fx.sandboxes.insert(sandbox).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        fx.router.scan_once().await;
        // Kill runs on a spawned task.
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(
            fx.sandboxes.status("sb_kill").await.unwrap(),
            SandboxStatus::Stopped
        );
    }

    #[tokio::test]
    async fn unexpired_sandbox_is_left_alone() {
        let fx = fixture().await;
        let mut sandbox = Sandbox::new("sb_ok".into(), spec(Duration::from_secs(600), false));
        sandbox.status = SandboxStatus::Running;
        fx.sandboxes.insert(sandbox).await.unwrap();

        fx.router.scan_once().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            fx.sandboxes.status("sb_ok").await.unwrap(),
            SandboxStatus::Running
        );
    }

    #[tokio::test]
    async fn sandbox_hibernated_elsewhere_is_evicted() {
        let fx = fixture().await;
        let mut sandbox = Sandbox::new("sb_gone".into(), spec(Duration::from_secs(600), true));
        sandbox.status = SandboxStatus::Hibernated;
        fx.sandboxes.insert(sandbox).await.unwrap();

        fx.registry
            .seed(SessionRecord {
                sandbox_id: "sb_gone".into(),
                status: "hibernated".into(),
                worker_id: "wrk_other".into(),
                template: "base".into(),
                checkpoint: None,
                note: String::new(),
            })
            .await;

        fx.router.scan_once().await;

        let result = fx.sandboxes.status("sb_gone").await;
        assert!(matches!(result, Err(WorkerError::SandboxNotFound(_))));
    }

    #[tokio::test]
    async fn locally_hibernated_sandbox_is_kept() {
        let fx = fixture().await;
        let mut sandbox = Sandbox::new("sb_here".into(), spec(Duration::from_secs(600), true));
        sandbox.status = SandboxStatus::Hibernated;
        fx.sandboxes.insert(sandbox).await.unwrap();

        fx.registry
            .seed(SessionRecord {
                sandbox_id: "sb_here".into(),
                status: "hibernated".into(),
                worker_id: "wrk_router".into(),
                template: "base".into(),
                checkpoint: None,
                note: String::new(),
            })
            .await;

        fx.router.scan_once().await;
        assert!(fx.sandboxes.status("sb_here").await.is_ok());
    }
}
