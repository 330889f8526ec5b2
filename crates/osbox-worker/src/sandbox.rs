use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::RwLock;
use tracing::warn;

use crate::checkpoint::CheckpointInfo;
use crate::error::WorkerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    Creating,
    Running,
    Hibernating,
    Hibernated,
    Waking,
    Stopped,
    Error,
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxStatus::Creating => "creating",
            SandboxStatus::Running => "running",
            SandboxStatus::Hibernating => "hibernating",
            SandboxStatus::Hibernated => "hibernated",
            SandboxStatus::Waking => "waking",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

impl SandboxStatus {
    /// Legal transitions of the sandbox state machine. Hibernating and waking
    /// may roll back to the state they came from; stopped is terminal.
    pub fn can_transition(self, to: SandboxStatus) -> bool {
        use SandboxStatus::*;
        matches!(
            (self, to),
            (Creating, Running)
                | (Creating, Error)
                | (Creating, Stopped)
                | (Running, Hibernating)
                | (Running, Stopped)
                | (Running, Error)
                | (Hibernating, Hibernated)
                | (Hibernating, Running)
                | (Hibernating, Error)
                | (Hibernated, Waking)
                | (Hibernated, Stopped)
                | (Waking, Running)
                | (Waking, Hibernated)
                | (Waking, Error)
                | (Error, Stopped)
        )
    }
}

/// Immutable creation parameters of a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub template: String,
    pub vcpu_count: u32,
    pub memory_mib: u32,
    pub disk_mib: u32,
    /// Real secret values. These never leave the worker; the guest sees
    /// sealed tokens instead.
    pub env: HashMap<String, String>,
    pub allowed_hosts: Vec<String>,
    pub port: u32,
    pub timeout: Duration,
    pub hibernation_enabled: bool,
}

/// One sandbox tracked by this worker.
pub struct Sandbox {
    pub id: String,
    pub spec: SandboxSpec,
    pub status: SandboxStatus,
    /// Environment injected into the guest: sealed tokens plus proxy vars.
    pub guest_env: HashMap<String, String>,
    /// Network slot held (or last held, for hibernated sandboxes; wake must
    /// reclaim the same TAP/IP/CID).
    pub net_slot: Option<u16>,
    pub guest_ip: Option<String>,
    pub checkpoint: Option<CheckpointInfo>,
    pub deadline: Instant,
    pub last_activity: Instant,
    pub created_at: SystemTime,
}

impl Sandbox {
    pub fn new(id: String, spec: SandboxSpec) -> Self {
        let now = Instant::now();
        let deadline = now + spec.timeout;
        Self {
            id,
            spec,
            status: SandboxStatus::Creating,
            guest_env: HashMap::new(),
            net_slot: None,
            guest_ip: None,
            checkpoint: None,
            deadline,
            last_activity: now,
            created_at: SystemTime::now(),
        }
    }

    /// Record activity: reset `last_activity` and extend the deadline by the
    /// roll amount, never past `now + cap`.
    pub fn touch(&mut self, roll: Duration, cap: Duration) {
        let now = Instant::now();
        self.last_activity = now;
        let candidate = now + roll;
        if candidate > self.deadline {
            self.deadline = candidate.min(now + cap);
        }
    }

    pub fn reset_deadline(&mut self, timeout: Duration) {
        let now = Instant::now();
        self.last_activity = now;
        self.deadline = now + timeout;
    }
}

/// Mutex-held table of all sandboxes on this worker.
pub struct SandboxTable {
    inner: RwLock<HashMap<String, Sandbox>>,
}

impl Default for SandboxTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, sandbox: Sandbox) -> Result<(), WorkerError> {
        let mut inner = self.inner.write().await;
        if inner.contains_key(&sandbox.id) {
            return Err(WorkerError::SandboxExists(sandbox.id));
        }
        inner.insert(sandbox.id.clone(), sandbox);
        Ok(())
    }

    pub async fn remove(&self, id: &str) {
        self.inner.write().await.remove(id);
    }

    pub async fn status(&self, id: &str) -> Result<SandboxStatus, WorkerError> {
        self.with(id, |sb| sb.status).await
    }

    /// Apply a status transition, refusing illegal ones.
    pub async fn transition(&self, id: &str, to: SandboxStatus) -> Result<(), WorkerError> {
        let mut inner = self.inner.write().await;
        let sandbox = inner
            .get_mut(id)
            .ok_or_else(|| WorkerError::SandboxNotFound(id.to_string()))?;
        if !sandbox.status.can_transition(to) {
            warn!(
                sandbox_id = %id,
                from = %sandbox.status,
                to = %to,
                "illegal status transition refused"
            );
            return Err(WorkerError::SandboxNotRunning {
                id: id.to_string(),
                status: sandbox.status.to_string(),
            });
        }
        sandbox.status = to;
        Ok(())
    }

    /// Read a projection of one sandbox.
    pub async fn with<T>(
        &self,
        id: &str,
        f: impl FnOnce(&Sandbox) -> T,
    ) -> Result<T, WorkerError> {
        let inner = self.inner.read().await;
        inner
            .get(id)
            .map(f)
            .ok_or_else(|| WorkerError::SandboxNotFound(id.to_string()))
    }

    /// Mutate one sandbox in place.
    pub async fn update<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Sandbox) -> T,
    ) -> Result<T, WorkerError> {
        let mut inner = self.inner.write().await;
        inner
            .get_mut(id)
            .map(f)
            .ok_or_else(|| WorkerError::SandboxNotFound(id.to_string()))
    }

    pub async fn ids(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }

    pub async fn ids_with_status(&self, status: SandboxStatus) -> Vec<String> {
        self.inner
            .read()
            .await
            .values()
            .filter(|s| s.status == status)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Snapshot of (id, status, deadline) for the router scanner.
    pub async fn scan_view(&self) -> Vec<(String, SandboxStatus, Instant, bool)> {
        self.inner
            .read()
            .await
            .values()
            .map(|s| (s.id.clone(), s.status, s.deadline, s.spec.hibernation_enabled))
            .collect()
    }
}
