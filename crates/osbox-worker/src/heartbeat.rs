use std::sync::Arc;
use std::time::Duration;

use sysinfo::System;
use tracing::debug;

use crate::config::WorkerConfig;
use crate::events::{self, EventSender, WorkerEvent};
use crate::netpool::NetworkPool;
use crate::sandbox::{SandboxStatus, SandboxTable};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Periodic worker utilization report on the events channel.
pub async fn run(
    config: Arc<WorkerConfig>,
    sandboxes: Arc<SandboxTable>,
    pool: Arc<NetworkPool>,
    events: EventSender,
) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut sys = System::new();

    loop {
        interval.tick().await;

        sys.refresh_cpu_all();
        sys.refresh_memory();

        let active = sandboxes.ids_with_status(SandboxStatus::Running).await.len() as u32;

        events::emit(
            &events,
            WorkerEvent::Heartbeat {
                worker_id: config.worker_id.clone(),
                active_sandboxes: active,
                slots_used: pool.active_count() as u32,
                cpu_percent: sys.global_cpu_usage(),
                memory_used_bytes: sys.used_memory(),
                memory_total_bytes: sys.total_memory(),
            },
        );
        debug!(active, "heartbeat sent");
    }
}
