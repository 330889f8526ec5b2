use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::checkpoint::CheckpointInfo;
use crate::registry::SessionRegistry;

/// Lifecycle events emitted by the engine and drained by the reconciler.
/// Callbacks never run under component locks; they cross this channel.
#[derive(Debug)]
pub enum WorkerEvent {
    /// A hibernation completed (snapshot durable, VM gone).
    Hibernated {
        sandbox_id: String,
        checkpoint: CheckpointInfo,
    },
    /// A sandbox was killed (timeout with hibernation disabled, or explicit).
    Killed { sandbox_id: String, reason: String },
    /// A Firecracker process exited without being asked to.
    VmExited { sandbox_id: String },
    /// Periodic worker utilization report.
    Heartbeat {
        worker_id: String,
        active_sandboxes: u32,
        slots_used: u32,
        cpu_percent: f32,
        memory_used_bytes: u64,
        memory_total_bytes: u64,
    },
}

/// Clone-safe sender handle. Events are dropped (with a warning) rather than
/// blocking the emitting component when the channel is full.
pub type EventSender = mpsc::Sender<WorkerEvent>;

pub fn channel(buffer: usize) -> (EventSender, mpsc::Receiver<WorkerEvent>) {
    mpsc::channel(buffer)
}

pub fn emit(sender: &EventSender, event: WorkerEvent) {
    if let Err(e) = sender.try_send(event) {
        warn!(error = %e, "event channel full, dropping event");
    }
}

/// Consume events and reflect them into the external session registry.
pub async fn run_reconciler(
    mut rx: mpsc::Receiver<WorkerEvent>,
    registry: Arc<dyn SessionRegistry>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            WorkerEvent::Hibernated {
                sandbox_id,
                checkpoint,
            } => {
                registry.mark_hibernated(&sandbox_id, &checkpoint).await;
            }
            WorkerEvent::Killed { sandbox_id, reason } => {
                registry.mark_stopped(&sandbox_id, &reason).await;
            }
            WorkerEvent::VmExited { sandbox_id } => {
                registry
                    .mark_stopped(&sandbox_id, "vm exited unexpectedly")
                    .await;
            }
            WorkerEvent::Heartbeat { worker_id, .. } => {
                debug!(worker_id = %worker_id, "heartbeat");
            }
        }
    }
}
