use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::checkpoint::CheckpointInfo;

/// One session as the external registry sees it.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub sandbox_id: String,
    pub status: String,
    pub worker_id: String,
    pub template: String,
    pub checkpoint: Option<CheckpointInfo>,
    pub note: String,
}

/// The cluster-side session registry this worker reports into. The real
/// implementation lives in the control plane; the worker only consumes this
/// interface (crash recovery reads it, the reconciler writes it).
#[tonic::async_trait]
pub trait SessionRegistry: Send + Sync {
    async fn lookup(&self, sandbox_id: &str) -> Option<SessionRecord>;

    /// Sessions the registry believes are placed on the given worker.
    async fn sessions_for_worker(&self, worker_id: &str) -> Vec<SessionRecord>;

    async fn mark_hibernated(&self, sandbox_id: &str, checkpoint: &CheckpointInfo);

    async fn mark_stopped(&self, sandbox_id: &str, note: &str);
}

/// In-memory registry used in tests and in single-node deployments without a
/// control plane.
pub struct InMemoryRegistry {
    records: Mutex<HashMap<String, SessionRecord>>,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    pub async fn seed(&self, record: SessionRecord) {
        self.records
            .lock()
            .await
            .insert(record.sandbox_id.clone(), record);
    }
}

#[tonic::async_trait]
impl SessionRegistry for InMemoryRegistry {
    async fn lookup(&self, sandbox_id: &str) -> Option<SessionRecord> {
        self.records.lock().await.get(sandbox_id).cloned()
    }

    async fn sessions_for_worker(&self, worker_id: &str) -> Vec<SessionRecord> {
        self.records
            .lock()
            .await
            .values()
            .filter(|r| r.worker_id == worker_id)
            .cloned()
            .collect()
    }

    async fn mark_hibernated(&self, sandbox_id: &str, checkpoint: &CheckpointInfo) {
        let mut records = self.records.lock().await;
        let record = records
            .entry(sandbox_id.to_string())
            .or_insert_with(|| SessionRecord {
                sandbox_id: sandbox_id.to_string(),
                status: String::new(),
                worker_id: String::new(),
                template: String::new(),
                checkpoint: None,
                note: String::new(),
            });
        record.status = "hibernated".to_string();
        record.checkpoint = Some(checkpoint.clone());
    }

    async fn mark_stopped(&self, sandbox_id: &str, note: &str) {
        let mut records = self.records.lock().await;
        let record = records
            .entry(sandbox_id.to_string())
            .or_insert_with(|| SessionRecord {
                sandbox_id: sandbox_id.to_string(),
                status: String::new(),
                worker_id: String::new(),
                template: String::new(),
                checkpoint: None,
                note: String::new(),
            });
        record.status = "stopped".to_string();
        record.note = note.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeded_sessions_are_scoped_to_worker() {
        let registry = InMemoryRegistry::new();
        registry
            .seed(SessionRecord {
                sandbox_id: "sb_mine".into(),
                status: "running".into(),
                worker_id: "wrk_1".into(),
                template: "base".into(),
                checkpoint: None,
                note: String::new(),
            })
            .await;
        registry
            .seed(SessionRecord {
                sandbox_id: "sb_other".into(),
                status: "running".into(),
                worker_id: "wrk_2".into(),
                template: "base".into(),
                checkpoint: None,
                note: String::new(),
            })
            .await;

        let mine = registry.sessions_for_worker("wrk_1").await;
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].sandbox_id, "sb_mine");
    }

    #[tokio::test]
    async fn mark_stopped_records_note() {
        let registry = InMemoryRegistry::new();
        registry.mark_stopped("sb_x", "no sandbox directory").await;
        let record = registry.lookup("sb_x").await.unwrap();
        assert_eq!(record.status, "stopped");
        assert_eq!(record.note, "no sandbox directory");
    }
}
