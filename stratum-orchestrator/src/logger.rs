use std::path::Path;
use std::time::Instant;

use stratum_common::journal::{ActionStatus, ActionType, JournalRecord};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Append-only run journal (`actions.jsonl`). One JSON object per line.
/// Write failures are logged and swallowed: the journal never fails a run.
pub struct ActionLog {
    run_id: Uuid,
    sink: Option<Mutex<tokio::fs::File>>,
}

/// Handle returned by `log_event`, consumed by `log_event_complete`.
#[derive(Debug)]
pub struct PendingAction {
    id: Uuid,
    action_type: ActionType,
    instance_key: Option<String>,
    started: Instant,
}

impl ActionLog {
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            run_id: Uuid::new_v4(),
            sink: Some(Mutex::new(file)),
        })
    }

    /// Journal that only emits tracing lines.
    pub fn disabled() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            sink: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    async fn write(&self, record: &JournalRecord) {
        let Some(sink) = &self.sink else {
            return;
        };
        let mut line = match serde_json::to_string(record) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!("⚠️ [journal] could not serialize record: {}", e);
                return;
            }
        };
        line.push('\n');
        let mut file = sink.lock().await;
        if let Err(e) = file.write_all(line.as_bytes()).await {
            tracing::warn!("⚠️ [journal] write failed: {}", e);
            return;
        }
        let _ = file.flush().await;
    }

    pub async fn log_event(
        &self,
        action_type: ActionType,
        instance_key: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> PendingAction {
        let mut record = JournalRecord::new(self.run_id, action_type, ActionStatus::InProgress, instance_key);
        record.metadata = metadata;
        self.write(&record).await;
        tracing::debug!(
            "📝 [journal] {} in_progress {}",
            action_type.as_str(),
            instance_key.unwrap_or("-")
        );
        PendingAction {
            id: record.id,
            action_type,
            instance_key: instance_key.map(str::to_string),
            started: Instant::now(),
        }
    }

    pub async fn log_event_complete(
        &self,
        pending: PendingAction,
        status: ActionStatus,
        error_message: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) {
        let mut record = JournalRecord::new(
            self.run_id,
            pending.action_type,
            status,
            pending.instance_key.as_deref(),
        );
        record.id = pending.id;
        record.duration_ms = Some(pending.started.elapsed().as_millis() as u64);
        record.error_message = error_message.map(str::to_string);
        record.metadata = metadata;
        self.write(&record).await;
    }

    /// One-off event (state transitions, skips).
    pub async fn log_quick(
        &self,
        action_type: ActionType,
        status: ActionStatus,
        instance_key: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) {
        let mut record = JournalRecord::new(self.run_id, action_type, status, instance_key);
        record.metadata = metadata;
        self.write(&record).await;
    }
}
