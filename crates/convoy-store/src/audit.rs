use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_RECENT: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    /// Who acted: the supervisor id or an agent id.
    pub actor: String,
    pub action: String,
    /// Task, workflow or agent the action concerns.
    pub subject: Option<String>,
    pub message_id: Option<Uuid>,
    pub details: serde_json::Value,
    pub outcome: AuditOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Rejected,
    Error,
}

/// Append-only audit trail of messages and lifecycle events.
///
/// Entries are kept in a bounded in-memory window and, when created with
/// [`AuditLog::new`], appended as JSON lines to `audit.jsonl` by a
/// background writer.
pub struct AuditLog {
    tx: Option<mpsc::UnboundedSender<AuditEntry>>,
    recent: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl AuditLog {
    /// Create a file-backed audit log. Must be called inside a Tokio runtime.
    pub fn new(log_dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEntry>();

        tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
                warn!(dir = %log_dir.display(), error = %e, "Cannot create audit directory");
                return;
            }
            let path = log_dir.join("audit.jsonl");
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot open audit log");
                    return;
                }
            };

            while let Some(entry) = rx.recv().await {
                let Ok(mut line) = serde_json::to_string(&entry) else {
                    continue;
                };
                line.push('\n');
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!(error = %e, "Audit write failed");
                    continue;
                }
                let _ = file.flush().await;
            }
        });

        Self {
            tx: Some(tx),
            recent: Mutex::new(VecDeque::new()),
            capacity: DEFAULT_RECENT,
        }
    }

    /// Audit log that only keeps the most recent `capacity` entries in memory.
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            tx: None,
            recent: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn log(&self, entry: AuditEntry) {
        debug!(
            actor = %entry.actor,
            action = %entry.action,
            outcome = ?entry.outcome,
            "audit"
        );
        {
            let mut recent = self.recent.lock();
            if recent.len() == self.capacity {
                recent.pop_front();
            }
            recent.push_back(entry.clone());
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(entry);
        }
    }

    pub fn log_action(
        &self,
        actor: impl Into<String>,
        action: impl Into<String>,
        subject: Option<String>,
        details: serde_json::Value,
        outcome: AuditOutcome,
    ) {
        self.log(AuditEntry {
            timestamp: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            subject,
            message_id: None,
            details,
            outcome,
        });
    }

    /// Snapshot of the in-memory window, oldest first.
    pub fn recent(&self) -> Vec<AuditEntry> {
        self.recent.lock().iter().cloned().collect()
    }

    /// Entries whose subject equals `subject`.
    pub fn entries_for(&self, subject: &str) -> Vec<AuditEntry> {
        self.recent
            .lock()
            .iter()
            .filter(|e| e.subject.as_deref() == Some(subject))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_window_is_bounded() {
        let log = AuditLog::in_memory(2);
        for i in 0..3 {
            log.log_action(
                "supervisor",
                format!("action-{i}"),
                None,
                serde_json::Value::Null,
                AuditOutcome::Success,
            );
        }
        let recent = log.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].action, "action-1");
    }

    #[test]
    fn test_entries_for_subject() {
        let log = AuditLog::in_memory(16);
        log.log_action(
            "supervisor",
            "task_completed",
            Some("t-1".into()),
            serde_json::json!({}),
            AuditOutcome::Success,
        );
        log.log_action(
            "supervisor",
            "task_failed",
            Some("t-2".into()),
            serde_json::json!({}),
            AuditOutcome::Error,
        );
        let entries = log.entries_for("t-2");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, AuditOutcome::Error);
    }
}
