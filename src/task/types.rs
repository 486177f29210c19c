use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::ItemError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Cancelling,
    Completed,
    Failed,
    Partial,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Partial | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Cancelling => "CANCELLING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Partial => "PARTIAL",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TaskStatus::Pending),
            "RUNNING" => Some(TaskStatus::Running),
            "CANCELLING" => Some(TaskStatus::Cancelling),
            "COMPLETED" => Some(TaskStatus::Completed),
            "FAILED" => Some(TaskStatus::Failed),
            "PARTIAL" => Some(TaskStatus::Partial),
            "CANCELLED" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Pending,
    Downloaded,
    Parsed,
    Persisted,
    Failed,
    Cancelled,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Persisted | ItemStatus::Failed | ItemStatus::Cancelled
        )
    }
}

/// Where one report of a batch currently stands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fund_report_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemError>,
}

impl ItemOutcome {
    pub fn pending() -> Self {
        ItemOutcome {
            status: ItemStatus::Pending,
            file_path: None,
            fund_report_id: None,
            error: None,
        }
    }
}

/// Aggregate counters, always recomputed from per_item so they cannot
/// drift from the authoritative map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub cancelled: u32,
    pub percent: f64,
}

impl Progress {
    pub fn recompute(total: usize, per_item: &HashMap<String, ItemOutcome>) -> Progress {
        let completed = per_item
            .values()
            .filter(|o| o.status == ItemStatus::Persisted)
            .count() as u32;
        let failed = per_item
            .values()
            .filter(|o| o.status == ItemStatus::Failed)
            .count() as u32;
        let cancelled = per_item
            .values()
            .filter(|o| o.status == ItemStatus::Cancelled)
            .count() as u32;
        let total = total as u32;
        let settled = completed + failed + cancelled;
        let percent = if total == 0 {
            100.0
        } else {
            (settled as f64 / total as f64) * 100.0
        };
        Progress {
            total,
            completed,
            failed,
            cancelled,
            percent,
        }
    }

    /// Terminal task status implied by the settled items.
    pub fn terminal_status(&self, cancelling: bool) -> TaskStatus {
        if cancelling {
            TaskStatus::Cancelled
        } else if self.completed == self.total {
            TaskStatus::Completed
        } else if self.completed == 0 {
            TaskStatus::Failed
        } else {
            TaskStatus::Partial
        }
    }
}

/// Durable record of a batch ingest job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub save_dir: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub requested_refs: Vec<String>,
    pub per_item: HashMap<String, ItemOutcome>,
    pub progress: Progress,
}

impl DownloadTask {
    pub fn new(task_id: Uuid, requested_refs: Vec<String>, save_dir: String) -> Self {
        let per_item: HashMap<String, ItemOutcome> = requested_refs
            .iter()
            .map(|id| (id.clone(), ItemOutcome::pending()))
            .collect();
        let progress = Progress::recompute(requested_refs.len(), &per_item);
        let now = Utc::now();
        DownloadTask {
            task_id,
            status: TaskStatus::Pending,
            save_dir,
            created_at: now,
            updated_at: now,
            requested_refs,
            per_item,
            progress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, ItemError};

    fn outcomes(statuses: &[(&str, ItemStatus)]) -> HashMap<String, ItemOutcome> {
        statuses
            .iter()
            .map(|(id, status)| {
                let mut outcome = ItemOutcome::pending();
                outcome.status = *status;
                (id.to_string(), outcome)
            })
            .collect()
    }

    #[test]
    fn progress_counts_settled_items() {
        let per_item = outcomes(&[
            ("a", ItemStatus::Persisted),
            ("b", ItemStatus::Failed),
            ("c", ItemStatus::Downloaded),
            ("d", ItemStatus::Cancelled),
        ]);
        let progress = Progress::recompute(4, &per_item);
        assert_eq!(progress.total, 4);
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.cancelled, 1);
        assert!((progress.percent - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn terminal_status_aggregation() {
        let all = outcomes(&[("a", ItemStatus::Persisted), ("b", ItemStatus::Persisted)]);
        assert_eq!(
            Progress::recompute(2, &all).terminal_status(false),
            TaskStatus::Completed
        );

        let none = outcomes(&[("a", ItemStatus::Failed), ("b", ItemStatus::Failed)]);
        assert_eq!(
            Progress::recompute(2, &none).terminal_status(false),
            TaskStatus::Failed
        );

        let some = outcomes(&[("a", ItemStatus::Persisted), ("b", ItemStatus::Failed)]);
        assert_eq!(
            Progress::recompute(2, &some).terminal_status(false),
            TaskStatus::Partial
        );
        assert_eq!(
            Progress::recompute(2, &some).terminal_status(true),
            TaskStatus::Cancelled
        );
    }

    #[test]
    fn item_outcome_serializes_compactly() {
        let outcome = ItemOutcome {
            status: ItemStatus::Failed,
            file_path: None,
            fund_report_id: None,
            error: Some(ItemError::new(ErrorKind::Http, "HTTP 404")),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "FAILED");
        assert_eq!(json["error"]["kind"], "HTTP");
        assert!(json.get("file_path").is_none());
    }

    #[test]
    fn new_task_starts_pending_with_all_items() {
        let task = DownloadTask::new(
            Uuid::new_v4(),
            vec!["1".to_string(), "2".to_string()],
            "/tmp/reports".to_string(),
        );
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.per_item.len(), 2);
        assert_eq!(task.progress.total, 2);
        assert_eq!(task.progress.completed, 0);
    }
}
