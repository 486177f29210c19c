use chrono::{DateTime, Utc};
use log::debug;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::types::{DownloadTask, ItemOutcome, Progress, TaskStatus};
use crate::error::DbError;

/// Durable store for batch jobs. It is the single writer of task state;
/// progress counters are recomputed from per_item inside the same
/// transaction as every item update, so they cannot drift.
pub struct TaskStore {
    pool: PgPool,
}

impl TaskStore {
    pub fn new(pool: PgPool) -> Self {
        TaskStore { pool }
    }

    pub async fn create(&self, task: &DownloadTask) -> Result<(), DbError> {
        sqlx::query(
            r#"INSERT INTO download_task
               (task_id, status, save_dir, created_at, updated_at, requested_refs, per_item, progress)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(task.task_id)
        .bind(task.status.as_str())
        .bind(&task.save_dir)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(serde_json::to_value(&task.requested_refs).unwrap_or_default())
        .bind(serde_json::to_value(&task.per_item).unwrap_or_default())
        .bind(serde_json::to_value(task.progress).unwrap_or_default())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, task_id: Uuid) -> Result<Option<DownloadTask>, DbError> {
        let row = sqlx::query(
            r#"SELECT task_id, status, save_dir, created_at, updated_at,
                      requested_refs, per_item, progress
               FROM download_task WHERE task_id = $1"#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_task).transpose()
    }

    /// Non-terminal transition (PENDING -> RUNNING, RUNNING -> CANCELLING).
    /// Terminal states are never overwritten.
    pub async fn update_status(&self, task_id: Uuid, status: TaskStatus) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"UPDATE download_task SET status = $2, updated_at = $3
               WHERE task_id = $1
                 AND status NOT IN ('COMPLETED', 'FAILED', 'PARTIAL', 'CANCELLED')"#,
        )
        .bind(task_id)
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Write the terminal status exactly once.
    pub async fn finalize(&self, task_id: Uuid, status: TaskStatus) -> Result<bool, DbError> {
        debug!("finalizing task {} as {}", task_id, status.as_str());
        self.update_status(task_id, status).await
    }

    /// Record one item's outcome under a row lock and recompute progress
    /// from the updated map in the same transaction.
    pub async fn update_item(
        &self,
        task_id: Uuid,
        upload_info_id: &str,
        outcome: ItemOutcome,
    ) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT requested_refs, per_item FROM download_task WHERE task_id = $1 FOR UPDATE",
        )
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?;

        let row = match row {
            Some(row) => row,
            None => {
                return Err(DbError::Constraint(format!(
                    "download_task {} does not exist",
                    task_id
                )))
            }
        };

        let requested_refs: Vec<String> = decode_json(row.try_get("requested_refs")?)?;
        let mut per_item: std::collections::HashMap<String, ItemOutcome> =
            decode_json(row.try_get("per_item")?)?;

        per_item.insert(upload_info_id.to_string(), outcome);
        let progress = Progress::recompute(requested_refs.len(), &per_item);

        sqlx::query(
            "UPDATE download_task SET per_item = $2, progress = $3, updated_at = $4 WHERE task_id = $1",
        )
        .bind(task_id)
        .bind(serde_json::to_value(&per_item).unwrap_or_default())
        .bind(serde_json::to_value(progress).unwrap_or_default())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, DbError> {
    serde_json::from_value(value).map_err(|e| DbError::Constraint(format!("corrupt task JSON: {}", e)))
}

fn row_to_task(row: sqlx::postgres::PgRow) -> Result<DownloadTask, DbError> {
    let status_raw: String = row.try_get("status")?;
    let status = TaskStatus::from_str_name(&status_raw)
        .ok_or_else(|| DbError::Constraint(format!("unknown task status {:?}", status_raw)))?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    Ok(DownloadTask {
        task_id: row.try_get("task_id")?,
        status,
        save_dir: row.try_get("save_dir")?,
        created_at,
        updated_at,
        requested_refs: decode_json(row.try_get("requested_refs")?)?,
        per_item: decode_json(row.try_get("per_item")?)?,
        progress: decode_json(row.try_get("progress")?)?,
    })
}
