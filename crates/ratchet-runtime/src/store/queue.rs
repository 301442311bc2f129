use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use ratchet_core::error::Result;
use ratchet_core::state::State;

/// The named queues consumed by workflow workers. Tasks and workflows are
/// kept apart so operators can scale and drain them independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueName {
    NewWorkflows,
    NewTasks,
    ResumeWorkflows,
    ResumeTasks,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewWorkflows => "new_workflows",
            Self::NewTasks => "new_tasks",
            Self::ResumeWorkflows => "resume_workflows",
            Self::ResumeTasks => "resume_tasks",
        }
    }

    /// Queue for starting a process.
    pub fn for_start(is_task: bool) -> Self {
        if is_task {
            Self::NewTasks
        } else {
            Self::NewWorkflows
        }
    }

    /// Queue for resuming a process.
    pub fn for_resume(is_task: bool) -> Self {
        if is_task {
            Self::ResumeTasks
        } else {
            Self::ResumeWorkflows
        }
    }
}

/// Payload shipped with a queue entry.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct QueuePayload {
    /// Form inputs accompanying a resume.
    #[serde(default)]
    pub user_inputs: Vec<State>,
    /// User the action is attributed to.
    pub user: String,
}

/// A claimed queue entry.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub entry_id: Uuid,
    pub queue: QueueName,
    pub process_id: Uuid,
    pub payload: QueuePayload,
    pub created_at: DateTime<Utc>,
}

/// Postgres-backed work queue for the queue executor.
///
/// Claims use `FOR UPDATE SKIP LOCKED` and delete the entry in the same
/// statement, so an entry is handed to at most one worker.
#[derive(Clone)]
pub struct QueueStore {
    pool: PgPool,
}

impl QueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue work for a process.
    pub async fn enqueue(
        &self,
        queue: QueueName,
        process_id: Uuid,
        payload: &QueuePayload,
    ) -> Result<Uuid> {
        let entry_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO queue_entries (entry_id, queue, process_id, payload, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(entry_id)
        .bind(queue.as_str())
        .bind(process_id)
        .bind(serde_json::to_value(payload)?)
        .execute(&self.pool)
        .await?;

        Ok(entry_id)
    }

    /// Claim up to `limit` entries from the given queues, oldest first.
    pub async fn claim(&self, queues: &[QueueName], limit: i64) -> Result<Vec<QueueEntry>> {
        let queue_strs: Vec<String> = queues.iter().map(|q| q.as_str().to_string()).collect();

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT entry_id
                FROM queue_entries
                WHERE queue = ANY($1)
                ORDER BY created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            DELETE FROM queue_entries
            WHERE entry_id IN (SELECT entry_id FROM claimable)
            RETURNING entry_id, queue, process_id, payload, created_at
            "#,
        )
        .bind(&queue_strs)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let queue: String = row.get("queue");
            let queue = match queue.as_str() {
                "new_workflows" => QueueName::NewWorkflows,
                "new_tasks" => QueueName::NewTasks,
                "resume_workflows" => QueueName::ResumeWorkflows,
                "resume_tasks" => QueueName::ResumeTasks,
                other => {
                    tracing::error!(queue = %other, "Dropping entry from unknown queue");
                    continue;
                }
            };
            entries.push(QueueEntry {
                entry_id: row.get("entry_id"),
                queue,
                process_id: row.get("process_id"),
                payload: serde_json::from_value(row.get::<serde_json::Value, _>("payload"))?,
                created_at: row.get("created_at"),
            });
        }
        Ok(entries)
    }

    /// Number of entries waiting across all queues.
    pub async fn depth(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS num FROM queue_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("num"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_selection() {
        assert_eq!(QueueName::for_start(true), QueueName::NewTasks);
        assert_eq!(QueueName::for_start(false), QueueName::NewWorkflows);
        assert_eq!(QueueName::for_resume(true), QueueName::ResumeTasks);
        assert_eq!(QueueName::for_resume(false), QueueName::ResumeWorkflows);
    }

    #[test]
    fn test_queue_payload_roundtrip() {
        let payload = QueuePayload {
            user_inputs: vec![State::new()],
            user: "alice".to_string(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        let back: QueuePayload = serde_json::from_value(value).unwrap();
        assert_eq!(back.user, "alice");
        assert_eq!(back.user_inputs.len(), 1);
    }
}
