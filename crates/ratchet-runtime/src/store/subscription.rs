use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use ratchet_core::error::Result;

/// Link between a process and the subscription it acts on.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessSubscription {
    pub id: Uuid,
    pub process_id: Uuid,
    pub subscription_id: Uuid,
    pub workflow_target: String,
    pub created_at: DateTime<Utc>,
}

/// Store for process/subscription linkage rows.
#[derive(Clone)]
pub struct ProcessSubscriptionStore {
    pool: PgPool,
}

impl ProcessSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Link a subscription to a process.
    pub async fn link(
        &self,
        process_id: Uuid,
        subscription_id: Uuid,
        workflow_target: &str,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO process_subscriptions (id, process_id, subscription_id, workflow_target, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(id)
        .bind(process_id)
        .bind(subscription_id)
        .bind(workflow_target)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Subscriptions linked to a process.
    pub async fn for_process(&self, process_id: Uuid) -> Result<Vec<ProcessSubscription>> {
        let rows = sqlx::query(
            r#"
            SELECT id, process_id, subscription_id, workflow_target, created_at
            FROM process_subscriptions
            WHERE process_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(process_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ProcessSubscription {
                id: row.get("id"),
                process_id: row.get("process_id"),
                subscription_id: row.get("subscription_id"),
                workflow_target: row.get("workflow_target"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}
