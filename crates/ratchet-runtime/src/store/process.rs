use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use ratchet_core::error::{RatchetError, Result};
use ratchet_core::signal::{ProcessStatus, StepStatus};
use ratchet_core::state::{as_state, State};
use ratchet_core::workflow::Assignee;

/// A process row: one run of a workflow.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub process_id: Uuid,
    pub workflow_name: String,
    pub last_status: ProcessStatus,
    pub last_step: Option<String>,
    pub assignee: Assignee,
    pub failed_reason: Option<String>,
    pub traceback: Option<String>,
    /// Digest of the workflow's step list at start; resume refuses when the
    /// registered workflow no longer matches.
    pub workflow_digest: Option<String>,
    pub is_task: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

/// A persisted step attempt.
#[derive(Debug, Clone)]
pub struct ProcessStepRecord {
    pub step_id: Uuid,
    pub process_id: Uuid,
    pub name: String,
    pub status: StepStatus,
    pub state: State,
    pub created_by: String,
    pub executed_at: DateTime<Utc>,
    pub commit_hash: Option<String>,
}

/// Update applied to the process row alongside every step log.
#[derive(Debug, Clone)]
pub struct ProcessUpdate {
    pub last_step: String,
    pub last_status: ProcessStatus,
    pub assignee: Assignee,
    pub failed_reason: Option<String>,
    pub traceback: Option<String>,
}

/// Whitelisted fields for list filtering and sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessField {
    Status,
    IsTask,
    Workflow,
    Assignee,
    CreatedBy,
    LastStep,
    Started,
    Modified,
}

impl ProcessField {
    fn column(&self) -> &'static str {
        match self {
            Self::Status => "last_status",
            Self::IsTask => "is_task",
            Self::Workflow => "workflow_name",
            Self::Assignee => "assignee",
            Self::CreatedBy => "created_by",
            Self::LastStep => "last_step",
            Self::Started => "created_at",
            Self::Modified => "last_modified_at",
        }
    }

    /// Parse a field name as used in list query parameters.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "status" | "last_status" => Some(Self::Status),
            "is_task" | "istask" | "isTask" => Some(Self::IsTask),
            "workflow" => Some(Self::Workflow),
            "assignee" => Some(Self::Assignee),
            "creator" | "created_by" => Some(Self::CreatedBy),
            "last_step" => Some(Self::LastStep),
            "started" | "created_at" => Some(Self::Started),
            "modified" | "last_modified_at" => Some(Self::Modified),
            _ => None,
        }
    }
}

/// One filter clause of a process list query.
#[derive(Debug, Clone)]
pub struct ProcessFilter {
    pub field: ProcessField,
    pub value: String,
}

/// One sort clause of a process list query.
#[derive(Debug, Clone)]
pub struct ProcessSort {
    pub field: ProcessField,
    pub descending: bool,
}

/// Durable log of processes and their step attempts.
#[derive(Clone)]
pub struct ProcessStore {
    pool: PgPool,
}

impl ProcessStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert the process row for a freshly created run.
    pub async fn create(&self, record: &ProcessRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO processes (
                process_id, workflow_name, last_status, last_step, assignee,
                failed_reason, traceback, workflow_digest, is_task,
                created_by, created_at, last_modified_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(record.process_id)
        .bind(&record.workflow_name)
        .bind(record.last_status.as_str())
        .bind(&record.last_step)
        .bind(record.assignee.as_str())
        .bind(&record.failed_reason)
        .bind(&record.traceback)
        .bind(&record.workflow_digest)
        .bind(record.is_task)
        .bind(&record.created_by)
        .bind(record.created_at)
        .bind(record.last_modified_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch a process row by id.
    pub async fn get(&self, process_id: Uuid) -> Result<ProcessRecord> {
        let row = sqlx::query(
            r#"
            SELECT process_id, workflow_name, last_status, last_step, assignee,
                   failed_reason, traceback, workflow_digest, is_task,
                   created_by, created_at, last_modified_at
            FROM processes
            WHERE process_id = $1
            "#,
        )
        .bind(process_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| map_process(&r))
            .ok_or_else(|| RatchetError::NotFound(format!("Process {} not found", process_id)))
    }

    /// Fetch the full step log of a process, oldest first.
    pub async fn steps(&self, process_id: Uuid) -> Result<Vec<ProcessStepRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT step_id, process_id, name, status, state, created_by,
                   executed_at, commit_hash
            FROM process_steps
            WHERE process_id = $1
            ORDER BY executed_at ASC
            "#,
        )
        .bind(process_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_step).collect()
    }

    /// Fetch the most recent step of a process, if any.
    pub async fn last_step(&self, process_id: Uuid) -> Result<Option<ProcessStepRecord>> {
        let row = sqlx::query(
            r#"
            SELECT step_id, process_id, name, status, state, created_by,
                   executed_at, commit_hash
            FROM process_steps
            WHERE process_id = $1
            ORDER BY executed_at DESC
            LIMIT 1
            "#,
        )
        .bind(process_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(map_step).transpose()
    }

    /// Apply a step transition: update the process row and append or
    /// overwrite a step row in one transaction.
    pub async fn log_step(
        &self,
        process_id: Uuid,
        update: &ProcessUpdate,
        step: StepRowWrite,
    ) -> Result<ProcessStepRecord> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE processes
            SET last_step = $2, last_status = $3, assignee = $4,
                failed_reason = $5, traceback = $6, last_modified_at = NOW()
            WHERE process_id = $1
            "#,
        )
        .bind(process_id)
        .bind(&update.last_step)
        .bind(update.last_status.as_str())
        .bind(update.assignee.as_str())
        .bind(&update.failed_reason)
        .bind(&update.traceback)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(RatchetError::NotFound(format!(
                "Process {} not found",
                process_id
            )));
        }

        let executed_at = Utc::now();
        let record = match step {
            StepRowWrite::Append {
                name,
                status,
                state,
                created_by,
            } => {
                let step_id = Uuid::new_v4();
                sqlx::query(
                    r#"
                    INSERT INTO process_steps (
                        step_id, process_id, name, status, state,
                        created_by, executed_at
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                    "#,
                )
                .bind(step_id)
                .bind(process_id)
                .bind(&name)
                .bind(status.as_str())
                .bind(serde_json::Value::Object(state.clone()))
                .bind(&created_by)
                .bind(executed_at)
                .execute(&mut *tx)
                .await?;

                ProcessStepRecord {
                    step_id,
                    process_id,
                    name,
                    status,
                    state,
                    created_by,
                    executed_at,
                    commit_hash: None,
                }
            }
            StepRowWrite::Overwrite {
                step_id,
                name,
                status,
                state,
                created_by,
            } => {
                sqlx::query(
                    r#"
                    UPDATE process_steps
                    SET status = $2, state = $3, executed_at = $4
                    WHERE step_id = $1
                    "#,
                )
                .bind(step_id)
                .bind(status.as_str())
                .bind(serde_json::Value::Object(state.clone()))
                .bind(executed_at)
                .execute(&mut *tx)
                .await?;

                ProcessStepRecord {
                    step_id,
                    process_id,
                    name,
                    status,
                    state,
                    created_by,
                    executed_at,
                    commit_hash: None,
                }
            }
        };

        tx.commit().await?;
        Ok(record)
    }

    /// Overwrite the state of the most recent step row (callback paths).
    pub async fn replace_last_step_state(&self, process_id: Uuid, state: State) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE process_steps
            SET state = $2
            WHERE step_id = (
                SELECT step_id FROM process_steps
                WHERE process_id = $1
                ORDER BY executed_at DESC
                LIMIT 1
            )
            "#,
        )
        .bind(process_id)
        .bind(serde_json::Value::Object(state))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RatchetError::NotFound(format!(
                "Process {} has no steps",
                process_id
            )));
        }
        Ok(())
    }

    /// Set the aggregate status unconditionally.
    pub async fn set_last_status(&self, process_id: Uuid, status: ProcessStatus) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE processes
            SET last_status = $2, last_modified_at = NOW()
            WHERE process_id = $1
            "#,
        )
        .bind(process_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Row-locked status transition: flips to `new` only while the current
    /// status is one of `expected`, returning the previous status.
    ///
    /// Used by the queue executor so a `resumed` transition happens-before
    /// the worker's `running` transition.
    pub async fn set_last_status_guarded(
        &self,
        process_id: Uuid,
        expected: &[ProcessStatus],
        new: ProcessStatus,
    ) -> Result<ProcessStatus> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT last_status FROM processes WHERE process_id = $1 FOR UPDATE",
        )
        .bind(process_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| RatchetError::NotFound(format!("Process {} not found", process_id)))?;

        let current = parse_process_status(&row.get::<String, _>("last_status"))?;
        if !expected.contains(&current) {
            tx.rollback().await?;
            return Err(RatchetError::BadStatus(format!(
                "Process has incorrect status to resume: {}",
                current.as_str()
            )));
        }

        sqlx::query(
            "UPDATE processes SET last_status = $2, last_modified_at = NOW() WHERE process_id = $1",
        )
        .bind(process_id)
        .bind(new.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(current)
    }

    /// Write a failure directly to the process row when the step log itself
    /// could not be written. A process already `waiting` keeps that status.
    pub async fn log_process_failure(
        &self,
        process_id: Uuid,
        failed_reason: &str,
        traceback: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE processes
            SET last_step = 'Unknown',
                last_status = CASE WHEN last_status = 'waiting' THEN last_status ELSE 'failed' END,
                failed_reason = $2,
                traceback = $3,
                last_modified_at = NOW()
            WHERE process_id = $1
            "#,
        )
        .bind(process_id)
        .bind(failed_reason)
        .bind(traceback)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::error!(
                process_id = %process_id,
                "Failed to write failure to database: process not found"
            );
        }
        Ok(())
    }

    /// Hard-delete a process and its step log.
    pub async fn delete(&self, process_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM process_steps WHERE process_id = $1")
            .bind(process_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM input_states WHERE process_id = $1")
            .bind(process_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM process_subscriptions WHERE process_id = $1")
            .bind(process_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM processes WHERE process_id = $1")
            .bind(process_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// All processes currently marked `running`.
    pub async fn running(&self) -> Result<Vec<ProcessRecord>> {
        self.by_statuses(&[ProcessStatus::Running], None).await
    }

    /// Processes in any of the given statuses, optionally restricted to
    /// tasks or non-tasks.
    pub async fn by_statuses(
        &self,
        statuses: &[ProcessStatus],
        is_task: Option<bool>,
    ) -> Result<Vec<ProcessRecord>> {
        let status_strs: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();

        let rows = match is_task {
            Some(is_task) => {
                sqlx::query(
                    r#"
                    SELECT process_id, workflow_name, last_status, last_step, assignee,
                           failed_reason, traceback, workflow_digest, is_task,
                           created_by, created_at, last_modified_at
                    FROM processes
                    WHERE last_status = ANY($1) AND is_task = $2
                    ORDER BY last_modified_at ASC
                    "#,
                )
                .bind(&status_strs)
                .bind(is_task)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT process_id, workflow_name, last_status, last_step, assignee,
                           failed_reason, traceback, workflow_digest, is_task,
                           created_by, created_at, last_modified_at
                    FROM processes
                    WHERE last_status = ANY($1)
                    ORDER BY last_modified_at ASC
                    "#,
                )
                .bind(&status_strs)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.iter().map(|r| map_process(r)).collect())
    }

    /// Status counts grouped into processes and tasks.
    pub async fn status_counts(&self) -> Result<StatusCounts> {
        let rows = sqlx::query(
            r#"
            SELECT is_task, last_status, COUNT(*) AS num
            FROM processes
            GROUP BY is_task, last_status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let is_task: bool = row.get("is_task");
            let status: String = row.get("last_status");
            let num: i64 = row.get("num");
            if is_task {
                counts.task_counts.insert(status, num);
            } else {
                counts.process_counts.insert(status, num);
            }
        }
        Ok(counts)
    }

    /// Filtered, sorted, paged process listing plus the unpaged total.
    pub async fn list(
        &self,
        filters: &[ProcessFilter],
        sorts: &[ProcessSort],
        range: Option<(i64, i64)>,
    ) -> Result<(Vec<ProcessRecord>, i64)> {
        let mut count_query: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM processes");
        push_filters(&mut count_query, filters)?;
        let total: i64 = count_query
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT process_id, workflow_name, last_status, last_step, assignee, \
             failed_reason, traceback, workflow_digest, is_task, \
             created_by, created_at, last_modified_at FROM processes",
        );
        push_filters(&mut query, filters)?;

        if sorts.is_empty() {
            query.push(" ORDER BY last_modified_at DESC");
        } else {
            query.push(" ORDER BY ");
            for (i, sort) in sorts.iter().enumerate() {
                if i > 0 {
                    query.push(", ");
                }
                query.push(sort.field.column());
                query.push(if sort.descending { " DESC" } else { " ASC" });
            }
        }

        if let Some((start, end)) = range {
            if start < 0 || end < start {
                return Err(RatchetError::RangeInvalid(format!("{},{}", start, end)));
            }
            query.push(" OFFSET ");
            query.push_bind(start);
            query.push(" LIMIT ");
            query.push_bind(end - start + 1);
        }

        let rows = query.build().fetch_all(&self.pool).await?;
        Ok((rows.iter().map(|r| map_process(r)).collect(), total))
    }

    /// Persist an input snapshot (initial state or a resume's user input).
    pub async fn save_input_state(
        &self,
        process_id: Uuid,
        category: &str,
        state: &State,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO input_states (input_state_id, process_id, category, state, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(process_id)
        .bind(category)
        .bind(serde_json::Value::Object(state.clone()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The initial input snapshot of a process, if recorded.
    pub async fn initial_input_state(&self, process_id: Uuid) -> Result<Option<State>> {
        let row = sqlx::query(
            r#"
            SELECT state FROM input_states
            WHERE process_id = $1 AND category = 'initial_state'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(process_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| as_state(r.get::<serde_json::Value, _>("state"))))
    }
}

/// Instruction for the step row write of one transition.
#[derive(Debug, Clone)]
pub enum StepRowWrite {
    Append {
        name: String,
        status: StepStatus,
        state: State,
        created_by: String,
    },
    /// Overwrite an existing row in place (retry compaction and the
    /// `__replace_last_state` escape hatch). The row keeps its name and
    /// creator.
    Overwrite {
        step_id: Uuid,
        name: String,
        status: StepStatus,
        state: State,
        created_by: String,
    },
}

/// Aggregate status counts split by task flag.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StatusCounts {
    pub process_counts: std::collections::HashMap<String, i64>,
    pub task_counts: std::collections::HashMap<String, i64>,
}

fn push_filters(query: &mut QueryBuilder<Postgres>, filters: &[ProcessFilter]) -> Result<()> {
    for (i, filter) in filters.iter().enumerate() {
        query.push(if i == 0 { " WHERE " } else { " AND " });
        query.push(filter.field.column());
        match filter.field {
            ProcessField::IsTask => {
                let value: bool = filter
                    .value
                    .parse()
                    .map_err(|_| RatchetError::FilterInvalid(filter.value.clone()))?;
                query.push(" = ");
                query.push_bind(value);
            }
            _ => {
                query.push(" = ");
                query.push_bind(filter.value.clone());
            }
        }
    }
    Ok(())
}

fn parse_process_status(s: &str) -> Result<ProcessStatus> {
    ProcessStatus::parse(s)
        .ok_or_else(|| RatchetError::Database(format!("Unknown process status '{}'", s)))
}

fn map_process(row: &sqlx::postgres::PgRow) -> ProcessRecord {
    let status: String = row.get("last_status");
    let assignee: String = row.get("assignee");
    ProcessRecord {
        process_id: row.get("process_id"),
        workflow_name: row.get("workflow_name"),
        last_status: ProcessStatus::parse(&status).unwrap_or(ProcessStatus::Failed),
        last_step: row.get("last_step"),
        assignee: Assignee::parse(&assignee),
        failed_reason: row.get("failed_reason"),
        traceback: row.get("traceback"),
        workflow_digest: row.get("workflow_digest"),
        is_task: row.get("is_task"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        last_modified_at: row.get("last_modified_at"),
    }
}

fn map_step(row: &sqlx::postgres::PgRow) -> Result<ProcessStepRecord> {
    let status: String = row.get("status");
    Ok(ProcessStepRecord {
        step_id: row.get("step_id"),
        process_id: row.get("process_id"),
        name: row.get("name"),
        status: StepStatus::parse(&status)
            .ok_or_else(|| RatchetError::Database(format!("Unknown step status '{}'", status)))?,
        state: as_state(row.get::<serde_json::Value, _>("state")),
        created_by: row.get("created_by"),
        executed_at: row.get("executed_at"),
        commit_hash: row.get("commit_hash"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_field_parse() {
        assert_eq!(ProcessField::parse("status"), Some(ProcessField::Status));
        assert_eq!(ProcessField::parse("creator"), Some(ProcessField::CreatedBy));
        assert_eq!(ProcessField::parse("modified"), Some(ProcessField::Modified));
        assert_eq!(ProcessField::parse("nope"), None);
    }

    #[test]
    fn test_process_field_columns() {
        assert_eq!(ProcessField::Status.column(), "last_status");
        assert_eq!(ProcessField::Workflow.column(), "workflow_name");
        assert_eq!(ProcessField::Started.column(), "created_at");
    }
}
