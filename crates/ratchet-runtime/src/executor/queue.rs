use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use uuid::Uuid;

use ratchet_core::error::{RatchetError, Result};
use ratchet_core::settings::WorkerStatus;
use ratchet_core::signal::ProcessStatus;
use ratchet_core::state::State;
use ratchet_core::workflow::ProcessStat;

use super::{ExecutionContext, ExecutorContext};
use crate::store::{ProcessRecord, QueueEntry, QueueName, QueuePayload, QueueStore};

/// Queue-backed executor: the API node persists intent into named queues
/// and worker nodes drive the processes.
pub struct QueueExecutor {
    ctx: ExecutorContext,
    queue: QueueStore,
}

impl QueueExecutor {
    pub fn new(ctx: ExecutorContext) -> Self {
        let queue = QueueStore::new(ctx.db.pool().clone());
        Self { ctx, queue }
    }
}

impl ExecutionContext for QueueExecutor {
    fn start<'a>(
        &'a self,
        pstat: ProcessStat,
    ) -> Pin<Box<dyn Future<Output = Result<Uuid>> + Send + 'a>> {
        Box::pin(async move {
            let process_id = pstat.process_id;
            let payload = QueuePayload {
                user_inputs: Vec::new(),
                user: pstat.current_user.clone(),
            };
            let queue = QueueName::for_start(pstat.workflow.is_task());

            match self.queue.enqueue(queue, process_id, &payload).await {
                Ok(_) => Ok(process_id),
                Err(e) => {
                    // The freshly created process row would be stranded in
                    // `created` forever; remove it so the caller can retry.
                    tracing::warn!(
                        process_id = %process_id,
                        error = %e,
                        "Queue submission failed, deleting newly created process"
                    );
                    self.ctx.process_store().delete(process_id).await?;
                    Err(RatchetError::Broker(e.to_string()))
                }
            }
        })
    }

    fn resume<'a>(
        &'a self,
        record: &'a ProcessRecord,
        user_inputs: Vec<State>,
        user: Option<String>,
        expected: &'a [ProcessStatus],
    ) -> Pin<Box<dyn Future<Output = Result<Uuid>> + Send + 'a>> {
        Box::pin(async move {
            let store = self.ctx.process_store();

            // Flip to `resumed` under a row lock before enqueueing, so the
            // process cannot be handed out twice.
            let previous = store
                .set_last_status_guarded(record.process_id, expected, ProcessStatus::Resumed)
                .await?;

            let payload = QueuePayload {
                user_inputs,
                user: user.unwrap_or_else(|| ratchet_core::SYSTEM_USER.to_string()),
            };
            let queue = QueueName::for_resume(record.is_task);

            match self.queue.enqueue(queue, record.process_id, &payload).await {
                Ok(_) => Ok(record.process_id),
                Err(e) => {
                    tracing::warn!(
                        process_id = %record.process_id,
                        error = %e,
                        "Queue submission failed, restoring previous process status"
                    );
                    store.set_last_status(record.process_id, previous).await?;
                    Err(RatchetError::Broker(e.to_string()))
                }
            }
        })
    }

    fn worker_status<'a>(&'a self) -> Pin<Box<dyn Future<Output = WorkerStatus> + Send + 'a>> {
        Box::pin(async move {
            let queued = self.queue.depth().await.unwrap_or(0);
            let running = self
                .ctx
                .settings_store()
                .get()
                .await
                .map(|s| s.running_processes as i64)
                .unwrap_or(0);
            WorkerStatus {
                executor_type: "queue".to_string(),
                number_of_workers_online: 0,
                number_of_queued_jobs: queued,
                number_of_running_jobs: running,
            }
        })
    }
}

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct QueueWorkerConfig {
    /// Queues this worker consumes.
    pub queues: Vec<QueueName>,
    /// Maximum concurrently running processes.
    pub max_concurrent: usize,
    /// Poll interval when the queues are empty.
    pub poll_interval: Duration,
    /// Batch size for claiming entries.
    pub batch_size: i64,
}

impl Default for QueueWorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec![
                QueueName::NewWorkflows,
                QueueName::NewTasks,
                QueueName::ResumeWorkflows,
                QueueName::ResumeTasks,
            ],
            max_concurrent: 5,
            poll_interval: Duration::from_millis(200),
            batch_size: 5,
        }
    }
}

/// Background worker consuming the process queues.
///
/// Runs the exact same runtime the pool executor runs; only where the
/// `run_workflow` invocation happens differs.
pub struct QueueWorker {
    ctx: ExecutorContext,
    queue: QueueStore,
    config: QueueWorkerConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl QueueWorker {
    pub fn new(ctx: ExecutorContext, config: QueueWorkerConfig) -> Self {
        let queue = QueueStore::new(ctx.db.pool().clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            ctx,
            queue,
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Request graceful shutdown.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the worker loop until shutdown.
    pub async fn run(&self) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut shutdown_rx = self.shutdown_rx.clone();

        tracing::info!(
            queues = ?self.config.queues.iter().map(|q| q.as_str()).collect::<Vec<_>>(),
            max_concurrent = self.config.max_concurrent,
            "Queue worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Queue worker shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    let available = semaphore.available_permits() as i64;
                    if available == 0 {
                        continue;
                    }

                    let entries = match self
                        .queue
                        .claim(&self.config.queues, available.min(self.config.batch_size))
                        .await
                    {
                        Ok(entries) => entries,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to claim queue entries");
                            continue;
                        }
                    };

                    for entry in entries {
                        let permit = semaphore
                            .clone()
                            .acquire_owned()
                            .await
                            .expect("worker semaphore closed");
                        let ctx = self.ctx.clone();

                        tokio::spawn(async move {
                            if let Err(e) = process_entry(&ctx, &entry).await {
                                tracing::error!(
                                    process_id = %entry.process_id,
                                    queue = %entry.queue.as_str(),
                                    error = %e,
                                    "Failed to process queue entry"
                                );
                            }
                            drop(permit);
                        });
                    }
                }
            }
        }

        // Let in-flight processes reach their next boundary.
        let _ = semaphore
            .acquire_many(self.config.max_concurrent.max(1) as u32)
            .await;
    }
}

async fn process_entry(ctx: &ExecutorContext, entry: &QueueEntry) -> Result<()> {
    match entry.queue {
        QueueName::NewWorkflows | QueueName::NewTasks => {
            let record = ctx.process_store().get(entry.process_id).await?;
            let mut pstat = ctx.load_process(&record).await?;
            pstat.current_user = entry.payload.user.clone();
            ctx.execute(pstat).await?;
        }
        QueueName::ResumeWorkflows | QueueName::ResumeTasks => {
            let pstat = ctx
                .prepare_resume(
                    entry.process_id,
                    entry.payload.user_inputs.clone(),
                    Some(entry.payload.user.clone()),
                )
                .await?;
            ctx.execute(pstat).await?;
        }
    }
    Ok(())
}
