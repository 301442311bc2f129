use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use uuid::Uuid;

use ratchet_core::error::Result;
use ratchet_core::settings::WorkerStatus;
use ratchet_core::signal::ProcessStatus;
use ratchet_core::state::State;
use ratchet_core::workflow::ProcessStat;

use super::{ExecutionContext, ExecutorContext};
use crate::store::ProcessRecord;

/// In-process executor: a bounded pool of background tasks, each driving
/// one process to its next non-continuable boundary.
pub struct PoolExecutor {
    ctx: ExecutorContext,
    semaphore: Arc<Semaphore>,
    max_workers: usize,
    queued: Arc<AtomicI64>,
    running: Arc<AtomicI64>,
}

impl PoolExecutor {
    pub fn new(ctx: ExecutorContext, max_workers: usize) -> Self {
        Self {
            ctx,
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
            max_workers: max_workers.max(1),
            queued: Arc::new(AtomicI64::new(0)),
            running: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Submit a process to the pool. Returns once the task is scheduled;
    /// in testing mode the task is awaited so results are deterministic.
    async fn submit(&self, pstat: ProcessStat) -> Result<Uuid> {
        let process_id = pstat.process_id;
        let ctx = self.ctx.clone();
        let semaphore = self.semaphore.clone();
        let queued = self.queued.clone();
        let running = self.running.clone();

        queued.fetch_add(1, Ordering::SeqCst);
        let handle = tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("pool semaphore closed");
            queued.fetch_sub(1, Ordering::SeqCst);
            running.fetch_add(1, Ordering::SeqCst);

            let result = ctx.execute(pstat).await;

            running.fetch_sub(1, Ordering::SeqCst);
            result
        });

        if self.ctx.testing {
            handle
                .await
                .map_err(|e| ratchet_core::error::RatchetError::Internal(e.to_string()))??;
        }

        Ok(process_id)
    }

    /// Wait until every in-flight process has reached a boundary.
    pub async fn drain(&self) {
        let _permits = self
            .semaphore
            .acquire_many(self.max_workers as u32)
            .await
            .expect("pool semaphore closed");
    }
}

impl ExecutionContext for PoolExecutor {
    fn start<'a>(
        &'a self,
        pstat: ProcessStat,
    ) -> Pin<Box<dyn Future<Output = Result<Uuid>> + Send + 'a>> {
        Box::pin(self.submit(pstat))
    }

    fn resume<'a>(
        &'a self,
        record: &'a ProcessRecord,
        user_inputs: Vec<State>,
        user: Option<String>,
        _expected: &'a [ProcessStatus],
    ) -> Pin<Box<dyn Future<Output = Result<Uuid>> + Send + 'a>> {
        Box::pin(async move {
            let pstat = self
                .ctx
                .prepare_resume(record.process_id, user_inputs, user)
                .await?;
            self.submit(pstat).await
        })
    }

    fn worker_status<'a>(&'a self) -> Pin<Box<dyn Future<Output = WorkerStatus> + Send + 'a>> {
        Box::pin(async move {
            WorkerStatus {
                executor_type: "pool".to_string(),
                number_of_workers_online: self.max_workers as i64,
                number_of_queued_jobs: self.queued.load(Ordering::SeqCst).max(0),
                number_of_running_jobs: self.running.load(Ordering::SeqCst).max(0),
            }
        })
    }
}
