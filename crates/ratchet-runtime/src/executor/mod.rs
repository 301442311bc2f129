mod pool;
mod queue;

pub use pool::PoolExecutor;
pub use queue::{QueueExecutor, QueueWorker, QueueWorkerConfig};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use uuid::Uuid;

use ratchet_core::error::Result;
use ratchet_core::registry::WorkflowRegistry;
use ratchet_core::settings::WorkerStatus;
use ratchet_core::signal::{ProcessStatus, Signal};
use ratchet_core::state::{merge_state, State};
use ratchet_core::workflow::{ensure_present, validate_form, ProcessStat};
use ratchet_core::SYSTEM_USER;

use crate::broadcast::Broadcaster;
use crate::db::Database;
use crate::runtime::{recover, restore_log, run_workflow, DbStepLog};
use crate::store::{EngineSettingsStore, ProcessRecord, ProcessStore};

/// Pluggable execution backend. `start` and `resume` persist intent and
/// hand the process to a worker; the process id is returned while
/// execution continues asynchronously.
pub trait ExecutionContext: Send + Sync {
    fn start<'a>(
        &'a self,
        pstat: ProcessStat,
    ) -> Pin<Box<dyn Future<Output = Result<Uuid>> + Send + 'a>>;

    fn resume<'a>(
        &'a self,
        record: &'a ProcessRecord,
        user_inputs: Vec<State>,
        user: Option<String>,
        expected: &'a [ProcessStatus],
    ) -> Pin<Box<dyn Future<Output = Result<Uuid>> + Send + 'a>>;

    fn worker_status<'a>(&'a self) -> Pin<Box<dyn Future<Output = WorkerStatus> + Send + 'a>>;
}

/// Everything a worker needs to advance processes. Shared by both executor
/// backends; the runtime they drive is identical.
#[derive(Clone)]
pub struct ExecutorContext {
    pub db: Database,
    pub registry: Arc<WorkflowRegistry>,
    pub broadcaster: Broadcaster,
    /// When set, executors run synchronously so tests can await results.
    pub testing: bool,
}

impl ExecutorContext {
    pub fn new(
        db: Database,
        registry: Arc<WorkflowRegistry>,
        broadcaster: Broadcaster,
        testing: bool,
    ) -> Self {
        Self {
            db,
            registry,
            broadcaster,
            testing,
        }
    }

    pub fn process_store(&self) -> ProcessStore {
        ProcessStore::new(self.db.pool().clone())
    }

    pub fn settings_store(&self) -> EngineSettingsStore {
        EngineSettingsStore::new(self.db.pool().clone())
    }

    pub fn step_log(&self) -> DbStepLog {
        DbStepLog::new(
            self.process_store(),
            self.settings_store(),
            self.broadcaster.clone(),
        )
    }

    /// Rebuild the runtime handle of a persisted process from its step log.
    ///
    /// A process without steps (created during an engine pause, or handed
    /// to a queue worker before its first step) starts from the recorded
    /// initial input state.
    pub async fn load_process(&self, record: &ProcessRecord) -> Result<ProcessStat> {
        let workflow = self.registry.get_or_removed(&record.workflow_name);
        let store = self.process_store();
        let steps = store.steps(record.process_id).await?;
        let log = restore_log(&steps)?;
        let (mut state, remaining) = recover(&workflow, &log);

        if log.is_empty() {
            if let Some(initial) = store.initial_input_state(record.process_id).await? {
                state = Signal::Success(initial);
            }
        }

        Ok(ProcessStat::new(
            record.process_id,
            workflow,
            state,
            remaining,
            SYSTEM_USER,
            None,
        ))
    }

    /// Load a process and fold validated resume inputs into its state,
    /// flipping the aggregate status to `running`.
    pub async fn prepare_resume(
        &self,
        process_id: Uuid,
        user_inputs: Vec<State>,
        user: Option<String>,
    ) -> Result<ProcessStat> {
        let store = self.process_store();
        let record = store.get(process_id).await?;
        let mut pstat = self.load_process(&record).await?;
        ensure_present(&pstat.workflow)?;

        let validated = validate_form(pstat.current_form(), pstat.state.state(), &user_inputs)?;
        if let Some(user) = user {
            pstat.current_user = user;
        }
        if !validated.is_empty() {
            store
                .save_input_state(process_id, "user_input", &validated)
                .await?;
            pstat.state = pstat.state.map(move |mut s| {
                merge_state(&mut s, validated);
                s
            });
        }

        store
            .set_last_status(process_id, ProcessStatus::Running)
            .await?;
        Ok(pstat)
    }

    /// Run a process on this worker, maintaining the running-process
    /// counter and falling back to a process-row failure when the step log
    /// itself cannot be written.
    pub async fn execute(&self, pstat: ProcessStat) -> Result<Signal> {
        let settings = self.settings_store();
        if let Err(e) = settings.adjust_running_processes(1).await {
            tracing::warn!(error = %e, "Failed to increment running process counter");
        }

        let log = self.step_log();
        let result = run_workflow(&pstat, &log).await;

        if let Err(e) = settings.adjust_running_processes(-1).await {
            tracing::warn!(error = %e, "Failed to decrement running process counter");
        }

        match result {
            Ok(signal) => Ok(signal),
            Err(e) => {
                tracing::error!(
                    process_id = %pstat.process_id,
                    error = %e,
                    "Unknown workflow failure"
                );
                if let Err(log_err) = self
                    .process_store()
                    .log_process_failure(pstat.process_id, &e.to_string(), None)
                    .await
                {
                    tracing::error!(
                        process_id = %pstat.process_id,
                        error = %log_err,
                        "Failed to write failure to process row"
                    );
                }
                Err(e)
            }
        }
    }
}
