use std::future::Future;
use std::pin::Pin;

use ratchet_core::error::Result;
use ratchet_core::signal::Signal;
use ratchet_core::state::failure_state;
use ratchet_core::workflow::{ProcessStat, Step};

use super::plan::plan_step_log;
use super::StepLog;
use crate::broadcast::Broadcaster;
use crate::store::{EngineSettingsStore, ProcessStore};

/// Database-backed step log shared by both executors.
///
/// A failed write is retried once with a `Failed` signal derived from the
/// write error, so the process row still reflects the breakage; a second
/// failure propagates to the executor's fallback path, which writes the
/// error directly onto the process row.
#[derive(Clone)]
pub struct DbStepLog {
    store: ProcessStore,
    settings: EngineSettingsStore,
    broadcaster: Broadcaster,
}

impl DbStepLog {
    pub fn new(store: ProcessStore, settings: EngineSettingsStore, broadcaster: Broadcaster) -> Self {
        Self {
            store,
            settings,
            broadcaster,
        }
    }

    async fn log_once(
        &self,
        stat: &ProcessStat,
        step: &Step,
        signal: Signal,
        completes_workflow: bool,
    ) -> Result<Signal> {
        let last = self.store.last_step(stat.process_id).await?;
        let plan = plan_step_log(
            &stat.current_user,
            step,
            signal,
            stat.workflow.is_task(),
            completes_workflow,
            last.as_ref(),
        );

        let record = self
            .store
            .log_step(stat.process_id, &plan.update, plan.row)
            .await?;

        // A broadcast failure fails the step so the regression is visible
        // in the process log rather than silently dropping updates.
        self.broadcaster
            .broadcast_process_update(stat.process_id)
            .await?;

        Ok(Signal::from_persisted(record.status, record.state))
    }
}

impl StepLog for DbStepLog {
    fn log<'a>(
        &'a self,
        stat: &'a ProcessStat,
        step: &'a Step,
        signal: Signal,
        completes_workflow: bool,
    ) -> Pin<Box<dyn Future<Output = Result<Signal>> + Send + 'a>> {
        Box::pin(async move {
            match self.log_once(stat, step, signal, completes_workflow).await {
                Ok(stored) => Ok(stored),
                Err(e) => {
                    tracing::error!(
                        process_id = %stat.process_id,
                        step = %step.name,
                        error = %e,
                        "Failed to save step"
                    );
                    let failure =
                        Signal::Failed(failure_state(error_class(&e), &e.to_string(), None));
                    self.log_once(stat, step, failure, false).await
                }
            }
        })
    }

    fn engine_paused<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move { Ok(self.settings.get().await?.global_lock) })
    }
}

fn error_class(e: &ratchet_core::error::RatchetError) -> &'static str {
    use ratchet_core::error::RatchetError;
    match e {
        RatchetError::Sql(_) | RatchetError::Database(_) => "DatabaseError",
        RatchetError::Broker(_) => "BrokerError",
        _ => "InternalError",
    }
}
