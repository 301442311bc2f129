use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use ratchet_core::error::{RatchetError, Result};
use ratchet_core::registry::WorkflowRegistry;
use ratchet_core::signal::{ProcessStatus, Signal};
use ratchet_core::state::{
    State, CALLBACK_PROGRESS_KEY, CALLBACK_RESULT_KEY, CALLBACK_TOKEN_KEY,
    DEFAULT_CALLBACK_RESULT_KEY, REMOVE_KEYS_KEY,
};
use ratchet_core::workflow::{
    auth_callbacks, ensure_present, steps_for_auth, validate_form, ProcessStat, UserClaims,
};
use ratchet_core::SYSTEM_USER;

use crate::distlock::DistLockManager;
use crate::executor::{ExecutionContext, ExecutorContext};
use crate::runtime::{abort_workflow, ensure_digest_matches};
use crate::store::{
    ProcessRecord, ProcessStepRecord, ProcessSubscription, ProcessSubscriptionStore, StatusCounts,
};

use std::sync::Arc;

/// Statuses a caller-initiated resume accepts.
const RESUMABLE: &[ProcessStatus] = &[
    ProcessStatus::Created,
    ProcessStatus::Suspended,
    ProcessStatus::Waiting,
    ProcessStatus::Failed,
    ProcessStatus::Resumed,
    ProcessStatus::ApiUnavailable,
    ProcessStatus::InconsistentData,
];

/// Task statuses eligible for the bulk resume-all operation.
pub const RESUME_ALL_STATUSES: &[ProcessStatus] = &[
    ProcessStatus::Failed,
    ProcessStatus::Waiting,
    ProcessStatus::ApiUnavailable,
    ProcessStatus::InconsistentData,
];

/// Entry API over the process engine: create, resume, callback, abort and
/// the bulk coordinators. Transport layers call into this service and
/// stream progress through the broadcast fabric.
#[derive(Clone)]
pub struct ProcessService {
    ctx: ExecutorContext,
    executor: Arc<dyn ExecutionContext>,
    distlock: DistLockManager,
}

impl ProcessService {
    pub fn new(
        ctx: ExecutorContext,
        executor: Arc<dyn ExecutionContext>,
        distlock: DistLockManager,
    ) -> Self {
        Self {
            ctx,
            executor,
            distlock,
        }
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.ctx.registry
    }

    pub fn store(&self) -> crate::store::ProcessStore {
        self.ctx.process_store()
    }

    fn subscriptions(&self) -> ProcessSubscriptionStore {
        ProcessSubscriptionStore::new(self.ctx.db.pool().clone())
    }

    /// Start a new process for a workflow.
    ///
    /// The engine lock is not required to be off: starting during a pause
    /// persists the `created` row and the executor defers at the first
    /// step boundary.
    pub async fn start_process(
        &self,
        workflow_key: &str,
        user_inputs: Vec<State>,
        user: &str,
        claims: Option<&UserClaims>,
    ) -> Result<Uuid> {
        let workflow = self
            .ctx
            .registry
            .get(workflow_key)
            .ok_or_else(|| RatchetError::WorkflowUnknown(workflow_key.to_string()))?;
        ensure_present(&workflow)?;

        if !workflow.may_start(claims) {
            return Err(RatchetError::Forbidden(format!(
                "User is not authorized to execute '{}' workflow",
                workflow_key
            )));
        }

        let process_id = Uuid::new_v4();
        let mut initial_state = State::new();
        initial_state.insert("process_id".into(), json!(process_id.to_string()));
        initial_state.insert("reporter".into(), json!(user));
        initial_state.insert("workflow_name".into(), json!(workflow_key));
        initial_state.insert("workflow_target".into(), json!(workflow.target.as_str()));

        let mut state =
            validate_form(workflow.initial_form.as_ref(), &initial_state, &user_inputs)?;
        for (key, value) in &initial_state {
            state.insert(key.clone(), value.clone());
        }

        let now = Utc::now();
        let record = ProcessRecord {
            process_id,
            workflow_name: workflow.name.clone(),
            last_status: ProcessStatus::Created,
            last_step: None,
            assignee: ratchet_core::workflow::Assignee::System,
            failed_reason: None,
            traceback: None,
            workflow_digest: Some(workflow.digest()),
            is_task: workflow.is_task(),
            created_by: user.to_string(),
            created_at: now,
            last_modified_at: now,
        };
        let store = self.ctx.process_store();
        store.create(&record).await?;
        store
            .save_input_state(process_id, "initial_state", &state)
            .await?;

        let pstat = ProcessStat::new(
            process_id,
            workflow.clone(),
            Signal::Success(state),
            workflow.steps.clone(),
            user,
            claims.cloned(),
        );

        self.executor.start(pstat).await
    }

    /// Resume a suspended, failed or waiting process.
    pub async fn resume_process(
        &self,
        process_id: Uuid,
        user_inputs: Vec<State>,
        user: &str,
        claims: Option<&UserClaims>,
    ) -> Result<Uuid> {
        let record = self.ctx.process_store().get(process_id).await?;

        if !RESUMABLE.contains(&record.last_status) {
            return Err(RatchetError::BadStatus(format!(
                "Resuming a {} workflow is not possible",
                record.last_status.as_str()
            )));
        }

        let pstat = self.ctx.load_process(&record).await?;
        ensure_present(&pstat.workflow)?;
        ensure_digest_matches(&pstat.workflow, record.workflow_digest.as_deref())?;

        self.authorize_resume(&record, &pstat, claims)?;

        // Surface validation errors to the caller before scheduling.
        validate_form(pstat.current_form(), pstat.state.state(), &user_inputs)?;

        let id = self
            .executor
            .resume(&record, user_inputs, Some(user.to_string()), RESUMABLE)
            .await?;

        if let Err(e) = self.ctx.broadcaster.invalidate_status_counts().await {
            tracing::warn!(error = %e, "Failed to broadcast status count invalidation");
        }
        Ok(id)
    }

    fn authorize_resume(
        &self,
        record: &ProcessRecord,
        pstat: &ProcessStat,
        claims: Option<&UserClaims>,
    ) -> Result<()> {
        let steps = steps_for_auth(&pstat.workflow, &pstat.remaining_steps);
        let (resume_auth, retry_auth) = auth_callbacks(&steps, &pstat.workflow);

        match record.last_status {
            ProcessStatus::Suspended => {
                if let Some(auth) = resume_auth {
                    if !auth(claims) {
                        return Err(RatchetError::Forbidden(
                            "User is not authorized to resume step".to_string(),
                        ));
                    }
                }
            }
            ProcessStatus::Failed
            | ProcessStatus::Waiting
            | ProcessStatus::ApiUnavailable
            | ProcessStatus::InconsistentData => {
                if let Some(auth) = retry_auth {
                    if !auth(claims) {
                        return Err(RatchetError::Forbidden(
                            "User is not authorized to retry step".to_string(),
                        ));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Continue a process awaiting data from an external callback.
    pub async fn continue_awaiting_process(
        &self,
        process_id: Uuid,
        token: &str,
        input_data: State,
    ) -> Result<Uuid> {
        let record = self.ctx.process_store().get(process_id).await?;
        if record.last_status != ProcessStatus::AwaitingCallback {
            return Err(RatchetError::BadStatus(
                "This process is not in an awaiting state".to_string(),
            ));
        }

        let pstat = self.ctx.load_process(&record).await?;
        ensure_callback_token(&pstat, token)?;

        let state = pstat.state.state();
        let result_key = state
            .get(CALLBACK_RESULT_KEY)
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_CALLBACK_RESULT_KEY)
            .to_string();

        let mut new_state = state.clone();
        new_state.insert(result_key, Value::Object(input_data));
        self.ctx
            .process_store()
            .replace_last_step_state(process_id, new_state)
            .await?;

        self.executor
            .resume(
                &record,
                Vec::new(),
                None,
                &[ProcessStatus::AwaitingCallback],
            )
            .await
    }

    /// Record progress data for an awaiting process without resuming it.
    pub async fn update_awaiting_process_progress(
        &self,
        process_id: Uuid,
        token: &str,
        data: Value,
    ) -> Result<Uuid> {
        let record = self.ctx.process_store().get(process_id).await?;
        if record.last_status != ProcessStatus::AwaitingCallback {
            return Err(RatchetError::BadStatus(
                "This process is not in an awaiting state".to_string(),
            ));
        }

        let pstat = self.ctx.load_process(&record).await?;
        ensure_callback_token(&pstat, token)?;

        let mut new_state = pstat.state.state().clone();
        new_state.insert(CALLBACK_PROGRESS_KEY.to_string(), data);
        // Progress is transient: strip it again on the next commit.
        new_state.insert(REMOVE_KEYS_KEY.to_string(), json!([CALLBACK_PROGRESS_KEY]));

        self.ctx
            .process_store()
            .replace_last_step_state(process_id, new_state)
            .await?;

        if let Err(e) = self.ctx.broadcaster.broadcast_process_update(process_id).await {
            tracing::warn!(process_id = %process_id, error = %e, "Failed to broadcast progress");
        }
        Ok(process_id)
    }

    /// Abort a process: no further steps run, a terminal abort row is
    /// appended. A step body that is mid-flight is not interrupted.
    pub async fn abort_process(&self, process_id: Uuid, user: &str) -> Result<Signal> {
        let record = self.ctx.process_store().get(process_id).await?;
        let mut pstat = self.ctx.load_process(&record).await?;
        pstat.current_user = user.to_string();

        let log = self.ctx.step_log();
        abort_workflow(&pstat, &log).await
    }

    /// Hard-delete a task and its step log.
    pub async fn delete_process(&self, process_id: Uuid) -> Result<()> {
        let record = self.ctx.process_store().get(process_id).await?;
        if !record.is_task {
            return Err(RatchetError::NotTask);
        }
        if record.last_status == ProcessStatus::Running {
            return Err(RatchetError::BadStatus(
                "Cannot delete a running task".to_string(),
            ));
        }

        self.ctx.process_store().delete(process_id).await?;

        if let Err(e) = self.ctx.broadcaster.invalidate_status_counts().await {
            tracing::warn!(error = %e, "Failed to broadcast status count invalidation");
        }
        if let Err(e) = self.ctx.broadcaster.broadcast_process_update(process_id).await {
            tracing::warn!(error = %e, "Failed to broadcast process deletion");
        }
        Ok(())
    }

    /// Tasks eligible for resume-all.
    pub async fn resume_all_candidates(&self) -> Result<Vec<ProcessRecord>> {
        self.ctx
            .process_store()
            .by_statuses(RESUME_ALL_STATUSES, Some(true))
            .await
    }

    /// Resume many processes in the background, at most once cluster-wide.
    ///
    /// Returns `false` without side effects when another resume-all run
    /// holds the advisory lock. The lock TTL bounds the critical section
    /// of an orphaned coordinator.
    pub async fn async_resume_processes(
        &self,
        processes: Vec<ProcessRecord>,
        user: &str,
    ) -> Result<bool> {
        let ttl = Duration::from_secs(std::cmp::max(30, processes.len() as u64 / 10));
        let Some(lock) = self.distlock.try_acquire("resume-all", ttl).await else {
            return Ok(false);
        };

        let service = self.clone();
        let user = user.to_string();
        let task = async move {
            for process in processes {
                match service.ctx.process_store().get(process.process_id).await {
                    Ok(current) if current.last_status == ProcessStatus::Running => {
                        tracing::info!(process_id = %process.process_id, "Cannot resume a running process");
                    }
                    Ok(current) if current.last_status == ProcessStatus::Resumed => {
                        tracing::info!(process_id = %process.process_id, "Cannot resume a resumed process");
                    }
                    Ok(current) => {
                        if let Err(e) = service
                            .resume_process(current.process_id, Vec::new(), &user, None)
                            .await
                        {
                            tracing::error!(
                                process_id = %process.process_id,
                                error = %e,
                                "Failed to resume process"
                            );
                        }
                    }
                    Err(e) => {
                        tracing::error!(
                            process_id = %process.process_id,
                            error = %e,
                            "Failed to load process for resume"
                        );
                    }
                }
            }
            tracing::info!("Completed resuming processes");
            service.distlock.release(lock).await;
        };

        if self.ctx.testing {
            task.await;
        } else {
            tokio::spawn(task);
        }
        Ok(true)
    }

    /// Transition the engine lock, draining or re-arming processes.
    ///
    /// Unlocking resumes every `running` row: those legitimately remain
    /// from a crash or from draining, and re-running their current step
    /// requires step bodies to be idempotent. A database error aborts and
    /// returns `None`; any other anomaly locks the engine and returns
    /// `None` so an operator can intervene.
    pub async fn marshall_processes(
        &self,
        new_global_lock: bool,
    ) -> Option<ratchet_core::settings::EngineSettings> {
        match self.try_marshall(new_global_lock).await {
            Ok(settings) => Some(settings),
            Err(RatchetError::Sql(_)) | Err(RatchetError::Database(_)) => {
                tracing::error!("Encountered a database error, aborting and stopping");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "Encountered an anomaly, locking the engine; manual intervention necessary");
                if let Err(lock_err) = self.ctx.settings_store().set_global_lock(true).await {
                    tracing::error!(error = %lock_err, "Failed to lock the engine");
                }
                None
            }
        }
    }

    async fn try_marshall(
        &self,
        new_global_lock: bool,
    ) -> Result<ratchet_core::settings::EngineSettings> {
        let settings_store = self.ctx.settings_store();
        let previous = settings_store.set_global_lock(new_global_lock).await?;

        if previous.global_lock && !new_global_lock {
            // First node to unlock picks up the running queue.
            for record in self.ctx.process_store().running().await? {
                if let Err(e) = self
                    .executor
                    .resume(
                        &record,
                        Vec::new(),
                        Some(SYSTEM_USER.to_string()),
                        &[ProcessStatus::Running],
                    )
                    .await
                {
                    tracing::error!(
                        process_id = %record.process_id,
                        error = %e,
                        "Failed to resume running process while unlocking"
                    );
                }
            }
        } else if !previous.global_lock && new_global_lock {
            tracing::info!("Locking the engine, processes will run until the next step");
        } else {
            tracing::info!(
                global_lock = previous.global_lock,
                new_status = new_global_lock,
                "Engine is already locked or unlocked, global lock is unchanged"
            );
        }

        settings_store.get().await
    }

    /// Boot recovery: re-arm `running` rows left behind by a crash, unless
    /// the engine is locked.
    pub async fn recover_running(&self) -> Result<usize> {
        if self.ctx.settings_store().get().await?.global_lock {
            return Ok(0);
        }

        let running = self.ctx.process_store().running().await?;
        let count = running.len();
        for record in running {
            if let Err(e) = self
                .executor
                .resume(
                    &record,
                    Vec::new(),
                    Some(SYSTEM_USER.to_string()),
                    &[ProcessStatus::Running],
                )
                .await
            {
                tracing::error!(
                    process_id = %record.process_id,
                    error = %e,
                    "Failed to re-arm running process at boot"
                );
            }
        }
        Ok(count)
    }

    /// A process row with its step log and subscription linkage.
    pub async fn detail(
        &self,
        process_id: Uuid,
    ) -> Result<(ProcessRecord, Vec<ProcessStepRecord>, Vec<ProcessSubscription>)> {
        let store = self.ctx.process_store();
        let record = store.get(process_id).await?;
        let steps = store.steps(process_id).await?;
        let subscriptions = self.subscriptions().for_process(process_id).await?;
        Ok((record, steps, subscriptions))
    }

    /// Aggregate status counts for processes and tasks.
    pub async fn status_counts(&self) -> Result<StatusCounts> {
        self.ctx.process_store().status_counts().await
    }
}

/// Reject a callback whose token does not match the one issued to the
/// awaiting step.
fn ensure_callback_token(pstat: &ProcessStat, token: &str) -> Result<()> {
    let expected = pstat
        .state
        .state()
        .get(CALLBACK_TOKEN_KEY)
        .and_then(Value::as_str);
    if expected != Some(token) {
        return Err(RatchetError::TokenMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratchet_core::state::as_state;
    use ratchet_core::workflow::{Step, Target, Workflow};

    fn awaiting_stat(token: &str) -> ProcessStat {
        let workflow = Arc::new(
            Workflow::new("wf", Target::Create).step(Step::new("wait", Signal::AwaitingCallback)),
        );
        ProcessStat::new(
            Uuid::new_v4(),
            workflow.clone(),
            Signal::AwaitingCallback(as_state(json!({CALLBACK_TOKEN_KEY: token}))),
            workflow.steps.clone(),
            SYSTEM_USER,
            None,
        )
    }

    #[test]
    fn test_callback_token_check() {
        let pstat = awaiting_stat("secret");
        assert!(ensure_callback_token(&pstat, "secret").is_ok());
        assert!(matches!(
            ensure_callback_token(&pstat, "wrong"),
            Err(RatchetError::TokenMismatch)
        ));
    }

    #[test]
    fn test_callback_token_missing_from_state() {
        let workflow = Arc::new(Workflow::new("wf", Target::Create));
        let pstat = ProcessStat::new(
            Uuid::new_v4(),
            workflow,
            Signal::AwaitingCallback(State::new()),
            Vec::new(),
            SYSTEM_USER,
            None,
        );
        assert!(ensure_callback_token(&pstat, "anything").is_err());
    }

    #[test]
    fn test_resume_all_statuses() {
        assert!(RESUME_ALL_STATUSES.contains(&ProcessStatus::Failed));
        assert!(RESUME_ALL_STATUSES.contains(&ProcessStatus::ApiUnavailable));
        assert!(!RESUME_ALL_STATUSES.contains(&ProcessStatus::Running));
        assert!(!RESUME_ALL_STATUSES.contains(&ProcessStatus::Suspended));
    }
}
