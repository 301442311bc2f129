mod logstep;
mod plan;
mod recover;

pub use logstep::DbStepLog;
pub use plan::{plan_step_log, StepLogPlan};
pub use recover::{ensure_digest_matches, recover, restore_log};

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

use ratchet_core::error::Result;
use ratchet_core::signal::Signal;
use ratchet_core::state::{failure_state, State};
use ratchet_core::workflow::{ProcessStat, Step};

/// Durable step log injected into the workflow loop.
///
/// `log` must commit the transition before returning; its result is the
/// state as stored, which the loop continues from. `engine_paused` is
/// re-read between steps for the cooperative pause.
pub trait StepLog: Send + Sync {
    fn log<'a>(
        &'a self,
        stat: &'a ProcessStat,
        step: &'a Step,
        signal: Signal,
        completes_workflow: bool,
    ) -> Pin<Box<dyn Future<Output = Result<Signal>> + Send + 'a>>;

    fn engine_paused<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;
}

/// Drive a process to its next non-continuable boundary.
///
/// Each step is executed at most once per attempt: the outcome is durably
/// logged before the loop advances, so a crash between execution and
/// commit re-runs the step after recovery. Step bodies should be
/// idempotent for that reason.
pub async fn run_workflow(pstat: &ProcessStat, log: &dyn StepLog) -> Result<Signal> {
    let mut state = pstat.state.clone();
    let steps = pstat.remaining_steps.clone();
    let total = steps.len();

    for (index, step) in steps.into_iter().enumerate() {
        if log.engine_paused().await? {
            tracing::info!(
                process_id = %pstat.process_id,
                step = %step.name,
                "Engine is locked, yielding at step boundary"
            );
            return Ok(state);
        }

        let outcome = execute_step(&step, state.clone().into_state());
        let completes_workflow = index + 1 == total;
        state = log.log(pstat, &step, outcome, completes_workflow).await?;

        if !state.is_continuable() {
            return Ok(state);
        }
    }

    if state.is_continuable() {
        state = Signal::Complete(state.into_state());
    }
    Ok(state)
}

/// Terminating variant of the workflow loop: executes no remaining steps
/// and appends a terminal abort row. A currently-executing step body is
/// not interrupted; the next boundary observes the abort.
pub async fn abort_workflow(pstat: &ProcessStat, log: &dyn StepLog) -> Result<Signal> {
    let step = Step::new("Aborted", Signal::Abort);
    let signal = Signal::Abort(pstat.state.clone().into_state());
    log.log(pstat, &step, signal, false).await
}

/// Run a step body, converting a panic into a `Failed` signal so it is
/// persisted like any other step error.
pub fn execute_step(step: &Step, state: State) -> Signal {
    match std::panic::catch_unwind(AssertUnwindSafe(|| (step.run)(state))) {
        Ok(signal) => signal,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(step = %step.name, error = %message, "Step body panicked");
            Signal::Failed(failure_state("Panic", &message, None))
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use ratchet_core::signal::ProcessStatus;
    use ratchet_core::state::as_state;
    use ratchet_core::workflow::{Target, Workflow};

    use crate::store::{ProcessStepRecord, ProcessUpdate, StepRowWrite};

    /// In-memory step log driving the same planning logic as the database
    /// implementation, so the loop can be exercised without Postgres.
    #[derive(Default)]
    struct MemoryStepLog {
        paused: AtomicBool,
        rows: Mutex<Vec<ProcessStepRecord>>,
        last_update: Mutex<Option<ProcessUpdate>>,
        broadcasts: Mutex<Vec<Uuid>>,
    }

    impl MemoryStepLog {
        fn statuses(&self) -> Vec<ratchet_core::signal::StepStatus> {
            self.rows.lock().unwrap().iter().map(|r| r.status).collect()
        }

        fn row_names(&self) -> Vec<String> {
            self.rows.lock().unwrap().iter().map(|r| r.name.clone()).collect()
        }

        fn last_status(&self) -> Option<ProcessStatus> {
            self.last_update.lock().unwrap().as_ref().map(|u| u.last_status)
        }

        fn apply(&self, stat: &ProcessStat, step: &Step, signal: Signal, completes: bool) -> Signal {
            let mut rows = self.rows.lock().unwrap();
            let plan = plan_step_log(
                &stat.current_user,
                step,
                signal,
                stat.workflow.is_task(),
                completes,
                rows.last(),
            );

            let record = match plan.row {
                StepRowWrite::Append {
                    name,
                    status,
                    state,
                    created_by,
                } => {
                    let record = ProcessStepRecord {
                        step_id: Uuid::new_v4(),
                        process_id: stat.process_id,
                        name,
                        status,
                        state,
                        created_by,
                        executed_at: Utc::now(),
                        commit_hash: None,
                    };
                    rows.push(record.clone());
                    record
                }
                StepRowWrite::Overwrite {
                    step_id,
                    status,
                    state,
                    ..
                } => {
                    let row = rows
                        .iter_mut()
                        .find(|r| r.step_id == step_id)
                        .expect("overwrite target exists");
                    row.status = status;
                    row.state = state;
                    row.executed_at = Utc::now();
                    row.clone()
                }
            };

            *self.last_update.lock().unwrap() = Some(plan.update);
            self.broadcasts.lock().unwrap().push(stat.process_id);
            Signal::from_persisted(record.status, record.state)
        }
    }

    impl StepLog for MemoryStepLog {
        fn log<'a>(
            &'a self,
            stat: &'a ProcessStat,
            step: &'a Step,
            signal: Signal,
            completes_workflow: bool,
        ) -> Pin<Box<dyn Future<Output = Result<Signal>> + Send + 'a>> {
            let result = self.apply(stat, step, signal, completes_workflow);
            Box::pin(async move { Ok(result) })
        }

        fn engine_paused<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
            let paused = self.paused.load(Ordering::SeqCst);
            Box::pin(async move { Ok(paused) })
        }
    }

    fn stat_for(workflow: Workflow) -> ProcessStat {
        let workflow = Arc::new(workflow);
        ProcessStat::new(
            Uuid::new_v4(),
            workflow.clone(),
            Signal::Success(State::new()),
            workflow.steps.clone(),
            "alice",
            None,
        )
    }

    #[tokio::test]
    async fn test_happy_path_runs_to_completion() {
        let wf = Workflow::new("wf", Target::Create)
            .step(Step::new("a", Signal::Success))
            .step(Step::new("b", Signal::Success))
            .step(Step::new("c", Signal::Success));
        let stat = stat_for(wf);
        let log = MemoryStepLog::default();

        let result = run_workflow(&stat, &log).await.unwrap();

        assert!(result.is_complete());
        assert_eq!(log.row_names(), vec!["a", "b", "c"]);
        assert!(log.statuses().iter().all(|s| *s == ratchet_core::signal::StepStatus::Success));
        assert_eq!(log.last_status(), Some(ProcessStatus::Completed));
        // One broadcast per logged step.
        assert_eq!(log.broadcasts.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_state_threads_through_steps() {
        let wf = Workflow::new("wf", Target::Create)
            .step(Step::new("a", |mut s: State| {
                s.insert("a_ran".into(), json!(1));
                Signal::Success(s)
            }))
            .step(Step::new("b", |mut s: State| {
                let prev = s.get("a_ran").cloned().unwrap_or(json!(0));
                s.insert("b_saw".into(), prev);
                Signal::Success(s)
            }));
        let stat = stat_for(wf);
        let log = MemoryStepLog::default();

        let result = run_workflow(&stat, &log).await.unwrap();
        assert_eq!(result.state()["b_saw"], json!(1));
    }

    #[tokio::test]
    async fn test_suspend_yields_to_caller() {
        let wf = Workflow::new("wf", Target::Create)
            .step(Step::new("a", Signal::Success))
            .step(Step::new("b", Signal::Suspend))
            .step(Step::new("c", Signal::Success));
        let stat = stat_for(wf);
        let log = MemoryStepLog::default();

        let result = run_workflow(&stat, &log).await.unwrap();

        assert!(result.is_suspend());
        // Step c never ran.
        assert_eq!(log.row_names(), vec!["a", "b"]);
        assert_eq!(log.last_status(), Some(ProcessStatus::Suspended));
    }

    #[tokio::test]
    async fn test_engine_pause_yields_without_logging() {
        let wf = Workflow::new("wf", Target::Create)
            .step(Step::new("a", Signal::Success))
            .step(Step::new("b", Signal::Success));
        let stat = stat_for(wf);
        let log = MemoryStepLog::default();
        log.paused.store(true, Ordering::SeqCst);

        let result = run_workflow(&stat, &log).await.unwrap();

        assert!(result.is_continuable());
        assert!(log.row_names().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_step_is_logged_as_failed() {
        let wf = Workflow::new("wf", Target::Create)
            .step(Step::new("explode", |_s: State| -> Signal {
                panic!("kaboom");
            }))
            .step(Step::new("after", Signal::Success));
        let stat = stat_for(wf);
        let log = MemoryStepLog::default();

        let result = run_workflow(&stat, &log).await.unwrap();

        assert!(result.is_failed());
        assert_eq!(result.state()["class"], json!("Panic"));
        assert_eq!(result.state()["error"], json!("kaboom"));
        assert_eq!(log.row_names(), vec!["explode"]);
    }

    #[tokio::test]
    async fn test_repeated_failure_collapses_rows() {
        let wf = Workflow::new("wf", Target::Create).step(Step::new("flaky", |_s: State| {
            Signal::Failed(failure_state("ValueError", "x", None))
        }));
        let stat = stat_for(wf);
        let log = MemoryStepLog::default();

        for _ in 0..4 {
            let result = run_workflow(&stat, &log).await.unwrap();
            assert!(result.is_failed());
        }

        let rows = log.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state["retries"], json!(3));
        assert_eq!(rows[0].state["executed_at"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_abort_appends_terminal_row() {
        let wf = Workflow::new("wf", Target::Create)
            .step(Step::new("a", Signal::Success))
            .step(Step::new("b", Signal::Suspend));
        let stat = stat_for(wf);
        let log = MemoryStepLog::default();

        run_workflow(&stat, &log).await.unwrap();
        let result = abort_workflow(&stat, &log).await.unwrap();

        assert!(result.is_abort());
        assert_eq!(log.row_names(), vec!["a", "b", "Aborted"]);
        assert_eq!(log.last_status(), Some(ProcessStatus::Aborted));
    }

    #[tokio::test]
    async fn test_recovered_run_matches_fresh_run() {
        // Deterministic workflow: run once from scratch, then replay from a
        // mid-run recovery point; terminal states must match.
        fn build() -> Workflow {
            Workflow::new("wf", Target::Create)
                .step(Step::new("a", |mut s: State| {
                    s.insert("a".into(), json!("done"));
                    Signal::Success(s)
                }))
                .step(Step::new("b", |mut s: State| {
                    s.insert("b".into(), json!("done"));
                    Signal::Success(s)
                }))
        }

        let fresh = stat_for(build());
        let fresh_log = MemoryStepLog::default();
        let fresh_result = run_workflow(&fresh, &fresh_log).await.unwrap();

        // Persist only step a, then recover.
        let wf = Arc::new(build());
        let partial_log = vec![Signal::Success(as_state(json!({"a": "done"})))];
        let (state, remaining) = recover(&wf, &partial_log);
        let resumed = ProcessStat::new(Uuid::new_v4(), wf, state, remaining, "alice", None);

        let log = MemoryStepLog::default();
        let resumed_result = run_workflow(&resumed, &log).await.unwrap();

        assert_eq!(fresh_result.into_state(), resumed_result.into_state());
    }
}
