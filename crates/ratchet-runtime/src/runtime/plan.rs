use serde_json::Value;

use ratchet_core::signal::{ProcessStatus, Signal};
use ratchet_core::state::{
    ERROR_CLASS_KEY, ERROR_DETAILS_KEY, ERROR_MESSAGE_KEY, ERROR_STATUS_CODE_KEY,
    ERROR_TRACEBACK_KEY, EXECUTED_AT_KEY, REMOVE_KEYS_KEY, REPLACE_LAST_STATE_KEY, RETRIES_KEY,
    STEP_NAME_OVERRIDE_KEY,
};
use ratchet_core::workflow::{Assignee, Step};

use crate::store::{ProcessStepRecord, ProcessUpdate, StepRowWrite};

/// Error classes promoted to the `inconsistent_data` process status.
const INCONSISTENT_DATA_CLASSES: &[&str] = &["AssertionError", "InconsistentData"];

/// Upstream status codes treated as "api unavailable".
const API_UNAVAILABLE_CODES: &[i64] = &[502, 503, 504];

/// Everything one step transition writes: the process-row update and the
/// step-row write, plus the signal as it will read back from storage.
#[derive(Debug)]
pub struct StepLogPlan {
    pub update: ProcessUpdate,
    pub row: StepRowWrite,
    pub logged_signal: Signal,
}

/// Decide how a step outcome is persisted.
///
/// Mirrors the persisted-step lifecycle: internal keys are stripped, a
/// `traceback` moves to the process row, and a repeated failure collapses
/// into the previous row with retry bookkeeping instead of growing the log.
pub fn plan_step_log(
    created_by: &str,
    step: &Step,
    signal: Signal,
    is_task: bool,
    completes_workflow: bool,
    last_row: Option<&ProcessStepRecord>,
) -> StepLogPlan {
    let status = signal.status();
    let blocked = signal.is_failed() || signal.is_waiting();
    let mut overall = if completes_workflow && signal.is_continuable() {
        ProcessStatus::Completed
    } else {
        signal.overall_status()
    };
    let mut state = signal.clone().into_state();

    // Process-row bookkeeping: failure reason and traceback live on the
    // process, not in the step state.
    let mut assignee = step.assignee;
    let mut failed_reason = None;
    let mut traceback = None;
    if blocked {
        failed_reason = state.get(ERROR_MESSAGE_KEY).map(value_to_text);
        traceback = state.remove(ERROR_TRACEBACK_KEY).map(|v| value_to_text(&v));

        if signal.is_failed() && is_task {
            let class = state
                .get(ERROR_CLASS_KEY)
                .and_then(Value::as_str)
                .unwrap_or_default();
            let status_code = state
                .get(ERROR_STATUS_CODE_KEY)
                .and_then(Value::as_i64)
                .unwrap_or_default();

            if INCONSISTENT_DATA_CLASSES.contains(&class) {
                assignee = Assignee::Noc;
                overall = ProcessStatus::InconsistentData;
            } else if class == "MaxRetryError"
                || (class == "ApiException" && API_UNAVAILABLE_CODES.contains(&status_code))
            {
                assignee = Assignee::System;
                overall = ProcessStatus::ApiUnavailable;
            } else {
                assignee = Assignee::System;
            }
        }
    }

    // Internal key: __step_name_override renames newly appended rows.
    let step_name = match state.remove(STEP_NAME_OVERRIDE_KEY) {
        Some(Value::String(name)) => name,
        _ => step.name.clone(),
    };

    // Internal key: __replace_last_state forces an in-place overwrite.
    let replace_last = state
        .remove(REPLACE_LAST_STATE_KEY)
        .map(|v| truthy(&v))
        .unwrap_or(false);

    // Internal key: __remove_keys drops keys from the state.
    match state.remove(REMOVE_KEYS_KEY) {
        Some(Value::Array(keys)) => {
            for key in keys {
                if let Value::String(key) = key {
                    state.remove(&key);
                }
            }
        }
        Some(_) => tracing::error!("Value for '__remove_keys' is not a list"),
        None => {}
    }

    let row = if replace_last {
        match last_row {
            Some(last) => StepRowWrite::Overwrite {
                step_id: last.step_id,
                name: last.name.clone(),
                status,
                state: state.clone(),
                created_by: last.created_by.clone(),
            },
            None => StepRowWrite::Append {
                name: step_name,
                status,
                state: state.clone(),
                created_by: created_by.to_string(),
            },
        }
    } else if blocked && last_row.is_some_and(|last| retry_of(last, step, &signal, &state)) {
        let last = last_row.expect("checked above");
        let retries = last
            .state
            .get(RETRIES_KEY)
            .and_then(Value::as_i64)
            .unwrap_or(0)
            + 1;
        let mut executed_at = last
            .state
            .get(EXECUTED_AT_KEY)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        executed_at.push(Value::String(last.executed_at.to_rfc3339()));

        state.insert(RETRIES_KEY.to_string(), Value::from(retries));
        state.insert(EXECUTED_AT_KEY.to_string(), Value::Array(executed_at));

        tracing::info!(retries, "Updating existing process step with state info about the error");

        StepRowWrite::Overwrite {
            step_id: last.step_id,
            name: last.name.clone(),
            status,
            state: state.clone(),
            created_by: last.created_by.clone(),
        }
    } else {
        StepRowWrite::Append {
            name: step_name.clone(),
            status,
            state: state.clone(),
            created_by: created_by.to_string(),
        }
    };

    // The process row tracks the step's declared name; the override only
    // renames the persisted step row.
    let update = ProcessUpdate {
        last_step: step.name.clone(),
        last_status: overall,
        assignee,
        failed_reason,
        traceback,
    };
    let logged_signal = signal.with_state(state);

    StepLogPlan {
        update,
        row,
        logged_signal,
    }
}

/// Whether the new outcome is a retry of the last persisted row: same step,
/// same status, same error and details.
fn retry_of(
    last: &ProcessStepRecord,
    step: &Step,
    signal: &Signal,
    state: &ratchet_core::state::State,
) -> bool {
    last.status == signal.status()
        && last.name == step.name
        && last.state.get(ERROR_MESSAGE_KEY) == state.get(ERROR_MESSAGE_KEY)
        && last.state.get(ERROR_DETAILS_KEY) == state.get(ERROR_DETAILS_KEY)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ratchet_core::signal::StepStatus;
    use ratchet_core::state::as_state;
    use serde_json::json;
    use uuid::Uuid;

    fn step(name: &str) -> Step {
        Step::new(name, Signal::Success)
    }

    fn last_row(name: &str, status: StepStatus, state: serde_json::Value) -> ProcessStepRecord {
        ProcessStepRecord {
            step_id: Uuid::new_v4(),
            process_id: Uuid::new_v4(),
            name: name.to_string(),
            status,
            state: as_state(state),
            created_by: "system".to_string(),
            executed_at: Utc::now(),
            commit_hash: None,
        }
    }

    #[test]
    fn test_success_appends_row() {
        let plan = plan_step_log(
            "alice",
            &step("provision"),
            Signal::Success(as_state(json!({"a": 1}))),
            false,
            false,
            None,
        );

        assert_eq!(plan.update.last_status, ProcessStatus::Running);
        assert_eq!(plan.update.last_step, "provision");
        assert!(plan.update.failed_reason.is_none());
        match plan.row {
            StepRowWrite::Append { ref name, status, .. } => {
                assert_eq!(name, "provision");
                assert_eq!(status, StepStatus::Success);
            }
            _ => panic!("expected append"),
        }
    }

    #[test]
    fn test_final_success_completes_process() {
        let plan = plan_step_log(
            "alice",
            &step("done"),
            Signal::Success(as_state(json!({}))),
            false,
            true,
            None,
        );
        assert_eq!(plan.update.last_status, ProcessStatus::Completed);
    }

    #[test]
    fn test_final_suspend_does_not_complete() {
        let plan = plan_step_log(
            "alice",
            &step("confirm"),
            Signal::Suspend(as_state(json!({}))),
            false,
            true,
            None,
        );
        assert_eq!(plan.update.last_status, ProcessStatus::Suspended);
    }

    #[test]
    fn test_failure_moves_traceback_to_process_row() {
        let plan = plan_step_log(
            "alice",
            &step("call_api"),
            Signal::Failed(as_state(
                json!({"class": "ValueError", "error": "boom", "traceback": "tb"}),
            )),
            false,
            false,
            None,
        );

        assert_eq!(plan.update.failed_reason.as_deref(), Some("boom"));
        assert_eq!(plan.update.traceback.as_deref(), Some("tb"));
        match plan.row {
            StepRowWrite::Append { ref state, .. } => {
                assert!(!state.contains_key("traceback"));
            }
            _ => panic!("expected append"),
        }
        assert!(!plan.logged_signal.state().contains_key("traceback"));
    }

    #[test]
    fn test_task_failure_promotions() {
        let plan = plan_step_log(
            "system",
            &step("check"),
            Signal::Failed(as_state(json!({"class": "AssertionError", "error": "bad"}))),
            true,
            false,
            None,
        );
        assert_eq!(plan.update.last_status, ProcessStatus::InconsistentData);
        assert_eq!(plan.update.assignee, Assignee::Noc);

        let plan = plan_step_log(
            "system",
            &step("call"),
            Signal::Failed(as_state(
                json!({"class": "ApiException", "status_code": 503, "error": "down"}),
            )),
            true,
            false,
            None,
        );
        assert_eq!(plan.update.last_status, ProcessStatus::ApiUnavailable);
        assert_eq!(plan.update.assignee, Assignee::System);

        let plan = plan_step_log(
            "system",
            &step("call"),
            Signal::Failed(as_state(json!({"class": "MaxRetryError", "error": "down"}))),
            true,
            false,
            None,
        );
        assert_eq!(plan.update.last_status, ProcessStatus::ApiUnavailable);
    }

    #[test]
    fn test_non_task_failure_is_not_promoted() {
        let plan = plan_step_log(
            "alice",
            &step("check"),
            Signal::Failed(as_state(json!({"class": "AssertionError", "error": "bad"}))),
            false,
            false,
            None,
        );
        assert_eq!(plan.update.last_status, ProcessStatus::Failed);
    }

    #[test]
    fn test_identical_failure_collapses_with_retry_bookkeeping() {
        let last = last_row(
            "call_api",
            StepStatus::Failed,
            json!({"class": "ValueError", "error": "x", "retries": 2, "executed_at": ["t0", "t1"]}),
        );
        let plan = plan_step_log(
            "alice",
            &step("call_api"),
            Signal::Failed(as_state(json!({"class": "ValueError", "error": "x"}))),
            false,
            false,
            Some(&last),
        );

        match plan.row {
            StepRowWrite::Overwrite { step_id, ref state, .. } => {
                assert_eq!(step_id, last.step_id);
                assert_eq!(state["retries"], json!(3));
                assert_eq!(state["executed_at"].as_array().unwrap().len(), 3);
            }
            _ => panic!("expected overwrite"),
        }
    }

    #[test]
    fn test_different_failure_appends_new_row() {
        let last = last_row("call_api", StepStatus::Failed, json!({"error": "x"}));
        let plan = plan_step_log(
            "alice",
            &step("call_api"),
            Signal::Failed(as_state(json!({"error": "y"}))),
            false,
            false,
            Some(&last),
        );
        assert!(matches!(plan.row, StepRowWrite::Append { .. }));
    }

    #[test]
    fn test_failure_after_other_step_appends() {
        let last = last_row("earlier", StepStatus::Failed, json!({"error": "x"}));
        let plan = plan_step_log(
            "alice",
            &step("call_api"),
            Signal::Failed(as_state(json!({"error": "x"}))),
            false,
            false,
            Some(&last),
        );
        assert!(matches!(plan.row, StepRowWrite::Append { .. }));
    }

    #[test]
    fn test_step_name_override() {
        let plan = plan_step_log(
            "alice",
            &step("generic"),
            Signal::Success(as_state(json!({"__step_name_override": "specific"}))),
            false,
            false,
            None,
        );

        // The process row keeps the declared step name; only the step row
        // is renamed.
        assert_eq!(plan.update.last_step, "generic");
        match plan.row {
            StepRowWrite::Append { ref name, ref state, .. } => {
                assert_eq!(name, "specific");
                assert!(!state.contains_key("__step_name_override"));
            }
            _ => panic!("expected append"),
        }
    }

    #[test]
    fn test_replace_last_state_overwrites_previous_row() {
        let last = last_row("await_callback", StepStatus::AwaitingCallback, json!({"t": 1}));
        let plan = plan_step_log(
            "alice",
            &step("await_callback"),
            Signal::Success(as_state(json!({"__replace_last_state": true, "result": 7}))),
            false,
            false,
            Some(&last),
        );

        match plan.row {
            StepRowWrite::Overwrite { step_id, status, ref state, .. } => {
                assert_eq!(step_id, last.step_id);
                assert_eq!(status, StepStatus::Success);
                assert_eq!(state["result"], json!(7));
                assert!(!state.contains_key("__replace_last_state"));
            }
            _ => panic!("expected overwrite"),
        }
    }

    #[test]
    fn test_remove_keys_strips_state() {
        let plan = plan_step_log(
            "alice",
            &step("progress"),
            Signal::AwaitingCallback(as_state(
                json!({"keep": 1, "callback_progress": "50%", "__remove_keys": ["callback_progress"]}),
            )),
            false,
            false,
            None,
        );

        match plan.row {
            StepRowWrite::Append { ref state, .. } => {
                assert_eq!(state["keep"], json!(1));
                assert!(!state.contains_key("callback_progress"));
                assert!(!state.contains_key("__remove_keys"));
            }
            _ => panic!("expected append"),
        }
    }
}
