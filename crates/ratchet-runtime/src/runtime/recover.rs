use ratchet_core::error::{RatchetError, Result};
use ratchet_core::signal::Signal;
use ratchet_core::state::State;
use ratchet_core::workflow::{Step, Workflow};

use crate::store::ProcessStepRecord;

/// Restore the signal log from persisted step rows.
pub fn restore_log(steps: &[ProcessStepRecord]) -> Result<Vec<Signal>> {
    steps
        .iter()
        .map(|step| Ok(Signal::from_persisted(step.status, step.state.clone())))
        .collect()
}

/// Compute `(state, remaining steps)` from a restored signal log.
///
/// Failed, suspended, waiting and awaiting-callback rows are bookkeeping,
/// not progress: only cleared steps count towards the position in the step
/// list. The state is taken from the last suspended/awaiting row when the
/// process is blocked there, otherwise from the last cleared step.
///
/// Remaining steps are positioned by count, so editing a workflow anywhere
/// but at its end while runs are in flight is unsafe; the engine guards
/// this with a workflow digest recorded at start.
pub fn recover(workflow: &Workflow, log: &[Signal]) -> (Signal, Vec<Step>) {
    let persistent: Vec<&Signal> = log
        .iter()
        .filter(|s| {
            !(s.is_failed() || s.is_suspend() || s.is_waiting() || s.is_awaiting_callback())
        })
        .collect();
    let cleared = persistent.len();

    let state = match log.last() {
        Some(last) if last.is_suspend() || last.is_awaiting_callback() => last.clone(),
        _ => match persistent.last() {
            Some(last) => (*last).clone(),
            None => Signal::Success(State::new()),
        },
    };

    let remaining = if state.is_complete() {
        Vec::new()
    } else {
        workflow.steps.iter().skip(cleared).cloned().collect()
    };

    (state, remaining)
}

/// Refuse to resume a process whose workflow step list changed since the
/// process was started.
pub fn ensure_digest_matches(workflow: &Workflow, recorded: Option<&str>) -> Result<()> {
    if let Some(recorded) = recorded {
        let current = workflow.digest();
        if recorded != current {
            return Err(RatchetError::WorkflowGone(format!(
                "Workflow '{}' changed since this process was started; refusing to resume",
                workflow.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratchet_core::state::as_state;
    use ratchet_core::workflow::Target;
    use serde_json::json;

    fn workflow() -> Workflow {
        Workflow::new("wf", Target::Create)
            .step(Step::new("a", Signal::Success))
            .step(Step::new("b", Signal::Success))
            .step(Step::new("c", Signal::Success))
    }

    #[test]
    fn test_recover_empty_log_starts_from_scratch() {
        let wf = workflow();
        let (state, remaining) = recover(&wf, &[]);

        assert!(state.is_continuable());
        assert!(state.state().is_empty());
        assert_eq!(remaining.len(), 3);
    }

    #[test]
    fn test_recover_skips_failed_rows() {
        let wf = workflow();
        let log = vec![
            Signal::Success(as_state(json!({"a": 1}))),
            Signal::Failed(as_state(json!({"error": "x"}))),
        ];
        let (state, remaining) = recover(&wf, &log);

        // The failed attempt does not advance the position; step b reruns.
        assert_eq!(state.state()["a"], json!(1));
        let names: Vec<&str> = remaining.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn test_recover_uses_suspended_state() {
        let wf = workflow();
        let log = vec![
            Signal::Success(as_state(json!({"a": 1}))),
            Signal::Suspend(as_state(json!({"a": 1, "form": "pending"}))),
        ];
        let (state, remaining) = recover(&wf, &log);

        assert!(state.is_suspend());
        assert_eq!(state.state()["form"], json!("pending"));
        assert_eq!(remaining.first().unwrap().name, "b");
    }

    #[test]
    fn test_recover_uses_awaiting_callback_state() {
        let wf = workflow();
        let log = vec![
            Signal::Success(as_state(json!({}))),
            Signal::AwaitingCallback(as_state(json!({"__callback_token": "T"}))),
        ];
        let (state, remaining) = recover(&wf, &log);

        assert!(state.is_awaiting_callback());
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn test_recover_complete_has_no_remaining_steps() {
        let wf = workflow();
        let log = vec![
            Signal::Success(as_state(json!({}))),
            Signal::Complete(as_state(json!({"ok": true}))),
        ];
        let (state, remaining) = recover(&wf, &log);

        assert!(state.is_complete());
        assert!(remaining.is_empty());
    }

    #[test]
    fn test_recover_all_cleared_positions_past_them() {
        let wf = workflow();
        let log = vec![
            Signal::Success(as_state(json!({}))),
            Signal::Skip(as_state(json!({}))),
        ];
        let (_, remaining) = recover(&wf, &log);
        let names: Vec<&str> = remaining.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["c"]);
    }

    #[test]
    fn test_digest_guard() {
        let wf = workflow();
        let digest = wf.digest();
        assert!(ensure_digest_matches(&wf, Some(&digest)).is_ok());
        assert!(ensure_digest_matches(&wf, None).is_ok());

        let edited = Workflow::new("wf", Target::Create)
            .step(Step::new("a", Signal::Success))
            .step(Step::new("inserted", Signal::Success))
            .step(Step::new("b", Signal::Success))
            .step(Step::new("c", Signal::Success));
        assert!(matches!(
            ensure_digest_matches(&edited, Some(&digest)),
            Err(RatchetError::WorkflowGone(_))
        ));
    }
}
