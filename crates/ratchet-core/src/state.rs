use serde_json::{Map, Value};

/// Step state as stored in the database and passed between steps.
///
/// The engine treats the state as an opaque JSON object apart from the
/// well-known keys below, which form the ABI between step bodies and the
/// runtime.
pub type State = Map<String, Value>;

/// Renames the persisted step when present in the returned state.
pub const STEP_NAME_OVERRIDE_KEY: &str = "__step_name_override";

/// When truthy, the previous step row is overwritten regardless of identity.
pub const REPLACE_LAST_STATE_KEY: &str = "__replace_last_state";

/// List of keys to drop from the state before persistence.
pub const REMOVE_KEYS_KEY: &str = "__remove_keys";

/// Names the key under which a callback result is merged into the state.
pub const CALLBACK_RESULT_KEY: &str = "__callback_result_key";

/// Token issued when a step emits `AwaitingCallback`; external callers must
/// present it to continue the process.
pub const CALLBACK_TOKEN_KEY: &str = "__callback_token";

/// Default key for callback results when `__callback_result_key` is unset.
pub const DEFAULT_CALLBACK_RESULT_KEY: &str = "callback_result";

/// Key under which callback progress updates are stored. Marked for removal
/// on the next commit so progress never outlives the awaiting step.
pub const CALLBACK_PROGRESS_KEY: &str = "callback_progress";

// Failure state keys.
pub const ERROR_CLASS_KEY: &str = "class";
pub const ERROR_MESSAGE_KEY: &str = "error";
pub const ERROR_DETAILS_KEY: &str = "details";
pub const ERROR_TRACEBACK_KEY: &str = "traceback";
pub const ERROR_STATUS_CODE_KEY: &str = "status_code";

// Retry bookkeeping keys maintained by the step log.
pub const RETRIES_KEY: &str = "retries";
pub const EXECUTED_AT_KEY: &str = "executed_at";

/// Deep-merge `src` into `dst`.
///
/// Objects merge recursively; arrays and scalars in `src` override the
/// value in `dst`.
pub fn merge_state(dst: &mut State, src: State) {
    for (key, value) in src {
        match (dst.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_state(existing, incoming);
            }
            (_, value) => {
                dst.insert(key, value);
            }
        }
    }
}

/// Build the failure state captured from a step-body error.
pub fn failure_state(class: &str, message: &str, traceback: Option<&str>) -> State {
    let mut state = State::new();
    state.insert(ERROR_CLASS_KEY.into(), Value::String(class.to_string()));
    state.insert(ERROR_MESSAGE_KEY.into(), Value::String(message.to_string()));
    if let Some(tb) = traceback {
        state.insert(ERROR_TRACEBACK_KEY.into(), Value::String(tb.to_string()));
    }
    state
}

/// Convert a JSON value into a state map, discarding anything that is not
/// an object.
pub fn as_state(value: Value) -> State {
    match value {
        Value::Object(map) => map,
        _ => State::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_state_overrides_scalars() {
        let mut dst = as_state(json!({"a": 1, "b": "x"}));
        merge_state(&mut dst, as_state(json!({"b": "y", "c": true})));

        assert_eq!(dst["a"], json!(1));
        assert_eq!(dst["b"], json!("y"));
        assert_eq!(dst["c"], json!(true));
    }

    #[test]
    fn test_merge_state_merges_nested_objects() {
        let mut dst = as_state(json!({"sub": {"a": 1, "keep": true}}));
        merge_state(&mut dst, as_state(json!({"sub": {"a": 2, "b": 3}})));

        assert_eq!(dst["sub"], json!({"a": 2, "b": 3, "keep": true}));
    }

    #[test]
    fn test_merge_state_overrides_arrays() {
        let mut dst = as_state(json!({"list": [1, 2, 3]}));
        merge_state(&mut dst, as_state(json!({"list": [4]})));

        assert_eq!(dst["list"], json!([4]));
    }

    #[test]
    fn test_failure_state_keys() {
        let state = failure_state("ValueError", "boom", Some("trace"));
        assert_eq!(state[ERROR_CLASS_KEY], json!("ValueError"));
        assert_eq!(state[ERROR_MESSAGE_KEY], json!("boom"));
        assert_eq!(state[ERROR_TRACEBACK_KEY], json!("trace"));

        let state = failure_state("ValueError", "boom", None);
        assert!(!state.contains_key(ERROR_TRACEBACK_KEY));
    }
}
