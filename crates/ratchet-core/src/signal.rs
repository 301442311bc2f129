use serde::{Deserialize, Serialize};

use crate::state::State;

/// Persisted status of a single step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Skip,
    Suspend,
    Waiting,
    AwaitingCallback,
    Failed,
    Abort,
    Complete,
}

impl StepStatus {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Skip => "skip",
            Self::Suspend => "suspend",
            Self::Waiting => "waiting",
            Self::AwaitingCallback => "awaiting_callback",
            Self::Failed => "failed",
            Self::Abort => "abort",
            Self::Complete => "complete",
        }
    }

    /// Parse from a stored string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "skip" => Some(Self::Skip),
            "suspend" => Some(Self::Suspend),
            "waiting" => Some(Self::Waiting),
            "awaiting_callback" => Some(Self::AwaitingCallback),
            "failed" => Some(Self::Failed),
            "abort" => Some(Self::Abort),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }
}

/// Aggregate status of a process run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Created,
    Running,
    Suspended,
    Waiting,
    AwaitingCallback,
    Failed,
    Resumed,
    Aborted,
    Completed,
    ApiUnavailable,
    InconsistentData,
}

impl ProcessStatus {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Waiting => "waiting",
            Self::AwaitingCallback => "awaiting_callback",
            Self::Failed => "failed",
            Self::Resumed => "resumed",
            Self::Aborted => "aborted",
            Self::Completed => "completed",
            Self::ApiUnavailable => "api_unavailable",
            Self::InconsistentData => "inconsistent_data",
        }
    }

    /// Parse from a stored string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "suspended" => Some(Self::Suspended),
            "waiting" => Some(Self::Waiting),
            "awaiting_callback" => Some(Self::AwaitingCallback),
            "failed" => Some(Self::Failed),
            "resumed" => Some(Self::Resumed),
            "aborted" => Some(Self::Aborted),
            "completed" => Some(Self::Completed),
            "api_unavailable" => Some(Self::ApiUnavailable),
            "inconsistent_data" => Some(Self::InconsistentData),
            _ => None,
        }
    }

    /// Whether a process in this status may be resumed or retried.
    pub fn can_be_resumed(&self) -> bool {
        matches!(
            self,
            Self::Created
                | Self::Suspended
                | Self::Waiting
                | Self::Failed
                | Self::Resumed
                | Self::ApiUnavailable
                | Self::InconsistentData
        )
    }

    /// Whether the process has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// Control signal returned by a step body.
///
/// The variant decides how the step is persisted and whether the runtime
/// advances to the next step without external input.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// Step finished; continue with the carried state.
    Success(State),
    /// Step was intentionally skipped; continue.
    Skip(State),
    /// Step needs user input; execution stops until resumed.
    Suspend(State),
    /// Step hit a transient condition; retry later.
    Waiting(State),
    /// Step waits for an external callback carrying the issued token.
    AwaitingCallback(State),
    /// Step failed with a captured error state.
    Failed(State),
    /// Process was aborted; terminal.
    Abort(State),
    /// Process ran to completion; terminal.
    Complete(State),
}

impl Signal {
    /// Persisted status of a step that produced this signal.
    pub fn status(&self) -> StepStatus {
        match self {
            Self::Success(_) => StepStatus::Success,
            Self::Skip(_) => StepStatus::Skip,
            Self::Suspend(_) => StepStatus::Suspend,
            Self::Waiting(_) => StepStatus::Waiting,
            Self::AwaitingCallback(_) => StepStatus::AwaitingCallback,
            Self::Failed(_) => StepStatus::Failed,
            Self::Abort(_) => StepStatus::Abort,
            Self::Complete(_) => StepStatus::Complete,
        }
    }

    /// Aggregate process status implied by this signal.
    ///
    /// A mid-workflow `Success`/`Skip` means the process is still running;
    /// the runtime turns the trailing `Success` into `Complete` when the
    /// step list is exhausted.
    pub fn overall_status(&self) -> ProcessStatus {
        match self {
            Self::Success(_) | Self::Skip(_) => ProcessStatus::Running,
            Self::Suspend(_) => ProcessStatus::Suspended,
            Self::Waiting(_) => ProcessStatus::Waiting,
            Self::AwaitingCallback(_) => ProcessStatus::AwaitingCallback,
            Self::Failed(_) => ProcessStatus::Failed,
            Self::Abort(_) => ProcessStatus::Aborted,
            Self::Complete(_) => ProcessStatus::Completed,
        }
    }

    /// Borrow the carried state map.
    pub fn state(&self) -> &State {
        match self {
            Self::Success(s)
            | Self::Skip(s)
            | Self::Suspend(s)
            | Self::Waiting(s)
            | Self::AwaitingCallback(s)
            | Self::Failed(s)
            | Self::Abort(s)
            | Self::Complete(s) => s,
        }
    }

    /// Consume the signal, yielding the carried state map.
    pub fn into_state(self) -> State {
        match self {
            Self::Success(s)
            | Self::Skip(s)
            | Self::Suspend(s)
            | Self::Waiting(s)
            | Self::AwaitingCallback(s)
            | Self::Failed(s)
            | Self::Abort(s)
            | Self::Complete(s) => s,
        }
    }

    /// Same variant carrying a different state.
    pub fn with_state(&self, state: State) -> Self {
        match self {
            Self::Success(_) => Self::Success(state),
            Self::Skip(_) => Self::Skip(state),
            Self::Suspend(_) => Self::Suspend(state),
            Self::Waiting(_) => Self::Waiting(state),
            Self::AwaitingCallback(_) => Self::AwaitingCallback(state),
            Self::Failed(_) => Self::Failed(state),
            Self::Abort(_) => Self::Abort(state),
            Self::Complete(_) => Self::Complete(state),
        }
    }

    /// Transform the carried state, keeping the variant.
    pub fn map(self, f: impl FnOnce(State) -> State) -> Self {
        match self {
            Self::Success(s) => Self::Success(f(s)),
            Self::Skip(s) => Self::Skip(f(s)),
            Self::Suspend(s) => Self::Suspend(f(s)),
            Self::Waiting(s) => Self::Waiting(f(s)),
            Self::AwaitingCallback(s) => Self::AwaitingCallback(f(s)),
            Self::Failed(s) => Self::Failed(f(s)),
            Self::Abort(s) => Self::Abort(f(s)),
            Self::Complete(s) => Self::Complete(f(s)),
        }
    }

    /// Restore a signal from a persisted step row.
    pub fn from_persisted(status: StepStatus, state: State) -> Self {
        match status {
            StepStatus::Success => Self::Success(state),
            StepStatus::Skip => Self::Skip(state),
            StepStatus::Suspend => Self::Suspend(state),
            StepStatus::Waiting => Self::Waiting(state),
            StepStatus::AwaitingCallback => Self::AwaitingCallback(state),
            StepStatus::Failed => Self::Failed(state),
            StepStatus::Abort => Self::Abort(state),
            StepStatus::Complete => Self::Complete(state),
        }
    }

    /// `Success`/`Skip` let the runtime advance without external input.
    pub fn is_continuable(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Skip(_))
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn is_suspend(&self) -> bool {
        matches!(self, Self::Suspend(_))
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Waiting(_))
    }

    pub fn is_awaiting_callback(&self) -> bool {
        matches!(self, Self::AwaitingCallback(_))
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Abort(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::as_state;
    use serde_json::json;

    #[test]
    fn test_step_status_roundtrip() {
        for status in [
            StepStatus::Success,
            StepStatus::Skip,
            StepStatus::Suspend,
            StepStatus::Waiting,
            StepStatus::AwaitingCallback,
            StepStatus::Failed,
            StepStatus::Abort,
            StepStatus::Complete,
        ] {
            assert_eq!(StepStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(StepStatus::parse("bogus"), None);
    }

    #[test]
    fn test_process_status_roundtrip() {
        for status in [
            ProcessStatus::Created,
            ProcessStatus::Running,
            ProcessStatus::Suspended,
            ProcessStatus::Waiting,
            ProcessStatus::AwaitingCallback,
            ProcessStatus::Failed,
            ProcessStatus::Resumed,
            ProcessStatus::Aborted,
            ProcessStatus::Completed,
            ProcessStatus::ApiUnavailable,
            ProcessStatus::InconsistentData,
        ] {
            assert_eq!(ProcessStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ProcessStatus::parse("nope"), None);
    }

    #[test]
    fn test_can_be_resumed() {
        assert!(ProcessStatus::Suspended.can_be_resumed());
        assert!(ProcessStatus::Failed.can_be_resumed());
        assert!(ProcessStatus::ApiUnavailable.can_be_resumed());
        assert!(ProcessStatus::InconsistentData.can_be_resumed());
        assert!(ProcessStatus::Resumed.can_be_resumed());
        assert!(!ProcessStatus::Running.can_be_resumed());
        assert!(!ProcessStatus::Completed.can_be_resumed());
        assert!(!ProcessStatus::Aborted.can_be_resumed());
    }

    #[test]
    fn test_signal_continuable() {
        let state = as_state(json!({"a": 1}));
        assert!(Signal::Success(state.clone()).is_continuable());
        assert!(Signal::Skip(state.clone()).is_continuable());
        assert!(!Signal::Suspend(state.clone()).is_continuable());
        assert!(!Signal::Failed(state.clone()).is_continuable());
        assert!(!Signal::Complete(state).is_continuable());
    }

    #[test]
    fn test_signal_overall_status() {
        let state = State::new();
        assert_eq!(
            Signal::Success(state.clone()).overall_status(),
            ProcessStatus::Running
        );
        assert_eq!(
            Signal::Suspend(state.clone()).overall_status(),
            ProcessStatus::Suspended
        );
        assert_eq!(
            Signal::AwaitingCallback(state.clone()).overall_status(),
            ProcessStatus::AwaitingCallback
        );
        assert_eq!(
            Signal::Complete(state).overall_status(),
            ProcessStatus::Completed
        );
    }

    #[test]
    fn test_signal_map_keeps_variant() {
        let signal = Signal::Suspend(as_state(json!({"a": 1})));
        let mapped = signal.map(|mut s| {
            s.insert("b".into(), json!(2));
            s
        });

        assert!(mapped.is_suspend());
        assert_eq!(mapped.state()["a"], json!(1));
        assert_eq!(mapped.state()["b"], json!(2));
    }

    #[test]
    fn test_from_persisted_roundtrip() {
        let state = as_state(json!({"x": true}));
        let signal = Signal::AwaitingCallback(state.clone());
        let restored = Signal::from_persisted(signal.status(), state);
        assert_eq!(signal, restored);
    }
}
