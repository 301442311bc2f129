pub mod config;
pub mod error;
pub mod registry;
pub mod settings;
pub mod signal;
pub mod state;
pub mod workflow;

pub use config::{
    BroadcastConfig, DatabaseConfig, DistlockBackend, DistlockConfig, EngineConfig, ExecutorKind,
    GatewayConfig, NotifyConfig, RatchetConfig,
};
pub use error::{RatchetError, Result};
pub use registry::{WorkflowRegistry, REMOVED_WORKFLOW_KEY};
pub use settings::{EngineSettings, EngineStatus, GlobalStatus, WorkerStatus};
pub use signal::{ProcessStatus, Signal, StepStatus};
pub use state::{merge_state, State};
pub use workflow::{
    accept_any_form, auth_callbacks, ensure_present, steps_for_auth, validate_form, Assignee,
    Authorizer, FormValidator, ProcessStat, Step, StepFn, Target, UserClaims, Workflow,
};

/// User attributed to engine-initiated actions (boot recovery, schedulers).
pub const SYSTEM_USER: &str = "SYSTEM";
