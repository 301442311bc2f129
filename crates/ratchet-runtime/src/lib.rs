pub mod broadcast;
pub mod db;
pub mod distlock;
pub mod engine;
pub mod executor;
pub mod gateway;
pub mod monitor;
pub mod runtime;
pub mod service;
pub mod store;

pub use broadcast::{Broadcaster, Channel, Subscription};
pub use db::Database;
pub use distlock::{DistLock, DistLockManager};
pub use engine::Engine;
pub use executor::{
    ExecutionContext, ExecutorContext, PoolExecutor, QueueExecutor, QueueWorker, QueueWorkerConfig,
};
pub use gateway::{router, router_with_auth, ApiError, AppState, AuthHook, WsAuthHook};
pub use monitor::WorkerStatusMonitor;
pub use runtime::{
    abort_workflow, ensure_digest_matches, execute_step, plan_step_log, recover, restore_log,
    run_workflow, DbStepLog, StepLog, StepLogPlan,
};
pub use service::{ProcessService, SettingsService, RESUME_ALL_STATUSES};
pub use store::{
    EngineSettingsStore, ProcessField, ProcessFilter, ProcessRecord, ProcessSort,
    ProcessStepRecord, ProcessStore, ProcessSubscription, ProcessSubscriptionStore, ProcessUpdate,
    QueueEntry, QueueName, QueuePayload, QueueStore, StatusCounts, StepRowWrite,
};
