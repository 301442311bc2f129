mod process;
mod queue;
mod settings;
mod subscription;

pub use process::{
    ProcessField, ProcessFilter, ProcessRecord, ProcessSort, ProcessStepRecord, ProcessStore,
    ProcessUpdate, StatusCounts, StepRowWrite,
};
pub use queue::{QueueEntry, QueueName, QueuePayload, QueueStore};
pub use settings::EngineSettingsStore;
pub use subscription::{ProcessSubscription, ProcessSubscriptionStore};
