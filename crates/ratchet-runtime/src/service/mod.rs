mod processes;
mod settings;

pub use processes::{ProcessService, RESUME_ALL_STATUSES};
pub use settings::SettingsService;
