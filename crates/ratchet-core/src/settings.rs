use serde::{Deserialize, Serialize};

/// Singleton engine state: the global lock and the running-process counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// While set, running processes drain to their next step boundary and
    /// stop, and no new processes are dispatched to workers.
    pub global_lock: bool,
    /// Number of processes currently held by a worker.
    pub running_processes: i32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            global_lock: false,
            running_processes: 0,
        }
    }
}

/// Projection of the engine settings presented to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GlobalStatus {
    Running,
    Pausing,
    Paused,
}

impl GlobalStatus {
    /// Derive the status from the raw settings row.
    pub fn project(settings: &EngineSettings) -> Self {
        if settings.global_lock && settings.running_processes > 0 {
            Self::Pausing
        } else if settings.global_lock {
            Self::Paused
        } else {
            Self::Running
        }
    }
}

/// Engine status payload returned by the settings API and pushed on the
/// engine-settings channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub global_lock: bool,
    pub running_processes: i32,
    pub global_status: GlobalStatus,
}

impl From<EngineSettings> for EngineStatus {
    fn from(settings: EngineSettings) -> Self {
        Self {
            global_lock: settings.global_lock,
            running_processes: settings.running_processes,
            global_status: GlobalStatus::project(&settings),
        }
    }
}

/// Snapshot of executor worker occupancy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub executor_type: String,
    pub number_of_workers_online: i64,
    pub number_of_queued_jobs: i64,
    pub number_of_running_jobs: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_status_projection() {
        let running = EngineSettings {
            global_lock: false,
            running_processes: 3,
        };
        assert_eq!(GlobalStatus::project(&running), GlobalStatus::Running);

        let pausing = EngineSettings {
            global_lock: true,
            running_processes: 2,
        };
        assert_eq!(GlobalStatus::project(&pausing), GlobalStatus::Pausing);

        let paused = EngineSettings {
            global_lock: true,
            running_processes: 0,
        };
        assert_eq!(GlobalStatus::project(&paused), GlobalStatus::Paused);
    }

    #[test]
    fn test_engine_status_from_settings() {
        let status: EngineStatus = EngineSettings {
            global_lock: true,
            running_processes: 0,
        }
        .into();

        assert!(status.global_lock);
        assert_eq!(status.global_status, GlobalStatus::Paused);
    }
}
