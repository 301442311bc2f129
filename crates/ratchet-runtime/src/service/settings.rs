use serde_json::json;

use ratchet_core::error::{RatchetError, Result};
use ratchet_core::settings::{EngineStatus, WorkerStatus};

use super::processes::ProcessService;
use crate::executor::{ExecutionContext, ExecutorContext};

use std::sync::Arc;

/// Engine settings operations: the global lock and worker occupancy.
#[derive(Clone)]
pub struct SettingsService {
    ctx: ExecutorContext,
    processes: ProcessService,
    executor: Arc<dyn ExecutionContext>,
    webhook_url: Option<String>,
    http: reqwest::Client,
}

impl SettingsService {
    pub fn new(
        ctx: ExecutorContext,
        processes: ProcessService,
        executor: Arc<dyn ExecutionContext>,
        webhook_url: Option<String>,
    ) -> Self {
        Self {
            ctx,
            processes,
            executor,
            webhook_url,
            http: reqwest::Client::new(),
        }
    }

    /// Current engine status projection.
    pub async fn status(&self) -> Result<EngineStatus> {
        Ok(self.ctx.settings_store().get().await?.into())
    }

    /// Transition the global lock and announce the change.
    pub async fn set_global_lock(&self, global_lock: bool, user: &str) -> Result<EngineStatus> {
        let settings = self
            .processes
            .marshall_processes(global_lock)
            .await
            .ok_or_else(|| {
                RatchetError::Internal(
                    "Something went wrong while updating the database, possible manual intervention required"
                        .to_string(),
                )
            })?;

        let status: EngineStatus = settings.into();

        if let Err(e) = self.ctx.broadcaster.broadcast_engine_status(&status).await {
            tracing::warn!(error = %e, "Failed to broadcast engine status");
        }
        self.notify_webhook(&status, user).await;

        Ok(status)
    }

    /// Worker occupancy snapshot from the active executor.
    pub async fn worker_status(&self) -> WorkerStatus {
        self.executor.worker_status().await
    }

    /// Announce a lock transition to the configured webhook. Failures are
    /// logged and swallowed: notification is not part of the transition.
    async fn notify_webhook(&self, status: &EngineStatus, user: &str) {
        let Some(url) = &self.webhook_url else {
            return;
        };

        let action = if status.global_lock {
            "stopped the workflow engine. Running processes will pause at their next step"
        } else {
            "started the workflow engine. Pending processes will be picked up"
        };
        let message = json!({"text": format!("User `{}` {}", user, action)});

        if let Err(e) = self.http.post(url).json(&message).send().await {
            tracing::error!(error = %e, "Post to engine settings webhook failed");
        }
    }
}
