use std::sync::Arc;
use std::time::Duration;

use ratchet_core::config::{DistlockBackend, ExecutorKind, RatchetConfig};
use ratchet_core::error::Result;
use ratchet_core::registry::WorkflowRegistry;

use crate::broadcast::Broadcaster;
use crate::db::Database;
use crate::distlock::DistLockManager;
use crate::executor::{
    ExecutionContext, ExecutorContext, PoolExecutor, QueueExecutor, QueueWorker, QueueWorkerConfig,
};
use crate::monitor::WorkerStatusMonitor;
use crate::service::{ProcessService, SettingsService};

struct EngineInner {
    config: RatchetConfig,
    db: Database,
    registry: Arc<WorkflowRegistry>,
    broadcaster: Broadcaster,
    pool_executor: Option<Arc<PoolExecutor>>,
    monitor: WorkerStatusMonitor,
    processes: ProcessService,
    settings: SettingsService,
}

/// The constructed engine: owns the database, the broadcast fabric, the
/// lock manager, the selected executor and the services built on top.
/// There is no global state; thread this value through entry points.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Connect and assemble all engine components.
    pub async fn init(config: RatchetConfig, registry: WorkflowRegistry) -> Result<Engine> {
        let registry = Arc::new(registry);
        let db = Database::from_config(&config.database).await?;

        let settings_store = crate::store::EngineSettingsStore::new(db.pool().clone());
        settings_store.ensure().await?;

        let broadcaster = Broadcaster::from_config(
            config.broadcast.enable_websockets,
            &config.broadcast.broadcaster_url,
        )
        .await?;

        let distlock = if !config.distlock.enabled {
            DistLockManager::disabled()
        } else {
            match config.distlock.backend {
                DistlockBackend::Memory => DistLockManager::memory(),
                DistlockBackend::Redis => DistLockManager::redis(&config.distlock.cache_uri).await?,
            }
        };

        let ctx = ExecutorContext::new(
            db.clone(),
            registry.clone(),
            broadcaster.clone(),
            config.engine.testing,
        );

        let mut pool_executor = None;
        let executor: Arc<dyn ExecutionContext> = match config.engine.executor {
            ExecutorKind::Pool => {
                let pool = Arc::new(PoolExecutor::new(ctx.clone(), config.engine.max_workers));
                pool_executor = Some(pool.clone());
                pool
            }
            ExecutorKind::Queue => Arc::new(QueueExecutor::new(ctx.clone())),
        };

        let monitor = WorkerStatusMonitor::new(
            executor.clone(),
            Duration::from_secs(config.engine.worker_status_interval_secs),
        );
        monitor.start();

        let processes = ProcessService::new(ctx.clone(), executor.clone(), distlock);
        let settings = SettingsService::new(
            ctx,
            processes.clone(),
            executor,
            config.notify.engine_settings_webhook_url.clone(),
        );

        tracing::info!(
            executor = ?config.engine.executor,
            max_workers = config.engine.max_workers,
            "Engine initialised"
        );

        Ok(Engine {
            inner: Arc::new(EngineInner {
                config,
                db,
                registry,
                broadcaster,
                pool_executor,
                monitor,
                processes,
                settings,
            }),
        })
    }

    pub fn config(&self) -> &RatchetConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.inner.registry
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.inner.broadcaster
    }

    pub fn processes(&self) -> &ProcessService {
        &self.inner.processes
    }

    pub fn settings(&self) -> &SettingsService {
        &self.inner.settings
    }

    pub fn monitor(&self) -> &WorkerStatusMonitor {
        &self.inner.monitor
    }

    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    /// Build a queue worker sharing this engine's context. Only meaningful
    /// with the queue executor; the caller decides on which nodes it runs.
    pub fn queue_worker(&self, config: QueueWorkerConfig) -> QueueWorker {
        let ctx = ExecutorContext::new(
            self.inner.db.clone(),
            self.inner.registry.clone(),
            self.inner.broadcaster.clone(),
            self.inner.config.engine.testing,
        );
        QueueWorker::new(ctx, config)
    }

    /// Boot recovery: re-arm `running` rows left behind by a crash.
    pub async fn recover_running(&self) -> Result<usize> {
        self.inner.processes.recover_running().await
    }

    /// Drain workers and close connections.
    pub async fn shutdown(&self) {
        tracing::info!("Engine shutting down");
        self.inner.monitor.stop();
        if let Some(pool) = &self.inner.pool_executor {
            pool.drain().await;
        }
        self.inner.db.close().await;
        tracing::info!("Engine stopped");
    }
}
