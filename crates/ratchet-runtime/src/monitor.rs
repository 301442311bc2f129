use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use crate::executor::ExecutionContext;

/// Background sampler caching the number of running jobs.
///
/// Inspecting the executor can be slow (the queue backend counts database
/// rows), so the monitor polls on an interval and API reads hit the cached
/// value in O(1). A failed poll keeps the previous value.
pub struct WorkerStatusMonitor {
    executor: Arc<dyn ExecutionContext>,
    interval: Duration,
    running_jobs: Arc<Mutex<i64>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkerStatusMonitor {
    pub fn new(executor: Arc<dyn ExecutionContext>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            executor,
            interval,
            running_jobs: Arc::new(Mutex::new(0)),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Start the sampling loop.
    pub fn start(&self) {
        let executor = self.executor.clone();
        let interval = self.interval;
        let running_jobs = self.running_jobs.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "Starting worker status monitor");
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("Worker status monitor shutting down");
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        let status = executor.worker_status().await;
                        *running_jobs.lock().expect("monitor cache poisoned") =
                            status.number_of_running_jobs;
                    }
                }
            }
        });
    }

    /// Cached count of running jobs.
    pub fn running_jobs_count(&self) -> i64 {
        *self.running_jobs.lock().expect("monitor cache poisoned")
    }

    /// Force an immediate sample, bypassing the interval. Primarily for
    /// tests, which should not depend on timing.
    pub async fn refresh_once(&self) {
        let status = self.executor.worker_status().await;
        *self.running_jobs.lock().expect("monitor cache poisoned") =
            status.number_of_running_jobs;
    }

    /// Stop the sampling loop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
