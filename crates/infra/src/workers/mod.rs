//! Periodic background tasks.
//!
//! Each task runs on its own tokio task, ticks immediately and then on its
//! interval, and stops when its [`WorkerHandle`] is shut down. A tick that is
//! in flight when shutdown is requested runs to completion.

pub mod dispatcher;
pub mod refund_reconciler;
pub mod state_sync;
pub mod timeout_supervisor;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use dispatcher::{DispatcherConfig, QueueDispatcher};
pub use refund_reconciler::{RefundReconciler, RefundReconcilerConfig};
pub use state_sync::{StateSync, StateSyncConfig};
pub use timeout_supervisor::{TimeoutSupervisor, TimeoutSupervisorConfig};

/// One unit of periodic work. Failures are handled inside `tick`.
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn tick(&self);
}

/// Handle to stop and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: Arc<Notify>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(mut self) {
        // `notify_one` keeps a permit if the worker is mid-tick.
        self.shutdown.notify_one();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(worker = self.name, error = %err, "worker task ended abnormally");
            }
        }
    }
}

/// Spawn `task` on the current runtime.
pub fn spawn_periodic<T: PeriodicTask>(task: Arc<T>, every: Duration) -> WorkerHandle {
    let name = task.name();
    let shutdown = Arc::new(Notify::new());
    let signal = shutdown.clone();

    let join = tokio::spawn(async move {
        info!(worker = name, interval_ms = every.as_millis() as u64, "worker started");

        let mut interval = tokio::time::interval(every.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = signal.notified() => {
                    info!(worker = name, "worker received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    debug!(worker = name, "tick");
                    task.tick().await;
                }
            }
        }
    });

    WorkerHandle {
        name,
        shutdown,
        join: Some(join),
    }
}
