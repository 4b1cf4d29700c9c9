//! A fixed set of queue workers sharing one cancellation token.

use crate::consumer::{QueueWorker, WorkerStatsSnapshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Running queue workers
pub struct WorkerPool {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    template: QueueWorker,
}

impl WorkerPool {
    /// Spawn `workers` copies of `template`, each under its own id.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn start(template: QueueWorker, workers: usize) -> Self {
        let cancel = CancellationToken::new();
        let handles = (0..workers)
            .map(|i| {
                let worker = template.with_worker_id(format!("{}-{i}", template.worker_id()));
                tokio::spawn(worker.run(cancel.child_token()))
            })
            .collect();

        info!(
            workers,
            queue = %template.config().queue_name,
            "Worker pool started"
        );

        Self {
            cancel,
            handles,
            template,
        }
    }

    /// Number of workers spawned
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the pool has no workers
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Counters summed over all workers
    #[must_use]
    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.template.stats().snapshot()
    }

    /// Stop polling and wait for in-flight messages to finish
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for handle in std::mem::take(&mut self.handles) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Queue worker task failed");
            }
        }
        info!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.handles.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
