//! Fixed-size worker pool draining a [`WorkQueue`]
//!
//! Every worker runs the same loop: dequeue or exit when the queue is empty,
//! handle the task, settle its lease, report progress. The stage ends when all
//! workers have been joined.

use async_trait::async_trait;
use futures::future::join_all;
use shiptrack_common::{Result, TrackError};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::progress::ProgressReporter;
use crate::queue::{ProgressSnapshot, QueueTask, WorkQueue};

/// Work performed on one dequeued task
///
/// `Ok` means the task's side effect is durable. An error fails only this task.
#[async_trait]
pub trait TaskHandler<T: QueueTask>: Send + Sync + 'static {
    async fn handle(&self, task: T) -> Result<()>;
}

/// Pool of identical workers for one stage
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Drain the queue and wait for every worker to exit.
    ///
    /// Returns the final snapshot; every task is terminal by then.
    pub async fn run<T, H>(
        &self,
        stage: &str,
        queue: Arc<WorkQueue<T>>,
        handler: Arc<H>,
        reporter: Arc<ProgressReporter>,
    ) -> ProgressSnapshot
    where
        T: QueueTask,
        H: TaskHandler<T> + ?Sized,
    {
        let spawned = self.workers.min(queue.total().max(1));
        debug!(stage, workers = spawned, tasks = queue.total(), "Starting workers");

        let handles: Vec<_> = (0..spawned)
            .map(|worker| {
                let queue = Arc::clone(&queue);
                let handler = Arc::clone(&handler);
                let reporter = Arc::clone(&reporter);
                let stage = stage.to_string();
                tokio::spawn(async move {
                    worker_loop(worker, &stage, queue, handler, reporter).await;
                })
            })
            .collect();

        for (worker, joined) in join_all(handles).await.into_iter().enumerate() {
            if let Err(e) = joined {
                error!(stage, worker, error = %e, "Worker terminated abnormally");
            }
        }

        // Only reachable if every worker died, which needs an unwinding build
        while let Some((lease, task)) = queue.try_dequeue() {
            drop(task);
            let snapshot = lease.fail(&TrackError::Abandoned(
                "no worker left to process task".to_string(),
            ));
            reporter.observe(&snapshot);
        }

        let snapshot = queue.snapshot();
        reporter.observe(&snapshot);
        snapshot
    }
}

async fn worker_loop<T, H>(
    worker: usize,
    stage: &str,
    queue: Arc<WorkQueue<T>>,
    handler: Arc<H>,
    reporter: Arc<ProgressReporter>,
) where
    T: QueueTask,
    H: TaskHandler<T> + ?Sized,
{
    let mut handled = 0usize;
    loop {
        let Some((lease, task)) = queue.try_dequeue() else {
            debug!(stage, worker, handled, "No more tasks available, worker exiting");
            break;
        };

        let snapshot = match handler.handle(task).await {
            Ok(()) => lease.complete(),
            Err(e) => {
                warn!(
                    stage,
                    worker,
                    task = %lease.label(),
                    kind = e.kind(),
                    error = %e,
                    "Task failed"
                );
                lease.fail(&e)
            },
        };
        handled += 1;

        reporter.observe(&snapshot);
    }
}
