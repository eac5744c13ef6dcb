//! Worker pool: N tasks draining the scheduler's work queue.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::batch::BatchEngine;
use crate::scheduler::JobScheduler;

/// Owns the worker tasks that run dequeued jobs against a batch engine.
pub struct WorkerPool {
    scheduler: Arc<JobScheduler>,
    engine: Arc<dyn BatchEngine>,
    worker_count: usize,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(scheduler: Arc<JobScheduler>, engine: Arc<dyn BatchEngine>, worker_count: usize) -> Self {
        Self {
            scheduler,
            engine,
            worker_count: worker_count.max(1),
            handles: Vec::new(),
        }
    }

    /// Spawn every worker. Workers run until the pool is shut down.
    pub fn start(&mut self) {
        for i in 0..self.worker_count {
            let worker_id = format!("worker-{i:02}");
            let scheduler = self.scheduler.clone();
            let engine = self.engine.clone();
            let queue = scheduler.queue();
            let id = worker_id.clone();

            let handle = tokio::spawn(async move {
                loop {
                    let next = queue.lock().await.recv().await;
                    let Some(job_id) = next else {
                        debug!(worker_id = %id, "Work queue closed");
                        break;
                    };
                    debug!(worker_id = %id, job_id = %job_id, "Picked up job");
                    metrics::gauge!("scheduler.busy_workers").increment(1.0);
                    scheduler.execute(job_id, engine.as_ref()).await;
                    metrics::gauge!("scheduler.busy_workers").decrement(1.0);
                }
            });
            self.handles.push(handle);

            info!(worker_id = %worker_id, "Worker spawned");
        }

        info!(
            count = self.worker_count,
            engine = self.engine.name(),
            "All workers started"
        );
    }

    /// Abort every worker. In-flight attempts are abandoned.
    pub fn shutdown(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        info!("Worker pool stopped");
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }
}
