//! Worker pool pulling jobs off the shared queue

use crate::pipeline::jobs::Job;
use crate::pipeline::processors::{JobOutcome, JobProcessor};
use crate::pipeline::queue::JobQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Longest wait between two attempts of a job
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// Wait before the next attempt of a job that has failed `attempts` times
///
/// Doubles with every failure starting from `base_ms`, capped at
/// [`MAX_RETRY_BACKOFF`].
pub fn retry_backoff(base_ms: u64, attempts: u32) -> Duration {
    let doublings = attempts.saturating_sub(1).min(20);
    Duration::from_millis(base_ms.saturating_mul(1u64 << doublings)).min(MAX_RETRY_BACKOFF)
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `worker-count` workers on the current runtime
    pub fn spawn(queue: Arc<dyn JobQueue>, processor: Arc<JobProcessor>) -> Self {
        let count = processor.config().worker_count.max(1);
        let handles = (0..count)
            .map(|worker_id| {
                let queue = queue.clone();
                let processor = processor.clone();
                tokio::spawn(async move {
                    while let Some(job) = queue.dequeue().await {
                        let ctx = job.payload.context();
                        let span = info_span!(
                            "job",
                            worker = worker_id,
                            kind = job.payload.kind(),
                            run = %ctx.run_id,
                            trace = %ctx.trace_id,
                            attempt = job.attempts + 1,
                        );
                        handle_job(queue.as_ref(), &processor, job)
                            .instrument(span)
                            .await;
                    }
                    debug!("Worker {} stopped", worker_id);
                })
            })
            .collect();
        info!("Started {} workers", count);

        Self { queue, handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Closes the queue and waits for every worker to finish its current job
    pub async fn shutdown(self) {
        self.queue.close();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

/// Runs one attempt of `job` and applies the retry policy to its outcome
pub(crate) async fn handle_job(queue: &dyn JobQueue, processor: &JobProcessor, mut job: Job) {
    let error = match processor.process(&job).await {
        Ok(JobOutcome::Done) => return,
        Ok(JobOutcome::Deferred(delay)) => {
            if let Err(e) = queue.enqueue_delayed(job, delay).await {
                warn!("Dropping deferred job: {}", e);
            }
            return;
        }
        Err(e) => e,
    };

    let max_attempts = processor.config().max_job_attempts.max(1);
    if error.is_retryable() && job.attempts + 1 < max_attempts {
        job.attempts += 1;
        let delay = retry_backoff(processor.config().retry_backoff_ms, job.attempts);
        warn!(
            "Attempt {}/{} failed, retrying in {:?}: {}",
            job.attempts, max_attempts, delay, error
        );
        if let Err(e) = queue.enqueue_delayed(job, delay).await {
            warn!("Dropping job instead of retrying: {}", e);
        }
        return;
    }

    if let Err(e) = processor.record_exhausted(&job, &error).await {
        error!("Failed to record exhausted job: {}", e);
    }
}
