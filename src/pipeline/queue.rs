//! Job queue interface and the in-process priority queue
//!
//! Delivery is at least once: a job handed out by [`JobQueue::dequeue`] is the
//! worker's to finish, retry (via [`JobQueue::enqueue_delayed`]) or drop.

use crate::pipeline::jobs::{Job, JobPayload};
use crate::{IngestError, Result};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, payload: JobPayload, priority: u32) -> Result<()>;

    /// Makes `job` available again after `delay`, keeping its attempt count
    async fn enqueue_delayed(&self, job: Job, delay: Duration) -> Result<()>;

    /// Waits for the most urgent job; `None` once the queue is closed
    async fn dequeue(&self) -> Option<Job>;

    /// Stops handing out jobs and wakes every waiting consumer
    fn close(&self);
}

/// Heap entry ordered so that `BinaryHeap::pop` yields the lowest priority
/// number first and, within a priority, the earliest enqueued
#[derive(Debug)]
struct Queued {
    job: Job,
    seq: u64,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .job
            .priority
            .cmp(&self.job.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ready: BinaryHeap<Queued>,
    delayed: Vec<(Instant, Job)>,
    next_seq: u64,
}

impl QueueState {
    fn push(&mut self, job: Job) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ready.push(Queued { job, seq });
    }

    /// Moves matured delayed jobs into the ready heap; returns the wait until
    /// the next one matures
    fn promote(&mut self, now: Instant) -> Option<Duration> {
        let (matured, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        self.delayed = waiting;
        for (_, job) in matured {
            self.push(job);
        }
        self.delayed
            .iter()
            .map(|(at, _)| at.saturating_duration_since(now))
            .min()
    }
}

/// In-process priority queue with FIFO tie-breaking
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    closed: AtomicBool,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| IngestError::Queue("job queue mutex poisoned".into()))
    }

    /// Snapshot of every queued job in delivery order, delayed jobs last
    pub fn pending(&self) -> Vec<Job> {
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        let mut ready: Vec<&Queued> = state.ready.iter().collect();
        ready.sort_by(|a, b| b.cmp(a));
        ready
            .into_iter()
            .map(|q| q.job.clone())
            .chain(state.delayed.iter().map(|(_, job)| job.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock()
            .map(|state| state.ready.len() + state.delayed.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, payload: JobPayload, priority: u32) -> Result<()> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Err(IngestError::Queue("queue is closed".into()));
        }
        self.lock()?.push(Job::new(payload, priority));
        self.notify.notify_waiters();
        Ok(())
    }

    async fn enqueue_delayed(&self, job: Job, delay: Duration) -> Result<()> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Err(IngestError::Queue("queue is closed".into()));
        }
        {
            let mut state = self.lock()?;
            if delay.is_zero() {
                state.push(job);
            } else {
                state.delayed.push((Instant::now() + delay, job));
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(&self) -> Option<Job> {
        loop {
            // Register before looking so a concurrent enqueue cannot be missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(AtomicOrdering::SeqCst) {
                return None;
            }

            let next_due = {
                let mut state = self.lock().ok()?;
                let next_due = state.promote(Instant::now());
                if let Some(queued) = state.ready.pop() {
                    return Some(queued.job);
                }
                next_due
            };

            match next_due {
                Some(wait) => {
                    let _ = tokio::time::timeout(wait, notified).await;
                }
                None => notified.await,
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, AtomicOrdering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::jobs::JobContext;
    use std::sync::Arc;
    use uuid::Uuid;

    fn finalize(n: u128) -> JobPayload {
        JobPayload::Finalize {
            ctx: JobContext {
                tenant_id: "t".into(),
                run_id: Uuid::from_u128(n),
                trace_id: Uuid::nil(),
            },
        }
    }

    fn run_of(job: &Job) -> u128 {
        job.payload.context().run_id.as_u128()
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(finalize(1), 5).await.unwrap();
        queue.enqueue(finalize(2), 1).await.unwrap();
        queue.enqueue(finalize(3), 5).await.unwrap();
        queue.enqueue(finalize(4), 1).await.unwrap();

        assert_eq!(
            queue.pending().iter().map(run_of).collect::<Vec<_>>(),
            vec![2, 4, 1, 3]
        );

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(run_of(&queue.dequeue().await.unwrap()));
        }
        assert_eq!(order, vec![2, 4, 1, 3]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_delayed_job_becomes_available() {
        let queue = MemoryJobQueue::new();
        let mut job = Job::new(finalize(7), 1);
        job.attempts = 2;
        queue
            .enqueue_delayed(job, Duration::from_millis(30))
            .await
            .unwrap();

        let started = Instant::now();
        let job = queue.dequeue().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(25));
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn test_waiting_consumer_is_woken() {
        let queue = Arc::new(MemoryJobQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(finalize(9), 3).await.unwrap();

        let job = consumer.await.unwrap().unwrap();
        assert_eq!(run_of(&job), 9);
    }

    #[tokio::test]
    async fn test_close_releases_consumers() {
        let queue = Arc::new(MemoryJobQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        assert!(consumer.await.unwrap().is_none());
        assert!(queue.enqueue(finalize(1), 1).await.is_err());
    }
}
