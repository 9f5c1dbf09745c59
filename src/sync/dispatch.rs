//! Job descriptors and the in-process job queue.
//!
//! Delivery is at-least-once: a job failing with a transient error is queued
//! again at the same priority, after a delay that doubles with every attempt,
//! until its attempts run out. Jobs carry no
//! ordering guarantee relative to each other; high-priority jobs are picked
//! first whenever both lanes have work.

use crate::db::CollectionKind;
use crate::error::{AppError, Result};
use crate::sync::{FetchMode, FetchModes};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::task::JoinHandle;

/// A unit of sync work. Every job is idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    /// Fan out collection syncs for one local user's AO3 account.
    SyncAccount {
        /// Local user.
        user_id: String,
        /// Fetch modes for the whole run.
        modes: FetchModes,
    },
    /// Reconcile one collection against its remote listing.
    SyncCollection {
        /// Owning account.
        account_id: i64,
        /// List kind.
        kind: CollectionKind,
        /// Session token to list with.
        session: String,
        /// Fetch modes for the run.
        modes: FetchModes,
    },
    /// Fetch one work and link it to a collection.
    FetchItem {
        /// Session token to fetch with.
        session: String,
        /// Collection to link the work to.
        collection_id: i64,
        /// AO3 work id.
        remote_id: u64,
        /// Item fetch mode.
        mode: FetchMode,
    },
}

impl Job {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Job::SyncAccount { .. } => "sync_account",
            Job::SyncCollection { .. } => "sync_collection",
            Job::FetchItem { .. } => "fetch_item",
        }
    }
}

/// Queue lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Interactive, user-triggered work.
    High,
    /// Background, scheduled work.
    Low,
}

/// Accepts jobs for later execution.
pub trait Dispatcher: Send + Sync {
    /// Queue `job` on the given lane.
    fn dispatch(&self, job: Job, priority: Priority) -> Result<()>;
}

/// Executes jobs pulled from a queue.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run one job. Follow-up jobs go to `dispatcher`.
    async fn run(&self, job: Job, priority: Priority, dispatcher: &dyn Dispatcher) -> Result<()>;
}

/// Collects jobs in memory instead of running them.
///
/// Used for inline refreshes, where the caller drains the buffer before
/// responding.
#[derive(Default)]
pub struct JobBuffer {
    high: Mutex<VecDeque<Job>>,
    low: Mutex<VecDeque<Job>>,
}

impl JobBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next job, high priority first.
    pub fn pop(&self) -> Option<(Job, Priority)> {
        if let Some(job) = self.high.lock().pop_front() {
            return Some((job, Priority::High));
        }
        self.low.lock().pop_front().map(|job| (job, Priority::Low))
    }

    /// Number of buffered jobs.
    pub fn len(&self) -> usize {
        self.high.lock().len() + self.low.lock().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of buffered jobs, high priority first.
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.high.lock().iter().cloned().collect();
        jobs.extend(self.low.lock().iter().cloned());
        jobs
    }
}

impl Dispatcher for JobBuffer {
    fn dispatch(&self, job: Job, priority: Priority) -> Result<()> {
        match priority {
            Priority::High => self.high.lock().push_back(job),
            Priority::Low => self.low.lock().push_back(job),
        }
        Ok(())
    }
}

struct Envelope {
    job: Job,
    priority: Priority,
    attempt: u32,
}

/// Receiving half of a [`JobQueue`], consumed by [`JobQueue::spawn`].
pub struct JobReceiver {
    high: mpsc::UnboundedReceiver<Envelope>,
    low: mpsc::UnboundedReceiver<Envelope>,
}

/// Two-lane job queue served by a bounded pool of tokio tasks.
pub struct JobQueue {
    high: mpsc::UnboundedSender<Envelope>,
    low: mpsc::UnboundedSender<Envelope>,
    pending: AtomicUsize,
    idle: Notify,
}

impl JobQueue {
    /// Create a queue. Jobs dispatched before [`JobQueue::spawn`] wait in
    /// their lane.
    pub fn new() -> (Arc<Self>, JobReceiver) {
        let (high_tx, high_rx) = mpsc::unbounded_channel();
        let (low_tx, low_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            high: high_tx,
            low: low_tx,
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
        });
        (
            queue,
            JobReceiver {
                high: high_rx,
                low: low_rx,
            },
        )
    }

    /// Start serving jobs with at most `workers` running at once. Each job is
    /// delivered at most `max_attempts` times, waiting `retry_delay` before the
    /// second delivery and twice as long before each further one.
    pub fn spawn(
        self: &Arc<Self>,
        mut receiver: JobReceiver,
        runner: Arc<dyn JobRunner>,
        workers: usize,
        max_attempts: u32,
        retry_delay: Duration,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let permits = Arc::new(Semaphore::new(workers.max(1)));

        tokio::spawn(async move {
            loop {
                // Take a slot first so the lane is chosen when a worker is free.
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };

                let envelope = tokio::select! {
                    biased;
                    Some(envelope) = receiver.high.recv() => envelope,
                    Some(envelope) = receiver.low.recv() => envelope,
                    else => break,
                };

                let queue = Arc::clone(&queue);
                let runner = Arc::clone(&runner);
                tokio::spawn(async move {
                    let _permit = permit;
                    queue
                        .execute(envelope, runner.as_ref(), max_attempts, retry_delay)
                        .await;
                });
            }
            tracing::debug!("Job queue stopped");
        })
    }

    async fn execute(
        self: &Arc<Self>,
        envelope: Envelope,
        runner: &dyn JobRunner,
        max_attempts: u32,
        retry_delay: Duration,
    ) {
        let name = envelope.job.name();
        let result = runner
            .run(envelope.job.clone(), envelope.priority, &**self)
            .await;

        match result {
            Ok(()) => tracing::debug!(job = name, attempt = envelope.attempt, "Job finished"),
            Err(e) if e.is_transient() && envelope.attempt < max_attempts => {
                let delay = retry_delay.saturating_mul(1u32 << (envelope.attempt - 1).min(16));
                tracing::warn!(
                    job = name,
                    attempt = envelope.attempt,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "Job failed, queueing again"
                );
                self.requeue(
                    Envelope {
                        attempt: envelope.attempt + 1,
                        ..envelope
                    },
                    delay,
                );
            }
            Err(e) => tracing::warn!(
                job = name,
                attempt = envelope.attempt,
                error = %e,
                "Job failed, dropping"
            ),
        }

        self.finish();
    }

    /// Send `envelope` again after `delay`. The job counts as pending while it
    /// waits.
    fn requeue(self: &Arc<Self>, envelope: Envelope, delay: Duration) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let name = envelope.job.name();
            if let Err(e) = queue.send(envelope) {
                tracing::error!(job = name, error = %e, "Failed to requeue job");
            }
            queue.finish();
        });
    }

    fn finish(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn send(&self, envelope: Envelope) -> Result<()> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let lane = match envelope.priority {
            Priority::High => &self.high,
            Priority::Low => &self.low,
        };
        lane.send(envelope).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            AppError::Internal("Job queue is closed".to_string())
        })
    }

    /// Number of jobs queued or running.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait until no job is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Dispatcher for JobQueue {
    fn dispatch(&self, job: Job, priority: Priority) -> Result<()> {
        tracing::debug!(job = job.name(), ?priority, "Job queued");
        self.send(Envelope {
            job,
            priority,
            attempt: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Records the jobs it runs; fails each job with the scripted errors first.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(Job, Priority)>>,
        failures: Mutex<HashMap<u64, Vec<AppError>>>,
    }

    #[async_trait]
    impl JobRunner for Recorder {
        async fn run(&self, job: Job, priority: Priority, _dispatcher: &dyn Dispatcher) -> Result<()> {
            self.seen.lock().push((job.clone(), priority));
            if let Job::FetchItem { remote_id, .. } = job
                && let Some(errors) = self.failures.lock().get_mut(&remote_id)
                && !errors.is_empty()
            {
                return Err(errors.remove(0));
            }
            Ok(())
        }
    }

    fn fetch(remote_id: u64) -> Job {
        Job::FetchItem {
            session: "v1.e30".to_string(),
            collection_id: 1,
            remote_id,
            mode: FetchMode::UpdateStale,
        }
    }

    fn ids(recorder: &Recorder) -> Vec<u64> {
        recorder
            .seen
            .lock()
            .iter()
            .filter_map(|(job, _)| match job {
                Job::FetchItem { remote_id, .. } => Some(*remote_id),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn high_priority_jobs_run_first() {
        let (queue, receiver) = JobQueue::new();
        queue.dispatch(fetch(1), Priority::Low).unwrap();
        queue.dispatch(fetch(2), Priority::Low).unwrap();
        queue.dispatch(fetch(3), Priority::High).unwrap();
        assert_eq!(queue.pending(), 3);

        let recorder = Arc::new(Recorder::default());
        let handle = queue.spawn(receiver, recorder.clone(), 1, 3, Duration::ZERO);
        queue.wait_idle().await;
        handle.abort();

        assert_eq!(ids(&recorder), vec![3, 1, 2]);
        assert_eq!(recorder.seen.lock()[0].1, Priority::High);
    }

    #[tokio::test]
    async fn transient_failures_are_delivered_again() {
        let (queue, receiver) = JobQueue::new();
        let recorder = Arc::new(Recorder::default());
        recorder.failures.lock().insert(
            7,
            vec![AppError::Remote("reset".into()), AppError::Timeout(30)],
        );
        recorder
            .failures
            .lock()
            .insert(8, vec![AppError::Authentication("bad".into())]);
        recorder.failures.lock().insert(
            9,
            vec![
                AppError::Remote("1".into()),
                AppError::Remote("2".into()),
                AppError::Remote("3".into()),
            ],
        );

        queue.dispatch(fetch(7), Priority::High).unwrap();
        queue.dispatch(fetch(8), Priority::High).unwrap();
        queue.dispatch(fetch(9), Priority::Low).unwrap();
        let handle = queue.spawn(receiver, recorder.clone(), 2, 3, Duration::ZERO);
        queue.wait_idle().await;
        handle.abort();

        let runs = ids(&recorder);
        assert_eq!(runs.iter().filter(|&&id| id == 7).count(), 3);
        assert_eq!(runs.iter().filter(|&&id| id == 8).count(), 1);
        // Three failures exhaust three attempts.
        assert_eq!(runs.iter().filter(|&&id| id == 9).count(), 3);
        assert!(recorder.failures.lock()[&9].is_empty());
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn redelivery_waits_longer_each_attempt() {
        let (queue, receiver) = JobQueue::new();
        let recorder = Arc::new(Recorder::default());
        recorder.failures.lock().insert(
            5,
            vec![AppError::Remote("reset".into()), AppError::Remote("reset".into())],
        );

        let started = std::time::Instant::now();
        queue.dispatch(fetch(5), Priority::High).unwrap();
        let handle = queue.spawn(receiver, recorder.clone(), 1, 3, Duration::from_millis(100));

        // Still pending while the first redelivery waits.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ids(&recorder), vec![5]);
        assert_eq!(queue.pending(), 1);

        queue.wait_idle().await;
        handle.abort();

        // 100 ms before the second delivery, 200 ms before the third.
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(ids(&recorder), vec![5, 5, 5]);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn buffer_pops_high_priority_first() {
        let buffer = JobBuffer::new();
        buffer.dispatch(fetch(1), Priority::Low).unwrap();
        buffer.dispatch(fetch(2), Priority::High).unwrap();
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.pop(), Some((fetch(2), Priority::High)));
        assert_eq!(buffer.pop(), Some((fetch(1), Priority::Low)));
        assert!(buffer.pop().is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn jobs_serialize_as_tagged_descriptors() {
        let job = Job::SyncAccount {
            user_id: "u1".to_string(),
            modes: FetchModes::default(),
        };
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["job"], "sync_account");
        assert_eq!(json["modes"]["feed"], "update_stale");
        let back: Job = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }
}
