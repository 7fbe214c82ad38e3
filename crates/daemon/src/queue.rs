//! Render queue for reelforge
//!
//! Admits jobs in FIFO order and runs at most `concurrency_limit` of them at
//! once, limited by a tokio Semaphore. A single dispatcher task pulls jobs
//! off the channel and only takes the next one once it holds a permit, so
//! admission order always matches enqueue order.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::job::Job;
use crate::orchestrator::{FailedJob, JobRunner};

/// Error type for queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue no longer admits jobs
    #[error("Render queue is shutting down")]
    ShuttingDown,

    /// The job was dropped before it settled (shutdown or crashed task)
    #[error("Job {0} was abandoned before it settled")]
    Abandoned(String),

    /// The job reached the Failed state
    #[error(transparent)]
    Failed(Box<FailedJob>),
}

/// Queue tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    /// Maximum number of jobs running at once (at least 1)
    pub concurrency_limit: usize,
    /// How long a running queue may go without progress before it is unhealthy
    pub watchdog: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

impl QueueSettings {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            concurrency_limit: config.concurrency as usize,
            watchdog: Duration::from_secs(config.watchdog_secs),
        }
    }
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Jobs waiting for a slot
    pub queue_length: usize,
    /// Jobs currently running
    pub running_count: usize,
    pub concurrency_limit: usize,
    pub healthy: bool,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
}

/// How a shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every in-flight job settled within the grace period
    Drained,
    /// The grace period ran out with jobs still running
    Abandoned { in_flight: usize },
}

/// Resolves once the job settles.
#[derive(Debug)]
pub struct JobHandle {
    job_id: String,
    rx: oneshot::Receiver<Result<Job, FailedJob>>,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Wait for the job. Resolves with the completed job, rejects on failure.
    pub async fn wait(self) -> Result<Job, QueueError> {
        match self.rx.await {
            Ok(Ok(job)) => Ok(job),
            Ok(Err(failed)) => Err(QueueError::Failed(Box::new(failed))),
            Err(_) => Err(QueueError::Abandoned(self.job_id)),
        }
    }
}

struct Envelope {
    job: Job,
    reply: oneshot::Sender<Result<Job, FailedJob>>,
}

/// Counters shared between the queue handle, the dispatcher and job tasks.
struct QueueState {
    queued: AtomicUsize,
    running: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    last_progress_at: Mutex<Instant>,
    idle: Notify,
}

impl QueueState {
    fn new() -> Self {
        Self {
            queued: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_progress_at: Mutex::new(Instant::now()),
            idle: Notify::new(),
        }
    }

    fn touch(&self) {
        let mut last = self
            .last_progress_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Instant::now();
    }

    fn since_progress(&self) -> Duration {
        self.last_progress_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }
}

/// A running job's hold on a concurrency slot.
///
/// Releases the slot on drop, including when the job task panics. A slot
/// dropped without [`RunningSlot::settle`] counts as a failed job.
struct RunningSlot {
    job_id: String,
    state: Arc<QueueState>,
    permit: Option<OwnedSemaphorePermit>,
    settled: bool,
}

impl RunningSlot {
    fn new(job_id: String, state: Arc<QueueState>, permit: OwnedSemaphorePermit) -> Self {
        state.running.fetch_add(1, Ordering::SeqCst);
        state.touch();
        Self {
            job_id,
            state,
            permit: Some(permit),
            settled: false,
        }
    }

    fn settle(mut self, completed: bool) {
        let counter = if completed {
            &self.state.completed
        } else {
            &self.state.failed
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.settled = true;
    }
}

impl Drop for RunningSlot {
    fn drop(&mut self) {
        if !self.settled {
            self.state.failed.fetch_add(1, Ordering::SeqCst);
            warn!(job_id = %self.job_id, "Job task ended without settling");
        }
        self.state.running.fetch_sub(1, Ordering::SeqCst);
        self.state.touch();
        self.permit.take();
        self.state.idle.notify_waiters();
    }
}

/// Long-lived queue created once at startup and shared by handle.
pub struct RenderQueue {
    tx: mpsc::UnboundedSender<Envelope>,
    state: Arc<QueueState>,
    shutdown_tx: watch::Sender<bool>,
    settings: QueueSettings,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl RenderQueue {
    /// Create the queue and start its dispatcher. Must be called inside a
    /// tokio runtime.
    pub fn new(runner: Arc<dyn JobRunner>, settings: QueueSettings) -> Self {
        let settings = QueueSettings {
            concurrency_limit: settings.concurrency_limit.max(1),
            ..settings
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(QueueState::new());

        let dispatcher = tokio::spawn(dispatch(
            rx,
            runner,
            Arc::new(Semaphore::new(settings.concurrency_limit)),
            state.clone(),
            shutdown_rx,
        ));

        info!(
            concurrency_limit = settings.concurrency_limit,
            watchdog_secs = settings.watchdog.as_secs(),
            "Render queue started"
        );

        Self {
            tx,
            state,
            shutdown_tx,
            settings,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn settings(&self) -> QueueSettings {
        self.settings
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Queue a job.
    pub fn enqueue(&self, job: Job) -> Result<JobHandle, QueueError> {
        if self.is_shutting_down() {
            return Err(QueueError::ShuttingDown);
        }

        let job_id = job.id.clone();
        let (reply, rx) = oneshot::channel();

        self.state.queued.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(Envelope { job, reply }).is_err() {
            self.state.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::ShuttingDown);
        }

        info!(
            job_id = %job_id,
            queue_length = self.state.queued.load(Ordering::SeqCst),
            "Job enqueued"
        );
        Ok(JobHandle { job_id, rx })
    }

    /// Whether the queue is making progress.
    ///
    /// Unhealthy only while jobs are running and nothing has been admitted
    /// or settled for longer than the watchdog threshold.
    pub fn is_healthy(&self) -> bool {
        self.state.running.load(Ordering::SeqCst) == 0
            || self.state.since_progress() <= self.settings.watchdog
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            queue_length: self.state.queued.load(Ordering::SeqCst),
            running_count: self.state.running.load(Ordering::SeqCst),
            concurrency_limit: self.settings.concurrency_limit,
            healthy: self.is_healthy(),
            completed_jobs: self.state.completed.load(Ordering::SeqCst),
            failed_jobs: self.state.failed.load(Ordering::SeqCst),
        }
    }

    /// Stop admitting jobs and wait up to `grace` for running ones.
    ///
    /// Jobs still waiting for a slot are dropped; their handles resolve to
    /// [`QueueError::Abandoned`]. Running jobs that outlive the grace period
    /// are left to the runtime.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownOutcome {
        self.shutdown_tx.send_replace(true);
        info!(grace_secs = grace.as_secs(), "Render queue shutting down");

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.await;
        }

        match tokio::time::timeout(grace, self.wait_idle()).await {
            Ok(()) => {
                info!("All in-flight jobs settled");
                ShutdownOutcome::Drained
            }
            Err(_) => {
                let in_flight = self.state.running.load(Ordering::SeqCst);
                warn!(in_flight, "Grace period expired, abandoning in-flight jobs");
                ShutdownOutcome::Abandoned { in_flight }
            }
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.state.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state.running.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Re-evaluate health every `interval` and log transitions.
    pub fn spawn_health_monitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let interval = interval.max(Duration::from_millis(100));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut was_healthy = true;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }

                let healthy = queue.is_healthy();
                if healthy != was_healthy {
                    if healthy {
                        info!("Render queue healthy again");
                    } else {
                        let status = queue.status();
                        warn!(
                            running = status.running_count,
                            queued = status.queue_length,
                            stalled_secs = queue.state.since_progress().as_secs(),
                            "Render queue stalled"
                        );
                    }
                }
                was_healthy = healthy;
            }
        })
    }
}

/// Dispatcher loop: one job at a time, in order, each behind a permit.
async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    runner: Arc<dyn JobRunner>,
    semaphore: Arc<Semaphore>,
    state: Arc<QueueState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let envelope = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let permit = tokio::select! {
            biased;
            _ = shutdown.changed() => None,
            permit = semaphore.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            state.queued.fetch_sub(1, Ordering::SeqCst);
            debug!(job_id = %envelope.job.id, "Dropping queued job");
            break;
        };

        state.queued.fetch_sub(1, Ordering::SeqCst);
        let slot = RunningSlot::new(envelope.job.id.clone(), state.clone(), permit);
        debug!(job_id = %envelope.job.id, "Job admitted");

        let runner = runner.clone();
        tokio::spawn(async move {
            let Envelope { job, reply } = envelope;
            let outcome = runner.run(job).await;
            slot.settle(outcome.is_ok());

            // The caller may have dropped its handle.
            let _ = reply.send(outcome);
        });
    }

    // Jobs still waiting for a slot are dropped; their handles see Abandoned.
    rx.close();
    while let Ok(envelope) = rx.try_recv() {
        state.queued.fetch_sub(1, Ordering::SeqCst);
        debug!(job_id = %envelope.job.id, "Dropping queued job");
    }

    debug!("Dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{FailureDetail, JobPayload, JobStatus};
    use crate::layout::ValidationError;
    use crate::orchestrator::JobError;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Runner that sleeps a per-job duration and records admission.
    #[derive(Default)]
    struct SleepRunner {
        durations: HashMap<String, Duration>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        starts: Mutex<Vec<(String, Instant)>>,
    }

    impl SleepRunner {
        fn with(jobs: &[(&str, u64)]) -> Self {
            Self {
                durations: jobs
                    .iter()
                    .map(|(id, secs)| (id.to_string(), Duration::from_secs(*secs)))
                    .collect(),
                ..Default::default()
            }
        }

        fn start_order(&self) -> Vec<String> {
            self.starts.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
        }

        fn started_at(&self, id: &str) -> Instant {
            self.starts
                .lock()
                .unwrap()
                .iter()
                .find(|(job_id, _)| job_id == id)
                .map(|(_, at)| *at)
                .unwrap()
        }
    }

    #[async_trait]
    impl JobRunner for SleepRunner {
        async fn run(&self, mut job: Job) -> Result<Job, FailedJob> {
            if job.id.starts_with("boom") {
                panic!("runner crashed on {}", job.id);
            }
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            self.starts.lock().unwrap().push((job.id.clone(), Instant::now()));

            let duration = self.durations.get(&job.id).copied().unwrap_or(Duration::from_secs(1));
            tokio::time::sleep(duration).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if job.id.starts_with("bad") {
                let error = JobError::Validation(ValidationError::UnknownLayout("mosaic".into()));
                let detail = FailureDetail::from_error(&error);
                job.status = JobStatus::Failed;
                return Err(FailedJob { job, error, detail });
            }
            job.status = JobStatus::Completed;
            Ok(job)
        }
    }

    fn settings(limit: usize) -> QueueSettings {
        QueueSettings {
            concurrency_limit: limit,
            watchdog: Duration::from_secs(300),
        }
    }

    fn job(id: &str) -> Job {
        Job::new(id, JobPayload::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_is_never_exceeded() {
        let runner = Arc::new(SleepRunner::with(&[
            ("a", 10),
            ("b", 3),
            ("c", 7),
            ("d", 1),
            ("e", 12),
            ("f", 4),
        ]));
        let queue = RenderQueue::new(runner.clone(), settings(2));

        let handles: Vec<_> = ["a", "b", "c", "d", "e", "f"]
            .iter()
            .map(|id| queue.enqueue(job(id)).unwrap())
            .collect();
        for handle in handles {
            handle.wait().await.unwrap();
        }

        assert_eq!(runner.max_active.load(Ordering::SeqCst), 2);
        let status = queue.status();
        assert_eq!(status.running_count, 0);
        assert_eq!(status.queue_length, 0);
        assert_eq!(status.completed_jobs, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_admission_with_staggered_jobs() {
        let runner = Arc::new(SleepRunner::with(&[
            ("job-1", 30),
            ("job-2", 10),
            ("job-3", 10),
            ("job-4", 10),
            ("job-5", 10),
        ]));
        let queue = RenderQueue::new(runner.clone(), settings(2));
        let t0 = Instant::now();

        let mut handles = Vec::new();
        for i in 1..=5 {
            handles.push(queue.enqueue(job(&format!("job-{}", i))).unwrap());
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        for handle in handles {
            handle.wait().await.unwrap();
        }

        assert_eq!(
            runner.start_order(),
            vec!["job-1", "job-2", "job-3", "job-4", "job-5"]
        );
        // job-3 waits for job-2 (the shorter of the first two) to settle
        let job_2_done = runner.started_at("job-2") + Duration::from_secs(10);
        assert!(runner.started_at("job-3") >= job_2_done);
        assert!(runner.started_at("job-2") - t0 < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job_rejects_handle() {
        let runner = Arc::new(SleepRunner::default());
        let queue = RenderQueue::new(runner, settings(1));

        let err = queue.enqueue(job("bad-1")).unwrap().wait().await.unwrap_err();

        match err {
            QueueError::Failed(failed) => {
                assert_eq!(failed.job.id, "bad-1");
                assert!(failed.error.is_terminal());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(queue.status().failed_jobs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_follows_watchdog() {
        let runner = Arc::new(SleepRunner::with(&[("slow", 420)]));
        let queue = RenderQueue::new(runner, settings(1));
        assert!(queue.is_healthy());

        let handle = queue.enqueue(job("slow")).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(queue.is_healthy());
        assert_eq!(queue.status().running_count, 1);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(!queue.is_healthy());
        assert!(!queue.status().healthy);

        handle.wait().await.unwrap();
        assert!(queue.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_queue_is_always_healthy() {
        let queue = RenderQueue::new(Arc::new(SleepRunner::default()), settings(2));
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(queue.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_in_flight_jobs() {
        let runner = Arc::new(SleepRunner::with(&[("a", 5)]));
        let queue = RenderQueue::new(runner, settings(1));

        let handle = queue.enqueue(job("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let outcome = queue.shutdown(Duration::from_secs(30)).await;

        assert_eq!(outcome, ShutdownOutcome::Drained);
        assert!(handle.wait().await.is_ok());
        assert!(matches!(
            queue.enqueue(job("late")),
            Err(QueueError::ShuttingDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_after_grace() {
        let runner = Arc::new(SleepRunner::with(&[("long", 600), ("waiting", 1)]));
        let queue = RenderQueue::new(runner, settings(1));

        let _running = queue.enqueue(job("long")).unwrap();
        let waiting = queue.enqueue(job("waiting")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let outcome = queue.shutdown(Duration::from_secs(5)).await;

        assert_eq!(outcome, ShutdownOutcome::Abandoned { in_flight: 1 });
        assert!(matches!(
            waiting.wait().await,
            Err(QueueError::Abandoned(id)) if id == "waiting"
        ));
        assert_eq!(queue.status().queue_length, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_job_releases_its_slot() {
        let runner = Arc::new(SleepRunner::with(&[("after", 2)]));
        let queue = RenderQueue::new(runner, settings(1));

        let crashed = queue.enqueue(job("boom-1")).unwrap();
        let after = queue.enqueue(job("after")).unwrap();

        assert!(matches!(
            crashed.wait().await,
            Err(QueueError::Abandoned(id)) if id == "boom-1"
        ));
        // only one slot, so this needs the crashed job's permit back
        after.wait().await.unwrap();

        tokio::time::sleep(Duration::from_secs(600)).await;
        let status = queue.status();
        assert_eq!(status.running_count, 0);
        assert!(status.healthy);
        assert_eq!(status.failed_jobs, 1);
        assert_eq!(status.completed_jobs, 1);

        assert_eq!(
            queue.shutdown(Duration::from_secs(5)).await,
            ShutdownOutcome::Drained
        );
    }

    #[tokio::test]
    async fn test_zero_concurrency_is_clamped() {
        let queue = RenderQueue::new(Arc::new(SleepRunner::default()), settings(0));
        assert_eq!(queue.settings().concurrency_limit, 1);
    }
}
