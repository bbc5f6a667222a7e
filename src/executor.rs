//! Task executor
//!
//! Runs pipeline jobs off the caller's task. The orchestrator only depends on
//! the [`TaskExecutor`] trait; [`WorkerPool`] is the in-process implementation
//! with a fixed number of workers, so at most `max_concurrent_runs` runs are
//! active at once and the rest wait in FIFO order.

pub mod cancel;

pub use cancel::CancellationToken;

use crate::error::PipelineError;
use crate::types::RunId;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Runs executing at the same time, system-wide
    pub max_concurrent_runs: usize,
    /// Runs allowed to wait for a worker before submissions are rejected
    pub max_queued_runs: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 4,
            max_queued_runs: 1000,
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_runs == 0 {
            return Err("executor.max_concurrent_runs must be at least 1".to_string());
        }
        Ok(())
    }
}

/// One unit of work: a whole pipeline run.
///
/// The job must observe `token` itself; the executor only sets it.
pub struct RunTask {
    pub run_id: RunId,
    pub token: CancellationToken,
    pub job: BoxFuture<'static, ()>,
}

impl RunTask {
    pub fn new(run_id: RunId, token: CancellationToken, job: BoxFuture<'static, ()>) -> Self {
        Self { run_id, token, job }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    /// Submitted runs waiting for a worker
    pub pending: usize,
    /// Runs currently holding a worker
    pub running: usize,
    /// Runs whose job has returned
    pub completed: usize,
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Queue a run; returns once the task is accepted, not when it finishes.
    fn submit(&self, task: RunTask) -> Result<(), PipelineError>;

    fn stats(&self) -> ExecutorStats;

    /// Stop accepting work, cancel queued and running tasks and wait for
    /// every worker to exit.
    async fn shutdown(&self);
}

/// Bounded in-process worker pool
pub struct WorkerPool {
    queue: Arc<Mutex<VecDeque<RunTask>>>,
    notify: Arc<Notify>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<RwLock<bool>>,
    stats: Arc<RwLock<ExecutorStats>>,
    in_flight: Arc<Mutex<HashMap<RunId, CancellationToken>>>,
    config: ExecutorConfig,
}

impl WorkerPool {
    const IDLE_POLL: Duration = Duration::from_millis(100);

    /// Spawn the workers on the current tokio runtime.
    pub fn start(config: ExecutorConfig) -> Result<Arc<Self>, PipelineError> {
        config.validate().map_err(PipelineError::Config)?;
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| PipelineError::ExecutorStopped(format!("no tokio runtime: {}", e)))?;

        let pool = Arc::new(Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            notify: Arc::new(Notify::new()),
            workers: Mutex::new(Vec::new()),
            running: Arc::new(RwLock::new(true)),
            stats: Arc::new(RwLock::new(ExecutorStats::default())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            config,
        });

        let mut workers = pool.workers.lock();
        for worker_id in 0..pool.config.max_concurrent_runs {
            let queue = Arc::clone(&pool.queue);
            let notify = Arc::clone(&pool.notify);
            let running = Arc::clone(&pool.running);
            let stats = Arc::clone(&pool.stats);
            let in_flight = Arc::clone(&pool.in_flight);
            workers.push(handle.spawn(async move {
                Self::worker_loop(worker_id, queue, notify, running, stats, in_flight).await;
            }));
        }
        info!(worker_count = workers.len(), "Started run workers");
        drop(workers);

        Ok(pool)
    }

    async fn worker_loop(
        worker_id: usize,
        queue: Arc<Mutex<VecDeque<RunTask>>>,
        notify: Arc<Notify>,
        running: Arc<RwLock<bool>>,
        stats: Arc<RwLock<ExecutorStats>>,
        in_flight: Arc<Mutex<HashMap<RunId, CancellationToken>>>,
    ) {
        debug!(worker_id, "Worker started");

        while *running.read() {
            let task = queue.lock().pop_front();
            let Some(task) = task else {
                // Wake on submit, or periodically to notice shutdown.
                tokio::select! {
                    _ = notify.notified() => continue,
                    _ = sleep(Self::IDLE_POLL) => continue,
                }
            };

            {
                let mut stats = stats.write();
                stats.pending = stats.pending.saturating_sub(1);
                stats.running += 1;
            }
            in_flight.lock().insert(task.run_id.clone(), task.token.clone());
            debug!(worker_id, run_id = %task.run_id, "Worker picked up run");

            let started = Instant::now();
            task.job.await;

            in_flight.lock().remove(&task.run_id);
            {
                let mut stats = stats.write();
                stats.running = stats.running.saturating_sub(1);
                stats.completed += 1;
            }
            debug!(
                worker_id,
                run_id = %task.run_id,
                duration_ms = started.elapsed().as_millis() as u64,
                "Worker finished run"
            );
        }

        debug!(worker_id, "Worker stopped");
    }
}

#[async_trait]
impl TaskExecutor for WorkerPool {
    fn submit(&self, task: RunTask) -> Result<(), PipelineError> {
        if !*self.running.read() {
            return Err(PipelineError::ExecutorStopped(
                "worker pool has been shut down".to_string(),
            ));
        }

        let mut queue = self.queue.lock();
        if queue.len() >= self.config.max_queued_runs {
            warn!(
                queue_size = queue.len(),
                max_size = self.config.max_queued_runs,
                "Run queue is full, rejecting run"
            );
            return Err(PipelineError::QueueFull(queue.len()));
        }
        let run_id = task.run_id.clone();
        queue.push_back(task);
        let queue_size = queue.len();
        self.stats.write().pending += 1;
        drop(queue);

        self.notify.notify_one();
        debug!(run_id = %run_id, queue_size, "Queued run");
        Ok(())
    }

    fn stats(&self) -> ExecutorStats {
        self.stats.read().clone()
    }

    async fn shutdown(&self) {
        {
            let mut running = self.running.write();
            if !*running {
                return;
            }
            *running = false;
        }

        for token in self.in_flight.lock().values() {
            token.cancel();
        }

        // Queued jobs still run once so they can record their cancellation.
        let drained: Vec<RunTask> = self.queue.lock().drain(..).collect();
        for task in drained {
            task.token.cancel();
            {
                let mut stats = self.stats.write();
                stats.pending = stats.pending.saturating_sub(1);
            }
            task.job.await;
            self.stats.write().completed += 1;
        }

        self.notify.notify_waiters();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(err) = handle.await {
                warn!(error = %err, "Run worker ended abnormally");
            }
        }
        info!("Stopped run workers");
    }
}
