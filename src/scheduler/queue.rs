//! Priority task queue and worker pool.
//!
//! A min-heap keyed by `(priority, submit sequence)` gives strict
//! priority dispatch with FIFO inside each level. A fixed pool of
//! workers pops the heap, runs each task inside its timeout scope, and
//! drives the retry ladder: failed attempts re-enqueue after an
//! exponential backoff until the retry budget is spent. Retried tasks
//! re-enter the heap only when their delay elapses, so the head of the
//! heap is always dispatchable.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cancel::{CancelSource, CancelToken};
use crate::error::{AtlasError, Result};
use crate::scheduler::status::StatusManager;

/// Task priority; smaller is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Urgent = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

/// The work a task performs. Receives the task's cancellation token
/// and returns an opaque JSON result.
pub type TaskFn =
    Arc<dyn Fn(CancelToken) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static>;

/// Submission parameters for one task.
#[derive(Clone)]
pub struct TaskSpec {
    pub name: String,
    pub priority: TaskPriority,
    pub max_retries: u32,
    pub timeout: Option<Duration>,
    pub func: TaskFn,
}

impl TaskSpec {
    pub fn new(
        name: impl Into<String>,
        priority: TaskPriority,
        func: TaskFn,
    ) -> Self {
        Self {
            name: name.into(),
            priority,
            max_retries: 3,
            timeout: None,
            func,
        }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

fn default_workers() -> usize {
    4
}
fn default_retry_base_ms() -> u64 {
    500
}

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// `None` = unbounded; `Some(n)` rejects submissions past `n`
    /// pending tasks with `Backpressure`.
    #[serde(default)]
    pub capacity: Option<usize>,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            capacity: None,
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

/// One entry in the heap.
struct QueuedTask {
    id: Uuid,
    spec: TaskSpec,
    /// Executions already performed (0 on first enqueue).
    attempts: u32,
    seq: u64,
}

impl QueuedTask {
    fn key(&self) -> (TaskPriority, u64) {
        (self.spec.priority, self.seq)
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for QueuedTask {}
impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

/// Snapshot of queue occupancy.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub running: usize,
    pub draining: bool,
    pub pending_by_priority: HashMap<TaskPriority, usize>,
}

struct QueueState {
    heap: BinaryHeap<Reverse<QueuedTask>>,
    next_seq: u64,
    draining: bool,
}

struct QueueInner {
    config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    status: Arc<StatusManager>,
    /// Cancel sources for running tasks.
    running_cancels: Mutex<HashMap<Uuid, CancelSource>>,
    /// Pending tasks cancelled before dispatch.
    cancelled_pending: Mutex<HashSet<Uuid>>,
    running: AtomicUsize,
}

/// The queue handle; cheap to clone.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TaskQueue {
    pub fn new(config: QueueConfig, status: Arc<StatusManager>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                state: Mutex::new(QueueState {
                    heap: BinaryHeap::new(),
                    next_seq: 0,
                    draining: false,
                }),
                notify: Notify::new(),
                status,
                running_cancels: Mutex::new(HashMap::new()),
                cancelled_pending: Mutex::new(HashSet::new()),
                running: AtomicUsize::new(0),
            }),
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawn the worker pool.
    pub fn start(&self) {
        let mut workers = self.workers.lock().expect("workers poisoned");
        if !workers.is_empty() {
            return;
        }
        for index in 0..self.inner.config.workers {
            let inner = self.inner.clone();
            workers.push(tokio::spawn(worker_loop(inner, index)));
        }
        info!(workers = self.inner.config.workers, "task queue started");
    }

    /// Submit a task. Never blocks; a bounded queue at capacity fails
    /// with `Backpressure`, a draining queue rejects outright.
    pub fn submit(&self, spec: TaskSpec) -> Result<Uuid> {
        let id = Uuid::new_v4();
        {
            let mut state = self.inner.state.lock().expect("queue state poisoned");
            if state.draining {
                return Err(AtlasError::Task("queue is draining".into()));
            }
            if let Some(capacity) = self.inner.config.capacity {
                if state.heap.len() >= capacity {
                    return Err(AtlasError::Backpressure(capacity));
                }
            }
            self.inner
                .status
                .create(id, &spec.name, spec.priority, spec.max_retries);
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Reverse(QueuedTask {
                id,
                spec,
                attempts: 0,
                seq,
            }));
        }
        self.inner.notify.notify_one();
        Ok(id)
    }

    /// Cancel a task: pending tasks leave the queue, running tasks get
    /// their token signalled. Returns whether anything was cancelled.
    pub fn cancel(&self, id: Uuid) -> bool {
        {
            let state = self.inner.state.lock().expect("queue state poisoned");
            let is_pending = state.heap.iter().any(|Reverse(t)| t.id == id);
            if is_pending {
                self.inner
                    .cancelled_pending
                    .lock()
                    .expect("cancel set poisoned")
                    .insert(id);
                return true;
            }
        }
        let cancels = self.inner.running_cancels.lock().expect("cancels poisoned");
        if let Some(source) = cancels.get(&id) {
            source.cancel();
            return true;
        }
        false
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.inner.state.lock().expect("queue state poisoned");
        let mut by_priority: HashMap<TaskPriority, usize> = HashMap::new();
        for Reverse(task) in state.heap.iter() {
            *by_priority.entry(task.spec.priority).or_insert(0) += 1;
        }
        QueueStatus {
            pending: state.heap.len(),
            running: self.inner.running.load(Ordering::SeqCst),
            draining: state.draining,
            pending_by_priority: by_priority,
        }
    }

    /// Drain: stop admissions, let running tasks finish until the
    /// deadline, then cancel the rest and the pending backlog.
    pub async fn shutdown(&self, deadline: Duration) {
        {
            let mut state = self.inner.state.lock().expect("queue state poisoned");
            state.draining = true;
        }
        self.inner.notify.notify_waiters();

        let drained = tokio::time::timeout(deadline, async {
            while self.inner.running.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        if drained.is_err() {
            warn!("shutdown deadline reached, cancelling in-flight tasks");
            let cancels = self.inner.running_cancels.lock().expect("cancels poisoned");
            for source in cancels.values() {
                source.cancel();
            }
        }

        // Pending tasks are cancelled rather than lost silently.
        let remaining: Vec<QueuedTask> = {
            let mut state = self.inner.state.lock().expect("queue state poisoned");
            state.heap.drain().map(|Reverse(t)| t).collect()
        };
        for task in remaining {
            self.inner.status.cancel(task.id);
        }

        self.inner.notify.notify_waiters();
        let workers: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("workers poisoned");
            workers.drain(..).collect()
        };
        for worker in workers {
            let _ = tokio::time::timeout(Duration::from_secs(1), worker).await;
        }
        info!("task queue stopped");
    }
}

async fn worker_loop(inner: Arc<QueueInner>, index: usize) {
    debug!(worker = index, "worker started");
    loop {
        let task = {
            let mut state = inner.state.lock().expect("queue state poisoned");
            if state.draining && state.heap.is_empty() {
                break;
            }
            state.heap.pop().map(|Reverse(t)| t)
        };

        let Some(task) = task else {
            // Timed wait so a drain signal is never missed.
            tokio::select! {
                _ = inner.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
            continue;
        };

        // Pre-dispatch cancellation: the heap pop is the removal.
        let was_cancelled = inner
            .cancelled_pending
            .lock()
            .expect("cancel set poisoned")
            .remove(&task.id);
        if was_cancelled {
            inner.status.cancel(task.id);
            continue;
        }

        execute_task(&inner, task).await;
    }
    debug!(worker = index, "worker stopped");
}

async fn execute_task(inner: &Arc<QueueInner>, mut task: QueuedTask) {
    let id = task.id;
    task.attempts += 1;
    let attempt = task.attempts;

    inner.running.fetch_add(1, Ordering::SeqCst);
    inner.status.start(id);

    let source = CancelSource::new();
    let token = source.token();
    inner
        .running_cancels
        .lock()
        .expect("cancels poisoned")
        .insert(id, source);

    // The task future runs in its own tokio task so a panic surfaces
    // as a JoinError instead of taking the worker down.
    let future = (task.spec.func)(token.clone());
    let mut handle = tokio::spawn(future);

    enum Outcome {
        Done(Result<Value>),
        Panicked,
        TimedOut,
        Cancelled,
    }

    let outcome = match task.spec.timeout {
        Some(timeout) => {
            tokio::select! {
                joined = &mut handle => match joined {
                    Ok(result) => Outcome::Done(result),
                    Err(_) => Outcome::Panicked,
                },
                _ = tokio::time::sleep(timeout) => {
                    handle.abort();
                    Outcome::TimedOut
                }
                _ = token.cancelled() => {
                    // Give the task a moment to honor the token, then
                    // force it down.
                    match tokio::time::timeout(Duration::from_millis(250), &mut handle).await {
                        Ok(Ok(result)) => Outcome::Done(result),
                        _ => {
                            handle.abort();
                            Outcome::Cancelled
                        }
                    }
                }
            }
        }
        None => {
            tokio::select! {
                joined = &mut handle => match joined {
                    Ok(result) => Outcome::Done(result),
                    Err(_) => Outcome::Panicked,
                },
                _ = token.cancelled() => {
                    match tokio::time::timeout(Duration::from_millis(250), &mut handle).await {
                        Ok(Ok(result)) => Outcome::Done(result),
                        _ => {
                            handle.abort();
                            Outcome::Cancelled
                        }
                    }
                }
            }
        }
    };

    inner
        .running_cancels
        .lock()
        .expect("cancels poisoned")
        .remove(&id);

    match outcome {
        Outcome::Done(Ok(value)) => {
            inner.status.complete(id, value);
        }
        Outcome::Done(Err(AtlasError::Cancelled)) | Outcome::Cancelled => {
            inner.status.cancel(id);
        }
        Outcome::Done(Err(err)) => {
            retry_or_fail(inner, task, attempt, &err.to_string(), false).await;
        }
        Outcome::Panicked => {
            error!(%id, "task panicked");
            retry_or_fail(inner, task, attempt, "worker_crash", false).await;
        }
        Outcome::TimedOut => {
            retry_or_fail(inner, task, attempt, "deadline exceeded", true).await;
        }
    }

    inner.running.fetch_sub(1, Ordering::SeqCst);
}

/// Re-enqueue with backoff while the retry budget lasts, otherwise
/// settle the terminal state.
async fn retry_or_fail(
    inner: &Arc<QueueInner>,
    task: QueuedTask,
    attempt: u32,
    reason: &str,
    timed_out: bool,
) {
    let id = task.id;
    if attempt <= task.spec.max_retries {
        let base = inner.config.retry_base_ms as f64;
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = Duration::from_millis((base * 2f64.powi(attempt as i32) * jitter) as u64);
        warn!(%id, attempt, reason, delay_ms = delay.as_millis() as u64, "task retrying");
        inner.status.retrying(id);

        // The delayed task re-enters the heap only when due; otherwise
        // a delayed head would stall higher-seq work.
        let inner = inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = inner.state.lock().expect("queue state poisoned");
            if state.draining {
                drop(state);
                inner.status.cancel(id);
                return;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Reverse(QueuedTask { seq, ..task }));
            drop(state);
            inner.notify.notify_one();
        });
    } else if timed_out {
        inner.status.timeout(id);
    } else {
        inner.status.fail(id, reason);
    }
}
