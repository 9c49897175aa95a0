//! Priority queue dedicated to LLM work.
//!
//! Same heap discipline as the general task queue, but the concurrency
//! budget is owned by the adaptive controller and can change at any
//! moment: zero means the circuit is open and submissions are rejected.
//! Results of identical submissions are served from a TTL cache keyed
//! by `(task_type, hash(payload))`; tasks that miss their deadline are
//! settled as timed out without ever being dispatched.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::{CancelSource, CancelToken};
use crate::error::{AtlasError, Result};
use crate::llm::client::{GenerateParams, LlmClient};
use crate::processors::dedup::cosine_similarity;
use crate::scheduler::queue::TaskPriority;

/// Kinds of LLM work the queue interprets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmTaskType {
    Generate,
    Embed,
    SemanticDedup,
    BatchProcess,
}

impl LlmTaskType {
    fn as_str(&self) -> &'static str {
        match self {
            LlmTaskType::Generate => "generate",
            LlmTaskType::Embed => "embed",
            LlmTaskType::SemanticDedup => "semantic_dedup",
            LlmTaskType::BatchProcess => "batch_process",
        }
    }
}

/// One submission.
#[derive(Debug, Clone)]
pub struct LlmTask {
    pub task_type: LlmTaskType,
    pub priority: TaskPriority,
    pub payload: Value,
    /// Tasks past their deadline are not dispatched.
    pub deadline: Option<Instant>,
}

impl LlmTask {
    pub fn new(task_type: LlmTaskType, priority: TaskPriority, payload: Value) -> Self {
        Self {
            task_type,
            priority,
            payload,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Cache key: task type plus payload digest.
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.payload.to_string().as_bytes());
        format!("{}:{:x}", self.task_type.as_str(), hasher.finalize())
    }
}

/// Handle to a submitted task's eventual result.
pub enum LlmTicket {
    /// Served from the result cache.
    Ready(Value),
    Pending(oneshot::Receiver<Result<Value>>),
}

impl LlmTicket {
    pub async fn result(self) -> Result<Value> {
        match self {
            LlmTicket::Ready(value) => Ok(value),
            LlmTicket::Pending(rx) => rx
                .await
                .map_err(|_| AtlasError::Llm {
                    kind: crate::error::LlmErrorKind::Connection,
                    message: "queue dropped the task".into(),
                })?,
        }
    }

    pub fn from_cache(&self) -> bool {
        matches!(self, LlmTicket::Ready(_))
    }
}

struct Entry {
    id: Uuid,
    task: LlmTask,
    seq: u64,
    tx: oneshot::Sender<Result<Value>>,
}

impl Entry {
    fn key(&self) -> (TaskPriority, u64) {
        (self.task.priority, self.seq)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

struct CachedResult {
    value: Value,
    stored_at: Instant,
}

struct QueueState {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
    concurrency: usize,
}

struct QueueInner {
    client: Arc<LlmClient>,
    state: Mutex<QueueState>,
    cache: Mutex<HashMap<String, CachedResult>>,
    cache_ttl: Duration,
    notify: Notify,
    running: AtomicUsize,
    inflight: Mutex<HashMap<Uuid, CancelSource>>,
}

/// The LLM queue handle; cheap to clone.
#[derive(Clone)]
pub struct LlmQueue {
    inner: Arc<QueueInner>,
}

impl LlmQueue {
    pub fn new(client: Arc<LlmClient>, initial_concurrency: usize, cache_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                client,
                state: Mutex::new(QueueState {
                    heap: BinaryHeap::new(),
                    next_seq: 0,
                    concurrency: initial_concurrency,
                }),
                cache: Mutex::new(HashMap::new()),
                cache_ttl,
                notify: Notify::new(),
                running: AtomicUsize::new(0),
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Submit a task. Cache hits resolve immediately; a zeroed
    /// concurrency rejects with `CircuitOpen`.
    pub fn submit(&self, task: LlmTask) -> Result<LlmTicket> {
        {
            let state = self.inner.state.lock().expect("llm queue poisoned");
            if state.concurrency == 0 {
                return Err(AtlasError::CircuitOpen);
            }
        }

        let key = task.cache_key();
        {
            let cache = self.inner.cache.lock().expect("llm cache poisoned");
            if let Some(cached) = cache.get(&key) {
                if cached.stored_at.elapsed() < self.inner.cache_ttl {
                    debug!(key, "llm result served from cache");
                    return Ok(LlmTicket::Ready(cached.value.clone()));
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock().expect("llm queue poisoned");
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Reverse(Entry {
                id: Uuid::new_v4(),
                task,
                seq,
                tx,
            }));
        }
        self.inner.notify.notify_one();
        Ok(LlmTicket::Pending(rx))
    }

    /// Replace the concurrency budget. Zero halts dispatch and makes
    /// `submit` reject; raising it resumes dispatch.
    pub fn set_concurrency(&self, concurrency: usize) {
        {
            let mut state = self.inner.state.lock().expect("llm queue poisoned");
            if state.concurrency != concurrency {
                info!(from = state.concurrency, to = concurrency, "llm concurrency changed");
            }
            state.concurrency = concurrency;
        }
        self.inner.notify.notify_waiters();
    }

    pub fn concurrency(&self) -> usize {
        self.inner.state.lock().expect("llm queue poisoned").concurrency
    }

    /// Pending tasks not yet dispatched.
    pub fn depth(&self) -> usize {
        self.inner.state.lock().expect("llm queue poisoned").heap.len()
    }

    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Cancel every in-flight task (emergency stop).
    pub fn cancel_inflight(&self) {
        let inflight = self.inner.inflight.lock().expect("inflight poisoned");
        for source in inflight.values() {
            source.cancel();
        }
        if !inflight.is_empty() {
            warn!(count = inflight.len(), "in-flight llm tasks cancelled");
        }
    }

    /// Drop expired cache entries; returns how many were removed.
    pub fn sweep_cache(&self) -> usize {
        let mut cache = self.inner.cache.lock().expect("llm cache poisoned");
        let ttl = self.inner.cache_ttl;
        let before = cache.len();
        cache.retain(|_, cached| cached.stored_at.elapsed() < ttl);
        before - cache.len()
    }

    /// Dispatcher loop; run as a background task until cancelled.
    pub async fn run(&self, cancel: CancelToken) {
        info!("llm queue dispatcher started");
        loop {
            let entry = {
                let mut state = self.inner.state.lock().expect("llm queue poisoned");
                let slot_free = state.concurrency > self.inner.running.load(Ordering::SeqCst)
                    && state.concurrency > 0;
                if slot_free {
                    state.heap.pop().map(|Reverse(e)| e)
                } else {
                    None
                }
            };

            let Some(entry) = entry else {
                tokio::select! {
                    _ = self.inner.notify.notified() => continue,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => continue,
                    _ = cancel.cancelled() => break,
                }
            };

            // Late tasks are settled, never dispatched.
            if let Some(deadline) = entry.task.deadline {
                if Instant::now() >= deadline {
                    let _ = entry.tx.send(Err(AtlasError::Timeout(Duration::ZERO)));
                    continue;
                }
            }

            self.dispatch(entry);
        }
        info!("llm queue dispatcher stopped");
    }

    fn dispatch(&self, entry: Entry) {
        let inner = self.inner.clone();
        inner.running.fetch_add(1, Ordering::SeqCst);

        let source = CancelSource::new();
        let token = source.token();
        inner
            .inflight
            .lock()
            .expect("inflight poisoned")
            .insert(entry.id, source);

        tokio::spawn(async move {
            let key = entry.task.cache_key();
            let result = tokio::select! {
                result = execute(&inner.client, &entry.task) => result,
                _ = token.cancelled() => Err(AtlasError::Cancelled),
            };

            if let Ok(value) = &result {
                let mut cache = inner.cache.lock().expect("llm cache poisoned");
                cache.insert(
                    key,
                    CachedResult {
                        value: value.clone(),
                        stored_at: Instant::now(),
                    },
                );
            }

            inner.inflight.lock().expect("inflight poisoned").remove(&entry.id);
            inner.running.fetch_sub(1, Ordering::SeqCst);
            inner.notify.notify_one();
            let _ = entry.tx.send(result);
        });
    }
}

/// Interpret a task against the client.
async fn execute(client: &LlmClient, task: &LlmTask) -> Result<Value> {
    match task.task_type {
        LlmTaskType::Generate => {
            let prompt = payload_str(&task.payload, "prompt")?;
            let params = GenerateParams {
                max_tokens: task.payload.get("max_tokens").and_then(Value::as_u64).map(|v| v as u32),
                temperature: task
                    .payload
                    .get("temperature")
                    .and_then(Value::as_f64)
                    .map(|v| v as f32),
            };
            let completion = client.generate(prompt, &params).await?;
            Ok(json!({ "text": completion.text, "model": completion.model }))
        }
        LlmTaskType::Embed => {
            let texts: Vec<String> = match task.payload.get("texts") {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect(),
                _ => vec![payload_str(&task.payload, "text")?.to_string()],
            };
            let vectors = client.embed(&texts).await?;
            Ok(json!({ "embeddings": vectors }))
        }
        LlmTaskType::SemanticDedup => {
            let left = payload_str(&task.payload, "left")?.to_string();
            let right = payload_str(&task.payload, "right")?.to_string();
            let vectors = client.embed(&[left, right]).await?;
            let similarity = cosine_similarity(&vectors[0], &vectors[1]);
            Ok(json!({ "similarity": similarity }))
        }
        LlmTaskType::BatchProcess => {
            let prompts: Vec<String> = task
                .payload
                .get("prompts")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            let mut completions = Vec::with_capacity(prompts.len());
            for prompt in &prompts {
                let completion = client.generate(prompt, &GenerateParams::default()).await?;
                completions.push(completion.text);
            }
            Ok(json!({ "completions": completions }))
        }
    }
}

fn payload_str<'a>(payload: &'a Value, field: &str) -> Result<&'a str> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| AtlasError::Llm {
            kind: crate::error::LlmErrorKind::Protocol,
            message: format!("payload missing '{field}'"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::LlmConfig;

    fn unreachable_client() -> Arc<LlmClient> {
        Arc::new(
            LlmClient::new(LlmConfig {
                endpoint: "http://127.0.0.1:9".to_string(),
                connect_retries: 0,
                request_timeout_secs: 2,
                ..LlmConfig::default()
            })
            .unwrap(),
        )
    }

    fn generate_task(prompt: &str) -> LlmTask {
        LlmTask::new(
            LlmTaskType::Generate,
            TaskPriority::Normal,
            json!({ "prompt": prompt }),
        )
    }

    #[test]
    fn test_cache_key_depends_on_type_and_payload() {
        let a = generate_task("hello").cache_key();
        let b = generate_task("other").cache_key();
        let c = LlmTask::new(
            LlmTaskType::Embed,
            TaskPriority::Normal,
            json!({ "prompt": "hello" }),
        )
        .cache_key();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, generate_task("hello").cache_key());
    }

    #[tokio::test]
    async fn test_zero_concurrency_rejects_with_circuit_open() {
        let queue = LlmQueue::new(unreachable_client(), 0, Duration::from_secs(60));
        let result = queue.submit(generate_task("hello"));
        assert!(matches!(result, Err(AtlasError::CircuitOpen)));
    }

    #[tokio::test]
    async fn test_cached_result_short_circuits() {
        let queue = LlmQueue::new(unreachable_client(), 2, Duration::from_secs(60));
        let task = generate_task("cached");
        {
            let mut cache = queue.inner.cache.lock().unwrap();
            cache.insert(
                task.cache_key(),
                CachedResult {
                    value: json!({ "text": "from cache" }),
                    stored_at: Instant::now(),
                },
            );
        }
        let ticket = queue.submit(task).unwrap();
        assert!(ticket.from_cache());
        let value = ticket.result().await.unwrap();
        assert_eq!(value["text"], "from cache");
    }

    #[tokio::test]
    async fn test_expired_cache_entry_not_served() {
        let queue = LlmQueue::new(unreachable_client(), 2, Duration::ZERO);
        let task = generate_task("stale");
        {
            let mut cache = queue.inner.cache.lock().unwrap();
            cache.insert(
                task.cache_key(),
                CachedResult {
                    value: json!({ "text": "stale" }),
                    stored_at: Instant::now(),
                },
            );
        }
        let ticket = queue.submit(task).unwrap();
        assert!(!ticket.from_cache());
        assert_eq!(queue.sweep_cache(), 1);
    }

    #[tokio::test]
    async fn test_late_task_not_dispatched() {
        let queue = LlmQueue::new(unreachable_client(), 2, Duration::from_secs(60));
        let cancel = CancelToken::never();
        let runner = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.run(cancel).await })
        };

        let task = generate_task("late").with_deadline(Instant::now() - Duration::from_secs(1));
        let ticket = queue.submit(task).unwrap();
        let result = ticket.result().await;
        assert!(matches!(result, Err(AtlasError::Timeout(_))));
        runner.abort();
    }

    #[tokio::test]
    async fn test_connection_failure_surfaces() {
        let queue = LlmQueue::new(unreachable_client(), 2, Duration::from_secs(60));
        let cancel = CancelToken::never();
        let runner = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.run(cancel).await })
        };

        let ticket = queue.submit(generate_task("unreachable")).unwrap();
        let result = ticket.result().await;
        assert!(matches!(result, Err(AtlasError::Llm { .. })));
        runner.abort();
    }
}
