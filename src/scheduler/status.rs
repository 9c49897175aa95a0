//! Task lifecycle tracking with a durable JSON snapshot.
//!
//! Every task transition lands here. Terminal transitions and a
//! periodic flush write the full snapshot through a temp file and an
//! atomic rename, so the file on disk is always a complete state. On
//! startup the previous snapshot is loaded and tasks that were running
//! at crash time are folded to `failed`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::queue::TaskPriority;

/// Task lifecycle states. The four terminal states never transition
/// further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    Timeout,
    Retrying,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failed | TaskState::Cancelled | TaskState::Timeout
        )
    }
}

/// Durable record of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub name: String,
    pub state: TaskState,
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_retries: u32,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl TaskRecord {
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }
}

/// Aggregate view over all records.
#[derive(Debug, Clone, Serialize)]
pub struct StatusMetrics {
    pub counts: HashMap<TaskState, usize>,
    /// Successes over terminal outcomes, in percent.
    pub success_rate: f64,
    pub p50_duration_secs: f64,
    pub p95_duration_secs: f64,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    tasks: Vec<TaskRecord>,
}

/// In-memory task map with durable snapshots.
pub struct StatusManager {
    path: Option<PathBuf>,
    tasks: Mutex<HashMap<Uuid, TaskRecord>>,
    pub flush_interval: Duration,
}

impl StatusManager {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            tasks: Mutex::new(HashMap::new()),
            flush_interval: Duration::from_secs(5),
        }
    }

    /// Load the last snapshot; tasks left `running` by a crash become
    /// `failed` with reason `crashed`.
    pub fn load(path: PathBuf) -> Self {
        let mut tasks = HashMap::new();
        match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Snapshot>(&bytes) {
                Ok(snapshot) => {
                    for mut record in snapshot.tasks {
                        if record.state == TaskState::Running
                            || record.state == TaskState::Retrying
                            || record.state == TaskState::Pending
                        {
                            record.state = TaskState::Failed;
                            record.error = Some("crashed".to_string());
                            record.completed_at = Some(Utc::now());
                        }
                        tasks.insert(record.task_id, record);
                    }
                    info!(count = tasks.len(), "status snapshot restored");
                }
                Err(e) => warn!(error = %e, "status snapshot unreadable, starting empty"),
            },
            Err(_) => {}
        }
        Self {
            path: Some(path),
            tasks: Mutex::new(tasks),
            flush_interval: Duration::from_secs(5),
        }
    }

    pub fn create(&self, task_id: Uuid, name: &str, priority: TaskPriority, max_retries: u32) {
        let record = TaskRecord {
            task_id,
            name: name.to_string(),
            state: TaskState::Pending,
            priority,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            attempts: 0,
            max_retries,
            result: None,
            error: None,
        };
        self.tasks
            .lock()
            .expect("status map poisoned")
            .insert(task_id, record);
    }

    /// Transition to running; counts one attempt.
    pub fn start(&self, task_id: Uuid) {
        self.update(task_id, |record| {
            record.state = TaskState::Running;
            record.attempts += 1;
            if record.started_at.is_none() || record.attempts > 1 {
                record.started_at = Some(Utc::now());
            }
        });
    }

    pub fn retrying(&self, task_id: Uuid) {
        self.update(task_id, |record| {
            record.state = TaskState::Retrying;
        });
    }

    pub fn complete(&self, task_id: Uuid, result: Value) {
        self.terminal(task_id, TaskState::Success, Some(result), None);
    }

    pub fn fail(&self, task_id: Uuid, error: &str) {
        self.terminal(task_id, TaskState::Failed, None, Some(error.to_string()));
    }

    pub fn cancel(&self, task_id: Uuid) {
        self.terminal(task_id, TaskState::Cancelled, None, None);
    }

    pub fn timeout(&self, task_id: Uuid) {
        self.terminal(
            task_id,
            TaskState::Timeout,
            None,
            Some("deadline exceeded".to_string()),
        );
    }

    pub fn get(&self, task_id: Uuid) -> Option<TaskRecord> {
        self.tasks
            .lock()
            .expect("status map poisoned")
            .get(&task_id)
            .cloned()
    }

    pub fn all(&self) -> Vec<TaskRecord> {
        self.tasks
            .lock()
            .expect("status map poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Counts by state, success rate, and duration percentiles.
    pub fn metrics(&self) -> StatusMetrics {
        let tasks = self.tasks.lock().expect("status map poisoned");
        let mut counts: HashMap<TaskState, usize> = HashMap::new();
        let mut durations: Vec<f64> = Vec::new();
        let mut successes = 0usize;
        let mut terminal = 0usize;

        for record in tasks.values() {
            *counts.entry(record.state).or_insert(0) += 1;
            if record.state.is_terminal() {
                terminal += 1;
                if record.state == TaskState::Success {
                    successes += 1;
                }
                if let Some(duration) = record.duration() {
                    durations.push(duration.as_secs_f64());
                }
            }
        }

        durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let percentile = |p: f64| -> f64 {
            if durations.is_empty() {
                return 0.0;
            }
            let index = ((durations.len() as f64 - 1.0) * p).round() as usize;
            durations[index]
        };

        StatusMetrics {
            counts,
            success_rate: if terminal > 0 {
                successes as f64 / terminal as f64 * 100.0
            } else {
                0.0
            },
            p50_duration_secs: percentile(0.50),
            p95_duration_secs: percentile(0.95),
        }
    }

    /// Write the snapshot now. Best-effort from the periodic flusher,
    /// checked at shutdown.
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = {
            let tasks = self.tasks.lock().expect("status map poisoned");
            Snapshot {
                tasks: tasks.values().cloned().collect(),
            }
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&snapshot)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Periodic flush loop; run as a background task.
    pub async fn flush_loop(self: std::sync::Arc<Self>, cancel: crate::cancel::CancelToken) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush() {
                        warn!(error = %e, "periodic status flush failed");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    fn update(&self, task_id: Uuid, apply: impl FnOnce(&mut TaskRecord)) {
        let mut tasks = self.tasks.lock().expect("status map poisoned");
        if let Some(record) = tasks.get_mut(&task_id) {
            if record.state.is_terminal() {
                warn!(%task_id, state = ?record.state, "ignored transition on terminal task");
                return;
            }
            apply(record);
        }
    }

    fn terminal(&self, task_id: Uuid, state: TaskState, result: Option<Value>, error: Option<String>) {
        self.update(task_id, |record| {
            record.state = state;
            record.completed_at = Some(Utc::now());
            record.result = result;
            record.error = error;
        });
        // Terminal transitions are durable immediately.
        if let Err(e) = self.flush() {
            warn!(error = %e, "status flush after terminal transition failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager_with_file() -> (StatusManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let manager = StatusManager::new(Some(dir.path().join("task_status.json")));
        (manager, dir)
    }

    #[test]
    fn test_lifecycle_and_timestamps() {
        let (manager, _dir) = manager_with_file();
        let id = Uuid::new_v4();
        manager.create(id, "job", TaskPriority::Normal, 3);
        manager.start(id);
        manager.complete(id, json!({"items": 3}));

        let record = manager.get(id).unwrap();
        assert_eq!(record.state, TaskState::Success);
        assert_eq!(record.attempts, 1);
        assert!(record.started_at.unwrap() >= record.created_at);
        assert!(record.completed_at.unwrap() >= record.started_at.unwrap());
    }

    #[test]
    fn test_terminal_states_frozen() {
        let (manager, _dir) = manager_with_file();
        let id = Uuid::new_v4();
        manager.create(id, "job", TaskPriority::Normal, 0);
        manager.start(id);
        manager.fail(id, "boom");
        manager.complete(id, json!(null));

        let record = manager.get(id).unwrap();
        assert_eq!(record.state, TaskState::Failed);
        assert_eq!(record.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_snapshot_round_trip_marks_running_crashed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task_status.json");

        let manager = StatusManager::new(Some(path.clone()));
        let done = Uuid::new_v4();
        let stuck = Uuid::new_v4();
        manager.create(done, "done", TaskPriority::High, 0);
        manager.start(done);
        manager.complete(done, json!(1));
        manager.create(stuck, "stuck", TaskPriority::Normal, 0);
        manager.start(stuck);
        manager.flush().unwrap();

        let restored = StatusManager::load(path);
        assert_eq!(restored.get(done).unwrap().state, TaskState::Success);
        let crashed = restored.get(stuck).unwrap();
        assert_eq!(crashed.state, TaskState::Failed);
        assert_eq!(crashed.error.as_deref(), Some("crashed"));
    }

    #[test]
    fn test_metrics() {
        let (manager, _dir) = manager_with_file();
        for i in 0..4 {
            let id = Uuid::new_v4();
            manager.create(id, &format!("job{i}"), TaskPriority::Normal, 0);
            manager.start(id);
            if i < 3 {
                manager.complete(id, json!(i));
            } else {
                manager.fail(id, "nope");
            }
        }
        let metrics = manager.metrics();
        assert_eq!(metrics.counts.get(&TaskState::Success), Some(&3));
        assert_eq!(metrics.counts.get(&TaskState::Failed), Some(&1));
        assert!((metrics.success_rate - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_attempts_increment_on_retries() {
        let (manager, _dir) = manager_with_file();
        let id = Uuid::new_v4();
        manager.create(id, "flaky", TaskPriority::Normal, 2);
        manager.start(id);
        manager.retrying(id);
        manager.start(id);
        manager.retrying(id);
        manager.start(id);
        manager.fail(id, "still failing");

        let record = manager.get(id).unwrap();
        assert_eq!(record.attempts, 3);
        assert!(record.attempts <= record.max_retries + 1);
    }
}
