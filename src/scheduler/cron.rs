//! Cron expression parsing and job dispatch.
//!
//! The dialect is strict five-field cron (`minute hour day-of-month
//! month day-of-week`) with `*`, `*/N`, `A-B`, `A,B,C`, ranges with
//! steps, and the named aliases `@yearly @annually @monthly @weekly
//! @daily @hourly`. `@every` is not part of the dialect and is
//! rejected. Next-fire computation is a pure function of the
//! expression and the reference instant, always in UTC.
//!
//! The scheduler loop sleeps to the earliest `next_run_at`, fires every
//! due job at most once per wakeup (missed instants during a long sleep
//! are not replayed), and submits work to the task queue.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::error::{AtlasError, Result};
use crate::scheduler::queue::{TaskFn, TaskPriority, TaskQueue, TaskSpec};

/// Parsed five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    original: String,
    minutes: HashSet<u32>,
    hours: HashSet<u32>,
    days: HashSet<u32>,
    months: HashSet<u32>,
    weekdays: HashSet<u32>,
}

const ALIASES: &[(&str, &str)] = &[
    ("@yearly", "0 0 1 1 *"),
    ("@annually", "0 0 1 1 *"),
    ("@monthly", "0 0 1 * *"),
    ("@weekly", "0 0 * * 0"),
    ("@daily", "0 0 * * *"),
    ("@hourly", "0 * * * *"),
];

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self> {
        let original = expression.trim().to_string();
        let expanded = ALIASES
            .iter()
            .find(|(alias, _)| *alias == original)
            .map(|(_, exp)| exp.to_string())
            .unwrap_or_else(|| original.clone());

        if expanded.starts_with('@') {
            return Err(AtlasError::cron(&original, "unsupported alias"));
        }

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(AtlasError::cron(
                &original,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }

        Ok(Self {
            minutes: parse_field(fields[0], 0, 59)
                .map_err(|e| AtlasError::cron(&original, format!("minute: {e}")))?,
            hours: parse_field(fields[1], 0, 23)
                .map_err(|e| AtlasError::cron(&original, format!("hour: {e}")))?,
            days: parse_field(fields[2], 1, 31)
                .map_err(|e| AtlasError::cron(&original, format!("day: {e}")))?,
            months: parse_field(fields[3], 1, 12)
                .map_err(|e| AtlasError::cron(&original, format!("month: {e}")))?,
            weekdays: parse_field(fields[4], 0, 6)
                .map_err(|e| AtlasError::cron(&original, format!("weekday: {e}")))?,
            original,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.original
    }

    fn matches(&self, t: DateTime<Utc>) -> bool {
        self.minutes.contains(&t.minute())
            && self.hours.contains(&t.hour())
            && self.days.contains(&t.day())
            && self.months.contains(&t.month())
            // chrono: Sunday = 0 via num_days_from_sunday.
            && self.weekdays.contains(&t.weekday().num_days_from_sunday())
    }

    /// Smallest future instant matching the expression, at minute
    /// granularity. Sub-minute remainders of `after` round up to the
    /// next minute boundary.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = Utc
            .with_ymd_and_hms(
                after.year(),
                after.month(),
                after.day(),
                after.hour(),
                after.minute(),
                0,
            )
            .single()?
            + ChronoDuration::minutes(1);

        // One year of minutes bounds the search for any satisfiable
        // expression; unsatisfiable ones (e.g. Feb 30) come back None.
        for _ in 0..(366 * 24 * 60) {
            if self.matches(t) {
                return Some(t);
            }
            t += ChronoDuration::minutes(1);
        }
        None
    }
}

/// Parse one field into its allowed value set.
fn parse_field(field: &str, min: u32, max: u32) -> std::result::Result<HashSet<u32>, String> {
    let mut values = HashSet::new();

    for part in field.split(',') {
        if part.is_empty() {
            return Err(format!("empty list element in '{field}'"));
        }

        let (base, step) = match part.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step in '{part}'"))?;
                if step == 0 {
                    return Err(format!("zero step in '{part}'"));
                }
                (base, step)
            }
            None => (part, 1),
        };

        let (start, end) = if base == "*" {
            (min, max)
        } else if let Some((lo, hi)) = base.split_once('-') {
            let lo: u32 = lo.parse().map_err(|_| format!("invalid range in '{part}'"))?;
            let hi: u32 = hi.parse().map_err(|_| format!("invalid range in '{part}'"))?;
            if lo > hi {
                return Err(format!("inverted range in '{part}'"));
            }
            (lo, hi)
        } else {
            let value: u32 = base
                .parse()
                .map_err(|_| format!("invalid value in '{part}'"))?;
            (value, value)
        };

        if start < min || end > max {
            return Err(format!("value out of range [{min}, {max}] in '{part}'"));
        }

        let mut v = start;
        while v <= end {
            values.insert(v);
            v += step;
        }
    }

    Ok(values)
}

/// A registered cron job.
pub struct CronJob {
    pub name: String,
    pub expression: CronExpression,
    pub enabled: bool,
    pub priority: TaskPriority,
    pub max_retries: u32,
    pub timeout: Option<Duration>,
    /// The registered action, already wrapped to feed the outcome
    /// counters below.
    pub func: TaskFn,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_count: u64,
    success_count: Arc<std::sync::atomic::AtomicU64>,
    failure_count: Arc<std::sync::atomic::AtomicU64>,
    /// Registration order; ties on due time fire in this order.
    registration: u64,
}

/// Serializable job metadata for `cron_jobs.json`. Actions are not
/// persisted; they must be re-registered at startup.
#[derive(Debug, Serialize, Deserialize)]
pub struct CronJobRecord {
    pub name: String,
    pub cron_expression: String,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
}

/// Cron-driven job scheduler feeding the task queue.
pub struct CronScheduler {
    queue: TaskQueue,
    jobs: Arc<Mutex<BTreeMap<String, CronJob>>>,
    registry_file: Option<PathBuf>,
    next_registration: std::sync::atomic::AtomicU64,
}

impl CronScheduler {
    pub fn new(queue: TaskQueue, registry_file: Option<PathBuf>) -> Self {
        Self {
            queue,
            jobs: Arc::new(Mutex::new(BTreeMap::new())),
            registry_file,
            next_registration: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Register a job. Names are unique; re-registering replaces the
    /// action but keeps nothing else implicit.
    pub async fn add_job(
        &self,
        name: &str,
        expression: &str,
        priority: TaskPriority,
        func: TaskFn,
    ) -> Result<()> {
        use std::sync::atomic::{AtomicU64, Ordering};

        let expression = CronExpression::parse(expression)?;
        let next_run_at = expression.next_fire(Utc::now());
        let registration = self.next_registration.fetch_add(1, Ordering::SeqCst);

        let success_count = Arc::new(AtomicU64::new(0));
        let failure_count = Arc::new(AtomicU64::new(0));

        // The action reports its outcome into the job counters on
        // every execution, including queue-driven retries.
        let wrapped: TaskFn = {
            let success = success_count.clone();
            let failure = failure_count.clone();
            Arc::new(move |cancel| {
                let inner = func.clone();
                let success = success.clone();
                let failure = failure.clone();
                Box::pin(async move {
                    match inner(cancel).await {
                        Ok(value) => {
                            success.fetch_add(1, Ordering::SeqCst);
                            Ok(value)
                        }
                        Err(e) => {
                            failure.fetch_add(1, Ordering::SeqCst);
                            Err(e)
                        }
                    }
                })
            })
        };

        let mut jobs = self.jobs.lock().await;
        jobs.insert(
            name.to_string(),
            CronJob {
                name: name.to_string(),
                expression,
                enabled: true,
                priority,
                max_retries: 3,
                timeout: None,
                func: wrapped,
                last_run_at: None,
                next_run_at,
                run_count: 0,
                success_count,
                failure_count,
                registration,
            },
        );
        info!(job = name, next_run = ?next_run_at, "cron job registered");
        Ok(())
    }

    pub async fn remove_job(&self, name: &str) -> bool {
        self.jobs.lock().await.remove(name).is_some()
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(name) {
            Some(job) => {
                job.enabled = enabled;
                job.next_run_at = if enabled {
                    job.expression.next_fire(Utc::now())
                } else {
                    None
                };
                true
            }
            None => false,
        }
    }

    /// Submit the job's action immediately without touching its
    /// schedule.
    pub async fn run_now(&self, name: &str) -> Result<uuid::Uuid> {
        let jobs = self.jobs.lock().await;
        let job = jobs
            .get(name)
            .ok_or_else(|| AtlasError::Task(format!("unknown cron job '{name}'")))?;
        let mut spec = TaskSpec::new(
            format!("cron:{name}:manual"),
            job.priority,
            job.func.clone(),
        )
        .with_retries(job.max_retries);
        if let Some(timeout) = job.timeout {
            spec = spec.with_timeout(timeout);
        }
        self.queue.submit(spec)
    }

    /// Job metadata snapshot.
    pub async fn records(&self) -> Vec<CronJobRecord> {
        let jobs = self.jobs.lock().await;
        jobs.values()
            .map(|job| CronJobRecord {
                name: job.name.clone(),
                cron_expression: job.expression.as_str().to_string(),
                enabled: job.enabled,
                last_run_at: job.last_run_at,
                next_run_at: job.next_run_at,
                run_count: job.run_count,
                success_count: job.success_count.load(std::sync::atomic::Ordering::SeqCst),
                failure_count: job.failure_count.load(std::sync::atomic::Ordering::SeqCst),
            })
            .collect()
    }

    /// Persist job metadata to the registry file, if configured.
    pub async fn save_registry(&self) -> Result<()> {
        let Some(path) = &self.registry_file else {
            return Ok(());
        };
        let records = self.records().await;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&records)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Scheduler loop: sleep to the earliest due time, fire what is
    /// due, recompute. Runs until cancelled.
    pub async fn run(&self, cancel: CancelToken) {
        info!("cron scheduler started");
        loop {
            let sleep_for = {
                let jobs = self.jobs.lock().await;
                jobs.values()
                    .filter(|j| j.enabled)
                    .filter_map(|j| j.next_run_at)
                    .min()
                    .map(|next| {
                        (next - Utc::now())
                            .to_std()
                            .unwrap_or(Duration::ZERO)
                            // Cap so newly added jobs are noticed.
                            .min(Duration::from_secs(60))
                    })
                    .unwrap_or(Duration::from_secs(60))
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = cancel.cancelled() => break,
            }

            self.fire_due_jobs().await;
        }
        if let Err(e) = self.save_registry().await {
            warn!(error = %e, "cron registry save at shutdown failed");
        }
        info!("cron scheduler stopped");
    }

    /// Fire every enabled job whose `next_run_at` has passed, exactly
    /// once per job regardless of how many instants were slept over,
    /// in registration order for identical due times.
    pub async fn fire_due_jobs(&self) {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;

        let mut due: Vec<&mut CronJob> = jobs
            .values_mut()
            .filter(|job| {
                job.enabled
                    && job
                        .next_run_at
                        .map(|next| next <= now)
                        .unwrap_or(false)
            })
            .collect();
        due.sort_by_key(|job| (job.next_run_at, job.registration));

        for job in due {
            let mut spec = TaskSpec::new(
                format!("cron:{}", job.name),
                job.priority,
                job.func.clone(),
            )
            .with_retries(job.max_retries);
            if let Some(timeout) = job.timeout {
                spec = spec.with_timeout(timeout);
            }

            match self.queue.submit(spec) {
                Ok(task_id) => {
                    job.run_count += 1;
                    job.last_run_at = Some(now);
                    info!(job = %job.name, %task_id, "cron job fired");
                }
                Err(AtlasError::Backpressure(_)) => {
                    // A full queue makes this a missed run, not a retry.
                    job.failure_count
                        .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    warn!(job = %job.name, "cron fire dropped: queue backpressure");
                }
                Err(e) => {
                    job.failure_count
                        .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    error!(job = %job.name, error = %e, "cron fire failed");
                }
            }

            // At-most-once catch-up: the new due time is computed from
            // now, never from the missed instants.
            job.next_run_at = job.expression.next_fire(now);
            if job.next_run_at.is_none() {
                warn!(job = %job.name, "expression has no future instant, disabling");
                job.enabled = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::queue::QueueConfig;
    use crate::scheduler::status::StatusManager;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_parse_every_minute() {
        let expr = CronExpression::parse("* * * * *").unwrap();
        assert_eq!(expr.minutes.len(), 60);
        assert_eq!(expr.hours.len(), 24);
    }

    #[test]
    fn test_parse_fields_and_aliases() {
        let expr = CronExpression::parse("*/15 0 1,15 * 1-5").unwrap();
        assert_eq!(expr.minutes, HashSet::from([0, 15, 30, 45]));
        assert_eq!(expr.hours, HashSet::from([0]));
        assert_eq!(expr.days, HashSet::from([1, 15]));
        assert_eq!(expr.weekdays, HashSet::from([1, 2, 3, 4, 5]));

        let daily = CronExpression::parse("@daily").unwrap();
        assert_eq!(daily.minutes, HashSet::from([0]));
        assert_eq!(daily.hours, HashSet::from([0]));
    }

    #[test]
    fn test_parse_range_with_step() {
        let expr = CronExpression::parse("10-30/10 * * * *").unwrap();
        assert_eq!(expr.minutes, HashSet::from([10, 20, 30]));
    }

    #[test]
    fn test_rejects_bad_expressions() {
        assert!(CronExpression::parse("@every 5m").is_err());
        assert!(CronExpression::parse("* * * *").is_err());
        assert!(CronExpression::parse("61 * * * *").is_err());
        assert!(CronExpression::parse("*/0 * * * *").is_err());
        assert!(CronExpression::parse("5-1 * * * *").is_err());
        assert!(CronExpression::parse("a * * * *").is_err());
    }

    #[test]
    fn test_next_fire_is_pure_and_deterministic() {
        let expr = CronExpression::parse("*/5 * * * *").unwrap();
        let t = at(2026, 3, 1, 10, 2, 30);
        assert_eq!(expr.next_fire(t), expr.next_fire(t));
        assert_eq!(expr.next_fire(t).unwrap(), at(2026, 3, 1, 10, 5, 0));
    }

    #[test]
    fn test_next_fire_rounds_up_sub_minute() {
        let expr = CronExpression::parse("* * * * *").unwrap();
        // Seconds-granularity ties resolve to the next minute boundary.
        assert_eq!(
            expr.next_fire(at(2026, 3, 1, 10, 0, 0)).unwrap(),
            at(2026, 3, 1, 10, 1, 0)
        );
        assert_eq!(
            expr.next_fire(at(2026, 3, 1, 10, 0, 59)).unwrap(),
            at(2026, 3, 1, 10, 1, 0)
        );
    }

    #[test]
    fn test_next_fire_weekday() {
        // 2026-03-01 is a Sunday.
        let expr = CronExpression::parse("0 9 * * 1").unwrap();
        assert_eq!(
            expr.next_fire(at(2026, 3, 1, 0, 0, 0)).unwrap(),
            at(2026, 3, 2, 9, 0, 0)
        );
    }

    #[test]
    fn test_next_fire_minimum_period() {
        let expr = CronExpression::parse("*/10 * * * *").unwrap();
        let first = expr.next_fire(at(2026, 3, 1, 10, 0, 0)).unwrap();
        let second = expr.next_fire(first).unwrap();
        assert!(second - first >= ChronoDuration::minutes(10));
    }

    #[test]
    fn test_unsatisfiable_expression() {
        let expr = CronExpression::parse("0 0 30 2 *").unwrap();
        assert!(expr.next_fire(at(2026, 1, 1, 0, 0, 0)).is_none());
    }

    fn test_queue() -> (TaskQueue, Arc<StatusManager>) {
        let status = Arc::new(StatusManager::new(None));
        let queue = TaskQueue::new(QueueConfig::default(), status.clone());
        (queue, status)
    }

    fn noop() -> TaskFn {
        Arc::new(|_| Box::pin(async { Ok(serde_json::json!(null)) }))
    }

    #[tokio::test]
    async fn test_catch_up_fires_at_most_once() {
        let (queue, status) = test_queue();
        let scheduler = CronScheduler::new(queue, None);
        scheduler
            .add_job("minutely", "* * * * *", TaskPriority::Normal, noop())
            .await
            .unwrap();

        // Simulate a long sleep: push next_run_at far into the past.
        {
            let mut jobs = scheduler.jobs.lock().await;
            let job = jobs.get_mut("minutely").unwrap();
            job.next_run_at = Some(Utc::now() - ChronoDuration::minutes(4) - ChronoDuration::seconds(30));
        }

        scheduler.fire_due_jobs().await;

        let records = scheduler.records().await;
        assert_eq!(records[0].run_count, 1, "missed instants must not replay");
        assert_eq!(status.all().len(), 1);
        let next = records[0].next_run_at.unwrap();
        assert!(next > Utc::now());
        assert_eq!(next.second(), 0);
    }

    #[tokio::test]
    async fn test_identical_due_times_fire_in_registration_order() {
        let (queue, status) = test_queue();
        let scheduler = CronScheduler::new(queue, None);
        for name in ["first", "second", "third"] {
            scheduler
                .add_job(name, "* * * * *", TaskPriority::Normal, noop())
                .await
                .unwrap();
        }
        let due = Utc::now() - ChronoDuration::seconds(5);
        {
            let mut jobs = scheduler.jobs.lock().await;
            for job in jobs.values_mut() {
                job.next_run_at = Some(due);
            }
        }

        scheduler.fire_due_jobs().await;

        let mut names: Vec<(DateTime<Utc>, String)> = status
            .all()
            .into_iter()
            .map(|r| (r.created_at, r.name))
            .collect();
        names.sort();
        let order: Vec<&str> = names.iter().map(|(_, n)| n.as_str()).collect();
        assert_eq!(order, vec!["cron:first", "cron:second", "cron:third"]);
    }

    #[tokio::test]
    async fn test_run_now_does_not_touch_schedule() {
        let (queue, _status) = test_queue();
        let scheduler = CronScheduler::new(queue, None);
        scheduler
            .add_job("daily", "@daily", TaskPriority::Low, noop())
            .await
            .unwrap();
        let before = scheduler.records().await[0].next_run_at;

        scheduler.run_now("daily").await.unwrap();

        let after = scheduler.records().await;
        assert_eq!(after[0].next_run_at, before);
        assert_eq!(after[0].run_count, 0);
    }

    #[tokio::test]
    async fn test_disabled_jobs_do_not_fire() {
        let (queue, status) = test_queue();
        let scheduler = CronScheduler::new(queue, None);
        scheduler
            .add_job("paused", "* * * * *", TaskPriority::Normal, noop())
            .await
            .unwrap();
        scheduler.set_enabled("paused", false).await;
        {
            let mut jobs = scheduler.jobs.lock().await;
            jobs.get_mut("paused").unwrap().next_run_at =
                Some(Utc::now() - ChronoDuration::minutes(1));
        }

        scheduler.fire_due_jobs().await;
        assert!(status.all().is_empty());
    }

    #[tokio::test]
    async fn test_registry_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cron_jobs.json");
        let (queue, _status) = test_queue();
        let scheduler = CronScheduler::new(queue, Some(path.clone()));
        scheduler
            .add_job("hourly", "@hourly", TaskPriority::Normal, noop())
            .await
            .unwrap();
        scheduler.save_registry().await.unwrap();

        let records: Vec<CronJobRecord> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "hourly");
        assert_eq!(records[0].cron_expression, "@hourly");
    }
}
