//! Task scheduling: the priority queue and worker pool, cron dispatch,
//! and durable status tracking.

pub mod cron;
pub mod queue;
pub mod status;

pub use cron::{CronExpression, CronScheduler};
pub use queue::{QueueConfig, TaskFn, TaskPriority, TaskQueue, TaskSpec};
pub use status::{StatusManager, TaskRecord, TaskState};
