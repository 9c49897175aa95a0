//! Narrow persistence interface.
//!
//! The core stores sources, documents, and task records through this
//! trait and nothing else; transactional semantics are the backend's
//! concern. Two backends ship: SQLite for real runs and an in-memory
//! map for tests.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{ProcessedDocument, RawDocument, SourceConfig, SourceType};
use crate::scheduler::status::TaskRecord;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// Filter for source listings.
#[derive(Debug, Clone, Default)]
pub struct SourceFilter {
    pub enabled: Option<bool>,
    pub source_type: Option<SourceType>,
    pub category: Option<String>,
}

impl SourceFilter {
    pub fn matches(&self, source: &SourceConfig) -> bool {
        if let Some(enabled) = self.enabled {
            if source.enabled != enabled {
                return false;
            }
        }
        if let Some(ty) = self.source_type {
            if source.source_type != ty {
                return false;
            }
        }
        if let Some(category) = &self.category {
            if source.category.as_deref() != Some(category.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Persistence operations consumed by the core.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn put_source(&self, source: &SourceConfig) -> Result<()>;
    async fn list_sources(&self, filter: &SourceFilter) -> Result<Vec<SourceConfig>>;

    async fn put_raw(&self, doc: &RawDocument) -> Result<()>;
    async fn get_raw(&self, id: Uuid) -> Result<Option<RawDocument>>;
    /// Raw documents for a source inside `[since, until)`, ordered by
    /// collection time.
    async fn iter_raw(
        &self,
        source_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawDocument>>;

    async fn put_processed(&self, doc: &ProcessedDocument) -> Result<()>;
    /// Every processed document assigned to a similarity group.
    async fn iter_group(&self, group_id: Uuid) -> Result<Vec<ProcessedDocument>>;
    /// All processed documents, oldest first. Used to warm the
    /// deduplication index at startup.
    async fn list_processed(&self) -> Result<Vec<ProcessedDocument>>;

    async fn put_task_status(&self, record: &TaskRecord) -> Result<()>;
    async fn get_task_status(&self, id: Uuid) -> Result<Option<TaskRecord>>;
}
