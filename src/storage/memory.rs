//! In-memory storage backend for tests and ephemeral runs.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{SourceFilter, Storage};
use crate::error::Result;
use crate::models::{ProcessedDocument, RawDocument, SourceConfig};
use crate::scheduler::status::TaskRecord;

#[derive(Default)]
struct Maps {
    sources: HashMap<String, SourceConfig>,
    raw: HashMap<Uuid, RawDocument>,
    processed: Vec<ProcessedDocument>,
    tasks: HashMap<Uuid, TaskRecord>,
}

/// Map-backed storage; everything is lost on drop.
#[derive(Default)]
pub struct MemoryStorage {
    maps: RwLock<Maps>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put_source(&self, source: &SourceConfig) -> Result<()> {
        let mut maps = self.maps.write().expect("storage poisoned");
        maps.sources.insert(source.name.clone(), source.clone());
        Ok(())
    }

    async fn list_sources(&self, filter: &SourceFilter) -> Result<Vec<SourceConfig>> {
        let maps = self.maps.read().expect("storage poisoned");
        let mut sources: Vec<SourceConfig> = maps
            .sources
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sources)
    }

    async fn put_raw(&self, doc: &RawDocument) -> Result<()> {
        let mut maps = self.maps.write().expect("storage poisoned");
        // Raw content is immutable once stored; later writes only
        // update processing bookkeeping.
        maps.raw.insert(doc.id, doc.clone());
        Ok(())
    }

    async fn get_raw(&self, id: Uuid) -> Result<Option<RawDocument>> {
        let maps = self.maps.read().expect("storage poisoned");
        Ok(maps.raw.get(&id).cloned())
    }

    async fn iter_raw(
        &self,
        source_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawDocument>> {
        let maps = self.maps.read().expect("storage poisoned");
        let mut docs: Vec<RawDocument> = maps
            .raw
            .values()
            .filter(|d| d.source_id == source_id)
            .filter(|d| since.map(|s| d.collected_at >= s).unwrap_or(true))
            .filter(|d| until.map(|u| d.collected_at < u).unwrap_or(true))
            .cloned()
            .collect();
        docs.sort_by_key(|d| d.collected_at);
        Ok(docs)
    }

    async fn put_processed(&self, doc: &ProcessedDocument) -> Result<()> {
        let mut maps = self.maps.write().expect("storage poisoned");
        match maps.processed.iter_mut().find(|d| d.id == doc.id) {
            Some(existing) => *existing = doc.clone(),
            None => maps.processed.push(doc.clone()),
        }
        Ok(())
    }

    async fn iter_group(&self, group_id: Uuid) -> Result<Vec<ProcessedDocument>> {
        let maps = self.maps.read().expect("storage poisoned");
        Ok(maps
            .processed
            .iter()
            .filter(|d| d.similarity_group_id == Some(group_id))
            .cloned()
            .collect())
    }

    async fn list_processed(&self) -> Result<Vec<ProcessedDocument>> {
        let maps = self.maps.read().expect("storage poisoned");
        let mut docs = maps.processed.clone();
        docs.sort_by_key(|d| d.processed_at);
        Ok(docs)
    }

    async fn put_task_status(&self, record: &TaskRecord) -> Result<()> {
        let mut maps = self.maps.write().expect("storage poisoned");
        maps.tasks.insert(record.task_id, record.clone());
        Ok(())
    }

    async fn get_task_status(&self, id: Uuid) -> Result<Option<TaskRecord>> {
        let maps = self.maps.read().expect("storage poisoned");
        Ok(maps.tasks.get(&id).cloned())
    }
}
