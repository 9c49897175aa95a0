//! SQLite storage backend.
//!
//! One connection behind a mutex, WAL mode, busy timeout. Documents
//! are stored as JSON in a single column with the columns the query
//! paths need (source, timestamps, group) broken out for indexing;
//! `raw_metadata` rides inside the JSON document.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{SourceFilter, Storage};
use crate::error::{AtlasError, Result};
use crate::models::{ProcessedDocument, RawDocument, SourceConfig};
use crate::scheduler::status::TaskRecord;

/// File-backed storage.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(AtlasError::storage)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 30000;
        "#,
        )
        .map_err(AtlasError::storage)?;

        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_tables()?;
        Ok(storage)
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.conn.lock().expect("sqlite poisoned");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sources (
                name TEXT PRIMARY KEY,
                body TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS raw_documents (
                id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                collected_at TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                body TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_raw_source_time
                ON raw_documents(source_id, collected_at);

            CREATE TABLE IF NOT EXISTS processed_documents (
                id TEXT PRIMARY KEY,
                raw_document_id TEXT NOT NULL,
                similarity_group_id TEXT,
                processed_at TEXT NOT NULL,
                body TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_processed_group
                ON processed_documents(similarity_group_id);

            CREATE TABLE IF NOT EXISTS task_records (
                task_id TEXT PRIMARY KEY,
                body TEXT NOT NULL
            );
        "#,
        )
        .map_err(AtlasError::storage)?;
        Ok(())
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn put_source(&self, source: &SourceConfig) -> Result<()> {
        let body = serde_json::to_string(source)?;
        let conn = self.conn.lock().expect("sqlite poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO sources (name, body) VALUES (?, ?)",
            params![source.name, body],
        )
        .map_err(AtlasError::storage)?;
        Ok(())
    }

    async fn list_sources(&self, filter: &SourceFilter) -> Result<Vec<SourceConfig>> {
        let conn = self.conn.lock().expect("sqlite poisoned");
        let mut stmt = conn
            .prepare("SELECT body FROM sources ORDER BY name")
            .map_err(AtlasError::storage)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(AtlasError::storage)?;

        let mut sources = Vec::new();
        for row in rows {
            let body = row.map_err(AtlasError::storage)?;
            let source: SourceConfig = serde_json::from_str(&body)?;
            if filter.matches(&source) {
                sources.push(source);
            }
        }
        Ok(sources)
    }

    async fn put_raw(&self, doc: &RawDocument) -> Result<()> {
        let body = serde_json::to_string(doc)?;
        let conn = self.conn.lock().expect("sqlite poisoned");
        conn.execute(
            r#"INSERT OR REPLACE INTO raw_documents
               (id, source_id, collected_at, content_hash, body)
               VALUES (?, ?, ?, ?, ?)"#,
            params![
                doc.id.to_string(),
                doc.source_id,
                doc.collected_at.to_rfc3339(),
                doc.content_hash,
                body
            ],
        )
        .map_err(AtlasError::storage)?;
        Ok(())
    }

    async fn get_raw(&self, id: Uuid) -> Result<Option<RawDocument>> {
        let conn = self.conn.lock().expect("sqlite poisoned");
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM raw_documents WHERE id = ?",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(AtlasError::storage)?;
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn iter_raw(
        &self,
        source_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawDocument>> {
        let conn = self.conn.lock().expect("sqlite poisoned");
        let since = since
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "0000".to_string());
        let until = until
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "9999".to_string());
        let mut stmt = conn
            .prepare(
                r#"SELECT body FROM raw_documents
                   WHERE source_id = ? AND collected_at >= ? AND collected_at < ?
                   ORDER BY collected_at"#,
            )
            .map_err(AtlasError::storage)?;
        let rows = stmt
            .query_map(params![source_id, since, until], |row| {
                row.get::<_, String>(0)
            })
            .map_err(AtlasError::storage)?;

        let mut docs = Vec::new();
        for row in rows {
            let body = row.map_err(AtlasError::storage)?;
            docs.push(serde_json::from_str(&body)?);
        }
        Ok(docs)
    }

    async fn put_processed(&self, doc: &ProcessedDocument) -> Result<()> {
        let body = serde_json::to_string(doc)?;
        let conn = self.conn.lock().expect("sqlite poisoned");
        conn.execute(
            r#"INSERT OR REPLACE INTO processed_documents
               (id, raw_document_id, similarity_group_id, processed_at, body)
               VALUES (?, ?, ?, ?, ?)"#,
            params![
                doc.id.to_string(),
                doc.raw_document_id.to_string(),
                doc.similarity_group_id.map(|g| g.to_string()),
                doc.processed_at.to_rfc3339(),
                body
            ],
        )
        .map_err(AtlasError::storage)?;
        Ok(())
    }

    async fn iter_group(&self, group_id: Uuid) -> Result<Vec<ProcessedDocument>> {
        let conn = self.conn.lock().expect("sqlite poisoned");
        let mut stmt = conn
            .prepare(
                r#"SELECT body FROM processed_documents
                   WHERE similarity_group_id = ? ORDER BY processed_at"#,
            )
            .map_err(AtlasError::storage)?;
        let rows = stmt
            .query_map(params![group_id.to_string()], |row| {
                row.get::<_, String>(0)
            })
            .map_err(AtlasError::storage)?;

        let mut docs = Vec::new();
        for row in rows {
            let body = row.map_err(AtlasError::storage)?;
            docs.push(serde_json::from_str(&body)?);
        }
        Ok(docs)
    }

    async fn list_processed(&self) -> Result<Vec<ProcessedDocument>> {
        let conn = self.conn.lock().expect("sqlite poisoned");
        let mut stmt = conn
            .prepare("SELECT body FROM processed_documents ORDER BY processed_at")
            .map_err(AtlasError::storage)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(AtlasError::storage)?;

        let mut docs = Vec::new();
        for row in rows {
            let body = row.map_err(AtlasError::storage)?;
            docs.push(serde_json::from_str(&body)?);
        }
        Ok(docs)
    }

    async fn put_task_status(&self, record: &TaskRecord) -> Result<()> {
        let body = serde_json::to_string(record)?;
        let conn = self.conn.lock().expect("sqlite poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO task_records (task_id, body) VALUES (?, ?)",
            params![record.task_id.to_string(), body],
        )
        .map_err(AtlasError::storage)?;
        Ok(())
    }

    async fn get_task_status(&self, id: Uuid) -> Result<Option<TaskRecord>> {
        let conn = self.conn.lock().expect("sqlite poisoned");
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM task_records WHERE task_id = ?",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(AtlasError::storage)?;
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }
}
