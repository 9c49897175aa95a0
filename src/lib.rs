//! Atlas collection and processing core.
//!
//! A long-running aggregation engine: cron-scheduled collection of
//! RSS/web sources through a rate-limited, cached HTTP fetcher;
//! normalization, validation, and multi-strategy deduplication of the
//! captured documents; and an adaptively throttled gateway to a local
//! LLM inference service for semantic enrichment.
//!
//! # Architecture
//!
//! - `models`: source configuration and document records
//! - `collectors`: rate limiter, HTTP client, RSS/web adapters
//! - `processors`: extraction, normalization, validation, dedup
//! - `scheduler`: task queue, cron dispatch, status tracking
//! - `llm`: inference client, LLM queue, adaptive controller
//! - `storage`: narrow persistence trait with SQLite/in-memory backends
//! - `pipeline`: the per-source collection run gluing it together

pub mod cancel;
pub mod collectors;
pub mod config;
pub mod error;
pub mod llm;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod processors;
pub mod scheduler;
pub mod storage;

pub use config::AtlasConfig;
pub use error::{AtlasError, Result};
