//! Core data model: source configuration and document records.

pub mod documents;
pub mod source;

pub use documents::{ProcessedDocument, ProcessingStatus, RawDocument};
pub use source::{SourceConfig, SourceType};
