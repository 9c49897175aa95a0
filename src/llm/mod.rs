//! Adaptive LLM gateway: client, dedicated queue, and the concurrency
//! controller that supervises them.

pub mod client;
pub mod controller;
pub mod queue;

use async_trait::async_trait;
use serde_json::json;

use crate::error::{AtlasError, LlmErrorKind, Result};
use crate::processors::dedup::EmbeddingProvider;
use crate::scheduler::queue::TaskPriority;

pub use client::{Completion, GenerateParams, Health, LlmClient, LlmConfig, ModelInfo};
pub use controller::{AdaptiveController, ControllerConfig, ControllerState, SystemProbe};
pub use queue::{LlmQueue, LlmTask, LlmTaskType, LlmTicket};

/// Embedding provider backed by the LLM queue.
///
/// Routing through the queue (rather than the client directly) keeps
/// deduplication under the adaptive controller's concurrency budget,
/// and an open circuit surfaces as an error the deduplicator can fall
/// back from.
pub struct LlmEmbeddingProvider {
    queue: LlmQueue,
}

impl LlmEmbeddingProvider {
    pub fn new(queue: LlmQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl EmbeddingProvider for LlmEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let task = LlmTask::new(
            LlmTaskType::Embed,
            TaskPriority::Normal,
            json!({ "text": text }),
        );
        let ticket = self.queue.submit(task)?;
        let value = ticket.result().await?;
        let vector = value
            .get("embeddings")
            .and_then(|v| v.get(0))
            .and_then(|v| v.as_array())
            .ok_or_else(|| AtlasError::llm(LlmErrorKind::Protocol, "malformed embed result"))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();
        Ok(vector)
    }

    fn name(&self) -> &'static str {
        "llm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_open_circuit_surfaces_to_provider() {
        let client = Arc::new(
            LlmClient::new(LlmConfig {
                endpoint: "http://127.0.0.1:9".into(),
                ..LlmConfig::default()
            })
            .unwrap(),
        );
        let queue = LlmQueue::new(client, 0, Duration::from_secs(60));
        let provider = LlmEmbeddingProvider::new(queue);
        let result = provider.embed("text").await;
        assert!(matches!(result, Err(AtlasError::CircuitOpen)));
    }
}
