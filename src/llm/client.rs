//! HTTP client for the local inference service.
//!
//! Speaks the Ollama-style API: `/api/generate` (plain and chunked
//! streaming), `/api/embeddings`, `/api/tags`, `/api/show`. Concurrency
//! is bounded by a semaphore; only connection-level failures are
//! retried, semantic 4xx errors are surfaced as-is. Recent outcomes are
//! kept in a sliding window so the adaptive controller can read p95
//! latency and error rate without instrumenting call sites.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::Stream;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{AtlasError, LlmErrorKind, Result};

fn default_endpoint() -> String {
    "http://localhost:11434".to_string()
}
fn default_model() -> String {
    "llama3.2:3b".to_string()
}
fn default_embed_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_max_tokens() -> u32 {
    512
}
fn default_temperature() -> f32 {
    0.3
}
fn default_request_timeout_secs() -> u64 {
    300
}
fn default_max_concurrent() -> usize {
    4
}
fn default_connect_retries() -> u32 {
    2
}
fn default_enabled() -> bool {
    true
}

/// LLM gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_embed_model")]
    pub embed_model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Retries for connection failures only.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            endpoint: default_endpoint(),
            model: default_model(),
            embed_model: default_embed_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            request_timeout_secs: default_request_timeout_secs(),
            max_concurrent: default_max_concurrent(),
            connect_retries: default_connect_retries(),
        }
    }
}

/// Generation parameters overriding the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct GenerateParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// A completed generation.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub model: String,
}

/// One streamed generation chunk.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub text: String,
    pub done: bool,
}

/// Service health probe result.
#[derive(Debug, Clone)]
pub struct Health {
    pub reachable: bool,
    pub latency: Duration,
    pub model_count: usize,
}

/// One entry from `/api/tags`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// p95 latency and error rate over the recent window.
#[derive(Debug, Clone, Default)]
pub struct WindowStats {
    pub samples: usize,
    /// Percent of failed calls.
    pub error_rate: f64,
    pub p95_latency: Duration,
}

struct Outcome {
    at: Instant,
    latency: Duration,
    ok: bool,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    done: bool,
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

/// Client handle; cheap to clone.
#[derive(Clone)]
pub struct LlmClient {
    config: LlmConfig,
    client: Client,
    permits: Arc<Semaphore>,
    outcomes: Arc<Mutex<VecDeque<Outcome>>>,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Ok(Self {
            config,
            client,
            permits,
            outcomes: Arc::new(Mutex::new(VecDeque::new())),
        })
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    /// Generate a completion for a prompt.
    pub async fn generate(&self, prompt: &str, params: &GenerateParams) -> Result<Completion> {
        let request = GenerateRequest {
            model: &self.config.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: params.temperature.unwrap_or(self.config.temperature),
                num_predict: params.max_tokens.unwrap_or(self.config.max_tokens),
            },
        };

        let body: GenerateResponse = self
            .call_json("/api/generate", &serde_json::to_value(&request)?)
            .await?;
        Ok(Completion {
            text: body.response,
            model: self.config.model.clone(),
        })
    }

    /// Generate with chunked streaming; yields chunks until the
    /// terminal `{"done":true}` frame.
    pub async fn stream_generate(
        &self,
        prompt: &str,
        params: &GenerateParams,
    ) -> Result<impl Stream<Item = Result<Chunk>> + Unpin> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AtlasError::llm(LlmErrorKind::Connection, "client shut down"))?;

        let request = GenerateRequest {
            model: &self.config.model,
            prompt,
            stream: true,
            options: GenerateOptions {
                temperature: params.temperature.unwrap_or(self.config.temperature),
                num_predict: params.max_tokens.unwrap_or(self.config.max_tokens),
            },
        };

        let url = format!("{}/api/generate", self.config.endpoint);
        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(map_reqwest)?;

        if !response.status().is_success() {
            self.record(started.elapsed(), false);
            return Err(status_error(response.status().as_u16()));
        }
        self.record(started.elapsed(), true);

        // Chunked JSON objects, one per line; the permit rides inside
        // the stream state so concurrency stays bounded until
        // end-of-stream.
        let byte_stream = Box::pin(response.bytes_stream());
        let stream = futures::stream::unfold(
            (byte_stream, String::new(), false, permit),
            |(mut bytes, mut buffer, finished, permit)| async move {
                if finished {
                    return None;
                }
                loop {
                    if let Some(newline) = buffer.find('\n') {
                        let line: String = buffer.drain(..=newline).collect();
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        return match serde_json::from_str::<GenerateResponse>(line) {
                            Ok(frame) => {
                                let chunk = Chunk {
                                    text: frame.response,
                                    done: frame.done,
                                };
                                Some((Ok(chunk), (bytes, buffer, frame.done, permit)))
                            }
                            Err(e) => Some((
                                Err(AtlasError::llm(LlmErrorKind::Protocol, e)),
                                (bytes, buffer, true, permit),
                            )),
                        };
                    }
                    match bytes.next().await {
                        Some(Ok(data)) => {
                            buffer.push_str(&String::from_utf8_lossy(&data));
                        }
                        Some(Err(e)) => {
                            return Some((
                                Err(AtlasError::llm(LlmErrorKind::Connection, e)),
                                (bytes, buffer, true, permit),
                            ))
                        }
                        None => return None,
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }

    /// Embed a batch of texts.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            let request = EmbeddingsRequest {
                model: &self.config.embed_model,
                prompt: text,
            };
            let body: EmbeddingsResponse = self
                .call_json("/api/embeddings", &serde_json::to_value(&request)?)
                .await?;
            vectors.push(body.embedding);
        }
        Ok(vectors)
    }

    /// Probe the service.
    pub async fn health(&self) -> Health {
        let started = Instant::now();
        match self.list_models().await {
            Ok(models) => Health {
                reachable: true,
                latency: started.elapsed(),
                model_count: models.len(),
            },
            Err(_) => Health {
                reachable: false,
                latency: started.elapsed(),
                model_count: 0,
            },
        }
    }

    /// List available models from `/api/tags`.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        #[derive(Deserialize)]
        struct TagsResponse {
            models: Vec<ModelInfo>,
        }

        let url = format!("{}/api/tags", self.config.endpoint);
        let response = self.client.get(&url).send().await.map_err(map_reqwest)?;
        if !response.status().is_success() {
            return Err(status_error(response.status().as_u16()));
        }
        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| AtlasError::llm(LlmErrorKind::Protocol, e))?;
        Ok(tags.models)
    }

    /// Model details from `/api/show`.
    pub async fn show_model(&self, name: &str) -> Result<Value> {
        let body = serde_json::json!({ "name": name });
        self.call_json("/api/show", &body).await
    }

    /// Error rate and p95 latency over the trailing window.
    pub fn window_stats(&self, window: Duration) -> WindowStats {
        let now = Instant::now();
        let mut outcomes = self.outcomes.lock().expect("outcomes poisoned");
        while let Some(front) = outcomes.front() {
            if now.duration_since(front.at) > window {
                outcomes.pop_front();
            } else {
                break;
            }
        }

        let samples = outcomes.len();
        if samples == 0 {
            return WindowStats::default();
        }
        let errors = outcomes.iter().filter(|o| !o.ok).count();
        let mut latencies: Vec<Duration> = outcomes.iter().map(|o| o.latency).collect();
        latencies.sort();
        let index = ((samples as f64 - 1.0) * 0.95).round() as usize;

        WindowStats {
            samples,
            error_rate: errors as f64 / samples as f64 * 100.0,
            p95_latency: latencies[index],
        }
    }

    /// POST a JSON body; retry connection failures only.
    async fn call_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<T> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AtlasError::llm(LlmErrorKind::Connection, "client shut down"))?;
        let url = format!("{}{}", self.config.endpoint, path);

        let mut last_err = None;
        for attempt in 0..=self.config.connect_retries {
            let started = Instant::now();
            match self.client.post(&url).json(body).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if !(200..300).contains(&status) {
                        self.record(started.elapsed(), false);
                        return Err(status_error(status));
                    }
                    return match response.json::<T>().await {
                        Ok(value) => {
                            self.record(started.elapsed(), true);
                            Ok(value)
                        }
                        Err(e) => {
                            self.record(started.elapsed(), false);
                            Err(AtlasError::llm(LlmErrorKind::Protocol, e))
                        }
                    };
                }
                Err(e) => {
                    self.record(started.elapsed(), false);
                    let mapped = map_reqwest(e);
                    let is_connection = matches!(
                        mapped,
                        AtlasError::Llm {
                            kind: LlmErrorKind::Connection,
                            ..
                        }
                    );
                    if is_connection && attempt < self.config.connect_retries {
                        debug!(attempt, url = %url, "LLM connection retry");
                        last_err = Some(mapped);
                        tokio::time::sleep(Duration::from_millis(200 * (attempt as u64 + 1)))
                            .await;
                        continue;
                    }
                    return Err(mapped);
                }
            }
        }
        warn!(url = %url, "LLM connection retries exhausted");
        Err(last_err
            .unwrap_or_else(|| AtlasError::llm(LlmErrorKind::Connection, "retries exhausted")))
    }

    fn record(&self, latency: Duration, ok: bool) {
        let mut outcomes = self.outcomes.lock().expect("outcomes poisoned");
        outcomes.push_back(Outcome {
            at: Instant::now(),
            latency,
            ok,
        });
        // Bound memory; the controller windows are far shorter.
        while outcomes.len() > 4096 {
            outcomes.pop_front();
        }
    }

    #[cfg(test)]
    pub(crate) fn record_for_test(&self, latency: Duration, ok: bool) {
        self.record(latency, ok);
    }
}

fn map_reqwest(err: reqwest::Error) -> AtlasError {
    if err.is_timeout() {
        AtlasError::llm(LlmErrorKind::Timeout, err)
    } else if err.is_connect() {
        AtlasError::llm(LlmErrorKind::Connection, err)
    } else if err.is_decode() {
        AtlasError::llm(LlmErrorKind::Protocol, err)
    } else {
        AtlasError::llm(LlmErrorKind::Connection, err)
    }
}

fn status_error(status: u16) -> AtlasError {
    if status >= 500 {
        AtlasError::llm(LlmErrorKind::ServerError, format!("HTTP {status}"))
    } else {
        AtlasError::llm(LlmErrorKind::Protocol, format!("HTTP {status}"))
    }
}
