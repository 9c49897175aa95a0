//! Cached, retrying HTTP fetcher.
//!
//! Every exchange that completes at the HTTP layer yields a
//! [`HttpResponse`], including 4xx/5xx after the retry budget is spent;
//! only transport-level failures surface as errors. Admission goes
//! through the shared per-domain rate limiter and outcomes feed its
//! adaptive state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::collectors::http_cache::HttpCache;
use crate::collectors::rate_limiter::RateLimiter;
use crate::error::{AtlasError, Result};

fn default_timeout_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_cache_ttl_secs() -> u64 {
    900
}
fn default_cache_enabled() -> bool {
    true
}

/// HTTP client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub proxy: Option<String>,
    /// Verify TLS certificates. Disabling is for test servers only.
    #[serde(default = "default_cache_enabled")]
    pub verify_tls: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            cache_enabled: default_cache_enabled(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_dir: None,
            proxy: None,
            verify_tls: true,
        }
    }
}

/// Request method subset used by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
}

impl HttpMethod {
    fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
        }
    }
}

/// A completed HTTP exchange.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub elapsed: Duration,
    pub from_cache: bool,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body decoded as UTF-8, lossy.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Aggregate request counters.
#[derive(Debug, Default)]
pub struct HttpStats {
    pub requests: AtomicU64,
    pub cache_hits: AtomicU64,
    pub retries: AtomicU64,
    pub failures: AtomicU64,
}

/// Cached, retrying HTTP client with per-domain admission.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    config: HttpConfig,
    cache: Option<HttpCache>,
    limiter: RateLimiter,
    stats: Arc<HttpStats>,
}

impl HttpClient {
    pub fn new(config: HttpConfig, user_agent: &str, limiter: RateLimiter) -> Result<Self> {
        let mut builder = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            .brotli(true);
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy).map_err(AtlasError::from)?);
        }
        if !config.verify_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build()?;

        let cache = if config.cache_enabled {
            config.cache_dir.clone().map(|dir| {
                HttpCache::new(dir, Duration::from_secs(config.cache_ttl_secs))
            })
        } else {
            None
        };

        Ok(Self {
            client,
            config,
            cache,
            limiter,
            stats: Arc::new(HttpStats::default()),
        })
    }

    pub fn stats(&self) -> &HttpStats {
        &self.stats
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Sweep expired cache entries; no-op without a cache.
    pub fn sweep_cache(&self) -> usize {
        self.cache.as_ref().map(|c| c.sweep()).unwrap_or(0)
    }

    /// Convenience GET returning decoded text.
    pub async fn get_text(&self, url: &str, cancel: &CancelToken) -> Result<String> {
        let response = self
            .request(HttpMethod::Get, url, &HashMap::new(), None, None, cancel)
            .await?;
        Ok(response.text())
    }

    /// Perform a request with caching, admission control, and retries.
    ///
    /// `deadline` bounds a single attempt; `None` uses the configured
    /// timeout. Transport errors and 5xx/429 responses are retried with
    /// exponential backoff and jitter; a `Retry-After` header (seconds
    /// form) overrides the computed delay. 4xx other than 429 and TLS
    /// or DNS failures are final.
    pub async fn request(
        &self,
        method: HttpMethod,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<Vec<u8>>,
        deadline: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<HttpResponse> {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        let body_bytes = body.clone().unwrap_or_default();
        let cache_key = HttpCache::key(method.as_str(), url, &body_bytes);
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&cache_key) {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(HttpResponse {
                    status: hit.status,
                    headers: hit.headers,
                    body: hit.body,
                    elapsed: Duration::ZERO,
                    from_cache: true,
                });
            }
        }

        let domain = RateLimiter::domain_of(url)
            .ok_or_else(|| AtlasError::Http(format!("unparseable url: {url}")))?;

        let timeout = deadline.unwrap_or(Duration::from_secs(self.config.timeout_secs));
        let mut last_err: Option<AtlasError> = None;

        for attempt in 1..=self.config.max_attempts {
            if cancel.is_cancelled() {
                return Err(AtlasError::Cancelled);
            }

            // Admission before every attempt; the wait itself honors
            // the caller's cancellation and a bounded timeout.
            self.limiter
                .acquire(&domain, true, timeout, cancel)
                .await?;

            let started = Instant::now();
            let outcome = self
                .send_once(method, url, headers, body.clone(), timeout, cancel)
                .await;
            let elapsed = started.elapsed();

            match outcome {
                Ok(response) => {
                    let retryable = response.status == 429 || response.status >= 500;
                    self.limiter
                        .record_outcome(&domain, !retryable && response.status < 400, elapsed)
                        .await;

                    if retryable && attempt < self.config.max_attempts {
                        let delay = self
                            .retry_after(&response)
                            .unwrap_or_else(|| self.backoff_delay(attempt));
                        debug!(url, status = response.status, attempt, delay_ms = delay.as_millis() as u64, "retrying");
                        self.stats.retries.fetch_add(1, Ordering::Relaxed);
                        self.sleep_or_cancel(delay, cancel).await?;
                        continue;
                    }

                    if let (Some(cache), true) = (&self.cache, response.is_success()) {
                        cache.put(&cache_key, response.status, &response.headers, &response.body);
                    }
                    return Ok(response);
                }
                Err(err) => {
                    self.limiter.record_outcome(&domain, false, elapsed).await;
                    match &err {
                        AtlasError::Cancelled | AtlasError::Tls(_) | AtlasError::Dns(_) => {
                            return Err(err)
                        }
                        _ if err.is_transient() && attempt < self.config.max_attempts => {
                            let delay = self.backoff_delay(attempt);
                            warn!(url, attempt, error = %err, "transport error, retrying");
                            self.stats.retries.fetch_add(1, Ordering::Relaxed);
                            last_err = Some(err);
                            self.sleep_or_cancel(delay, cancel).await?;
                        }
                        _ => {
                            self.stats.failures.fetch_add(1, Ordering::Relaxed);
                            return Err(err);
                        }
                    }
                }
            }
        }

        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        Err(last_err.unwrap_or(AtlasError::Timeout(timeout)))
    }

    async fn send_once(
        &self,
        method: HttpMethod,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<Vec<u8>>,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<HttpResponse> {
        let mut request = match method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Head => self.client.head(url),
            HttpMethod::Post => self.client.post(url),
        };
        request = request.timeout(timeout);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let started = Instant::now();
        let response = tokio::select! {
            result = request.send() => result.map_err(AtlasError::from)?,
            _ = cancel.cancelled() => return Err(AtlasError::Cancelled),
        };

        let status = response.status().as_u16();
        let mut response_headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                response_headers.insert(name.to_string(), v.to_string());
            }
        }

        let bytes = tokio::select! {
            result = response.bytes() => result.map_err(AtlasError::from)?,
            _ = cancel.cancelled() => return Err(AtlasError::Cancelled),
        };

        Ok(HttpResponse {
            status,
            headers: response_headers,
            body: bytes.to_vec(),
            elapsed: started.elapsed(),
            from_cache: false,
        })
    }

    /// Exponential backoff with jitter in [0.5, 1.5].
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base_ms as f64;
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let millis = base * 2f64.powi(attempt.saturating_sub(1) as i32) * jitter;
        Duration::from_millis(millis as u64)
    }

    fn retry_after(&self, response: &HttpResponse) -> Option<Duration> {
        response
            .header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    async fn sleep_or_cancel(&self, delay: Duration, cancel: &CancelToken) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(AtlasError::Cancelled),
        }
    }
}
