//! Per-domain admission control.
//!
//! Every fetch asks the limiter for a slot on the target domain before
//! touching the network. Four interchangeable algorithms are available
//! per domain; an adaptive wrapper scales the effective rate from the
//! observed success ratio. Cross-domain state is independent, so one
//! misbehaving host never throttles the others.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::error::{AtlasError, Result};

/// Admission algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateStrategy {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
    LeakyBucket,
}

/// Per-domain admission policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatePolicy {
    pub strategy: RateStrategy,
    /// Sustained rate `R` in requests per second.
    pub requests_per_second: f64,
    /// Bucket capacity `B` for the bucket strategies.
    pub burst_size: u32,
    /// Window length `W` in seconds for the window strategies.
    pub window_secs: f64,
    /// Enable success-ratio adaptation.
    pub adaptive: bool,
    /// EMA smoothing factor for the success ratio.
    pub ema_alpha: f64,
    /// Consecutive good outcomes required before raising the rate.
    pub recovery_streak: u32,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            strategy: RateStrategy::SlidingWindow,
            requests_per_second: 1.0,
            burst_size: 5,
            window_secs: 1.0,
            adaptive: true,
            ema_alpha: 0.2,
            recovery_streak: 5,
        }
    }
}

/// Lowest the adaptive wrapper may push the rate, as a fraction of the
/// configured rate.
const ADAPTIVE_FLOOR: f64 = 0.1;

/// Algorithm-specific state.
#[derive(Debug)]
enum LimiterState {
    FixedWindow {
        window_start: Instant,
        count: u32,
    },
    SlidingWindow {
        grants: VecDeque<Instant>,
    },
    TokenBucket {
        tokens: f64,
        last_refill: Instant,
    },
    LeakyBucket {
        volume: f64,
        last_leak: Instant,
    },
}

impl LimiterState {
    fn new(policy: &RatePolicy, now: Instant) -> Self {
        match policy.strategy {
            RateStrategy::FixedWindow => Self::FixedWindow {
                window_start: now,
                count: 0,
            },
            RateStrategy::SlidingWindow => Self::SlidingWindow {
                grants: VecDeque::new(),
            },
            RateStrategy::TokenBucket => Self::TokenBucket {
                tokens: policy.burst_size as f64,
                last_refill: now,
            },
            RateStrategy::LeakyBucket => Self::LeakyBucket {
                volume: 0.0,
                last_leak: now,
            },
        }
    }

    /// Attempt to take one slot at `now` under `rate` requests/second.
    fn try_acquire(&mut self, policy: &RatePolicy, rate: f64, now: Instant) -> bool {
        match self {
            LimiterState::FixedWindow {
                window_start,
                count,
            } => {
                let window = Duration::from_secs_f64(policy.window_secs);
                if now.duration_since(*window_start) >= window {
                    *window_start = now;
                    *count = 0;
                }
                let max_requests = (rate * policy.window_secs).max(1.0) as u32;
                if *count < max_requests {
                    *count += 1;
                    true
                } else {
                    false
                }
            }
            LimiterState::SlidingWindow { grants } => {
                let window = Duration::from_secs_f64(policy.window_secs);
                while let Some(front) = grants.front() {
                    if now.duration_since(*front) >= window {
                        grants.pop_front();
                    } else {
                        break;
                    }
                }
                let max_requests = (rate * policy.window_secs).max(1.0) as usize;
                if grants.len() < max_requests {
                    grants.push_back(now);
                    true
                } else {
                    false
                }
            }
            LimiterState::TokenBucket {
                tokens,
                last_refill,
            } => {
                let elapsed = now.duration_since(*last_refill).as_secs_f64();
                if elapsed > 0.0 {
                    *tokens = (*tokens + elapsed * rate).min(policy.burst_size as f64);
                    *last_refill = now;
                }
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    true
                } else {
                    false
                }
            }
            LimiterState::LeakyBucket { volume, last_leak } => {
                let elapsed = now.duration_since(*last_leak).as_secs_f64();
                if elapsed > 0.0 {
                    *volume = (*volume - elapsed * rate).max(0.0);
                    *last_leak = now;
                }
                if *volume < policy.burst_size as f64 {
                    *volume += 1.0;
                    true
                } else {
                    false
                }
            }
        }
    }
}

/// State for a single domain, owned exclusively by the limiter.
#[derive(Debug)]
struct DomainState {
    policy: RatePolicy,
    limiter: LimiterState,
    /// Adaptive multiplier applied to the configured rate, in
    /// `[ADAPTIVE_FLOOR, 1.0]`.
    rate_factor: f64,
    /// EMA of the success ratio.
    success_ema: f64,
    ema_seeded: bool,
    good_streak: u32,
    last_access_at: Instant,
    total_granted: u64,
    total_denied: u64,
}

impl DomainState {
    fn new(policy: RatePolicy, now: Instant) -> Self {
        let limiter = LimiterState::new(&policy, now);
        Self {
            policy,
            limiter,
            rate_factor: 1.0,
            success_ema: 1.0,
            ema_seeded: false,
            good_streak: 0,
            last_access_at: now,
            total_granted: 0,
            total_denied: 0,
        }
    }

    fn effective_rate(&self) -> f64 {
        self.policy.requests_per_second * self.rate_factor
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        self.last_access_at = now;
        let rate = self.effective_rate();
        let granted = self.limiter.try_acquire(&self.policy, rate, now);
        if granted {
            self.total_granted += 1;
        } else {
            self.total_denied += 1;
        }
        granted
    }

    fn record_outcome(&mut self, success: bool) {
        if !self.policy.adaptive {
            return;
        }
        let sample = if success { 1.0 } else { 0.0 };
        if self.ema_seeded {
            self.success_ema =
                self.policy.ema_alpha * sample + (1.0 - self.policy.ema_alpha) * self.success_ema;
        } else {
            self.success_ema = sample;
            self.ema_seeded = true;
        }

        if self.success_ema < 0.5 {
            self.good_streak = 0;
            let new_factor = (self.rate_factor * 0.5).max(ADAPTIVE_FLOOR);
            if new_factor < self.rate_factor {
                self.rate_factor = new_factor;
            }
        } else if self.success_ema > 0.9 {
            self.good_streak += 1;
            if self.good_streak >= self.policy.recovery_streak {
                self.good_streak = 0;
                self.rate_factor = (self.rate_factor * 1.25).min(1.0);
            }
        } else {
            self.good_streak = 0;
        }
    }
}

/// Point-in-time view of a domain's limiter state.
#[derive(Debug, Clone)]
pub struct DomainStats {
    pub effective_rate: f64,
    pub rate_factor: f64,
    pub success_ema: f64,
    pub total_granted: u64,
    pub total_denied: u64,
    /// Time since the domain was last asked for a slot.
    pub idle_for: Duration,
}

/// Per-domain rate limiter with an optional global policy layered on
/// top: a grant must pass the global limiter first, then the domain's.
pub struct RateLimiter {
    default_policy: RatePolicy,
    domains: Arc<RwLock<HashMap<String, DomainState>>>,
    global: Option<Arc<RwLock<DomainState>>>,
}

impl RateLimiter {
    pub fn new(default_policy: RatePolicy) -> Self {
        Self {
            default_policy,
            domains: Arc::new(RwLock::new(HashMap::new())),
            global: None,
        }
    }

    /// Layer a process-wide policy over the per-domain ones.
    pub fn with_global_policy(mut self, policy: RatePolicy) -> Self {
        self.global = Some(Arc::new(RwLock::new(DomainState::new(
            policy,
            Instant::now(),
        ))));
        self
    }

    /// Extract the rate-limit key (host) from a URL.
    pub fn domain_of(url: &str) -> Option<String> {
        url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
    }

    /// Replace the policy for one domain, resetting its state.
    pub async fn set_policy(&self, domain: &str, policy: RatePolicy) {
        let mut domains = self.domains.write().await;
        info!(domain, rate = policy.requests_per_second, "rate policy set");
        domains.insert(domain.to_string(), DomainState::new(policy, Instant::now()));
    }

    /// Single admission attempt. Total: never blocks, never fails.
    pub async fn try_acquire(&self, domain: &str) -> bool {
        let now = Instant::now();
        if let Some(global) = &self.global {
            if !global.write().await.try_acquire(now) {
                return false;
            }
        }
        let mut domains = self.domains.write().await;
        let state = domains
            .entry(domain.to_string())
            .or_insert_with(|| DomainState::new(self.default_policy.clone(), now));
        state.try_acquire(now)
    }

    /// Acquire a slot for `domain`.
    ///
    /// Non-blocking mode returns `Ok(granted)` immediately. Blocking
    /// mode suspends up to `timeout`, polling at the pace the effective
    /// rate implies, and fails with `Timeout` past the deadline or
    /// `Cancelled` when the caller's token fires.
    pub async fn acquire(
        &self,
        domain: &str,
        blocking: bool,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<bool> {
        if !blocking {
            return Ok(self.try_acquire(domain).await);
        }

        let deadline = Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(AtlasError::Cancelled);
            }
            if self.try_acquire(domain).await {
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(AtlasError::Timeout(timeout));
            }

            let rate = {
                let domains = self.domains.read().await;
                domains
                    .get(domain)
                    .map(|s| s.effective_rate())
                    .unwrap_or(self.default_policy.requests_per_second)
            };
            let pace = if rate > 0.0 {
                Duration::from_secs_f64((1.0 / rate).min(1.0))
            } else {
                Duration::from_millis(100)
            };
            let wait = pace.min(deadline - now);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Err(AtlasError::Cancelled),
            }
        }
    }

    /// Feed an outcome back into the adaptive state. Best-effort, never
    /// fails; unknown domains are ignored.
    pub async fn record_outcome(&self, domain: &str, success: bool, latency: Duration) {
        let mut domains = self.domains.write().await;
        if let Some(state) = domains.get_mut(domain) {
            state.record_outcome(success);
            debug!(
                domain,
                success,
                latency_ms = latency.as_millis() as u64,
                ema = state.success_ema,
                factor = state.rate_factor,
                "outcome recorded"
            );
        }
    }

    /// Stats for every domain the limiter has seen.
    pub async fn stats(&self) -> HashMap<String, DomainStats> {
        let now = Instant::now();
        let domains = self.domains.read().await;
        domains
            .iter()
            .map(|(domain, state)| {
                (
                    domain.clone(),
                    DomainStats {
                        effective_rate: state.effective_rate(),
                        rate_factor: state.rate_factor,
                        success_ema: state.success_ema,
                        total_granted: state.total_granted,
                        total_denied: state.total_denied,
                        idle_for: now.duration_since(state.last_access_at),
                    },
                )
            })
            .collect()
    }
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self {
        Self {
            default_policy: self.default_policy.clone(),
            domains: self.domains.clone(),
            global: self.global.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: RateStrategy, rate: f64, burst: u32) -> RatePolicy {
        RatePolicy {
            strategy,
            requests_per_second: rate,
            burst_size: burst,
            window_secs: 1.0,
            adaptive: false,
            ..RatePolicy::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_resets() {
        let limiter = RateLimiter::new(policy(RateStrategy::FixedWindow, 2.0, 0));
        assert!(limiter.try_acquire("x.test").await);
        assert!(limiter.try_acquire("x.test").await);
        assert!(!limiter.try_acquire("x.test").await);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.try_acquire("x.test").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_expires_oldest() {
        let limiter = RateLimiter::new(policy(RateStrategy::SlidingWindow, 2.0, 0));
        assert!(limiter.try_acquire("x.test").await);
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(limiter.try_acquire("x.test").await);
        assert!(!limiter.try_acquire("x.test").await);

        // First grant leaves the window; one slot opens.
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.try_acquire("x.test").await);
        assert!(!limiter.try_acquire("x.test").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_allows_burst() {
        let limiter = RateLimiter::new(policy(RateStrategy::TokenBucket, 1.0, 3));
        assert!(limiter.try_acquire("x.test").await);
        assert!(limiter.try_acquire("x.test").await);
        assert!(limiter.try_acquire("x.test").await);
        assert!(!limiter.try_acquire("x.test").await);

        // One token refills per second.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.try_acquire("x.test").await);
        assert!(!limiter.try_acquire("x.test").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaky_bucket_drains() {
        let limiter = RateLimiter::new(policy(RateStrategy::LeakyBucket, 1.0, 2));
        assert!(limiter.try_acquire("x.test").await);
        assert!(limiter.try_acquire("x.test").await);
        assert!(!limiter.try_acquire("x.test").await);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.try_acquire("x.test").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_per_second_steady_state() {
        let limiter = RateLimiter::new(policy(RateStrategy::SlidingWindow, 1.0, 0));
        assert!(limiter.try_acquire("x.test").await);
        for _ in 0..9 {
            tokio::time::advance(Duration::from_millis(100)).await;
            assert!(!limiter.try_acquire("x.test").await);
        }
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(limiter.try_acquire("x.test").await);
    }

    #[tokio::test]
    async fn test_domains_independent() {
        let limiter = RateLimiter::new(policy(RateStrategy::FixedWindow, 1.0, 0));
        assert!(limiter.try_acquire("a.test").await);
        assert!(!limiter.try_acquire("a.test").await);
        assert!(limiter.try_acquire("b.test").await);
    }

    #[tokio::test]
    async fn test_adaptive_halves_on_failures() {
        let mut p = policy(RateStrategy::TokenBucket, 10.0, 10);
        p.adaptive = true;
        p.ema_alpha = 1.0; // react on every sample
        let limiter = RateLimiter::new(p);
        limiter.try_acquire("x.test").await;

        limiter
            .record_outcome("x.test", false, Duration::from_millis(10))
            .await;
        let stats = limiter.stats().await;
        let s = stats.get("x.test").unwrap();
        assert!((s.rate_factor - 0.5).abs() < 1e-9);
        assert!((s.effective_rate - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_adaptive_floor_and_recovery_ceiling() {
        let mut p = policy(RateStrategy::TokenBucket, 10.0, 10);
        p.adaptive = true;
        p.ema_alpha = 1.0;
        p.recovery_streak = 2;
        let limiter = RateLimiter::new(p);
        limiter.try_acquire("x.test").await;

        for _ in 0..10 {
            limiter
                .record_outcome("x.test", false, Duration::from_millis(10))
                .await;
        }
        let s = limiter.stats().await;
        assert!((s.get("x.test").unwrap().rate_factor - ADAPTIVE_FLOOR).abs() < 1e-9);

        // Recovery raises by 1.25 per completed streak, capped at 1.0.
        for _ in 0..40 {
            limiter
                .record_outcome("x.test", true, Duration::from_millis(10))
                .await;
        }
        let s = limiter.stats().await;
        assert!((s.get("x.test").unwrap().rate_factor - 1.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_acquire_waits_for_slot() {
        let limiter = RateLimiter::new(policy(RateStrategy::SlidingWindow, 1.0, 0));
        assert!(limiter.try_acquire("x.test").await);

        let cancel = CancelToken::never();
        let limiter2 = limiter.clone();
        let waiter = tokio::spawn(async move {
            limiter2
                .acquire("x.test", true, Duration::from_secs(5), &cancel)
                .await
        });
        tokio::time::advance(Duration::from_millis(1100)).await;
        let granted = waiter.await.unwrap().unwrap();
        assert!(granted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_acquire_times_out() {
        let limiter = RateLimiter::new(policy(RateStrategy::SlidingWindow, 0.1, 0));
        limiter.try_acquire("x.test").await;

        let cancel = CancelToken::never();
        let limiter2 = limiter.clone();
        let waiter = tokio::spawn(async move {
            limiter2
                .acquire("x.test", true, Duration::from_millis(500), &cancel)
                .await
        });
        tokio::time::advance(Duration::from_secs(2)).await;
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(AtlasError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_acquire_cancelled() {
        let limiter = RateLimiter::new(policy(RateStrategy::SlidingWindow, 0.1, 0));
        limiter.try_acquire("x.test").await;

        let source = crate::cancel::CancelSource::new();
        let token = source.token();
        let limiter2 = limiter.clone();
        let waiter = tokio::spawn(async move {
            limiter2
                .acquire("x.test", true, Duration::from_secs(60), &token)
                .await
        });
        tokio::time::advance(Duration::from_millis(50)).await;
        source.cancel();
        tokio::time::advance(Duration::from_millis(50)).await;
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(AtlasError::Cancelled)));
    }

    #[test]
    fn test_domain_of() {
        assert_eq!(
            RateLimiter::domain_of("https://news.example.com/feed"),
            Some("news.example.com".to_string())
        );
        assert_eq!(RateLimiter::domain_of("not a url"), None);
    }
}
