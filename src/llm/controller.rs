//! Adaptive concurrency control for the LLM queue.
//!
//! A sampling loop reads host CPU and memory, the client's windowed
//! error rate and p95 latency, and the queue depth, then drives a
//! state machine that expands, contracts, or halts the queue's worker
//! budget. Scale transitions require `k` consecutive qualifying
//! samples (hysteresis); the circuit breaker follows the standard
//! closed → open → half-open cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::llm::client::LlmClient;
use crate::llm::queue::LlmQueue;

/// Reads host utilization. The `/proc` implementation serves Linux
/// hosts; tests inject a static probe.
pub trait SystemProbe: Send + Sync {
    /// CPU utilization percent since the previous call.
    fn cpu_percent(&self) -> f64;
    /// Memory utilization percent.
    fn memory_percent(&self) -> f64;
}

/// `/proc/stat` + `/proc/meminfo` probe.
pub struct ProcSystemProbe {
    prev_cpu: Mutex<Option<(u64, u64)>>,
}

impl ProcSystemProbe {
    pub fn new() -> Self {
        Self {
            prev_cpu: Mutex::new(None),
        }
    }

    fn read_cpu_counters() -> Option<(u64, u64)> {
        let stat = std::fs::read_to_string("/proc/stat").ok()?;
        let line = stat.lines().next()?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .filter_map(|v| v.parse().ok())
            .collect();
        if fields.len() < 4 {
            return None;
        }
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let total: u64 = fields.iter().sum();
        Some((total, idle))
    }
}

impl Default for ProcSystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for ProcSystemProbe {
    fn cpu_percent(&self) -> f64 {
        let current = match Self::read_cpu_counters() {
            Some(counters) => counters,
            None => return 0.0,
        };
        let mut prev = self.prev_cpu.lock().expect("probe state poisoned");
        let result = match *prev {
            Some((prev_total, prev_idle)) => {
                let total = current.0.saturating_sub(prev_total);
                let idle = current.1.saturating_sub(prev_idle);
                if total == 0 {
                    0.0
                } else {
                    (total - idle) as f64 / total as f64 * 100.0
                }
            }
            None => 0.0,
        };
        *prev = Some(current);
        result
    }

    fn memory_percent(&self) -> f64 {
        let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
            return 0.0;
        };
        let field = |name: &str| -> Option<u64> {
            meminfo
                .lines()
                .find(|l| l.starts_with(name))?
                .split_whitespace()
                .nth(1)?
                .parse()
                .ok()
        };
        match (field("MemTotal:"), field("MemAvailable:")) {
            (Some(total), Some(available)) if total > 0 => {
                (total - available) as f64 / total as f64 * 100.0
            }
            _ => 0.0,
        }
    }
}

/// Fixed-value probe for tests and non-Linux hosts.
pub struct StaticProbe {
    pub cpu: Mutex<f64>,
    pub memory: Mutex<f64>,
}

impl StaticProbe {
    pub fn new(cpu: f64, memory: f64) -> Self {
        Self {
            cpu: Mutex::new(cpu),
            memory: Mutex::new(memory),
        }
    }

    pub fn set(&self, cpu: f64, memory: f64) {
        *self.cpu.lock().expect("probe poisoned") = cpu;
        *self.memory.lock().expect("probe poisoned") = memory;
    }
}

impl SystemProbe for StaticProbe {
    fn cpu_percent(&self) -> f64 {
        *self.cpu.lock().expect("probe poisoned")
    }
    fn memory_percent(&self) -> f64 {
        *self.memory.lock().expect("probe poisoned")
    }
}

fn default_sample_interval_secs() -> u64 {
    2
}
fn default_high_watermark() -> usize {
    10
}
fn default_scale_up_max_err() -> f64 {
    5.0
}
fn default_scale_up_max_cpu() -> f64 {
    70.0
}
fn default_scale_down_cpu() -> f64 {
    85.0
}
fn default_scale_down_mem() -> f64 {
    90.0
}
fn default_high_latency_ms() -> u64 {
    10_000
}
fn default_circuit_threshold() -> f64 {
    50.0
}
fn default_hysteresis() -> u32 {
    3
}
fn default_cooldown_secs() -> u64 {
    30
}
fn default_max_workers() -> usize {
    8
}
fn default_emergency_mem() -> f64 {
    97.0
}
fn default_stats_window_secs() -> u64 {
    30
}

/// Controller thresholds; the documented defaults are authoritative
/// unless the embedder overrides them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
    /// Queue depth above which scale-up is considered.
    #[serde(default = "default_high_watermark")]
    pub high_watermark: usize,
    #[serde(default = "default_scale_up_max_err")]
    pub scale_up_max_error_rate: f64,
    #[serde(default = "default_scale_up_max_cpu")]
    pub scale_up_max_cpu: f64,
    #[serde(default = "default_scale_down_cpu")]
    pub scale_down_cpu: f64,
    #[serde(default = "default_scale_down_mem")]
    pub scale_down_mem: f64,
    #[serde(default = "default_high_latency_ms")]
    pub high_latency_ms: u64,
    /// Error-rate percent that opens the circuit.
    #[serde(default = "default_circuit_threshold")]
    pub circuit_threshold: f64,
    /// Consecutive qualifying samples required for a transition.
    #[serde(default = "default_hysteresis")]
    pub hysteresis: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_emergency_mem")]
    pub emergency_mem: f64,
    /// Window over which client stats are aggregated.
    #[serde(default = "default_stats_window_secs")]
    pub stats_window_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: default_sample_interval_secs(),
            high_watermark: default_high_watermark(),
            scale_up_max_error_rate: default_scale_up_max_err(),
            scale_up_max_cpu: default_scale_up_max_cpu(),
            scale_down_cpu: default_scale_down_cpu(),
            scale_down_mem: default_scale_down_mem(),
            high_latency_ms: default_high_latency_ms(),
            circuit_threshold: default_circuit_threshold(),
            hysteresis: default_hysteresis(),
            cooldown_secs: default_cooldown_secs(),
            max_workers: default_max_workers(),
            emergency_mem: default_emergency_mem(),
            stats_window_secs: default_stats_window_secs(),
        }
    }
}

/// Controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Normal,
    ScaledUp,
    ScaledDown,
    CircuitOpen,
    HalfOpen,
    EmergencyStop,
}

/// One observation of the world.
#[derive(Debug, Clone)]
pub struct Sample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub error_rate: f64,
    pub p95_latency: Duration,
    pub queue_depth: usize,
}

struct ControlState {
    state: ControllerState,
    scale_up_streak: u32,
    scale_down_streak: u32,
    circuit_streak: u32,
    opened_at: Option<Instant>,
    /// Concurrency to restore when the circuit closes again.
    restore_concurrency: usize,
}

/// The adaptive controller.
pub struct AdaptiveController {
    config: ControllerConfig,
    client: Arc<LlmClient>,
    queue: LlmQueue,
    probe: Arc<dyn SystemProbe>,
    control: Mutex<ControlState>,
    manual_stop: AtomicBool,
}

impl AdaptiveController {
    pub fn new(
        config: ControllerConfig,
        client: Arc<LlmClient>,
        queue: LlmQueue,
        probe: Arc<dyn SystemProbe>,
    ) -> Self {
        let restore = queue.concurrency().max(1);
        Self {
            config,
            client,
            queue,
            probe,
            control: Mutex::new(ControlState {
                state: ControllerState::Normal,
                scale_up_streak: 0,
                scale_down_streak: 0,
                circuit_streak: 0,
                opened_at: None,
                restore_concurrency: restore,
            }),
            manual_stop: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.control.lock().expect("control poisoned").state
    }

    /// Manual emergency stop: zero concurrency, in-flight cancelled.
    pub fn emergency_stop(&self) {
        self.manual_stop.store(true, Ordering::SeqCst);
        let mut control = self.control.lock().expect("control poisoned");
        control.state = ControllerState::EmergencyStop;
        drop(control);
        self.queue.set_concurrency(0);
        self.queue.cancel_inflight();
        warn!("manual emergency stop engaged");
    }

    /// Release a manual emergency stop.
    pub fn resume(&self) {
        self.manual_stop.store(false, Ordering::SeqCst);
        let mut control = self.control.lock().expect("control poisoned");
        control.state = ControllerState::Normal;
        control.scale_up_streak = 0;
        control.scale_down_streak = 0;
        control.circuit_streak = 0;
        let restore = control.restore_concurrency;
        drop(control);
        self.queue.set_concurrency(restore);
        info!(concurrency = restore, "controller resumed");
    }

    /// Sampling loop; runs until cancelled.
    pub async fn run(&self, cancel: CancelToken) {
        info!("adaptive controller started");
        let interval = Duration::from_secs(self.config.sample_interval_secs);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => break,
            }
            let sample = self.take_sample();
            self.step(&sample);
        }
        info!("adaptive controller stopped");
    }

    fn take_sample(&self) -> Sample {
        let stats = self
            .client
            .window_stats(Duration::from_secs(self.config.stats_window_secs));
        Sample {
            cpu_percent: self.probe.cpu_percent(),
            memory_percent: self.probe.memory_percent(),
            error_rate: stats.error_rate,
            p95_latency: stats.p95_latency,
            queue_depth: self.queue.depth(),
        }
    }

    /// Evaluate one sample. Public so tests can drive the state
    /// machine deterministically.
    pub fn step(&self, sample: &Sample) {
        let mut control = self.control.lock().expect("control poisoned");

        // Emergency stop dominates everything else.
        if self.manual_stop.load(Ordering::SeqCst) {
            return;
        }
        if sample.memory_percent > self.config.emergency_mem {
            if control.state != ControllerState::EmergencyStop {
                warn!(
                    mem = sample.memory_percent,
                    "host memory critical, emergency stop"
                );
                control.state = ControllerState::EmergencyStop;
                drop(control);
                self.queue.set_concurrency(0);
                self.queue.cancel_inflight();
            }
            return;
        }
        if control.state == ControllerState::EmergencyStop {
            // Automatic stop releases once memory recovers.
            control.state = ControllerState::Normal;
            let restore = control.restore_concurrency;
            drop(control);
            self.queue.set_concurrency(restore);
            info!("emergency condition cleared, resuming");
            return;
        }

        // Circuit breaker cycle.
        match control.state {
            ControllerState::CircuitOpen => {
                let cooled = control
                    .opened_at
                    .map(|t| t.elapsed() >= Duration::from_secs(self.config.cooldown_secs))
                    .unwrap_or(true);
                if cooled {
                    info!("circuit half-open, allowing one probe");
                    control.state = ControllerState::HalfOpen;
                    drop(control);
                    self.queue.set_concurrency(1);
                }
                return;
            }
            ControllerState::HalfOpen => {
                if sample.error_rate >= self.config.circuit_threshold {
                    warn!(err = sample.error_rate, "half-open probe failed, reopening");
                    control.state = ControllerState::CircuitOpen;
                    control.opened_at = Some(Instant::now());
                    drop(control);
                    self.queue.set_concurrency(0);
                } else if sample.error_rate < self.config.scale_up_max_error_rate {
                    info!("half-open probe healthy, closing circuit");
                    control.state = ControllerState::Normal;
                    control.circuit_streak = 0;
                    let restore = control.restore_concurrency;
                    drop(control);
                    self.queue.set_concurrency(restore);
                }
                return;
            }
            _ => {}
        }

        if sample.error_rate >= self.config.circuit_threshold {
            control.circuit_streak += 1;
            if control.circuit_streak >= self.config.hysteresis {
                warn!(err = sample.error_rate, "error rate sustained, circuit open");
                control.state = ControllerState::CircuitOpen;
                control.opened_at = Some(Instant::now());
                control.restore_concurrency = self.queue.concurrency().max(1);
                drop(control);
                self.queue.set_concurrency(0);
                return;
            }
        } else {
            control.circuit_streak = 0;
        }

        // Scale-down has priority over scale-up.
        let high_latency = sample.p95_latency >= Duration::from_millis(self.config.high_latency_ms);
        let overloaded = sample.cpu_percent > self.config.scale_down_cpu
            || sample.memory_percent > self.config.scale_down_mem
            || high_latency;
        if overloaded {
            control.scale_up_streak = 0;
            control.scale_down_streak += 1;
            if control.scale_down_streak >= self.config.hysteresis {
                control.scale_down_streak = 0;
                let current = self.queue.concurrency();
                if current > 1 {
                    control.state = ControllerState::ScaledDown;
                    control.restore_concurrency = current - 1;
                    drop(control);
                    self.queue.set_concurrency(current - 1);
                }
            }
            return;
        }
        control.scale_down_streak = 0;

        let can_grow = sample.queue_depth > self.config.high_watermark
            && sample.error_rate < self.config.scale_up_max_error_rate
            && sample.cpu_percent < self.config.scale_up_max_cpu;
        if can_grow {
            control.scale_up_streak += 1;
            if control.scale_up_streak >= self.config.hysteresis {
                control.scale_up_streak = 0;
                let current = self.queue.concurrency();
                if current < self.config.max_workers {
                    control.state = ControllerState::ScaledUp;
                    control.restore_concurrency = current + 1;
                    drop(control);
                    self.queue.set_concurrency(current + 1);
                }
            }
            return;
        }
        control.scale_up_streak = 0;
        if matches!(
            control.state,
            ControllerState::ScaledUp | ControllerState::ScaledDown
        ) {
            control.state = ControllerState::Normal;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::LlmConfig;

    fn setup(initial_concurrency: usize) -> (AdaptiveController, LlmQueue, Arc<StaticProbe>) {
        let client = Arc::new(
            LlmClient::new(LlmConfig {
                endpoint: "http://127.0.0.1:9".into(),
                ..LlmConfig::default()
            })
            .unwrap(),
        );
        let queue = LlmQueue::new(client.clone(), initial_concurrency, Duration::from_secs(60));
        let probe = Arc::new(StaticProbe::new(20.0, 40.0));
        let controller = AdaptiveController::new(
            ControllerConfig {
                hysteresis: 2,
                cooldown_secs: 0,
                ..ControllerConfig::default()
            },
            client,
            queue.clone(),
            probe.clone(),
        );
        (controller, queue, probe)
    }

    fn healthy_busy_sample() -> Sample {
        Sample {
            cpu_percent: 20.0,
            memory_percent: 40.0,
            error_rate: 0.0,
            p95_latency: Duration::from_millis(200),
            queue_depth: 50,
        }
    }

    #[tokio::test]
    async fn test_scale_up_requires_hysteresis() {
        let (controller, queue, _probe) = setup(2);
        controller.step(&healthy_busy_sample());
        assert_eq!(queue.concurrency(), 2, "one sample must not scale");
        controller.step(&healthy_busy_sample());
        assert_eq!(queue.concurrency(), 3);
        assert_eq!(controller.state(), ControllerState::ScaledUp);
    }

    #[tokio::test]
    async fn test_scale_up_capped_at_max_workers() {
        let (controller, queue, _probe) = setup(8);
        for _ in 0..10 {
            controller.step(&healthy_busy_sample());
        }
        assert_eq!(queue.concurrency(), 8);
    }

    #[tokio::test]
    async fn test_scale_down_on_cpu_pressure() {
        let (controller, queue, _probe) = setup(4);
        let hot = Sample {
            cpu_percent: 95.0,
            ..healthy_busy_sample()
        };
        controller.step(&hot);
        controller.step(&hot);
        assert_eq!(queue.concurrency(), 3);
        assert_eq!(controller.state(), ControllerState::ScaledDown);
    }

    #[tokio::test]
    async fn test_scale_down_floor_is_one() {
        let (controller, queue, _probe) = setup(1);
        let hot = Sample {
            cpu_percent: 95.0,
            ..healthy_busy_sample()
        };
        for _ in 0..6 {
            controller.step(&hot);
        }
        assert_eq!(queue.concurrency(), 1);
    }

    #[tokio::test]
    async fn test_circuit_opens_then_half_open_then_closes() {
        let (controller, queue, _probe) = setup(4);
        let failing = Sample {
            error_rate: 80.0,
            ..healthy_busy_sample()
        };

        controller.step(&failing);
        assert_ne!(controller.state(), ControllerState::CircuitOpen);
        controller.step(&failing);
        assert_eq!(controller.state(), ControllerState::CircuitOpen);
        assert_eq!(queue.concurrency(), 0);

        // Submissions rejected while open.
        let task = crate::llm::queue::LlmTask::new(
            crate::llm::queue::LlmTaskType::Generate,
            crate::scheduler::queue::TaskPriority::Normal,
            serde_json::json!({ "prompt": "p" }),
        );
        assert!(matches!(
            queue.submit(task),
            Err(crate::error::AtlasError::CircuitOpen)
        ));

        // Cooldown is zero: next sample moves to half-open with one
        // probe slot.
        controller.step(&healthy_busy_sample());
        assert_eq!(controller.state(), ControllerState::HalfOpen);
        assert_eq!(queue.concurrency(), 1);

        // Healthy sample closes the circuit and restores concurrency.
        controller.step(&Sample {
            error_rate: 0.0,
            ..healthy_busy_sample()
        });
        assert_eq!(controller.state(), ControllerState::Normal);
        assert_eq!(queue.concurrency(), 4);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let (controller, queue, _probe) = setup(4);
        let failing = Sample {
            error_rate: 80.0,
            ..healthy_busy_sample()
        };
        controller.step(&failing);
        controller.step(&failing);
        controller.step(&healthy_busy_sample());
        assert_eq!(controller.state(), ControllerState::HalfOpen);

        controller.step(&failing);
        assert_eq!(controller.state(), ControllerState::CircuitOpen);
        assert_eq!(queue.concurrency(), 0);
    }

    #[tokio::test]
    async fn test_memory_emergency_stop_and_recovery() {
        let (controller, queue, _probe) = setup(4);
        controller.step(&Sample {
            memory_percent: 98.5,
            ..healthy_busy_sample()
        });
        assert_eq!(controller.state(), ControllerState::EmergencyStop);
        assert_eq!(queue.concurrency(), 0);

        controller.step(&Sample {
            memory_percent: 50.0,
            ..healthy_busy_sample()
        });
        assert_eq!(controller.state(), ControllerState::Normal);
        assert!(queue.concurrency() >= 1);
    }

    #[tokio::test]
    async fn test_manual_emergency_stop_sticks_until_resume() {
        let (controller, queue, _probe) = setup(4);
        controller.emergency_stop();
        assert_eq!(queue.concurrency(), 0);

        // Samples do not override a manual stop.
        controller.step(&healthy_busy_sample());
        assert_eq!(controller.state(), ControllerState::EmergencyStop);
        assert_eq!(queue.concurrency(), 0);

        controller.resume();
        assert_eq!(controller.state(), ControllerState::Normal);
        assert!(queue.concurrency() >= 1);
    }

    #[test]
    fn test_static_probe() {
        let probe = StaticProbe::new(10.0, 20.0);
        assert_eq!(probe.cpu_percent(), 10.0);
        probe.set(77.0, 88.0);
        assert_eq!(probe.cpu_percent(), 77.0);
        assert_eq!(probe.memory_percent(), 88.0);
    }
}
