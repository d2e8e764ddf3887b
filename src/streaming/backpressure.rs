//! Backpressure for the streaming path
//!
//! Before each chunk is requested the gate checks the probe. While usage is
//! above the memory limit it waits with exponential backoff and jitter,
//! giving up after `backpressure_max_retries` waits or once
//! `backpressure_timeout` has elapsed.

use crate::cancel::CancelHandle;
use crate::config::EngineConfig;
use crate::memory::{MemoryProbe, MemorySample};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const INITIAL_DELAY: Duration = Duration::from_millis(10);
const JITTER_FACTOR: f64 = 0.25;

/// Exponential backoff with proportional jitter
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub base: f64,
    pub jitter_factor: f64,
}

impl Backoff {
    /// Delay before wait number `attempt` (1-based), without jitter
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let multiplier = self.base.powi(attempt.saturating_sub(1) as i32);
        let delay = Duration::from_secs_f64(self.initial_delay.as_secs_f64() * multiplier);
        delay.min(self.max_delay)
    }

    pub fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let mut rng = rand::rng();
        let jitter_range = delay.as_secs_f64() * self.jitter_factor;
        let jitter = rng.random_range(-jitter_range / 2.0..=jitter_range / 2.0);
        Duration::from_secs_f64((delay.as_secs_f64() + jitter).max(0.0))
    }
}

/// How a backpressure wait ended
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PressureOutcome {
    /// Usage was within the limit, no wait
    Clear,
    /// Usage dropped back under the limit while waiting
    Relieved { waits: u32 },
    /// Retries or time ran out with usage still over the limit
    Exhausted { waits: u32, sample: MemorySample },
    /// Cancellation arrived during the wait
    Cancelled,
}

/// Stalls chunk production while memory is over the limit
pub struct BackpressureGate {
    probe: Arc<dyn MemoryProbe>,
    backoff: Backoff,
    max_retries: u32,
    timeout: Duration,
    events: AtomicU64,
    waited_ms: AtomicU64,
}

impl BackpressureGate {
    pub fn new(probe: Arc<dyn MemoryProbe>, config: &EngineConfig) -> Self {
        Self {
            probe,
            backoff: Backoff {
                initial_delay: INITIAL_DELAY.min(config.backpressure_timeout),
                max_delay: config.backpressure_timeout,
                base: 2.0,
                jitter_factor: JITTER_FACTOR,
            },
            max_retries: config.backpressure_max_retries,
            timeout: config.backpressure_timeout,
            events: AtomicU64::new(0),
            waited_ms: AtomicU64::new(0),
        }
    }

    /// Wait until usage is back under the limit, within the configured bounds
    pub async fn wait_for_capacity(&self, cancel: &CancelHandle) -> PressureOutcome {
        let sample = self.probe.sample();
        if !sample.over_limit() {
            return PressureOutcome::Clear;
        }

        self.events.fetch_add(1, Ordering::Relaxed);
        warn!(
            used = sample.used_bytes,
            limit = sample.limit_bytes,
            "Memory over limit, applying backpressure"
        );

        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut waits = 0;
        let mut last = sample;

        while waits < self.max_retries {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            waits += 1;
            let delay = self
                .backoff
                .apply_jitter(self.backoff.calculate_delay(waits))
                .min(remaining);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    self.record_wait(started);
                    return PressureOutcome::Cancelled;
                }
            }

            last = self.probe.sample();
            if !last.over_limit() {
                self.record_wait(started);
                debug!(waits, "Backpressure relieved");
                return PressureOutcome::Relieved { waits };
            }
        }

        self.record_wait(started);
        PressureOutcome::Exhausted {
            waits,
            sample: last,
        }
    }

    /// Times a wait was entered
    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    /// Total time spent waiting
    pub fn total_wait(&self) -> Duration {
        Duration::from_millis(self.waited_ms.load(Ordering::Relaxed))
    }

    fn record_wait(&self, started: Instant) {
        self.waited_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}
