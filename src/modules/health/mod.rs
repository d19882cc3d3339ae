//! Resource health scoring.
//!
//! Blends the observed success rate with average latency into a single
//! `[0, 1]` score. Shared by the proxy pool and usable for any other resource
//! that reports success/failure outcomes with latency samples.

use std::collections::VecDeque;
use std::time::Duration;

/// Latency ceiling beyond which latency contributes nothing to the score.
pub const DEFAULT_MAX_ACCEPTABLE_LATENCY_MS: f64 = 5000.0;

/// Number of latency samples retained per resource.
pub const DEFAULT_LATENCY_WINDOW: usize = 50;

const SUCCESS_WEIGHT: f64 = 0.7;
const LATENCY_WEIGHT: f64 = 0.3;

/// Tunables for [`health_score`] and [`LatencyWindow`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthConfig {
    pub max_acceptable_latency_ms: f64,
    pub latency_window: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_acceptable_latency_ms: DEFAULT_MAX_ACCEPTABLE_LATENCY_MS,
            latency_window: DEFAULT_LATENCY_WINDOW,
        }
    }
}

/// Success rate, optimistic (`1.0`) when nothing was observed yet.
pub fn success_rate(success_count: u64, failure_count: u64) -> f64 {
    let total = success_count + failure_count;
    if total == 0 {
        1.0
    } else {
        success_count as f64 / total as f64
    }
}

/// Compute the health score of a resource.
///
/// `0.7 * success_rate + 0.3 * clamp(1 - avg_latency / max_acceptable, 0, 1)`,
/// clamped to `[0, 1]`. Non-finite or non-positive ceilings make the latency
/// term contribute zero.
pub fn health_score(
    success_count: u64,
    failure_count: u64,
    avg_latency_ms: f64,
    max_acceptable_ms: f64,
) -> f64 {
    let rate = success_rate(success_count, failure_count);

    let latency_term = if max_acceptable_ms.is_finite() && max_acceptable_ms > 0.0 {
        let latency = if avg_latency_ms.is_finite() {
            avg_latency_ms.max(0.0)
        } else {
            max_acceptable_ms
        };
        (1.0 - latency / max_acceptable_ms).clamp(0.0, 1.0)
    } else {
        0.0
    };

    (SUCCESS_WEIGHT * rate + LATENCY_WEIGHT * latency_term).clamp(0.0, 1.0)
}

/// Rolling window of the most recent latency samples.
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, dropping the oldest once the window is full.
    pub fn push(&mut self, sample: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean of the retained samples in milliseconds, `0.0` when empty.
    pub fn average_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let total: f64 = self
            .samples
            .iter()
            .map(|sample| sample.as_secs_f64() * 1000.0)
            .sum();
        total / self.samples.len() as f64
    }
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_WINDOW)
    }
}
