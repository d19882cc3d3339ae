//! Human-like pacing between flow steps.
//!
//! Delays grow while steps keep failing and relax again as they succeed, so
//! a struggling checkout slows down instead of hammering the site. The
//! failure streak belongs to a single execution; policies themselves are
//! stateless and shared.

use std::cmp::Ordering;
use std::time::Duration;

use crate::flow::Step;

pub const DEFAULT_BASE_DELAY_MS: u64 = 800;
pub const DEFAULT_VARIANCE_PCT: f64 = 0.35;

/// Outcome fed back after each step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingFeedback {
    Success,
    Failure,
    RateLimited,
}

/// Recent failures of one execution. Rate limits weigh double and each
/// success pays one back.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FailureStreak(u32);

impl FailureStreak {
    pub fn register(&mut self, feedback: PacingFeedback) {
        self.0 = match feedback {
            PacingFeedback::Success => self.0.saturating_sub(1),
            PacingFeedback::Failure => self.0.saturating_add(1),
            PacingFeedback::RateLimited => self.0.saturating_add(2),
        };
    }

    pub fn failures(self) -> u32 {
        self.0
    }
}

/// Decides how long to pause before the next step.
pub trait DelayPolicy: Send + Sync {
    fn delay_before(&self, step: &Step, streak: FailureStreak) -> Duration;
}

/// Never waits. Useful for tests and headless replay.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDelay;

impl DelayPolicy for NoDelay {
    fn delay_before(&self, _step: &Step, _streak: FailureStreak) -> Duration {
        Duration::ZERO
    }
}

/// Jittered delay around a base, scaled by step kind and recent failures.
#[derive(Debug, Clone)]
pub struct HumanPacing {
    base_delay_ms: u64,
    min_delay_ms: u64,
    max_delay_ms: u64,
    variance_pct: f64,
}

impl HumanPacing {
    pub fn new(base_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            min_delay_ms: base_delay_ms / 2,
            max_delay_ms: base_delay_ms.saturating_mul(3),
            variance_pct: DEFAULT_VARIANCE_PCT,
        }
    }

    pub fn with_bounds(mut self, min_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.min_delay_ms = min_delay_ms.min(max_delay_ms);
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_variance(mut self, variance_pct: f64) -> Self {
        self.variance_pct = variance_pct.clamp(0.0, 1.0);
        self
    }

    /// Steps that type or submit forms take longer for a person; waits on
    /// the page already consume time of their own.
    fn step_multiplier(step: &Step) -> f64 {
        match step {
            Step::Fill { .. } | Step::FillShipping(_) | Step::CompletePayment(_) => 1.35,
            Step::Goto { .. } => 1.1,
            Step::WaitForSelector { .. } | Step::WaitForTimeout { .. } => 0.0,
            _ => 1.0,
        }
    }
}

impl Default for HumanPacing {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY_MS)
    }
}

impl DelayPolicy for HumanPacing {
    fn delay_before(&self, step: &Step, streak: FailureStreak) -> Duration {
        let multiplier = Self::step_multiplier(step);
        if multiplier == 0.0 || self.base_delay_ms == 0 {
            return Duration::ZERO;
        }

        let mut delay = self.base_delay_ms as f64 * multiplier;
        match streak.failures().cmp(&2) {
            Ordering::Less => {}
            Ordering::Equal => delay *= 1.5,
            Ordering::Greater => delay *= 2.0,
        }

        let variance = delay * self.variance_pct;
        let jitter = rand::random::<f64>() * variance - (variance / 2.0);
        delay = (delay + jitter).clamp(self.min_delay_ms as f64, self.max_delay_ms as f64);
        Duration::from_millis(delay.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steady(base_delay_ms: u64) -> HumanPacing {
        HumanPacing::new(base_delay_ms)
            .with_variance(0.0)
            .with_bounds(0, 10_000)
    }

    #[test]
    fn delays_stay_within_bounds() {
        let pacing = HumanPacing::new(1000).with_bounds(400, 2500);
        let mut streak = FailureStreak::default();
        for round in 0..200 {
            if round % 50 == 0 {
                streak.register(PacingFeedback::RateLimited);
            }
            let delay = pacing.delay_before(&Step::click("#buy"), streak);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(2500));
        }
    }

    #[test]
    fn waits_are_not_paced() {
        let pacing = HumanPacing::default();
        assert_eq!(
            pacing.delay_before(&Step::WaitForTimeout { ms: 500 }, FailureStreak::default()),
            Duration::ZERO
        );
    }

    #[test]
    fn failures_slow_things_down_and_successes_recover() {
        let pacing = steady(1000);
        let click = Step::click("#buy");
        let mut streak = FailureStreak::default();
        let calm = pacing.delay_before(&click, streak);
        assert_eq!(calm, Duration::from_millis(1000));

        streak.register(PacingFeedback::RateLimited);
        assert_eq!(pacing.delay_before(&click, streak), Duration::from_millis(1500));
        streak.register(PacingFeedback::Failure);
        assert_eq!(pacing.delay_before(&click, streak), Duration::from_millis(2000));

        for _ in 0..3 {
            streak.register(PacingFeedback::Success);
        }
        assert_eq!(streak.failures(), 0);
        assert_eq!(pacing.delay_before(&click, streak), calm);
    }

    #[test]
    fn streaks_are_independent_per_execution() {
        let pacing = steady(1000);
        let click = Step::click("#buy");
        let mut struggling = FailureStreak::default();
        for _ in 0..3 {
            struggling.register(PacingFeedback::Failure);
        }
        let fresh = FailureStreak::default();

        assert_eq!(pacing.delay_before(&click, struggling), Duration::from_millis(2000));
        assert_eq!(pacing.delay_before(&click, fresh), Duration::from_millis(1000));
    }
}
