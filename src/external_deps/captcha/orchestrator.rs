//! Ordered fallback across captcha providers with per-provider statistics.
//!
//! Providers are tried in registration order; the first success wins. Stats
//! are kept per provider behind their own lock so concurrent checkouts never
//! contend on unrelated providers. [`CaptchaOrchestrator::best_provider`]
//! ranks providers for reporting only and does not reorder the fallback.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{CaptchaChallenge, CaptchaError, CaptchaProvider, CaptchaResult, CaptchaSolution};

/// Lifetime counters for one provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderStats {
    pub solved: u64,
    pub failed: u64,
    pub avg_response_time_ms: f64,
}

impl ProviderStats {
    pub fn attempts(&self) -> u64 {
        self.solved + self.failed
    }

    pub fn success_rate(&self) -> Option<f64> {
        let attempts = self.attempts();
        (attempts > 0).then(|| self.solved as f64 / attempts as f64)
    }

    fn record_success(&mut self, elapsed: Duration) {
        self.solved += 1;
        let sample = elapsed.as_secs_f64() * 1000.0;
        // Incremental mean over solved attempts.
        self.avg_response_time_ms += (sample - self.avg_response_time_ms) / self.solved as f64;
    }

    fn record_failure(&mut self) {
        self.failed += 1;
    }
}

struct RegisteredProvider {
    provider: Arc<dyn CaptchaProvider>,
    stats: Mutex<ProviderStats>,
}

impl RegisteredProvider {
    fn stats(&self) -> ProviderStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut ProviderStats)) {
        let mut guard = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }
}

/// Shared captcha solving front door.
#[derive(Default)]
pub struct CaptchaOrchestrator {
    providers: Vec<RegisteredProvider>,
}

impl CaptchaOrchestrator {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// Append a provider; registration order is fallback priority.
    pub fn register(&mut self, provider: Arc<dyn CaptchaProvider>) {
        log::debug!(
            "registered captcha provider {} at priority {}",
            provider.name(),
            self.providers.len()
        );
        self.providers.push(RegisteredProvider {
            provider,
            stats: Mutex::new(ProviderStats::default()),
        });
    }

    pub fn with_provider(mut self, provider: Arc<dyn CaptchaProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Try every provider in order until one returns a token.
    ///
    /// Each completed attempt updates that provider's stats exactly once.
    /// Cancellation stops immediately without charging the in-flight provider.
    pub async fn solve(
        &self,
        challenge: &CaptchaChallenge,
        cancel: &CancellationToken,
    ) -> CaptchaResult {
        if self.providers.is_empty() {
            return Err(CaptchaError::NoProviders);
        }

        let mut failures = Vec::with_capacity(self.providers.len());
        for entry in &self.providers {
            let name = entry.provider.name().to_string();
            let started = Instant::now();
            match entry.provider.solve(challenge, cancel).await {
                Ok(solution) if solution.success && solution.token.is_some() => {
                    entry.update(|stats| stats.record_success(solution.elapsed));
                    log::info!(
                        "captcha {} solved by {name} in {}ms",
                        challenge.kind,
                        solution.elapsed_ms()
                    );
                    return Ok(solution);
                }
                Ok(solution) => {
                    let reason = solution
                        .error
                        .unwrap_or_else(|| "provider returned no token".to_string());
                    entry.update(ProviderStats::record_failure);
                    log::warn!("captcha provider {name} failed: {reason}");
                    failures.push((name, reason));
                }
                Err(CaptchaError::Cancelled) => return Err(CaptchaError::Cancelled),
                Err(err) => {
                    entry.update(ProviderStats::record_failure);
                    log::warn!(
                        "captcha provider {name} failed after {:.1}s: {err}",
                        started.elapsed().as_secs_f64()
                    );
                    failures.push((name, err.to_string()));
                }
            }
        }

        Err(CaptchaError::AllProvidersFailed { failures })
    }

    /// Same as [`CaptchaOrchestrator::solve`] but folds exhaustion into a
    /// failed [`CaptchaSolution`].
    pub async fn solve_or_report(
        &self,
        challenge: &CaptchaChallenge,
        cancel: &CancellationToken,
    ) -> CaptchaSolution {
        let started = Instant::now();
        match self.solve(challenge, cancel).await {
            Ok(solution) => solution,
            Err(err) => CaptchaSolution::failed(err.to_string(), "orchestrator", started.elapsed()),
        }
    }

    /// Highest success rate first, faster average on ties. Providers without
    /// observations rank below observed ones; with no observations at all the
    /// first registered provider is returned.
    pub fn best_provider(&self) -> Option<Arc<dyn CaptchaProvider>> {
        let ranked = self
            .providers
            .iter()
            .map(|entry| (entry, entry.stats()))
            .filter(|(_, stats)| stats.attempts() > 0)
            .max_by(|(_, a), (_, b)| compare_stats(a, b));

        match ranked {
            Some((entry, _)) => Some(entry.provider.clone()),
            None => self.providers.first().map(|entry| entry.provider.clone()),
        }
    }

    pub fn stats(&self) -> Vec<(String, ProviderStats)> {
        self.providers
            .iter()
            .map(|entry| (entry.provider.name().to_string(), entry.stats()))
            .collect()
    }

    pub fn stats_for(&self, provider: &str) -> Option<ProviderStats> {
        self.providers
            .iter()
            .find(|entry| entry.provider.name() == provider)
            .map(RegisteredProvider::stats)
    }
}

/// `Greater` means `a` ranks above `b`. `max_by` keeps the last maximum, so
/// exact ties resolve towards the earlier registration by reversing equality.
fn compare_stats(a: &ProviderStats, b: &ProviderStats) -> Ordering {
    let rate_a = a.success_rate().unwrap_or(0.0);
    let rate_b = b.success_rate().unwrap_or(0.0);
    rate_a
        .partial_cmp(&rate_b)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            b.avg_response_time_ms
                .partial_cmp(&a.avg_response_time_ms)
                .unwrap_or(Ordering::Equal)
        })
        .then(Ordering::Greater)
}
