//! Captcha provider integrations.
//!
//! These adapters provide a unified interface for third-party captcha
//! solvers such as AntiCaptcha, CapSolver, and TwoCaptcha. Every provider
//! speaks the same two-phase discipline (submit a task, then poll for the
//! token on a fixed interval up to a fixed ceiling); they only differ in
//! request and response schema.

mod anticaptcha;
mod capsolver;
pub mod orchestrator;
mod task_api;
mod twocaptcha;

pub use anticaptcha::AntiCaptchaProvider;
pub use capsolver::CapSolverProvider;
pub use orchestrator::{CaptchaOrchestrator, ProviderStats};
pub use twocaptcha::TwoCaptchaProvider;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 30;

/// High-level configuration that controls captcha solving behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptchaConfig {
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    pub request_timeout: Duration,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl CaptchaConfig {
    /// Upper bound on how long polling may take.
    pub fn poll_budget(&self) -> Duration {
        self.poll_interval * self.max_poll_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptchaKind {
    RecaptchaV2,
    RecaptchaV3,
    HCaptcha,
    Turnstile,
}

impl fmt::Display for CaptchaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CaptchaKind::RecaptchaV2 => "recaptcha_v2",
            CaptchaKind::RecaptchaV3 => "recaptcha_v3",
            CaptchaKind::HCaptcha => "hcaptcha",
            CaptchaKind::Turnstile => "turnstile",
        };
        f.write_str(label)
    }
}

/// One captcha instance found on a page.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptchaChallenge {
    pub kind: CaptchaKind,
    pub site_key: String,
    pub page_url: Url,
    pub action: Option<String>,
    pub data: HashMap<String, String>,
}

impl CaptchaChallenge {
    pub fn new(kind: CaptchaKind, site_key: impl Into<String>, page_url: Url) -> Self {
        Self {
            kind,
            site_key: site_key.into(),
            page_url,
            action: None,
            data: HashMap::new(),
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn insert_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Outcome of one solve attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptchaSolution {
    pub success: bool,
    pub token: Option<String>,
    pub error: Option<String>,
    pub provider: String,
    pub elapsed: Duration,
}

impl CaptchaSolution {
    pub fn solved(token: impl Into<String>, provider: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: true,
            token: Some(token.into()),
            error: None,
            provider: provider.into(),
            elapsed,
        }
    }

    pub fn failed(error: impl Into<String>, provider: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: false,
            token: None,
            error: Some(error.into()),
            provider: provider.into(),
            elapsed,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed.as_millis().min(u64::MAX as u128) as u64
    }
}

/// One poll response, normalised across providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Ready(String),
    NotReady,
    Failed(String),
}

/// Common result type returned by captcha providers.
pub type CaptchaResult = Result<CaptchaSolution, CaptchaError>;

/// Shared interface implemented by captcha vendors.
#[async_trait]
pub trait CaptchaProvider: Send + Sync {
    fn name(&self) -> &str;

    fn config(&self) -> &CaptchaConfig;

    /// Send the challenge; returns the provider's request id. Outright
    /// rejections (bad key, unsupported kind) fail here.
    async fn submit(&self, challenge: &CaptchaChallenge) -> Result<String, CaptchaError>;

    async fn poll(&self, request_id: &str) -> Result<PollStatus, CaptchaError>;

    async fn solve(
        &self,
        challenge: &CaptchaChallenge,
        cancel: &CancellationToken,
    ) -> CaptchaResult {
        let started = Instant::now();
        let request_id = tokio::select! {
            _ = cancel.cancelled() => return Err(CaptchaError::Cancelled),
            submitted = self.submit(challenge) => submitted?,
        };
        log::debug!(
            "{} accepted {} challenge as request {request_id}",
            self.name(),
            challenge.kind
        );
        let token = poll_until_ready(self, &request_id, cancel).await?;
        Ok(CaptchaSolution::solved(token, self.name(), started.elapsed()))
    }
}

/// Poll `request_id` on the provider's fixed interval until a terminal
/// answer arrives, the attempt ceiling is hit, or `cancel` fires.
pub async fn poll_until_ready<P>(
    provider: &P,
    request_id: &str,
    cancel: &CancellationToken,
) -> Result<String, CaptchaError>
where
    P: CaptchaProvider + ?Sized,
{
    let config = provider.config();
    for attempt in 1..=config.max_poll_attempts {
        tokio::select! {
            _ = cancel.cancelled() => return Err(CaptchaError::Cancelled),
            _ = tokio::time::sleep(config.poll_interval) => {}
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => return Err(CaptchaError::Cancelled),
            status = provider.poll(request_id) => status?,
        };

        match status {
            PollStatus::Ready(token) => return Ok(token),
            PollStatus::NotReady => {
                log::trace!(
                    "{} request {request_id} not ready (attempt {attempt}/{})",
                    provider.name(),
                    config.max_poll_attempts
                );
            }
            PollStatus::Failed(reason) => {
                return Err(CaptchaError::PermanentFailure {
                    provider: provider.name().to_string(),
                    reason,
                });
            }
        }
    }

    Err(CaptchaError::Timeout {
        provider: provider.name().to_string(),
        waited: config.poll_budget(),
    })
}

pub(crate) fn http_client(config: &CaptchaConfig) -> Result<reqwest::Client, CaptchaError> {
    reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()
        .map_err(|err| CaptchaError::Configuration(err.to_string()))
}

/// Errors surfaced by captcha providers.
#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("captcha provider misconfigured: {0}")]
    Configuration(String),
    #[error("{provider} rejected the challenge: {reason}")]
    Rejected { provider: String, reason: String },
    #[error("{provider} does not support {kind} challenges")]
    UnsupportedKind { provider: String, kind: CaptchaKind },
    #[error("captcha provider request failed: {0}")]
    Provider(String),
    #[error("captcha provider http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{provider} failed permanently: {reason}")]
    PermanentFailure { provider: String, reason: String },
    #[error("{provider} captcha solving timed out after {waited:?}")]
    Timeout { provider: String, waited: Duration },
    #[error("captcha solving cancelled")]
    Cancelled,
    #[error("no captcha providers configured")]
    NoProviders,
    #[error("all captcha providers failed: {}", summarize(.failures))]
    AllProvidersFailed { failures: Vec<(String, String)> },
}

fn summarize(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(provider, reason)| format!("{provider}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}
