use async_trait::async_trait;
use serde_json::{Value, json};

use super::task_api::TaskApiClient;
use super::{
    CaptchaChallenge, CaptchaConfig, CaptchaError, CaptchaKind, CaptchaProvider, PollStatus,
    http_client,
};

const DEFAULT_BASE_URL: &str = "https://api.capsolver.com";

/// Adapter for the CapSolver service.
#[derive(Debug, Clone)]
pub struct CapSolverProvider {
    pub config: CaptchaConfig,
    client: TaskApiClient,
}

impl CapSolverProvider {
    pub fn new(api_key: impl Into<String>) -> Result<Self, CaptchaError> {
        Self::with_config(api_key, CaptchaConfig::default())
    }

    pub fn with_config(
        api_key: impl Into<String>,
        config: CaptchaConfig,
    ) -> Result<Self, CaptchaError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(CaptchaError::Configuration("capsolver api key is empty".into()));
        }
        let http = http_client(&config)?;
        Ok(Self {
            config,
            client: TaskApiClient {
                provider: "capsolver",
                base_url: DEFAULT_BASE_URL.to_string(),
                api_key,
                http,
            },
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.client.base_url = base_url.into();
        self
    }
}

/// CapSolver has no hCaptcha task type; those challenges are refused before
/// anything is sent.
pub(crate) fn task_payload(challenge: &CaptchaChallenge) -> Option<Value> {
    let url = challenge.page_url.as_str();
    let key = challenge.site_key.as_str();
    let payload = match challenge.kind {
        CaptchaKind::RecaptchaV2 => json!({
            "type": "ReCaptchaV2TaskProxyLess",
            "websiteURL": url,
            "websiteKey": key,
        }),
        CaptchaKind::RecaptchaV3 => json!({
            "type": "ReCaptchaV3TaskProxyLess",
            "websiteURL": url,
            "websiteKey": key,
            "pageAction": challenge.action.as_deref().unwrap_or("verify"),
        }),
        CaptchaKind::Turnstile => json!({
            "type": "AntiTurnstileTaskProxyLess",
            "websiteURL": url,
            "websiteKey": key,
        }),
        CaptchaKind::HCaptcha => return None,
    };
    Some(payload)
}

#[async_trait]
impl CaptchaProvider for CapSolverProvider {
    fn name(&self) -> &str {
        "capsolver"
    }

    fn config(&self) -> &CaptchaConfig {
        &self.config
    }

    async fn submit(&self, challenge: &CaptchaChallenge) -> Result<String, CaptchaError> {
        let payload = task_payload(challenge).ok_or_else(|| CaptchaError::UnsupportedKind {
            provider: self.name().to_string(),
            kind: challenge.kind,
        })?;
        self.client.create_task(payload).await
    }

    async fn poll(&self, request_id: &str) -> Result<PollStatus, CaptchaError> {
        self.client.task_result(request_id).await
    }
}
