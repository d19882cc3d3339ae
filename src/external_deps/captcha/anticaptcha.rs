use async_trait::async_trait;
use serde_json::{Value, json};

use super::task_api::TaskApiClient;
use super::{
    CaptchaChallenge, CaptchaConfig, CaptchaError, CaptchaKind, CaptchaProvider, PollStatus,
    http_client,
};

const DEFAULT_BASE_URL: &str = "https://api.anti-captcha.com";

/// Adapter for the AntiCaptcha service.
#[derive(Debug, Clone)]
pub struct AntiCaptchaProvider {
    pub config: CaptchaConfig,
    client: TaskApiClient,
}

impl AntiCaptchaProvider {
    pub fn new(api_key: impl Into<String>) -> Result<Self, CaptchaError> {
        Self::with_config(api_key, CaptchaConfig::default())
    }

    pub fn with_config(
        api_key: impl Into<String>,
        config: CaptchaConfig,
    ) -> Result<Self, CaptchaError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(CaptchaError::Configuration("anticaptcha api key is empty".into()));
        }
        let http = http_client(&config)?;
        Ok(Self {
            config,
            client: TaskApiClient {
                provider: "anticaptcha",
                base_url: DEFAULT_BASE_URL.to_string(),
                api_key,
                http,
            },
        })
    }

    /// Point the adapter at a different API host (self-hosted relays, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.client.base_url = base_url.into();
        self
    }
}

pub(crate) fn task_payload(challenge: &CaptchaChallenge) -> Value {
    let url = challenge.page_url.as_str();
    let key = challenge.site_key.as_str();
    match challenge.kind {
        CaptchaKind::RecaptchaV2 => json!({
            "type": "RecaptchaV2TaskProxyless",
            "websiteURL": url,
            "websiteKey": key,
        }),
        CaptchaKind::RecaptchaV3 => json!({
            "type": "RecaptchaV3TaskProxyless",
            "websiteURL": url,
            "websiteKey": key,
            "minScore": 0.7,
            "pageAction": challenge.action.as_deref().unwrap_or("verify"),
        }),
        CaptchaKind::HCaptcha => json!({
            "type": "HCaptchaTaskProxyless",
            "websiteURL": url,
            "websiteKey": key,
        }),
        CaptchaKind::Turnstile => json!({
            "type": "TurnstileTaskProxyless",
            "websiteURL": url,
            "websiteKey": key,
        }),
    }
}

#[async_trait]
impl CaptchaProvider for AntiCaptchaProvider {
    fn name(&self) -> &str {
        "anticaptcha"
    }

    fn config(&self) -> &CaptchaConfig {
        &self.config
    }

    async fn submit(&self, challenge: &CaptchaChallenge) -> Result<String, CaptchaError> {
        self.client.create_task(task_payload(challenge)).await
    }

    async fn poll(&self, request_id: &str) -> Result<PollStatus, CaptchaError> {
        self.client.task_result(request_id).await
    }
}
