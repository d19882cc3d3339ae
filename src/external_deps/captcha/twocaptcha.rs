use async_trait::async_trait;
use serde::Deserialize;

use super::{
    CaptchaChallenge, CaptchaConfig, CaptchaError, CaptchaKind, CaptchaProvider, PollStatus,
    http_client,
};

const DEFAULT_BASE_URL: &str = "https://2captcha.com";

/// Adapter for the TwoCaptcha service (`in.php` / `res.php` API).
#[derive(Debug, Clone)]
pub struct TwoCaptchaProvider {
    pub api_key: String,
    pub config: CaptchaConfig,
    base_url: String,
    http: reqwest::Client,
}

impl TwoCaptchaProvider {
    pub fn new(api_key: impl Into<String>) -> Result<Self, CaptchaError> {
        Self::with_config(api_key, CaptchaConfig::default())
    }

    pub fn with_config(
        api_key: impl Into<String>,
        config: CaptchaConfig,
    ) -> Result<Self, CaptchaError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(CaptchaError::Configuration("twocaptcha api key is empty".into()));
        }
        let http = http_client(&config)?;
        Ok(Self {
            api_key,
            config,
            base_url: DEFAULT_BASE_URL.to_string(),
            http,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.trim_end_matches('/'))
    }
}

/// Envelope returned by both endpoints when `json=1` is set.
#[derive(Debug, Deserialize)]
struct LegacyResponse {
    status: u8,
    request: String,
}

pub(crate) fn submit_form(challenge: &CaptchaChallenge, api_key: &str) -> Vec<(String, String)> {
    let mut form = vec![
        ("key".to_string(), api_key.to_string()),
        ("json".to_string(), "1".to_string()),
        ("pageurl".to_string(), challenge.page_url.to_string()),
    ];

    match challenge.kind {
        CaptchaKind::RecaptchaV2 => {
            form.push(("method".into(), "userrecaptcha".into()));
            form.push(("googlekey".into(), challenge.site_key.clone()));
        }
        CaptchaKind::RecaptchaV3 => {
            form.push(("method".into(), "userrecaptcha".into()));
            form.push(("version".into(), "v3".into()));
            form.push(("googlekey".into(), challenge.site_key.clone()));
            form.push((
                "action".into(),
                challenge.action.clone().unwrap_or_else(|| "verify".into()),
            ));
            form.push(("min_score".into(), "0.7".into()));
        }
        CaptchaKind::HCaptcha => {
            form.push(("method".into(), "hcaptcha".into()));
            form.push(("sitekey".into(), challenge.site_key.clone()));
        }
        CaptchaKind::Turnstile => {
            form.push(("method".into(), "turnstile".into()));
            form.push(("sitekey".into(), challenge.site_key.clone()));
        }
    }

    form
}

fn parse_submit(body: LegacyResponse) -> Result<String, CaptchaError> {
    if body.status == 1 {
        Ok(body.request)
    } else {
        Err(CaptchaError::Rejected {
            provider: "twocaptcha".into(),
            reason: body.request,
        })
    }
}

fn parse_poll(body: LegacyResponse) -> PollStatus {
    if body.status == 1 {
        return PollStatus::Ready(body.request);
    }
    match body.request.as_str() {
        "CAPCHA_NOT_READY" | "CAPTCHA_NOT_READY" => PollStatus::NotReady,
        _ => PollStatus::Failed(body.request),
    }
}

#[async_trait]
impl CaptchaProvider for TwoCaptchaProvider {
    fn name(&self) -> &str {
        "twocaptcha"
    }

    fn config(&self) -> &CaptchaConfig {
        &self.config
    }

    async fn submit(&self, challenge: &CaptchaChallenge) -> Result<String, CaptchaError> {
        let body: LegacyResponse = self
            .http
            .post(self.endpoint("in.php"))
            .form(&submit_form(challenge, &self.api_key))
            .send()
            .await?
            .json()
            .await?;
        parse_submit(body)
    }

    async fn poll(&self, request_id: &str) -> Result<PollStatus, CaptchaError> {
        let body: LegacyResponse = self
            .http
            .get(self.endpoint("res.php"))
            .query(&[
                ("key", self.api_key.as_str()),
                ("action", "get"),
                ("id", request_id),
                ("json", "1"),
            ])
            .send()
            .await?
            .json()
            .await?;
        Ok(parse_poll(body))
    }
}
