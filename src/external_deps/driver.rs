//! Contracts for the collaborators the engine drives but does not own.
//!
//! The page driver wraps whatever browser automation stack the caller uses;
//! the engine never touches a DOM directly. Pacing of individual fills and
//! clicks (pre/post delays with variance) is the driver's responsibility.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::external_deps::captcha::{CaptchaChallenge, CaptchaKind};
use crate::modules::proxy::{ProxyConnection, ProxyRecord};

/// Browser cookie as exchanged with the page driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

impl Cookie {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: default_cookie_path(),
            secure: false,
            http_only: false,
        }
    }
}

/// Failures surfaced by the page driver. The text is opaque to the engine and
/// only usable for substring classification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("element '{selector}' not found: {message}")]
    ElementNotFound { selector: String, message: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("browser context unavailable: {0}")]
    ContextUnavailable(String),
    #[error("{0}")]
    Other(String),
}

/// Page automation primitives consumed by the flow executor.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn goto(&self, url: &Url) -> Result<(), DriverError>;
    async fn fill(&self, selector: &str, value: &str) -> Result<(), DriverError>;
    async fn click(&self, selector: &str) -> Result<(), DriverError>;
    async fn wait_for_selector(&self, selector: &str, timeout: Duration)
    -> Result<(), DriverError>;
    async fn is_visible(&self, selector: &str) -> Result<bool, DriverError>;
    async fn get_attribute(
        &self,
        selector: &str,
        name: &str,
    ) -> Result<Option<String>, DriverError>;
    async fn reload(&self) -> Result<(), DriverError>;
    async fn cookies(&self) -> Result<Vec<Cookie>, DriverError>;
    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<(), DriverError>;

    /// URL of the page currently loaded.
    async fn current_url(&self) -> Result<Url, DriverError>;

    /// Route subsequent traffic through `proxy`. Drivers that bind the proxy
    /// at launch time may ignore this.
    async fn apply_proxy(&self, _proxy: &ProxyConnection) -> Result<(), DriverError> {
        Ok(())
    }

    async fn wait_for_timeout(&self, duration: Duration) -> Result<(), DriverError> {
        tokio::time::sleep(duration).await;
        Ok(())
    }

    /// Hand a solved captcha token back to the page.
    async fn apply_captcha_token(
        &self,
        challenge: &CaptchaChallenge,
        token: &str,
    ) -> Result<(), DriverError> {
        self.fill(response_field_selector(challenge.kind), token)
            .await
    }
}

/// Hidden form field each widget reads its token from.
pub fn response_field_selector(kind: CaptchaKind) -> &'static str {
    match kind {
        CaptchaKind::RecaptchaV2 | CaptchaKind::RecaptchaV3 => "textarea[name='g-recaptcha-response']",
        CaptchaKind::HCaptcha => "textarea[name='h-captcha-response']",
        CaptchaKind::Turnstile => "input[name='cf-turnstile-response']",
    }
}

/// Opens throwaway browsing contexts, used to harvest fresh session cookies.
#[async_trait]
pub trait ContextFactory: Send + Sync {
    async fn open(
        &self,
        proxy: Option<&ProxyConnection>,
    ) -> Result<Box<dyn PageDriver>, DriverError>;
}

/// Optional restock signal consulted by out-of-stock recovery.
#[async_trait]
pub trait InventoryMonitor: Send + Sync {
    /// Wait up to `timeout` for the site to report stock again. `Ok(true)`
    /// means stock was observed.
    async fn wait_for_restock(&self, site_id: &str, timeout: Duration)
    -> Result<bool, DriverError>;
}

/// External reachability prober used by proxy health sweeps.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Round-trip latency through `proxy`, or the failure.
    async fn probe(&self, proxy: &ProxyRecord) -> Result<Duration, DriverError>;
}
