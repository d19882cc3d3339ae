//! Captcha widget detection and clearing on the live page.

use std::time::Duration;

use once_cell::sync::Lazy;
use tokio_util::sync::CancellationToken;

use super::error::StepError;
use super::recovery::bounded;
use crate::external_deps::captcha::{
    CaptchaChallenge, CaptchaError, CaptchaKind, CaptchaSolution,
    orchestrator::CaptchaOrchestrator,
};
use crate::external_deps::driver::{DriverError, PageDriver};

/// Selector marking a captcha widget and where its site key lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaIndicator {
    pub selector: String,
    pub kind: CaptchaKind,
    pub site_key_attribute: String,
    pub action_attribute: Option<String>,
}

impl CaptchaIndicator {
    pub fn new(selector: impl Into<String>, kind: CaptchaKind) -> Self {
        Self {
            selector: selector.into(),
            kind,
            site_key_attribute: "data-sitekey".to_string(),
            action_attribute: None,
        }
    }

    pub fn with_site_key_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.site_key_attribute = attribute.into();
        self
    }

    pub fn with_action_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.action_attribute = Some(attribute.into());
        self
    }
}

static DEFAULT_INDICATORS: Lazy<Vec<CaptchaIndicator>> = Lazy::new(|| {
    vec![
        CaptchaIndicator::new(".cf-turnstile", CaptchaKind::Turnstile)
            .with_action_attribute("data-action"),
        CaptchaIndicator::new(".h-captcha", CaptchaKind::HCaptcha),
        CaptchaIndicator::new(".g-recaptcha[data-size='invisible']", CaptchaKind::RecaptchaV3)
            .with_action_attribute("data-action"),
        CaptchaIndicator::new(".g-recaptcha", CaptchaKind::RecaptchaV2),
    ]
});

/// Widget markers for the common captcha vendors.
pub fn default_indicators() -> &'static [CaptchaIndicator] {
    &DEFAULT_INDICATORS
}

/// First visible captcha on the page, if any. Widgets whose site key cannot
/// be read are skipped.
pub async fn detect_challenge(
    driver: &dyn PageDriver,
    indicators: &[CaptchaIndicator],
) -> Result<Option<CaptchaChallenge>, DriverError> {
    for indicator in indicators {
        if !driver.is_visible(&indicator.selector).await? {
            continue;
        }

        let Some(site_key) = driver
            .get_attribute(&indicator.selector, &indicator.site_key_attribute)
            .await?
            .filter(|key| !key.trim().is_empty())
        else {
            log::warn!(
                "{} widget at '{}' has no {} attribute; skipping",
                indicator.kind,
                indicator.selector,
                indicator.site_key_attribute
            );
            continue;
        };

        let page_url = driver.current_url().await?;
        let mut challenge = CaptchaChallenge::new(indicator.kind, site_key, page_url);
        if let Some(attribute) = &indicator.action_attribute
            && let Some(action) = driver.get_attribute(&indicator.selector, attribute).await?
        {
            challenge = challenge.with_action(action);
        }
        return Ok(Some(challenge));
    }

    Ok(None)
}

/// Detect a captcha and, if present, solve it and hand the token to the page.
///
/// Detection and token application are each bounded by `driver_timeout`;
/// solving is bounded by the providers' own poll ceilings. Returns
/// `Ok(None)` when no widget is visible.
pub async fn clear_challenge(
    driver: &dyn PageDriver,
    indicators: &[CaptchaIndicator],
    orchestrator: Option<&CaptchaOrchestrator>,
    driver_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Option<(CaptchaChallenge, CaptchaSolution)>, StepError> {
    let detection = detect_challenge(driver, indicators);
    let Some(challenge) = bounded(detection, driver_timeout, cancel).await? else {
        return Ok(None);
    };

    let orchestrator = orchestrator.ok_or(StepError::Captcha(CaptchaError::NoProviders))?;
    let solution = orchestrator.solve(&challenge, cancel).await?;
    let token = solution.token.as_deref().ok_or_else(|| {
        StepError::Captcha(CaptchaError::Provider("solution carried no token".into()))
    })?;
    bounded(
        driver.apply_captcha_token(&challenge, token),
        driver_timeout,
        cancel,
    )
    .await?;

    Ok(Some((challenge, solution)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::testing::ScriptedDriver;

    #[tokio::test]
    async fn widgets_without_site_keys_are_skipped() {
        let driver = ScriptedDriver::new();
        driver.set_visible(".cf-turnstile", &[true]);
        driver.set_visible(".g-recaptcha", &[true]);
        driver.set_attribute(".g-recaptcha", "data-sitekey", "rc-key");

        let challenge = detect_challenge(&driver, default_indicators())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(challenge.kind, CaptchaKind::RecaptchaV2);
        assert_eq!(challenge.site_key, "rc-key");
        assert_eq!(challenge.page_url.as_str(), "https://shop.example/");
    }

    #[tokio::test]
    async fn turnstile_picks_up_its_action() {
        let driver = ScriptedDriver::new();
        driver.set_visible(".cf-turnstile", &[true]);
        driver.set_attribute(".cf-turnstile", "data-sitekey", "0x4AAA");
        driver.set_attribute(".cf-turnstile", "data-action", "checkout");

        let challenge = detect_challenge(&driver, default_indicators())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(challenge.kind, CaptchaKind::Turnstile);
        assert_eq!(challenge.action.as_deref(), Some("checkout"));
    }

    #[tokio::test]
    async fn clean_page_needs_no_solver() {
        let driver = ScriptedDriver::new();
        let cleared = clear_challenge(
            &driver,
            default_indicators(),
            None,
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(cleared.is_none());
    }
}
