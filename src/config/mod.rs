//! Engine configuration.
//!
//! Loads from TOML or JSON (picked by file extension) and validates up front
//! so that bad proxies, empty API keys and malformed flows are rejected before
//! any checkout starts.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::external_deps::captcha::{
    AntiCaptchaProvider, CapSolverProvider, CaptchaConfig, CaptchaError, CaptchaProvider,
    DEFAULT_MAX_POLL_ATTEMPTS, TwoCaptchaProvider,
};
use crate::flow::{ExecutorConfig, Flow, FlowValidationError, RecoveryConfig};
use crate::modules::health::{DEFAULT_LATENCY_WINDOW, DEFAULT_MAX_ACCEPTABLE_LATENCY_MS, HealthConfig};
use crate::modules::pacing::{DEFAULT_BASE_DELAY_MS, DEFAULT_VARIANCE_PCT};
use crate::modules::proxy::{DEFAULT_HEALTHY_THRESHOLD, ProxyError, ProxyPoolConfig, ProxySettings};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid toml: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported config format '{0}' (expected .toml or .json)")]
    UnsupportedFormat(String),
    #[error("proxy #{index}: {source}")]
    Proxy {
        index: usize,
        #[source]
        source: ProxyError,
    },
    #[error("captcha provider #{index}: {source}")]
    Captcha {
        index: usize,
        #[source]
        source: CaptchaError,
    },
    #[error("flow '{name}': {source}")]
    Flow {
        name: String,
        #[source]
        source: FlowValidationError,
    },
    #[error("{0}")]
    Invalid(String),
}

/// A proxy given either as a URL string or as a table.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProxyEntry {
    Url(String),
    Settings(ProxySettings),
}

impl ProxyEntry {
    pub fn settings(&self) -> Result<ProxySettings, ProxyError> {
        let settings = match self {
            ProxyEntry::Url(raw) => raw.parse()?,
            ProxyEntry::Settings(settings) => settings.clone(),
        };
        settings.validate()?;
        Ok(settings)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[serde(alias = "2captcha")]
    TwoCaptcha,
    #[serde(alias = "anti-captcha", alias = "anti_captcha")]
    AntiCaptcha,
    CapSolver,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptchaSettings {
    /// Tried in order on every challenge.
    pub providers: Vec<ProviderSettings>,
    pub poll_interval_ms: u64,
    pub max_poll_attempts: u32,
    pub request_timeout_ms: u64,
}

impl Default for CaptchaSettings {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            poll_interval_ms: 5_000,
            max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
            request_timeout_ms: 30_000,
        }
    }
}

impl CaptchaSettings {
    pub fn captcha_config(&self) -> CaptchaConfig {
        CaptchaConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_poll_attempts: self.max_poll_attempts,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    /// Instantiate the configured providers in order.
    pub fn build_providers(&self) -> Result<Vec<std::sync::Arc<dyn CaptchaProvider>>, ConfigError> {
        let config = self.captcha_config();
        self.providers
            .iter()
            .enumerate()
            .map(|(index, settings)| {
                build_provider(settings, config.clone())
                    .map_err(|source| ConfigError::Captcha { index, source })
            })
            .collect()
    }
}

fn build_provider(
    settings: &ProviderSettings,
    config: CaptchaConfig,
) -> Result<std::sync::Arc<dyn CaptchaProvider>, CaptchaError> {
    use std::sync::Arc;

    Ok(match settings.kind {
        ProviderKind::TwoCaptcha => {
            let provider = TwoCaptchaProvider::with_config(&settings.api_key, config)?;
            match &settings.base_url {
                Some(url) => Arc::new(provider.with_base_url(url)),
                None => Arc::new(provider),
            }
        }
        ProviderKind::AntiCaptcha => {
            let provider = AntiCaptchaProvider::with_config(&settings.api_key, config)?;
            match &settings.base_url {
                Some(url) => Arc::new(provider.with_base_url(url)),
                None => Arc::new(provider),
            }
        }
        ProviderKind::CapSolver => {
            let provider = CapSolverProvider::with_config(&settings.api_key, config)?;
            match &settings.base_url {
                Some(url) => Arc::new(provider.with_base_url(url)),
                None => Arc::new(provider),
            }
        }
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_step_retries: u32,
    pub max_flow_restarts: u32,
    pub step_timeout_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_step_retries: crate::flow::DEFAULT_MAX_STEP_RETRIES,
            max_flow_restarts: crate::flow::DEFAULT_MAX_FLOW_RESTARTS,
            step_timeout_ms: 30_000,
        }
    }
}

impl RetrySettings {
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_step_retries: self.max_step_retries,
            max_flow_restarts: self.max_flow_restarts,
            step_timeout: Duration::from_millis(self.step_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    pub queue_timeout_ms: u64,
    pub queue_poll_interval_ms: u64,
    pub restock_wait_ms: u64,
    pub restock_timeout_ms: u64,
    pub rate_limit_backoff_ms: u64,
    pub account_locked_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub session_refresh_timeout_ms: u64,
    pub action_timeout_ms: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        let defaults = RecoveryConfig::default();
        let ms = |duration: Duration| duration.as_millis() as u64;
        Self {
            queue_timeout_ms: ms(defaults.queue_timeout),
            queue_poll_interval_ms: ms(defaults.queue_poll_interval),
            restock_wait_ms: ms(defaults.restock_wait),
            restock_timeout_ms: ms(defaults.restock_timeout),
            rate_limit_backoff_ms: ms(defaults.rate_limit_backoff),
            account_locked_backoff_ms: ms(defaults.account_locked_backoff),
            max_backoff_ms: ms(defaults.max_backoff),
            session_refresh_timeout_ms: ms(defaults.session_refresh_timeout),
            action_timeout_ms: ms(defaults.action_timeout),
        }
    }
}

impl RecoverySettings {
    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            queue_timeout: Duration::from_millis(self.queue_timeout_ms),
            queue_poll_interval: Duration::from_millis(self.queue_poll_interval_ms),
            restock_wait: Duration::from_millis(self.restock_wait_ms),
            restock_timeout: Duration::from_millis(self.restock_timeout_ms),
            rate_limit_backoff: Duration::from_millis(self.rate_limit_backoff_ms),
            account_locked_backoff: Duration::from_millis(self.account_locked_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            session_refresh_timeout: Duration::from_millis(self.session_refresh_timeout_ms),
            action_timeout: Duration::from_millis(self.action_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub max_acceptable_latency_ms: f64,
    pub healthy_threshold: f64,
    pub latency_window: usize,
    pub check_interval_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            max_acceptable_latency_ms: DEFAULT_MAX_ACCEPTABLE_LATENCY_MS,
            healthy_threshold: DEFAULT_HEALTHY_THRESHOLD,
            latency_window: DEFAULT_LATENCY_WINDOW,
            check_interval_secs: 300,
        }
    }
}

impl HealthSettings {
    pub fn pool_config(&self) -> ProxyPoolConfig {
        ProxyPoolConfig {
            healthy_threshold: self.healthy_threshold,
            health: HealthConfig {
                max_acceptable_latency_ms: self.max_acceptable_latency_ms,
                latency_window: self.latency_window,
            },
            health_check_interval: Duration::from_secs(self.check_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PacingSettings {
    pub enabled: bool,
    pub base_delay_ms: u64,
    pub variance_pct: f64,
}

impl Default for PacingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            variance_pct: DEFAULT_VARIANCE_PCT,
        }
    }
}

/// Complete engine configuration as read from disk.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub proxies: Vec<ProxyEntry>,
    pub captcha: CaptchaSettings,
    pub retry: RetrySettings,
    pub recovery: RecoverySettings,
    pub health: HealthSettings,
    pub pacing: PacingSettings,
    pub flows: Vec<Flow>,
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&raw),
            Some("json") => Self::from_json_str(&raw),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or_default().to_string(),
            )),
        }
    }

    pub fn proxy_settings(&self) -> Result<Vec<ProxySettings>, ConfigError> {
        self.proxies
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                entry
                    .settings()
                    .map_err(|source| ConfigError::Proxy { index, source })
            })
            .collect()
    }

    pub fn flow(&self, name: &str) -> Option<&Flow> {
        self.flows.iter().find(|flow| flow.label() == name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.proxy_settings()?;

        for (index, provider) in self.captcha.providers.iter().enumerate() {
            if provider.api_key.trim().is_empty() {
                return Err(ConfigError::Captcha {
                    index,
                    source: CaptchaError::Configuration("api key is empty".into()),
                });
            }
        }
        if self.captcha.max_poll_attempts == 0 {
            return Err(ConfigError::Invalid(
                "captcha.max_poll_attempts must be at least 1".into(),
            ));
        }
        if self.captcha.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "captcha.poll_interval_ms must be greater than zero".into(),
            ));
        }

        let health = &self.health;
        if !(0.0..=1.0).contains(&health.healthy_threshold) {
            return Err(ConfigError::Invalid(format!(
                "health.healthy_threshold must be within [0, 1], got {}",
                health.healthy_threshold
            )));
        }
        if !(health.max_acceptable_latency_ms.is_finite() && health.max_acceptable_latency_ms > 0.0) {
            return Err(ConfigError::Invalid(
                "health.max_acceptable_latency_ms must be positive".into(),
            ));
        }
        if health.latency_window == 0 {
            return Err(ConfigError::Invalid(
                "health.latency_window must be at least 1".into(),
            ));
        }

        if self.retry.step_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "retry.step_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.recovery.queue_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "recovery.queue_poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.recovery.action_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "recovery.action_timeout_ms must be greater than zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.pacing.variance_pct) {
            return Err(ConfigError::Invalid(
                "pacing.variance_pct must be within [0, 1]".into(),
            ));
        }

        for flow in &self.flows {
            flow.validate().map_err(|source| ConfigError::Flow {
                name: flow.label().to_string(),
                source,
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Step;
    use crate::modules::proxy::ProxyProtocol;

    const SAMPLE: &str = r##"
proxies = [
    "http://10.0.0.1:8080",
    { protocol = "socks5", host = "10.0.0.2", port = 1080, username = "u", password = "p" },
]

[captcha]
poll_interval_ms = 2000
providers = [
    { kind = "2captcha", api_key = "abc" },
    { kind = "capsolver", api_key = "def", base_url = "http://localhost:9000" },
]

[retry]
max_step_retries = 5

[recovery]
queue_timeout_ms = 60000

[[flows]]
name = "drop"
site_id = "queue_gated"
selectors = { add_to_cart = "#add" }
steps = [
    { action = "goto", url = "https://shop.example/p/1" },
    { action = "add_to_cart", max_retries = 1 },
]
"##;

    #[test]
    fn loads_toml_with_defaults_filled_in() {
        let config = EngineConfig::from_toml_str(SAMPLE).unwrap();

        let proxies = config.proxy_settings().unwrap();
        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[0].id(), "http://10.0.0.1:8080");
        assert_eq!(proxies[1].protocol, ProxyProtocol::Socks5);

        assert_eq!(config.captcha.providers[0].kind, ProviderKind::TwoCaptcha);
        assert_eq!(config.captcha.max_poll_attempts, DEFAULT_MAX_POLL_ATTEMPTS);
        assert_eq!(
            config.captcha.captcha_config().poll_interval,
            Duration::from_secs(2)
        );
        assert_eq!(config.captcha.build_providers().unwrap().len(), 2);

        let executor = config.retry.executor_config();
        assert_eq!(executor.max_step_retries, 5);
        assert_eq!(executor.max_flow_restarts, 3);

        let recovery = config.recovery.recovery_config();
        assert_eq!(recovery.queue_timeout, Duration::from_secs(60));
        assert_eq!(recovery.rate_limit_backoff, Duration::from_secs(30));

        let flow = config.flow("drop").unwrap();
        assert_eq!(flow.steps[1].step, Step::AddToCart);
        assert_eq!(flow.steps[1].max_retries, Some(1));
    }

    #[test]
    fn loads_json() {
        let config = EngineConfig::from_json_str(
            r#"{"proxies": ["https://user:pw@proxy.example:3128"], "pacing": {"enabled": false}}"#,
        )
        .unwrap();
        assert!(!config.pacing.enabled);
        assert_eq!(config.health.latency_window, DEFAULT_LATENCY_WINDOW);
        assert!(config.proxy_settings().unwrap()[0].username.is_some());
    }

    #[test]
    fn rejects_bad_proxies_and_empty_keys() {
        let err = EngineConfig::from_toml_str(r#"proxies = ["ftp://10.0.0.1:21"]"#).unwrap_err();
        assert!(matches!(err, ConfigError::Proxy { index: 0, .. }));

        let err = EngineConfig::from_toml_str(
            r#"
[captcha]
providers = [{ kind = "anticaptcha", api_key = " " }]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Captcha { index: 0, .. }));
    }

    #[test]
    fn rejects_zero_poll_ceiling_and_invalid_flows() {
        let err = EngineConfig::from_toml_str("[captcha]\nmax_poll_attempts = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = EngineConfig::from_toml_str(
            r#"
[[flows]]
site_id = "shop"
steps = []
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Flow { .. }));
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let dir = std::env::temp_dir().join("checkout-resilience-config-test.yaml");
        std::fs::write(&dir, "proxies: []").unwrap();
        let err = EngineConfig::from_path(&dir).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat(ext) if ext == "yaml"));
        let _ = std::fs::remove_file(dir);
    }
}
