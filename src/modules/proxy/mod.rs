//! Proxy rotation and health tracking utilities.
//!
//! Tracks per-proxy outcomes, scores each endpoint with the shared health
//! model, and hands out the next healthy candidate in rotation order. The pool
//! is shared by every in-flight checkout: mutations are serialized per record,
//! never across records.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::external_deps::driver::ReachabilityProbe;
use crate::modules::health::{HealthConfig, LatencyWindow, health_score};

/// Score a proxy must exceed to be picked by [`ProxyPool::get_next`].
pub const DEFAULT_HEALTHY_THRESHOLD: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    #[default]
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks4 => "socks4",
            ProxyProtocol::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyProtocol {
    type Err = ProxyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(ProxyProtocol::Http),
            "https" => Ok(ProxyProtocol::Https),
            "socks4" => Ok(ProxyProtocol::Socks4),
            "socks5" | "socks5h" => Ok(ProxyProtocol::Socks5),
            other => Err(ProxyError::UnsupportedProtocol(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

/// Static description of a proxy as supplied by configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default)]
    pub protocol: ProxyProtocol,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxySettings {
    pub fn new(protocol: ProxyProtocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Canonical `<protocol>://<host>:<port>` identifier.
    pub fn id(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.host.trim().is_empty() {
            return Err(ProxyError::MissingField("host"));
        }
        if self.port == 0 {
            return Err(ProxyError::MissingField("port"));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(ProxyError::IncompleteCredentials(self.id()));
        }
        Ok(())
    }

    fn credentials(&self) -> Option<ProxyCredentials> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(ProxyCredentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

impl FromStr for ProxySettings {
    type Err = ProxyError;

    /// Parses `protocol://[user:pass@]host:port`; a bare `host:port` is HTTP.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let normalized = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{raw}")
        };
        let url = Url::parse(&normalized)
            .map_err(|err| ProxyError::InvalidEndpoint(raw.to_string(), err.to_string()))?;

        let protocol = ProxyProtocol::from_str(url.scheme())?;
        let host = url
            .host_str()
            .ok_or(ProxyError::MissingField("host"))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or(ProxyError::MissingField("port"))?;

        let mut settings = ProxySettings::new(protocol, host, port);
        if !url.username().is_empty() {
            settings.username = Some(url.username().to_string());
            settings.password = Some(url.password().unwrap_or_default().to_string());
        }
        settings.validate()?;
        Ok(settings)
    }
}

/// Connection triple handed to the page driver's transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConnection {
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Point-in-time view of a proxy and its health counters.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyRecord {
    pub id: String,
    pub protocol: ProxyProtocol,
    pub host: String,
    pub port: u16,
    pub credentials: Option<ProxyCredentials>,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_requests: u64,
    pub avg_latency_ms: f64,
    pub health_score: f64,
    pub active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_health_check_at: Option<DateTime<Utc>>,
}

impl ProxyRecord {
    pub fn connection(&self) -> ProxyConnection {
        ProxyConnection {
            server: self.id.clone(),
            username: self.credentials.as_ref().map(|c| c.username.clone()),
            password: self.credentials.as_ref().map(|c| c.password.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    pub healthy_threshold: f64,
    pub health: HealthConfig,
    pub health_check_interval: Duration,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            healthy_threshold: DEFAULT_HEALTHY_THRESHOLD,
            health: HealthConfig::default(),
            health_check_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyHealthReport {
    pub total_proxies: usize,
    pub active_proxies: usize,
    pub healthy_proxies: usize,
    pub records: Vec<ProxyRecord>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProxyError {
    #[error("proxy config missing required field '{0}'")]
    MissingField(&'static str),
    #[error("invalid proxy endpoint '{0}': {1}")]
    InvalidEndpoint(String, String),
    #[error("unsupported proxy protocol '{0}'")]
    UnsupportedProtocol(String),
    #[error("proxy {0} has a username without a password (or vice versa)")]
    IncompleteCredentials(String),
    #[error("unknown proxy '{0}'")]
    UnknownProxy(String),
}

#[derive(Debug)]
struct ProxyState {
    success_count: u64,
    failure_count: u64,
    total_requests: u64,
    latencies: LatencyWindow,
    health_score: f64,
    active: bool,
    last_used_at: Option<DateTime<Utc>>,
    last_health_check_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct ProxyEntry {
    settings: ProxySettings,
    id: String,
    state: Mutex<ProxyState>,
}

impl ProxyEntry {
    fn new(settings: ProxySettings, health: &HealthConfig) -> Self {
        Self {
            id: settings.id(),
            settings,
            state: Mutex::new(ProxyState {
                success_count: 0,
                failure_count: 0,
                total_requests: 0,
                latencies: LatencyWindow::new(health.latency_window),
                health_score: health_score(0, 0, 0.0, health.max_acceptable_latency_ms),
                active: true,
                last_used_at: None,
                last_health_check_at: None,
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ProxyState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    fn snapshot_locked(&self, state: &ProxyState) -> ProxyRecord {
        ProxyRecord {
            id: self.id.clone(),
            protocol: self.settings.protocol,
            host: self.settings.host.clone(),
            port: self.settings.port,
            credentials: self.settings.credentials(),
            success_count: state.success_count,
            failure_count: state.failure_count,
            total_requests: state.total_requests,
            avg_latency_ms: state.latencies.average_ms(),
            health_score: state.health_score,
            active: state.active,
            last_used_at: state.last_used_at,
            last_health_check_at: state.last_health_check_at,
        }
    }

    fn snapshot(&self) -> ProxyRecord {
        self.with_state(|state| self.snapshot_locked(state))
    }
}

impl ProxyState {
    fn recompute(&mut self, health: &HealthConfig) {
        self.health_score = health_score(
            self.success_count,
            self.failure_count,
            self.latencies.average_ms(),
            health.max_acceptable_latency_ms,
        );
    }
}

#[derive(Debug, Default)]
struct Registry {
    rotation: Vec<Arc<ProxyEntry>>,
    by_id: HashMap<String, Arc<ProxyEntry>>,
}

/// Shared, health-scored proxy pool.
#[derive(Debug)]
pub struct ProxyPool {
    config: ProxyPoolConfig,
    registry: RwLock<Registry>,
    cursor: Mutex<usize>,
}

impl ProxyPool {
    pub fn new(config: ProxyPoolConfig) -> Self {
        Self {
            config,
            registry: RwLock::new(Registry::default()),
            cursor: Mutex::new(0),
        }
    }

    /// Build a pool from configuration, rejecting the first invalid entry.
    pub fn from_settings<I>(config: ProxyPoolConfig, proxies: I) -> Result<Self, ProxyError>
    where
        I: IntoIterator<Item = ProxySettings>,
    {
        let pool = Self::new(config);
        for settings in proxies {
            pool.add_proxy(settings)?;
        }
        Ok(pool)
    }

    pub fn config(&self) -> &ProxyPoolConfig {
        &self.config
    }

    /// Validate and append a proxy to the rotation.
    ///
    /// Duplicate ids are not rejected: the newest record wins id lookups while
    /// both stay in the rotation list.
    pub fn add_proxy(&self, settings: ProxySettings) -> Result<ProxyRecord, ProxyError> {
        settings.validate()?;
        let entry = Arc::new(ProxyEntry::new(settings, &self.config.health));
        let record = entry.snapshot();

        let mut registry = self.write_registry();
        if registry.by_id.contains_key(&entry.id) {
            log::warn!("proxy {} added twice; lookups resolve to the newest entry", entry.id);
        }
        registry.by_id.insert(entry.id.clone(), entry.clone());
        registry.rotation.push(entry);
        Ok(record)
    }

    pub fn len(&self) -> usize {
        self.read_registry().rotation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<ProxyRecord> {
        self.read_registry().by_id.get(id).map(|entry| entry.snapshot())
    }

    /// Next healthy active proxy in rotation order.
    ///
    /// Every examined record advances the cursor by one. Falls back to
    /// [`ProxyPool::get_best`] when a full rotation finds nothing healthy, and
    /// returns `None` only when no active proxy exists.
    pub fn get_next(&self) -> Option<ProxyRecord> {
        let entries = self.read_registry().rotation.clone();
        if entries.is_empty() {
            return None;
        }

        {
            let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
            for _ in 0..entries.len() {
                let index = *cursor % entries.len();
                *cursor = (index + 1) % entries.len();

                let entry = &entries[index];
                let picked = entry.with_state(|state| {
                    if state.active && state.health_score > self.config.healthy_threshold {
                        state.last_used_at = Some(Utc::now());
                        Some(entry.snapshot_locked(state))
                    } else {
                        None
                    }
                });
                if picked.is_some() {
                    return picked;
                }
            }
        }

        log::debug!("no proxy above health threshold; falling back to best available");
        let best = self.best_entry(&entries)?;
        Some(best.with_state(|state| {
            state.last_used_at = Some(Utc::now());
            best.snapshot_locked(state)
        }))
    }

    /// Active proxy with the highest health score; ties go to list order.
    pub fn get_best(&self) -> Option<ProxyRecord> {
        let entries = self.read_registry().rotation.clone();
        self.best_entry(&entries).map(|entry| entry.snapshot())
    }

    fn best_entry(&self, entries: &[Arc<ProxyEntry>]) -> Option<Arc<ProxyEntry>> {
        let mut best: Option<(f64, &Arc<ProxyEntry>)> = None;
        for entry in entries {
            let (active, score) = entry.with_state(|state| (state.active, state.health_score));
            if !active {
                continue;
            }
            match best {
                Some((best_score, _)) if score <= best_score => {}
                _ => best = Some((score, entry)),
            }
        }
        best.map(|(_, entry)| entry.clone())
    }

    pub fn report_success(&self, id: &str, latency: Duration) -> Result<ProxyRecord, ProxyError> {
        let entry = self.entry(id)?;
        let health = &self.config.health;
        Ok(entry.with_state(|state| {
            state.success_count += 1;
            state.total_requests += 1;
            state.latencies.push(latency);
            state.recompute(health);
            entry.snapshot_locked(state)
        }))
    }

    pub fn report_failure(&self, id: &str) -> Result<ProxyRecord, ProxyError> {
        let entry = self.entry(id)?;
        let health = &self.config.health;
        let record = entry.with_state(|state| {
            state.failure_count += 1;
            state.total_requests += 1;
            state.recompute(health);
            entry.snapshot_locked(state)
        });
        log::debug!(
            "proxy {} failure reported (score {:.3})",
            record.id,
            record.health_score
        );
        Ok(record)
    }

    pub fn set_active(&self, id: &str, active: bool) -> Result<ProxyRecord, ProxyError> {
        let entry = self.entry(id)?;
        Ok(entry.with_state(|state| {
            state.active = active;
            entry.snapshot_locked(state)
        }))
    }

    /// Stamp every record's health-check time. Reachability probing is left
    /// to [`ProxyPool::health_check_with`].
    pub fn health_check(&self) {
        let now = Utc::now();
        for entry in self.read_registry().rotation.iter() {
            entry.with_state(|state| state.last_health_check_at = Some(now));
        }
    }

    /// Probe every active proxy, feed the outcome into its health score and
    /// stamp the check time.
    pub async fn health_check_with(&self, probe: &dyn ReachabilityProbe) {
        let entries = self.read_registry().rotation.clone();
        for entry in entries {
            let (active, record) = entry.with_state(|state| (state.active, entry.snapshot_locked(state)));
            if !active {
                continue;
            }

            let outcome = probe.probe(&record).await;
            let health = &self.config.health;
            entry.with_state(|state| {
                state.total_requests += 1;
                match outcome {
                    Ok(latency) => {
                        state.success_count += 1;
                        state.latencies.push(latency);
                    }
                    Err(ref err) => {
                        log::info!("proxy {} failed reachability probe: {err}", entry.id);
                        state.failure_count += 1;
                    }
                }
                state.recompute(health);
                state.last_health_check_at = Some(Utc::now());
            });
        }
    }

    /// Run the periodic sweep until `cancel` fires.
    pub fn spawn_health_checks(
        self: Arc<Self>,
        probe: Option<Arc<dyn ReachabilityProbe>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let period = self.config.health_check_interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match probe.as_deref() {
                    Some(probe) => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = self.health_check_with(probe) => {}
                        }
                    }
                    None => self.health_check(),
                }
            }
            log::debug!("proxy health sweep stopped");
        })
    }

    pub fn health_report(&self) -> ProxyHealthReport {
        let records: Vec<ProxyRecord> = self
            .read_registry()
            .rotation
            .iter()
            .map(|entry| entry.snapshot())
            .collect();
        let active = records.iter().filter(|r| r.active).count();
        let healthy = records
            .iter()
            .filter(|r| r.active && r.health_score > self.config.healthy_threshold)
            .count();

        ProxyHealthReport {
            total_proxies: records.len(),
            active_proxies: active,
            healthy_proxies: healthy,
            records,
        }
    }

    fn entry(&self, id: &str) -> Result<Arc<ProxyEntry>, ProxyError> {
        self.read_registry()
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| ProxyError::UnknownProxy(id.to_string()))
    }

    fn read_registry(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::new(ProxyPoolConfig::default())
    }
}
