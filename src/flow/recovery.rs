//! Category-driven recovery actions.
//!
//! Every classified failure maps to exactly one strategy. A strategy runs an
//! async action against the live page and reports whether the flow may
//! continue and, if so, whether to retry the failed step or restart.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::classifier::{ErrorCategory, delay_hint};
use super::detection::clear_challenge;
use super::error::{FlowError, StepError};
use crate::external_deps::captcha::orchestrator::CaptchaOrchestrator;
use crate::external_deps::driver::{ContextFactory, DriverError, InventoryMonitor, PageDriver};
use crate::modules::proxy::{ProxyPool, ProxyRecord};
use crate::sites::SiteModule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    WaitForQueue,
    MonitorStock,
    RetryCaptcha,
    RefreshSession,
    RotateProxy,
    LogAndContinue,
    Abort,
}

impl RecoveryStrategy {
    /// Strategy used unless a site overrides it.
    pub fn default_for(category: ErrorCategory) -> Self {
        match category {
            ErrorCategory::QueueActive | ErrorCategory::HighTraffic => RecoveryStrategy::WaitForQueue,
            ErrorCategory::OutOfStock
            | ErrorCategory::ProductSoldOut
            | ErrorCategory::ItemDemand => RecoveryStrategy::MonitorStock,
            ErrorCategory::CaptchaFailed | ErrorCategory::ChallengeFailed => {
                RecoveryStrategy::RetryCaptcha
            }
            ErrorCategory::SessionExpired | ErrorCategory::FraudDetected => {
                RecoveryStrategy::RefreshSession
            }
            ErrorCategory::RateLimited | ErrorCategory::AccountLocked => RecoveryStrategy::RotateProxy,
            ErrorCategory::CheckoutDisabled | ErrorCategory::PaymentError => RecoveryStrategy::Abort,
            ErrorCategory::Generic => RecoveryStrategy::LogAndContinue,
        }
    }

    /// Whether the recovery action itself records the failure against the
    /// proxy that was active. Nothing else may charge it for the same failure.
    pub fn charges_proxy(self, category: ErrorCategory) -> bool {
        match self {
            RecoveryStrategy::RotateProxy => true,
            RecoveryStrategy::RefreshSession => category == ErrorCategory::FraudDetected,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryStrategy::WaitForQueue => "wait_for_queue",
            RecoveryStrategy::MonitorStock => "monitor_stock",
            RecoveryStrategy::RetryCaptcha => "retry_captcha",
            RecoveryStrategy::RefreshSession => "refresh_session",
            RecoveryStrategy::RotateProxy => "rotate_proxy",
            RecoveryStrategy::LogAndContinue => "log_and_continue",
            RecoveryStrategy::Abort => "abort",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the executor does after a recovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryDirective {
    RetryStep,
    RestartFlow,
    Abort,
}

/// Result of one recovery attempt.
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub recovered: bool,
    pub category: ErrorCategory,
    pub strategy: RecoveryStrategy,
    pub directive: RecoveryDirective,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub waited: Duration,
    pub new_proxy: Option<ProxyRecord>,
    pub metadata: HashMap<String, String>,
}

impl RecoveryOutcome {
    fn new(category: ErrorCategory, strategy: RecoveryStrategy, directive: RecoveryDirective) -> Self {
        Self {
            recovered: true,
            category,
            strategy,
            directive,
            error: None,
            timestamp: Utc::now(),
            waited: Duration::ZERO,
            new_proxy: None,
            metadata: HashMap::new(),
        }
    }

    pub fn retry(category: ErrorCategory, strategy: RecoveryStrategy) -> Self {
        Self::new(category, strategy, RecoveryDirective::RetryStep)
    }

    pub fn restart(category: ErrorCategory, strategy: RecoveryStrategy) -> Self {
        Self::new(category, strategy, RecoveryDirective::RestartFlow)
    }

    pub fn failed(
        category: ErrorCategory,
        strategy: RecoveryStrategy,
        error: impl Into<String>,
    ) -> Self {
        let mut outcome = Self::new(category, strategy, RecoveryDirective::Abort);
        outcome.recovered = false;
        outcome.error = Some(error.into());
        outcome
    }

    fn note(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    fn with_wait(mut self, waited: Duration) -> Self {
        self.waited = waited;
        self
    }
}

pub const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_RESTOCK_WAIT: Duration = Duration::from_secs(30);
pub const DEFAULT_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(30);
pub const DEFAULT_ACCOUNT_LOCKED_BACKOFF: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Waits and ceilings used by the recovery actions.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub queue_timeout: Duration,
    pub queue_poll_interval: Duration,
    /// Fixed wait for stock when no inventory monitor is wired in.
    pub restock_wait: Duration,
    /// Upper bound handed to the inventory monitor.
    pub restock_timeout: Duration,
    pub rate_limit_backoff: Duration,
    pub account_locked_backoff: Duration,
    /// Cap applied to message-provided delay hints.
    pub max_backoff: Duration,
    pub session_refresh_timeout: Duration,
    /// Ceiling for any single driver call made while recovering.
    pub action_timeout: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            queue_timeout: DEFAULT_QUEUE_TIMEOUT,
            queue_poll_interval: DEFAULT_QUEUE_POLL_INTERVAL,
            restock_wait: DEFAULT_RESTOCK_WAIT,
            restock_timeout: DEFAULT_QUEUE_TIMEOUT,
            rate_limit_backoff: DEFAULT_RATE_LIMIT_BACKOFF,
            account_locked_backoff: DEFAULT_ACCOUNT_LOCKED_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            session_refresh_timeout: Duration::from_secs(60),
            action_timeout: DEFAULT_ACTION_TIMEOUT,
        }
    }
}

/// Everything a recovery action may touch for one failure.
pub struct RecoveryContext<'a> {
    pub site: &'a dyn SiteModule,
    pub driver: &'a dyn PageDriver,
    pub error: &'a FlowError,
    pub selectors: &'a HashMap<String, String>,
    pub proxy_pool: Option<&'a ProxyPool>,
    pub captcha: Option<&'a CaptchaOrchestrator>,
    pub inventory: Option<&'a dyn InventoryMonitor>,
    pub contexts: Option<&'a dyn ContextFactory>,
    pub cancel: &'a CancellationToken,
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
pub(crate) async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Await a driver call for at most `limit`, giving up as soon as `cancel`
/// fires.
pub(crate) async fn bounded<T>(
    call: impl Future<Output = Result<T, DriverError>>,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<T, StepError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(StepError::Cancelled),
        result = tokio::time::timeout(limit, call) => match result {
            Ok(result) => result.map_err(StepError::from),
            Err(_) => Err(StepError::Timeout(limit)),
        },
    }
}

/// Runs the recovery action selected for a failure category.
#[derive(Debug, Clone, Default)]
pub struct RecoveryDispatcher {
    config: RecoveryConfig,
}

impl RecoveryDispatcher {
    pub fn new(config: RecoveryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// `Generic` always logs and continues, whatever the site says.
    pub fn strategy_for(&self, site: &dyn SiteModule, category: ErrorCategory) -> RecoveryStrategy {
        if category == ErrorCategory::Generic {
            return RecoveryStrategy::LogAndContinue;
        }
        site.strategy_for(category)
    }

    pub async fn recover(
        &self,
        category: ErrorCategory,
        ctx: &RecoveryContext<'_>,
    ) -> RecoveryOutcome {
        let strategy = self.strategy_for(ctx.site, category);
        if ctx.cancel.is_cancelled() {
            return RecoveryOutcome::failed(category, strategy, "cancelled");
        }

        match strategy {
            RecoveryStrategy::WaitForQueue => self.wait_for_queue(category, ctx).await,
            RecoveryStrategy::MonitorStock => self.monitor_stock(category, ctx).await,
            RecoveryStrategy::RetryCaptcha => self.retry_captcha(category, ctx).await,
            RecoveryStrategy::RefreshSession => self.refresh_session(category, ctx).await,
            RecoveryStrategy::RotateProxy => self.rotate_proxy(category, ctx).await,
            RecoveryStrategy::LogAndContinue => {
                log::warn!(
                    "continuing after unclassified failure on {}: {}",
                    ctx.error.site_id,
                    ctx.error.message()
                );
                RecoveryOutcome::retry(category, strategy)
            }
            RecoveryStrategy::Abort => {
                RecoveryOutcome::failed(category, strategy, ctx.error.message())
            }
        }
    }

    async fn wait_for_queue(
        &self,
        category: ErrorCategory,
        ctx: &RecoveryContext<'_>,
    ) -> RecoveryOutcome {
        let strategy = RecoveryStrategy::WaitForQueue;
        let started = Instant::now();
        let indicator = ctx
            .site
            .queue_indicator()
            .or_else(|| ctx.selectors.get("queue_indicator").map(String::as_str));

        let Some(indicator) = indicator else {
            if !pause(self.config.queue_poll_interval, ctx.cancel).await {
                return RecoveryOutcome::failed(category, strategy, "cancelled");
            }
            return RecoveryOutcome::retry(category, strategy)
                .with_wait(started.elapsed())
                .note("queue_indicator", "none");
        };

        let deadline = started + self.config.queue_timeout;
        loop {
            let poll = ctx.driver.is_visible(indicator);
            match bounded(poll, self.config.action_timeout, ctx.cancel).await {
                Ok(false) => {
                    log::info!(
                        "queue on {} cleared after {:.1}s",
                        ctx.error.site_id,
                        started.elapsed().as_secs_f64()
                    );
                    return RecoveryOutcome::retry(category, strategy).with_wait(started.elapsed());
                }
                Ok(true) => {}
                Err(StepError::Cancelled) => {
                    return RecoveryOutcome::failed(category, strategy, "cancelled")
                        .with_wait(started.elapsed());
                }
                Err(err) => log::debug!("queue poll on {} failed: {err}", ctx.error.site_id),
            }

            let now = Instant::now();
            if now >= deadline {
                return RecoveryOutcome::failed(
                    category,
                    strategy,
                    format!("queue did not clear within {:?}", self.config.queue_timeout),
                )
                .with_wait(started.elapsed());
            }
            let nap = self.config.queue_poll_interval.min(deadline - now);
            if !pause(nap, ctx.cancel).await {
                return RecoveryOutcome::failed(category, strategy, "cancelled")
                    .with_wait(started.elapsed());
            }
        }
    }

    async fn monitor_stock(
        &self,
        category: ErrorCategory,
        ctx: &RecoveryContext<'_>,
    ) -> RecoveryOutcome {
        let strategy = RecoveryStrategy::MonitorStock;
        let started = Instant::now();

        let outcome = match ctx.inventory {
            Some(monitor) => {
                let wait = monitor.wait_for_restock(&ctx.error.site_id, self.config.restock_timeout);
                let observed = tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        return RecoveryOutcome::failed(category, strategy, "cancelled")
                            .with_wait(started.elapsed());
                    }
                    result = tokio::time::timeout(self.config.restock_timeout, wait) => result,
                };
                match observed {
                    Ok(Ok(true)) => RecoveryOutcome::retry(category, strategy).note("restock", "observed"),
                    Ok(Ok(false)) | Err(_) => {
                        return RecoveryOutcome::failed(
                            category,
                            strategy,
                            format!("no restock within {:?}", self.config.restock_timeout),
                        )
                        .with_wait(started.elapsed());
                    }
                    Ok(Err(err)) => {
                        return RecoveryOutcome::failed(
                            category,
                            strategy,
                            format!("inventory monitor failed: {err}"),
                        )
                        .with_wait(started.elapsed());
                    }
                }
            }
            None => {
                if !pause(self.config.restock_wait, ctx.cancel).await {
                    return RecoveryOutcome::failed(category, strategy, "cancelled")
                        .with_wait(started.elapsed());
                }
                RecoveryOutcome::retry(category, strategy).note("restock", "fixed_wait")
            }
        };

        match bounded(ctx.driver.reload(), self.config.action_timeout, ctx.cancel).await {
            Ok(()) => {}
            Err(StepError::Cancelled) => {
                return RecoveryOutcome::failed(category, strategy, "cancelled")
                    .with_wait(started.elapsed());
            }
            Err(err) => {
                log::warn!("reload after stock wait on {} failed: {err}", ctx.error.site_id);
            }
        }
        outcome.with_wait(started.elapsed())
    }

    async fn retry_captcha(
        &self,
        category: ErrorCategory,
        ctx: &RecoveryContext<'_>,
    ) -> RecoveryOutcome {
        let strategy = RecoveryStrategy::RetryCaptcha;
        let started = Instant::now();
        match clear_challenge(
            ctx.driver,
            ctx.site.captcha_indicators(),
            ctx.captcha,
            self.config.action_timeout,
            ctx.cancel,
        )
        .await
        {
            Ok(Some((challenge, solution))) => RecoveryOutcome::retry(category, strategy)
                .with_wait(started.elapsed())
                .note("captcha_kind", challenge.kind.to_string())
                .note("provider", solution.provider),
            Ok(None) => RecoveryOutcome::retry(category, strategy)
                .with_wait(started.elapsed())
                .note("captcha", "not_present"),
            Err(err) => RecoveryOutcome::failed(category, strategy, err.to_string())
                .with_wait(started.elapsed()),
        }
    }

    async fn refresh_session(
        &self,
        category: ErrorCategory,
        ctx: &RecoveryContext<'_>,
    ) -> RecoveryOutcome {
        let strategy = RecoveryStrategy::RefreshSession;
        let started = Instant::now();

        if strategy.charges_proxy(category) {
            self.charge_failed_proxy(ctx);
        }

        let refresh = async {
            match ctx.contexts {
                Some(factory) => self.bootstrap_cookies(factory, ctx).await,
                None => ctx
                    .driver
                    .reload()
                    .await
                    .map(|_| "reload")
                    .map_err(|err| err.to_string()),
            }
        };

        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => Err("cancelled".to_string()),
            result = tokio::time::timeout(self.config.session_refresh_timeout, refresh) => {
                result.unwrap_or_else(|_| {
                    Err(format!(
                        "session refresh exceeded {:?}",
                        self.config.session_refresh_timeout
                    ))
                })
            }
        };

        match result {
            Ok(method) => RecoveryOutcome::restart(category, strategy)
                .with_wait(started.elapsed())
                .note("refresh", method),
            Err(reason) => {
                RecoveryOutcome::failed(category, strategy, reason).with_wait(started.elapsed())
            }
        }
    }

    /// Visit the site in a throwaway context and move its cookies over.
    async fn bootstrap_cookies(
        &self,
        factory: &dyn ContextFactory,
        ctx: &RecoveryContext<'_>,
    ) -> Result<&'static str, String> {
        let proxy = ctx
            .error
            .proxy_id
            .as_deref()
            .and_then(|id| ctx.proxy_pool.and_then(|pool| pool.get(id)))
            .map(|record| record.connection());

        let mut urls = ctx.site.warmup_urls();
        if urls.is_empty() {
            urls.push(ctx.driver.current_url().await.map_err(|err| err.to_string())?);
        }

        let bootstrap = factory
            .open(proxy.as_ref())
            .await
            .map_err(|err| err.to_string())?;
        for url in &urls {
            bootstrap.goto(url).await.map_err(|err| err.to_string())?;
        }
        let cookies = bootstrap.cookies().await.map_err(|err| err.to_string())?;
        log::debug!(
            "harvested {} cookies for {} from {} warmup pages",
            cookies.len(),
            ctx.error.site_id,
            urls.len()
        );
        ctx.driver
            .set_cookies(&cookies)
            .await
            .map_err(|err| err.to_string())?;
        Ok("bootstrap_context")
    }

    fn charge_failed_proxy(&self, ctx: &RecoveryContext<'_>) {
        if let (Some(pool), Some(id)) = (ctx.proxy_pool, ctx.error.proxy_id.as_deref())
            && let Err(err) = pool.report_failure(id)
        {
            log::warn!("could not record failure for proxy {id}: {err}");
        }
    }

    async fn rotate_proxy(
        &self,
        category: ErrorCategory,
        ctx: &RecoveryContext<'_>,
    ) -> RecoveryOutcome {
        let strategy = RecoveryStrategy::RotateProxy;
        let started = Instant::now();
        self.charge_failed_proxy(ctx);

        let mut outcome = RecoveryOutcome::retry(category, strategy);
        match ctx.proxy_pool.and_then(|pool| next_proxy(pool, ctx.error.proxy_id.as_deref())) {
            Some(record) => {
                let connection = record.connection();
                let switch = ctx.driver.apply_proxy(&connection);
                match bounded(switch, self.config.action_timeout, ctx.cancel).await {
                    Ok(()) => {}
                    Err(StepError::Cancelled) => {
                        return RecoveryOutcome::failed(category, strategy, "cancelled")
                            .with_wait(started.elapsed());
                    }
                    Err(err) => {
                        return RecoveryOutcome::failed(
                            category,
                            strategy,
                            format!("could not switch to proxy {}: {err}", record.id),
                        )
                        .with_wait(started.elapsed());
                    }
                }
                outcome = outcome.note("proxy", record.id.clone());
                outcome.new_proxy = Some(record);
            }
            None => {
                log::warn!(
                    "no replacement proxy for {}; continuing on the current route",
                    ctx.error.site_id
                );
                outcome = outcome.note("proxy", "unavailable");
            }
        }

        let base = match category {
            ErrorCategory::AccountLocked => self.config.account_locked_backoff,
            _ => self.config.rate_limit_backoff,
        };
        let (backoff, source) = match delay_hint(&ctx.error.message()) {
            Some(hint) => (hint.min(self.config.max_backoff), "message"),
            None => (base.min(self.config.max_backoff), "default"),
        };
        if !pause(backoff, ctx.cancel).await {
            return RecoveryOutcome::failed(category, strategy, "cancelled")
                .with_wait(started.elapsed());
        }

        outcome
            .note("delay_source", source)
            .with_wait(started.elapsed())
    }
}

/// Next proxy from the pool, skipping the one that just failed when the pool
/// has anything else to offer.
fn next_proxy(pool: &ProxyPool, failed: Option<&str>) -> Option<ProxyRecord> {
    let first = pool.get_next()?;
    if failed != Some(first.id.as_str()) || pool.len() < 2 {
        return Some(first);
    }
    match pool.get_next() {
        Some(second) if second.id != first.id => Some(second),
        _ => Some(first),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external_deps::driver::{Cookie, DriverError};
    use crate::flow::error::StepError;
    use crate::flow::testing::ScriptedDriver;
    use crate::modules::proxy::{
        ProxyConnection, ProxyPoolConfig, ProxyProtocol, ProxySettings,
    };
    use crate::sites::GenericSite;
    use async_trait::async_trait;

    fn failure(message: &str) -> FlowError {
        FlowError {
            site_id: "shop".into(),
            step_index: 1,
            step_name: "click",
            proxy_id: None,
            source: StepError::Driver(DriverError::Other(message.into())),
        }
    }

    fn context<'a>(
        site: &'a dyn SiteModule,
        driver: &'a dyn PageDriver,
        error: &'a FlowError,
        selectors: &'a HashMap<String, String>,
        cancel: &'a CancellationToken,
    ) -> RecoveryContext<'a> {
        RecoveryContext {
            site,
            driver,
            error,
            selectors,
            proxy_pool: None,
            captcha: None,
            inventory: None,
            contexts: None,
            cancel,
        }
    }

    struct AbortEverything;

    impl SiteModule for AbortEverything {
        fn site_id(&self) -> &str {
            "strict"
        }

        fn strategy_for(&self, _category: ErrorCategory) -> RecoveryStrategy {
            RecoveryStrategy::Abort
        }
    }

    struct NoRestock;

    #[async_trait]
    impl InventoryMonitor for NoRestock {
        async fn wait_for_restock(
            &self,
            _site_id: &str,
            _timeout: Duration,
        ) -> Result<bool, DriverError> {
            Ok(false)
        }
    }

    struct FreshCookies;

    #[async_trait]
    impl ContextFactory for FreshCookies {
        async fn open(
            &self,
            _proxy: Option<&ProxyConnection>,
        ) -> Result<Box<dyn PageDriver>, DriverError> {
            let driver = ScriptedDriver::new();
            driver
                .set_cookies(&[Cookie::new("session", "fresh", "shop.example")])
                .await?;
            Ok(Box::new(driver))
        }
    }

    #[test]
    fn generic_always_logs_and_continues() {
        let dispatcher = RecoveryDispatcher::default();
        assert_eq!(
            dispatcher.strategy_for(&AbortEverything, ErrorCategory::Generic),
            RecoveryStrategy::LogAndContinue
        );
        assert_eq!(
            dispatcher.strategy_for(&AbortEverything, ErrorCategory::RateLimited),
            RecoveryStrategy::Abort
        );
    }

    #[test]
    fn every_category_has_a_strategy() {
        for category in ErrorCategory::ALL {
            let strategy = RecoveryStrategy::default_for(category);
            if strategy == RecoveryStrategy::Abort {
                assert!(category.is_terminal(), "{category}");
            }
            if category.is_terminal() {
                assert!(
                    matches!(strategy, RecoveryStrategy::Abort | RecoveryStrategy::MonitorStock),
                    "{category}"
                );
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stock_wait_without_monitor_sleeps_then_reloads() {
        let dispatcher = RecoveryDispatcher::default();
        let site = GenericSite::new("shop");
        let driver = ScriptedDriver::new();
        let error = failure("out of stock");
        let selectors = HashMap::new();
        let cancel = CancellationToken::new();
        let ctx = context(&site, &driver, &error, &selectors, &cancel);

        let outcome = dispatcher.recover(ErrorCategory::OutOfStock, &ctx).await;

        assert!(outcome.recovered);
        assert_eq!(outcome.directive, RecoveryDirective::RetryStep);
        assert_eq!(outcome.waited, DEFAULT_RESTOCK_WAIT);
        assert_eq!(outcome.metadata["restock"], "fixed_wait");
        assert_eq!(driver.count("reload:"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_without_restock_fails() {
        let dispatcher = RecoveryDispatcher::default();
        let site = GenericSite::new("shop");
        let driver = ScriptedDriver::new();
        let error = failure("sold out");
        let selectors = HashMap::new();
        let cancel = CancellationToken::new();
        let mut ctx = context(&site, &driver, &error, &selectors, &cancel);
        ctx.inventory = Some(&NoRestock);

        let outcome = dispatcher.recover(ErrorCategory::ProductSoldOut, &ctx).await;

        assert!(!outcome.recovered);
        assert_eq!(outcome.strategy, RecoveryStrategy::MonitorStock);
        assert_eq!(driver.count("reload:"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn account_lock_backs_off_even_without_a_pool() {
        let dispatcher = RecoveryDispatcher::default();
        let site = GenericSite::new("shop");
        let driver = ScriptedDriver::new();
        let error = failure("account locked");
        let selectors = HashMap::new();
        let cancel = CancellationToken::new();
        let ctx = context(&site, &driver, &error, &selectors, &cancel);

        let outcome = dispatcher.recover(ErrorCategory::AccountLocked, &ctx).await;

        assert!(outcome.recovered);
        assert_eq!(outcome.waited, DEFAULT_ACCOUNT_LOCKED_BACKOFF);
        assert_eq!(outcome.metadata["proxy"], "unavailable");
        assert!(outcome.new_proxy.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn message_delay_hints_are_capped() {
        let dispatcher = RecoveryDispatcher::default();
        let site = GenericSite::new("shop");
        let driver = ScriptedDriver::new();
        let error = failure("Rate limit exceeded, try again in 2 hours");
        let selectors = HashMap::new();
        let cancel = CancellationToken::new();
        let ctx = context(&site, &driver, &error, &selectors, &cancel);

        let outcome = dispatcher.recover(ErrorCategory::RateLimited, &ctx).await;

        assert_eq!(outcome.waited, DEFAULT_MAX_BACKOFF);
        assert_eq!(outcome.metadata["delay_source"], "message");
    }

    #[tokio::test(start_paused = true)]
    async fn session_refresh_moves_bootstrap_cookies() {
        let dispatcher = RecoveryDispatcher::default();
        let site = GenericSite::new("shop");
        let driver = ScriptedDriver::new();
        let error = failure("session expired");
        let selectors = HashMap::new();
        let cancel = CancellationToken::new();
        let mut ctx = context(&site, &driver, &error, &selectors, &cancel);
        ctx.contexts = Some(&FreshCookies);

        let outcome = dispatcher.recover(ErrorCategory::SessionExpired, &ctx).await;

        assert!(outcome.recovered);
        assert_eq!(outcome.directive, RecoveryDirective::RestartFlow);
        assert_eq!(outcome.metadata["refresh"], "bootstrap_context");
        let jar = driver.cookie_jar();
        assert_eq!(jar.len(), 1);
        assert_eq!(jar[0].value, "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn queue_that_never_clears_times_out() {
        let dispatcher = RecoveryDispatcher::new(RecoveryConfig {
            queue_timeout: Duration::from_secs(5),
            ..RecoveryConfig::default()
        });
        let site = GenericSite::new("shop");
        let driver = ScriptedDriver::new();
        driver.set_visible("#queue", &[true]);
        let error = failure("you are in the queue");
        let mut selectors = HashMap::new();
        selectors.insert("queue_indicator".to_string(), "#queue".to_string());
        let cancel = CancellationToken::new();
        let ctx = context(&site, &driver, &error, &selectors, &cancel);

        let outcome = dispatcher.recover(ErrorCategory::QueueActive, &ctx).await;

        assert!(!outcome.recovered);
        assert_eq!(outcome.waited, Duration::from_secs(5));
        assert!(outcome.error.unwrap().contains("did not clear"));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_queue_poll_yields_to_cancellation() {
        let dispatcher = RecoveryDispatcher::default();
        let site = GenericSite::new("shop");
        let driver = ScriptedDriver::new();
        driver.hang("is_visible");
        let error = failure("you are in the queue");
        let mut selectors = HashMap::new();
        selectors.insert("queue_indicator".to_string(), "#queue".to_string());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let ctx = context(&site, &driver, &error, &selectors, &cancel);

        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            dispatcher.recover(ErrorCategory::QueueActive, &ctx),
        )
        .await
        .expect("queue wait ignored cancellation");

        assert!(!outcome.recovered);
        assert_eq!(outcome.error.as_deref(), Some("cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_reload_after_stock_wait_is_bounded() {
        let dispatcher = RecoveryDispatcher::new(RecoveryConfig {
            action_timeout: Duration::from_secs(3),
            ..RecoveryConfig::default()
        });
        let site = GenericSite::new("shop");
        let driver = ScriptedDriver::new();
        driver.hang("reload");
        let error = failure("out of stock");
        let selectors = HashMap::new();
        let cancel = CancellationToken::new();
        let ctx = context(&site, &driver, &error, &selectors, &cancel);

        let outcome = dispatcher.recover(ErrorCategory::OutOfStock, &ctx).await;

        assert!(outcome.recovered);
        assert_eq!(outcome.waited, DEFAULT_RESTOCK_WAIT + Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_proxy_switch_fails_the_rotation() {
        let dispatcher = RecoveryDispatcher::new(RecoveryConfig {
            action_timeout: Duration::from_secs(3),
            ..RecoveryConfig::default()
        });
        let site = GenericSite::new("shop");
        let driver = ScriptedDriver::new();
        driver.hang("proxy");
        let pool = ProxyPool::from_settings(
            ProxyPoolConfig::default(),
            ["10.0.0.1", "10.0.0.2"]
                .into_iter()
                .map(|host| ProxySettings::new(ProxyProtocol::Http, host, 8080)),
        )
        .unwrap();
        let mut error = failure("too many requests");
        error.proxy_id = Some("http://10.0.0.1:8080".into());
        let selectors = HashMap::new();
        let cancel = CancellationToken::new();
        let mut ctx = context(&site, &driver, &error, &selectors, &cancel);
        ctx.proxy_pool = Some(&pool);

        let outcome = dispatcher.recover(ErrorCategory::RateLimited, &ctx).await;

        assert!(!outcome.recovered);
        assert_eq!(outcome.waited, Duration::from_secs(3));
        assert!(outcome.error.unwrap().contains("could not switch"));
        assert_eq!(pool.get("http://10.0.0.1:8080").unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn captcha_retry_without_providers_fails() {
        let dispatcher = RecoveryDispatcher::default();
        let site = GenericSite::new("shop");
        let driver = ScriptedDriver::new();
        driver.set_visible(".h-captcha", &[true]);
        driver.set_attribute(".h-captcha", "data-sitekey", "hc-key");
        let error = failure("captcha failed");
        let selectors = HashMap::new();
        let cancel = CancellationToken::new();
        let ctx = context(&site, &driver, &error, &selectors, &cancel);

        let outcome = dispatcher.recover(ErrorCategory::CaptchaFailed, &ctx).await;

        assert!(!outcome.recovered);
        assert_eq!(outcome.strategy, RecoveryStrategy::RetryCaptcha);
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let dispatcher = RecoveryDispatcher::default();
        let site = GenericSite::new("shop");
        let driver = ScriptedDriver::new();
        let error = failure("sold out");
        let selectors = HashMap::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = context(&site, &driver, &error, &selectors, &cancel);

        let outcome = dispatcher.recover(ErrorCategory::ProductSoldOut, &ctx).await;

        assert!(!outcome.recovered);
        assert_eq!(outcome.error.as_deref(), Some("cancelled"));
    }
}
