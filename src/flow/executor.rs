//! Runs a flow step by step, classifying failures and dispatching recovery.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::classifier::ErrorCategory;
use super::detection::clear_challenge;
use super::error::{FlowError, StepError};
use super::recovery::{
    RecoveryContext, RecoveryDirective, RecoveryDispatcher, RecoveryOutcome, RecoveryStrategy,
    bounded, pause,
};
use super::types::{ExecutionResult, Flow, FlowState, FlowStep, Step};
use crate::external_deps::captcha::orchestrator::CaptchaOrchestrator;
use crate::external_deps::driver::{ContextFactory, DriverError, InventoryMonitor, PageDriver};
use crate::modules::events::{
    CaptchaEvent, ErrorClassifiedEvent, EventDispatcher, FlowEvent, FlowFinishedEvent,
    ProxyRotatedEvent, RecoveryEvent, StepCompletedEvent, StepEvent,
};
use crate::modules::pacing::{DelayPolicy, FailureStreak, NoDelay, PacingFeedback};
use crate::modules::proxy::{ProxyPool, ProxyRecord};
use crate::sites::SiteModule;

pub const DEFAULT_MAX_STEP_RETRIES: u32 = 3;
pub const DEFAULT_MAX_FLOW_RESTARTS: u32 = 3;
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Slack added on top of a step's own wait so the driver times out first.
const WAIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_step_retries: u32,
    pub max_flow_restarts: u32,
    pub step_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_step_retries: DEFAULT_MAX_STEP_RETRIES,
            max_flow_restarts: DEFAULT_MAX_FLOW_RESTARTS,
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }
}

/// Per-execution bookkeeping. Only the proxy pool and captcha stats are
/// shared between executions.
struct Run {
    started: Instant,
    state: FlowState,
    proxy: Option<ProxyRecord>,
    recoveries: Vec<RecoveryOutcome>,
    last_strategy: Option<RecoveryStrategy>,
    streak: FailureStreak,
}

/// Shared services used by every execution.
pub struct FlowExecutor {
    config: ExecutorConfig,
    recovery: RecoveryDispatcher,
    proxy_pool: Option<Arc<ProxyPool>>,
    captcha: Option<Arc<CaptchaOrchestrator>>,
    inventory: Option<Arc<dyn InventoryMonitor>>,
    contexts: Option<Arc<dyn ContextFactory>>,
    pacing: Arc<dyn DelayPolicy>,
    events: Arc<EventDispatcher>,
}

impl FlowExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            recovery: RecoveryDispatcher::default(),
            proxy_pool: None,
            captcha: None,
            inventory: None,
            contexts: None,
            pacing: Arc::new(NoDelay),
            events: Arc::new(EventDispatcher::with_logging()),
        }
    }

    pub fn with_recovery(mut self, recovery: RecoveryDispatcher) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_proxy_pool(mut self, pool: Arc<ProxyPool>) -> Self {
        self.proxy_pool = Some(pool);
        self
    }

    pub fn with_captcha(mut self, orchestrator: Arc<CaptchaOrchestrator>) -> Self {
        self.captcha = Some(orchestrator);
        self
    }

    pub fn with_inventory_monitor(mut self, monitor: Arc<dyn InventoryMonitor>) -> Self {
        self.inventory = Some(monitor);
        self
    }

    pub fn with_context_factory(mut self, factory: Arc<dyn ContextFactory>) -> Self {
        self.contexts = Some(factory);
        self
    }

    pub fn with_pacing(mut self, pacing: Arc<dyn DelayPolicy>) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute `flow` against `driver`. Always produces a result; failures
    /// are reported through it rather than returned as errors.
    pub async fn execute(
        &self,
        site: &dyn SiteModule,
        flow: &Flow,
        driver: &dyn PageDriver,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let mut run = Run {
            started: Instant::now(),
            state: FlowState::Pending,
            proxy: None,
            recoveries: Vec::new(),
            last_strategy: None,
            streak: FailureStreak::default(),
        };
        run.proxy = match self.acquire_proxy(&flow.site_id, driver, cancel).await {
            Ok(proxy) => proxy,
            Err(StepError::Cancelled) => return self.cancelled(flow, run, 0),
            Err(_) => None,
        };

        let classifier = site.classifier();
        let mut index = 0;
        let mut retries = 0;
        let mut restarts = 0;

        while index < flow.steps.len() {
            let flow_step = &flow.steps[index];
            run.state = FlowState::Running {
                step_index: index,
                retries,
            };

            if !pause(self.pacing.delay_before(&flow_step.step, run.streak), cancel).await {
                return self.cancelled(flow, run, index);
            }

            self.events.dispatch(FlowEvent::StepStarted(StepEvent {
                site_id: flow.site_id.clone(),
                step_index: index,
                step_name: flow_step.step.name(),
                attempt: retries + 1,
                timestamp: Utc::now(),
            }));

            let source = match self.run_step(site, flow, index, driver, cancel).await {
                Ok(latency) => {
                    run.streak.register(PacingFeedback::Success);
                    self.record_step_success(flow, index, &run, latency);
                    index += 1;
                    retries = 0;
                    continue;
                }
                Err(StepError::Cancelled) => return self.cancelled(flow, run, index),
                Err(source) => source,
            };

            let error = FlowError {
                site_id: flow.site_id.clone(),
                step_index: index,
                step_name: flow_step.step.name(),
                proxy_id: run.proxy.as_ref().map(|proxy| proxy.id.clone()),
                source,
            };
            let category = classifier.classify(&error);
            run.streak.register(match category {
                ErrorCategory::RateLimited => PacingFeedback::RateLimited,
                _ => PacingFeedback::Failure,
            });
            self.events.dispatch(FlowEvent::ErrorClassified(ErrorClassifiedEvent {
                site_id: flow.site_id.clone(),
                step_index: index,
                category,
                error: error.message(),
                proxy_id: error.proxy_id.clone(),
                timestamp: Utc::now(),
            }));
            self.charge_transport_failure(site, &error, category);

            let ceiling = flow_step.max_retries.unwrap_or(self.config.max_step_retries);
            if retries >= ceiling {
                log::warn!(
                    "{} step {index} exhausted {ceiling} retries",
                    flow.site_id
                );
                let message = format!("{error} (after {retries} retries)");
                return self.failed(flow, run, index, message, category);
            }

            let ctx = RecoveryContext {
                site,
                driver,
                error: &error,
                selectors: &flow.selectors,
                proxy_pool: self.proxy_pool.as_deref(),
                captcha: self.captcha.as_deref(),
                inventory: self.inventory.as_deref(),
                contexts: self.contexts.as_deref(),
                cancel,
            };
            let outcome = self.recovery.recover(category, &ctx).await;
            self.events.dispatch(FlowEvent::Recovery(RecoveryEvent {
                site_id: flow.site_id.clone(),
                step_index: index,
                category,
                strategy: outcome.strategy,
                directive: outcome.directive,
                recovered: outcome.recovered,
                error: outcome.error.clone(),
                timestamp: Utc::now(),
            }));
            if let Some(proxy) = &outcome.new_proxy {
                self.events.dispatch(FlowEvent::ProxyRotated(ProxyRotatedEvent {
                    site_id: flow.site_id.clone(),
                    from: error.proxy_id.clone(),
                    to: Some(proxy.id.clone()),
                    timestamp: Utc::now(),
                }));
                run.proxy = Some(proxy.clone());
            }

            let strategy = outcome.strategy;
            run.last_strategy = Some(strategy);
            let recovered = outcome.recovered;
            let directive = outcome.directive;
            let recovery_error = outcome.error.clone();
            run.recoveries.push(outcome);

            if cancel.is_cancelled() {
                return self.cancelled(flow, run, index);
            }

            if !recovered || directive == RecoveryDirective::Abort {
                let message = match recovery_error {
                    Some(reason) if strategy != RecoveryStrategy::Abort => {
                        format!("{error}; {strategy} did not recover: {reason}")
                    }
                    _ => error.to_string(),
                };
                return self.failed(flow, run, index, message, category);
            }

            match directive {
                RecoveryDirective::RetryStep => retries += 1,
                RecoveryDirective::RestartFlow => {
                    if restarts >= self.config.max_flow_restarts {
                        let message = format!(
                            "{error} (flow restarted {restarts} times)"
                        );
                        return self.failed(flow, run, index, message, category);
                    }
                    restarts += 1;
                    log::info!(
                        "restarting {} flow from step 0 (restart {restarts}/{})",
                        flow.site_id,
                        self.config.max_flow_restarts
                    );
                    index = 0;
                    retries = 0;
                }
                RecoveryDirective::Abort => {}
            }
        }

        run.state = FlowState::Completed;
        self.finish(flow, run, flow.steps.len(), None, None)
    }

    fn step_timeout(&self, flow_step: &FlowStep) -> Duration {
        let timeout = flow_step.timeout().unwrap_or(self.config.step_timeout);
        match flow_step.step.inherent_wait() {
            Some(wait) if wait + WAIT_GRACE > timeout => wait + WAIT_GRACE,
            _ => timeout,
        }
    }

    /// Clear any captcha, run the step under its timeout, then inspect the
    /// page for known failure states. Returns the step's own latency.
    async fn run_step(
        &self,
        site: &dyn SiteModule,
        flow: &Flow,
        index: usize,
        driver: &dyn PageDriver,
        cancel: &CancellationToken,
    ) -> Result<Duration, StepError> {
        let flow_step = &flow.steps[index];

        let timeout = self.step_timeout(flow_step);

        // Solving has its own poll ceiling and runs outside the step
        // timeout; the driver calls around it are bounded by it.
        self.clear_captcha(site, flow, index, driver, timeout, cancel)
            .await?;

        let work = async {
            let started = Instant::now();
            self.perform(site, flow, &flow_step.step, driver, timeout)
                .await?;
            let latency = started.elapsed();
            site.inspect_page(driver, &flow.selectors).await?;
            Ok::<Duration, StepError>(latency)
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(StepError::Cancelled),
            result = tokio::time::timeout(timeout, work) => {
                result.unwrap_or(Err(StepError::Timeout(timeout)))
            }
        }
    }

    async fn clear_captcha(
        &self,
        site: &dyn SiteModule,
        flow: &Flow,
        index: usize,
        driver: &dyn PageDriver,
        driver_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let started = Instant::now();
        let cleared = clear_challenge(
            driver,
            site.captcha_indicators(),
            self.captcha.as_deref(),
            driver_timeout,
            cancel,
        )
        .await;

        let event = |success: bool, kind: String, provider: Option<String>, error: Option<String>| {
            FlowEvent::Captcha(CaptchaEvent {
                site_id: flow.site_id.clone(),
                step_index: index,
                kind,
                provider,
                success,
                elapsed: started.elapsed(),
                error,
                timestamp: Utc::now(),
            })
        };

        match cleared {
            Ok(None) => Ok(()),
            Ok(Some((challenge, solution))) => {
                self.events.dispatch(event(
                    true,
                    challenge.kind.to_string(),
                    Some(solution.provider),
                    None,
                ));
                Ok(())
            }
            Err(StepError::Captcha(err)) => {
                self.events
                    .dispatch(event(false, "unknown".into(), None, Some(err.to_string())));
                Err(StepError::Captcha(err))
            }
            Err(other) => Err(other),
        }
    }

    async fn perform(
        &self,
        site: &dyn SiteModule,
        flow: &Flow,
        step: &Step,
        driver: &dyn PageDriver,
        timeout: Duration,
    ) -> Result<(), StepError> {
        match step {
            Step::Goto { url } => {
                let target = Url::parse(url).map_err(|err| StepError::InvalidUrl {
                    url: url.clone(),
                    reason: err.to_string(),
                })?;
                driver.goto(&target).await?;
            }
            Step::Fill { selector, value } => driver.fill(selector, value).await?,
            Step::Click { selector } => driver.click(selector).await?,
            Step::WaitForSelector {
                selector,
                timeout_ms,
            } => {
                driver
                    .wait_for_selector(selector, Duration::from_millis(*timeout_ms))
                    .await?
            }
            Step::WaitForTimeout { ms } => {
                driver
                    .wait_for_timeout(Duration::from_millis(*ms))
                    .await?
            }
            Step::AddToCart
            | Step::ProceedToCheckout
            | Step::FillShipping(_)
            | Step::CompletePayment(_) => {
                site.run_composite(driver, step, &flow.selectors, timeout)
                    .await?
            }
        }
        Ok(())
    }

    /// Pick the starting proxy. Failing to apply it is not fatal: the run
    /// continues without one. Only cancellation is returned as an error.
    async fn acquire_proxy(
        &self,
        site_id: &str,
        driver: &dyn PageDriver,
        cancel: &CancellationToken,
    ) -> Result<Option<ProxyRecord>, StepError> {
        let Some(pool) = self.proxy_pool.as_ref() else {
            return Ok(None);
        };
        let Some(record) = pool.get_next() else {
            log::warn!("no active proxy for {site_id}; running without one");
            return Ok(None);
        };

        let applied = bounded(
            driver.apply_proxy(&record.connection()),
            self.config.step_timeout,
            cancel,
        )
        .await;
        match applied {
            Ok(()) => {}
            Err(StepError::Cancelled) => return Err(StepError::Cancelled),
            Err(err) => {
                log::warn!("could not apply proxy {} for {site_id}: {err}", record.id);
                if let Err(err) = pool.report_failure(&record.id) {
                    log::debug!("proxy bookkeeping failed: {err}");
                }
                return Ok(None);
            }
        }

        self.events.dispatch(FlowEvent::ProxyRotated(ProxyRotatedEvent {
            site_id: site_id.to_string(),
            from: None,
            to: Some(record.id.clone()),
            timestamp: Utc::now(),
        }));
        Ok(Some(record))
    }

    fn record_step_success(&self, flow: &Flow, index: usize, run: &Run, latency: Duration) {
        let step = &flow.steps[index].step;
        if matches!(step, Step::Goto { .. })
            && let (Some(pool), Some(proxy)) = (&self.proxy_pool, &run.proxy)
            && let Err(err) = pool.report_success(&proxy.id, latency)
        {
            log::debug!("proxy bookkeeping failed: {err}");
        }

        self.events.dispatch(FlowEvent::StepCompleted(StepCompletedEvent {
            site_id: flow.site_id.clone(),
            step_index: index,
            step_name: step.name(),
            latency,
            timestamp: Utc::now(),
        }));
    }

    /// Transport failures count against the proxy unless the recovery
    /// strategy charges it itself.
    fn charge_transport_failure(
        &self,
        site: &dyn SiteModule,
        error: &FlowError,
        category: ErrorCategory,
    ) {
        let transport = matches!(
            error.source,
            StepError::Driver(DriverError::Navigation(_)) | StepError::Timeout(_)
        );
        if !transport || self.recovery.strategy_for(site, category).charges_proxy(category) {
            return;
        }
        if let (Some(pool), Some(id)) = (&self.proxy_pool, error.proxy_id.as_deref())
            && let Err(err) = pool.report_failure(id)
        {
            log::debug!("proxy bookkeeping failed: {err}");
        }
    }

    fn cancelled(&self, flow: &Flow, mut run: Run, index: usize) -> ExecutionResult {
        log::info!("{} checkout cancelled at step {index}", flow.site_id);
        run.state = FlowState::Failed;
        let message = StepError::Cancelled.to_string();
        self.finish(flow, run, index, Some(message), None)
    }

    fn failed(
        &self,
        flow: &Flow,
        mut run: Run,
        index: usize,
        message: String,
        category: ErrorCategory,
    ) -> ExecutionResult {
        run.state = FlowState::Failed;
        self.finish(flow, run, index, Some(message), Some(category))
    }

    fn finish(
        &self,
        flow: &Flow,
        run: Run,
        steps_executed: usize,
        error: Option<String>,
        category: Option<ErrorCategory>,
    ) -> ExecutionResult {
        let success = run.state == FlowState::Completed;
        let terminal = category.is_some_and(ErrorCategory::is_terminal)
            || (!success && run.last_strategy == Some(RecoveryStrategy::Abort));
        let elapsed = run.started.elapsed();

        self.events.dispatch(FlowEvent::FlowFinished(FlowFinishedEvent {
            site_id: flow.site_id.clone(),
            success,
            steps_executed,
            category,
            elapsed,
            timestamp: Utc::now(),
        }));

        ExecutionResult {
            success,
            state: run.state,
            site_id: flow.site_id.clone(),
            steps_executed,
            error,
            category,
            last_strategy: run.last_strategy,
            retryable: !success && !terminal,
            recoveries: run.recoveries,
            proxy_id: run.proxy.map(|proxy| proxy.id),
            elapsed,
        }
    }
}

impl Default for FlowExecutor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}
