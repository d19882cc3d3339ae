//! High level checkout orchestration.
//!
//! Wires the proxy pool, captcha orchestrator, site registry, pacing and
//! event handlers into a single entry point that validates a flow and drives
//! it against a caller-supplied page driver.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, EngineConfig};
use crate::external_deps::captcha::{CaptchaOrchestrator, CaptchaProvider};
use crate::external_deps::driver::{
	ContextFactory, InventoryMonitor, PageDriver, ReachabilityProbe,
};
use crate::flow::{
	ExecutionResult, ExecutorConfig, Flow, FlowExecutor, FlowValidationError, RecoveryConfig,
	RecoveryDispatcher,
};
use crate::modules::events::{EventDispatcher, EventHandler, LoggingHandler};
use crate::modules::pacing::{DEFAULT_BASE_DELAY_MS, DelayPolicy, HumanPacing, NoDelay};
use crate::modules::proxy::{ProxyError, ProxyPool, ProxyPoolConfig, ProxySettings};
use crate::sites::{SiteModule, SiteRegistry};

/// Errors raised while assembling the engine or before a flow starts.
///
/// Failures during execution are reported through [`ExecutionResult`].
#[derive(Debug, Error)]
pub enum EngineError {
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error("proxy error: {0}")]
	Proxy(#[from] ProxyError),
	#[error("invalid flow: {0}")]
	InvalidFlow(#[from] FlowValidationError),
	#[error("no flow named '{0}'")]
	UnknownFlow(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Builder for [`CheckoutEngine`].
pub struct CheckoutEngineBuilder {
	executor: ExecutorConfig,
	recovery: RecoveryConfig,
	pool: ProxyPoolConfig,
	proxies: Vec<ProxySettings>,
	providers: Vec<Arc<dyn CaptchaProvider>>,
	sites: Vec<Arc<dyn SiteModule>>,
	handlers: Vec<Arc<dyn EventHandler>>,
	log_events: bool,
	inventory: Option<Arc<dyn InventoryMonitor>>,
	contexts: Option<Arc<dyn ContextFactory>>,
	probe: Option<Arc<dyn ReachabilityProbe>>,
	pacing: Option<Arc<dyn DelayPolicy>>,
	flows: Vec<Flow>,
}

impl Default for CheckoutEngineBuilder {
	fn default() -> Self {
		Self::new()
	}
}

impl CheckoutEngineBuilder {
	pub fn new() -> Self {
		Self {
			executor: ExecutorConfig::default(),
			recovery: RecoveryConfig::default(),
			pool: ProxyPoolConfig::default(),
			proxies: Vec::new(),
			providers: Vec::new(),
			sites: Vec::new(),
			handlers: Vec::new(),
			log_events: true,
			inventory: None,
			contexts: None,
			probe: None,
			pacing: None,
			flows: Vec::new(),
		}
	}

	pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
		self.executor = config;
		self
	}

	pub fn with_recovery_config(mut self, config: RecoveryConfig) -> Self {
		self.recovery = config;
		self
	}

	pub fn with_proxy_pool_config(mut self, config: ProxyPoolConfig) -> Self {
		self.pool = config;
		self
	}

	pub fn with_proxies<I>(mut self, proxies: I) -> Self
	where
		I: IntoIterator<Item = ProxySettings>,
	{
		self.proxies.extend(proxies);
		self
	}

	/// Providers are tried in the order they are added.
	pub fn with_captcha_provider(mut self, provider: Arc<dyn CaptchaProvider>) -> Self {
		self.providers.push(provider);
		self
	}

	pub fn with_site(mut self, site: Arc<dyn SiteModule>) -> Self {
		self.sites.push(site);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn disable_event_logging(mut self) -> Self {
		self.log_events = false;
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

	pub fn with_reachability_probe(mut self, probe: Arc<dyn ReachabilityProbe>) -> Self {
		self.probe = Some(probe);
		self
	}

	pub fn with_pacing(mut self, pacing: Arc<dyn DelayPolicy>) -> Self {
		self.pacing = Some(pacing);
		self
	}

	pub fn disable_pacing(mut self) -> Self {
		self.pacing = Some(Arc::new(NoDelay));
		self
	}

	pub fn with_flow(mut self, flow: Flow) -> Self {
		self.flows.push(flow);
		self
	}

	/// Seed the builder from a loaded [`EngineConfig`].
	pub fn with_config(mut self, config: &EngineConfig) -> EngineResult<Self> {
		config.validate()?;
		self.executor = config.retry.executor_config();
		self.recovery = config.recovery.recovery_config();
		self.pool = config.health.pool_config();
		self.proxies.extend(config.proxy_settings()?);
		self.providers.extend(config.captcha.build_providers()?);
		self.pacing = Some(if config.pacing.enabled {
			Arc::new(
				HumanPacing::new(config.pacing.base_delay_ms)
					.with_variance(config.pacing.variance_pct),
			)
		} else {
			Arc::new(NoDelay)
		});
		self.flows.extend(config.flows.iter().cloned());
		Ok(self)
	}

	pub fn build(self) -> EngineResult<CheckoutEngine> {
		let pool = Arc::new(ProxyPool::from_settings(self.pool, self.proxies)?);

		let mut orchestrator = CaptchaOrchestrator::new();
		for provider in self.providers {
			orchestrator.register(provider);
		}
		let captcha = Arc::new(orchestrator);

		let mut registry = SiteRegistry::new();
		for site in self.sites {
			registry.register(site);
		}

		let mut events = EventDispatcher::new();
		if self.log_events {
			events.register_handler(Arc::new(LoggingHandler));
		}
		for handler in self.handlers {
			events.register_handler(handler);
		}

		let pacing = self
			.pacing
			.unwrap_or_else(|| Arc::new(HumanPacing::new(DEFAULT_BASE_DELAY_MS)));

		let mut executor = FlowExecutor::new(self.executor)
			.with_recovery(RecoveryDispatcher::new(self.recovery))
			.with_proxy_pool(pool.clone())
			.with_pacing(pacing)
			.with_events(Arc::new(events));
		if !captcha.is_empty() {
			executor = executor.with_captcha(captcha.clone());
		}
		if let Some(monitor) = self.inventory {
			executor = executor.with_inventory_monitor(monitor);
		}
		if let Some(factory) = self.contexts {
			executor = executor.with_context_factory(factory);
		}

		log::debug!(
			"checkout engine ready: {} proxies, {} captcha providers, {} flows",
			pool.len(),
			captcha.len(),
			self.flows.len()
		);

		Ok(CheckoutEngine {
			executor,
			registry,
			proxy_pool: pool,
			captcha,
			probe: self.probe,
			flows: self.flows,
		})
	}
}

/// Entry point for running checkout flows.
pub struct CheckoutEngine {
	executor: FlowExecutor,
	registry: SiteRegistry,
	proxy_pool: Arc<ProxyPool>,
	captcha: Arc<CaptchaOrchestrator>,
	probe: Option<Arc<dyn ReachabilityProbe>>,
	flows: Vec<Flow>,
}

impl CheckoutEngine {
	pub fn builder() -> CheckoutEngineBuilder {
		CheckoutEngineBuilder::new()
	}

	pub fn from_config(config: &EngineConfig) -> EngineResult<Self> {
		CheckoutEngineBuilder::new().with_config(config)?.build()
	}

	/// Check a flow against the site module that will run it.
	pub fn validate_flow(&self, flow: &Flow) -> EngineResult<()> {
		self.registry.resolve(&flow.site_id).validate_flow(flow)?;
		Ok(())
	}

	/// Validate and run `flow`. Only validation problems are returned as
	/// errors; everything that happens once the flow starts is described by
	/// the [`ExecutionResult`].
	pub async fn execute_checkout(
		&self,
		flow: &Flow,
		driver: &dyn PageDriver,
		cancel: CancellationToken,
	) -> EngineResult<ExecutionResult> {
		let site = self.registry.resolve(&flow.site_id);
		site.validate_flow(flow)?;
		log::info!("starting {} checkout on {}", flow.label(), flow.site_id);
		Ok(self.executor.execute(site.as_ref(), flow, driver, &cancel).await)
	}

	/// Run one of the flows loaded from configuration.
	pub async fn execute_named(
		&self,
		name: &str,
		driver: &dyn PageDriver,
		cancel: CancellationToken,
	) -> EngineResult<ExecutionResult> {
		let flow = self
			.flow(name)
			.ok_or_else(|| EngineError::UnknownFlow(name.to_string()))?;
		self.execute_checkout(flow, driver, cancel).await
	}

	pub fn flow(&self, name: &str) -> Option<&Flow> {
		self.flows.iter().find(|flow| flow.label() == name)
	}

	pub fn flows(&self) -> &[Flow] {
		&self.flows
	}

	pub fn proxy_pool(&self) -> &Arc<ProxyPool> {
		&self.proxy_pool
	}

	pub fn captcha(&self) -> &CaptchaOrchestrator {
		&self.captcha
	}

	pub fn executor(&self) -> &FlowExecutor {
		&self.executor
	}

	/// Start periodic proxy health sweeps, stopped by `cancel`.
	pub fn spawn_health_checks(&self, cancel: CancellationToken) -> JoinHandle<()> {
		self.proxy_pool
			.clone()
			.spawn_health_checks(self.probe.clone(), cancel)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::flow::Step;
	use crate::flow::testing::ScriptedDriver;
	use crate::modules::proxy::ProxyProtocol;

	fn engine() -> CheckoutEngine {
		CheckoutEngine::builder()
			.with_proxies([ProxySettings::new(ProxyProtocol::Http, "10.0.0.1", 8080)])
			.disable_pacing()
			.disable_event_logging()
			.build()
			.unwrap()
	}

	#[tokio::test]
	async fn composite_steps_need_their_selectors() {
		let engine = engine();
		let flow = Flow::new("shop")
			.step(Step::goto("https://shop.example/p/1"))
			.step(Step::AddToCart);

		let err = engine.validate_flow(&flow).unwrap_err();
		assert!(matches!(
			err,
			EngineError::InvalidFlow(FlowValidationError::MissingCompositeSelector { index: 1, .. })
		));

		let driver = ScriptedDriver::new();
		let err = engine
			.execute_checkout(&flow, &driver, CancellationToken::new())
			.await
			.unwrap_err();
		assert!(matches!(err, EngineError::InvalidFlow(_)));
		assert!(driver.calls().is_empty());
	}

	#[tokio::test]
	async fn runs_a_valid_flow_through_the_pool() {
		let engine = engine();
		let flow = Flow::new("shop")
			.step(Step::goto("https://shop.example/p/1"))
			.step(Step::click("#buy"));
		let driver = ScriptedDriver::new();

		let result = engine
			.execute_checkout(&flow, &driver, CancellationToken::new())
			.await
			.unwrap();

		assert!(result.success);
		assert_eq!(result.proxy_id.as_deref(), Some("http://10.0.0.1:8080"));
		let record = engine.proxy_pool().get("http://10.0.0.1:8080").unwrap();
		assert_eq!(record.success_count, 1);
	}

	#[tokio::test]
	async fn named_flows_come_from_the_builder() {
		let engine = CheckoutEngine::builder()
			.disable_pacing()
			.with_flow(Flow::new("shop").named("warmup").step(Step::goto("https://shop.example/")))
			.build()
			.unwrap();

		assert!(engine.flow("warmup").is_some());
		let driver = ScriptedDriver::new();
		let err = engine
			.execute_named("missing", &driver, CancellationToken::new())
			.await
			.unwrap_err();
		assert!(matches!(err, EngineError::UnknownFlow(name) if name == "missing"));

		let result = engine
			.execute_named("warmup", &driver, CancellationToken::new())
			.await
			.unwrap();
		assert!(result.success);
		assert!(result.proxy_id.is_none());
	}
}
