//! # checkout-resilience
//!
//! Resilience engine for automated checkout flows.
//!
//! A flow is a list of browser steps (navigate, fill, click, wait, plus
//! composite cart/checkout/shipping/payment steps expanded per site). The
//! engine runs it against any [`PageDriver`] and keeps it moving when the
//! storefront pushes back:
//!
//! - Health-scored proxy pool with round-robin rotation and periodic sweeps
//! - Multi-provider captcha solving (2Captcha, Anti-Captcha, CapSolver) with
//!   ordered fallback and per-provider statistics
//! - Error classification into actionable categories with a recovery
//!   strategy for each (queue waits, restock monitoring, session refresh,
//!   proxy rotation with backoff)
//! - Per-site modules for selectors, failure signals and strategy overrides
//!
//! ## Example
//!
//! ```no_run
//! use checkout_resilience::{CheckoutEngine, EngineConfig, PageDriver};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn run(driver: &dyn PageDriver) -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::from_path("checkout.toml")?;
//!     let engine = CheckoutEngine::from_config(&config)?;
//!     let result = engine
//!         .execute_named("drop", driver, CancellationToken::new())
//!         .await?;
//!     println!("success: {} after {:?}", result.success, result.elapsed);
//!     Ok(())
//! }
//! ```

mod engine;

pub mod config;
pub mod external_deps;
pub mod flow;
pub mod modules;
pub mod sites;

pub use crate::engine::{
    CheckoutEngine,
    CheckoutEngineBuilder,
    EngineError,
    EngineResult,
};

pub use crate::config::{
    ConfigError,
    EngineConfig,
    ProviderKind,
    ProviderSettings,
    ProxyEntry,
};

pub use crate::flow::{
    ErrorCategory,
    ErrorClassifier,
    ExecutionResult,
    ExecutorConfig,
    Flow,
    FlowError,
    FlowExecutor,
    FlowState,
    FlowStep,
    FlowValidationError,
    PaymentDetails,
    RecoveryConfig,
    RecoveryDirective,
    RecoveryDispatcher,
    RecoveryOutcome,
    RecoveryStrategy,
    ShippingDetails,
    Step,
    StepError,
};

pub use crate::sites::{
    GenericSite,
    PageSignal,
    QueueGatedSite,
    SiteModule,
    SiteRegistry,
};

pub use crate::external_deps::captcha::{
    AntiCaptchaProvider,
    CapSolverProvider,
    CaptchaChallenge,
    CaptchaConfig,
    CaptchaError,
    CaptchaKind,
    CaptchaOrchestrator,
    CaptchaProvider,
    CaptchaSolution,
    PollStatus,
    ProviderStats,
    TwoCaptchaProvider,
};

pub use crate::external_deps::driver::{
    ContextFactory,
    Cookie,
    DriverError,
    InventoryMonitor,
    PageDriver,
    ReachabilityProbe,
};

pub use crate::modules::{
    DelayPolicy,
    EventDispatcher,
    EventHandler,
    FlowEvent,
    HumanPacing,
    LoggingHandler,
    NoDelay,
    ProxyError,
    ProxyHealthReport,
    ProxyPool,
    ProxyPoolConfig,
    ProxyProtocol,
    ProxyRecord,
    ProxySettings,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
