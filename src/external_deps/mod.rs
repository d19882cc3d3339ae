//! Integrations that rely on third-party services.
//!
//! Captcha solving services and the browser automation seam the flow
//! executor drives.

pub mod captcha;
pub mod driver;

pub use captcha::{
    AntiCaptchaProvider, CapSolverProvider, CaptchaChallenge, CaptchaConfig, CaptchaError,
    CaptchaKind, CaptchaOrchestrator, CaptchaProvider, CaptchaSolution, PollStatus,
    ProviderStats, TwoCaptchaProvider,
};
pub use driver::{
    ContextFactory, Cookie, DriverError, InventoryMonitor, PageDriver, ReachabilityProbe,
};
