//! Cross-cutting services module
//!
//! Proxy health scoring and rotation, step pacing, and flow event fan-out.

pub mod events;
pub mod health;
pub mod pacing;
pub mod proxy;

// Re-export commonly used types
pub use events::{
    CaptchaEvent, ErrorClassifiedEvent, EventDispatcher, EventHandler, FlowEvent,
    FlowFinishedEvent, LoggingHandler, ProxyRotatedEvent, RecoveryEvent, StepCompletedEvent,
    StepEvent,
};
pub use health::{HealthConfig, LatencyWindow, health_score, success_rate};
pub use pacing::{DelayPolicy, FailureStreak, HumanPacing, NoDelay, PacingFeedback};
pub use proxy::{
    ProxyConnection, ProxyError, ProxyHealthReport, ProxyPool, ProxyPoolConfig, ProxyProtocol,
    ProxyRecord, ProxySettings,
};
