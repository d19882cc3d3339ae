//! Checkout flows: definitions, execution, classification and recovery.

pub mod classifier;
pub mod detection;
pub mod error;
pub mod executor;
pub mod recovery;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use classifier::{ClassificationRule, DEFAULT_RULES, ErrorCategory, ErrorClassifier, delay_hint};
pub use detection::{CaptchaIndicator, clear_challenge, default_indicators, detect_challenge};
pub use error::{FlowError, FlowValidationError, StepError};
pub use executor::{
    DEFAULT_MAX_FLOW_RESTARTS, DEFAULT_MAX_STEP_RETRIES, DEFAULT_STEP_TIMEOUT, ExecutorConfig,
    FlowExecutor,
};
pub use recovery::{
    RecoveryConfig, RecoveryContext, RecoveryDirective, RecoveryDispatcher, RecoveryOutcome,
    RecoveryStrategy,
};
pub use types::{
    ExecutionResult, Flow, FlowState, FlowStep, PaymentDetails, ShippingDetails, Step,
};
