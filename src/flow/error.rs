use std::time::Duration;

use thiserror::Error;

use super::classifier::ErrorCategory;
use crate::external_deps::captcha::CaptchaError;
use crate::external_deps::driver::DriverError;

/// Why a single step attempt failed.
///
/// `Site` and `Captcha` carry a category of their own; everything else is
/// opaque and goes through message classification.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("captcha could not be cleared: {0}")]
    Captcha(#[source] CaptchaError),
    #[error("{message}")]
    Site {
        category: ErrorCategory,
        message: String,
    },
    #[error("step timed out after {0:?}")]
    Timeout(Duration),
    #[error("flow has no selector for '{0}'")]
    MissingSelector(String),
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("execution cancelled")]
    Cancelled,
}

impl StepError {
    pub fn site(category: ErrorCategory, message: impl Into<String>) -> Self {
        StepError::Site {
            category,
            message: message.into(),
        }
    }

    /// Category attached at the point of failure, if any.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            StepError::Site { category, .. } => Some(*category),
            StepError::Captcha(CaptchaError::Cancelled) => None,
            StepError::Captcha(_) => Some(ErrorCategory::CaptchaFailed),
            _ => None,
        }
    }
}

impl From<CaptchaError> for StepError {
    fn from(err: CaptchaError) -> Self {
        match err {
            CaptchaError::Cancelled => StepError::Cancelled,
            other => StepError::Captcha(other),
        }
    }
}

/// A step failure with the execution context needed to classify and recover.
#[derive(Debug, Error)]
#[error("{site_id} step {step_index} ({step_name}) failed: {source}")]
pub struct FlowError {
    pub site_id: String,
    pub step_index: usize,
    pub step_name: &'static str,
    /// Proxy active when the step failed.
    pub proxy_id: Option<String>,
    #[source]
    pub source: StepError,
}

impl FlowError {
    /// Text used for substring classification.
    pub fn message(&self) -> String {
        self.source.to_string()
    }
}

/// Flow definitions rejected before execution starts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlowValidationError {
    #[error("flow is missing a site id")]
    MissingSiteId,
    #[error("flow for '{0}' has no steps")]
    NoSteps(String),
    #[error("step {index}: invalid url '{url}': {reason}")]
    InvalidUrl {
        index: usize,
        url: String,
        reason: String,
    },
    #[error("step {index}: selector is empty")]
    EmptySelector { index: usize },
    #[error("step {index}: timeout must be greater than zero")]
    ZeroTimeout { index: usize },
    #[error("step {index} ({step}) needs selector '{key}' in the flow's selector map")]
    MissingCompositeSelector {
        index: usize,
        step: &'static str,
        key: String,
    },
}
