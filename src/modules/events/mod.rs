//! Event system for checkout executions.
//!
//! Provides hooks for logging and custom reactions around step execution,
//! captcha solving and recovery.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::flow::{ErrorCategory, RecoveryDirective, RecoveryStrategy};

#[derive(Debug, Clone)]
pub struct StepEvent {
    pub site_id: String,
    pub step_index: usize,
    pub step_name: &'static str,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StepCompletedEvent {
    pub site_id: String,
    pub step_index: usize,
    pub step_name: &'static str,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CaptchaEvent {
    pub site_id: String,
    pub step_index: usize,
    pub kind: String,
    pub provider: Option<String>,
    pub success: bool,
    pub elapsed: Duration,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorClassifiedEvent {
    pub site_id: String,
    pub step_index: usize,
    pub category: ErrorCategory,
    pub error: String,
    pub proxy_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RecoveryEvent {
    pub site_id: String,
    pub step_index: usize,
    pub category: ErrorCategory,
    pub strategy: RecoveryStrategy,
    pub directive: RecoveryDirective,
    pub recovered: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProxyRotatedEvent {
    pub site_id: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FlowFinishedEvent {
    pub site_id: String,
    pub success: bool,
    pub steps_executed: usize,
    pub category: Option<ErrorCategory>,
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum FlowEvent {
    StepStarted(StepEvent),
    StepCompleted(StepCompletedEvent),
    Captcha(CaptchaEvent),
    ErrorClassified(ErrorClassifiedEvent),
    Recovery(RecoveryEvent),
    ProxyRotated(ProxyRotatedEvent),
    FlowFinished(FlowFinishedEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &FlowEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Dispatcher with [`LoggingHandler`] already registered.
    pub fn with_logging() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn dispatch(&self, event: FlowEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &FlowEvent) {
        match event {
            FlowEvent::StepStarted(step) => {
                log::debug!(
                    "-> {} step {} ({}) attempt {}",
                    step.site_id,
                    step.step_index,
                    step.step_name,
                    step.attempt
                );
            }
            FlowEvent::StepCompleted(step) => {
                log::debug!(
                    "<- {} step {} ({}) ok ({:.2}s)",
                    step.site_id,
                    step.step_index,
                    step.step_name,
                    step.latency.as_secs_f64()
                );
            }
            FlowEvent::Captcha(captcha) => {
                if captcha.success {
                    log::info!(
                        "captcha {} on {} cleared by {} in {:.1}s",
                        captcha.kind,
                        captcha.site_id,
                        captcha.provider.as_deref().unwrap_or("unknown"),
                        captcha.elapsed.as_secs_f64()
                    );
                } else {
                    log::warn!(
                        "captcha {} on {} not cleared: {}",
                        captcha.kind,
                        captcha.site_id,
                        captcha.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            FlowEvent::ErrorClassified(error) => {
                log::warn!(
                    "{} step {} failed [{}] via {}: {}",
                    error.site_id,
                    error.step_index,
                    error.category,
                    error.proxy_id.as_deref().unwrap_or("direct"),
                    error.error
                );
            }
            FlowEvent::Recovery(recovery) => {
                if recovery.recovered {
                    log::info!(
                        "{} step {} recovered from {} with {} ({:?})",
                        recovery.site_id,
                        recovery.step_index,
                        recovery.category,
                        recovery.strategy,
                        recovery.directive
                    );
                } else {
                    log::warn!(
                        "{} step {} recovery {} for {} failed: {}",
                        recovery.site_id,
                        recovery.step_index,
                        recovery.strategy,
                        recovery.category,
                        recovery.error.as_deref().unwrap_or("no detail")
                    );
                }
            }
            FlowEvent::ProxyRotated(rotated) => {
                log::info!(
                    "{} proxy {} -> {}",
                    rotated.site_id,
                    rotated.from.as_deref().unwrap_or("none"),
                    rotated.to.as_deref().unwrap_or("none")
                );
            }
            FlowEvent::FlowFinished(finished) => {
                if finished.success {
                    log::info!(
                        "checkout on {} completed {} steps in {:.1}s",
                        finished.site_id,
                        finished.steps_executed,
                        finished.elapsed.as_secs_f64()
                    );
                } else {
                    log::error!(
                        "checkout on {} failed at step {} [{}]",
                        finished.site_id,
                        finished.steps_executed,
                        finished
                            .category
                            .map(ErrorCategory::as_str)
                            .unwrap_or("cancelled")
                    );
                }
            }
        }
    }
}
