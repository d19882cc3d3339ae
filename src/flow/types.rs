//! Declarative flow definitions and execution results.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use super::classifier::ErrorCategory;
use super::error::FlowValidationError;
use super::recovery::{RecoveryOutcome, RecoveryStrategy};

pub const DEFAULT_WAIT_FOR_SELECTOR_MS: u64 = 10_000;

fn default_wait_ms() -> u64 {
    DEFAULT_WAIT_FOR_SELECTOR_MS
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingDetails {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    pub address1: String,
    #[serde(default)]
    pub address2: Option<String>,
    pub city: String,
    #[serde(default)]
    pub region: Option<String>,
    pub postal_code: String,
    pub country: String,
}

impl fmt::Debug for ShippingDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShippingDetails")
            .field("city", &self.city)
            .field("country", &self.country)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentDetails {
    pub card_number: String,
    pub card_holder: String,
    pub expiry_month: u8,
    pub expiry_year: u16,
    pub cvv: String,
}

impl PaymentDetails {
    /// `MM/YY` as most checkout forms expect it.
    pub fn expiry(&self) -> String {
        format!("{:02}/{:02}", self.expiry_month, self.expiry_year % 100)
    }
}

impl fmt::Debug for PaymentDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.card_number.len();
        let last4 = self.card_number.get(digits.saturating_sub(4)..).unwrap_or_default();
        f.debug_struct("PaymentDetails")
            .field("card_number", &format_args!("****{last4}"))
            .field("expiry", &self.expiry())
            .finish_non_exhaustive()
    }
}

/// One action in a checkout flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Goto {
        url: String,
    },
    Fill {
        selector: String,
        value: String,
    },
    Click {
        selector: String,
    },
    WaitForSelector {
        selector: String,
        #[serde(default = "default_wait_ms")]
        timeout_ms: u64,
    },
    WaitForTimeout {
        ms: u64,
    },
    AddToCart,
    ProceedToCheckout,
    FillShipping(ShippingDetails),
    CompletePayment(PaymentDetails),
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Goto { .. } => "goto",
            Step::Fill { .. } => "fill",
            Step::Click { .. } => "click",
            Step::WaitForSelector { .. } => "wait_for_selector",
            Step::WaitForTimeout { .. } => "wait_for_timeout",
            Step::AddToCart => "add_to_cart",
            Step::ProceedToCheckout => "proceed_to_checkout",
            Step::FillShipping(_) => "fill_shipping",
            Step::CompletePayment(_) => "complete_payment",
        }
    }

    /// Site-specific steps expanded by the site module.
    pub fn is_composite(&self) -> bool {
        matches!(
            self,
            Step::AddToCart
                | Step::ProceedToCheckout
                | Step::FillShipping(_)
                | Step::CompletePayment(_)
        )
    }

    /// Time the step itself asks the driver to wait, if any.
    pub fn inherent_wait(&self) -> Option<Duration> {
        match self {
            Step::WaitForSelector { timeout_ms, .. } => Some(Duration::from_millis(*timeout_ms)),
            Step::WaitForTimeout { ms } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }

    pub fn goto(url: impl Into<String>) -> Self {
        Step::Goto { url: url.into() }
    }

    pub fn fill(selector: impl Into<String>, value: impl Into<String>) -> Self {
        Step::Fill {
            selector: selector.into(),
            value: value.into(),
        }
    }

    pub fn click(selector: impl Into<String>) -> Self {
        Step::Click {
            selector: selector.into(),
        }
    }

    pub fn wait_for(selector: impl Into<String>, timeout: Duration) -> Self {
        Step::WaitForSelector {
            selector: selector.into(),
            timeout_ms: timeout.as_millis().min(u64::MAX as u128) as u64,
        }
    }
}

/// A step plus its per-step overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStep {
    #[serde(flatten)]
    pub step: Step,
    /// Overrides the executor's step timeout. Named apart from the
    /// `timeout_ms` a selector wait carries.
    #[serde(default, rename = "step_timeout_ms")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl FlowStep {
    pub fn new(step: Step) -> Self {
        Self {
            step,
            timeout_ms: None,
            max_retries: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis().min(u64::MAX as u128) as u64);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl From<Step> for FlowStep {
    fn from(step: Step) -> Self {
        FlowStep::new(step)
    }
}

/// Ordered checkout steps for one site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    #[serde(default)]
    pub name: Option<String>,
    pub site_id: String,
    pub steps: Vec<FlowStep>,
    #[serde(default)]
    pub selectors: HashMap<String, String>,
}

impl Flow {
    pub fn new(site_id: impl Into<String>) -> Self {
        Self {
            name: None,
            site_id: site_id.into(),
            steps: Vec::new(),
            selectors: HashMap::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn step(mut self, step: impl Into<FlowStep>) -> Self {
        self.steps.push(step.into());
        self
    }

    pub fn selector(mut self, key: impl Into<String>, selector: impl Into<String>) -> Self {
        self.selectors.insert(key.into(), selector.into());
        self
    }

    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.site_id)
    }

    /// Structural checks that need no site knowledge.
    pub fn validate(&self) -> Result<(), FlowValidationError> {
        if self.site_id.trim().is_empty() {
            return Err(FlowValidationError::MissingSiteId);
        }
        if self.steps.is_empty() {
            return Err(FlowValidationError::NoSteps(self.site_id.clone()));
        }

        for (index, flow_step) in self.steps.iter().enumerate() {
            match &flow_step.step {
                Step::Goto { url } => {
                    Url::parse(url).map_err(|err| FlowValidationError::InvalidUrl {
                        index,
                        url: url.clone(),
                        reason: err.to_string(),
                    })?;
                }
                Step::Fill { selector, .. }
                | Step::Click { selector }
                | Step::WaitForSelector { selector, .. } => {
                    if selector.trim().is_empty() {
                        return Err(FlowValidationError::EmptySelector { index });
                    }
                }
                Step::WaitForTimeout { .. } => {}
                Step::AddToCart
                | Step::ProceedToCheckout
                | Step::FillShipping(_)
                | Step::CompletePayment(_) => {}
            }

            if flow_step.timeout_ms == Some(0) {
                return Err(FlowValidationError::ZeroTimeout { index });
            }
        }

        Ok(())
    }
}

/// Lifecycle of one flow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FlowState {
    Pending,
    Running { step_index: usize, retries: u32 },
    Completed,
    Failed,
}

/// Outcome returned to the caller of a checkout.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub state: FlowState,
    pub site_id: String,
    /// Steps completed on success; index of the last attempted step on failure.
    pub steps_executed: usize,
    pub error: Option<String>,
    pub category: Option<ErrorCategory>,
    pub last_strategy: Option<RecoveryStrategy>,
    /// `false` when the failure reflects a business state (sold out,
    /// checkout closed, payment refused) that another attempt will not change.
    pub retryable: bool,
    pub recoveries: Vec<RecoveryOutcome>,
    pub proxy_id: Option<String>,
    pub elapsed: Duration,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_tagged_steps_with_overrides() {
        let raw = r##"{
            "site_id": "generic",
            "steps": [
                {"action": "goto", "url": "https://shop.example/p/1"},
                {"action": "wait_for_selector", "selector": "#buy", "max_retries": 5},
                {"action": "add_to_cart", "step_timeout_ms": 15000},
                {"action": "wait_for_selector", "selector": "#pay", "timeout_ms": 2500},
                {"action": "wait_for_timeout", "ms": 250}
            ],
            "selectors": {"add_to_cart": "#buy"}
        }"##;
        let flow: Flow = serde_json::from_str(raw).unwrap();
        assert_eq!(flow.steps.len(), 5);
        assert_eq!(
            flow.steps[1].step,
            Step::WaitForSelector {
                selector: "#buy".into(),
                timeout_ms: DEFAULT_WAIT_FOR_SELECTOR_MS
            }
        );
        assert_eq!(flow.steps[1].max_retries, Some(5));
        assert_eq!(flow.steps[2].timeout(), Some(Duration::from_secs(15)));
        assert!(flow.steps[2].step.is_composite());
        assert_eq!(flow.steps[3].step.inherent_wait(), Some(Duration::from_millis(2500)));
        assert_eq!(flow.steps[3].timeout(), None);
        flow.validate().unwrap();
    }

    #[test]
    fn validation_rejects_bad_definitions() {
        assert_eq!(
            Flow::new("shop").validate(),
            Err(FlowValidationError::NoSteps("shop".into()))
        );
        assert!(matches!(
            Flow::new("shop").step(Step::goto("not a url")).validate(),
            Err(FlowValidationError::InvalidUrl { index: 0, .. })
        ));
        assert_eq!(
            Flow::new("shop")
                .step(Step::goto("https://shop.example"))
                .step(Step::click(" "))
                .validate(),
            Err(FlowValidationError::EmptySelector { index: 1 })
        );
    }

    #[test]
    fn payment_debug_masks_card() {
        let payment = PaymentDetails {
            card_number: "4111111111111111".into(),
            card_holder: "A Buyer".into(),
            expiry_month: 7,
            expiry_year: 2029,
            cvv: "123".into(),
        };
        let printed = format!("{payment:?}");
        assert!(printed.contains("****1111"));
        assert!(!printed.contains("4111111111111111"));
        assert!(!printed.contains("123\""));
        assert_eq!(payment.expiry(), "07/29");
    }
}
