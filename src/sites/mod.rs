//! Site modules: per-storefront knowledge the executor consults.
//!
//! A site module supplies classification rules, recovery overrides, captcha
//! widget markers and page signals, and expands composite steps such as
//! `add_to_cart` into primitive driver calls using the flow's selector map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::external_deps::driver::PageDriver;
use crate::flow::{
    CaptchaIndicator, ClassificationRule, DEFAULT_RULES, ErrorCategory, ErrorClassifier, Flow,
    FlowValidationError, RecoveryStrategy, Step, StepError, default_indicators,
};

mod generic;
mod queue_gated;

pub use generic::GenericSite;
pub use queue_gated::QueueGatedSite;

/// Visible element that means the page is in a known failure state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSignal {
    pub selector: &'static str,
    pub category: ErrorCategory,
    pub message: &'static str,
}

/// Selector-map keys a flow may use to declare page signals of its own.
pub const SIGNAL_SELECTOR_KEYS: &[(&str, ErrorCategory)] = &[
    ("queue_indicator", ErrorCategory::QueueActive),
    ("sold_out_indicator", ErrorCategory::ProductSoldOut),
    ("out_of_stock_indicator", ErrorCategory::OutOfStock),
    ("checkout_disabled_indicator", ErrorCategory::CheckoutDisabled),
    ("session_expired_indicator", ErrorCategory::SessionExpired),
    ("payment_error_indicator", ErrorCategory::PaymentError),
];

const ADD_TO_CART_KEYS: &[&str] = &["add_to_cart"];
const CHECKOUT_KEYS: &[&str] = &["checkout_button"];
const SHIPPING_KEYS: &[&str] = &[
    "shipping.first_name",
    "shipping.last_name",
    "shipping.email",
    "shipping.address1",
    "shipping.city",
    "shipping.postal_code",
    "shipping.country",
];
const PAYMENT_KEYS: &[&str] = &[
    "payment.card_number",
    "payment.card_holder",
    "payment.expiry",
    "payment.cvv",
    "payment.submit",
];

/// Selector keys a composite step cannot run without.
pub fn required_selector_keys(step: &Step) -> &'static [&'static str] {
    match step {
        Step::AddToCart => ADD_TO_CART_KEYS,
        Step::ProceedToCheckout => CHECKOUT_KEYS,
        Step::FillShipping(_) => SHIPPING_KEYS,
        Step::CompletePayment(_) => PAYMENT_KEYS,
        _ => &[],
    }
}

fn selector<'a>(selectors: &'a HashMap<String, String>, key: &str) -> Result<&'a str, StepError> {
    selectors
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| StepError::MissingSelector(key.to_string()))
}

/// Default expansion of composite steps into primitive driver calls.
pub async fn expand_composite(
    driver: &dyn PageDriver,
    step: &Step,
    selectors: &HashMap<String, String>,
    wait: Duration,
) -> Result<(), StepError> {
    match step {
        Step::AddToCart => {
            driver.click(selector(selectors, "add_to_cart")?).await?;
            if let Some(confirmation) = selectors.get("cart_confirmation") {
                driver.wait_for_selector(confirmation, wait).await?;
            }
        }
        Step::ProceedToCheckout => {
            driver.click(selector(selectors, "checkout_button")?).await?;
            if let Some(ready) = selectors.get("checkout_ready") {
                driver.wait_for_selector(ready, wait).await?;
            }
        }
        Step::FillShipping(details) => {
            let fields = [
                ("shipping.first_name", Some(&details.first_name)),
                ("shipping.last_name", Some(&details.last_name)),
                ("shipping.email", Some(&details.email)),
                ("shipping.phone", details.phone.as_ref()),
                ("shipping.address1", Some(&details.address1)),
                ("shipping.address2", details.address2.as_ref()),
                ("shipping.city", Some(&details.city)),
                ("shipping.region", details.region.as_ref()),
                ("shipping.postal_code", Some(&details.postal_code)),
                ("shipping.country", Some(&details.country)),
            ];
            for (key, value) in fields {
                let Some(value) = value else { continue };
                match selectors.get(key) {
                    Some(target) => driver.fill(target, value).await?,
                    None if SHIPPING_KEYS.contains(&key) => {
                        return Err(StepError::MissingSelector(key.to_string()));
                    }
                    None => log::debug!("no selector for optional field {key}; skipping"),
                }
            }
            if let Some(submit) = selectors.get("shipping.submit") {
                driver.click(submit).await?;
            }
        }
        Step::CompletePayment(details) => {
            driver
                .fill(selector(selectors, "payment.card_number")?, &details.card_number)
                .await?;
            driver
                .fill(selector(selectors, "payment.card_holder")?, &details.card_holder)
                .await?;
            driver
                .fill(selector(selectors, "payment.expiry")?, &details.expiry())
                .await?;
            driver.fill(selector(selectors, "payment.cvv")?, &details.cvv).await?;
            driver.click(selector(selectors, "payment.submit")?).await?;
            if let Some(confirmation) = selectors.get("order_confirmation") {
                driver.wait_for_selector(confirmation, wait).await?;
            }
        }
        other => {
            log::warn!("{} is not a composite step", other.name());
        }
    }
    Ok(())
}

/// Per-site behaviour consulted during execution and recovery.
#[async_trait]
pub trait SiteModule: Send + Sync {
    fn site_id(&self) -> &str;

    fn classification_rules(&self) -> &[ClassificationRule] {
        DEFAULT_RULES
    }

    fn classifier(&self) -> ErrorClassifier<'_> {
        ErrorClassifier::new(self.classification_rules())
    }

    fn strategy_for(&self, category: ErrorCategory) -> RecoveryStrategy {
        RecoveryStrategy::default_for(category)
    }

    fn captcha_indicators(&self) -> &[CaptchaIndicator] {
        default_indicators()
    }

    /// Element present while the shopper is held in a queue.
    fn queue_indicator(&self) -> Option<&str> {
        None
    }

    fn page_signals(&self) -> &[PageSignal] {
        &[]
    }

    /// Pages visited to mint a fresh session. Empty means "the current page".
    fn warmup_urls(&self) -> Vec<Url> {
        Vec::new()
    }

    /// Structural checks plus the selector keys composite steps depend on.
    fn validate_flow(&self, flow: &Flow) -> Result<(), FlowValidationError> {
        flow.validate()?;
        for (index, flow_step) in flow.steps.iter().enumerate() {
            for key in required_selector_keys(&flow_step.step) {
                if !flow.selectors.contains_key(*key) {
                    return Err(FlowValidationError::MissingCompositeSelector {
                        index,
                        step: flow_step.step.name(),
                        key: (*key).to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn run_composite(
        &self,
        driver: &dyn PageDriver,
        step: &Step,
        selectors: &HashMap<String, String>,
        wait: Duration,
    ) -> Result<(), StepError> {
        expand_composite(driver, step, selectors, wait).await
    }

    /// Raise a tagged failure when the page shows a known failure state.
    async fn inspect_page(
        &self,
        driver: &dyn PageDriver,
        selectors: &HashMap<String, String>,
    ) -> Result<(), StepError> {
        for signal in self.page_signals() {
            if driver.is_visible(signal.selector).await? {
                return Err(StepError::site(signal.category, signal.message));
            }
        }
        for (key, category) in SIGNAL_SELECTOR_KEYS {
            if let Some(target) = selectors.get(*key)
                && driver.is_visible(target).await?
            {
                return Err(StepError::site(
                    *category,
                    format!("page shows {key} ({target})"),
                ));
            }
        }
        Ok(())
    }
}

type SiteFactory = fn(&str) -> Arc<dyn SiteModule>;

static BUILTIN_SITES: &[(&str, SiteFactory)] = &[
    ("generic", GenericSite::factory),
    ("queue_gated", QueueGatedSite::factory),
];

/// Resolves site ids to modules: registered modules first, then built-ins,
/// then a [`GenericSite`] carrying the requested id.
#[derive(Default, Clone)]
pub struct SiteRegistry {
    sites: HashMap<String, Arc<dyn SiteModule>>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, site: Arc<dyn SiteModule>) {
        let id = site.site_id().to_string();
        if self.sites.insert(id.clone(), site).is_some() {
            log::warn!("site module {id} registered twice; keeping the latest");
        }
    }

    pub fn is_builtin(site_id: &str) -> bool {
        BUILTIN_SITES.iter().any(|(id, _)| *id == site_id)
    }

    pub fn resolve(&self, site_id: &str) -> Arc<dyn SiteModule> {
        if let Some(site) = self.sites.get(site_id) {
            return site.clone();
        }
        if let Some((_, factory)) = BUILTIN_SITES.iter().find(|(id, _)| *id == site_id) {
            return factory(site_id);
        }
        log::debug!("no module for site {site_id}; using generic behaviour");
        GenericSite::factory(site_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::testing::ScriptedDriver;
    use crate::flow::{PaymentDetails, ShippingDetails};

    fn shipping() -> ShippingDetails {
        ShippingDetails {
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: "ada@example.com".into(),
            phone: Some("555-0100".into()),
            address1: "1 Analytical Way".into(),
            address2: None,
            city: "London".into(),
            region: None,
            postal_code: "N1".into(),
            country: "GB".into(),
        }
    }

    fn shipping_selectors() -> HashMap<String, String> {
        SHIPPING_KEYS
            .iter()
            .map(|key| (key.to_string(), format!("#{}", key.replace('.', "-"))))
            .collect()
    }

    #[tokio::test]
    async fn shipping_fills_required_fields_and_skips_unmapped_optional_ones() {
        let driver = ScriptedDriver::new();
        let selectors = shipping_selectors();
        expand_composite(
            &driver,
            &Step::FillShipping(shipping()),
            &selectors,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        let fills = driver.calls_with_prefix("fill:");
        assert_eq!(fills.len(), SHIPPING_KEYS.len());
        assert!(fills.contains(&"fill:#shipping-city=London".to_string()));
    }

    #[tokio::test]
    async fn payment_requires_every_selector() {
        let driver = ScriptedDriver::new();
        let details = PaymentDetails {
            card_number: "4111111111111111".into(),
            card_holder: "Ada Lovelace".into(),
            expiry_month: 1,
            expiry_year: 2030,
            cvv: "999".into(),
        };
        let err = expand_composite(
            &driver,
            &Step::CompletePayment(details),
            &HashMap::new(),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StepError::MissingSelector(key) if key == "payment.card_number"));
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn validation_names_missing_composite_selectors() {
        let site = GenericSite::new("shop");
        let flow = Flow::new("shop")
            .step(Step::goto("https://shop.example/p/1"))
            .step(Step::AddToCart)
            .step(Step::ProceedToCheckout)
            .selector("add_to_cart", "#add");
        assert_eq!(
            site.validate_flow(&flow),
            Err(FlowValidationError::MissingCompositeSelector {
                index: 2,
                step: "proceed_to_checkout",
                key: "checkout_button".into(),
            })
        );
    }

    #[tokio::test]
    async fn flow_declared_signals_raise_tagged_errors() {
        let driver = ScriptedDriver::new();
        driver.set_visible(".sold-out", &[true]);
        let site = GenericSite::new("shop");
        let mut selectors = HashMap::new();
        selectors.insert("sold_out_indicator".to_string(), ".sold-out".to_string());

        let err = site.inspect_page(&driver, &selectors).await.unwrap_err();
        assert_eq!(err.category(), Some(ErrorCategory::ProductSoldOut));
    }

    #[test]
    fn registry_prefers_registered_then_builtin_then_generic() {
        let mut registry = SiteRegistry::new();
        registry.register(Arc::new(GenericSite::new("custom-shop")));

        assert_eq!(registry.resolve("custom-shop").site_id(), "custom-shop");
        assert!(registry.resolve("queue_gated").queue_indicator().is_some());
        let fallback = registry.resolve("unknown-shop");
        assert_eq!(fallback.site_id(), "unknown-shop");
        assert!(fallback.queue_indicator().is_none());
        assert!(SiteRegistry::is_builtin("generic"));
    }
}
