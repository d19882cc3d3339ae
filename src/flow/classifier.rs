//! Maps step failures onto a fixed set of checkout failure categories.
//!
//! Failures raised by the engine or a site module already carry their
//! category. Opaque driver failures are matched against an ordered table of
//! lowercase needles; the first rule with a matching needle wins and anything
//! unmatched is `Generic`.

use std::fmt;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use super::error::FlowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    QueueActive,
    OutOfStock,
    CaptchaFailed,
    SessionExpired,
    ItemDemand,
    AccountLocked,
    RateLimited,
    FraudDetected,
    ChallengeFailed,
    CheckoutDisabled,
    HighTraffic,
    ProductSoldOut,
    PaymentError,
    Generic,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 14] = [
        ErrorCategory::QueueActive,
        ErrorCategory::OutOfStock,
        ErrorCategory::CaptchaFailed,
        ErrorCategory::SessionExpired,
        ErrorCategory::ItemDemand,
        ErrorCategory::AccountLocked,
        ErrorCategory::RateLimited,
        ErrorCategory::FraudDetected,
        ErrorCategory::ChallengeFailed,
        ErrorCategory::CheckoutDisabled,
        ErrorCategory::HighTraffic,
        ErrorCategory::ProductSoldOut,
        ErrorCategory::PaymentError,
        ErrorCategory::Generic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::QueueActive => "queue_active",
            ErrorCategory::OutOfStock => "out_of_stock",
            ErrorCategory::CaptchaFailed => "captcha_failed",
            ErrorCategory::SessionExpired => "session_expired",
            ErrorCategory::ItemDemand => "item_demand",
            ErrorCategory::AccountLocked => "account_locked",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::FraudDetected => "fraud_detected",
            ErrorCategory::ChallengeFailed => "challenge_failed",
            ErrorCategory::CheckoutDisabled => "checkout_disabled",
            ErrorCategory::HighTraffic => "high_traffic",
            ErrorCategory::ProductSoldOut => "product_sold_out",
            ErrorCategory::PaymentError => "payment_error",
            ErrorCategory::Generic => "generic",
        }
    }

    /// Business states another attempt will not change. Stock categories
    /// only end a run once stock monitoring has given up.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ErrorCategory::CheckoutDisabled
                | ErrorCategory::PaymentError
                | ErrorCategory::ProductSoldOut
                | ErrorCategory::OutOfStock
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Substring rule: any needle present in the lowercased message selects
/// `category`. Needles must be lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassificationRule {
    pub category: ErrorCategory,
    pub needles: &'static [&'static str],
}

impl ClassificationRule {
    pub const fn new(category: ErrorCategory, needles: &'static [&'static str]) -> Self {
        Self { category, needles }
    }

    fn matches(&self, lowered: &str) -> bool {
        self.needles.iter().any(|needle| lowered.contains(needle))
    }
}

/// Rules applied when a site does not supply its own. More specific phrases
/// come first ("sold out" before "out of stock", "too many login attempts"
/// before "too many requests").
pub static DEFAULT_RULES: &[ClassificationRule] = &[
    ClassificationRule::new(
        ErrorCategory::CheckoutDisabled,
        &["checkout is disabled", "checkout disabled", "checkout is unavailable", "checkout unavailable"],
    ),
    ClassificationRule::new(
        ErrorCategory::PaymentError,
        &["payment declined", "card declined", "card was declined", "payment failed", "payment error"],
    ),
    ClassificationRule::new(
        ErrorCategory::AccountLocked,
        &["account locked", "account has been locked", "account is locked", "too many login attempts"],
    ),
    ClassificationRule::new(
        ErrorCategory::SessionExpired,
        &["session expired", "session has expired", "session timed out", "please log in again", "please sign in again"],
    ),
    ClassificationRule::new(
        ErrorCategory::FraudDetected,
        &["fraud", "suspicious activity", "unusual activity"],
    ),
    ClassificationRule::new(
        ErrorCategory::CaptchaFailed,
        &["captcha", "recaptcha", "hcaptcha"],
    ),
    ClassificationRule::new(
        ErrorCategory::ChallengeFailed,
        &["challenge failed", "verification failed", "bot detected", "access denied"],
    ),
    ClassificationRule::new(
        ErrorCategory::RateLimited,
        &[
            "rate limit",
            "rate-limit",
            "too many requests",
            "http 429",
            "status 429",
            "status code 429",
            "error 429",
        ],
    ),
    ClassificationRule::new(
        ErrorCategory::QueueActive,
        &["queue", "waiting room", "in line"],
    ),
    ClassificationRule::new(
        ErrorCategory::HighTraffic,
        &["high traffic", "heavy traffic", "experiencing high volume", "try again shortly"],
    ),
    ClassificationRule::new(
        ErrorCategory::ProductSoldOut,
        &["sold out", "soldout"],
    ),
    ClassificationRule::new(
        ErrorCategory::OutOfStock,
        &["out of stock", "out-of-stock", "no longer available", "unavailable in your size"],
    ),
    ClassificationRule::new(
        ErrorCategory::ItemDemand,
        &["high demand", "limited quantity", "purchase limit", "limit per customer"],
    ),
];

/// Ordered substring classifier.
#[derive(Debug, Clone, Copy)]
pub struct ErrorClassifier<'a> {
    rules: &'a [ClassificationRule],
}

impl Default for ErrorClassifier<'static> {
    fn default() -> Self {
        Self::new(DEFAULT_RULES)
    }
}

impl<'a> ErrorClassifier<'a> {
    pub fn new(rules: &'a [ClassificationRule]) -> Self {
        Self { rules }
    }

    pub fn classify(&self, error: &FlowError) -> ErrorCategory {
        match error.source.category() {
            Some(category) => category,
            None => self.classify_message(&error.message()),
        }
    }

    pub fn classify_message(&self, message: &str) -> ErrorCategory {
        let lowered = message.to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(&lowered))
            .map(|rule| rule.category)
            .unwrap_or(ErrorCategory::Generic)
    }
}

/// Wait hint embedded in a rate-limit message ("try again in 45 seconds").
pub fn delay_hint(message: &str) -> Option<Duration> {
    let caps = DELAY_HINT_RE.captures(message)?;
    let amount: u64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str().to_lowercase();
    let multiplier = match unit.as_str() {
        "ms" | "millisecond" | "milliseconds" => return Some(Duration::from_millis(amount)),
        "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "min" | "mins" | "minute" | "minutes" => 60,
        "hour" | "hours" => 3600,
        _ => 1,
    };
    Some(Duration::from_secs(amount.saturating_mul(multiplier)))
}

static DELAY_HINT_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(
        r"(\d+)\s*(milliseconds|millisecond|ms|seconds|second|secs|sec|s|minutes|minute|mins|min|hours|hour)\b",
    )
    .case_insensitive(true)
    .build()
    .expect("invalid delay hint regex")
});

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external_deps::driver::DriverError;
    use crate::flow::error::StepError;
    use proptest::prelude::*;

    fn opaque(message: &str) -> FlowError {
        FlowError {
            site_id: "shop".into(),
            step_index: 0,
            step_name: "click",
            proxy_id: None,
            source: StepError::Driver(DriverError::Other(message.into())),
        }
    }

    #[test]
    fn substring_rules_are_case_insensitive() {
        let classifier = ErrorClassifier::default();
        assert_eq!(
            classifier.classify(&opaque("HTTP 429 Too Many Requests")),
            ErrorCategory::RateLimited
        );
        assert_eq!(
            classifier.classify(&opaque("This item is SOLD OUT")),
            ErrorCategory::ProductSoldOut
        );
        assert_eq!(
            classifier.classify(&opaque("Item is out of stock")),
            ErrorCategory::OutOfStock
        );
        assert_eq!(
            classifier.classify(&opaque("Your session expired, please sign in again")),
            ErrorCategory::SessionExpired
        );
        assert_eq!(
            classifier.classify(&opaque("You are now in line")),
            ErrorCategory::QueueActive
        );
    }

    #[test]
    fn specific_phrases_win_over_generic_ones() {
        let classifier = ErrorClassifier::default();
        assert_eq!(
            classifier.classify_message("Too many login attempts, account locked"),
            ErrorCategory::AccountLocked
        );
        assert_eq!(
            classifier.classify_message("Checkout is disabled while the queue drains"),
            ErrorCategory::CheckoutDisabled
        );
    }

    #[test]
    fn status_codes_only_match_as_whole_statuses() {
        let classifier = ErrorClassifier::default();
        assert_eq!(
            classifier.classify_message("Could not load order #14290"),
            ErrorCategory::Generic
        );
        assert_eq!(
            classifier.classify_message("SKU 4290-BLK not found"),
            ErrorCategory::Generic
        );
        assert_eq!(
            classifier.classify_message("request failed with HTTP 429"),
            ErrorCategory::RateLimited
        );
        assert_eq!(
            classifier.classify_message("upstream returned status code 429"),
            ErrorCategory::RateLimited
        );
    }

    #[test]
    fn unmatched_text_is_generic() {
        let classifier = ErrorClassifier::default();
        assert_eq!(
            classifier.classify(&opaque("element detached from DOM")),
            ErrorCategory::Generic
        );
        assert_eq!(classifier.classify_message(""), ErrorCategory::Generic);
    }

    #[test]
    fn tagged_errors_skip_substring_matching() {
        let classifier = ErrorClassifier::default();
        let error = FlowError {
            site_id: "shop".into(),
            step_index: 1,
            step_name: "add_to_cart",
            proxy_id: None,
            source: StepError::site(ErrorCategory::OutOfStock, "rate limit banner"),
        };
        assert_eq!(classifier.classify(&error), ErrorCategory::OutOfStock);
    }

    #[test]
    fn site_rules_replace_the_defaults() {
        static RULES: &[ClassificationRule] =
            &[ClassificationRule::new(ErrorCategory::ItemDemand, &["raffle"])];
        let classifier = ErrorClassifier::new(RULES);
        assert_eq!(
            classifier.classify_message("Entered into the raffle"),
            ErrorCategory::ItemDemand
        );
        assert_eq!(
            classifier.classify_message("Too many requests"),
            ErrorCategory::Generic
        );
    }

    #[test]
    fn delay_hints_are_parsed() {
        assert_eq!(
            delay_hint("Rate limited, try again in 45 seconds"),
            Some(Duration::from_secs(45))
        );
        assert_eq!(
            delay_hint("retry after 2 minutes"),
            Some(Duration::from_secs(120))
        );
        assert_eq!(delay_hint("wait 1500ms"), Some(Duration::from_millis(1500)));
        assert_eq!(delay_hint("too many requests"), None);
    }

    proptest! {
        #[test]
        fn classification_is_deterministic(message in ".{0,80}") {
            let classifier = ErrorClassifier::default();
            let first = classifier.classify_message(&message);
            let second = classifier.classify_message(&message);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn classification_ignores_case(message in "[a-zA-Z0-9 ]{0,60}") {
            let classifier = ErrorClassifier::default();
            prop_assert_eq!(
                classifier.classify_message(&message.to_uppercase()),
                classifier.classify_message(&message.to_lowercase())
            );
        }
    }
}
