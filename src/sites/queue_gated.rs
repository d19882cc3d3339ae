use std::sync::Arc;

use super::{PageSignal, SiteModule};
use crate::flow::{ErrorCategory, RecoveryStrategy};

const QUEUE_SELECTOR: &str = "#queue, .waiting-room, [data-waiting-room]";

static SIGNALS: &[PageSignal] = &[
    PageSignal {
        selector: QUEUE_SELECTOR,
        category: ErrorCategory::QueueActive,
        message: "waiting room is active",
    },
    PageSignal {
        selector: ".sold-out, [data-sold-out]",
        category: ErrorCategory::ProductSoldOut,
        message: "product is sold out",
    },
    PageSignal {
        selector: "[data-checkout-disabled]",
        category: ErrorCategory::CheckoutDisabled,
        message: "checkout is disabled",
    },
];

/// Storefront that parks shoppers in a waiting room during drops.
///
/// Traffic surges route through the waiting room too, so high-traffic
/// failures wait for the queue instead of hammering the page.
#[derive(Debug, Clone)]
pub struct QueueGatedSite {
    site_id: String,
}

impl QueueGatedSite {
    pub fn new(site_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
        }
    }

    pub(crate) fn factory(site_id: &str) -> Arc<dyn SiteModule> {
        Arc::new(Self::new(site_id))
    }
}

impl SiteModule for QueueGatedSite {
    fn site_id(&self) -> &str {
        &self.site_id
    }

    fn strategy_for(&self, category: ErrorCategory) -> RecoveryStrategy {
        match category {
            ErrorCategory::HighTraffic | ErrorCategory::ItemDemand => RecoveryStrategy::WaitForQueue,
            other => RecoveryStrategy::default_for(other),
        }
    }

    fn queue_indicator(&self) -> Option<&str> {
        Some(QUEUE_SELECTOR)
    }

    fn page_signals(&self) -> &[PageSignal] {
        SIGNALS
    }
}
