use std::sync::Arc;

use url::Url;

use super::SiteModule;

/// Default behaviour for storefronts without a dedicated module.
#[derive(Debug, Clone)]
pub struct GenericSite {
    site_id: String,
    warmup: Vec<Url>,
}

impl GenericSite {
    pub fn new(site_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            warmup: Vec::new(),
        }
    }

    pub fn with_warmup_url(mut self, url: Url) -> Self {
        self.warmup.push(url);
        self
    }

    pub(crate) fn factory(site_id: &str) -> Arc<dyn SiteModule> {
        Arc::new(Self::new(site_id))
    }
}

impl SiteModule for GenericSite {
    fn site_id(&self) -> &str {
        &self.site_id
    }

    fn warmup_urls(&self) -> Vec<Url> {
        self.warmup.clone()
    }
}
