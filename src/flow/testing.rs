//! Scripted page driver shared by the in-crate tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::external_deps::driver::{Cookie, DriverError, PageDriver};
use crate::modules::proxy::ProxyConnection;

/// Records every call as `op:target` and fails or answers according to the
/// script. Visibility sequences repeat their last value once drained. Hung
/// operations never complete.
pub(crate) struct ScriptedDriver {
    hung: Mutex<HashSet<&'static str>>,
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, VecDeque<DriverError>>>,
    persistent: Mutex<HashMap<String, DriverError>>,
    visible: Mutex<HashMap<String, VecDeque<bool>>>,
    attributes: Mutex<HashMap<(String, String), String>>,
    cookies: Mutex<Vec<Cookie>>,
    url: Mutex<Url>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self {
            hung: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            persistent: Mutex::new(HashMap::new()),
            visible: Mutex::new(HashMap::new()),
            attributes: Mutex::new(HashMap::new()),
            cookies: Mutex::new(Vec::new()),
            url: Mutex::new(Url::parse("https://shop.example/").unwrap()),
        }
    }

    /// Fail the next `times` calls of `op:target` with `error`.
    pub fn fail_times(&self, key: &str, times: usize, error: DriverError) {
        let mut failures = self.failures.lock().unwrap();
        let queue = failures.entry(key.to_string()).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    pub fn fail_always(&self, key: &str, error: DriverError) {
        self.persistent
            .lock()
            .unwrap()
            .insert(key.to_string(), error);
    }

    /// Make every later `op` call (`is_visible`, `reload`, `proxy`) hang.
    pub fn hang(&self, op: &'static str) {
        self.hung.lock().unwrap().insert(op);
    }

    async fn stall_if_hung(&self, op: &str) {
        let hung = self.hung.lock().unwrap().contains(op);
        if hung {
            std::future::pending::<()>().await;
        }
    }

    pub fn set_visible(&self, selector: &str, sequence: &[bool]) {
        self.visible
            .lock()
            .unwrap()
            .insert(selector.to_string(), sequence.iter().copied().collect());
    }

    pub fn set_attribute(&self, selector: &str, name: &str, value: &str) {
        self.attributes
            .lock()
            .unwrap()
            .insert((selector.to_string(), name.to_string()), value.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.starts_with(prefix))
            .collect()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn cookie_jar(&self) -> Vec<Cookie> {
        self.cookies.lock().unwrap().clone()
    }

    fn record(&self, key: String) -> Result<(), DriverError> {
        let lookup = key.split('=').next().unwrap_or(&key).to_string();
        self.calls.lock().unwrap().push(key);
        if let Some(error) = self.persistent.lock().unwrap().get(&lookup) {
            return Err(error.clone());
        }
        match self
            .failures
            .lock()
            .unwrap()
            .get_mut(&lookup)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PageDriver for ScriptedDriver {
    async fn goto(&self, url: &Url) -> Result<(), DriverError> {
        self.record(format!("goto:{url}"))?;
        *self.url.lock().unwrap() = url.clone();
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), DriverError> {
        self.record(format!("fill:{selector}={value}"))
    }

    async fn click(&self, selector: &str) -> Result<(), DriverError> {
        self.record(format!("click:{selector}"))
    }

    async fn wait_for_selector(
        &self,
        selector: &str,
        _timeout: Duration,
    ) -> Result<(), DriverError> {
        self.record(format!("wait:{selector}"))
    }

    async fn is_visible(&self, selector: &str) -> Result<bool, DriverError> {
        self.stall_if_hung("is_visible").await;
        let mut visible = self.visible.lock().unwrap();
        Ok(match visible.get_mut(selector) {
            Some(sequence) if sequence.len() > 1 => sequence.pop_front().unwrap_or(false),
            Some(sequence) => sequence.front().copied().unwrap_or(false),
            None => false,
        })
    }

    async fn get_attribute(
        &self,
        selector: &str,
        name: &str,
    ) -> Result<Option<String>, DriverError> {
        Ok(self
            .attributes
            .lock()
            .unwrap()
            .get(&(selector.to_string(), name.to_string()))
            .cloned())
    }

    async fn reload(&self) -> Result<(), DriverError> {
        self.stall_if_hung("reload").await;
        self.record("reload:".to_string())
    }

    async fn cookies(&self) -> Result<Vec<Cookie>, DriverError> {
        Ok(self.cookie_jar())
    }

    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<(), DriverError> {
        self.record(format!("set_cookies:{}", cookies.len()))?;
        self.cookies.lock().unwrap().extend_from_slice(cookies);
        Ok(())
    }

    async fn current_url(&self) -> Result<Url, DriverError> {
        Ok(self.url.lock().unwrap().clone())
    }

    async fn apply_proxy(&self, proxy: &ProxyConnection) -> Result<(), DriverError> {
        self.stall_if_hung("proxy").await;
        self.record(format!("proxy:{}", proxy.server))
    }
}
