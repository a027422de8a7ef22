//! Access to one-time URL query parameters consumed during bootstrap.

use std::collections::HashMap;
use std::sync::Mutex;

/// Parameter names read during bootstrap.
pub struct UrlParamKeys;

impl UrlParamKeys {
    pub const REFRESH_TOKEN: &'static str = "refreshToken";
    pub const TYPE: &'static str = "type";
    pub const ERROR: &'static str = "error";
    pub const ERROR_DESCRIPTION: &'static str = "errorDescription";
}

/// Read/remove access to the current location's query parameters. Injected
/// so the core runs without a browser; removal strips the parameter from
/// the visible URL.
pub trait UrlParams: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
    fn remove(&self, name: &str);
}

/// No URL available (non-browser holder).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoUrlParams;

impl UrlParams for NoUrlParams {
    fn get(&self, _name: &str) -> Option<String> {
        None
    }

    fn remove(&self, _name: &str) {}
}

/// In-memory parameter set, for tests and embedders that carry their own
/// start-up parameters.
#[derive(Debug, Default)]
pub struct MemoryUrlParams {
    params: Mutex<HashMap<String, String>>,
}

impl MemoryUrlParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_param(self, name: &str, value: &str) -> Self {
        self.params
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
        self
    }
}

impl UrlParams for MemoryUrlParams {
    fn get(&self, name: &str) -> Option<String> {
        self.params.lock().unwrap().get(name).cloned()
    }

    fn remove(&self, name: &str) {
        self.params.lock().unwrap().remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_params_get_and_remove() {
        let params = MemoryUrlParams::new().with_param(UrlParamKeys::REFRESH_TOKEN, "abc");
        assert_eq!(
            params.get(UrlParamKeys::REFRESH_TOKEN).as_deref(),
            Some("abc")
        );
        params.remove(UrlParamKeys::REFRESH_TOKEN);
        assert!(params.get(UrlParamKeys::REFRESH_TOKEN).is_none());
    }

    #[test]
    fn no_url_params_is_always_empty() {
        let params = NoUrlParams;
        assert!(params.get(UrlParamKeys::ERROR).is_none());
        params.remove(UrlParamKeys::ERROR);
    }
}
