//! Engine and transport settings.
//!
//! The engine applies the per-call settings around every transport call,
//! replays issued by retry or token refresh included. The connection settings
//! only configure the default hyper transport; a custom transport ignores them.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::{Request, Response};

/// Settings shared by every request a client sends.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline of one transport call, unless the request sets its own.
    pub timeout: Duration,
    /// Report non-2xx responses as [`crate::Error::Http`], so policies such
    /// as retry and auth see them as failures.
    pub error_for_status: bool,
    /// Headers added to requests that do not already carry them, before any
    /// interceptor runs.
    pub default_headers: BTreeMap<String, String>,
    /// TCP connect deadline of the default transport.
    pub connect_timeout: Duration,
    /// Idle keep-alive connections kept per host by the default transport.
    pub pool_idle_per_host: usize,
    /// How long the default transport keeps an idle connection.
    pub pool_idle_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            error_for_status: true,
            default_headers: BTreeMap::new(),
            connect_timeout: Duration::from_secs(10),
            pool_idle_per_host: 32,
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

impl ClientConfig {
    /// Start from the defaults.
    #[must_use]
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Deadline for one transport call carrying `request`.
    #[must_use]
    pub fn timeout_for(&self, request: &Request) -> Duration {
        request.timeout().unwrap_or(self.timeout)
    }

    /// Returns `true` if `response` must be reported as an error.
    #[must_use]
    pub fn rejects(&self, response: &Response) -> bool {
        self.error_for_status && !response.is_success()
    }

    /// Add the default headers `request` does not set, whatever their case.
    pub(crate) fn apply_default_headers(&self, request: &mut Request) {
        let headers = request.headers_mut();
        for (name, value) in &self.default_headers {
            if !headers.keys().any(|existing| existing.eq_ignore_ascii_case(name)) {
                headers.insert(name.clone(), value.clone());
            }
        }
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Default transport-call deadline.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Whether non-2xx responses are errors.
    #[must_use]
    pub fn error_for_status(mut self, enabled: bool) -> Self {
        self.config.error_for_status = enabled;
        self
    }

    /// Add a default header; a later value for the same name wins.
    #[must_use]
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.default_headers.insert(name.into(), value.into());
        self
    }

    /// Connect deadline of the default transport.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Idle connections per host.
    #[must_use]
    pub fn pool_idle_per_host(mut self, count: usize) -> Self {
        self.config.pool_idle_per_host = count;
        self
    }

    /// Idle connection lifetime.
    #[must_use]
    pub fn pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool_idle_timeout = timeout;
        self
    }

    /// Finish.
    #[must_use]
    pub fn build(self) -> ClientConfig {
        self.config
    }
}
