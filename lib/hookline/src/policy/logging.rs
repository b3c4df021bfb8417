//! Request and response logging through `tracing`.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{Policy, PolicyName, PolicyStats};
use crate::engine::{
    Exchange, InterceptFuture, Interceptors, RequestFlow, RequestInterceptor, ResponseInterceptor,
};
use crate::{Request, Response};

/// Log level for request start events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    /// Log at debug level, headers included.
    Debug,
    /// Log at info level (summary only).
    #[default]
    Info,
}

/// Options for [`LoggingPolicy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingOptions {
    level: LogLevel,
}

impl LoggingOptions {
    /// Log at debug level.
    #[must_use]
    pub const fn debug() -> Self {
        Self {
            level: LogLevel::Debug,
        }
    }

    /// Set the level.
    #[must_use]
    pub const fn level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }
}

/// Logs every request and its outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingPolicy {
    level: LogLevel,
}

impl LoggingPolicy {
    /// Create the policy.
    #[must_use]
    pub const fn new(options: LoggingOptions) -> Self {
        Self {
            level: options.level,
        }
    }
}

impl RequestInterceptor for LoggingPolicy {
    fn on_request(&self, request: Request) -> InterceptFuture<RequestFlow> {
        let method = request.method();
        let url = request.url();
        match self.level {
            LogLevel::Debug => {
                debug!(
                    method = %method,
                    url = %url,
                    headers = ?request.headers(),
                    retry = request.meta().retry_count,
                    "sending request"
                );
            }
            LogLevel::Info => {
                info!(method = %method, url = %url, "sending request");
            }
        }
        Box::pin(async move { Ok(RequestFlow::Continue(request)) })
    }
}

impl ResponseInterceptor for LoggingPolicy {
    fn on_response(&self, exchange: Exchange) -> InterceptFuture<Response> {
        let Exchange {
            request, result, ..
        } = exchange;

        // Saturating conversion to u64 (truncates after ~584 million years)
        let elapsed_ms = request
            .meta()
            .started_at
            .map_or(0, |start| u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX));
        let method = request.method();
        let url = request.url();

        match &result {
            Ok(response) => {
                let status = response.status();
                if response.is_success() {
                    info!(%method, %url, status, elapsed_ms, "request completed");
                } else {
                    warn!(%method, %url, status, elapsed_ms, "request failed with HTTP error");
                }
            }
            Err(err) => {
                warn!(%method, %url, error = %err, elapsed_ms, "request failed");
            }
        }
        Box::pin(async move { result })
    }
}

impl Policy for LoggingPolicy {
    fn name(&self) -> PolicyName {
        PolicyName::Logging
    }

    fn interceptors(self: Arc<Self>) -> Interceptors {
        Interceptors {
            request: Some(self.clone()),
            response: Some(self),
            dispatch: None,
        }
    }

    fn stats(&self) -> PolicyStats {
        PolicyStats::Logging
    }
}
