//! Stateful request-lifecycle policies.
//!
//! Each policy owns its state (token slot, cache, rate window, pending map) and
//! contributes at most one handler per chain through [`Policy::interceptors`].
//! The [`InterceptorManager`](crate::InterceptorManager) installs and ejects
//! those handlers by [`PolicyName`].
//!
//! | Name | Phases | Behaviour |
//! |------|--------|-----------|
//! | `auth` | request, response | bearer injection, single-flight token refresh |
//! | `retry` | response | bounded resubmission with delay |
//! | `cache` | request, response | GET memoization bounded by size and age |
//! | `rate_limit` | request | sliding-window admission control |
//! | `dedupe` | dispatch | collapse identical in-flight requests |
//! | `logging` | request, response | `tracing` events per request |

mod auth;
mod cache;
mod dedupe;
mod logging;
mod rate_limit;
mod retry;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;

pub use auth::{
    AuthOptions, AuthPolicy, AuthStats, MemoryTokenStore, RefreshFailureHandler,
    RefreshRequestBuilder, RefreshResponseParser, TokenAccessor, TokenPair, TokenSetter,
};
pub use cache::{CacheOptions, CachePolicy, CacheStats, default_cache_key};
pub use dedupe::{DedupeOptions, DedupePolicy, DedupeStats, default_dedupe_key};
pub use logging::{LogLevel, LoggingOptions, LoggingPolicy};
pub use rate_limit::{RateLimitCallback, RateLimitOptions, RateLimitPolicy, RateLimitStats};
pub use retry::{RetryDelay, RetryOptions, RetryPolicy, RetryPredicate, RetryStats, is_retryable};

use crate::engine::Interceptors;
use crate::{Error, Request, Result};

/// Derives a cache or dedupe key from a request.
pub type KeyFn = Arc<dyn Fn(&Request) -> String + Send + Sync>;

/// Known policy names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyName {
    /// Bearer injection and token refresh.
    Auth,
    /// Retry with delay.
    Retry,
    /// Response cache.
    Cache,
    /// Sliding-window rate limiter.
    RateLimit,
    /// In-flight request deduplication.
    Dedupe,
    /// Request logging.
    Logging,
}

impl PolicyName {
    /// Every known policy, in a stable order.
    pub const ALL: [Self; 6] = [
        Self::Auth,
        Self::Retry,
        Self::Cache,
        Self::RateLimit,
        Self::Dedupe,
        Self::Logging,
    ];

    /// The registry name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Retry => "retry",
            Self::Cache => "cache",
            Self::RateLimit => "rate_limit",
            Self::Dedupe => "dedupe",
            Self::Logging => "logging",
        }
    }

    /// Bit position of this policy's conditional gate in
    /// [`RequestMeta::gates_decided`](crate::RequestMeta::gates_decided).
    #[must_use]
    pub const fn slot(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for PolicyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| Error::validation(format!("unknown interceptor '{s}'")))
    }
}

/// Per-policy counters, as reported in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum PolicyStats {
    /// Auth counters.
    Auth(AuthStats),
    /// Retry counters.
    Retry(RetryStats),
    /// Cache counters.
    Cache(CacheStats),
    /// Rate limiter counters.
    RateLimit(RateLimitStats),
    /// Dedupe counters.
    Dedupe(DedupeStats),
    /// Logging keeps no state.
    Logging,
}

/// A named, stateful policy.
pub trait Policy: Send + Sync + 'static {
    /// Registry name.
    fn name(&self) -> PolicyName;

    /// Handlers to install; each call may return fresh handler values but
    /// they must share this policy's state.
    fn interceptors(self: Arc<Self>) -> Interceptors;

    /// Drop accumulated state (cached entries, window, pending requests).
    fn reset(&self) {}

    /// Current counters.
    fn stats(&self) -> PolicyStats;
}

/// Options for any policy, used to (re)build instances by name.
#[derive(Clone)]
pub enum PolicyOptions {
    /// Auth options.
    Auth(AuthOptions),
    /// Retry options.
    Retry(RetryOptions),
    /// Cache options.
    Cache(CacheOptions),
    /// Rate limiter options.
    RateLimit(RateLimitOptions),
    /// Dedupe options.
    Dedupe(DedupeOptions),
    /// Logging options.
    Logging(LoggingOptions),
}

impl fmt::Debug for PolicyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PolicyOptions").field(&self.name()).finish()
    }
}

impl PolicyOptions {
    /// Default options for `name`.
    #[must_use]
    pub fn default_for(name: PolicyName) -> Self {
        match name {
            PolicyName::Auth => Self::Auth(AuthOptions::default()),
            PolicyName::Retry => Self::Retry(RetryOptions::default()),
            PolicyName::Cache => Self::Cache(CacheOptions::default()),
            PolicyName::RateLimit => Self::RateLimit(RateLimitOptions::default()),
            PolicyName::Dedupe => Self::Dedupe(DedupeOptions::default()),
            PolicyName::Logging => Self::Logging(LoggingOptions::default()),
        }
    }

    /// The policy these options configure.
    #[must_use]
    pub const fn name(&self) -> PolicyName {
        match self {
            Self::Auth(_) => PolicyName::Auth,
            Self::Retry(_) => PolicyName::Retry,
            Self::Cache(_) => PolicyName::Cache,
            Self::RateLimit(_) => PolicyName::RateLimit,
            Self::Dedupe(_) => PolicyName::Dedupe,
            Self::Logging(_) => PolicyName::Logging,
        }
    }

    /// Validate and build a fresh policy instance.
    pub fn build(self) -> Result<Arc<dyn Policy>> {
        Ok(match self {
            Self::Auth(options) => Arc::new(AuthPolicy::new(options)),
            Self::Retry(options) => Arc::new(RetryPolicy::new(options)),
            Self::Cache(options) => Arc::new(CachePolicy::new(options)?),
            Self::RateLimit(options) => Arc::new(RateLimitPolicy::new(options)?),
            Self::Dedupe(options) => Arc::new(DedupePolicy::new(options)),
            Self::Logging(options) => Arc::new(LoggingPolicy::new(options)),
        })
    }
}
