//! Sliding-window admission control.
//!
//! The limiter keeps the timestamps of admitted requests within the trailing
//! window. A request is rejected with [`Error::RateLimitExceeded`] once the
//! window holds `max_requests` entries; rejected requests are not recorded and
//! never queued.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::warn;

use super::{Policy, PolicyName, PolicyStats};
use crate::engine::{InterceptFuture, Interceptors, RequestFlow, RequestInterceptor};
use crate::{Error, Request, Result, observe};

/// Called with the rejection error whenever a request is turned away.
pub type RateLimitCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Options for [`RateLimitPolicy`].
#[derive(Clone)]
pub struct RateLimitOptions {
    max_requests: u32,
    window: Duration,
    on_limit: Option<RateLimitCallback>,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self::per_second(10)
    }
}

impl fmt::Debug for RateLimitOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitOptions")
            .field("max_requests", &self.max_requests)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl RateLimitOptions {
    /// Admit at most `max_requests` per trailing `window`.
    #[must_use]
    pub const fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            on_limit: None,
        }
    }

    /// `count` requests per second.
    #[must_use]
    pub const fn per_second(count: u32) -> Self {
        Self::new(count, Duration::from_secs(1))
    }

    /// `count` requests per minute.
    #[must_use]
    pub const fn per_minute(count: u32) -> Self {
        Self::new(count, Duration::from_secs(60))
    }

    /// Callback fired on every rejection.
    #[must_use]
    pub fn on_limit(mut self, callback: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_limit = Some(Arc::new(callback));
        self
    }
}

/// Rate limiter counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    /// Requests let through.
    pub admitted: u64,
    /// Requests turned away.
    pub rejected: u64,
    /// Timestamps currently in the window.
    pub in_window: usize,
}

#[derive(Default)]
struct Window {
    timestamps: VecDeque<Instant>,
    admitted: u64,
    rejected: u64,
}

impl Window {
    fn prune(&mut self, now: Instant, window: Duration) {
        while self
            .timestamps
            .front()
            .is_some_and(|oldest| now.duration_since(*oldest) >= window)
        {
            self.timestamps.pop_front();
        }
    }
}

/// Sliding-window rate limiter.
#[derive(Clone)]
pub struct RateLimitPolicy {
    options: Arc<RateLimitOptions>,
    window: Arc<Mutex<Window>>,
}

impl fmt::Debug for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitPolicy")
            .field("options", &self.options)
            .field("in_window", &self.window().timestamps.len())
            .finish()
    }
}

impl RateLimitPolicy {
    /// Create the limiter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `max_requests` or `window` is zero.
    pub fn new(options: RateLimitOptions) -> Result<Self> {
        if options.max_requests == 0 || options.window.is_zero() {
            return Err(Error::validation(
                "rate limit needs a non-zero request count and window",
            ));
        }
        Ok(Self {
            options: Arc::new(options),
            window: Arc::default(),
        })
    }

    fn window(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an admission, or return the rejection error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RateLimitExceeded`] when the window is full.
    pub fn try_acquire(&self) -> Result<()> {
        let max_requests = self.options.max_requests;
        let span = self.options.window;
        let now = Instant::now();

        let mut window = self.window();
        window.prune(now, span);

        if window.timestamps.len() >= max_requests as usize {
            window.rejected += 1;
            let retry_after = window
                .timestamps
                .front()
                .map_or(span, |oldest| span.saturating_sub(now.duration_since(*oldest)));
            drop(window);

            let err = Error::RateLimitExceeded {
                limit: max_requests,
                window: span,
                retry_after,
            };
            observe::rate_limited();
            warn!(limit = max_requests, ?retry_after, "rate limit exceeded");
            if let Some(callback) = &self.options.on_limit {
                callback(&err);
            }
            return Err(err);
        }

        window.timestamps.push_back(now);
        window.admitted += 1;
        Ok(())
    }
}

impl RequestInterceptor for RateLimitPolicy {
    fn on_request(&self, request: Request) -> InterceptFuture<RequestFlow> {
        let admission = self.try_acquire();
        Box::pin(async move {
            admission?;
            Ok(RequestFlow::Continue(request))
        })
    }
}

impl Policy for RateLimitPolicy {
    fn name(&self) -> PolicyName {
        PolicyName::RateLimit
    }

    fn interceptors(self: Arc<Self>) -> Interceptors {
        Interceptors {
            request: Some(self),
            ..Interceptors::default()
        }
    }

    fn reset(&self) {
        self.window().timestamps.clear();
    }

    fn stats(&self) -> PolicyStats {
        let now = Instant::now();
        let mut window = self.window();
        window.prune(now, self.options.window);
        PolicyStats::RateLimit(RateLimitStats {
            admitted: window.admitted,
            rejected: window.rejected,
            in_window: window.timestamps.len(),
        })
    }
}
