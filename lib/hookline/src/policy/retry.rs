//! Bounded resubmission of failed requests.
//!
//! The retry counter lives in [`RequestMeta::retry_count`](crate::RequestMeta)
//! and travels with the replayed request, so every pass through the response
//! chain sees how many attempts were already made.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use super::{Policy, PolicyName, PolicyStats};
use crate::engine::{Exchange, InterceptFuture, Interceptors, ResponseInterceptor};
use crate::{Error, Response, observe};

/// Decides whether a failed request is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Default retry predicate.
///
/// Retries failures that never produced a response (connection errors and
/// timeouts) and 5xx responses. Cancelled requests are never retried.
#[must_use]
pub fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Connection(_) | Error::Timeout => true,
        Error::Http { status, .. } => (500..600).contains(status),
        _ => false,
    }
}

/// Delay before a retry attempt.
#[derive(Clone)]
pub enum RetryDelay {
    /// Same delay before every attempt.
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, capped at `max`.
    Exponential {
        /// Delay before the first retry.
        base: Duration,
        /// Upper bound.
        max: Duration,
    },
    /// Delay computed from the attempt number (starting at 1).
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::Fixed(Duration::from_secs(1))
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Self::Exponential { base, max } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("max", max)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl RetryDelay {
    /// Delay before retry number `attempt`.
    #[must_use]
    pub fn for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential { base, max } => 2_u32
                .checked_pow(attempt.saturating_sub(1))
                .map_or(*max, |factor| base.saturating_mul(factor))
                .min(*max),
            Self::Custom(delay) => delay(attempt),
        }
    }
}

/// Options for [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryOptions {
    retries: u32,
    delay: RetryDelay,
    should_retry: Option<RetryPredicate>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            delay: RetryDelay::default(),
            should_retry: None,
        }
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("retries", &self.retries)
            .field("delay", &self.delay)
            .field("custom_predicate", &self.should_retry.is_some())
            .finish()
    }
}

impl RetryOptions {
    /// Maximum number of retries per request.
    #[must_use]
    pub const fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Delay strategy.
    #[must_use]
    pub fn delay(mut self, delay: RetryDelay) -> Self {
        self.delay = delay;
        self
    }

    /// Replace [`is_retryable`].
    #[must_use]
    pub fn should_retry(mut self, predicate: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    fn is_retryable(&self, error: &Error) -> bool {
        match &self.should_retry {
            Some(predicate) => predicate(error),
            None => is_retryable(error),
        }
    }
}

/// Retry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    /// Retries scheduled.
    pub retries: u64,
    /// Requests that failed after using every retry.
    pub exhausted: u64,
}

#[derive(Debug, Default)]
struct Counters {
    retries: AtomicU64,
    exhausted: AtomicU64,
}

/// Response-phase retry with delay.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    options: Arc<RetryOptions>,
    counters: Arc<Counters>,
}

impl RetryPolicy {
    /// Create the policy.
    #[must_use]
    pub fn new(options: RetryOptions) -> Self {
        Self {
            options: Arc::new(options),
            counters: Arc::default(),
        }
    }
}

impl ResponseInterceptor for RetryPolicy {
    fn on_response(&self, exchange: Exchange) -> InterceptFuture<Response> {
        let options = Arc::clone(&self.options);
        let counters = Arc::clone(&self.counters);

        Box::pin(async move {
            let Exchange {
                mut request,
                result,
                engine,
            } = exchange;

            let err = match result {
                Err(err) if options.is_retryable(&err) => err,
                other => return other,
            };

            let attempt = request.meta().retry_count;
            if attempt >= options.retries {
                if options.retries > 0 {
                    counters.exhausted.fetch_add(1, Ordering::Relaxed);
                    warn!(attempts = attempt, error = %err, "retries exhausted");
                }
                return Err(err);
            }

            let attempt = attempt + 1;
            request.meta_mut().retry_count = attempt;
            let delay = options.delay.for_attempt(attempt);
            counters.retries.fetch_add(1, Ordering::Relaxed);
            observe::retry();
            debug!(
                attempt,
                max = options.retries,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "scheduling retry"
            );

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            engine.execute(request).await
        })
    }
}

impl Policy for RetryPolicy {
    fn name(&self) -> PolicyName {
        PolicyName::Retry
    }

    fn interceptors(self: Arc<Self>) -> Interceptors {
        Interceptors {
            response: Some(self),
            ..Interceptors::default()
        }
    }

    fn stats(&self) -> PolicyStats {
        PolicyStats::Retry(RetryStats {
            retries: self.counters.retries.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert2::{check, let_assert};
    use tokio::time::Instant;

    use super::*;
    use crate::engine::tests::{MockService, engine, get};
    use crate::{Engine, Method, Request, RequestMeta};

    fn install(engine: &Engine, options: RetryOptions) -> Arc<RetryPolicy> {
        let policy = Arc::new(RetryPolicy::new(options));
        engine.install(Arc::clone(&policy).interceptors());
        policy
    }

    fn fast() -> RetryOptions {
        RetryOptions::default().delay(RetryDelay::Fixed(Duration::from_millis(10)))
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let mock = MockService::sequence(&[503, 0], 200);
        let engine = engine(&mock);
        let policy = install(&engine, fast());

        let_assert!(Ok(response) = engine.dispatch(get("https://example.com/")).await);
        check!(response.status() == 200);
        check!(mock.call_count() == 3);
        check!(mock.seen()[2].meta().retry_count == 2);
        check!(policy.stats() == PolicyStats::Retry(RetryStats { retries: 2, exhausted: 0 }));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bound() {
        let mock = MockService::new(500);
        let engine = engine(&mock);
        let policy = install(&engine, fast().retries(2));

        let_assert!(Err(err) = engine.dispatch(get("https://example.com/")).await);
        check!(err.status() == Some(500));
        check!(mock.call_count() == 3);
        check!(policy.stats() == PolicyStats::Retry(RetryStats { retries: 2, exhausted: 1 }));
    }

    #[tokio::test]
    async fn exhausted_counter_rejects_immediately() {
        let mock = MockService::new(500);
        let engine = engine(&mock);
        install(&engine, fast().retries(2));

        let request = Request::builder(Method::Get, "https://example.com/".parse().expect("url"))
            .meta(RequestMeta {
                retry_count: 2,
                ..RequestMeta::default()
            })
            .build();

        let_assert!(Err(_) = engine.dispatch(request).await);
        check!(mock.call_count() == 1);
    }

    #[tokio::test]
    async fn zero_retries_never_resubmits() {
        let mock = MockService::new(502);
        let engine = engine(&mock);
        install(&engine, fast().retries(0));

        let_assert!(Err(_) = engine.dispatch(get("https://example.com/")).await);
        check!(mock.call_count() == 1);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let mock = MockService::new(404);
        let engine = engine(&mock);
        install(&engine, fast());

        let_assert!(Err(err) = engine.dispatch(get("https://example.com/")).await);
        check!(err.status() == Some(404));
        check!(mock.call_count() == 1);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_predicate_wins() {
        let mock = MockService::sequence(&[429], 200);
        let engine = engine(&mock);
        install(&engine, fast().should_retry(|err| err.status() == Some(429)));

        let_assert!(Ok(_) = engine.dispatch(get("https://example.com/")).await);
        check!(mock.call_count() == 2);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_between_attempts() {
        let mock = MockService::new(503);
        let engine = engine(&mock);
        install(
            &engine,
            RetryOptions::default().retries(3).delay(RetryDelay::Exponential {
                base: Duration::from_millis(100),
                max: Duration::from_secs(1),
            }),
        );

        let start = Instant::now();
        let_assert!(Err(_) = engine.dispatch(get("https://example.com/")).await);
        check!(start.elapsed() >= Duration::from_millis(700));
        check!(mock.call_count() == 4);
    }

    #[test]
    fn exponential_delay_is_capped() {
        let delay = RetryDelay::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        check!(delay.for_attempt(1) == Duration::from_millis(100));
        check!(delay.for_attempt(3) == Duration::from_millis(400));
        check!(delay.for_attempt(4) == Duration::from_millis(500));
        check!(delay.for_attempt(64) == Duration::from_millis(500));

        let custom = RetryDelay::Custom(Arc::new(|n| Duration::from_millis(u64::from(n) * 7)));
        check!(custom.for_attempt(3) == Duration::from_millis(21));
    }

    #[test]
    fn default_predicate() {
        check!(is_retryable(&Error::connection("reset")));
        check!(is_retryable(&Error::Timeout));
        check!(is_retryable(&Error::http(Response::new(503, HashMap::new(), ""))));
        check!(!is_retryable(&Error::http(Response::new(400, HashMap::new(), ""))));
        check!(!is_retryable(&Error::cancelled("user")));
        check!(!is_retryable(&Error::protocol("bad")));
    }
}
