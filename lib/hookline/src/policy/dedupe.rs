//! Collapse identical in-flight requests into one shared future.
//!
//! Runs as a dispatch interceptor, outside the request and response chains,
//! so replays issued by retry or token refresh never join a pending entry of
//! their own original request.
//!
//! The table only holds weak handles. Once every caller of a request has gone
//! away the underlying call is dropped and its entry removed.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::WeakShared;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use super::{KeyFn, Policy, PolicyName, PolicyStats};
use crate::engine::{DispatchInterceptor, Interceptors, Next, ServiceFuture};
use crate::{Request, observe};

/// Default dedupe key: method, full URL and body.
#[must_use]
pub fn default_dedupe_key(request: &Request) -> String {
    let body = request
        .body()
        .map(|body| String::from_utf8_lossy(body).into_owned())
        .unwrap_or_default();
    format!("{} {} {body}", request.method(), request.url())
}

/// Options for [`DedupePolicy`].
#[derive(Clone)]
pub struct DedupeOptions {
    ttl: Duration,
    key: Option<KeyFn>,
}

impl Default for DedupeOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            key: None,
        }
    }
}

impl fmt::Debug for DedupeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupeOptions")
            .field("ttl", &self.ttl)
            .field("custom_key", &self.key.is_some())
            .finish()
    }
}

impl DedupeOptions {
    /// How long a pending request may be joined.
    #[must_use]
    pub const fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Replace [`default_dedupe_key`].
    #[must_use]
    pub fn key(mut self, key: impl Fn(&Request) -> String + Send + Sync + 'static) -> Self {
        self.key = Some(Arc::new(key));
        self
    }

    fn key_for(&self, request: &Request) -> String {
        match &self.key {
            Some(key) => key(request),
            None => default_dedupe_key(request),
        }
    }
}

/// Dedupe counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupeStats {
    /// Calls that joined a pending request.
    pub joined: u64,
    /// Requests currently pending.
    pub pending: usize,
}

struct Pending {
    id: u64,
    future: WeakShared<ServiceFuture>,
    started: Instant,
}

/// Settles a pending entry when the shared call completes or is dropped.
struct SettleGuard {
    inner: Arc<DedupeInner>,
    key: String,
    id: u64,
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        self.inner.settle(&self.key, self.id);
    }
}

struct DedupeInner {
    options: DedupeOptions,
    pending: Mutex<HashMap<String, Pending>>,
    next_id: AtomicU64,
    joined: AtomicU64,
}

impl DedupeInner {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove `key` only if it still belongs to request `id`.
    fn settle(&self, key: &str, id: u64) {
        let mut pending = self.pending();
        if pending.get(key).is_some_and(|entry| entry.id == id) {
            pending.remove(key);
        }
    }
}

/// In-flight request deduplication.
#[derive(Clone)]
pub struct DedupePolicy {
    inner: Arc<DedupeInner>,
}

impl fmt::Debug for DedupePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupePolicy")
            .field("options", &self.inner.options)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl DedupePolicy {
    /// Create the policy.
    #[must_use]
    pub fn new(options: DedupeOptions) -> Self {
        Self {
            inner: Arc::new(DedupeInner {
                options,
                pending: Mutex::default(),
                next_id: AtomicU64::new(0),
                joined: AtomicU64::new(0),
            }),
        }
    }

    /// Number of requests currently pending.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }
}

impl DispatchInterceptor for DedupePolicy {
    fn dispatch(&self, request: Request, next: Next) -> ServiceFuture {
        let key = self.inner.options.key_for(&request);
        let mut pending = self.inner.pending();

        // Upgrade only when joining: the returned clone keeps the call alive,
        // so the last handle is never dropped while the table is locked.
        if let Some(shared) = pending
            .get(&key)
            .filter(|entry| entry.started.elapsed() < self.inner.options.ttl)
            .and_then(|entry| entry.future.upgrade())
        {
            self.inner.joined.fetch_add(1, Ordering::Relaxed);
            observe::dedupe_joined();
            debug!(%key, "joining in-flight request");
            return Box::pin(shared);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = SettleGuard {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
            id,
        };
        let future: ServiceFuture = Box::pin(async move {
            let _settle = guard;
            next.run(request).await
        });
        let shared = future.shared();
        if let Some(weak) = shared.downgrade() {
            pending.insert(
                key,
                Pending {
                    id,
                    future: weak,
                    started: Instant::now(),
                },
            );
        }
        Box::pin(shared)
    }
}

impl Policy for DedupePolicy {
    fn name(&self) -> PolicyName {
        PolicyName::Dedupe
    }

    fn interceptors(self: Arc<Self>) -> Interceptors {
        Interceptors {
            dispatch: Some(self),
            ..Interceptors::default()
        }
    }

    fn reset(&self) {
        self.inner.pending().clear();
    }

    fn stats(&self) -> PolicyStats {
        PolicyStats::Dedupe(DedupeStats {
            joined: self.inner.joined.load(Ordering::Relaxed),
            pending: self.pending_count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};

    use super::*;
    use crate::engine::tests::{MockService, engine, get};
    use crate::{Engine, Method};

    fn install(engine: &Engine, options: DedupeOptions) -> Arc<DedupePolicy> {
        let policy = Arc::new(DedupePolicy::new(options));
        engine.install(Arc::clone(&policy).interceptors());
        policy
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_identical_requests_share_one_call() {
        let mock = MockService::new(200).with_delay(Duration::from_millis(50));
        let engine = engine(&mock);
        let policy = install(&engine, DedupeOptions::default());

        let (a, b, c) = tokio::join!(
            engine.dispatch(get("https://example.com/items")),
            engine.dispatch(get("https://example.com/items")),
            engine.dispatch(get("https://example.com/items")),
        );

        check!(mock.call_count() == 1);
        for result in [a, b, c] {
            let_assert!(Ok(response) = result);
            check!(response.body().as_ref() == b"call-1");
        }
        check!(policy.pending_count() == 0);
        check!(policy.stats() == PolicyStats::Dedupe(DedupeStats { joined: 2, pending: 0 }));
    }

    #[tokio::test(start_paused = true)]
    async fn bodies_are_part_of_the_key() {
        let mock = MockService::new(200).with_delay(Duration::from_millis(50));
        let engine = engine(&mock);
        install(&engine, DedupeOptions::default());

        let post = |body: &'static str| {
            Request::builder(Method::Post, "https://example.com/items".parse().expect("url"))
                .body(body)
                .build()
        };
        let (a, b) = tokio::join!(engine.dispatch(post("one")), engine.dispatch(post("two")));
        check!(a.is_ok());
        check!(b.is_ok());
        check!(mock.call_count() == 2);
    }

    #[tokio::test]
    async fn settled_requests_are_removed() {
        let mock = MockService::sequence(&[500], 200);
        let engine = engine(&mock);
        let policy = install(&engine, DedupeOptions::default());

        let_assert!(Err(_) = engine.dispatch(get("https://example.com/")).await);
        check!(policy.pending_count() == 0);

        let_assert!(Ok(_) = engine.dispatch(get("https://example.com/")).await);
        check!(policy.pending_count() == 0);
        check!(mock.call_count() == 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_not_joined() {
        let mock = MockService::new(200).with_delay(Duration::from_secs(5));
        let engine = engine(&mock);
        install(&engine, DedupeOptions::default().ttl(Duration::from_secs(1)));

        let first = tokio::spawn(engine.dispatch(get("https://example.com/slow")));
        tokio::time::sleep(Duration::from_secs(2)).await;
        let second = engine.dispatch(get("https://example.com/slow")).await;

        let_assert!(Ok(Ok(first)) = first.await);
        let_assert!(Ok(second) = second);
        check!(first.body().as_ref() == b"call-1");
        check!(second.body().as_ref() == b"call-2");
        check!(mock.call_count() == 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_request_is_dropped_and_forgotten() {
        let mock = MockService::new(200).with_delay(Duration::from_secs(5));
        let engine = engine(&mock);
        let policy = install(&engine, DedupeOptions::default().ttl(Duration::from_secs(60)));

        let abandoned = tokio::time::timeout(
            Duration::from_secs(1),
            engine.dispatch(get("https://example.com/report")),
        )
        .await;
        check!(abandoned.is_err());
        check!(policy.pending_count() == 0);

        let_assert!(Ok(response) = engine.dispatch(get("https://example.com/report")).await);
        check!(response.body().as_ref() == b"call-2");
        check!(mock.call_count() == 2);
        check!(policy.stats() == PolicyStats::Dedupe(DedupeStats { joined: 0, pending: 0 }));
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_caller_keeps_shared_call_alive() {
        let mock = MockService::new(200).with_delay(Duration::from_secs(5));
        let engine = engine(&mock);
        let policy = install(&engine, DedupeOptions::default());

        let kept = tokio::spawn(engine.dispatch(get("https://example.com/report")));
        tokio::task::yield_now().await;
        let dropped = tokio::time::timeout(
            Duration::from_secs(1),
            engine.dispatch(get("https://example.com/report")),
        )
        .await;
        check!(dropped.is_err());
        check!(policy.pending_count() == 1);

        let_assert!(Ok(Ok(response)) = kept.await);
        check!(response.body().as_ref() == b"call-1");
        check!(mock.call_count() == 1);
        check!(policy.pending_count() == 0);
    }

    #[test]
    fn default_key_includes_method_url_and_body() {
        let request = Request::builder(Method::Put, "https://example.com/a?b=1".parse().expect("url"))
            .body("{}")
            .build();
        check!(default_dedupe_key(&request) == "PUT https://example.com/a?b=1 {}");
    }
}
