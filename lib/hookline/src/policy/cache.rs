//! GET response memoization bounded by entry count and age.
//!
//! Eviction is insertion-ordered: when the store is full the oldest inserted
//! entry goes, whether or not it was read recently. Entries older than
//! `max_age` are treated as absent on lookup and swept before every insert.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{KeyFn, Policy, PolicyName, PolicyStats};
use crate::engine::{
    Exchange, InterceptFuture, Interceptors, RequestFlow, RequestInterceptor, ResponseInterceptor,
};
use crate::{Error, Method, Request, Response, Result, observe};

/// Default cache key: method and full URL, query string included.
#[must_use]
pub fn default_cache_key(request: &Request) -> String {
    format!("{} {}", request.method(), request.url())
}

/// Options for [`CachePolicy`].
#[derive(Clone)]
pub struct CacheOptions {
    max_size: usize,
    max_age: Duration,
    key: Option<KeyFn>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_age: Duration::from_secs(5 * 60),
            key: None,
        }
    }
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("max_size", &self.max_size)
            .field("max_age", &self.max_age)
            .field("custom_key", &self.key.is_some())
            .finish()
    }
}

impl CacheOptions {
    /// Maximum number of entries.
    #[must_use]
    pub const fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Age after which an entry is stale.
    #[must_use]
    pub const fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Replace [`default_cache_key`].
    #[must_use]
    pub fn key(mut self, key: impl Fn(&Request) -> String + Send + Sync + 'static) -> Self {
        self.key = Some(Arc::new(key));
        self
    }

    fn key_for(&self, request: &Request) -> String {
        match &self.key {
            Some(key) => key(request),
            None => default_cache_key(request),
        }
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that went to the transport.
    pub misses: u64,
    /// Entries dropped to make room.
    pub evictions: u64,
    /// Entries currently stored.
    pub size: usize,
}

struct Entry {
    response: Response,
    inserted: Instant,
}

#[derive(Default)]
struct Store {
    entries: HashMap<String, Entry>,
    order: VecDeque<String>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl Store {
    fn lookup(&mut self, key: &str, max_age: Duration) -> Option<Response> {
        let state = self.entries.get(key).map(|entry| {
            (entry.inserted.elapsed() < max_age).then(|| entry.response.clone())
        });
        let fresh = match state {
            Some(Some(response)) => Some(response),
            Some(None) => {
                self.remove(key);
                None
            }
            None => None,
        };
        if fresh.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        fresh
    }

    fn remove(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }

    /// Drop expired entries; insertion order is also age order.
    fn sweep(&mut self, max_age: Duration) {
        while let Some(oldest) = self.order.front() {
            let expired = self
                .entries
                .get(oldest)
                .is_none_or(|entry| entry.inserted.elapsed() >= max_age);
            if !expired {
                break;
            }
            if let Some(key) = self.order.pop_front() {
                self.entries.remove(&key);
            }
        }
    }

    fn insert(&mut self, key: String, response: Response, max_size: usize) {
        self.remove(&key);
        while self.entries.len() >= max_size {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
            self.evictions += 1;
            observe::cache_eviction();
            debug!(key = %oldest, "evicted cache entry");
        }
        self.order.push_back(key.clone());
        self.entries.insert(
            key,
            Entry {
                response,
                inserted: Instant::now(),
            },
        );
    }
}

struct CacheInner {
    options: CacheOptions,
    store: Mutex<Store>,
}

impl CacheInner {
    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Response cache for GET requests.
#[derive(Clone)]
pub struct CachePolicy {
    inner: Arc<CacheInner>,
}

impl fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePolicy")
            .field("options", &self.inner.options)
            .field("size", &self.len())
            .finish()
    }
}

impl CachePolicy {
    /// Create the policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `max_size` is zero.
    pub fn new(options: CacheOptions) -> Result<Self> {
        if options.max_size == 0 {
            return Err(Error::validation("cache max_size must be at least 1"));
        }
        Ok(Self {
            inner: Arc::new(CacheInner {
                options,
                store: Mutex::default(),
            }),
        })
    }

    /// Number of stored entries, stale ones included until swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.store().entries.len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if `key` has a stored entry.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.store().entries.contains_key(key)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut store = self.inner.store();
        store.entries.clear();
        store.order.clear();
    }
}

impl RequestInterceptor for CachePolicy {
    fn on_request(&self, request: Request) -> InterceptFuture<RequestFlow> {
        let flow = if request.method() == Method::Get {
            let key = self.inner.options.key_for(&request);
            let cached = self.inner.store().lookup(&key, self.inner.options.max_age);
            observe::cache_lookup(cached.is_some());
            match cached {
                Some(response) => {
                    trace!(%key, "cache hit");
                    RequestFlow::Respond(response)
                }
                None => RequestFlow::Continue(request),
            }
        } else {
            RequestFlow::Continue(request)
        };
        Box::pin(async move { Ok(flow) })
    }
}

impl ResponseInterceptor for CachePolicy {
    fn on_response(&self, exchange: Exchange) -> InterceptFuture<Response> {
        let Exchange {
            request, result, ..
        } = exchange;

        if let Ok(response) = &result
            && request.method() == Method::Get
            && response.is_success()
        {
            let options = &self.inner.options;
            let key = options.key_for(&request);
            let mut store = self.inner.store();
            store.sweep(options.max_age);
            store.insert(key, response.clone(), options.max_size);
        }
        Box::pin(async move { result })
    }
}

impl Policy for CachePolicy {
    fn name(&self) -> PolicyName {
        PolicyName::Cache
    }

    fn interceptors(self: Arc<Self>) -> Interceptors {
        Interceptors {
            request: Some(self.clone()),
            response: Some(self),
            dispatch: None,
        }
    }

    fn reset(&self) {
        self.clear();
    }

    fn stats(&self) -> PolicyStats {
        let store = self.inner.store();
        PolicyStats::Cache(CacheStats {
            hits: store.hits,
            misses: store.misses,
            evictions: store.evictions,
            size: store.entries.len(),
        })
    }
}
