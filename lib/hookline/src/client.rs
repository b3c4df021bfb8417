//! Client facade tying the engine, manager, queue and cancellation together.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tower::util::BoxCloneService;
use tower::{Layer, Service};
use tracing::debug;

use crate::batch::{BatchCoalescer, BatchExecutor, BatchOptions};
use crate::cancel::CancelRegistry;
use crate::config::{ClientConfig, ClientConfigBuilder};
use crate::engine::{BoxedService, Engine};
use crate::manager::{CleanupReport, InterceptorManager, ManagerStatus, epoch_millis};
use crate::policy::{
    AuthOptions, CacheOptions, DedupeOptions, LoggingOptions, PolicyName, PolicyOptions,
    PolicyStats, RateLimitOptions, RetryOptions,
};
use crate::queue::{QueueStats, RequestQueue};
use crate::transport::HyperTransport;
use crate::{Error, HttpClient, Request, Response, Result};

/// Serializable picture of a client at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    /// Milliseconds since the Unix epoch.
    pub taken_at: u64,
    /// Manager status, including chain health.
    pub status: ManagerStatus,
    /// Counters of every policy built so far.
    pub stats: BTreeMap<PolicyName, PolicyStats>,
    /// Queue counters, if a queue is installed.
    pub queue: Option<QueueStats>,
    /// Keys of cancellable requests still in flight.
    pub pending_cancellations: Vec<String>,
}

struct ClientInner {
    engine: Engine,
    manager: InterceptorManager,
    queue: Mutex<Option<RequestQueue>>,
    batches: Mutex<Vec<BatchCoalescer>>,
    cancels: CancelRegistry,
}

/// HTTP client with switchable request-lifecycle policies. Cheap to clone.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use hookline::{CacheOptions, Client, Request, RetryDelay, RetryOptions};
///
/// # async fn run() -> hookline::Result<()> {
/// let client = Client::builder().timeout(Duration::from_secs(10)).build();
/// client
///     .use_retry(RetryOptions::default().retries(2).delay(RetryDelay::Fixed(Duration::from_millis(200))))?
///     .use_cache(CacheOptions::default().max_age(Duration::from_secs(60)))?
///     .use_queue(4)?;
///
/// let response = client.send(Request::get("https://example.com/items")?).await?;
/// println!("{}", response.status());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("engine", &self.inner.engine)
            .field("manager", &self.inner.manager)
            .field("queue", &self.queue())
            .finish_non_exhaustive()
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// Client over the default hyper transport, with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a new client builder.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    fn from_engine(engine: Engine) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                manager: InterceptorManager::new(engine.clone()),
                engine,
                queue: Mutex::default(),
                batches: Mutex::default(),
                cancels: CancelRegistry::new(),
            }),
        }
    }

    /// The underlying engine.
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Client configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        self.inner.engine.config()
    }

    /// The interceptor manager, for groups and conditional interceptors.
    #[must_use]
    pub fn interceptors(&self) -> &InterceptorManager {
        &self.inner.manager
    }

    fn queue(&self) -> Option<RequestQueue> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn batches(&self) -> MutexGuard<'_, Vec<BatchCoalescer>> {
        self.inner
            .batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Send `request` through the queue (if any) and every active policy.
    ///
    /// # Errors
    ///
    /// Returns the transport error or the error of the policy that rejected
    /// the request.
    pub async fn send(&self, request: Request) -> Result<Response> {
        match self.queue() {
            Some(queue) => {
                let engine = self.inner.engine.clone();
                queue.add(move || engine.dispatch(request)).await
            }
            None => self.inner.engine.dispatch(request).await,
        }
    }

    /// Like [`send`](Self::send), but abortable through [`cancel`](Self::cancel)
    /// with `key`. Sending another request under the same key cancels this one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the request was cancelled first.
    pub async fn send_cancellable(
        &self,
        request: Request,
        key: impl Into<String>,
    ) -> Result<Response> {
        let ticket = self.inner.cancels.create(key);
        let token = ticket.token().clone();

        let result = tokio::select! {
            biased;
            () = token.cancelled() => Err(Error::cancelled(format!(
                "request '{}' was cancelled",
                ticket.key()
            ))),
            result = self.send(request) => result,
        };

        self.inner.cancels.finish(&ticket);
        result
    }

    /// Cancel the pending request registered under `key`.
    pub fn cancel(&self, key: &str) -> bool {
        self.inner.cancels.cancel(key)
    }

    /// Cancel every pending cancellable request.
    pub fn cancel_all(&self) -> usize {
        self.inner.cancels.cancel_all()
    }

    /// A coalescer flushing through `executor`; it is shut down by
    /// [`reset`](Self::reset).
    ///
    /// Use [`fan_out`](crate::fan_out) with a clone of this client to send each
    /// item through the full pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `batch_size` is zero.
    pub fn batch(&self, options: BatchOptions, executor: BatchExecutor) -> Result<BatchCoalescer> {
        let batch = BatchCoalescer::new(options, executor)?;
        self.batches().push(batch.clone());
        Ok(batch)
    }

    // ========================================================================
    // Policies
    // ========================================================================

    fn use_policy(&self, options: PolicyOptions) -> Result<&Self> {
        self.inner.manager.use_policy(options)?;
        Ok(self)
    }

    fn remove_policy(&self, name: PolicyName) -> &Self {
        self.inner.manager.disable(name);
        self
    }

    /// Enable bearer injection and token refresh.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid.
    pub fn use_auth(&self, options: AuthOptions) -> Result<&Self> {
        self.use_policy(PolicyOptions::Auth(options))
    }

    /// Disable auth.
    pub fn remove_auth(&self) -> &Self {
        self.remove_policy(PolicyName::Auth)
    }

    /// Enable retries.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid.
    pub fn use_retry(&self, options: RetryOptions) -> Result<&Self> {
        self.use_policy(PolicyOptions::Retry(options))
    }

    /// Disable retries.
    pub fn remove_retry(&self) -> &Self {
        self.remove_policy(PolicyName::Retry)
    }

    /// Enable the response cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `max_size` is zero.
    pub fn use_cache(&self, options: CacheOptions) -> Result<&Self> {
        self.use_policy(PolicyOptions::Cache(options))
    }

    /// Disable the response cache. Cached entries are kept for a later
    /// [`use_cache`](Self::use_cache) only if the options are unchanged.
    pub fn remove_cache(&self) -> &Self {
        self.remove_policy(PolicyName::Cache)
    }

    /// Enable the rate limiter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a zero quota or window.
    pub fn use_rate_limit(&self, options: RateLimitOptions) -> Result<&Self> {
        self.use_policy(PolicyOptions::RateLimit(options))
    }

    /// Disable the rate limiter.
    pub fn remove_rate_limit(&self) -> &Self {
        self.remove_policy(PolicyName::RateLimit)
    }

    /// Enable request deduplication.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid.
    pub fn use_dedupe(&self, options: DedupeOptions) -> Result<&Self> {
        self.use_policy(PolicyOptions::Dedupe(options))
    }

    /// Disable request deduplication.
    pub fn remove_dedupe(&self) -> &Self {
        self.remove_policy(PolicyName::Dedupe)
    }

    /// Enable request logging.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid.
    pub fn use_logging(&self, options: LoggingOptions) -> Result<&Self> {
        self.use_policy(PolicyOptions::Logging(options))
    }

    /// Disable request logging.
    pub fn remove_logging(&self) -> &Self {
        self.remove_policy(PolicyName::Logging)
    }

    /// Bound concurrent requests to `max_concurrent`, replacing any queue.
    ///
    /// Requests already queued on a replaced queue still run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `max_concurrent` is zero.
    pub fn use_queue(&self, max_concurrent: usize) -> Result<&Self> {
        let queue = RequestQueue::new(max_concurrent)?;
        *self
            .inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(queue);
        debug!(max_concurrent, "request queue installed");
        Ok(self)
    }

    /// Stop queueing new requests.
    pub fn remove_queue(&self) -> &Self {
        let removed = self
            .inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if removed.is_some() {
            debug!("request queue removed");
        }
        self
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Tear everything down: uninstall every policy, drop groups and
    /// conditionals, cancel pending requests, clear the queue and shut down
    /// batch coalescers. Never fails; problems are listed in the report.
    pub fn reset(&self) -> CleanupReport {
        let report = self.inner.manager.cleanup();
        let cancelled = self.inner.cancels.cancel_all();
        let dropped = self.queue().map_or(0, |queue| queue.clear());
        let batches: Vec<_> = self.batches().drain(..).collect();
        let batched: usize = batches.iter().map(BatchCoalescer::shutdown).sum();
        debug!(cancelled, dropped, batched, "client reset");
        report
    }

    /// Capture status, counters and pending work.
    #[must_use]
    pub fn create_snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            taken_at: epoch_millis(),
            status: self.inner.manager.get_status(),
            stats: self.inner.manager.stats(),
            queue: self.queue().map(|queue| queue.stats()),
            pending_cancellations: self.inner.cancels.keys(),
        }
    }
}

impl HttpClient for Client {
    async fn execute(&self, request: Request) -> Result<Response> {
        self.send(request).await
    }
}

/// Builder for [`Client`].
#[derive(Default)]
pub struct ClientBuilder {
    config: ClientConfigBuilder,
    transport: Option<BoxedService>,
    layers: Vec<Box<dyn FnOnce(BoxedService) -> BoxedService + Send>>,
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("custom_transport", &self.transport.is_some())
            .field("layers_count", &self.layers.len())
            .finish()
    }
}

impl ClientBuilder {
    // ========================================================================
    // Core Configuration
    // ========================================================================

    /// Set the default request timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.timeout(timeout);
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.connect_timeout(timeout);
        self
    }

    /// Set the maximum idle connections per host.
    #[must_use]
    pub fn pool_idle_per_host(mut self, count: usize) -> Self {
        self.config = self.config.pool_idle_per_host(count);
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub fn pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.pool_idle_timeout(timeout);
        self
    }

    /// Header added to every request that does not set it.
    #[must_use]
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config = self.config.default_header(name, value);
        self
    }

    /// Whether non-2xx responses become [`Error::Http`] (default `true`).
    #[must_use]
    pub fn error_for_status(mut self, enabled: bool) -> Self {
        self.config = self.config.error_for_status(enabled);
        self
    }

    // ========================================================================
    // Transport
    // ========================================================================

    /// Use `transport` instead of the default hyper transport.
    #[must_use]
    pub fn transport(mut self, transport: BoxedService) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Wrap the transport in a Tower layer.
    ///
    /// Layers are applied in order, so the last one added is outermost. They
    /// sit below the interceptor chains and see every replay.
    #[must_use]
    pub fn layer<L>(mut self, layer: L) -> Self
    where
        L: Layer<BoxedService> + Send + 'static,
        L::Service: Service<Request, Response = Response, Error = Error> + Clone + Send + 'static,
        <L::Service as Service<Request>>::Future: Send + 'static,
    {
        self.layers
            .push(Box::new(move |service| BoxCloneService::new(layer.layer(service))));
        self
    }

    // ========================================================================
    // Build
    // ========================================================================

    /// Build the client.
    #[must_use]
    pub fn build(self) -> Client {
        let config = self.config.build();
        let mut service = self
            .transport
            .unwrap_or_else(|| BoxCloneService::new(HyperTransport::new(&config)));

        for layer_fn in self.layers {
            service = layer_fn(service);
        }

        Client::from_engine(Engine::new(service, config))
    }
}
