//! Interceptor engine: transport plus three ordered chains.
//!
//! A call to [`Engine::dispatch`] flows through:
//!
//! 1. dispatch interceptors, outermost first (each gets a [`Next`] to continue)
//! 2. request interceptors in registration order; any may mutate the request,
//!    short-circuit with [`RequestFlow::Respond`], or fail
//! 3. the transport, bounded by the request (or client) timeout
//! 4. response interceptors in reverse registration order, each turning the
//!    current `Result<Response>` into a new one and free to replay the request
//!    through [`Exchange::engine`]
//!
//! A short-circuited response is returned as is: it skips the transport and the
//! response chain. A request-phase error is returned to the caller directly.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use tower::ServiceExt;
use tower::util::BoxCloneService;
use tracing::debug;

use crate::chain::{InterceptorChain, InterceptorId, Phase};
use crate::config::ClientConfig;
use crate::{Error, Request, Response, Result};

/// Type-erased transport service.
pub type BoxedService = BoxCloneService<Request, Response, Error>;

/// Future returned by the engine and by dispatch interceptors.
pub type ServiceFuture = Pin<Box<dyn Future<Output = Result<Response>> + Send + 'static>>;

/// Future returned by request and response interceptors.
pub type InterceptFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'static>>;

/// Outcome of a request interceptor.
#[derive(Debug, Clone)]
pub enum RequestFlow {
    /// Keep going with this (possibly mutated) request.
    Continue(Request),
    /// Answer without calling the transport.
    Respond(Response),
}

/// Request-phase interceptor.
pub trait RequestInterceptor: Send + Sync + 'static {
    /// Inspect or mutate the outgoing request.
    fn on_request(&self, request: Request) -> InterceptFuture<RequestFlow>;
}

/// Response-phase interceptor, handling both the fulfilled and rejected path.
pub trait ResponseInterceptor: Send + Sync + 'static {
    /// Map the current result to a new one.
    fn on_response(&self, exchange: Exchange) -> InterceptFuture<Response>;
}

/// Interceptor wrapping the whole pipeline from the outside.
pub trait DispatchInterceptor: Send + Sync + 'static {
    /// Handle `request`, usually by eventually calling [`Next::run`].
    fn dispatch(&self, request: Request, next: Next) -> ServiceFuture;
}

/// What a response interceptor receives.
pub struct Exchange {
    /// The request as it left the request chain.
    pub request: Request,
    /// Transport result, as transformed by the interceptors before this one.
    pub result: Result<Response>,
    /// Handle used to replay the request.
    pub engine: Engine,
}

/// The rest of the dispatch chain.
pub struct Next {
    engine: Engine,
    remaining: VecDeque<Arc<dyn DispatchInterceptor>>,
}

impl Next {
    /// Continue with the next dispatch interceptor, or the engine pipeline.
    #[must_use]
    pub fn run(mut self, request: Request) -> ServiceFuture {
        match self.remaining.pop_front() {
            Some(interceptor) => interceptor.dispatch(request, self),
            None => self.engine.execute(request),
        }
    }

    /// The engine this chain belongs to.
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

/// Handlers a policy contributes to the engine, one per phase at most.
#[derive(Clone, Default)]
pub struct Interceptors {
    /// Request-phase handler.
    pub request: Option<Arc<dyn RequestInterceptor>>,
    /// Response-phase handler.
    pub response: Option<Arc<dyn ResponseInterceptor>>,
    /// Dispatch-phase handler.
    pub dispatch: Option<Arc<dyn DispatchInterceptor>>,
}

/// Ids handed out when [`Interceptors`] were installed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct Registration {
    /// Id in the request chain.
    pub request: Option<InterceptorId>,
    /// Id in the response chain.
    pub response: Option<InterceptorId>,
    /// Id in the dispatch chain.
    pub dispatch: Option<InterceptorId>,
}

impl Registration {
    /// Every `(phase, id)` pair held by this registration.
    #[must_use]
    pub fn ids(&self) -> Vec<(Phase, InterceptorId)> {
        [
            (Phase::Dispatch, self.dispatch),
            (Phase::Request, self.request),
            (Phase::Response, self.response),
        ]
        .into_iter()
        .filter_map(|(phase, id)| id.map(|id| (phase, id)))
        .collect()
    }
}

/// Mutex-guarded boxed service, cloned per call so the engine stays `Sync`.
#[derive(Clone)]
struct SyncService {
    inner: Arc<Mutex<BoxedService>>,
}

impl SyncService {
    fn new(service: BoxedService) -> Self {
        Self {
            inner: Arc::new(Mutex::new(service)),
        }
    }

    fn clone_service(&self) -> BoxedService {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct EngineInner {
    transport: SyncService,
    config: ClientConfig,
    dispatch_chain: InterceptorChain<dyn DispatchInterceptor>,
    request_chain: InterceptorChain<dyn RequestInterceptor>,
    response_chain: InterceptorChain<dyn ResponseInterceptor>,
}

/// Transport plus interceptor chains. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("dispatch_chain", &self.inner.dispatch_chain)
            .field("request_chain", &self.inner.request_chain)
            .field("response_chain", &self.inner.response_chain)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine over a type-erased transport.
    #[must_use]
    pub fn new(transport: BoxedService, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                transport: SyncService::new(transport),
                config,
                dispatch_chain: InterceptorChain::new(Phase::Dispatch),
                request_chain: InterceptorChain::new(Phase::Request),
                response_chain: InterceptorChain::new(Phase::Response),
            }),
        }
    }

    /// Client configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The dispatch chain.
    #[must_use]
    pub fn dispatch_chain(&self) -> &InterceptorChain<dyn DispatchInterceptor> {
        &self.inner.dispatch_chain
    }

    /// The request chain.
    #[must_use]
    pub fn request_chain(&self) -> &InterceptorChain<dyn RequestInterceptor> {
        &self.inner.request_chain
    }

    /// The response chain.
    #[must_use]
    pub fn response_chain(&self) -> &InterceptorChain<dyn ResponseInterceptor> {
        &self.inner.response_chain
    }

    /// Register every handler in `interceptors` on its chain.
    pub fn install(&self, interceptors: Interceptors) -> Registration {
        Registration {
            request: interceptors
                .request
                .map(|handler| self.inner.request_chain.use_interceptor(handler)),
            response: interceptors
                .response
                .map(|handler| self.inner.response_chain.use_interceptor(handler)),
            dispatch: interceptors
                .dispatch
                .map(|handler| self.inner.dispatch_chain.use_interceptor(handler)),
        }
    }

    /// Eject every id of `registration`, returning the phases whose id was
    /// already gone.
    pub fn uninstall(&self, registration: &Registration) -> Vec<Phase> {
        registration
            .ids()
            .into_iter()
            .filter(|(phase, id)| !self.eject(*phase, *id))
            .map(|(phase, _)| phase)
            .collect()
    }

    /// Eject a single id from the chain of `phase`.
    pub fn eject(&self, phase: Phase, id: InterceptorId) -> bool {
        match phase {
            Phase::Dispatch => self.inner.dispatch_chain.eject(id),
            Phase::Request => self.inner.request_chain.eject(id),
            Phase::Response => self.inner.response_chain.eject(id),
        }
    }

    /// Returns `true` if `id` is registered on the chain of `phase`.
    #[must_use]
    pub fn contains(&self, phase: Phase, id: InterceptorId) -> bool {
        match phase {
            Phase::Dispatch => self.inner.dispatch_chain.contains(id),
            Phase::Request => self.inner.request_chain.contains(id),
            Phase::Response => self.inner.response_chain.contains(id),
        }
    }

    /// Phases of `registration` whose id is no longer on its chain.
    #[must_use]
    pub fn missing(&self, registration: &Registration) -> Vec<Phase> {
        registration
            .ids()
            .into_iter()
            .filter(|(phase, id)| !self.contains(*phase, *id))
            .map(|(phase, _)| phase)
            .collect()
    }

    /// Run `request` through the dispatch chain and then the full pipeline.
    #[must_use]
    pub fn dispatch(&self, request: Request) -> ServiceFuture {
        Next {
            engine: self.clone(),
            remaining: self.inner.dispatch_chain.handlers().into(),
        }
        .run(request)
    }

    /// Run `request` through the request chain, transport and response chain.
    ///
    /// Dispatch interceptors are skipped, which is what replays use.
    #[must_use]
    pub fn execute(&self, request: Request) -> ServiceFuture {
        let engine = self.clone();
        Box::pin(async move {
            let request_handlers = engine.inner.request_chain.handlers();
            let response_handlers = engine.inner.response_chain.handlers();

            let mut request = request;
            engine.inner.config.apply_default_headers(&mut request);
            request
                .meta_mut()
                .started_at
                .get_or_insert_with(std::time::Instant::now);
            for handler in request_handlers {
                match handler.on_request(request).await? {
                    RequestFlow::Continue(next) => request = next,
                    RequestFlow::Respond(response) => {
                        debug!(status = response.status(), "request short-circuited");
                        return Ok(response);
                    }
                }
            }

            let mut result = engine.send_raw(request.clone()).await;
            for handler in response_handlers {
                result = handler
                    .on_response(Exchange {
                        request: request.clone(),
                        result,
                        engine: engine.clone(),
                    })
                    .await;
            }
            result
        })
    }

    /// Send `request` through the bare transport, bypassing every chain.
    ///
    /// The timeout and status validation still apply.
    #[must_use]
    pub fn send_raw(&self, request: Request) -> ServiceFuture {
        let service = self.inner.transport.clone_service();
        let timeout = self.inner.config.timeout_for(&request);
        let engine = self.clone();

        Box::pin(async move {
            let response = tokio::time::timeout(timeout, service.oneshot(request))
                .await
                .map_err(|_| Error::Timeout)??;

            if engine.inner.config.rejects(&response) {
                return Err(Error::http(response));
            }
            Ok(response)
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::task::{Context, Poll};
    use std::time::Duration;

    use assert2::{check, let_assert};
    use tower::Service;

    use super::*;

    /// Mock transport answering with a scripted sequence of statuses.
    #[derive(Clone)]
    pub(crate) struct MockService {
        statuses: Arc<Mutex<VecDeque<u16>>>,
        fallback: u16,
        delay: Duration,
        call_count: Arc<AtomicU32>,
        seen: Arc<Mutex<Vec<Request>>>,
    }

    impl MockService {
        pub(crate) fn new(status: u16) -> Self {
            Self {
                statuses: Arc::new(Mutex::new(VecDeque::new())),
                fallback: status,
                delay: Duration::ZERO,
                call_count: Arc::new(AtomicU32::new(0)),
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Answer with `statuses` in order, then with the fallback.
        pub(crate) fn sequence(statuses: &[u16], fallback: u16) -> Self {
            let mock = Self::new(fallback);
            mock.statuses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(statuses.iter().copied());
            mock
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub(crate) fn call_count(&self) -> u32 {
            self.call_count.load(Ordering::SeqCst)
        }

        pub(crate) fn seen(&self) -> Vec<Request> {
            self.seen
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        pub(crate) fn service(&self) -> BoxedService {
            BoxCloneService::new(self.clone())
        }
    }

    impl Service<Request> for MockService {
        type Response = Response;
        type Error = Error;
        type Future = ServiceFuture;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, request: Request) -> Self::Future {
            let call = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
            let status = self
                .statuses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
                .unwrap_or(self.fallback);
            self.seen
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request);
            let delay = self.delay;

            Box::pin(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if status == 0 {
                    return Err(Error::connection("connection refused"));
                }
                Ok(Response::new(status, HashMap::new(), format!("call-{call}")))
            })
        }
    }

    pub(crate) fn engine(mock: &MockService) -> Engine {
        Engine::new(mock.service(), ClientConfig::default())
    }

    pub(crate) fn get(url: &str) -> Request {
        Request::get(url).expect("valid url")
    }

    struct Tag(&'static str, Arc<Mutex<Vec<String>>>);

    impl RequestInterceptor for Tag {
        fn on_request(&self, mut request: Request) -> InterceptFuture<RequestFlow> {
            self.1
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(format!("req:{}", self.0));
            request.headers_mut().insert(self.0.to_string(), "1".to_string());
            Box::pin(async move { Ok(RequestFlow::Continue(request)) })
        }
    }

    impl ResponseInterceptor for Tag {
        fn on_response(&self, exchange: Exchange) -> InterceptFuture<Response> {
            self.1
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(format!("res:{}", self.0));
            Box::pin(async move { exchange.result })
        }
    }

    #[tokio::test]
    async fn chains_run_in_contract_order() {
        let mock = MockService::new(200);
        let engine = engine(&mock);
        let log = Arc::new(Mutex::new(Vec::new()));

        for name in ["a", "b"] {
            let tag = Arc::new(Tag(name, Arc::clone(&log)));
            engine.install(Interceptors {
                request: Some(tag.clone()),
                response: Some(tag),
                dispatch: None,
            });
        }

        let response = engine.dispatch(get("https://example.com/")).await;
        check!(response.is_ok());

        let log = log.lock().unwrap_or_else(PoisonError::into_inner).clone();
        check!(log == ["req:a", "req:b", "res:b", "res:a"]);

        let seen = mock.seen();
        check!(seen.len() == 1);
        check!(seen.first().and_then(|r| r.header("b")) == Some("1"));
    }

    struct ShortCircuit;

    impl RequestInterceptor for ShortCircuit {
        fn on_request(&self, _request: Request) -> InterceptFuture<RequestFlow> {
            Box::pin(async {
                Ok(RequestFlow::Respond(Response::new(
                    200,
                    HashMap::new(),
                    "cached",
                )))
            })
        }
    }

    #[tokio::test]
    async fn short_circuit_skips_transport() {
        let mock = MockService::new(500);
        let engine = engine(&mock);
        engine.install(Interceptors {
            request: Some(Arc::new(ShortCircuit)),
            ..Interceptors::default()
        });

        let response = engine.dispatch(get("https://example.com/")).await;
        let_assert!(Ok(response) = response);
        check!(response.body().as_ref() == b"cached");
        check!(mock.call_count() == 0);
    }

    #[tokio::test]
    async fn non_success_status_becomes_error() {
        let mock = MockService::new(503);
        let engine = engine(&mock);

        let_assert!(Err(err) = engine.dispatch(get("https://example.com/")).await);
        check!(err.status() == Some(503));
        check!(err.response().is_some());
    }

    #[tokio::test]
    async fn status_validation_can_be_disabled() {
        let mock = MockService::new(404);
        let config = ClientConfig::builder().error_for_status(false).build();
        let engine = Engine::new(mock.service(), config);

        let_assert!(Ok(response) = engine.dispatch(get("https://example.com/")).await);
        check!(response.status() == 404);
    }

    #[tokio::test(start_paused = true)]
    async fn request_timeout_overrides_default() {
        let mock = MockService::new(200).with_delay(Duration::from_secs(5));
        let engine = engine(&mock);

        let request = Request::builder(crate::Method::Get, "https://example.com/".parse().expect("url"))
            .timeout(Duration::from_secs(1))
            .build();

        let_assert!(Err(err) = engine.dispatch(request).await);
        check!(err.is_timeout());
    }

    #[tokio::test]
    async fn uninstall_reports_manual_ejection() {
        let mock = MockService::new(200);
        let engine = engine(&mock);
        let tag = Arc::new(Tag("a", Arc::new(Mutex::new(Vec::new()))));
        let registration = engine.install(Interceptors {
            request: Some(tag.clone()),
            response: Some(tag),
            dispatch: None,
        });

        let_assert!(Some(request_id) = registration.request);
        check!(engine.request_chain().eject(request_id));
        check!(engine.missing(&registration) == [Phase::Request]);

        check!(engine.uninstall(&registration) == [Phase::Request]);
        check!(engine.request_chain().is_empty());
        check!(engine.response_chain().is_empty());
    }
}
