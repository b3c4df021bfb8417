//! Bearer credential injection with single-flight token refresh.
//!
//! The request phase sets `Authorization: Bearer <token>` from a token accessor.
//! The response phase watches for the authorization-failure status (401 by
//! default). The first such failure starts a refresh call; failures arriving
//! while it is pending join the same [`Shared`] future instead of issuing a
//! second call. Once the refresh settles the slot is cleared, so a later 401
//! can start a new one.
//!
//! A replayed request carries [`RequestMeta::auth_retried`](crate::RequestMeta)
//! and is never refreshed twice.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Policy, PolicyName, PolicyStats};
use crate::engine::{
    Engine, Exchange, InterceptFuture, Interceptors, RequestFlow, RequestInterceptor,
    ResponseInterceptor,
};
use crate::{Error, Method, Request, Response, Result, observe};

/// Reads the current access or refresh token.
pub type TokenAccessor = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Persists a freshly obtained token pair.
pub type TokenSetter = Arc<dyn Fn(&TokenPair) + Send + Sync>;

/// Builds the refresh call from the current refresh token.
pub type RefreshRequestBuilder = Arc<dyn Fn(&str) -> Result<Request> + Send + Sync>;

/// Extracts the new token pair from the refresh response.
pub type RefreshResponseParser = Arc<dyn Fn(&Response) -> Result<TokenPair> + Send + Sync>;

/// Called when no refresh is possible or the refresh call failed.
pub type RefreshFailureHandler = Arc<dyn Fn(&Error) + Send + Sync>;

type RefreshFuture = Shared<BoxFuture<'static, Result<String>>>;

/// Access token plus an optional rotated refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    /// New access token.
    pub access_token: String,
    /// New refresh token, if the server rotated it.
    pub refresh_token: Option<String>,
}

impl TokenPair {
    /// Pair without a refresh token.
    #[must_use]
    pub fn access(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
        }
    }
}

/// Wire shape accepted by the default refresh parser.
#[derive(Deserialize)]
struct RefreshBody {
    #[serde(rename = "accessToken", alias = "access_token")]
    access_token: Option<String>,
    #[serde(rename = "refreshToken", alias = "refresh_token")]
    refresh_token: Option<String>,
}

fn parse_refresh_response(response: &Response) -> Result<TokenPair> {
    let body: RefreshBody = serde_json::from_slice(response.body())
        .map_err(|e| Error::protocol(format!("invalid refresh response: {e}")))?;

    match body.access_token {
        Some(access_token) if !access_token.is_empty() => Ok(TokenPair {
            access_token,
            refresh_token: body.refresh_token.filter(|token| !token.is_empty()),
        }),
        _ => Err(Error::protocol("refresh response has no access token")),
    }
}

/// In-memory token pair, usable as accessor and setter.
///
/// A [`TokenPair`] without a refresh token keeps the stored one.
#[derive(Debug, Clone, Default)]
pub struct MemoryTokenStore {
    inner: Arc<Mutex<Option<TokenPair>>>,
}

impl MemoryTokenStore {
    /// Store seeded with `access_token` and `refresh_token`.
    #[must_use]
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        let store = Self::default();
        store.set(&TokenPair {
            access_token: access_token.into(),
            refresh_token: Some(refresh_token.into()),
        });
        store
    }

    /// Current access token.
    #[must_use]
    pub fn access_token(&self) -> Option<String> {
        self.lock().as_ref().map(|pair| pair.access_token.clone())
    }

    /// Current refresh token.
    #[must_use]
    pub fn refresh_token(&self) -> Option<String> {
        self.lock()
            .as_ref()
            .and_then(|pair| pair.refresh_token.clone())
    }

    /// Replace the access token, and the refresh token when one is given.
    pub fn set(&self, tokens: &TokenPair) {
        let mut slot = self.lock();
        let refresh_token = tokens
            .refresh_token
            .clone()
            .or_else(|| slot.as_ref().and_then(|pair| pair.refresh_token.clone()));
        *slot = Some(TokenPair {
            access_token: tokens.access_token.clone(),
            refresh_token,
        });
    }

    /// Forget both tokens.
    pub fn clear(&self) {
        *self.lock() = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<TokenPair>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Options for [`AuthPolicy`].
#[derive(Clone)]
pub struct AuthOptions {
    get_token: TokenAccessor,
    get_refresh_token: Option<TokenAccessor>,
    set_tokens: Option<TokenSetter>,
    refresh_url: Option<url::Url>,
    refresh_request: Option<RefreshRequestBuilder>,
    refresh_parser: Option<RefreshResponseParser>,
    on_refresh_failure: Option<RefreshFailureHandler>,
    header_name: String,
    scheme: String,
    failure_status: u16,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self::new(|| None)
    }
}

impl fmt::Debug for AuthOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthOptions")
            .field("refresh_url", &self.refresh_url)
            .field("custom_refresh_request", &self.refresh_request.is_some())
            .field("header_name", &self.header_name)
            .field("scheme", &self.scheme)
            .field("failure_status", &self.failure_status)
            .finish_non_exhaustive()
    }
}

impl AuthOptions {
    /// Options reading the access token from `get_token`.
    #[must_use]
    pub fn new(get_token: impl Fn() -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            get_token: Arc::new(get_token),
            get_refresh_token: None,
            set_tokens: None,
            refresh_url: None,
            refresh_request: None,
            refresh_parser: None,
            on_refresh_failure: None,
            header_name: "Authorization".to_string(),
            scheme: "Bearer".to_string(),
            failure_status: 401,
        }
    }

    /// Options wired to `store` for reading and persisting tokens.
    #[must_use]
    pub fn from_store(store: &MemoryTokenStore) -> Self {
        let access = store.clone();
        let refresh = store.clone();
        let setter = store.clone();
        Self::new(move || access.access_token())
            .refresh_token(move || refresh.refresh_token())
            .on_tokens(move |tokens| setter.set(tokens))
    }

    /// Endpoint for the default refresh call.
    #[must_use]
    pub fn refresh_url(mut self, url: url::Url) -> Self {
        self.refresh_url = Some(url);
        self
    }

    /// Accessor for the refresh token.
    #[must_use]
    pub fn refresh_token(
        mut self,
        get_refresh_token: impl Fn() -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.get_refresh_token = Some(Arc::new(get_refresh_token));
        self
    }

    /// Setter receiving the refreshed tokens.
    #[must_use]
    pub fn on_tokens(mut self, set_tokens: impl Fn(&TokenPair) + Send + Sync + 'static) -> Self {
        self.set_tokens = Some(Arc::new(set_tokens));
        self
    }

    /// Replace the default `POST <refresh_url>` refresh call.
    #[must_use]
    pub fn refresh_request(
        mut self,
        builder: impl Fn(&str) -> Result<Request> + Send + Sync + 'static,
    ) -> Self {
        self.refresh_request = Some(Arc::new(builder));
        self
    }

    /// Replace the default JSON refresh response parser.
    #[must_use]
    pub fn refresh_parser(
        mut self,
        parser: impl Fn(&Response) -> Result<TokenPair> + Send + Sync + 'static,
    ) -> Self {
        self.refresh_parser = Some(Arc::new(parser));
        self
    }

    /// Callback fired when the refresh cannot happen or fails.
    #[must_use]
    pub fn on_refresh_failure(mut self, handler: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_refresh_failure = Some(Arc::new(handler));
        self
    }

    /// Header name and scheme; an empty scheme sends the bare token.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, scheme: impl Into<String>) -> Self {
        self.header_name = name.into();
        self.scheme = scheme.into();
        self
    }

    /// Status treated as an authorization failure.
    #[must_use]
    pub const fn failure_status(mut self, status: u16) -> Self {
        self.failure_status = status;
        self
    }

    fn can_refresh(&self) -> bool {
        self.refresh_request.is_some() || self.refresh_url.is_some()
    }

    fn header_value(&self, token: &str) -> String {
        if self.scheme.is_empty() {
            token.to_string()
        } else {
            format!("{} {token}", self.scheme)
        }
    }

    fn build_refresh_request(&self, refresh_token: &str) -> Result<Request> {
        if let Some(builder) = &self.refresh_request {
            return builder(refresh_token);
        }
        let url = self
            .refresh_url
            .clone()
            .ok_or_else(|| Error::invalid_request("no refresh url configured"))?;
        Ok(Request::builder(Method::Post, url)
            .json(&serde_json::json!({ "refreshToken": refresh_token }))?
            .build())
    }

    fn fail(&self, err: &Error) {
        if let Some(handler) = &self.on_refresh_failure {
            handler(err);
        }
    }
}

/// Auth counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuthStats {
    /// Refresh calls issued.
    pub refreshes: u64,
    /// Refresh attempts that failed or could not start.
    pub refresh_failures: u64,
    /// Requests replayed with a refreshed token.
    pub replays: u64,
}

struct AuthInner {
    options: AuthOptions,
    in_flight: Mutex<Option<(u64, RefreshFuture)>>,
    next_refresh: AtomicU64,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    replays: AtomicU64,
}

impl AuthInner {
    fn slot(&self) -> std::sync::MutexGuard<'_, Option<(u64, RefreshFuture)>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join the pending refresh, or start one.
    ///
    /// Returns `None` when there is no refresh token to start with.
    fn refresh_future(self: &Arc<Self>, engine: &Engine) -> Option<RefreshFuture> {
        let mut slot = self.slot();
        if let Some((_, pending)) = slot.as_ref() {
            debug!("joining in-flight token refresh");
            return Some(pending.clone());
        }

        let refresh_token = self
            .options
            .get_refresh_token
            .as_ref()
            .and_then(|get| get())
            .filter(|token| !token.is_empty())?;

        let id = self.next_refresh.fetch_add(1, Ordering::Relaxed);
        let future = Arc::clone(self)
            .refresh(engine.clone(), refresh_token, id)
            .boxed()
            .shared();
        *slot = Some((id, future.clone()));
        Some(future)
    }

    async fn refresh(
        self: Arc<Self>,
        engine: Engine,
        refresh_token: String,
        id: u64,
    ) -> Result<String> {
        info!("refreshing access token");
        self.refreshes.fetch_add(1, Ordering::Relaxed);

        let result = self.call_refresh(&engine, &refresh_token).await;
        {
            // A reset may have let a newer refresh take the slot.
            let mut slot = self.slot();
            if slot.as_ref().is_some_and(|(current, _)| *current == id) {
                slot.take();
            }
        }

        match &result {
            Ok(_) => {
                observe::token_refresh(true);
                debug!("access token refreshed");
            }
            Err(err) => {
                observe::token_refresh(false);
                self.refresh_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "token refresh failed");
                self.options.fail(err);
            }
        }
        result
    }

    async fn call_refresh(&self, engine: &Engine, refresh_token: &str) -> Result<String> {
        let request = self.options.build_refresh_request(refresh_token)?;
        let response = engine.send_raw(request).await?;
        if !response.is_success() {
            return Err(Error::http(response));
        }

        let tokens = match &self.options.refresh_parser {
            Some(parser) => parser(&response)?,
            None => parse_refresh_response(&response)?,
        };
        if let Some(set_tokens) = &self.options.set_tokens {
            set_tokens(&tokens);
        }
        Ok(tokens.access_token)
    }
}

/// Bearer injection plus single-flight refresh.
#[derive(Clone)]
pub struct AuthPolicy {
    inner: Arc<AuthInner>,
}

impl fmt::Debug for AuthPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthPolicy")
            .field("options", &self.inner.options)
            .field("refreshing", &self.is_refreshing())
            .finish()
    }
}

impl AuthPolicy {
    /// Create the policy.
    #[must_use]
    pub fn new(options: AuthOptions) -> Self {
        Self {
            inner: Arc::new(AuthInner {
                options,
                in_flight: Mutex::new(None),
                next_refresh: AtomicU64::new(0),
                refreshes: AtomicU64::new(0),
                refresh_failures: AtomicU64::new(0),
                replays: AtomicU64::new(0),
            }),
        }
    }

    /// Returns `true` while a refresh call is pending.
    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.inner.slot().is_some()
    }
}

impl RequestInterceptor for AuthPolicy {
    fn on_request(&self, mut request: Request) -> InterceptFuture<RequestFlow> {
        let options = &self.inner.options;
        let replayed = request.meta().auth_retried && request.header(&options.header_name).is_some();

        if !replayed {
            if let Some(token) = (options.get_token)().filter(|token| !token.is_empty()) {
                request
                    .headers_mut()
                    .insert(options.header_name.clone(), options.header_value(&token));
            }
        }
        Box::pin(async move { Ok(RequestFlow::Continue(request)) })
    }
}

impl ResponseInterceptor for AuthPolicy {
    fn on_response(&self, exchange: Exchange) -> InterceptFuture<Response> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let Exchange {
                mut request,
                result,
                engine,
            } = exchange;
            let options = &inner.options;

            let original = match result {
                Err(err) if err.status() == Some(options.failure_status) => err,
                other => return other,
            };
            if request.meta().auth_retried || !options.can_refresh() {
                return Err(original);
            }
            request.meta_mut().auth_retried = true;

            let Some(refresh) = inner.refresh_future(&engine) else {
                warn!(status = options.failure_status, "no refresh token available");
                inner.refresh_failures.fetch_add(1, Ordering::Relaxed);
                options.fail(&original);
                return Err(original);
            };

            let token = refresh.await?;
            request
                .headers_mut()
                .insert(options.header_name.clone(), options.header_value(&token));
            inner.replays.fetch_add(1, Ordering::Relaxed);
            debug!(url = %request.url(), "replaying request with refreshed token");
            engine.execute(request).await
        })
    }
}

impl Policy for AuthPolicy {
    fn name(&self) -> PolicyName {
        PolicyName::Auth
    }

    fn interceptors(self: Arc<Self>) -> Interceptors {
        Interceptors {
            request: Some(self.clone()),
            response: Some(self),
            dispatch: None,
        }
    }

    fn reset(&self) {
        self.inner.slot().take();
    }

    fn stats(&self) -> PolicyStats {
        PolicyStats::Auth(AuthStats {
            refreshes: self.inner.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.inner.refresh_failures.load(Ordering::Relaxed),
            replays: self.inner.replays.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use assert2::{check, let_assert};
    use tower::service_fn;
    use tower::util::BoxCloneService;

    use super::*;
    use crate::config::ClientConfig;
    use crate::engine::tests::{MockService, engine, get};

    const REFRESH_URL: &str = "https://auth.example.com/refresh";

    /// Transport where `/data` wants `Bearer fresh` and `/refresh` answers
    /// with `refresh_body` after 100ms.
    #[derive(Clone)]
    struct AuthServer {
        refresh_calls: Arc<AtomicU32>,
        data_calls: Arc<AtomicU32>,
        refresh_body: &'static str,
    }

    impl AuthServer {
        fn new(refresh_body: &'static str) -> Self {
            Self {
                refresh_calls: Arc::new(AtomicU32::new(0)),
                data_calls: Arc::new(AtomicU32::new(0)),
                refresh_body,
            }
        }

        fn engine(&self) -> Engine {
            let server = self.clone();
            let service = service_fn(move |request: Request| {
                let server = server.clone();
                async move {
                    if request.url().path() == "/refresh" {
                        server.refresh_calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        return Ok(Response::new(200, HashMap::new(), server.refresh_body));
                    }
                    server.data_calls.fetch_add(1, Ordering::SeqCst);
                    let status = match request.header("Authorization") {
                        Some("Bearer fresh") => 200,
                        _ => 401,
                    };
                    Ok::<_, Error>(Response::new(status, HashMap::new(), "data"))
                }
            });
            Engine::new(BoxCloneService::new(service), ClientConfig::default())
        }
    }

    fn install(engine: &Engine, options: AuthOptions) -> Arc<AuthPolicy> {
        let policy = Arc::new(AuthPolicy::new(options));
        engine.install(Arc::clone(&policy).interceptors());
        policy
    }

    fn refreshable(store: &MemoryTokenStore) -> AuthOptions {
        AuthOptions::from_store(store).refresh_url(REFRESH_URL.parse().expect("url"))
    }

    #[tokio::test]
    async fn injects_bearer_header() {
        let mock = MockService::new(200);
        let engine = engine(&mock);
        install(&engine, AuthOptions::new(|| Some("abc".to_string())));

        let_assert!(Ok(_) = engine.dispatch(get("https://api.example.com/me")).await);
        let seen = mock.seen();
        check!(seen[0].header("Authorization") == Some("Bearer abc"));
    }

    #[tokio::test]
    async fn missing_token_leaves_headers_untouched() {
        let mock = MockService::new(200);
        let engine = engine(&mock);
        install(&engine, AuthOptions::new(|| Some(String::new())));

        let_assert!(Ok(_) = engine.dispatch(get("https://api.example.com/me")).await);
        check!(mock.seen()[0].header("Authorization").is_none());
    }

    #[tokio::test]
    async fn custom_header_and_scheme() {
        let mock = MockService::new(200);
        let engine = engine(&mock);
        install(
            &engine,
            AuthOptions::new(|| Some("k-1".to_string())).header("X-Api-Key", ""),
        );

        let_assert!(Ok(_) = engine.dispatch(get("https://api.example.com/me")).await);
        check!(mock.seen()[0].header("X-Api-Key") == Some("k-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_failures_share_one_refresh() {
        let server = AuthServer::new(r#"{"accessToken":"fresh","refreshToken":"r-2"}"#);
        let engine = server.engine();
        let store = MemoryTokenStore::new("stale", "r-1");
        let policy = install(&engine, refreshable(&store));

        let (first, second) = tokio::join!(
            engine.dispatch(get("https://api.example.com/data?a")),
            engine.dispatch(get("https://api.example.com/data?b")),
        );

        let_assert!(Ok(first) = first);
        let_assert!(Ok(second) = second);
        check!(first.status() == 200);
        check!(second.status() == 200);
        check!(server.refresh_calls.load(Ordering::SeqCst) == 1);
        check!(server.data_calls.load(Ordering::SeqCst) == 4);
        check!(store.access_token().as_deref() == Some("fresh"));
        check!(store.refresh_token().as_deref() == Some("r-2"));
        check!(!policy.is_refreshing());

        let_assert!(PolicyStats::Auth(stats) = policy.stats());
        check!(stats.refreshes == 1);
        check!(stats.replays == 2);
    }

    #[tokio::test]
    async fn missing_refresh_token_fires_callback_with_original_error() {
        let server = AuthServer::new("{}");
        let engine = server.engine();
        let failures = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&failures);
        let options = AuthOptions::new(|| Some("stale".to_string()))
            .refresh_url(REFRESH_URL.parse().expect("url"))
            .on_refresh_failure(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        install(&engine, options);

        let_assert!(Err(err) = engine.dispatch(get("https://api.example.com/data")).await);
        check!(err.status() == Some(401));
        check!(failures.load(Ordering::SeqCst) == 1);
        check!(server.refresh_calls.load(Ordering::SeqCst) == 0);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_refresh_response_is_protocol_error() {
        let server = AuthServer::new(r#"{"token":"fresh"}"#);
        let engine = server.engine();
        let store = MemoryTokenStore::new("stale", "r-1");
        let failures = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&failures);
        let policy = install(
            &engine,
            refreshable(&store).on_refresh_failure(move |err| {
                assert!(matches!(err, Error::Protocol(_)));
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let_assert!(Err(Error::Protocol(_)) = engine.dispatch(get("https://api.example.com/data")).await);
        check!(failures.load(Ordering::SeqCst) == 1);
        check!(!policy.is_refreshing());

        // The slot was cleared, so the next failure refreshes again.
        let_assert!(Err(Error::Protocol(_)) = engine.dispatch(get("https://api.example.com/data")).await);
        check!(server.refresh_calls.load(Ordering::SeqCst) == 2);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_is_not_refreshed_twice() {
        // The refresh succeeds but yields a token the server still rejects.
        let server = AuthServer::new(r#"{"access_token":"still-wrong"}"#);
        let engine = server.engine();
        let store = MemoryTokenStore::new("stale", "r-1");
        install(&engine, refreshable(&store));

        let_assert!(Err(err) = engine.dispatch(get("https://api.example.com/data")).await);
        check!(err.status() == Some(401));
        check!(server.refresh_calls.load(Ordering::SeqCst) == 1);
        check!(server.data_calls.load(Ordering::SeqCst) == 2);
        check!(store.refresh_token().as_deref() == Some("r-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_refresh_leaves_newer_one_pending() {
        let server = AuthServer::new(r#"{"accessToken":"fresh"}"#);
        let engine = server.engine();
        let store = MemoryTokenStore::new("stale", "r-1");
        let policy = install(&engine, refreshable(&store));

        let first = tokio::spawn(engine.dispatch(get("https://api.example.com/data?a")));
        tokio::time::sleep(Duration::from_millis(50)).await;
        check!(policy.is_refreshing());
        policy.reset();
        check!(!policy.is_refreshing());

        let second = tokio::spawn(engine.dispatch(get("https://api.example.com/data?b")));
        // The first refresh completes at 100ms, the second at 150ms.
        tokio::time::sleep(Duration::from_millis(70)).await;
        check!(policy.is_refreshing());

        let_assert!(Ok(Ok(first)) = first.await);
        let_assert!(Ok(Ok(second)) = second.await);
        check!(first.status() == 200);
        check!(second.status() == 200);
        check!(!policy.is_refreshing());
        check!(server.refresh_calls.load(Ordering::SeqCst) == 2);
    }

    #[tokio::test]
    async fn other_errors_pass_through() {
        let mock = MockService::new(500);
        let engine = engine(&mock);
        let store = MemoryTokenStore::new("t", "r");
        install(&engine, refreshable(&store));

        let_assert!(Err(err) = engine.dispatch(get("https://api.example.com/data")).await);
        check!(err.status() == Some(500));
        check!(mock.call_count() == 1);
    }

    #[test]
    fn default_parser_accepts_both_casings() {
        let camel = Response::new(200, HashMap::new(), r#"{"accessToken":"a","refreshToken":"r"}"#);
        let snake = Response::new(200, HashMap::new(), r#"{"access_token":"a"}"#);

        let_assert!(Ok(pair) = parse_refresh_response(&camel));
        check!(pair == TokenPair { access_token: "a".into(), refresh_token: Some("r".into()) });
        let_assert!(Ok(pair) = parse_refresh_response(&snake));
        check!(pair == TokenPair::access("a"));

        let garbage = Response::new(200, HashMap::new(), "<html>");
        check!(matches!(parse_refresh_response(&garbage), Err(Error::Protocol(_))));
    }
}
