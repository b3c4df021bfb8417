//! Predicate-gated policies.
//!
//! A conditional interceptor installs the policy's own handlers wrapped in a
//! gate. The first gate a request reaches evaluates the predicate and records
//! the decision in the request's [`RequestMeta`](crate::RequestMeta); later
//! phases and replays reuse it, so a policy applies to the whole exchange or
//! not at all. A predicate error counts as `false`: the policy is skipped,
//! never applied.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::warn;

use super::epoch_millis;
use crate::engine::{
    DispatchInterceptor, Exchange, InterceptFuture, Interceptors, Next, RequestFlow,
    RequestInterceptor, ResponseInterceptor, ServiceFuture,
};
use crate::policy::{PolicyName, PolicyOptions};
use crate::{Request, Response};

const MAX_RECORDED_ERRORS: usize = 32;

type Predicate = Arc<dyn Fn(&Request) -> Result<bool, String> + Send + Sync>;

/// Per-request predicate deciding whether a conditional policy applies.
#[derive(Clone)]
pub struct Condition {
    predicate: Predicate,
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Condition(..)")
    }
}

impl Condition {
    /// Infallible predicate.
    #[must_use]
    pub fn new(predicate: impl Fn(&Request) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Arc::new(move |request| Ok(predicate(request))),
        }
    }

    /// Predicate that may fail; an `Err` is recorded and treated as `false`.
    #[must_use]
    pub fn fallible(
        predicate: impl Fn(&Request) -> Result<bool, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            predicate: Arc::new(predicate),
        }
    }

    /// Matches requests whose URL path starts with `prefix`.
    #[must_use]
    pub fn path_prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self::new(move |request| request.url().path().starts_with(&prefix))
    }

    /// Evaluate against `request`.
    ///
    /// # Errors
    ///
    /// Returns the predicate's own error message.
    pub fn evaluate(&self, request: &Request) -> Result<bool, String> {
        (self.predicate)(request)
    }
}

/// Predicate plus optional policy options for
/// [`InterceptorManager::add_conditional_interceptor`](super::InterceptorManager::add_conditional_interceptor).
#[derive(Debug, Clone)]
pub struct ConditionalConfig {
    /// Gate.
    pub predicate: Condition,
    /// Options to (re)build the policy with; `None` keeps the current instance.
    pub options: Option<PolicyOptions>,
}

impl ConditionalConfig {
    /// Config gated by `predicate`, keeping the current policy options.
    #[must_use]
    pub const fn new(predicate: Condition) -> Self {
        Self {
            predicate,
            options: None,
        }
    }

    /// Rebuild the policy with `options`.
    #[must_use]
    pub fn options(mut self, options: PolicyOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Reported state of a conditional interceptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConditionalStatus {
    /// Policy name.
    pub name: PolicyName,
    /// Whether its gated handlers are installed.
    pub enabled: bool,
    /// Requests the policy was applied to.
    pub activation_count: u64,
    /// Last activation, milliseconds since the Unix epoch.
    pub last_activated: Option<u64>,
    /// Recent predicate errors, oldest first.
    pub errors: Vec<String>,
}

/// Shared state of one conditional interceptor.
pub(crate) struct ConditionalState {
    name: PolicyName,
    condition: Condition,
    activation_count: AtomicU64,
    last_activated: AtomicU64,
    errors: Mutex<Vec<String>>,
}

impl ConditionalState {
    pub(crate) fn new(name: PolicyName, condition: Condition) -> Self {
        Self {
            name,
            condition,
            activation_count: AtomicU64::new(0),
            last_activated: AtomicU64::new(0),
            errors: Mutex::default(),
        }
    }

    /// Evaluate the predicate and update the bookkeeping.
    fn applies(&self, request: &Request) -> bool {
        match self.condition.evaluate(request) {
            Ok(true) => {
                self.activation_count.fetch_add(1, Ordering::Relaxed);
                self.last_activated.store(epoch_millis(), Ordering::Relaxed);
                true
            }
            Ok(false) => false,
            Err(message) => {
                warn!(interceptor = %self.name, error = %message, "condition failed; skipping");
                let mut errors = self.errors.lock().unwrap_or_else(PoisonError::into_inner);
                if errors.len() == MAX_RECORDED_ERRORS {
                    errors.remove(0);
                }
                errors.push(message);
                false
            }
        }
    }

    /// Wrap every handler in a gate.
    pub(crate) fn wrap(self: &Arc<Self>, interceptors: Interceptors) -> Interceptors {
        let gate = || Gate {
            state: Arc::clone(self),
        };

        let dispatch = interceptors.dispatch.map(|inner| {
            Arc::new(GatedDispatch {
                gate: gate(),
                inner,
            }) as Arc<dyn DispatchInterceptor>
        });
        let request = interceptors.request.map(|inner| {
            Arc::new(GatedRequest {
                gate: gate(),
                inner,
            }) as Arc<dyn RequestInterceptor>
        });
        let response = interceptors.response.map(|inner| {
            Arc::new(GatedResponse {
                gate: gate(),
                inner,
            }) as Arc<dyn ResponseInterceptor>
        });

        Interceptors {
            request,
            response,
            dispatch,
        }
    }

    pub(crate) fn status(&self, enabled: bool) -> ConditionalStatus {
        let last = self.last_activated.load(Ordering::Relaxed);
        ConditionalStatus {
            name: self.name,
            enabled,
            activation_count: self.activation_count.load(Ordering::Relaxed),
            last_activated: (last > 0).then_some(last),
            errors: self
                .errors
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

struct Gate {
    state: Arc<ConditionalState>,
}

impl Gate {
    fn open(&self, request: &mut Request) -> bool {
        let slot = self.state.name.slot();
        if let Some(open) = request.meta().gate(slot) {
            return open;
        }
        let open = self.state.applies(request);
        request.meta_mut().set_gate(slot, open);
        open
    }
}

struct GatedDispatch {
    gate: Gate,
    inner: Arc<dyn DispatchInterceptor>,
}

impl DispatchInterceptor for GatedDispatch {
    fn dispatch(&self, mut request: Request, next: Next) -> ServiceFuture {
        if self.gate.open(&mut request) {
            self.inner.dispatch(request, next)
        } else {
            next.run(request)
        }
    }
}

struct GatedRequest {
    gate: Gate,
    inner: Arc<dyn RequestInterceptor>,
}

impl RequestInterceptor for GatedRequest {
    fn on_request(&self, mut request: Request) -> InterceptFuture<RequestFlow> {
        if self.gate.open(&mut request) {
            self.inner.on_request(request)
        } else {
            Box::pin(async move { Ok(RequestFlow::Continue(request)) })
        }
    }
}

struct GatedResponse {
    gate: Gate,
    inner: Arc<dyn ResponseInterceptor>,
}

impl ResponseInterceptor for GatedResponse {
    fn on_response(&self, mut exchange: Exchange) -> InterceptFuture<Response> {
        if self.gate.open(&mut exchange.request) {
            self.inner.on_response(exchange)
        } else {
            Box::pin(async move { exchange.result })
        }
    }
}
