//! Composable, switchable request-lifecycle interceptors for async HTTP clients.
//!
//! A [`Client`] sends [`Request`]s through three interceptor chains around a
//! Tower transport. Stateful policies plug into those chains and can be
//! switched on and off at runtime, alone, in named groups, or gated by a
//! per-request [`Condition`]:
//!
//! - auth: bearer injection with single-flight token refresh
//! - retry: bounded resubmission with fixed, exponential or custom delays
//! - cache: GET memoization bounded by size and age
//! - rate limit: sliding-window admission control
//! - dedupe: identical in-flight requests share one transport call
//! - logging: `tracing` events per request
//!
//! A [`RequestQueue`] bounds concurrency and a [`BatchCoalescer`] multiplexes
//! independent requests through one call.
//!
//! # Example
//!
//! ```no_run
//! use hookline::prelude::*;
//!
//! # async fn run() -> hookline::Result<()> {
//! let store = MemoryTokenStore::new("access", "refresh");
//! let client = Client::new();
//! client
//!     .use_auth(
//!         AuthOptions::from_store(&store)
//!             .refresh_url(url::Url::parse("https://api.example.com/auth/refresh")?),
//!     )?
//!     .use_retry(RetryOptions::default())?
//!     .use_dedupe(DedupeOptions::default())?;
//!
//! client.interceptors().create_group("caching", ["cache"])?;
//! client.interceptors().enable_group("caching")?;
//!
//! let user = client.send(Request::get("https://api.example.com/users/42")?).await?;
//! println!("{}", user.status());
//! # Ok(())
//! # }
//! ```

mod batch;
mod cancel;
mod chain;
mod client;
mod config;
pub mod engine;
pub mod manager;
mod observe;
pub mod policy;
pub mod prelude;
mod queue;
mod transport;

// Re-export client types
pub use client::{Client, ClientBuilder, ClientSnapshot};
pub use config::{ClientConfig, ClientConfigBuilder};
pub use transport::HyperTransport;

// Re-export engine and chain types
pub use chain::{InterceptorChain, InterceptorId, Phase};
pub use engine::{BoxedService, Engine, Interceptors, Registration, RequestFlow};

// Re-export policies
pub use policy::{
    AuthOptions, CacheOptions, DedupeOptions, LogLevel, LoggingOptions, MemoryTokenStore, Policy,
    PolicyName, PolicyOptions, PolicyStats, RateLimitOptions, RetryDelay, RetryOptions, TokenPair,
};

// Re-export manager types
pub use manager::{Condition, ConditionalConfig, InterceptorManager, ManagerStatus};

// Re-export queue, batch and cancellation types
pub use batch::{
    BatchCoalescer, BatchExecutor, BatchOptions, BatchStats, batch_executor, fan_out,
};
pub use cancel::{CancelRegistry, CancelTicket};
pub use queue::{QueueStats, RequestQueue};

// Re-export tower for transport layers
pub use tower;

// Re-export core types
pub use hookline_core::{
    Error, HttpClient, Method, Request, RequestBuilder, RequestMeta, Response, Result, from_json,
    to_form, to_json, to_query_string,
};

// Re-export http types for status codes and headers
pub use hookline_core::{StatusCode, header};

// Re-export url for building requests
pub use url;
