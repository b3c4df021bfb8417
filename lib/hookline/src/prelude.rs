//! Prelude module for convenient imports.
//!
//! ```ignore
//! use hookline::prelude::*;
//! ```

pub use crate::{
    AuthOptions, BatchCoalescer, BatchOptions, CacheOptions, Client, ClientConfig, Condition,
    ConditionalConfig, DedupeOptions, Error, HttpClient, InterceptorManager, LoggingOptions,
    MemoryTokenStore, Method, PolicyName, RateLimitOptions, Request, RequestBuilder, Response,
    Result, RetryDelay, RetryOptions, StatusCode, fan_out, header, url,
};
