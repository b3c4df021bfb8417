//! Outgoing request config.
//!
//! A [`Request`] is the "config" object interceptors inspect and mutate. Besides
//! the wire fields it carries [`RequestMeta`], the per-request bookkeeping
//! policies attach while a request is replayed (retry counter, auth replay flag).
//!
//! ```
//! use hookline_core::{Method, Request};
//!
//! let request = Request::builder(Method::Get, "https://api.example.com/users".parse().unwrap())
//!     .header("Accept", "application/json")
//!     .query("page", "1")
//!     .build();
//! assert_eq!(request.url().query(), Some("page=1"));
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::Method;

/// Bookkeeping carried with a request across replays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestMeta {
    /// Number of retries already performed for this request.
    pub retry_count: u32,
    /// Set once the request has been replayed after a token refresh.
    pub auth_retried: bool,
    /// When the request first entered the interceptor pipeline.
    pub started_at: Option<Instant>,
    /// Bit `n` is set once conditional gate `n` has decided for this request.
    pub gates_decided: u16,
    /// Bit `n` is set if conditional gate `n` applies to this request.
    pub gates_open: u16,
}

impl RequestMeta {
    /// Decision already taken by conditional gate `slot`, if any.
    #[must_use]
    pub const fn gate(&self, slot: u8) -> Option<bool> {
        let bit = 1 << slot;
        if self.gates_decided & bit == 0 {
            None
        } else {
            Some(self.gates_open & bit != 0)
        }
    }

    /// Record the decision of conditional gate `slot`.
    pub const fn set_gate(&mut self, slot: u8, open: bool) {
        let bit = 1 << slot;
        self.gates_decided |= bit;
        if open {
            self.gates_open |= bit;
        } else {
            self.gates_open &= !bit;
        }
    }
}

/// An HTTP request with method, URL, headers, optional body and timeout.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: url::Url,
    headers: HashMap<String, String>,
    body: Option<Bytes>,
    timeout: Option<Duration>,
    meta: RequestMeta,
}

impl Request {
    /// Creates a new [`RequestBuilder`].
    #[must_use]
    pub fn builder(method: Method, url: url::Url) -> RequestBuilder {
        RequestBuilder::new(method, url)
    }

    /// Shorthand for a body-less GET request.
    ///
    /// # Errors
    ///
    /// Returns an error if `url` cannot be parsed.
    pub fn get(url: &str) -> crate::Result<Self> {
        Ok(Self::builder(Method::Get, url::Url::parse(url)?).build())
    }

    /// HTTP method.
    #[must_use]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Request URL, including the query string.
    #[must_use]
    pub fn url(&self) -> &url::Url {
        &self.url
    }

    /// Request headers.
    #[must_use]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Mutable access to headers.
    #[must_use]
    pub fn headers_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.headers
    }

    /// Single header value by name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Request body.
    #[must_use]
    pub const fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Per-request timeout, overriding the client default.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Replay bookkeeping.
    #[must_use]
    pub const fn meta(&self) -> &RequestMeta {
        &self.meta
    }

    /// Mutable replay bookkeeping.
    #[must_use]
    pub fn meta_mut(&mut self) -> &mut RequestMeta {
        &mut self.meta
    }

    /// Consume into (method, url, headers, body).
    #[must_use]
    pub fn into_parts(self) -> (Method, url::Url, HashMap<String, String>, Option<Bytes>) {
        (self.method, self.url, self.headers, self.body)
    }
}

/// Builder for constructing [`Request`] instances.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new(method: Method, url: url::Url) -> Self {
        Self {
            request: Request {
                method,
                url,
                headers: HashMap::new(),
                body: None,
                timeout: None,
                meta: RequestMeta::default(),
            },
        }
    }

    /// Sets a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.headers.insert(name.into(), value.into());
        self
    }

    /// Sets multiple headers.
    #[must_use]
    pub fn headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.request.headers.extend(headers);
        self
    }

    /// Appends a query parameter to the URL.
    #[must_use]
    pub fn query(mut self, name: &str, value: &str) -> Self {
        self.request.url.query_pairs_mut().append_pair(name, value);
        self
    }

    /// Appends every field of `params` as query parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if `params` cannot be serialized as a query string.
    pub fn query_params<T: serde::Serialize>(mut self, params: &T) -> crate::Result<Self> {
        let encoded = crate::to_query_string(params)?;
        if !encoded.is_empty() {
            let query = match self.request.url.query() {
                Some(existing) if !existing.is_empty() => format!("{existing}&{encoded}"),
                _ => encoded,
            };
            self.request.url.set_query(Some(&query));
        }
        Ok(self)
    }

    /// Sets the request body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.request.body = Some(body.into());
        self
    }

    /// Set a JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn json<T: serde::Serialize>(self, value: &T) -> crate::Result<Self> {
        let body = crate::to_json(value)?;
        Ok(self.header("Content-Type", "application/json").body(body))
    }

    /// Set a form-urlencoded body.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn form<T: serde::Serialize>(self, value: &T) -> crate::Result<Self> {
        let body = crate::to_form(value)?;
        Ok(self
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body))
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.request.timeout = Some(timeout);
        self
    }

    /// Seeds the replay bookkeeping, e.g. a request already retried.
    #[must_use]
    pub const fn meta(mut self, meta: RequestMeta) -> Self {
        self.request.meta = meta;
        self
    }

    /// Builds the [`Request`].
    #[must_use]
    pub fn build(self) -> Request {
        self.request
    }
}
