//! Core types for the hookline interceptor engine.
//!
//! This crate holds the data that flows through interceptor chains:
//! - [`Method`] - HTTP method enum
//! - [`Request`], [`RequestBuilder`] and [`RequestMeta`] - outgoing request config
//! - [`Response`] - buffered HTTP response
//! - [`Error`] and [`Result`] - the error taxonomy shared by every policy
//! - [`HttpClient`] - config-in/future-out transport boundary
//! - [`StatusCode`] - HTTP status codes (re-exported from `http` crate)

mod body;
mod client;
mod error;
mod method;
pub mod prelude;
mod request;
mod response;

pub use body::{from_json, to_form, to_json, to_query_string};
pub use client::HttpClient;
pub use error::{Error, Result};
pub use method::Method;
pub use request::{Request, RequestBuilder, RequestMeta};
pub use response::Response;

// Re-export http crate types for status codes and headers
pub use http::{StatusCode, header};
