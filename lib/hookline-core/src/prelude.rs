//! Prelude module for convenient imports.
//!
//! ```ignore
//! use hookline_core::prelude::*;
//! ```

pub use crate::{Error, HttpClient, Method, Request, RequestBuilder, Response, Result};
