//! Transport boundary.

use std::future::Future;

use crate::{Request, Response, Result};

/// Config-in/future-out request function.
///
/// This is the seam between hookline and whatever executes requests: the bare
/// hyper transport, a mock in tests, or the fully intercepted client itself.
pub trait HttpClient: Send + Sync {
    /// Execute a request and return the response.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails for any reason:
    /// - Network errors
    /// - Timeouts
    /// - A status rejected by status validation
    /// - A policy refusing the request (rate limit, cancellation)
    fn execute(&self, request: Request) -> impl Future<Output = Result<Response>> + Send;
}
