//! Google Workspace API request pipeline
//!
//! Wraps every outbound API call in rate limiting, token acquisition,
//! retry with backoff, and error classification. Per-service API wrappers
//! build an `ApiRequest` and hand it to `RequestExecutor::execute` together
//! with the scopes the call needs.
//!
//! Request flow:
//! 1. `RateLimiter::admit()` for (service, endpoint)
//! 2. `AccessTokenSource::access_token()` (the `TokenManager` in production)
//! 3. `Transport::send()` with the bearer token
//! 4. `classify::classify()` decides success, retry, or which error to return

pub mod classify;
pub mod error;
pub mod executor;
pub mod rate_limit;
pub mod transport;

pub use classify::{DEFAULT_RETRY_AFTER_SECS, Outcome, classify};
pub use error::{Error, Result};
pub use executor::{AccessTokenSource, DEFAULT_REQUEST_TIMEOUT, RequestExecutor, RetryPolicy};
pub use rate_limit::{RateLimit, RateLimiter};
pub use transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport, TransportError};
