//! Error types for authentication and token lifecycle operations

/// Errors from the OAuth flow, token endpoint, token store and token manager.
///
/// Payloads are strings so the type is `Clone`: concurrent callers waiting on
/// the same in-flight refresh or authorization session all receive a copy of
/// the one result.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// No usable credentials; an interactive authorization flow is required.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The token is valid but was not granted every required scope.
    #[error("missing required scopes: {}", missing.join(", "))]
    Authorization { missing: Vec<String> },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("token refresh throttled, retry in {retry_after_secs}s")]
    RefreshThrottled { retry_after_secs: u64 },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    /// The refresh token was rejected (revoked, expired, or `invalid_grant`).
    #[error("refresh token rejected: {0}")]
    InvalidGrant(String),

    #[error("token storage error: {0}")]
    Storage(String),

    #[error("callback listener error: {0}")]
    Listener(String),
}

impl Error {
    /// Whether recovering from this error requires the user to authorize again.
    pub fn requires_reauthorization(&self) -> bool {
        matches!(
            self,
            Error::Authentication(_) | Error::InvalidGrant(_) | Error::Authorization { .. }
        )
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
