//! Error taxonomy surfaced to API callers and tool handlers

/// Errors from the request pipeline.
///
/// The set of kinds is closed: tool handlers map each one to a sanitized
/// result without inspecting messages.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// No usable credentials, or the API rejected the token (401).
    #[error("authentication required: {0}")]
    Authentication(String),

    /// Scopes not granted, or the API denied permission (403).
    #[error("not authorized: {message}")]
    Authorization {
        message: String,
        missing_scopes: Vec<String>,
    },

    #[error("invalid request: {0}")]
    Validation(String),

    /// Local throttle, refresh throttle, or upstream 429.
    #[error("rate limited, retry in {retry_after_secs}s")]
    RateLimit { retry_after_secs: u64 },

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("token storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Stable label for metrics and tool results.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Authentication(_) => "authentication",
            Error::Authorization { .. } => "authorization",
            Error::Validation(_) => "validation",
            Error::RateLimit { .. } => "rate_limit",
            Error::Api { .. } => "api",
            Error::Transport(_) => "transport",
            Error::Storage(_) => "storage",
        }
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RateLimit { .. } | Error::Transport(_) => true,
            Error::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Suggested delay before retrying, when known.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Error::RateLimit { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

impl From<workspace_auth::Error> for Error {
    fn from(err: workspace_auth::Error) -> Self {
        use workspace_auth::Error as Auth;
        match err {
            Auth::Authentication(msg) | Auth::Listener(msg) => Error::Authentication(msg),
            Auth::InvalidGrant(msg) => Error::Authentication(format!("refresh token rejected: {msg}")),
            Auth::Authorization { missing } => Error::Authorization {
                message: format!("missing required scopes: {}", missing.join(", ")),
                missing_scopes: missing,
            },
            Auth::Validation(msg) => Error::Validation(msg),
            Auth::RefreshThrottled { retry_after_secs } => Error::RateLimit { retry_after_secs },
            Auth::Http(msg) | Auth::TokenExchange(msg) => Error::Transport(msg),
            Auth::Storage(msg) => Error::Storage(msg),
        }
    }
}

/// Result alias for API operations.
pub type Result<T> = std::result::Result<T, Error>;
