//! Classification of API responses
//!
//! Maps an HTTP status (and for 403, the Google error reason) to what the
//! executor should do next. Google reports some quota failures as 403 with
//! a `rateLimitExceeded` reason rather than 429.

use serde::Deserialize;

/// Delay assumed when a rate-limited response carries no `Retry-After`.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// 403 reasons that mean "slow down" rather than "not allowed".
const RATE_LIMIT_REASONS: &[&str] = &["rateLimitExceeded", "userRateLimitExceeded"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// 401: token rejected; drop the cached token.
    Unauthorized,
    /// 403: permission or scope denied.
    Forbidden,
    /// 429, or 403 with a rate-limit reason.
    RateLimited,
    /// 5xx: retry with backoff.
    Retryable,
    /// Any other non-2xx.
    ClientError,
}

/// Classify a response by status and body.
pub fn classify(status: u16, body: &[u8]) -> Outcome {
    match status {
        200..=299 => Outcome::Success,
        401 => Outcome::Unauthorized,
        403 if is_rate_limit_reason(body) => Outcome::RateLimited,
        403 => Outcome::Forbidden,
        429 => Outcome::RateLimited,
        500..=599 => Outcome::Retryable,
        _ => Outcome::ClientError,
    }
}

#[derive(Deserialize)]
struct GoogleErrorBody {
    error: GoogleErrorField,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GoogleErrorField {
    Detailed {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        errors: Vec<GoogleErrorItem>,
        #[serde(default)]
        status: Option<String>,
    },
    Plain(String),
}

#[derive(Deserialize)]
struct GoogleErrorItem {
    #[serde(default)]
    reason: Option<String>,
}

fn is_rate_limit_reason(body: &[u8]) -> bool {
    match serde_json::from_slice::<GoogleErrorBody>(body) {
        Ok(GoogleErrorBody {
            error: GoogleErrorField::Detailed { errors, .. },
        }) => errors.iter().any(|item| {
            item.reason
                .as_deref()
                .is_some_and(|r| RATE_LIMIT_REASONS.contains(&r))
        }),
        _ => false,
    }
}

/// Human-readable message from a Google error body.
///
/// Understands `{"error":{"message":...}}` and `{"error":"...","error_description":...}`;
/// falls back to the status text.
pub fn error_message(status: u16, body: &[u8]) -> String {
    if let Ok(parsed) = serde_json::from_slice::<GoogleErrorBody>(body) {
        match parsed.error {
            GoogleErrorField::Detailed {
                message: Some(message),
                ..
            } if !message.is_empty() => return message,
            GoogleErrorField::Detailed {
                status: Some(status),
                ..
            } => return status,
            GoogleErrorField::Plain(error) => return error,
            GoogleErrorField::Detailed { .. } => {}
        }
    }
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("request failed")
        .to_string()
}
