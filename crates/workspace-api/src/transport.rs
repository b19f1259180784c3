//! HTTP transport seam
//!
//! `Transport` sends one authenticated request and returns the raw response.
//! Retry, classification and metrics live in the executor, so tests drive
//! the executor with a scripted transport.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::Method;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// One outbound API call, without credentials.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::POST, url).with_body(body)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Raw response from the API.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    /// `Retry-After` in seconds, when the server sent one.
    pub retry_after_secs: Option<u64>,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| Error::Api {
            status: self.status,
            message: format!("invalid JSON response: {e}"),
        })
    }
}

/// Failure to get any HTTP response.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Other(String),
}

impl TransportError {
    /// Timeouts and connection failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Timeout(_) | TransportError::Connect(_))
    }
}

/// Boxed future returned by `Transport::send`.
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<ApiResponse, TransportError>> + Send + 'a>>;

/// Sends a request with a bearer token.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    fn send<'a>(
        &'a self,
        request: &'a ApiRequest,
        access_token: &'a str,
        timeout: Duration,
    ) -> TransportFuture<'a>;
}

/// reqwest-backed transport.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for ReqwestTransport {
    fn send<'a>(
        &'a self,
        request: &'a ApiRequest,
        access_token: &'a str,
        timeout: Duration,
    ) -> TransportFuture<'a> {
        Box::pin(async move {
            let mut builder = self
                .client
                .request(request.method.clone(), &request.url)
                .bearer_auth(access_token)
                .timeout(timeout);
            if !request.query.is_empty() {
                builder = builder.query(&request.query);
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(map_reqwest_error)?;
            let status = response.status().as_u16();
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();

            Ok(ApiResponse {
                status,
                retry_after_secs,
                body,
            })
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

/// Parse a delta-seconds `Retry-After` value. HTTP-date values are ignored.
pub fn parse_retry_after(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builders() {
        let req = ApiRequest::get("https://www.googleapis.com/drive/v3/files")
            .with_query("pageSize", "10")
            .with_query("q", "trashed = false");
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.query.len(), 2);
        assert!(req.body.is_none());

        let post = ApiRequest::post(
            "https://gmail.googleapis.com/gmail/v1/users/me/messages/send",
            serde_json::json!({"raw": "abc"}),
        );
        assert_eq!(post.method, Method::POST);
        assert_eq!(post.body.unwrap()["raw"], "abc");
    }

    #[test]
    fn retry_after_parsing() {
        assert_eq!(parse_retry_after("30"), Some(30));
        assert_eq!(parse_retry_after(" 5 "), Some(5));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn response_json_error_keeps_status() {
        let response = ApiResponse {
            status: 200,
            retry_after_secs: None,
            body: b"not json".to_vec(),
        };
        let err = response.json::<serde_json::Value>().unwrap_err();
        assert!(matches!(err, Error::Api { status: 200, .. }));
    }

    #[test]
    fn transport_retryability() {
        assert!(TransportError::Timeout("t".into()).is_retryable());
        assert!(TransportError::Connect("c".into()).is_retryable());
        assert!(!TransportError::Other("o".into()).is_retryable());
    }
}
