//! Request execution pipeline
//!
//! Every outbound API call goes through `RequestExecutor::execute`:
//! 1. Rate limiter admission for (service, endpoint)
//! 2. Access token covering the required scopes
//! 3. HTTP call with the bearer token and a bounded timeout
//! 4. Classification; 5xx and transport failures retry with exponential
//!    backoff, everything else returns immediately
//!
//! Each call is logged and counted by service, endpoint and outcome.
//! Request and response payloads are never logged.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use workspace_auth::TokenManager;

use crate::classify::{DEFAULT_RETRY_AFTER_SECS, Outcome, classify, error_message};
use crate::error::{Error, Result};
use crate::rate_limit::RateLimiter;
use crate::transport::{ApiRequest, ApiResponse, Transport};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Boxed future returned by `AccessTokenSource` methods.
pub type TokenFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Where the executor gets bearer tokens from.
pub trait AccessTokenSource: Send + Sync {
    fn access_token<'a>(
        &'a self,
        scopes: &'a [String],
    ) -> TokenFuture<'a, workspace_auth::Result<String>>;

    /// The API rejected the token issued for `scopes`.
    fn invalidate<'a>(&'a self, scopes: &'a [String]) -> TokenFuture<'a, ()>;
}

impl AccessTokenSource for TokenManager {
    fn access_token<'a>(
        &'a self,
        scopes: &'a [String],
    ) -> TokenFuture<'a, workspace_auth::Result<String>> {
        Box::pin(self.get_valid_token(scopes))
    }

    fn invalidate<'a>(&'a self, scopes: &'a [String]) -> TokenFuture<'a, ()> {
        Box::pin(TokenManager::invalidate(self, scopes))
    }
}

/// Bounded exponential backoff for 5xx and transport failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): 1s, 2s, 4s ... capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Runs API calls through rate limiting, token acquisition and retry.
pub struct RequestExecutor {
    limiter: Arc<RateLimiter>,
    tokens: Arc<dyn AccessTokenSource>,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl RequestExecutor {
    pub fn new(
        limiter: Arc<RateLimiter>,
        tokens: Arc<dyn AccessTokenSource>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            limiter,
            tokens,
            transport,
            retry: RetryPolicy::default(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Execute `request` for `service`/`endpoint` with a token covering
    /// `scopes`. Returns the 2xx response or a classified error.
    pub async fn execute(
        &self,
        service: &str,
        endpoint: &str,
        scopes: &[String],
        request: &ApiRequest,
    ) -> Result<ApiResponse> {
        let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
        let started = Instant::now();

        let result = self.run(service, endpoint, scopes, request).await;

        let elapsed = started.elapsed();
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!(
            "workspace_api_requests_total",
            "service" => service.to_string(),
            "endpoint" => endpoint.to_string(),
            "outcome" => outcome
        )
        .increment(1);
        metrics::histogram!(
            "workspace_api_request_duration_seconds",
            "service" => service.to_string()
        )
        .record(elapsed.as_secs_f64());

        match &result {
            Ok(response) => info!(
                request_id = %request_id,
                service,
                endpoint,
                status = response.status,
                duration_ms = elapsed.as_millis() as u64,
                "api request completed"
            ),
            Err(e) => warn!(
                request_id = %request_id,
                service,
                endpoint,
                outcome,
                error = %e,
                duration_ms = elapsed.as_millis() as u64,
                "api request failed"
            ),
        }

        result
    }

    /// `execute`, then deserialize the JSON body.
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        service: &str,
        endpoint: &str,
        scopes: &[String],
        request: &ApiRequest,
    ) -> Result<T> {
        self.execute(service, endpoint, scopes, request)
            .await?
            .json()
    }

    async fn run(
        &self,
        service: &str,
        endpoint: &str,
        scopes: &[String],
        request: &ApiRequest,
    ) -> Result<ApiResponse> {
        self.limiter.admit(service, endpoint).await?;
        let token = self.tokens.access_token(scopes).await?;

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let retryable_failure = match self.transport.send(request, &token, self.timeout).await {
                Ok(response) => match classify(response.status, &response.body) {
                    Outcome::Success => return Ok(response),
                    Outcome::Unauthorized => {
                        self.tokens.invalidate(scopes).await;
                        return Err(Error::Authentication(error_message(
                            response.status,
                            &response.body,
                        )));
                    }
                    Outcome::Forbidden => {
                        return Err(Error::Authorization {
                            message: error_message(response.status, &response.body),
                            missing_scopes: Vec::new(),
                        });
                    }
                    Outcome::RateLimited => {
                        return Err(Error::RateLimit {
                            retry_after_secs: response
                                .retry_after_secs
                                .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
                                .max(1),
                        });
                    }
                    Outcome::ClientError => {
                        return Err(Error::Api {
                            status: response.status,
                            message: error_message(response.status, &response.body),
                        });
                    }
                    Outcome::Retryable => Error::Api {
                        status: response.status,
                        message: error_message(response.status, &response.body),
                    },
                },
                Err(e) if e.is_retryable() => Error::Transport(e.to_string()),
                Err(e) => return Err(Error::Transport(e.to_string())),
            };

            if attempt >= max_attempts {
                debug!(service, endpoint, attempts = attempt, "retries exhausted");
                return Err(retryable_failure);
            }

            let delay = self.retry.backoff(attempt);
            metrics::counter!("workspace_api_retries_total", "service" => service.to_string())
                .increment(1);
            warn!(
                service,
                endpoint,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %retryable_failure,
                "retrying api request"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::rate_limit::RateLimit;
    use crate::transport::{TransportError, TransportFuture};

    type Scripted = std::result::Result<ApiResponse, TransportError>;

    /// Transport that replays scripted results and records what it was sent.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Scripted>>,
        calls: AtomicUsize,
        tokens_seen: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                tokens_seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Transport for ScriptedTransport {
        fn send<'a>(
            &'a self,
            _request: &'a ApiRequest,
            access_token: &'a str,
            _timeout: Duration,
        ) -> TransportFuture<'a> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.tokens_seen
                    .lock()
                    .unwrap()
                    .push(access_token.to_string());
                self.script
                    .lock()
                    .unwrap()
                    .pop_front()
                    .expect("transport called more times than scripted")
            })
        }
    }

    /// Token source returning a fixed token or a fixed error.
    struct FakeTokens {
        result: workspace_auth::Result<String>,
        invalidations: AtomicUsize,
    }

    impl FakeTokens {
        fn ok() -> Arc<Self> {
            Self::with(Ok("token-1".into()))
        }

        fn with(result: workspace_auth::Result<String>) -> Arc<Self> {
            Arc::new(Self {
                result,
                invalidations: AtomicUsize::new(0),
            })
        }
    }

    impl AccessTokenSource for FakeTokens {
        fn access_token<'a>(
            &'a self,
            _scopes: &'a [String],
        ) -> TokenFuture<'a, workspace_auth::Result<String>> {
            Box::pin(async move { self.result.clone() })
        }

        fn invalidate<'a>(&'a self, _scopes: &'a [String]) -> TokenFuture<'a, ()> {
            Box::pin(async move {
                self.invalidations.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    fn response(status: u16, body: &str) -> Scripted {
        Ok(ApiResponse {
            status,
            retry_after_secs: None,
            body: body.as_bytes().to_vec(),
        })
    }

    fn executor(tokens: Arc<FakeTokens>, transport: Arc<ScriptedTransport>) -> RequestExecutor {
        RequestExecutor::new(Arc::new(RateLimiter::default()), tokens, transport)
    }

    fn drive_scopes() -> Vec<String> {
        vec!["https://www.googleapis.com/auth/drive".to_string()]
    }

    fn list_files() -> ApiRequest {
        ApiRequest::get("https://www.googleapis.com/drive/v3/files")
    }

    #[tokio::test]
    async fn success_attaches_token_and_returns_body() {
        let transport = ScriptedTransport::new(vec![response(200, r#"{"files":[]}"#)]);
        let exec = executor(FakeTokens::ok(), transport.clone());

        let value: serde_json::Value = exec
            .execute_json("drive", "files.list", &drive_scopes(), &list_files())
            .await
            .unwrap();

        assert_eq!(value["files"], serde_json::json!([]));
        assert_eq!(transport.tokens_seen.lock().unwrap().as_slice(), ["token-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_retry_with_backoff_then_succeed() {
        let transport = ScriptedTransport::new(vec![
            response(503, ""),
            response(500, ""),
            response(200, "{}"),
        ]);
        let exec = executor(FakeTokens::ok(), transport.clone());
        let started = Instant::now();

        exec.execute("drive", "files.list", &drive_scopes(), &list_files())
            .await
            .unwrap();

        assert_eq!(transport.calls(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_exhaust_three_attempts() {
        let body = r#"{"error":{"code":503,"message":"Backend Error"}}"#;
        let transport = ScriptedTransport::new(vec![
            response(503, body),
            response(503, body),
            response(503, body),
        ]);
        let exec = executor(FakeTokens::ok(), transport.clone());

        let err = exec
            .execute("drive", "files.list", &drive_scopes(), &list_files())
            .await
            .unwrap_err();

        assert_eq!(transport.calls(), 3);
        match err {
            Error::Api { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "Backend Error");
            }
            other => panic!("expected Api, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transport_timeout_is_retried() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Timeout("deadline elapsed".into())),
            response(200, "{}"),
        ]);
        let exec = executor(FakeTokens::ok(), transport.clone());

        exec.execute("drive", "files.list", &drive_scopes(), &list_files())
            .await
            .unwrap();
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn non_retryable_transport_error_fails_immediately() {
        let transport =
            ScriptedTransport::new(vec![Err(TransportError::Other("builder error".into()))]);
        let exec = executor(FakeTokens::ok(), transport.clone());

        let err = exec
            .execute("drive", "files.list", &drive_scopes(), &list_files())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn unauthorized_invalidates_token_without_retry() {
        let transport = ScriptedTransport::new(vec![response(
            401,
            r#"{"error":{"code":401,"message":"Invalid Credentials"}}"#,
        )]);
        let tokens = FakeTokens::ok();
        let exec = executor(tokens.clone(), transport.clone());

        let err = exec
            .execute("drive", "files.list", &drive_scopes(), &list_files())
            .await
            .unwrap_err();

        assert!(matches!(&err, Error::Authentication(m) if m == "Invalid Credentials"));
        assert_eq!(tokens.invalidations.load(Ordering::SeqCst), 1);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn forbidden_maps_to_authorization() {
        let transport = ScriptedTransport::new(vec![response(
            403,
            r#"{"error":{"code":403,"message":"Request had insufficient authentication scopes."}}"#,
        )]);
        let exec = executor(FakeTokens::ok(), transport);

        let err = exec
            .execute("drive", "files.list", &drive_scopes(), &list_files())
            .await
            .unwrap_err();
        assert!(
            matches!(&err, Error::Authorization { message, .. } if message.contains("insufficient"))
        );
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn too_many_requests_honors_retry_after() {
        let transport = ScriptedTransport::new(vec![Ok(ApiResponse {
            status: 429,
            retry_after_secs: Some(7),
            body: Vec::new(),
        })]);
        let exec = executor(FakeTokens::ok(), transport.clone());

        let err = exec
            .execute("gmail", "messages.send", &drive_scopes(), &list_files())
            .await
            .unwrap_err();
        assert_eq!(err.retry_after_secs(), Some(7));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn too_many_requests_defaults_to_sixty_seconds() {
        let transport = ScriptedTransport::new(vec![response(429, "")]);
        let exec = executor(FakeTokens::ok(), transport);

        let err = exec
            .execute("gmail", "messages.send", &drive_scopes(), &list_files())
            .await
            .unwrap_err();
        assert_eq!(err.retry_after_secs(), Some(60));
    }

    #[tokio::test]
    async fn other_client_errors_are_api_errors() {
        let transport = ScriptedTransport::new(vec![response(
            404,
            r#"{"error":{"code":404,"message":"File not found: x."}}"#,
        )]);
        let exec = executor(FakeTokens::ok(), transport.clone());

        let err = exec
            .execute("drive", "files.get", &drive_scopes(), &list_files())
            .await
            .unwrap_err();
        assert!(matches!(&err, Error::Api { status: 404, message } if message == "File not found: x."));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn local_rate_limit_rejects_before_token_and_transport() {
        let transport = ScriptedTransport::new(vec![response(200, "{}")]);
        let limiter = Arc::new(RateLimiter::new(RateLimit {
            max_requests: 1,
            window: Duration::from_secs(60),
        }));
        let exec = RequestExecutor::new(limiter, FakeTokens::ok(), transport.clone());

        exec.execute("drive", "files.list", &drive_scopes(), &list_files())
            .await
            .unwrap();
        let err = exec
            .execute("drive", "files.list", &drive_scopes(), &list_files())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::RateLimit { retry_after_secs } if retry_after_secs > 0));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn token_errors_propagate_without_http() {
        let transport = ScriptedTransport::new(vec![]);
        let tokens = FakeTokens::with(Err(workspace_auth::Error::Authorization {
            missing: drive_scopes(),
        }));
        let exec = executor(tokens, transport.clone());

        let err = exec
            .execute("drive", "files.list", &drive_scopes(), &list_files())
            .await
            .unwrap_err();
        assert!(matches!(&err, Error::Authorization { missing_scopes, .. } if missing_scopes.len() == 1));
        assert_eq!(transport.calls(), 0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(5), Duration::from_secs(10));
        assert_eq!(policy.backoff(40), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn records_request_metrics() {
        use metrics_exporter_prometheus::PrometheusBuilder;

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let transport = ScriptedTransport::new(vec![response(200, "{}"), response(404, "")]);
        let exec = executor(FakeTokens::ok(), transport);

        {
            let _guard = metrics::set_default_local_recorder(&recorder);
            exec.execute("drive", "files.list", &drive_scopes(), &list_files())
                .await
                .unwrap();
            let _ = exec
                .execute("drive", "files.get", &drive_scopes(), &list_files())
                .await;
        }

        let output = handle.render();
        assert!(output.contains("workspace_api_requests_total"));
        assert!(output.contains("outcome=\"ok\""));
        assert!(output.contains("outcome=\"api\""));
        assert!(output.contains("workspace_api_request_duration_seconds"));
    }
}
