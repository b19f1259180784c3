//! The bridge service object
//!
//! Built once at startup from `Config` and shared by the CLI commands and
//! tool handlers. Owns the token manager and the request executor; nothing
//! else holds credentials.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use workspace_api::{ApiRequest, ApiResponse, ReqwestTransport, RequestExecutor};
use workspace_auth::{
    Authenticated, AuthorizationFlowCoordinator, FlowSettings, OAuthClient, SystemBrowser,
    TokenManager, TokenStatus, TokenStore,
};

use crate::config::Config;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One outbound API call requested by a tool.
#[derive(Debug, Clone)]
pub struct ApiCall {
    pub service: String,
    /// Label for rate limiting and metrics, e.g. `drive.files.list`.
    pub endpoint: String,
    pub scopes: Vec<String>,
    pub request: ApiRequest,
}

pub struct Bridge {
    tokens: TokenManager,
    executor: RequestExecutor,
    services: Vec<String>,
}

impl Bridge {
    /// Wire up the production stack: reqwest client, encrypted token store,
    /// Google OAuth client, browser flow, token manager and executor.
    pub fn build(config: &Config) -> anyhow::Result<Self> {
        let request_timeout = Duration::from_secs(config.http.timeout_secs);
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .build()
            .context("failed to build HTTP client")?;

        let token_path = config.token_path();
        info!(path = %token_path.display(), "using token file");
        let store = Arc::new(TokenStore::new(token_path, config.token_key_material()));

        let endpoint = Arc::new(
            OAuthClient::new(
                config.oauth.client_id.clone(),
                config.client_secret(),
                config.endpoints(),
                http.clone(),
            )
            .with_timeout(request_timeout),
        );

        let settings = FlowSettings {
            client_id: config.oauth.client_id.clone(),
            redirect_uri: config.oauth.redirect_uri.clone(),
            auth_url: config.oauth.auth_url.clone(),
            timeout: Duration::from_secs(config.oauth.flow_timeout_secs),
            port_attempts: config.oauth.callback_port_attempts,
        };
        let flow = AuthorizationFlowCoordinator::new(
            settings,
            endpoint.clone(),
            store.clone(),
            Arc::new(SystemBrowser),
        );

        let tokens = TokenManager::new(
            store,
            endpoint,
            flow,
            config.requested_scopes(),
            config.refresh_policy(),
        );

        let executor = RequestExecutor::new(
            Arc::new(config.rate_limiter()),
            Arc::new(tokens.clone()),
            Arc::new(ReqwestTransport::new(http)),
        )
        .with_retry_policy(config.retry_policy())
        .with_timeout(request_timeout);

        Ok(Self::new(tokens, executor, config.oauth.services.clone()))
    }

    pub fn new(tokens: TokenManager, executor: RequestExecutor, services: Vec<String>) -> Self {
        Self {
            tokens,
            executor,
            services,
        }
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// Services requested when the caller names none.
    pub fn default_services(&self) -> &[String] {
        &self.services
    }

    pub async fn status(&self) -> workspace_api::Result<TokenStatus> {
        Ok(self.tokens.status().await?)
    }

    /// Authorize access to `services` (the configured ones when empty).
    pub async fn authenticate(&self, services: &[String]) -> workspace_api::Result<Authenticated> {
        let services = if services.is_empty() {
            &self.services
        } else {
            services
        };
        if let Some(unknown) = services
            .iter()
            .find(|s| workspace_auth::scopes_for_service(s).is_none())
        {
            return Err(workspace_api::Error::Validation(format!(
                "unknown service {unknown:?}, expected one of: {}",
                workspace_auth::SERVICES.join(", ")
            )));
        }
        let scopes = workspace_auth::scopes_for_services(services);
        // Incremental: an existing grant is extended, not replaced.
        self.tokens.ensure_scopes(&scopes).await?;
        Ok(self.tokens.authenticate(&scopes).await?)
    }

    /// Revoke the grant and forget all local tokens.
    pub async fn revoke(&self) -> workspace_api::Result<()> {
        Ok(self.tokens.revoke().await?)
    }

    /// Execute `call`. When the current grant lacks the call's scopes, run
    /// incremental authorization for them and try once more.
    pub async fn call(&self, call: &ApiCall) -> workspace_api::Result<ApiResponse> {
        match self.execute(call).await {
            Err(workspace_api::Error::Authorization { missing_scopes, .. })
                if !missing_scopes.is_empty() =>
            {
                info!(
                    service = %call.service,
                    missing = missing_scopes.len(),
                    "requesting additional scopes for api call"
                );
                self.tokens.ensure_scopes(&call.scopes).await?;
                self.execute(call).await
            }
            result => result,
        }
    }

    async fn execute(&self, call: &ApiCall) -> workspace_api::Result<ApiResponse> {
        self.executor
            .execute(&call.service, &call.endpoint, &call.scopes, &call.request)
            .await
    }
}
