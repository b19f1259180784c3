//! Interactive OAuth authorization flow
//!
//! Drives one browser consent session at a time:
//! `Idle -> AwaitingConsent -> ExchangingCode -> Authenticated | Failed`.
//!
//! Concurrent `authenticate` calls join the session already in progress
//! instead of opening a second browser window.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::Shared;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::callback::{CallbackListener, CallbackOutcome};
use crate::constants::{
    AUTHORIZATION_TIMEOUT, CALLBACK_PORT_ATTEMPTS, DEFAULT_REDIRECT_URI, GOOGLE_AUTH_URL,
    TOKEN_EXPIRY_BUFFER,
};
use crate::error::{Error, Result};
use crate::pkce::{AuthorizationRequest, PkceChallenge, build_authorization_url, generate_state};
use crate::scope;
use crate::store::TokenStore;
use crate::token::{TokenEndpoint, TokenSet, UserInfo};

/// Opens the consent URL for the user.
pub trait BrowserOpener: Send + Sync {
    fn open(&self, url: &str) -> io::Result<()>;
}

/// Launches the platform default browser.
pub struct SystemBrowser;

impl BrowserOpener for SystemBrowser {
    fn open(&self, url: &str) -> io::Result<()> {
        open::that(url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    AwaitingConsent,
    ExchangingCode,
    Authenticated,
    Failed,
}

impl FlowState {
    /// Status label for status output and logging.
    pub fn label(&self) -> &'static str {
        match self {
            FlowState::Idle => "idle",
            FlowState::AwaitingConsent => "awaiting_consent",
            FlowState::ExchangingCode => "exchanging_code",
            FlowState::Authenticated => "authenticated",
            FlowState::Failed => "failed",
        }
    }
}

/// Result of a successful authorization.
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub tokens: TokenSet,
    pub user: UserInfo,
}

/// Static inputs to the flow.
#[derive(Debug, Clone)]
pub struct FlowSettings {
    pub client_id: String,
    /// Loopback redirect URI; its port is the preferred listener port and its
    /// path is the callback route. Port 0 or no port means any free port.
    pub redirect_uri: String,
    pub auth_url: String,
    pub timeout: Duration,
    pub port_attempts: u16,
}

impl FlowSettings {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            auth_url: GOOGLE_AUTH_URL.to_string(),
            timeout: AUTHORIZATION_TIMEOUT,
            port_attempts: CALLBACK_PORT_ATTEMPTS,
        }
    }

    /// Preferred port and callback path from the redirect URI.
    pub fn callback_target(&self) -> Result<(u16, String)> {
        let url = url::Url::parse(&self.redirect_uri)
            .map_err(|e| Error::Validation(format!("invalid redirect URI: {e}")))?;
        if url.scheme() != "http" {
            return Err(Error::Validation(
                "redirect URI must use http on a loopback address".into(),
            ));
        }
        match url.host_str() {
            Some("127.0.0.1") | Some("localhost") => {}
            other => {
                return Err(Error::Validation(format!(
                    "redirect URI host must be loopback, got {}",
                    other.unwrap_or("none")
                )));
            }
        }
        let path = match url.path() {
            "" => "/".to_string(),
            p => p.to_string(),
        };
        Ok((url.port().unwrap_or(0), path))
    }
}

type SessionFuture = Shared<Pin<Box<dyn Future<Output = Result<Authenticated>> + Send>>>;

struct FlowInner {
    settings: FlowSettings,
    endpoint: Arc<dyn TokenEndpoint>,
    store: Arc<TokenStore>,
    browser: Arc<dyn BrowserOpener>,
    state: std::sync::Mutex<FlowState>,
    session: Mutex<Option<SessionFuture>>,
}

/// Runs the browser authorization flow. Cheap to clone.
#[derive(Clone)]
pub struct AuthorizationFlowCoordinator {
    inner: Arc<FlowInner>,
}

impl AuthorizationFlowCoordinator {
    pub fn new(
        settings: FlowSettings,
        endpoint: Arc<dyn TokenEndpoint>,
        store: Arc<TokenStore>,
        browser: Arc<dyn BrowserOpener>,
    ) -> Self {
        Self {
            inner: Arc::new(FlowInner {
                settings,
                endpoint,
                store,
                browser,
                state: std::sync::Mutex::new(FlowState::Idle),
                session: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> FlowState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Obtain tokens covering `scopes`.
    ///
    /// Persisted tokens that are valid and cover `scopes` are returned without
    /// user interaction. Otherwise the browser flow runs, or the caller joins
    /// the one already running.
    pub async fn authenticate(&self, scopes: &[String]) -> Result<Authenticated> {
        loop {
            let (session, joined) = self.session(scopes).await;
            let result = session.await;

            // A joined session may have been started for narrower scopes.
            if joined
                && let Ok(auth) = &result
                && !scope::covers(&auth.tokens.scopes, scopes)
            {
                debug!("joined session did not cover requested scopes, starting another");
                continue;
            }
            return result;
        }
    }

    async fn session(&self, scopes: &[String]) -> (SessionFuture, bool) {
        let mut slot = self.inner.session.lock().await;
        if let Some(existing) = slot.as_ref() {
            debug!("joining authorization session in progress");
            return (existing.clone(), true);
        }

        let inner = self.inner.clone();
        let scopes = scopes.to_vec();
        let future: Pin<Box<dyn Future<Output = Result<Authenticated>> + Send>> =
            Box::pin(async move {
                let result = inner.run_session(&scopes).await;
                *inner.session.lock().await = None;
                result
            });
        let shared = future.shared();
        *slot = Some(shared.clone());
        (shared, false)
    }
}

impl FlowInner {
    fn set_state(&self, state: FlowState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    async fn run_session(&self, scopes: &[String]) -> Result<Authenticated> {
        if let Some(existing) = self.reuse_stored(scopes).await? {
            return Ok(existing);
        }

        let result = self.run_browser_flow(scopes).await;
        match &result {
            Ok(auth) => {
                self.set_state(FlowState::Authenticated);
                metrics::counter!("workspace_auth_flows_total", "outcome" => "success")
                    .increment(1);
                info!(
                    email = auth.user.email.as_deref().unwrap_or("unknown"),
                    scopes = auth.tokens.scopes.len(),
                    "authorization complete"
                );
            }
            Err(e) => {
                self.set_state(FlowState::Failed);
                metrics::counter!("workspace_auth_flows_total", "outcome" => "failure")
                    .increment(1);
                warn!(error = %e, "authorization failed");
            }
        }
        result
    }

    async fn reuse_stored(&self, scopes: &[String]) -> Result<Option<Authenticated>> {
        let Some(tokens) = self.store.retrieve().await? else {
            return Ok(None);
        };
        if !tokens.is_valid(TOKEN_EXPIRY_BUFFER) || !scope::covers(&tokens.scopes, scopes) {
            return Ok(None);
        }

        debug!("stored tokens cover requested scopes, skipping browser flow");
        let user = self.fetch_user(&tokens.access_token).await;
        self.set_state(FlowState::Authenticated);
        Ok(Some(Authenticated { tokens, user }))
    }

    async fn run_browser_flow(&self, scopes: &[String]) -> Result<Authenticated> {
        let (port, path) = self.settings.callback_target()?;
        let pkce = PkceChallenge::generate();
        let state = generate_state();

        let mut listener =
            CallbackListener::bind(port, &path, self.settings.port_attempts).await?;
        let redirect_uri = listener.redirect_uri();
        self.set_state(FlowState::AwaitingConsent);

        let url = build_authorization_url(&AuthorizationRequest {
            auth_url: &self.settings.auth_url,
            client_id: &self.settings.client_id,
            redirect_uri: &redirect_uri,
            scopes,
            state: &state,
            challenge: &pkce.challenge,
        });

        info!(%url, "open this URL in a browser to authorize access");
        if let Err(e) = self.browser.open(&url) {
            warn!(error = %e, "could not open browser, open the URL manually");
        }

        let outcome = listener.wait(self.settings.timeout).await;
        listener.stop().await;

        let code = match outcome? {
            CallbackOutcome::Code {
                code,
                state: returned,
            } => {
                if returned.as_deref() != Some(state.as_str()) {
                    return Err(Error::Authentication("state mismatch".into()));
                }
                code
            }
            CallbackOutcome::Denied {
                error,
                description,
                state: returned,
            } => {
                if returned.is_some() && returned.as_deref() != Some(state.as_str()) {
                    return Err(Error::Authentication("state mismatch".into()));
                }
                let reason = description.unwrap_or(error);
                return Err(Error::Authentication(format!(
                    "authorization denied: {reason}"
                )));
            }
        };

        self.set_state(FlowState::ExchangingCode);
        let response = self
            .endpoint
            .exchange_code(&code, &pkce.verifier, &redirect_uri)
            .await
            .map_err(|e| Error::Authentication(format!("code exchange failed: {e}")))?;

        let tokens = response.into_token_set(scopes, None);
        if tokens.refresh_token.is_none() {
            warn!("provider returned no refresh token, re-authorization will be needed on expiry");
        }
        self.store.store(&tokens).await?;

        let user = self.fetch_user(&tokens.access_token).await;
        Ok(Authenticated { tokens, user })
    }

    async fn fetch_user(&self, access_token: &str) -> UserInfo {
        match self.endpoint.user_info(access_token).await {
            Ok(user) => user,
            Err(e) => {
                warn!(error = %e, "could not fetch user info");
                UserInfo::default()
            }
        }
    }
}
