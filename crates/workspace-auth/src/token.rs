//! Token sets and the OAuth token endpoint
//!
//! Covers the four provider interactions the bridge needs:
//! 1. Authorization code exchange (end of the interactive flow)
//! 2. Token refresh (preemptive and on access)
//! 3. Revocation
//! 4. User info lookup for the authenticated identity
//!
//! `TokenEndpoint` is the seam between token lifecycle logic and HTTP so the
//! flow and the manager can be driven by an in-process fake.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{GOOGLE_AUTH_URL, GOOGLE_REVOKE_URL, GOOGLE_TOKEN_URL, GOOGLE_USERINFO_URL};
use crate::error::{Error, Result};

/// Lifetime assumed when the provider omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Current time as unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// The credentials of the single authenticated identity.
///
/// `expires_at` is a unix timestamp in milliseconds (absolute, not a delta).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub scopes: BTreeSet<String>,
    pub expires_at: u64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

impl TokenSet {
    /// Valid iff `now < expires_at - buffer`.
    pub fn is_valid(&self, buffer: Duration) -> bool {
        now_millis() + (buffer.as_millis() as u64) < self.expires_at
    }

    /// Whether expiry falls within `window` from now (or has passed).
    pub fn expires_within(&self, window: Duration) -> bool {
        !self.is_valid(window)
    }

    /// Time left before expiry, zero if already expired.
    pub fn remaining(&self) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now_millis()))
    }

    pub fn scope_list(&self) -> Vec<String> {
        self.scopes.iter().cloned().collect()
    }
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("scopes", &self.scopes)
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Response from the token endpoint for both exchange and refresh.
///
/// `expires_in` is a delta in seconds. `scope` is the space-separated list of
/// scopes actually granted, which may differ from what was requested.
#[derive(Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenResponse {
    /// Convert to an absolute-expiry `TokenSet`.
    ///
    /// Falls back to `requested_scopes` when the response carries no `scope`
    /// field, and to `previous_refresh` when a refresh response omits the
    /// refresh token (Google does not rotate it).
    pub fn into_token_set<S: AsRef<str>>(
        self,
        requested_scopes: &[S],
        previous_refresh: Option<String>,
    ) -> TokenSet {
        let scopes = match self.scope.as_deref() {
            Some(granted) if !granted.trim().is_empty() => {
                granted.split_whitespace().map(str::to_string).collect()
            }
            _ => requested_scopes
                .iter()
                .map(|s| AsRef::<str>::as_ref(s).to_string())
                .collect(),
        };
        let expires_in = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        TokenSet {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            scopes,
            expires_at: now_millis() + expires_in * 1000,
            token_type: self.token_type.unwrap_or_else(default_token_type),
        }
    }
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Profile of the authenticated identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

/// OAuth error body, e.g. `{"error":"invalid_grant","error_description":"Bad Request"}`.
#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Boxed future returned by `TokenEndpoint` methods.
pub type EndpointFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Abstraction over the provider's token, revocation and userinfo endpoints.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn TokenEndpoint>`).
pub trait TokenEndpoint: Send + Sync {
    /// Exchange an authorization code plus PKCE verifier for tokens.
    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        verifier: &'a str,
        redirect_uri: &'a str,
    ) -> EndpointFuture<'a, TokenResponse>;

    /// Obtain a new access token. Returns `Error::InvalidGrant` when the
    /// refresh token is revoked or expired.
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> EndpointFuture<'a, TokenResponse>;

    /// Revoke a refresh or access token at the provider.
    fn revoke<'a>(&'a self, token: &'a str) -> EndpointFuture<'a, ()>;

    fn user_info<'a>(&'a self, access_token: &'a str) -> EndpointFuture<'a, UserInfo>;
}

/// Provider endpoint URLs. Defaults are Google's.
#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub revoke_url: String,
    pub userinfo_url: String,
}

impl Default for OAuthEndpoints {
    fn default() -> Self {
        Self {
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            revoke_url: GOOGLE_REVOKE_URL.to_string(),
            userinfo_url: GOOGLE_USERINFO_URL.to_string(),
        }
    }
}

/// Default timeout for token, revocation and userinfo requests.
pub const DEFAULT_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(30);

/// reqwest-backed `TokenEndpoint` for a confidential "desktop app" client.
pub struct OAuthClient {
    client_id: String,
    client_secret: Secret<String>,
    endpoints: OAuthEndpoints,
    http: reqwest::Client,
    timeout: Duration,
}

impl OAuthClient {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: Secret<String>,
        endpoints: OAuthEndpoints,
        http: reqwest::Client,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
            endpoints,
            http,
            timeout: DEFAULT_ENDPOINT_TIMEOUT,
        }
    }

    /// Per-request timeout for every provider call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn post_token_form(&self, form: &[(&str, &str)]) -> Result<reqwest::Response> {
        self.http
            .post(&self.endpoints.token_url)
            .form(form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Http(format!("token endpoint request failed: {e}")))
    }
}

/// Parse an OAuth error body into `(error, description)`, tolerating non-JSON bodies.
fn describe_oauth_error(body: &str) -> (Option<String>, String) {
    match serde_json::from_str::<OAuthErrorBody>(body) {
        Ok(parsed) => {
            let description = parsed
                .error_description
                .unwrap_or_else(|| parsed.error.clone());
            (Some(parsed.error), description)
        }
        Err(_) => (None, body.chars().take(200).collect()),
    }
}

impl TokenEndpoint for OAuthClient {
    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        verifier: &'a str,
        redirect_uri: &'a str,
    ) -> EndpointFuture<'a, TokenResponse> {
        Box::pin(async move {
            let response = self
                .post_token_form(&[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("code_verifier", verifier),
                    ("client_id", self.client_id.as_str()),
                    ("client_secret", self.client_secret.expose().as_str()),
                    ("redirect_uri", redirect_uri),
                ])
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let (_, description) = describe_oauth_error(&body);
                return Err(Error::TokenExchange(format!(
                    "token endpoint returned {status}: {description}"
                )));
            }

            debug!("authorization code exchanged");
            response
                .json::<TokenResponse>()
                .await
                .map_err(|e| Error::TokenExchange(format!("invalid token response: {e}")))
        })
    }

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> EndpointFuture<'a, TokenResponse> {
        Box::pin(async move {
            let response = self
                .post_token_form(&[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                    ("client_id", self.client_id.as_str()),
                    ("client_secret", self.client_secret.expose().as_str()),
                ])
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let (error, description) = describe_oauth_error(&body);

                // invalid_grant (400) or 401 means the refresh token is revoked or expired
                if error.as_deref() == Some("invalid_grant") || status.as_u16() == 401 {
                    return Err(Error::InvalidGrant(format!("{status}: {description}")));
                }

                return Err(Error::TokenExchange(format!(
                    "token refresh returned {status}: {description}"
                )));
            }

            response
                .json::<TokenResponse>()
                .await
                .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))
        })
    }

    fn revoke<'a>(&'a self, token: &'a str) -> EndpointFuture<'a, ()> {
        Box::pin(async move {
            let response = self
                .http
                .post(&self.endpoints.revoke_url)
                .form(&[("token", token)])
                .timeout(self.timeout)
                .send()
                .await
                .map_err(|e| Error::Http(format!("revocation request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let (_, description) = describe_oauth_error(&body);
                return Err(Error::TokenExchange(format!(
                    "revocation returned {status}: {description}"
                )));
            }
            Ok(())
        })
    }

    fn user_info<'a>(&'a self, access_token: &'a str) -> EndpointFuture<'a, UserInfo> {
        Box::pin(async move {
            let response = self
                .http
                .get(&self.endpoints.userinfo_url)
                .bearer_auth(access_token)
                .timeout(self.timeout)
                .send()
                .await
                .map_err(|e| Error::Http(format!("userinfo request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                return Err(Error::Http(format!("userinfo returned {status}")));
            }

            response
                .json::<UserInfo>()
                .await
                .map_err(|e| Error::Http(format!("invalid userinfo response: {e}")))
        })
    }
}
