//! Token lifecycle management
//!
//! `TokenManager` hands out access tokens that are valid and cover the
//! caller's scopes. Tokens come from memory, then the encrypted store, then
//! the interactive flow. Refresh happens on access when expiry is within the
//! preemptive threshold, and from the periodic task in `refresh.rs`.
//!
//! Concurrency:
//! - acquisitions for the same scope key share one in-flight future
//! - refreshes are serialized by a gate that also enforces the minimum
//!   interval between refresh attempts

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::Shared;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::constants::{MIN_REFRESH_INTERVAL, PREEMPTIVE_REFRESH_THRESHOLD, TOKEN_EXPIRY_BUFFER};
use crate::error::{Error, Result};
use crate::flow::{Authenticated, AuthorizationFlowCoordinator};
use crate::scope;
use crate::store::TokenStore;
use crate::token::{TokenEndpoint, TokenSet, UserInfo, now_millis};

/// Expiry and refresh timing.
#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    /// A token expiring within this window counts as expired.
    pub expiry_buffer: Duration,
    /// A token expiring within this window is refreshed on access.
    pub preemptive_threshold: Duration,
    /// Minimum spacing between refresh attempts.
    pub min_refresh_interval: Duration,
}

impl RefreshPolicy {
    /// Window inside which a token is refreshed rather than handed out.
    ///
    /// Never narrower than the expiry buffer, so a token served from cache
    /// is always valid under the buffer.
    pub fn refresh_window(&self) -> Duration {
        self.preemptive_threshold.max(self.expiry_buffer)
    }
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            expiry_buffer: TOKEN_EXPIRY_BUFFER,
            preemptive_threshold: PREEMPTIVE_REFRESH_THRESHOLD,
            min_refresh_interval: MIN_REFRESH_INTERVAL,
        }
    }
}

/// Per-scope-key cache entry.
#[derive(Debug, Clone)]
struct CachedTokenEntry {
    access_token: String,
    expires_at: u64,
}

/// Snapshot of the authentication state. Never carries token values.
#[derive(Debug, Clone, Serialize)]
pub struct TokenStatus {
    pub authenticated: bool,
    pub valid: bool,
    pub expires_at: Option<u64>,
    pub expires_in_secs: Option<u64>,
    pub has_refresh_token: bool,
    pub scopes: Vec<String>,
    pub user: Option<UserInfo>,
    pub flow_state: &'static str,
    pub cached_keys: usize,
}

type Acquisition = Shared<Pin<Box<dyn Future<Output = Result<String>> + Send>>>;

struct ManagerInner {
    store: Arc<TokenStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    flow: AuthorizationFlowCoordinator,
    policy: RefreshPolicy,
    default_scopes: Vec<String>,
    current: RwLock<Option<TokenSet>>,
    user: RwLock<Option<UserInfo>>,
    cache: RwLock<HashMap<String, CachedTokenEntry>>,
    in_flight: Mutex<HashMap<String, Acquisition>>,
    /// Time of the last refresh attempt. Held across the refresh call.
    refresh_gate: Mutex<Option<Instant>>,
}

/// Owns the token lifecycle for the single authenticated identity.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<ManagerInner>,
}

impl TokenManager {
    /// `default_scopes` are always requested in addition to the caller's
    /// scopes when a new authorization is needed.
    pub fn new(
        store: Arc<TokenStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        flow: AuthorizationFlowCoordinator,
        default_scopes: Vec<String>,
        policy: RefreshPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store,
                endpoint,
                flow,
                policy,
                default_scopes,
                current: RwLock::new(None),
                user: RwLock::new(None),
                cache: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                refresh_gate: Mutex::new(None),
            }),
        }
    }

    pub fn flow(&self) -> &AuthorizationFlowCoordinator {
        &self.inner.flow
    }

    /// Return an access token that is valid and covers `required`.
    ///
    /// Fails with `Authentication` when no usable credentials can be
    /// obtained and `Authorization { missing }` when the granted scopes do
    /// not cover `required`.
    pub async fn get_valid_token(&self, required: &[String]) -> Result<String> {
        let key = scope::cache_key(required);
        if let Some(token) = self.inner.cached(&key).await {
            return Ok(token);
        }

        let acquisition = {
            let mut in_flight = self.inner.in_flight.lock().await;
            match in_flight.get(&key) {
                Some(existing) => {
                    debug!(key = %key, "joining in-flight token acquisition");
                    existing.clone()
                }
                None => {
                    let inner = self.inner.clone();
                    let required = required.to_vec();
                    let task_key = key.clone();
                    let future: Pin<Box<dyn Future<Output = Result<String>> + Send>> =
                        Box::pin(async move {
                            let result = inner.acquire(&task_key, &required).await;
                            inner.in_flight.lock().await.remove(&task_key);
                            result
                        });
                    let shared = future.shared();
                    in_flight.insert(key.clone(), shared.clone());
                    shared
                }
            }
        };

        acquisition.await
    }

    /// Run the authorization flow for `scopes` plus the default scopes and
    /// adopt the result.
    pub async fn authenticate(&self, scopes: &[String]) -> Result<Authenticated> {
        self.inner.authorize(scopes).await
    }

    /// Like `get_valid_token`, but runs incremental authorization when the
    /// granted scopes do not cover `required`. The new grant requests the
    /// union of what is already granted and what is required.
    pub async fn ensure_scopes(&self, required: &[String]) -> Result<String> {
        let (granted, missing) = match self.inner.load_tokens().await? {
            Some(tokens) if scope::covers(&tokens.scopes, required) => {
                return self.get_valid_token(required).await;
            }
            Some(tokens) => (
                tokens.scope_list(),
                scope::missing(&tokens.scopes, required),
            ),
            None => (Vec::new(), required.to_vec()),
        };

        info!(missing = ?missing, "requesting additional scopes");
        let wanted = scope::union(&granted, required);
        self.inner.authorize(&wanted).await?;
        self.get_valid_token(required).await
    }

    /// Drop cached tokens after the API rejected them.
    ///
    /// Every cache entry shares the one access token, so the whole cache is
    /// cleared and the token is marked stale in memory and in the store. The
    /// next acquisition refreshes, or re-authorizes when there is no refresh
    /// token.
    pub async fn invalidate(&self, scopes: &[String]) {
        let key = scope::cache_key(scopes);
        self.inner.cache.write().await.clear();
        let stale = self.inner.current.write().await.as_mut().map(|current| {
            current.expires_at = 0;
            current.clone()
        });
        if let Some(stale) = stale
            && let Err(e) = self.inner.store.store(&stale).await
        {
            warn!(error = %e, "failed to persist invalidated token");
        }
        debug!(key = %key, "invalidated cached tokens");
    }

    /// Revoke the grant at the provider, then clear all local state.
    ///
    /// A provider-side failure is logged; local state is cleared regardless.
    pub async fn revoke(&self) -> Result<()> {
        let tokens = self.inner.load_tokens().await?;
        if let Some(tokens) = tokens {
            let token = tokens
                .refresh_token
                .as_deref()
                .unwrap_or(&tokens.access_token);
            match self.inner.endpoint.revoke(token).await {
                Ok(()) => info!("revoked grant at provider"),
                Err(e) => warn!(error = %e, "provider revocation failed, clearing local tokens anyway"),
            }
        }
        self.inner.clear_all().await;
        Ok(())
    }

    pub async fn status(&self) -> Result<TokenStatus> {
        let tokens = self.inner.load_tokens().await?;
        let user = self.inner.user.read().await.clone();
        let cached_keys = self.inner.cache.read().await.len();
        let flow_state = self.inner.flow.state().label();

        Ok(match tokens {
            Some(tokens) => TokenStatus {
                authenticated: true,
                valid: tokens.is_valid(self.inner.policy.expiry_buffer),
                expires_at: Some(tokens.expires_at),
                expires_in_secs: Some(tokens.remaining().as_secs()),
                has_refresh_token: tokens.refresh_token.is_some(),
                scopes: tokens.scope_list(),
                user,
                flow_state,
                cached_keys,
            },
            None => TokenStatus {
                authenticated: false,
                valid: false,
                expires_at: None,
                expires_in_secs: None,
                has_refresh_token: false,
                scopes: Vec::new(),
                user,
                flow_state,
                cached_keys,
            },
        })
    }

    /// Refresh the token if it expires within the preemptive threshold.
    ///
    /// Returns `true` when a new access token was obtained. Never starts the
    /// interactive flow.
    pub async fn refresh_if_expiring(&self) -> Result<bool> {
        let Some(tokens) = self.inner.load_tokens().await? else {
            return Ok(false);
        };
        if !tokens.expires_within(self.inner.policy.refresh_window()) {
            return Ok(false);
        }
        if tokens.refresh_token.is_none() {
            debug!("token expiring but no refresh token available");
            return Ok(false);
        }
        let refreshed = self.inner.refresh_current().await?;
        Ok(refreshed.access_token != tokens.access_token)
    }

    /// Remove cache entries that are expired or inside the preemptive window.
    pub async fn sweep_cache(&self) -> usize {
        let threshold = self.inner.policy.refresh_window().as_millis() as u64;
        let now = now_millis();
        let mut cache = self.inner.cache.write().await;
        let before = cache.len();
        cache.retain(|_, entry| now + threshold < entry.expires_at);
        before - cache.len()
    }
}

impl ManagerInner {
    async fn cached(&self, key: &str) -> Option<String> {
        let threshold = self.policy.refresh_window().as_millis() as u64;
        let cache = self.cache.read().await;
        cache
            .get(key)
            .filter(|entry| now_millis() + threshold < entry.expires_at)
            .map(|entry| entry.access_token.clone())
    }

    async fn acquire(&self, key: &str, required: &[String]) -> Result<String> {
        if let Some(token) = self.cached(key).await {
            return Ok(token);
        }

        let tokens = match self.load_tokens().await? {
            None => {
                info!("no stored tokens, starting authorization");
                self.authorize(required).await?.tokens
            }
            Some(tokens) if tokens.expires_within(self.policy.refresh_window()) => {
                if tokens.refresh_token.is_some() {
                    self.refresh_current().await?
                } else if tokens.is_valid(self.policy.expiry_buffer) {
                    tokens
                } else {
                    info!("token expired without refresh token, starting authorization");
                    self.authorize(required).await?.tokens
                }
            }
            Some(tokens) => tokens,
        };

        let missing = scope::missing(&tokens.scopes, required);
        if !missing.is_empty() {
            debug!(key, missing = missing.len(), "granted scopes do not cover request");
            return Err(Error::Authorization { missing });
        }

        self.cache.write().await.insert(
            key.to_string(),
            CachedTokenEntry {
                access_token: tokens.access_token.clone(),
                expires_at: tokens.expires_at,
            },
        );
        Ok(tokens.access_token)
    }

    /// Current tokens from memory, else from the store.
    async fn load_tokens(&self) -> Result<Option<TokenSet>> {
        if let Some(tokens) = self.current.read().await.clone() {
            return Ok(Some(tokens));
        }
        let loaded = self.store.retrieve().await?;
        if let Some(tokens) = &loaded {
            let mut current = self.current.write().await;
            if current.is_none() {
                *current = Some(tokens.clone());
            }
        }
        Ok(loaded)
    }

    async fn authorize(&self, scopes: &[String]) -> Result<Authenticated> {
        let wanted = scope::union(&self.default_scopes, scopes);
        let auth = self.flow.authenticate(&wanted).await?;
        *self.user.write().await = Some(auth.user.clone());
        self.adopt(auth.tokens.clone(), false).await;
        Ok(auth)
    }

    /// Refresh the in-memory token through the gate.
    async fn refresh_current(&self) -> Result<TokenSet> {
        let mut gate = self.refresh_gate.lock().await;

        let current = self
            .current
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Authentication("no tokens to refresh".into()))?;

        // Refreshed by another caller while waiting on the gate
        if !current.expires_within(self.policy.refresh_window()) {
            return Ok(current);
        }

        if let Some(last) = *gate {
            let since = last.elapsed();
            if since < self.policy.min_refresh_interval {
                if current.is_valid(self.policy.expiry_buffer) {
                    debug!("refresh throttled, using current token");
                    return Ok(current);
                }
                let remaining = self.policy.min_refresh_interval - since;
                let retry_after_secs =
                    (remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0)).max(1);
                return Err(Error::RefreshThrottled { retry_after_secs });
            }
        }

        let Some(refresh_token) = current.refresh_token.clone() else {
            return Err(Error::Authentication(
                "token expired and no refresh token is available".into(),
            ));
        };

        *gate = Some(Instant::now());
        debug!("refreshing access token");

        match self.endpoint.refresh(&refresh_token).await {
            Ok(response) => {
                let refreshed =
                    response.into_token_set(&current.scope_list(), Some(refresh_token));
                metrics::counter!("workspace_auth_refresh_total", "outcome" => "success")
                    .increment(1);
                info!(
                    expires_in_secs = refreshed.remaining().as_secs(),
                    "access token refreshed"
                );
                self.adopt(refreshed.clone(), true).await;
                Ok(refreshed)
            }
            Err(Error::InvalidGrant(reason)) => {
                metrics::counter!("workspace_auth_refresh_total", "outcome" => "invalid_grant")
                    .increment(1);
                warn!(reason = %reason, "refresh token rejected, clearing credentials");
                drop(gate);
                self.clear_all().await;
                Err(Error::Authentication(
                    "refresh token rejected, re-authorization required".into(),
                ))
            }
            Err(e) => {
                metrics::counter!("workspace_auth_refresh_total", "outcome" => "failure")
                    .increment(1);
                if current.is_valid(self.policy.expiry_buffer) {
                    warn!(error = %e, "token refresh failed, keeping current token");
                    Ok(current)
                } else {
                    warn!(error = %e, "token refresh failed");
                    Err(e)
                }
            }
        }
    }

    /// Make `tokens` current and drop cache entries for the old token.
    async fn adopt(&self, tokens: TokenSet, persist: bool) {
        if persist && let Err(e) = self.store.store(&tokens).await {
            warn!(error = %e, "failed to persist tokens");
        }
        *self.current.write().await = Some(tokens);
        self.cache.write().await.clear();
    }

    async fn clear_all(&self) {
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "failed to remove token file");
        }
        *self.current.write().await = None;
        *self.user.write().await = None;
        self.cache.write().await.clear();
        info!("cleared all credentials");
    }
}
