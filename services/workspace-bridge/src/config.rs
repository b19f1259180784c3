//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The client secret and token encryption key come from env vars or a
//! secret file, never from the TOML directly, to avoid leaking secrets.
//! A missing config file is allowed so the bridge can run from env vars
//! alone.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use serde::Deserialize;
use workspace_api::{RateLimit, RateLimiter, RetryPolicy};
use workspace_auth::{
    AUTHORIZATION_TIMEOUT, CALLBACK_PORT_ATTEMPTS, DEFAULT_REDIRECT_URI, GOOGLE_AUTH_URL,
    GOOGLE_REVOKE_URL, GOOGLE_TOKEN_URL, GOOGLE_USERINFO_URL, MIN_REFRESH_INTERVAL,
    OAuthEndpoints, PREEMPTIVE_REFRESH_THRESHOLD, RefreshPolicy, TOKEN_EXPIRY_BUFFER,
};

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "workspace-bridge.toml";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub oauth: OAuthConfig,
    pub storage: StorageConfig,
    pub http: HttpConfig,
    pub rate_limit: RateLimitConfig,
    pub refresh: RefreshConfig,
    pub metrics: MetricsConfig,
}

/// OAuth client and authorization flow settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Path to a file containing the client secret (alternative to GOOGLE_CLIENT_SECRET)
    pub client_secret_file: Option<PathBuf>,
    pub redirect_uri: String,
    /// Google services to request scopes for on first authorization.
    pub services: Vec<String>,
    pub flow_timeout_secs: u64,
    pub callback_port_attempts: u16,
    pub auth_url: String,
    pub token_url: String,
    pub revoke_url: String,
    pub userinfo_url: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: None,
            client_secret_file: None,
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            services: workspace_auth::SERVICES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            flow_timeout_secs: AUTHORIZATION_TIMEOUT.as_secs(),
            callback_port_attempts: CALLBACK_PORT_ATTEMPTS,
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            revoke_url: GOOGLE_REVOKE_URL.to_string(),
            userinfo_url: GOOGLE_USERINFO_URL.to_string(),
        }
    }
}

/// Token file settings
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Defaults to `<config dir>/google-workspace-bridge/tokens.json`.
    pub token_path: Option<PathBuf>,
    #[serde(skip)]
    pub encryption_key: Option<Secret<String>>,
}

/// Outbound API request settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            timeout_secs: workspace_api::DEFAULT_REQUEST_TIMEOUT.as_secs(),
            max_attempts: retry.max_attempts,
            initial_backoff_ms: retry.initial_backoff.as_millis() as u64,
            max_backoff_ms: retry.max_backoff.as_millis() as u64,
        }
    }
}

/// Requests allowed per window
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LimitConfig {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl From<LimitConfig> for RateLimit {
    fn from(limit: LimitConfig) -> Self {
        RateLimit {
            max_requests: limit.max_requests,
            window: Duration::from_secs(limit.window_secs),
        }
    }
}

/// Sliding-window limits: a default plus per-service overrides
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_secs: u64,
    pub services: HashMap<String, LimitConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let limit = RateLimit::default();
        Self {
            max_requests: limit.max_requests,
            window_secs: limit.window.as_secs(),
            services: HashMap::new(),
        }
    }
}

/// Token refresh timing
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Background refresh task period.
    pub interval_secs: u64,
    pub expiry_buffer_secs: u64,
    pub preemptive_threshold_secs: u64,
    pub min_refresh_interval_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            expiry_buffer_secs: TOKEN_EXPIRY_BUFFER.as_secs(),
            preemptive_threshold_secs: PREEMPTIVE_REFRESH_THRESHOLD.as_secs(),
            min_refresh_interval_secs: MIN_REFRESH_INTERVAL.as_secs(),
        }
    }
}

/// Prometheus exposition; disabled unless `listen_addr` is set
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub listen_addr: Option<SocketAddr>,
}

impl Config {
    /// Load configuration from a TOML file (if present), then overlay
    /// environment variables and validate.
    ///
    /// Client secret resolution order:
    /// 1. GOOGLE_CLIENT_SECRET env var
    /// 2. GOOGLE_CLIENT_SECRET_FILE env var, else client_secret_file from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        Self::parse(&contents, |key| std::env::var(key).ok())
    }

    /// Parse TOML, overlay values from `env`, and validate.
    pub fn parse(contents: &str, env: impl Fn(&str) -> Option<String>) -> common::Result<Self> {
        let mut config: Config = toml::from_str(contents)?;
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> common::Result<()> {
        let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        if let Some(id) = non_empty("GOOGLE_CLIENT_ID") {
            self.oauth.client_id = id.trim().to_string();
        }
        if let Some(uri) = non_empty("GOOGLE_REDIRECT_URI") {
            self.oauth.redirect_uri = uri.trim().to_string();
        }
        if let Some(file) = non_empty("GOOGLE_CLIENT_SECRET_FILE") {
            self.oauth.client_secret_file = Some(PathBuf::from(file));
        }

        // Secret: env var takes precedence over file
        if let Some(secret) = non_empty("GOOGLE_CLIENT_SECRET") {
            self.oauth.client_secret = Some(Secret::new(secret.trim().to_string()));
        } else if let Some(ref secret_file) = self.oauth.client_secret_file {
            let secret = std::fs::read_to_string(secret_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read client_secret_file {}: {e}",
                    secret_file.display()
                ))
            })?;
            let secret = secret.trim().to_owned();
            if !secret.is_empty() {
                self.oauth.client_secret = Some(Secret::new(secret));
            }
        }

        if let Some(key) = non_empty("TOKEN_ENCRYPTION_KEY") {
            self.storage.encryption_key = Some(Secret::new(key));
        }
        Ok(())
    }

    fn validate(&self) -> common::Result<()> {
        if self.oauth.client_id.trim().is_empty() {
            return Err(common::Error::missing("oauth.client_id", "GOOGLE_CLIENT_ID"));
        }
        if self.oauth.client_secret.as_ref().is_none_or(|s| s.is_blank()) {
            return Err(common::Error::missing(
                "client secret",
                "GOOGLE_CLIENT_SECRET or GOOGLE_CLIENT_SECRET_FILE",
            ));
        }

        validate_redirect_uri(&self.oauth.redirect_uri)?;

        for service in &self.oauth.services {
            if workspace_auth::scopes_for_service(service).is_none() {
                return Err(common::Error::Config(format!(
                    "unknown service {service:?}, expected one of: {}",
                    workspace_auth::SERVICES.join(", ")
                )));
            }
        }
        for (name, url) in [
            ("auth_url", &self.oauth.auth_url),
            ("token_url", &self.oauth.token_url),
            ("revoke_url", &self.oauth.revoke_url),
            ("userinfo_url", &self.oauth.userinfo_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "oauth.{name} must start with http:// or https://, got: {url}"
                )));
            }
        }

        require_nonzero("oauth.flow_timeout_secs", self.oauth.flow_timeout_secs)?;
        require_nonzero(
            "oauth.callback_port_attempts",
            u64::from(self.oauth.callback_port_attempts),
        )?;
        require_nonzero("http.timeout_secs", self.http.timeout_secs)?;
        require_nonzero("http.max_attempts", u64::from(self.http.max_attempts))?;
        require_nonzero("rate_limit.max_requests", u64::from(self.rate_limit.max_requests))?;
        require_nonzero("rate_limit.window_secs", self.rate_limit.window_secs)?;
        for (service, limit) in &self.rate_limit.services {
            if workspace_auth::scopes_for_service(service).is_none() {
                return Err(common::Error::Config(format!(
                    "rate_limit.services.{service}: unknown service"
                )));
            }
            require_nonzero(
                &format!("rate_limit.services.{service}.max_requests"),
                u64::from(limit.max_requests),
            )?;
            require_nonzero(
                &format!("rate_limit.services.{service}.window_secs"),
                limit.window_secs,
            )?;
        }
        require_nonzero("refresh.interval_secs", self.refresh.interval_secs)?;
        if self.refresh.preemptive_threshold_secs < self.refresh.expiry_buffer_secs {
            return Err(common::Error::Config(format!(
                "refresh.preemptive_threshold_secs ({}) must not be less than refresh.expiry_buffer_secs ({})",
                self.refresh.preemptive_threshold_secs, self.refresh.expiry_buffer_secs
            )));
        }

        if let Some(addr) = self.metrics.listen_addr
            && !addr.ip().is_loopback()
        {
            return Err(common::Error::Config(format!(
                "metrics.listen_addr must be a loopback address, got: {addr}"
            )));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }

    /// Scope URLs for the configured services, identity scopes included.
    pub fn requested_scopes(&self) -> Vec<String> {
        workspace_auth::scopes_for_services(&self.oauth.services)
    }

    pub fn token_path(&self) -> PathBuf {
        self.storage.token_path.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("google-workspace-bridge")
                .join("tokens.json")
        })
    }

    /// Key material for the token file: the explicit encryption key, else
    /// derived from the client credentials.
    pub fn token_key_material(&self) -> Secret<String> {
        if let Some(key) = &self.storage.encryption_key {
            return key.clone();
        }
        let secret = self
            .oauth
            .client_secret
            .as_ref()
            .map(|s| s.expose().as_str())
            .unwrap_or_default();
        Secret::new(format!("{}:{secret}", self.oauth.client_id))
    }

    pub fn client_secret(&self) -> Secret<String> {
        self.oauth
            .client_secret
            .clone()
            .unwrap_or_else(|| Secret::new(String::new()))
    }

    pub fn endpoints(&self) -> OAuthEndpoints {
        OAuthEndpoints {
            auth_url: self.oauth.auth_url.clone(),
            token_url: self.oauth.token_url.clone(),
            revoke_url: self.oauth.revoke_url.clone(),
            userinfo_url: self.oauth.userinfo_url.clone(),
        }
    }

    pub fn refresh_policy(&self) -> RefreshPolicy {
        RefreshPolicy {
            expiry_buffer: Duration::from_secs(self.refresh.expiry_buffer_secs),
            preemptive_threshold: Duration::from_secs(self.refresh.preemptive_threshold_secs),
            min_refresh_interval: Duration::from_secs(self.refresh.min_refresh_interval_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.http.max_attempts,
            initial_backoff: Duration::from_millis(self.http.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.http.max_backoff_ms),
        }
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        let default = RateLimit {
            max_requests: self.rate_limit.max_requests,
            window: Duration::from_secs(self.rate_limit.window_secs),
        };
        self.rate_limit
            .services
            .iter()
            .fold(RateLimiter::new(default), |limiter, (service, limit)| {
                limiter.with_service_limit(service.clone(), RateLimit::from(*limit))
            })
    }
}

fn require_nonzero(name: &str, value: u64) -> common::Result<()> {
    if value == 0 {
        return Err(common::Error::Config(format!("{name} must be greater than 0")));
    }
    Ok(())
}

/// Redirect URIs must be plain http on a loopback host.
fn validate_redirect_uri(uri: &str) -> common::Result<()> {
    let parsed = url::Url::parse(uri)
        .map_err(|e| common::Error::Config(format!("invalid redirect_uri {uri:?}: {e}")))?;
    if parsed.scheme() != "http" {
        return Err(common::Error::Config(format!(
            "redirect_uri must use http://, got: {uri}"
        )));
    }
    match parsed.host_str() {
        Some("127.0.0.1") | Some("localhost") => Ok(()),
        _ => Err(common::Error::Config(format!(
            "redirect_uri must point at 127.0.0.1 or localhost, got: {uri}"
        ))),
    }
}
