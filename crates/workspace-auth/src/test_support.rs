//! In-process fakes shared by the flow and manager tests.

use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use common::Secret;

use crate::error::{Error, Result};
use crate::flow::BrowserOpener;
use crate::store::TokenStore;
use crate::token::{EndpointFuture, TokenEndpoint, TokenResponse, UserInfo};

/// How the fake token endpoint answers refresh requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefreshBehavior {
    Succeed,
    InvalidGrant,
    ServerError,
}

/// Counting `TokenEndpoint` with scriptable refresh behavior.
pub(crate) struct FakeEndpoint {
    pub exchanges: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub revocations: AtomicUsize,
    pub expires_in: AtomicU64,
    pub refresh_behavior: Mutex<RefreshBehavior>,
    pub refresh_delay: Duration,
    pub granted_scope: Mutex<Option<String>>,
}

impl FakeEndpoint {
    pub fn new() -> Self {
        Self {
            exchanges: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            revocations: AtomicUsize::new(0),
            expires_in: AtomicU64::new(3600),
            refresh_behavior: Mutex::new(RefreshBehavior::Succeed),
            refresh_delay: Duration::ZERO,
            granted_scope: Mutex::new(None),
        }
    }

    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub fn set_refresh_behavior(&self, behavior: RefreshBehavior) {
        *self.refresh_behavior.lock().unwrap() = behavior;
    }

    pub fn exchange_count(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

impl TokenEndpoint for FakeEndpoint {
    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        verifier: &'a str,
        _redirect_uri: &'a str,
    ) -> EndpointFuture<'a, TokenResponse> {
        Box::pin(async move {
            assert!(!code.is_empty());
            assert!(verifier.len() >= 43);
            let n = self.exchanges.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TokenResponse {
                access_token: format!("access-{n}"),
                refresh_token: Some(format!("refresh-{n}")),
                expires_in: Some(self.expires_in.load(Ordering::SeqCst)),
                scope: self.granted_scope.lock().unwrap().clone(),
                token_type: Some("Bearer".into()),
            })
        })
    }

    fn refresh<'a>(&'a self, _refresh_token: &'a str) -> EndpointFuture<'a, TokenResponse> {
        Box::pin(async move {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.refresh_delay.is_zero() {
                tokio::time::sleep(self.refresh_delay).await;
            }
            let behavior = *self.refresh_behavior.lock().unwrap();
            match behavior {
                RefreshBehavior::Succeed => Ok(TokenResponse {
                    access_token: format!("refreshed-{n}"),
                    refresh_token: None,
                    expires_in: Some(self.expires_in.load(Ordering::SeqCst)),
                    scope: None,
                    token_type: Some("Bearer".into()),
                }),
                RefreshBehavior::InvalidGrant => {
                    Err(Error::InvalidGrant("400 Bad Request: invalid_grant".into()))
                }
                RefreshBehavior::ServerError => {
                    Err(Error::TokenExchange("token refresh returned 503".into()))
                }
            }
        })
    }

    fn revoke<'a>(&'a self, _token: &'a str) -> EndpointFuture<'a, ()> {
        Box::pin(async move {
            self.revocations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn user_info<'a>(&'a self, _access_token: &'a str) -> EndpointFuture<'a, UserInfo> {
        Box::pin(async move {
            Ok(UserInfo {
                id: Some("1234".into()),
                email: Some("user@example.com".into()),
                name: Some("Test User".into()),
                picture: None,
            })
        })
    }
}

/// What the fake browser does with the consent URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BrowserAction {
    /// Redirect back with a code and the original state.
    Approve,
    /// Redirect back with `error=access_denied`.
    Deny,
    /// Redirect back with a code but a forged state.
    ForgeState,
    /// Never redirect.
    Ignore,
}

/// `BrowserOpener` that plays the user's part by calling the callback URL.
pub(crate) struct FakeBrowser {
    action: BrowserAction,
    pub opened: AtomicUsize,
    pub last_url: Mutex<Option<String>>,
}

impl FakeBrowser {
    pub fn new(action: BrowserAction) -> Self {
        Self {
            action,
            opened: AtomicUsize::new(0),
            last_url: Mutex::new(None),
        }
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Loopback address of the `redirect_uri` in the last consent URL.
    pub fn callback_addr(&self) -> Option<String> {
        let url = self.last_url.lock().unwrap().clone()?;
        let parsed = url::Url::parse(&url).ok()?;
        let redirect = parsed
            .query_pairs()
            .find(|(k, _)| k == "redirect_uri")
            .map(|(_, v)| v.into_owned())?;
        let redirect = url::Url::parse(&redirect).ok()?;
        Some(format!(
            "{}:{}",
            redirect.host_str()?,
            redirect.port_or_known_default()?
        ))
    }
}

impl BrowserOpener for FakeBrowser {
    fn open(&self, url: &str) -> io::Result<()> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        *self.last_url.lock().unwrap() = Some(url.to_string());

        if self.action == BrowserAction::Ignore {
            return Ok(());
        }

        let parsed = url::Url::parse(url).map_err(io::Error::other)?;
        let param = |name: &str| {
            parsed
                .query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default()
        };
        let redirect_uri = param("redirect_uri");
        let state = param("state");

        let target = match self.action {
            BrowserAction::Approve => format!("{redirect_uri}?code=test-code&state={state}"),
            BrowserAction::Deny => format!("{redirect_uri}?error=access_denied&state={state}"),
            BrowserAction::ForgeState => format!("{redirect_uri}?code=test-code&state=forged"),
            BrowserAction::Ignore => unreachable!(),
        };

        tokio::spawn(async move {
            let _ = reqwest::get(&target).await;
        });
        Ok(())
    }
}

/// Token store in a temp dir with cheap key derivation.
pub(crate) fn temp_store(dir: &tempfile::TempDir) -> TokenStore {
    TokenStore::new(
        dir.path().join("tokens.json"),
        Secret::new("test-key-material".to_string()),
    )
    .with_iterations(1_000)
}
