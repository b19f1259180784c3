//! Google OAuth authentication and token lifecycle
//!
//! Provides the PKCE authorization flow with a loopback callback listener,
//! encrypted token storage, scope validation, and the token manager that
//! hands out valid access tokens to API callers.
//!
//! Token flow:
//! 1. Caller asks `TokenManager::get_valid_token()` for a set of scopes
//! 2. No stored tokens: `AuthorizationFlowCoordinator` opens the consent URL
//!    and waits on `CallbackListener` for the redirect
//! 3. The code is exchanged via `TokenEndpoint` and saved in `TokenStore`
//! 4. Expiring tokens are refreshed on access and by `spawn_refresh_task()`
//! 5. A rejected refresh token clears all state; the next call re-authorizes

pub mod callback;
pub mod constants;
pub mod error;
pub mod flow;
pub mod manager;
pub mod pkce;
pub mod refresh;
pub mod scope;
pub mod store;
pub mod token;

#[cfg(test)]
mod test_support;

pub use callback::{CallbackListener, CallbackOutcome};
pub use constants::*;
pub use error::{Error, Result};
pub use flow::{
    Authenticated, AuthorizationFlowCoordinator, BrowserOpener, FlowSettings, FlowState,
    SystemBrowser,
};
pub use manager::{RefreshPolicy, TokenManager, TokenStatus};
pub use pkce::{PkceChallenge, build_authorization_url, generate_state};
pub use refresh::spawn_refresh_task;
pub use store::TokenStore;
pub use token::{OAuthClient, OAuthEndpoints, TokenEndpoint, TokenResponse, TokenSet, UserInfo};
