//! Proactive background token refresh
//!
//! Spawns a periodic task that refreshes the access token before it enters
//! the preemptive window on the request path, and sweeps stale cache
//! entries. Runs independently of request handling.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Error;
use crate::manager::TokenManager;

/// Spawn a background task that refreshes expiring tokens every `interval`.
///
/// A rejected refresh token clears credentials (handled by the manager);
/// transient failures are retried on the next cycle. The task never starts
/// an interactive authorization.
pub fn spawn_refresh_task(manager: TokenManager, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick; tokens were just loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&manager).await;
        }
    })
}

/// Run one refresh cycle.
async fn refresh_cycle(manager: &TokenManager) {
    match manager.refresh_if_expiring().await {
        Ok(true) => info!("background token refresh succeeded"),
        Ok(false) => debug!("no token refresh needed"),
        Err(Error::RefreshThrottled { retry_after_secs }) => {
            debug!(retry_after_secs, "background refresh throttled");
        }
        Err(e) if e.requires_reauthorization() => {
            warn!(error = %e, "background refresh requires re-authorization");
        }
        Err(e) => {
            warn!(error = %e, "background refresh failed (transient), will retry next cycle");
        }
    }

    let swept = manager.sweep_cache().await;
    if swept > 0 {
        debug!(swept, "removed stale token cache entries");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::flow::{AuthorizationFlowCoordinator, FlowSettings};
    use crate::manager::RefreshPolicy;
    use crate::store::TokenStore;
    use crate::test_support::{
        BrowserAction, FakeBrowser, FakeEndpoint, RefreshBehavior, temp_store,
    };
    use crate::token::{TokenSet, now_millis};

    fn manager(dir: &tempfile::TempDir, endpoint: Arc<FakeEndpoint>) -> (TokenManager, Arc<TokenStore>) {
        let store = Arc::new(temp_store(dir));
        let flow = AuthorizationFlowCoordinator::new(
            FlowSettings::new("client-id"),
            endpoint.clone(),
            store.clone(),
            Arc::new(FakeBrowser::new(BrowserAction::Ignore)),
        );
        let manager = TokenManager::new(
            store.clone(),
            endpoint,
            flow,
            Vec::new(),
            RefreshPolicy::default(),
        );
        (manager, store)
    }

    fn tokens(expires_at: u64) -> TokenSet {
        TokenSet {
            access_token: "at".into(),
            refresh_token: Some("rt".into()),
            scopes: ["openid".to_string()].into_iter().collect(),
            expires_at,
            token_type: "Bearer".into(),
        }
    }

    #[tokio::test]
    async fn refresh_cycle_skips_valid_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Arc::new(FakeEndpoint::new());
        let (manager, store) = manager(&dir, endpoint.clone());
        store.store(&tokens(now_millis() + 3_600_000)).await.unwrap();

        refresh_cycle(&manager).await;

        assert_eq!(endpoint.refresh_count(), 0);
        assert_eq!(store.retrieve().await.unwrap().unwrap().access_token, "at");
    }

    #[tokio::test]
    async fn refresh_cycle_refreshes_expiring_token() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Arc::new(FakeEndpoint::new());
        let (manager, store) = manager(&dir, endpoint.clone());
        store.store(&tokens(now_millis() + 60_000)).await.unwrap();

        refresh_cycle(&manager).await;

        assert_eq!(endpoint.refresh_count(), 1);
        assert_eq!(
            store.retrieve().await.unwrap().unwrap().access_token,
            "refreshed-1"
        );
    }

    #[tokio::test]
    async fn refresh_cycle_without_tokens_never_opens_browser() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Arc::new(FakeEndpoint::new());
        let (manager, _store) = manager(&dir, endpoint.clone());

        refresh_cycle(&manager).await;

        assert_eq!(endpoint.exchange_count(), 0);
        assert_eq!(endpoint.refresh_count(), 0);
    }

    #[tokio::test]
    async fn refresh_cycle_clears_on_rejected_grant() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Arc::new(FakeEndpoint::new());
        endpoint.set_refresh_behavior(RefreshBehavior::InvalidGrant);
        let (manager, store) = manager(&dir, endpoint.clone());
        store.store(&tokens(now_millis() + 60_000)).await.unwrap();

        refresh_cycle(&manager).await;

        assert!(store.retrieve().await.unwrap().is_none());
    }
}
