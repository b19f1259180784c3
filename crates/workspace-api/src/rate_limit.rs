//! Sliding-window rate limiting per (service, endpoint)
//!
//! Each key owns its own async mutex around its timestamp window, so
//! prune + compare + append is atomic per key while different keys never
//! contend.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};

/// Requests allowed per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
        }
    }
}

type Window = Arc<Mutex<VecDeque<Instant>>>;

/// Admission control for outbound API calls.
pub struct RateLimiter {
    default_limit: RateLimit,
    service_limits: HashMap<String, RateLimit>,
    windows: Mutex<HashMap<(String, String), Window>>,
}

impl RateLimiter {
    pub fn new(default_limit: RateLimit) -> Self {
        Self {
            default_limit,
            service_limits: HashMap::new(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Override the limit for one service.
    pub fn with_service_limit(mut self, service: impl Into<String>, limit: RateLimit) -> Self {
        self.service_limits.insert(service.into(), limit);
        self
    }

    pub fn limit_for(&self, service: &str) -> RateLimit {
        self.service_limits
            .get(service)
            .copied()
            .unwrap_or(self.default_limit)
    }

    /// Admit one request or fail with `RateLimit { retry_after_secs }`.
    ///
    /// `retry_after_secs` is the time until the oldest request in the window
    /// ages out, rounded up and at least 1.
    pub async fn admit(&self, service: &str, endpoint: &str) -> Result<()> {
        let limit = self.limit_for(service);
        let window = self.window(service, endpoint).await;
        let mut stamps = window.lock().await;
        let now = Instant::now();

        while let Some(oldest) = stamps.front() {
            if now.duration_since(*oldest) >= limit.window {
                stamps.pop_front();
            } else {
                break;
            }
        }

        if stamps.len() >= limit.max_requests as usize {
            let retry_after_secs = match stamps.front() {
                Some(oldest) => {
                    let wait = limit.window.saturating_sub(now.duration_since(*oldest));
                    (wait.as_secs() + u64::from(wait.subsec_nanos() > 0)).max(1)
                }
                None => limit.window.as_secs().max(1),
            };
            debug!(service, endpoint, retry_after_secs, "rate limit reached");
            metrics::counter!("workspace_api_rate_limited_total", "service" => service.to_string())
                .increment(1);
            return Err(Error::RateLimit { retry_after_secs });
        }

        stamps.push_back(now);
        Ok(())
    }

    /// Requests still available in the current window.
    pub async fn remaining(&self, service: &str, endpoint: &str) -> u32 {
        let limit = self.limit_for(service);
        let window = self.window(service, endpoint).await;
        let stamps = window.lock().await;
        let now = Instant::now();
        let in_window = stamps
            .iter()
            .filter(|t| now.duration_since(**t) < limit.window)
            .count() as u32;
        limit.max_requests.saturating_sub(in_window)
    }

    async fn window(&self, service: &str, endpoint: &str) -> Window {
        let mut windows = self.windows.lock().await;
        let key = (service.to_string(), endpoint.to_string());
        if !windows.contains_key(&key) {
            self.prune_idle(&mut windows);
        }
        windows.entry(key).or_default().clone()
    }

    /// Drop windows whose timestamps have all aged out.
    ///
    /// Runs under the map lock, and only touches windows the map alone
    /// holds, so no caller can be admitting into a removed window.
    fn prune_idle(&self, windows: &mut HashMap<(String, String), Window>) {
        let now = Instant::now();
        let before = windows.len();
        windows.retain(|(service, _), window| {
            if Arc::strong_count(window) > 1 {
                return true;
            }
            let limit = self.limit_for(service);
            match window.try_lock() {
                Ok(stamps) => stamps
                    .back()
                    .is_some_and(|newest| now.duration_since(*newest) < limit.window),
                Err(_) => true,
            }
        });
        let pruned = before - windows.len();
        if pruned > 0 {
            debug!(pruned, "dropped idle rate limit windows");
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimit::default())
    }
}
