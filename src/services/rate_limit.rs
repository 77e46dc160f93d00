use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hyper::HeaderMap;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::{RateLimitConfig, USER_AGENT_KEY_LEN};
use crate::models::RateLimitEntry;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of one rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: SystemTime,
    pub retry_after_secs: u64,
}

impl RateLimitDecision {
    pub fn reset_unix_secs(&self) -> u64 {
        self.reset_time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Fixed-window request counter keyed by client.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    entries: RwLock<HashMap<String, RateLimitEntry>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            window: config.window,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn check(&self, key: &str) -> RateLimitDecision {
        self.check_at(key, SystemTime::now()).await
    }

    /// Holds the write lock across the read and the increment, so concurrent
    /// requests from one client cannot both slip past the limit.
    pub async fn check_at(&self, key: &str, now: SystemTime) -> RateLimitDecision {
        let mut entries = self.entries.write().await;

        let entry = entries.entry(key.to_string()).or_insert_with(|| RateLimitEntry {
            count: 0,
            reset_time: now,
        });

        let allowed = if entry.count == 0 || now > entry.reset_time {
            entry.count = 1;
            entry.reset_time = now + self.window;
            true
        } else if entry.count < self.max_requests {
            entry.count += 1;
            true
        } else {
            false
        };

        let left = entry.reset_time.duration_since(now).unwrap_or_default();
        let mut retry_after_secs = left.as_secs() + u64::from(left.subsec_nanos() > 0);
        if !allowed {
            retry_after_secs = retry_after_secs.max(1);
        }

        RateLimitDecision {
            allowed,
            limit: self.max_requests,
            remaining: self.max_requests.saturating_sub(entry.count),
            reset_time: entry.reset_time,
            retry_after_secs,
        }
    }

    /// Drops entries whose window closed more than `grace` before `now`.
    pub async fn sweep_expired(&self, now: SystemTime, grace: Duration) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| {
            now.duration_since(entry.reset_time)
                .map(|past| past <= grace)
                .unwrap_or(true)
        });
        before - entries.len()
    }

    /// `every` is clamped to at least one second; `interval` panics on zero.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        let every = every.max(MIN_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let removed = self.sweep_expired(SystemTime::now(), self.window).await;
                if removed > 0 {
                    debug!(removed, "swept expired rate limit entries");
                }
            }
        })
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

/// Forwarded IP (or real IP) plus a truncated user agent, so clients behind
/// one NAT address are told apart.
pub fn client_key(headers: &HeaderMap) -> String {
    let ip = client_ip(headers);
    let user_agent: String = headers
        .get("user-agent")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .chars()
        .take(USER_AGENT_KEY_LEN)
        .collect();

    format!("{}:{}", ip, user_agent)
}

pub fn client_ip(headers: &HeaderMap) -> String {
    if let Some(ip) = headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return ip.to_string();
    }

    headers
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or("unknown")
        .to_string()
}
