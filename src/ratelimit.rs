use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Sliding-window limiter keyed by client (usually the peer IP)
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<RateLimiterInner>>,
}

#[derive(Debug)]
struct RateLimiterInner {
    max_requests: u32,
    window: Duration,
    timestamps: HashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RateLimiterInner {
                max_requests,
                window,
                timestamps: HashMap::new(),
            })),
        }
    }

    /// Record a request for `key`; false when the key is over its limit
    pub async fn try_acquire(&self, key: &str) -> bool {
        self.try_acquire_at(key, Instant::now()).await
    }

    async fn try_acquire_at(&self, key: &str, now: Instant) -> bool {
        let mut inner = self.inner.lock().await;
        let window = inner.window;
        let max = inner.max_requests;

        // Drop keys whose window has fully elapsed
        inner
            .timestamps
            .retain(|_, ts| ts.last().is_some_and(|&t| now.duration_since(t) < window));

        let entry = inner.timestamps.entry(key.to_string()).or_default();
        entry.retain(|&t| now.duration_since(t) < window);
        if (entry.len() as u32) < max {
            entry.push(now);
            true
        } else {
            false
        }
    }
}
