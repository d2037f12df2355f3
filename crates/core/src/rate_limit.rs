//! Transport-layer rate limiter: fixed window per client IP.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct Window {
    count: u32,
    started: Instant,
}

/// Fixed-window counter keyed by client IP. A background sweeper reaps
/// expired windows; `close` stops it.
pub struct IpRateLimiter {
    windows: Arc<Mutex<HashMap<String, Window>>>,
    limit: u32,
    window: Duration,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Result of a rate limit check.
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Seconds until the caller's window resets.
    pub retry_after: u64,
}

impl IpRateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        let windows: Arc<Mutex<HashMap<String, Window>>> = Arc::new(Mutex::new(HashMap::new()));

        let sweep_windows = windows.clone();
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(window);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                sweep_windows
                    .lock()
                    .unwrap()
                    .retain(|_, w| now.duration_since(w.started) < window);
            }
        });

        Self {
            windows,
            limit,
            window,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Count a request against `ip`. Refusals report the seconds left in
    /// the current window.
    pub fn check(&self, ip: &str) -> RateLimitDecision {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        let window = windows.entry(ip.to_string()).or_insert(Window {
            count: 0,
            started: now,
        });

        if now.duration_since(window.started) >= self.window {
            window.count = 0;
            window.started = now;
        }

        if window.count >= self.limit {
            let elapsed = now.duration_since(window.started);
            let retry_after = self.window.saturating_sub(elapsed).as_secs().max(1);
            return RateLimitDecision {
                allowed: false,
                retry_after,
            };
        }

        window.count += 1;
        RateLimitDecision {
            allowed: true,
            retry_after: 0,
        }
    }

    /// Stop the background sweeper.
    pub fn close(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }
}
