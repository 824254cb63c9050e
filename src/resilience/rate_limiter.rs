use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Sliding-window admission control, keyed by caller. A key is admitted while
/// fewer than `limit` calls landed inside the trailing window; rejections do
/// not consume a slot. The read-prune-append sequence runs under one lock so
/// concurrent callers sharing a key cannot oversubscribe.
#[derive(Debug)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    limit: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            limit,
            window,
        }
    }

    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let timestamps = windows.entry(key.to_string()).or_default();

        while let Some(&front) = timestamps.front() {
            if now.duration_since(front) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() >= self.limit {
            warn!(key, in_window = timestamps.len(), limit = self.limit, "Rate limit exceeded");
            return false;
        }

        timestamps.push_back(now);
        debug!(key, in_window = timestamps.len(), limit = self.limit, "Call admitted");
        true
    }

    /// Admitted calls currently inside the window, without consuming a slot.
    pub fn current_usage(&self, key: &str) -> usize {
        let now = Instant::now();
        let windows = self.windows.lock();
        windows.get(key).map_or(0, |ts| {
            ts.iter()
                .filter(|&&t| now.duration_since(t) < self.window)
                .count()
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::sleep;

    #[test]
    fn test_exactly_limit_admitted() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));

        assert!(limiter.check("caller"));
        assert!(limiter.check("caller"));
        assert!(limiter.check("caller"));
        assert!(!limiter.check("caller"));
        assert_eq!(limiter.current_usage("caller"), 3);
    }

    #[test]
    fn test_rejection_does_not_consume_a_slot() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("caller"));

        for _ in 0..5 {
            assert!(!limiter.check("caller"));
        }
        assert_eq!(limiter.current_usage("caller"), 1);
    }

    #[test]
    fn test_keys_do_not_interact() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("a"));
        assert!(limiter.check("b"));
        assert!(!limiter.check("a"));
    }

    #[tokio::test]
    async fn test_admission_resumes_after_window() {
        let limiter = RateLimiter::new(2, Duration::from_millis(50));
        assert!(limiter.check("caller"));
        assert!(limiter.check("caller"));
        assert!(!limiter.check("caller"));

        sleep(Duration::from_millis(60)).await;
        assert!(limiter.check("caller"));
    }

    #[tokio::test]
    async fn test_concurrent_callers_shared_key() {
        let limiter = Arc::new(RateLimiter::new(10, Duration::from_secs(60)));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                let mut admitted = 0;
                for _ in 0..10 {
                    if limiter.check("shared") {
                        admitted += 1;
                    }
                }
                admitted
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 10);
    }
}
