use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

/// Per-key failure-streak tracker with timed half-open recovery. Keys are
/// fully independent; one backend tripping never affects another.
///
/// State machine per key: closed -> open once the failure streak reaches the
/// threshold; after `reset_timeout` the next `is_open` check transitions to
/// half-open (streak reset, one probe call allowed through); a success closes
/// the circuit, a renewed failure re-opens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    entries: RwLock<HashMap<String, CircuitEntry>>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
struct CircuitEntry {
    failures: u32,
    open_until: Option<Instant>,
    half_open: bool,
}

#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    pub key: String,
    pub failures: u32,
    pub open: bool,
    pub remaining_open: Option<Duration>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        info!(
            threshold = failure_threshold,
            reset_timeout_ms = reset_timeout.as_millis() as u64,
            "Creating circuit breaker"
        );
        Self {
            entries: RwLock::new(HashMap::new()),
            failure_threshold,
            reset_timeout,
        }
    }

    /// True while the circuit is open. An expired open window flips the key
    /// to half-open here: the streak is cleared, the key is marked half-open
    /// and this call returns false, letting the next attempt through as a
    /// probe. If that probe fails, `record_failure` re-opens on the spot.
    pub fn is_open(&self, key: &str) -> bool {
        let needs_transition = {
            let entries = self.entries.read();
            match entries.get(key).and_then(|e| e.open_until) {
                Some(open_until) if Instant::now() < open_until => return true,
                Some(_) => true,
                None => return false,
            }
        };

        if needs_transition {
            let mut entries = self.entries.write();
            if let Some(entry) = entries.get_mut(key) {
                // Re-check under the write lock; another caller may have
                // already transitioned or re-opened the circuit.
                match entry.open_until {
                    Some(open_until) if Instant::now() < open_until => return true,
                    Some(_) => {
                        entry.open_until = None;
                        entry.failures = 0;
                        entry.half_open = true;
                        info!(key, "Circuit breaker transitioning to half-open");
                    }
                    None => {}
                }
            }
        }
        false
    }

    pub fn record_failure(&self, key: &str) {
        let mut entries = self.entries.write();
        let entry = entries.entry(key.to_string()).or_default();
        entry.failures += 1;
        debug!(
            key,
            failures = entry.failures,
            threshold = self.failure_threshold,
            "Circuit breaker failure recorded"
        );

        // A failure while half-open re-opens without waiting for a fresh
        // streak; the probe call already proved the backend is still down.
        if entry.half_open || entry.failures >= self.failure_threshold {
            entry.half_open = false;
            entry.open_until = Some(Instant::now() + self.reset_timeout);
            warn!(
                key,
                failures = entry.failures,
                "Circuit breaker opened"
            );
        }
    }

    pub fn record_success(&self, key: &str) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(key) {
            if entry.failures > 0 || entry.open_until.is_some() {
                debug!(key, "Circuit breaker reset after success");
            }
            entry.failures = 0;
            entry.open_until = None;
            entry.half_open = false;
        }
    }

    pub fn failure_count(&self, key: &str) -> u32 {
        self.entries.read().get(key).map_or(0, |e| e.failures)
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let now = Instant::now();
        self.entries
            .read()
            .iter()
            .map(|(key, entry)| {
                let remaining = entry
                    .open_until
                    .and_then(|until| until.checked_duration_since(now));
                CircuitSnapshot {
                    key: key.clone(),
                    failures: entry.failures,
                    open: remaining.is_some(),
                    remaining_open: remaining,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[test]
    fn test_closed_until_threshold() {
        let cb = CircuitBreaker::new(3, Duration::from_millis(100));

        cb.record_failure("a");
        cb.record_failure("a");
        assert!(!cb.is_open("a"));

        cb.record_failure("a");
        assert!(cb.is_open("a"));
        assert_eq!(cb.failure_count("a"), 3);
    }

    #[test]
    fn test_keys_are_independent() {
        let cb = CircuitBreaker::new(1, Duration::from_secs(60));
        cb.record_failure("a");
        assert!(cb.is_open("a"));
        assert!(!cb.is_open("b"));
    }

    #[test]
    fn test_success_resets() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));
        cb.record_failure("a");
        cb.record_failure("a");
        cb.record_success("a");
        assert_eq!(cb.failure_count("a"), 0);

        // Streak starts over after the reset.
        cb.record_failure("a");
        cb.record_failure("a");
        assert!(!cb.is_open("a"));
    }

    #[tokio::test]
    async fn test_half_open_after_timeout() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(50));
        cb.record_failure("a");
        assert!(cb.is_open("a"));

        sleep(Duration::from_millis(60)).await;

        // First check after expiry flips to half-open and lets the probe in.
        assert!(!cb.is_open("a"));
        assert_eq!(cb.failure_count("a"), 0);

        // A failed probe re-opens immediately (threshold 1).
        cb.record_failure("a");
        assert!(cb.is_open("a"));
    }

    #[tokio::test]
    async fn test_failed_half_open_probe_reopens() {
        let cb = CircuitBreaker::new(3, Duration::from_millis(50));
        for _ in 0..3 {
            cb.record_failure("a");
        }
        assert!(cb.is_open("a"));

        sleep(Duration::from_millis(60)).await;
        assert!(!cb.is_open("a"));

        // One failure is enough while half-open, threshold notwithstanding.
        cb.record_failure("a");
        assert!(cb.is_open("a"));
    }

    #[tokio::test]
    async fn test_half_open_probe_success_closes() {
        let cb = CircuitBreaker::new(2, Duration::from_millis(50));
        cb.record_failure("a");
        cb.record_failure("a");
        assert!(cb.is_open("a"));

        sleep(Duration::from_millis(60)).await;
        assert!(!cb.is_open("a"));

        cb.record_success("a");
        assert!(!cb.is_open("a"));
        assert_eq!(cb.failure_count("a"), 0);
    }

    #[test]
    fn test_snapshot() {
        let cb = CircuitBreaker::new(1, Duration::from_secs(60));
        cb.record_failure("down");
        cb.record_success("up");

        let snapshot = cb.snapshot();
        let down = snapshot.iter().find(|s| s.key == "down").unwrap();
        assert!(down.open);
        assert!(down.remaining_open.is_some());
    }
}
