use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::consensus::ConsensusResult;

/// Cached entries above this count trigger an expiry sweep on insert.
const SWEEP_THRESHOLD: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    query: String,
    context_tag: String,
    /// Bit pattern of the effective confidence floor, so the same query
    /// asked with a stricter floor never reuses a looser answer.
    min_confidence_bits: u64,
}

impl CacheKey {
    fn new(query: &str, context_tag: &str, min_confidence: f64) -> Self {
        Self {
            query: query.to_string(),
            context_tag: context_tag.to_string(),
            min_confidence_bits: min_confidence.to_bits(),
        }
    }
}

struct CacheEntry {
    stored_at: Instant,
    result: ConsensusResult,
}

/// Small TTL cache for merged results. Lookups remove expired entries on
/// the spot; inserts sweep the whole map once it grows past a threshold.
pub struct ResultCache {
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, query: &str, context_tag: &str, min_confidence: f64) -> Option<ConsensusResult> {
        let key = CacheKey::new(query, context_tag, min_confidence);
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.result.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn insert(
        &self,
        query: &str,
        context_tag: &str,
        min_confidence: f64,
        result: ConsensusResult,
    ) {
        let key = CacheKey::new(query, context_tag, min_confidence);
        let mut entries = self.entries.lock();
        if entries.len() >= SWEEP_THRESHOLD {
            let before = entries.len();
            entries.retain(|_, e| e.stored_at.elapsed() < self.ttl);
            debug!(
                evicted = before - entries.len(),
                "Swept expired consensus cache entries"
            );
        }
        entries.insert(
            key,
            CacheEntry {
                stored_at: Instant::now(),
                result,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(text: &str) -> ConsensusResult {
        ConsensusResult {
            text: text.to_string(),
            confidence: 0.8,
            contributors: vec!["a".to_string()],
            outliers: Vec::new(),
            justification: "test".to_string(),
        }
    }

    #[test]
    fn test_hit_within_ttl() {
        let cache = ResultCache::new(Duration::from_secs(60));
        cache.insert("q", "general", 0.0, result("answer"));

        let hit = cache.get("q", "general", 0.0).unwrap();
        assert_eq!(hit.text, "answer");
    }

    #[test]
    fn test_expired_entry_is_removed() {
        let cache = ResultCache::new(Duration::from_millis(10));
        cache.insert("q", "general", 0.0, result("answer"));

        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.get("q", "general", 0.0).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_confidence_floor_is_part_of_the_key() {
        let cache = ResultCache::new(Duration::from_secs(60));
        cache.insert("q", "general", 0.5, result("loose"));

        assert!(cache.get("q", "general", 0.9).is_none());
        assert_eq!(cache.get("q", "general", 0.5).unwrap().text, "loose");
    }

    #[test]
    fn test_context_tag_is_part_of_the_key() {
        let cache = ResultCache::new(Duration::from_secs(60));
        cache.insert("q", "juridico", 0.0, result("legal"));

        assert!(cache.get("q", "general", 0.0).is_none());
        assert_eq!(cache.len(), 1);
    }
}
