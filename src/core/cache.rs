use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use super::rates::RateSnapshot;

#[derive(Debug, Clone)]
struct CacheEntry {
    snapshot: RateSnapshot,
    expires_at: Instant,
}

/// Holds the most recent successful snapshot for a single base currency.
///
/// Asking for another base is a miss; the slot is only ever replaced, never
/// evicted.
#[derive(Debug)]
pub struct CacheSlot {
    ttl: Duration,
    inner: RwLock<Option<CacheEntry>>,
}

impl CacheSlot {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(None),
        }
    }

    /// `base` must already be normalized.
    pub async fn get(&self, base: &str) -> Option<RateSnapshot> {
        let entry = self.inner.read().await;
        match entry.as_ref() {
            Some(e) if e.snapshot.base == base && Instant::now() < e.expires_at => {
                debug!(base, provider = %e.snapshot.provider, "Cache HIT");
                Some(e.snapshot.clone())
            }
            Some(e) if e.snapshot.base == base => {
                debug!(base, "Cache entry expired");
                None
            }
            _ => {
                debug!(base, "Cache MISS");
                None
            }
        }
    }

    pub async fn put(&self, snapshot: RateSnapshot) {
        let entry = CacheEntry {
            snapshot,
            expires_at: Instant::now() + self.ttl,
        };
        debug!(base = %entry.snapshot.base, "Cache PUT");
        *self.inner.write().await = Some(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn snapshot(base: &str, provider: &str) -> RateSnapshot {
        RateSnapshot {
            base: base.to_string(),
            timestamp: 1_640_995_200,
            rates: HashMap::from([("EUR".to_string(), 0.85), ("GBP".to_string(), 0.73)]),
            provider: provider.to_string(),
        }
    }

    #[tokio::test]
    async fn test_cache_get_put() {
        let cache = CacheSlot::new(Duration::from_secs(60));

        // Initially, cache is empty
        assert!(cache.get("USD").await.is_none());

        cache.put(snapshot("USD", "erapi")).await;
        assert_eq!(cache.get("USD").await, Some(snapshot("USD", "erapi")));

        // Different base is a miss, not an eviction
        assert!(cache.get("EUR").await.is_none());
        assert!(cache.get("USD").await.is_some());
    }

    #[tokio::test]
    async fn test_put_supersedes_previous_entry() {
        let cache = CacheSlot::new(Duration::from_secs(60));
        cache.put(snapshot("USD", "erapi")).await;
        cache.put(snapshot("EUR", "frankfurter")).await;

        assert!(cache.get("USD").await.is_none());
        assert_eq!(
            cache.get("EUR").await.map(|s| s.provider),
            Some("frankfurter".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = CacheSlot::new(Duration::from_secs(60));
        cache.put(snapshot("USD", "erapi")).await;

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get("USD").await.is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get("USD").await.is_none());
    }
}
