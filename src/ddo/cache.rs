//! Resolution cache - one record per DDO id, refreshed as a whole
//!
//! Entries never expire individually; the cache carries a single refresh
//! timestamp and is considered fresh for `ttl` after it.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use super::FindDdoResult;

struct CacheState {
    entries: HashMap<String, FindDdoResult>,
    updated: Option<Instant>,
}

pub struct DdoCache {
    ttl: Duration,
    state: RwLock<CacheState>,
}

impl DdoCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                updated: None,
            }),
        }
    }

    /// Entry for `id` if the cache was refreshed within the TTL.
    pub async fn fresh(&self, id: &str) -> Option<FindDdoResult> {
        let state = self.state.read().await;
        let updated = state.updated?;
        if updated.elapsed() >= self.ttl {
            return None;
        }
        state.entries.get(id).cloned()
    }

    pub async fn get(&self, id: &str) -> Option<FindDdoResult> {
        self.state.read().await.entries.get(id).cloned()
    }

    /// Last-write-wins by `lastUpdateTime`. Returns true when the entry changed.
    pub async fn upsert(&self, result: FindDdoResult) -> bool {
        let mut state = self.state.write().await;
        match state.entries.get(&result.id) {
            Some(existing) if !result.is_newer_than(existing) => {
                debug!(id = %result.id, "Cached DDO record is as recent, keeping it");
                false
            }
            _ => {
                state.entries.insert(result.id.clone(), result);
                true
            }
        }
    }

    /// Mark the whole cache as refreshed now.
    pub async fn touch(&self) {
        self.state.write().await.updated = Some(Instant::now());
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(time: &str, provider: &str) -> FindDdoResult {
        FindDdoResult {
            id: "did:op:x".into(),
            last_update_tx: format!("tx-{}", provider),
            last_update_time: time.into(),
            provider: provider.into(),
        }
    }

    #[tokio::test]
    async fn test_last_write_wins_either_order() {
        let older = record("2024-01-01T00:00:00Z", "old");
        let newer = record("2024-06-01T00:00:00Z", "new");

        let a = DdoCache::new(Duration::from_secs(300));
        a.upsert(older.clone()).await;
        a.upsert(newer.clone()).await;

        let b = DdoCache::new(Duration::from_secs(300));
        b.upsert(newer.clone()).await;
        assert!(!b.upsert(older).await);

        assert_eq!(a.get("did:op:x").await.unwrap(), newer);
        assert_eq!(b.get("did:op:x").await.unwrap(), newer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_freshness_window() {
        let cache = DdoCache::new(Duration::from_secs(300));
        cache.upsert(record("2024-01-01T00:00:00Z", "p")).await;
        // Never refreshed yet
        assert!(cache.fresh("did:op:x").await.is_none());

        cache.touch().await;
        assert!(cache.fresh("did:op:x").await.is_some());

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(cache.fresh("did:op:x").await.is_none());
        assert!(cache.get("did:op:x").await.is_some());
    }
}
