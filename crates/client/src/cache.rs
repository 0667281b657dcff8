//! Local Stock Index cache for instant cold start.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockcount_core::StockItem;
use stockcount_infra::{LocalStore, StorageError};

/// Storage key of the cached index.
pub const STOCK_CACHE_KEY: &str = "stockcount.stock_index";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedStock {
    pub cached_at: DateTime<Utc>,
    pub items: Vec<StockItem>,
}

#[derive(Clone)]
pub struct StockCache {
    store: Arc<dyn LocalStore>,
}

impl std::fmt::Debug for StockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StockCache").finish_non_exhaustive()
    }
}

impl StockCache {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Last cached index. A corrupt record is dropped and reported as absent.
    pub async fn load(&self) -> Result<Option<CachedStock>, StorageError> {
        let Some(raw) = self.store.get(STOCK_CACHE_KEY).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<CachedStock>(&raw) {
            Ok(cached) => Ok(Some(cached)),
            Err(err) => {
                tracing::error!(error = %err, "stock cache unreadable; discarding");
                self.store.remove(STOCK_CACHE_KEY).await?;
                Ok(None)
            }
        }
    }

    pub async fn save(&self, items: Vec<StockItem>, now: DateTime<Utc>) -> Result<(), StorageError> {
        let cached = CachedStock {
            cached_at: now,
            items,
        };
        let json =
            serde_json::to_string(&cached).map_err(|e| StorageError::Write(e.to_string()))?;
        self.store.put(STOCK_CACHE_KEY, &json).await
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        self.store.remove(STOCK_CACHE_KEY).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockcount_core::Serial;
    use stockcount_infra::MemoryStore;

    #[tokio::test]
    async fn save_then_load() {
        let cache = StockCache::new(Arc::new(MemoryStore::new()));
        assert!(cache.load().await.unwrap().is_none());

        let items = vec![StockItem::new(Serial::parse("SN1").unwrap(), "Router")];
        let now = Utc::now();
        cache.save(items.clone(), now).await.unwrap();

        let cached = cache.load().await.unwrap().unwrap();
        assert_eq!(cached.items, items);
        assert_eq!(cached.cached_at, now);
    }

    #[tokio::test]
    async fn corrupt_cache_is_discarded() {
        let store = Arc::new(MemoryStore::new());
        store.seed(STOCK_CACHE_KEY, "[oops");
        let cache = StockCache::new(store.clone());

        assert!(cache.load().await.unwrap().is_none());
        assert!(store.get(STOCK_CACHE_KEY).await.unwrap().is_none());
    }
}
