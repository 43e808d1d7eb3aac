use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{CacheError, CacheResult};

/// Persistent store behind the cache. Called by the primary of a key only.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    async fn load(&self, key: &str) -> CacheResult<Option<Value>>;

    async fn put_all(&self, entries: &[(String, Value)]) -> CacheResult<()>;

    async fn remove_all(&self, keys: &[String]) -> CacheResult<()>;
}

/// Map-backed store. Writes can be made to fail for exercising heuristic outcomes.
#[derive(Default)]
pub struct InMemoryStore {
    data: DashMap<String, Value>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.get(key).map(|v| v.value().clone())
    }

    pub fn insert(&self, key: &str, value: Value) {
        self.data.insert(key.to_string(), value);
    }

    /// Number of entries written or removed through `put_all`/`remove_all`.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> CacheResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::Store("store is not writable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for InMemoryStore {
    async fn load(&self, key: &str) -> CacheResult<Option<Value>> {
        Ok(self.get(key))
    }

    async fn put_all(&self, entries: &[(String, Value)]) -> CacheResult<()> {
        self.check_writable()?;
        for (key, value) in entries {
            self.data.insert(key.clone(), value.clone());
        }
        self.writes.fetch_add(entries.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn remove_all(&self, keys: &[String]) -> CacheResult<()> {
        self.check_writable()?;
        for key in keys {
            self.data.remove(key);
        }
        self.writes.fetch_add(keys.len(), Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_and_remove() {
        let store = InMemoryStore::new();

        store
            .put_all(&[("a".into(), json!(1)), ("b".into(), json!(2))])
            .await
            .unwrap();
        store.remove_all(&["a".into()]).await.unwrap();

        assert_eq!(store.load("a").await.unwrap(), None);
        assert_eq!(store.load("b").await.unwrap(), Some(json!(2)));
        assert_eq!(store.write_count(), 3);
    }

    #[tokio::test]
    async fn test_failing_writes_leave_data_untouched() {
        let store = InMemoryStore::new();
        store.insert("a", json!(1));
        store.set_fail_writes(true);

        let err = store.put_all(&[("a".into(), json!(2))]).await.unwrap_err();

        assert!(matches!(err, CacheError::Store(_)));
        assert_eq!(store.get("a"), Some(json!(1)));
    }
}
