use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;

use super::types::PartitionState;
use crate::membership::types::NodeId;
use crate::txn::locks::LockTable;
use crate::txn::types::TxVersion;

/// A stored key. `value == None` is a tombstone left by a remove.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Option<Value>,
    pub version: TxVersion,
    /// Near nodes holding a read copy of this entry.
    #[serde(default)]
    pub readers: BTreeSet<NodeId>,
}

struct PartitionInner {
    state: PartitionState,
    reservations: usize,
}

/// One partition held by the local node.
pub struct LocalPartition {
    id: u32,
    created_version: u64,
    inner: Mutex<PartitionInner>,
    entries: DashMap<String, CacheEntry>,
    pub locks: LockTable,
    evicted: watch::Sender<bool>,
}

impl LocalPartition {
    pub fn new(id: u32, created_version: u64) -> Self {
        let (evicted, _) = watch::channel(false);
        Self {
            id,
            created_version,
            inner: Mutex::new(PartitionInner {
                state: PartitionState::Moving,
                reservations: 0,
            }),
            entries: DashMap::new(),
            locks: LockTable::new(),
            evicted,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Topology version the partition was created at.
    pub fn created_version(&self) -> u64 {
        self.created_version
    }

    pub fn state(&self) -> PartitionState {
        self.inner.lock().state
    }

    pub fn reservations(&self) -> usize {
        self.inner.lock().reservations
    }

    /// MOVING -> OWNING.
    pub fn own(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == PartitionState::Moving {
            inner.state = PartitionState::Owning;
            true
        } else {
            inner.state == PartitionState::Owning
        }
    }

    /// Starts eviction. The returned receiver flips to `true` once the partition is
    /// EVICTED, which happens as soon as the last reservation is released.
    pub fn rent(&self) -> watch::Receiver<bool> {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_active() {
                tracing::debug!("Renting partition {} (state={:?})", self.id, inner.state);
                inner.state = PartitionState::Renting;
            }
        }
        self.try_evict();
        self.evicted.subscribe()
    }

    pub fn eviction_watch(&self) -> watch::Receiver<bool> {
        self.evicted.subscribe()
    }

    /// Pins the partition so it cannot be evicted. Fails once it is EVICTED.
    pub fn reserve(self: &Arc<Self>) -> Option<PartitionReservation> {
        let mut inner = self.inner.lock();
        if inner.state == PartitionState::Evicted {
            return None;
        }
        inner.reservations += 1;
        Some(PartitionReservation {
            partition: self.clone(),
        })
    }

    fn release(&self) {
        {
            let mut inner = self.inner.lock();
            inner.reservations = inner.reservations.saturating_sub(1);
        }
        self.try_evict();
    }

    fn try_evict(&self) {
        let mut inner = self.inner.lock();
        if inner.state != PartitionState::Renting || inner.reservations > 0 || !self.locks.is_empty() {
            return;
        }

        inner.state = PartitionState::Evicted;
        self.entries.clear();
        self.locks.clear();
        drop(inner);

        tracing::debug!("Evicted partition {}", self.id);
        self.evicted.send_replace(true);
    }

    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Live value of `key`, ignoring tombstones.
    pub fn value(&self, key: &str) -> Option<Value> {
        self.entries.get(key).and_then(|e| e.value.clone())
    }

    /// Version of `key`; `TxVersion::ZERO` if it was never written here.
    pub fn version(&self, key: &str) -> TxVersion {
        self.entries
            .get(key)
            .map(|e| e.version)
            .unwrap_or(TxVersion::ZERO)
    }

    /// Writes `value` at `version` unless a newer version is already stored.
    pub fn apply(&self, key: &str, value: Option<Value>, version: TxVersion) -> bool {
        if self.state() == PartitionState::Evicted {
            return false;
        }

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CacheEntry {
                value: None,
                version: TxVersion::ZERO,
                readers: BTreeSet::new(),
            });

        if version <= entry.version && entry.version != TxVersion::ZERO {
            return false;
        }

        entry.value = value;
        entry.version = version;
        true
    }

    pub fn add_reader(&self, key: &str, reader: NodeId) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.readers.insert(reader);
        }
    }

    pub fn remove_reader(&self, key: &str, reader: &NodeId) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.readers.remove(reader);
        }
    }

    pub fn readers(&self, key: &str) -> BTreeSet<NodeId> {
        self.entries
            .get(key)
            .map(|e| e.readers.clone())
            .unwrap_or_default()
    }

    /// Entries to ship to a node preloading this partition.
    pub fn snapshot(&self) -> Vec<(String, CacheEntry)> {
        self.entries
            .iter()
            .map(|e| {
                let mut entry = e.value().clone();
                entry.readers.clear();
                (e.key().clone(), entry)
            })
            .collect()
    }

    /// Number of keys holding a live value.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps a partition from being evicted while held.
pub struct PartitionReservation {
    partition: Arc<LocalPartition>,
}

impl PartitionReservation {
    pub fn partition(&self) -> &Arc<LocalPartition> {
        &self.partition
    }
}

impl Drop for PartitionReservation {
    fn drop(&mut self) {
        self.partition.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn v(n: u64) -> TxVersion {
        TxVersion::new(1, n, 1)
    }

    #[test]
    fn test_new_partition_is_moving_then_owned() {
        let part = LocalPartition::new(3, 1);

        assert_eq!(part.state(), PartitionState::Moving);
        assert!(part.own());
        assert_eq!(part.state(), PartitionState::Owning);
    }

    #[test]
    fn test_apply_keeps_newest_version() {
        let part = LocalPartition::new(0, 1);

        assert!(part.apply("k", Some(json!(1)), v(2)));
        assert!(!part.apply("k", Some(json!(0)), v(1)), "older write is ignored");
        assert!(part.apply("k", None, v(3)));

        assert_eq!(part.value("k"), None);
        assert_eq!(part.version("k"), v(3), "tombstone keeps its version");
        assert_eq!(part.version("missing"), TxVersion::ZERO);
    }

    #[test]
    fn test_rent_without_reservations_evicts_immediately() {
        let part = LocalPartition::new(0, 1);
        part.own();
        part.apply("k", Some(json!("x")), v(1));

        let evicted = part.rent();

        assert_eq!(part.state(), PartitionState::Evicted);
        assert!(*evicted.borrow());
        assert!(part.is_empty());
    }

    #[tokio::test]
    async fn test_rent_waits_for_reservations() {
        let part = Arc::new(LocalPartition::new(0, 1));
        part.own();

        let reservation = part.reserve().unwrap();
        let mut evicted = part.rent();
        assert_eq!(part.state(), PartitionState::Renting);

        let waiter = tokio::spawn(async move {
            evicted.wait_for(|done| *done).await.map(|_| ())
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(reservation);

        waiter.await.unwrap().unwrap();
        assert_eq!(part.state(), PartitionState::Evicted);
        assert!(part.reserve().is_none());
    }

    #[test]
    fn test_readers_tracked_per_entry() {
        let part = LocalPartition::new(0, 1);
        part.apply("k", Some(json!(1)), v(1));

        part.add_reader("k", NodeId::from("near"));
        assert!(part.readers("k").contains(&NodeId::from("near")));
        assert!(part.snapshot()[0].1.readers.is_empty(), "readers are not shipped");

        part.remove_reader("k", &NodeId::from("near"));
        assert!(part.readers("k").is_empty());
    }
}
