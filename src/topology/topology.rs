use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

use super::partition::{LocalPartition, PartitionReservation};
use super::types::{ExchangeId, FullPartitionMap, PartitionMap, PartitionState};
use crate::affinity::assignment::AffinityCache;
use crate::affinity::snapshot::DiscoveryCache;
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::membership::types::NodeId;

#[derive(Default)]
struct TopologyState {
    top_ver: u64,
    node2part: Option<FullPartitionMap>,
    part2node: HashMap<u32, HashSet<NodeId>>,
    last_exchange_id: Option<ExchangeId>,
}

/// Local view of which node holds which partition in which state.
///
/// `node2part` and its reverse index `part2node` live behind one reader/writer lock.
/// Queries take the read side; exchanges, map merges and eviction bookkeeping take
/// the write side. Only the oldest node authors the full map; everyone else merges
/// what it broadcasts.
pub struct PartitionTopology {
    me: Weak<PartitionTopology>,
    config: Arc<CacheConfig>,
    discovery: Arc<DiscoveryCache>,
    affinity: Arc<AffinityCache>,
    state: RwLock<TopologyState>,
    local_parts: DashMap<u32, Arc<LocalPartition>>,
    update_seq: AtomicU64,
    local_changed: Notify,
}

impl PartitionTopology {
    pub fn new(
        config: Arc<CacheConfig>,
        discovery: Arc<DiscoveryCache>,
        affinity: Arc<AffinityCache>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            discovery,
            affinity,
            state: RwLock::new(TopologyState::default()),
            local_parts: DashMap::new(),
            update_seq: AtomicU64::new(0),
            local_changed: Notify::new(),
        })
    }

    fn local_id(&self) -> &NodeId {
        self.discovery.local_id()
    }

    pub fn topology_version(&self) -> u64 {
        self.state.read().top_ver
    }

    pub fn update_topology_version(&self, exch_id: &ExchangeId) {
        let mut st = self.state.write();
        if exch_id.topology_version > st.top_ver {
            st.top_ver = exch_id.topology_version;
        } else {
            tracing::warn!(
                "Ignoring non-increasing topology version {} (current {})",
                exch_id.topology_version,
                st.top_ver
            );
        }
    }

    pub fn update_sequence(&self) -> u64 {
        self.update_seq.load(Ordering::SeqCst)
    }

    pub fn last_exchange_id(&self) -> Option<ExchangeId> {
        self.state.read().last_exchange_id.clone()
    }

    /// Signalled whenever local partition state changes outside an exchange.
    pub fn local_changes(&self) -> &Notify {
        &self.local_changed
    }

    fn next_seq(&self, st: &TopologyState) -> u64 {
        if let Some(map) = &st.node2part {
            self.update_seq.fetch_max(map.update_seq, Ordering::SeqCst);
        }
        self.update_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    // ============================================================
    // LOCAL PARTITIONS
    // ============================================================

    /// Local partition `p`.
    ///
    /// EVICTED partitions are discarded. With `create`, a missing partition is
    /// allocated MOVING, but only if affinity still assigns it here at `top_ver`.
    pub fn local_partition(
        &self,
        p: u32,
        top_ver: u64,
        create: bool,
    ) -> CacheResult<Option<Arc<LocalPartition>>> {
        loop {
            let existing = self.local_parts.get(&p).map(|e| e.value().clone());

            if let Some(part) = &existing
                && part.state() == PartitionState::Evicted
            {
                self.local_parts.remove_if(&p, |_, v| Arc::ptr_eq(v, part));
                if !create {
                    return Ok(None);
                }
                if !self.affinity.is_local(p, top_ver) {
                    return Err(CacheError::InvalidPartition {
                        partition: p,
                        reason: format!("adding entry to evicted partition at version {}", top_ver),
                    });
                }
                continue;
            }

            if existing.is_none() && create {
                if !self.affinity.is_local(p, top_ver) {
                    return Err(CacheError::InvalidPartition {
                        partition: p,
                        reason: format!("partition does not belong to local node at version {}", top_ver),
                    });
                }

                let part = self
                    .local_parts
                    .entry(p)
                    .or_insert_with(|| {
                        tracing::debug!("Created local partition {} at version {}", p, top_ver);
                        Arc::new(LocalPartition::new(p, top_ver))
                    })
                    .clone();
                return Ok(Some(part));
            }

            return Ok(existing);
        }
    }

    pub fn local_partitions(&self) -> Vec<Arc<LocalPartition>> {
        let mut parts: Vec<_> = self.local_parts.iter().map(|e| e.value().clone()).collect();
        parts.sort_by_key(|p| p.id());
        parts
    }

    /// Reserves local partition `p` for reading or writing at `top_ver`.
    pub fn reserve(&self, p: u32, top_ver: u64, create: bool) -> CacheResult<PartitionReservation> {
        let invalid = |reason: &str| CacheError::InvalidPartition {
            partition: p,
            reason: reason.to_string(),
        };

        let part = self
            .local_partition(p, top_ver, create)?
            .ok_or_else(|| invalid("partition is not present locally"))?;

        if !part.state().is_active() {
            return Err(invalid("partition is being evicted"));
        }

        part.reserve().ok_or_else(|| invalid("partition was evicted"))
    }

    pub fn local_partition_map(&self) -> PartitionMap {
        let mut map = PartitionMap::new(self.local_id().clone(), self.update_sequence());
        for entry in self.local_parts.iter() {
            map.states.insert(*entry.key(), entry.value().state());
        }
        map
    }

    pub fn full_map(&self) -> Option<FullPartitionMap> {
        self.state.read().node2part.clone()
    }

    pub fn partitions_of(&self, node: &NodeId) -> Option<PartitionMap> {
        self.state
            .read()
            .node2part
            .as_ref()
            .and_then(|m| m.maps.get(node).cloned())
    }

    // ============================================================
    // EXCHANGE
    // ============================================================

    pub async fn before_exchange(&self, exch_id: &ExchangeId) {
        self.wait_for_rent().await;

        {
            let mut st = self.state.write();
            let top_ver = st.top_ver;
            if top_ver != exch_id.topology_version {
                tracing::warn!(
                    "beforeExchange for {} while topology is at version {}",
                    exch_id,
                    top_ver
                );
            }

            if !exch_id.is_joined() {
                self.remove_node(&mut st, &exch_id.node);
            }

            let local = self.discovery.local().clone();
            let oldest = self.discovery.oldest(top_ver);
            let is_oldest = oldest.as_ref().is_some_and(|n| n.id == local.id);
            let seq = self.next_seq(&st);

            if is_oldest {
                let replacement = match &st.node2part {
                    None => {
                        tracing::debug!("Created brand new full map on oldest node {}", exch_id);
                        Some(FullPartitionMap::new(local.id.clone(), local.order, seq))
                    }
                    Some(map) if !map.is_valid() || map.author.as_ref() != Some(&local.id) => {
                        tracing::info!("Taking over the full partition map as the oldest node {}", exch_id);
                        Some(FullPartitionMap::copy_from(local.id.clone(), local.order, seq, map))
                    }
                    Some(_) => None,
                };
                if let Some(map) = replacement {
                    st.node2part = Some(map);
                }
            }

            let first_node = is_oldest && exch_id.node == local.id;
            let map_valid = st.node2part.as_ref().is_some_and(|m| m.is_valid());

            for p in 0..self.affinity.partitions() {
                let belongs = self.affinity.is_local(p, top_ver);

                if !self.config.preload_enabled {
                    match self.local_partition(p, top_ver, false) {
                        Ok(Some(part)) if !belongs && part.state().is_active() => {
                            tracing::debug!("Evicting partition {} with preloading disabled", p);
                            self.rent_partition(&mut st, &part, seq);
                        }
                        Ok(None) if belongs => {
                            let _ = self.local_partition(p, top_ver, true);
                        }
                        _ => {}
                    }
                    continue;
                }

                if first_node {
                    match self.local_partition(p, top_ver, true) {
                        Ok(Some(part)) => {
                            part.own();
                            self.update_local(&mut st, p, part.state(), seq);
                        }
                        Ok(None) => {}
                        Err(e) => tracing::debug!("Ignoring invalid partition on oldest node: {}", e),
                    }
                } else if belongs {
                    match self.local_partition(p, top_ver, true) {
                        Ok(Some(part)) if map_valid => self.update_local(&mut st, p, part.state(), seq),
                        Ok(_) => {}
                        Err(e) => tracing::debug!("Ignoring invalid partition: {}", e),
                    }
                }
            }

            if map_valid {
                self.check_evictions(&mut st, seq);
            }

            self.consistency_check(&st);
        }

        self.wait_for_rent().await;
    }

    /// Returns whether local partition state changed.
    pub async fn after_exchange(&self, exch_id: &ExchangeId) -> bool {
        let mut changed = self.wait_for_rent().await;

        let mut st = self.state.write();
        let top_ver = exch_id.topology_version;
        let seq = self.next_seq(&st);

        for p in 0..self.affinity.partitions() {
            let part = match self.local_partition(p, top_ver, false) {
                Ok(Some(part)) => part,
                _ => continue,
            };

            if part.state() != PartitionState::Moving {
                continue;
            }

            if self.affinity.is_local(p, top_ver) {
                let owners = self.nodes_with_state(&st, p, None, &[PartitionState::Owning]);
                let others: Vec<_> = owners.iter().filter(|n| *n != self.local_id()).collect();

                if !self.config.preload_enabled || others.is_empty() {
                    part.own();
                    self.update_local(&mut st, p, part.state(), seq);
                    changed = true;
                    tracing::debug!("Owned partition {} after exchange {}", p, exch_id);
                } else {
                    tracing::debug!("Partition {} will preload from {} owner(s)", p, others.len());
                }
            } else {
                tracing::debug!("Evicting moving partition {} (no longer assigned)", p);
                self.rent_partition(&mut st, &part, seq);
                changed = true;
            }
        }

        self.consistency_check(&st);
        changed
    }

    /// Waits until every RENTING partition is EVICTED and drops it from the registry.
    async fn wait_for_rent(&self) -> bool {
        let mut changed = false;

        for part in self.local_partitions() {
            let state = part.state();
            if state != PartitionState::Renting && state != PartitionState::Evicted {
                continue;
            }

            tracing::debug!("Waiting for renting partition {}", part.id());
            let mut evicted = part.rent();
            if evicted.wait_for(|done| *done).await.is_err() {
                continue;
            }

            self.on_evicted(&part);
            changed = true;
        }

        changed
    }

    // ============================================================
    // MAP UPDATES
    // ============================================================

    /// Merges a full map from the oldest node. Returns the local map if local
    /// ownership changed as a result.
    pub fn update_full(
        &self,
        exch_id: Option<&ExchangeId>,
        mut map: FullPartitionMap,
    ) -> Option<PartitionMap> {
        let mut st = self.state.write();

        if let (Some(exch_id), Some(last)) = (exch_id, &st.last_exchange_id)
            && last >= exch_id
        {
            tracing::debug!("Stale exchange id for full map update {} (last {})", exch_id, last);
            return None;
        }

        if let Some(cur) = &st.node2part
            && cur.compare(&map) != std::cmp::Ordering::Less
        {
            tracing::debug!(
                "Stale full map (cur seq={}, new seq={})",
                cur.update_seq,
                map.update_seq
            );
            return None;
        }

        let seq = self.next_seq(&st);

        if let Some(exch_id) = exch_id {
            st.last_exchange_id = Some(exch_id.clone());
        }

        if let Some(cur) = &st.node2part {
            for (node, part) in &cur.maps {
                if let Some(incoming) = map.maps.get(node)
                    && incoming.update_seq < part.update_seq
                {
                    map.maps.insert(node.clone(), part.clone());
                }
            }

            map.maps.retain(|node, _| {
                let alive = self.discovery.alive(node);
                if !alive {
                    tracing::debug!("Removing departed node {} from full map update", node);
                }
                alive
            });
        }

        self.update_seq.fetch_max(map.update_seq, Ordering::SeqCst);
        st.part2node = reverse_index(&map.maps);
        st.node2part = Some(map);

        let changed = self.check_evictions(&mut st, seq);
        self.consistency_check(&st);

        changed.then(|| self.local_partition_map())
    }

    /// Merges one node's map. Returns the local map if anything changed.
    pub fn update_single(
        &self,
        exch_id: Option<&ExchangeId>,
        parts: PartitionMap,
    ) -> Option<PartitionMap> {
        if !self.discovery.alive(&parts.node) {
            tracing::debug!("Ignoring partition update from departed node {}", parts.node);
            return None;
        }

        let mut st = self.state.write();

        if let (Some(exch_id), Some(last)) = (exch_id, &st.last_exchange_id)
            && last > exch_id
        {
            tracing::debug!("Stale exchange id for single map update {} (last {})", exch_id, last);
            return None;
        }

        if let Some(exch_id) = exch_id {
            st.last_exchange_id = Some(exch_id.clone());
        }

        let cur = st
            .node2part
            .as_ref()
            .and_then(|m| m.maps.get(&parts.node).cloned());

        if let Some(cur) = &cur
            && cur.update_seq >= parts.update_seq
        {
            tracing::debug!(
                "Stale update sequence from {} (cur={}, new={})",
                parts.node,
                cur.update_seq,
                parts.update_seq
            );
            return None;
        }

        let seq = self.next_seq(&st);
        let node2part = st.node2part.get_or_insert_with(FullPartitionMap::default);
        node2part.update_seq = node2part.update_seq.max(seq);
        node2part.maps.insert(parts.node.clone(), parts.clone());

        let mut changed = cur.as_ref() != Some(&parts);

        for p in parts.states.keys() {
            changed |= st.part2node.entry(*p).or_default().insert(parts.node.clone());
        }

        if let Some(cur) = &cur {
            for p in cur.states.keys().filter(|p| !parts.states.contains_key(p)) {
                if let Some(ids) = st.part2node.get_mut(p) {
                    changed |= ids.remove(&parts.node);
                    if ids.is_empty() {
                        st.part2node.remove(p);
                    }
                }
            }
        }

        changed |= self.check_evictions(&mut st, seq);
        self.consistency_check(&st);

        changed.then(|| self.local_partition_map())
    }

    /// Rents local partitions that affinity no longer needs here.
    ///
    /// A partition is released once every affinity node owns it. While some affinity
    /// nodes are still preloading, surplus copies are trimmed newest holder first.
    fn check_evictions(&self, st: &mut TopologyState, seq: u64) -> bool {
        let mut changed = false;
        let local = self.local_id().clone();
        let top_ver = st.top_ver;

        for part in self.local_partitions() {
            if !part.state().is_active() {
                continue;
            }

            let p = part.id();
            let aff = self.affinity.nodes(p, top_ver);
            if aff.contains(&local) {
                continue;
            }

            let owners = self.nodes_with_state(st, p, Some(top_ver), &[PartitionState::Owning]);

            if aff.iter().all(|n| owners.contains(n)) {
                tracing::debug!("Evicting partition {} (all affinity nodes own it)", p);
                self.rent_partition(st, &part, seq);
                changed = true;
            } else if owners.len() > aff.len() {
                let mut surplus: Vec<&NodeId> = owners.iter().filter(|n| !aff.contains(n)).collect();
                surplus.sort_by(|a, b| self.discovery.order(b).cmp(&self.discovery.order(a)));

                let diff = owners.len() - aff.len();
                if surplus.iter().take(diff).any(|n| **n == local) {
                    tracing::debug!("Evicting partition {} (newest surplus holder)", p);
                    self.rent_partition(st, &part, seq);
                    changed = true;
                }
            }
        }

        changed
    }

    fn rent_partition(&self, st: &mut TopologyState, part: &Arc<LocalPartition>, seq: u64) {
        let _ = part.rent();
        self.update_local(st, part.id(), part.state(), seq);

        if part.state() == PartitionState::Renting {
            self.watch_eviction(part.clone());
        }
    }

    fn watch_eviction(&self, part: Arc<LocalPartition>) {
        let Some(me) = self.me.upgrade() else { return };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        handle.spawn(async move {
            let mut evicted = part.eviction_watch();
            if evicted.wait_for(|done| *done).await.is_ok() {
                me.on_evicted(&part);
                me.local_changed.notify_one();
            }
        });
    }

    fn update_local(&self, st: &mut TopologyState, p: u32, state: PartitionState, seq: u64) {
        let local = self.local_id().clone();
        let is_oldest = self.discovery.is_oldest(st.top_ver);

        let node2part = st.node2part.get_or_insert_with(FullPartitionMap::default);
        if is_oldest {
            node2part.update_seq = node2part.update_seq.max(seq);
        }

        let map = node2part
            .maps
            .entry(local.clone())
            .or_insert_with(|| PartitionMap::new(local.clone(), seq));
        map.update_seq = map.update_seq.max(seq);
        map.states.insert(p, state);

        st.part2node.entry(p).or_default().insert(local);
    }

    fn remove_node(&self, st: &mut TopologyState, node: &NodeId) {
        let local = self.discovery.local().clone();
        let is_oldest = self.discovery.is_oldest(st.top_ver);

        let Some(current) = st.node2part.take() else {
            return;
        };

        let mut node2part = if is_oldest && current.author.as_ref() != Some(&local.id) {
            self.update_seq.fetch_max(current.update_seq, Ordering::SeqCst);
            let seq = self.update_seq.fetch_add(1, Ordering::SeqCst) + 1;
            FullPartitionMap::copy_from(local.id.clone(), local.order, seq, &current)
        } else {
            current
        };

        if let Some(parts) = node2part.maps.remove(node) {
            for p in parts.states.keys() {
                if let Some(ids) = st.part2node.get_mut(p) {
                    ids.remove(node);
                    if ids.is_empty() {
                        st.part2node.remove(p);
                    }
                }
            }
        }

        st.node2part = Some(node2part);
        self.consistency_check(st);
    }

    /// MOVING -> OWNING for a preloaded partition.
    pub fn own(&self, part: &LocalPartition) -> bool {
        let mut st = self.state.write();
        let owned = part.own();
        if owned {
            let seq = self.next_seq(&st);
            self.update_local(&mut st, part.id(), part.state(), seq);
        }
        self.consistency_check(&st);
        owned
    }

    pub fn on_evicted(&self, part: &Arc<LocalPartition>) {
        let mut st = self.state.write();
        if part.state() != PartitionState::Evicted {
            return;
        }

        let seq = self.next_seq(&st);
        self.update_local(&mut st, part.id(), PartitionState::Evicted, seq);
        self.local_parts
            .remove_if(&part.id(), |_, v| Arc::ptr_eq(v, part));
        self.consistency_check(&st);
    }

    // ============================================================
    // QUERIES
    // ============================================================

    fn nodes_with_state(
        &self,
        st: &TopologyState,
        p: u32,
        top_ver: Option<u64>,
        states: &[PartitionState],
    ) -> Vec<NodeId> {
        let Some(node2part) = &st.node2part else {
            return Vec::new();
        };
        let Some(ids) = st.part2node.get(&p) else {
            return Vec::new();
        };

        let snapshot = top_ver.and_then(|v| self.discovery.snapshot(v));

        let mut nodes: Vec<NodeId> = ids
            .iter()
            .filter(|id| snapshot.as_ref().is_none_or(|s| s.contains(id)))
            .filter(|id| {
                node2part
                    .state(id, p)
                    .is_some_and(|state| states.contains(&state))
            })
            .cloned()
            .collect();

        nodes.sort_by_key(|id| self.discovery.order(id));
        nodes
    }

    /// Nodes holding `p` in OWNING state (OWNING or MOVING with preloading off).
    pub fn owners(&self, p: u32, top_ver: Option<u64>) -> Vec<NodeId> {
        let st = self.state.read();
        if self.config.preload_enabled {
            self.nodes_with_state(&st, p, top_ver, &[PartitionState::Owning])
        } else {
            self.nodes_with_state(&st, p, top_ver, &[PartitionState::Owning, PartitionState::Moving])
        }
    }

    pub fn moving(&self, p: u32) -> Vec<NodeId> {
        let st = self.state.read();
        if self.config.preload_enabled {
            self.nodes_with_state(&st, p, None, &[PartitionState::Moving])
        } else {
            self.nodes_with_state(&st, p, None, &[PartitionState::Owning, PartitionState::Moving])
        }
    }

    /// Affinity nodes for `p` plus any other node still holding a copy.
    pub fn nodes(&self, p: u32, top_ver: u64) -> Vec<NodeId> {
        let mut nodes = self.affinity.nodes(p, top_ver);
        let st = self.state.read();

        let extra = self.nodes_with_state(
            &st,
            p,
            Some(top_ver),
            &[PartitionState::Owning, PartitionState::Moving, PartitionState::Renting],
        );

        for id in extra {
            if !nodes.contains(&id) {
                nodes.push(id);
            }
        }
        nodes
    }

    // ============================================================
    // CONSISTENCY
    // ============================================================

    fn consistency_check(&self, st: &TopologyState) {
        if !self.config.consistency_check {
            return;
        }
        if let Err(msg) = check_symmetry(st) {
            tracing::error!("Partition map consistency check failed: {}", msg);
            debug_assert!(false, "partition map consistency check failed: {}", msg);
        }
    }

    /// Verifies that `node2part` and `part2node` agree in both directions.
    pub fn verify_consistency(&self) -> Result<(), String> {
        check_symmetry(&self.state.read())
    }
}

fn reverse_index(maps: &BTreeMap<NodeId, PartitionMap>) -> HashMap<u32, HashSet<NodeId>> {
    let mut p2n: HashMap<u32, HashSet<NodeId>> = HashMap::new();
    for (node, map) in maps {
        for p in map.states.keys() {
            p2n.entry(*p).or_default().insert(node.clone());
        }
    }
    p2n
}

fn check_symmetry(st: &TopologyState) -> Result<(), String> {
    let Some(node2part) = &st.node2part else {
        return Ok(());
    };

    for (node, map) in &node2part.maps {
        for p in map.states.keys() {
            if !st.part2node.get(p).is_some_and(|ids| ids.contains(node)) {
                return Err(format!("part2node[{}] is missing node {}", p, node));
            }
        }
    }

    for (p, ids) in &st.part2node {
        for node in ids {
            if !node2part
                .maps
                .get(node)
                .is_some_and(|m| m.states.contains_key(p))
            {
                return Err(format!("node2part[{}] is missing partition {}", node, p));
            }
        }
    }

    Ok(())
}
