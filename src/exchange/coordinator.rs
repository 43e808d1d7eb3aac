use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::preloader::Preloader;
use crate::affinity::snapshot::TopologySnapshot;
use crate::membership::discovery::DiscoveryEvent;
use crate::membership::types::NodeId;
use crate::messaging::protocol::{CacheMessage, PartitionsFullMessage, PartitionsSingleMessage};
use crate::node::context::CacheContext;
use crate::topology::types::{ExchangeId, FullPartitionMap, PartitionMap};

/// Messages collected for one exchange.
#[derive(Default)]
struct ExchangeState {
    singles: Mutex<BTreeMap<NodeId, PartitionMap>>,
    full: Mutex<Option<FullPartitionMap>>,
    notify: Notify,
}

/// Serializes topology transitions.
///
/// Discovery events are queued and processed one at a time by a single worker. For
/// each event the worker runs `before_exchange`, trades partition maps with the
/// oldest node, runs `after_exchange` and only then releases the version barrier
/// that gates transaction admission.
pub struct ExchangeCoordinator {
    ctx: Arc<CacheContext>,
    preloader: Arc<Preloader>,
    exchanges: DashMap<u64, Arc<ExchangeState>>,
    queue: mpsc::UnboundedSender<DiscoveryEvent>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<DiscoveryEvent>>>,
}

impl ExchangeCoordinator {
    pub fn new(ctx: Arc<CacheContext>, preloader: Arc<Preloader>) -> Arc<Self> {
        let (queue, queue_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            ctx,
            preloader,
            exchanges: DashMap::new(),
            queue,
            queue_rx: Mutex::new(Some(queue_rx)),
        })
    }

    /// Spawns the exchange worker and the partition-map sync loop.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if let Some(mut rx) = self.queue_rx.lock().take() {
            let me = self.clone();
            handles.push(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    me.process(event).await;
                }
            }));
        }

        let me = self.clone();
        handles.push(tokio::spawn(async move {
            loop {
                me.ctx.topology.local_changes().notified().await;
                me.sync_local().await;
            }
        }));

        handles
    }

    /// Records the new topology and queues its exchange.
    pub fn on_discovery_event(&self, event: DiscoveryEvent) {
        let version = event.topology_version;
        self.ctx
            .discovery
            .install(TopologySnapshot::new(version, event.topology.clone()));

        if event.is_departure() {
            self.ctx.discovery.mark_departed(&event.node.id, version);
            // Exchanges waiting on the departed node must re-check.
            for state in self.exchanges.iter() {
                state.notify.notify_one();
            }
        }

        if self.queue.send(event).is_err() {
            tracing::error!("Exchange worker is gone; dropping topology version {}", version);
        }
    }

    fn state(&self, version: u64) -> Arc<ExchangeState> {
        self.exchanges.entry(version).or_default().clone()
    }

    async fn process(&self, event: DiscoveryEvent) {
        let version = event.topology_version;
        let id = ExchangeId {
            topology_version: version,
            node: event.node.id.clone(),
            kind: event.kind,
        };
        tracing::info!("Starting exchange {}", id);

        let topology = &self.ctx.topology;
        topology.update_topology_version(&id);
        topology.before_exchange(&id).await;

        let state = self.state(version);
        match self.ctx.discovery.snapshot(version) {
            Some(snapshot) => self.exchange_maps(&id, &state, &snapshot).await,
            None => tracing::warn!("No topology snapshot for exchange {}", id),
        }

        let changed = topology.after_exchange(&id).await;
        self.ctx.barrier.complete(version);

        // Readers are not carried across a primary change; drop read copies.
        self.ctx.near_cache.clear();

        if let Some(late) = state.full.lock().take() {
            topology.update_full(Some(&id), late);
        }
        self.exchanges.retain(|v, _| *v > version);

        self.preloader.start(version);
        if changed {
            topology.local_changes().notify_one();
        }

        tracing::info!(
            "Finished exchange {} ({} local partitions)",
            id,
            topology.local_partitions().len()
        );
    }

    async fn exchange_maps(&self, id: &ExchangeId, state: &ExchangeState, snapshot: &TopologySnapshot) {
        let local = self.ctx.local_id().clone();
        let Some(oldest) = snapshot.oldest().map(|n| n.id.clone()) else {
            return;
        };

        if oldest == local {
            self.collect_singles(id, state, snapshot).await;

            let singles = std::mem::take(&mut *state.singles.lock());
            for (_, map) in singles {
                self.ctx.topology.update_single(Some(id), map);
            }

            if let Some(full) = self.ctx.topology.full_map() {
                self.broadcast_full(Some(id.clone()), full, snapshot).await;
            }
            return;
        }

        let single = CacheMessage::PartitionsSingle(PartitionsSingleMessage {
            exchange_id: Some(id.clone()),
            map: self.ctx.topology.local_partition_map(),
        });
        if let Err(e) = self.ctx.send(&oldest, single).await {
            tracing::warn!("Failed to send partition map to oldest node {}: {}", oldest, e);
        }

        match self.await_full(id, state, &oldest).await {
            Some(full) => {
                self.ctx.topology.update_full(Some(id), full);
            }
            None => tracing::warn!("Exchange {} finished without a full map", id),
        }
    }

    async fn collect_singles(&self, id: &ExchangeId, state: &ExchangeState, snapshot: &TopologySnapshot) {
        let deadline = Instant::now() + self.ctx.config.exchange_timeout;
        let local = self.ctx.local_id();

        loop {
            let missing: Vec<NodeId> = {
                let singles = state.singles.lock();
                snapshot
                    .nodes
                    .iter()
                    .map(|n| &n.id)
                    .filter(|n| *n != local)
                    .filter(|n| !self.ctx.discovery.has_departed(n))
                    .filter(|n| !singles.contains_key(*n))
                    .cloned()
                    .collect()
            };

            if missing.is_empty() {
                return;
            }

            if tokio::time::timeout_at(deadline, state.notify.notified())
                .await
                .is_err()
            {
                tracing::warn!(
                    "Exchange {} timed out waiting for partition maps from {:?}",
                    id,
                    missing.iter().map(|n| n.to_string()).collect::<Vec<_>>()
                );
                return;
            }
        }
    }

    async fn await_full(
        &self,
        id: &ExchangeId,
        state: &ExchangeState,
        oldest: &NodeId,
    ) -> Option<FullPartitionMap> {
        let deadline = Instant::now() + self.ctx.config.exchange_timeout;

        loop {
            if let Some(full) = state.full.lock().take() {
                return Some(full);
            }

            if self.ctx.discovery.has_departed(oldest) {
                tracing::warn!("Oldest node {} left during exchange {}", oldest, id);
                return None;
            }

            if tokio::time::timeout_at(deadline, state.notify.notified())
                .await
                .is_err()
            {
                tracing::warn!("Exchange {} timed out waiting for the full map", id);
                return None;
            }
        }
    }

    async fn broadcast_full(
        &self,
        exchange_id: Option<ExchangeId>,
        full: FullPartitionMap,
        snapshot: &TopologySnapshot,
    ) {
        let local = self.ctx.local_id();
        let (exchange_id, full) = (&exchange_id, &full);

        let sends = snapshot
            .nodes
            .iter()
            .filter(|node| &node.id != local && !self.ctx.discovery.has_departed(&node.id))
            .map(|node| async move {
                let message = CacheMessage::PartitionsFull(PartitionsFullMessage {
                    exchange_id: exchange_id.clone(),
                    map: full.clone(),
                });
                if let Err(e) = self.ctx.send(&node.id, message).await {
                    tracing::warn!("Failed to send full partition map to {}: {}", node.id, e);
                }
            });
        join_all(sends).await;
    }

    /// Pushes local partition changes made outside an exchange.
    async fn sync_local(&self) {
        let version = self.ctx.topology.topology_version();
        let Some(snapshot) = self.ctx.discovery.snapshot(version) else {
            return;
        };
        let Some(oldest) = snapshot.oldest().map(|n| n.id.clone()) else {
            return;
        };

        if &oldest == self.ctx.local_id() {
            if let Some(full) = self.ctx.topology.full_map() {
                tracing::debug!("Broadcasting full partition map (seq={})", full.update_seq);
                self.broadcast_full(None, full, &snapshot).await;
            }
        } else if !self.ctx.discovery.has_departed(&oldest) {
            let single = CacheMessage::PartitionsSingle(PartitionsSingleMessage {
                exchange_id: None,
                map: self.ctx.topology.local_partition_map(),
            });
            if let Err(e) = self.ctx.send(&oldest, single).await {
                tracing::warn!("Failed to send partition map to oldest node {}: {}", oldest, e);
            }
        }
    }

    pub fn on_single(&self, from: &NodeId, msg: PartitionsSingleMessage) {
        if &msg.map.node != from {
            tracing::warn!("Ignoring partition map for {} sent by {}", msg.map.node, from);
            return;
        }

        if let Some(id) = &msg.exchange_id
            && id.topology_version > self.ctx.barrier.ready_version()
        {
            let state = self.state(id.topology_version);
            state.singles.lock().insert(from.clone(), msg.map);
            state.notify.notify_one();
            return;
        }

        let version = self.ctx.topology.topology_version();
        if !self.ctx.discovery.is_oldest(version) {
            tracing::debug!("Ignoring partition map from {} (not the oldest node)", from);
            return;
        }

        if self
            .ctx
            .topology
            .update_single(msg.exchange_id.as_ref(), msg.map)
            .is_some()
        {
            self.ctx.topology.local_changes().notify_one();
        }
    }

    pub fn on_full(&self, from: &NodeId, msg: PartitionsFullMessage) {
        if let Some(id) = &msg.exchange_id
            && id.topology_version > self.ctx.barrier.ready_version()
        {
            let state = self.state(id.topology_version);
            let mut full = state.full.lock();
            let newer = full
                .as_ref()
                .is_none_or(|cur| cur.compare(&msg.map) == std::cmp::Ordering::Less);
            if newer {
                *full = Some(msg.map);
            }
            drop(full);
            state.notify.notify_one();
            return;
        }

        tracing::debug!("Full partition map from {} (seq={})", from, msg.map.update_seq);
        if self
            .ctx
            .topology
            .update_full(msg.exchange_id.as_ref(), msg.map)
            .is_some()
        {
            self.ctx.topology.local_changes().notify_one();
        }
    }
}
