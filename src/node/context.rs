use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::affinity::assignment::{AffinityCache, Assignment};
use crate::affinity::partitioner::AffinityFunction;
use crate::affinity::snapshot::DiscoveryCache;
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::exchange::future::TopologyBarrier;
use crate::membership::types::{ClusterNode, NodeId};
use crate::messaging::futures::MiniFutures;
use crate::messaging::protocol::{
    AffinityAssignmentRequest, AffinityAssignmentResponse, CacheMessage, Envelope,
};
use crate::messaging::transport::Transport;
use crate::topology::topology::PartitionTopology;
use crate::txn::store::CacheStore;
use crate::txn::types::{TxVersion, VersionGenerator};

/// Read copy of an entry this node does not own.
#[derive(Debug, Clone, PartialEq)]
pub struct NearEntry {
    pub value: Option<Value>,
    pub version: TxVersion,
}

/// Everything the cache components of one node share.
pub struct CacheContext {
    pub config: Arc<CacheConfig>,
    pub discovery: Arc<DiscoveryCache>,
    pub affinity: Arc<AffinityCache>,
    pub topology: Arc<PartitionTopology>,
    pub barrier: TopologyBarrier,
    pub versions: VersionGenerator,
    pub futures: MiniFutures,
    pub near_cache: DashMap<String, NearEntry>,
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn CacheStore>>,
}

impl CacheContext {
    pub fn new(
        config: CacheConfig,
        local: ClusterNode,
        function: Arc<dyn AffinityFunction>,
        transport: Arc<dyn Transport>,
        store: Option<Arc<dyn CacheStore>>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let versions = VersionGenerator::new(local.order);
        let discovery = Arc::new(DiscoveryCache::new(local));
        let affinity = Arc::new(AffinityCache::new(function, config.backups, discovery.clone()));
        let topology = PartitionTopology::new(config.clone(), discovery.clone(), affinity.clone());

        Arc::new(Self {
            config,
            discovery,
            affinity,
            topology,
            barrier: TopologyBarrier::new(),
            versions,
            futures: MiniFutures::new(),
            near_cache: DashMap::new(),
            transport,
            store,
        })
    }

    pub fn local_id(&self) -> &NodeId {
        self.discovery.local_id()
    }

    pub fn store(&self) -> Option<&Arc<dyn CacheStore>> {
        self.store.as_ref()
    }

    /// Looks up a live node; departed or unknown nodes are a topology error.
    pub fn node(&self, id: &NodeId) -> CacheResult<ClusterNode> {
        if self.discovery.has_departed(id) {
            return Err(CacheError::Topology(format!("node {} left the cluster", id)));
        }
        self.discovery
            .node(id)
            .ok_or_else(|| CacheError::Topology(format!("node {} is not known", id)))
    }

    pub async fn send(&self, to: &NodeId, message: CacheMessage) -> CacheResult<()> {
        let node = self.node(to)?;
        let envelope = Envelope {
            from: self.local_id().clone(),
            message,
        };
        self.transport.send(&node, envelope).await
    }

    /// Sends the request built by `build(future_id, mini_id)` and waits for its response.
    pub async fn request<F>(
        &self,
        to: &NodeId,
        future_id: Uuid,
        timeout: Duration,
        build: F,
    ) -> CacheResult<CacheMessage>
    where
        F: FnOnce(Uuid, u32) -> CacheMessage,
    {
        let (mini_id, rx) = self.futures.register(future_id, to);
        let message = build(future_id, mini_id);
        let kind = message.kind();

        if let Err(e) = self.send(to, message).await {
            self.futures.cancel(future_id, mini_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CacheError::Topology(format!("{} to {} was abandoned", kind, to))),
            Err(_) => {
                self.futures.cancel(future_id, mini_id);
                Err(CacheError::Timeout(format!("{} to {} got no response", kind, to)))
            }
        }
    }

    /// Makes sure affinity is known at `version`, fetching it from `peer` if this node
    /// never observed that topology.
    pub async fn ensure_assignment(&self, version: u64, peer: &NodeId) -> CacheResult<()> {
        if self.affinity.assignment(version).is_some() {
            return Ok(());
        }

        tracing::info!("Fetching affinity for topology version {} from {}", version, peer);
        let response = self
            .request(peer, Uuid::new_v4(), self.config.network_timeout, |future_id, mini_id| {
                CacheMessage::AffinityAssignmentRequest(AffinityAssignmentRequest {
                    future_id,
                    mini_id,
                    topology_version: version,
                })
            })
            .await?;

        match response {
            CacheMessage::AffinityAssignmentResponse(AffinityAssignmentResponse {
                partitions: Some(partitions),
                ..
            }) => {
                self.affinity.install(Assignment {
                    version,
                    partitions,
                });
                Ok(())
            }
            CacheMessage::AffinityAssignmentResponse(_) => Err(CacheError::Topology(format!(
                "no node knows affinity for topology version {}",
                version
            ))),
            other => Err(unexpected(&other)),
        }
    }

    pub fn assignment_response(&self, req: AffinityAssignmentRequest) -> AffinityAssignmentResponse {
        AffinityAssignmentResponse {
            future_id: req.future_id,
            mini_id: req.mini_id,
            topology_version: req.topology_version,
            partitions: self
                .affinity
                .assignment(req.topology_version)
                .map(|a| a.partitions.clone()),
        }
    }

    pub fn near_get(&self, key: &str) -> Option<NearEntry> {
        self.near_cache.get(key).map(|e| e.value().clone())
    }

    /// Stores a read copy unless a newer one is already cached.
    pub fn near_put(&self, key: &str, value: Option<Value>, version: TxVersion) {
        if !self.config.near_cache_enabled {
            return;
        }
        match self.near_cache.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if version > e.get().version {
                    e.insert(NearEntry { value, version });
                }
            }
            Entry::Vacant(e) => {
                e.insert(NearEntry { value, version });
            }
        }
    }

    /// Applies a committed write to an existing read copy only.
    pub fn near_update(&self, key: &str, value: Option<Value>, version: TxVersion) -> bool {
        match self.near_cache.get_mut(key) {
            Some(mut e) if version > e.version => {
                e.value = value;
                e.version = version;
                true
            }
            _ => false,
        }
    }

    pub fn near_evict(&self, key: &str) {
        self.near_cache.remove(key);
    }
}

/// Error for a response of the wrong type.
pub fn unexpected(message: &CacheMessage) -> CacheError {
    CacheError::Transport(format!("unexpected response {}", message.kind()))
}
