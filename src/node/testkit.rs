//! In-process clusters for tests: static discovery plus a message hub.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::node::CacheNode;
use crate::config::CacheConfig;
use crate::membership::discovery::StaticDiscovery;
use crate::membership::types::{ClusterNode, NodeId};
use crate::messaging::transport::LocalHub;
use crate::topology::types::PartitionState;
use crate::txn::store::{CacheStore, InMemoryStore};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn test_config() -> CacheConfig {
    CacheConfig::default()
        .with_partitions(16)
        .with_backups(1)
        .with_sweep_interval(Duration::from_millis(50))
        .with_exchange_timeout(Duration::from_secs(2))
        .with_network_timeout(Duration::from_secs(1))
        .with_lock_timeout(Duration::from_secs(1))
        .with_salvage_timeout(Duration::from_millis(300))
}

pub struct TestCluster {
    pub discovery: StaticDiscovery,
    pub hub: Arc<LocalHub>,
    pub store: Arc<InMemoryStore>,
    pub nodes: Vec<Arc<CacheNode>>,
    config: CacheConfig,
}

impl TestCluster {
    pub async fn start(size: usize, config: CacheConfig) -> Self {
        let mut cluster = Self {
            discovery: StaticDiscovery::new(),
            hub: LocalHub::new(),
            store: Arc::new(InMemoryStore::new()),
            nodes: Vec::new(),
            config,
        };
        for _ in 0..size {
            cluster.add_node().await;
        }
        cluster.settle().await;
        cluster
    }

    pub async fn add_node(&mut self) -> Arc<CacheNode> {
        let order = self.discovery.next_order();
        let local = ClusterNode {
            id: NodeId(format!("node-{}", order)),
            order,
            addr: "127.0.0.1:0".parse().unwrap(),
        };

        let node = CacheNode::new(
            self.config.clone(),
            local.clone(),
            self.hub.clone(),
            Some(self.store.clone() as Arc<dyn CacheStore>),
        );
        node.attach_inbox(self.hub.register(&local.id));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        node.start(events_rx);
        self.nodes.push(node.clone());

        let event = self.discovery.join(local, events_tx);
        self.await_version(event.topology_version).await;
        node
    }

    /// Stops the node at `idx` as if it crashed.
    pub async fn fail_node(&mut self, idx: usize) -> Arc<CacheNode> {
        let node = self.nodes.remove(idx);
        node.stop();
        self.hub.unregister(node.id());

        let event = self
            .discovery
            .fail(node.id())
            .expect("failed node was a member");
        self.await_version(event.topology_version).await;
        node
    }

    pub async fn await_version(&self, version: u64) {
        for node in &self.nodes {
            node.await_topology(version, WAIT)
                .await
                .unwrap_or_else(|e| panic!("{} never reached version {}: {}", node.id(), version, e));
        }
    }

    /// Waits until preloading is done and every node agrees on the partition maps.
    pub async fn settle(&self) {
        let nodes = self.nodes.clone();
        wait_until("cluster to settle", move || {
            let no_moving = nodes.iter().all(|n| {
                n.ctx
                    .topology
                    .local_partitions()
                    .iter()
                    .all(|p| p.state() != PartitionState::Moving)
            });
            let maps: Vec<_> = nodes
                .iter()
                .map(|n| n.ctx.topology.full_map().map(|m| m.maps))
                .collect();
            no_moving && maps.windows(2).all(|w| w[0] == w[1])
        })
        .await;
    }

    pub fn node(&self, id: &NodeId) -> Arc<CacheNode> {
        self.nodes
            .iter()
            .find(|n| n.id() == id)
            .cloned()
            .expect("node is part of the cluster")
    }

    /// Primary of `key` at the current topology version.
    pub fn primary_of(&self, key: &str) -> Arc<CacheNode> {
        let ctx = &self.nodes[0].ctx;
        let version = ctx.barrier.ready_version();
        let p = ctx.affinity.partition(key);
        let id = ctx.affinity.primary(p, version).expect("partition has a primary");
        self.node(&id)
    }

    /// A node holding no copy of `key`, if there is one.
    pub fn non_owner_of(&self, key: &str) -> Option<Arc<CacheNode>> {
        let ctx = &self.nodes[0].ctx;
        let version = ctx.barrier.ready_version();
        let p = ctx.affinity.partition(key);
        self.nodes
            .iter()
            .find(|n| !ctx.affinity.belongs(p, version, n.id()))
            .cloned()
    }

    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.stop();
        }
    }
}

pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + WAIT;
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
