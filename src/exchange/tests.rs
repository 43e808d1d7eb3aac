//! Topology Exchange Tests
//!
//! ## Test Scopes
//! - **Joins**: the first node owns everything, later joiners agree on one full map.
//! - **Departures**: the next oldest node takes over the full map and keeps coordinating.
//! - **Preloading**: suppliers only serve partitions they own; with preloading off
//!   joiners own their partitions right after the exchange.
//! - **Barrier**: nothing is admitted before the first exchange completes.

#[cfg(test)]
mod tests {
    use crate::error::CacheError;
    use crate::membership::types::{ClusterNode, NodeId};
    use crate::messaging::protocol::PartitionDemand;
    use crate::node::node::CacheNode;
    use crate::node::testkit::{TestCluster, test_config, wait_until};
    use crate::topology::types::PartitionState;
    use crate::txn::types::TxOptions;
    use serde_json::json;
    use uuid::Uuid;

    /// Partitions `node` holds in OWNING state according to its own full map view.
    fn owning_counts(node: &CacheNode) -> Vec<usize> {
        let full = node.ctx.topology.full_map().unwrap_or_default();
        (0..node.ctx.config.partitions)
            .map(|p| {
                full.maps
                    .values()
                    .filter(|m| m.state(p) == Some(PartitionState::Owning))
                    .count()
            })
            .collect()
    }

    // ============================================================
    // JOIN TESTS
    // ============================================================

    #[tokio::test]
    async fn test_first_node_owns_everything() {
        let cluster = TestCluster::start(1, test_config()).await;
        let node = &cluster.nodes[0];

        let stats = node.stats();
        assert_eq!(stats.ready_version, 1);
        assert_eq!(stats.owning, 16);
        assert_eq!(stats.moving, 0);

        let full = node.ctx.topology.full_map().unwrap();
        assert_eq!(full.author.as_ref(), Some(node.id()));
        node.ctx.topology.verify_consistency().unwrap();

        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_joiners_agree_on_full_map() {
        let cluster = TestCluster::start(3, test_config()).await;
        let oldest = cluster.nodes[0].id().clone();

        let nodes = cluster.nodes.clone();
        wait_until("two owners per partition", move || {
            nodes
                .iter()
                .all(|n| owning_counts(n).iter().all(|c| *c == 2))
        })
        .await;

        for node in &cluster.nodes {
            assert_eq!(node.stats().ready_version, 3);
            let full = node.ctx.topology.full_map().unwrap();
            assert_eq!(full.author.as_ref(), Some(&oldest));
            node.ctx.topology.verify_consistency().unwrap();
        }

        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_preload_disabled_owns_after_exchange() {
        let mut cluster = TestCluster::start(1, test_config().with_preload(false)).await;
        cluster.nodes[0].put("early", json!(1)).await.unwrap();

        let joined = cluster.add_node().await;
        let stats = joined.stats();
        assert_eq!(stats.moving, 0);
        assert_eq!(stats.owning, 16);
        // Nothing was preloaded.
        assert_eq!(stats.entries, 0);

        cluster.shutdown();
    }

    // ============================================================
    // DEPARTURE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_next_oldest_takes_over() {
        let mut cluster = TestCluster::start(3, test_config()).await;
        for i in 0..10 {
            cluster.nodes[1].put(&format!("k{}", i), json!(i)).await.unwrap();
        }

        cluster.fail_node(0).await;
        let successor = cluster.nodes[0].id().clone();
        cluster.settle().await;

        for node in &cluster.nodes {
            let full = node.ctx.topology.full_map().unwrap();
            assert_eq!(full.author.as_ref(), Some(&successor));
            assert!(!full.maps.keys().any(|id| id.0 == "node-1"));
        }

        // The new coordinator runs the next exchange.
        let joined = cluster.add_node().await;
        cluster.settle().await;
        for i in 0..10 {
            assert_eq!(joined.get(&format!("k{}", i)).await.unwrap(), Some(json!(i)));
        }
        for node in &cluster.nodes {
            node.ctx.topology.verify_consistency().unwrap();
        }

        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_departure_fails_pending_requests() {
        let mut cluster = TestCluster::start(2, test_config()).await;
        let survivor = cluster.nodes[0].clone();
        let departing = cluster.nodes[1].id().clone();

        // Requests to a silent node stay pending until it leaves.
        cluster.hub.drop_where(move |to, _| to == &departing);
        let pending = {
            let survivor = survivor.clone();
            let target = cluster.nodes[1].id().clone();
            tokio::spawn(async move { survivor.ctx.ensure_assignment(99, &target).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(survivor.stats().pending_requests, 1);

        cluster.fail_node(1).await;
        cluster.hub.clear_filter();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, CacheError::Topology(_)));
        assert_eq!(survivor.stats().pending_requests, 0);

        cluster.shutdown();
    }

    // ============================================================
    // PRELOADING TESTS
    // ============================================================

    #[tokio::test]
    async fn test_supplier_refuses_partitions_it_does_not_own() {
        let cluster = TestCluster::start(3, test_config()).await;
        let node = &cluster.nodes[0];
        let version = node.ctx.barrier.ready_version();

        let nodes = cluster.nodes.clone();
        wait_until("surplus partitions evicted", move || {
            nodes.iter().all(|n| n.stats().renting == 0)
        })
        .await;

        let foreign = (0..16)
            .find(|p| !node.ctx.affinity.is_local(*p, version))
            .unwrap();
        let supply = node.preloader.on_demand(PartitionDemand {
            future_id: Uuid::new_v4(),
            mini_id: 0,
            topology_version: version,
            partition: foreign,
        });
        assert!(supply.entries.is_empty());
        assert!(matches!(supply.error, Some(CacheError::InvalidPartition { .. })));

        let owned = (0..16)
            .find(|p| node.ctx.affinity.is_local(*p, version))
            .unwrap();
        let supply = node.preloader.on_demand(PartitionDemand {
            future_id: Uuid::new_v4(),
            mini_id: 0,
            topology_version: version,
            partition: owned,
        });
        assert!(supply.error.is_none());

        cluster.shutdown();
    }

    // ============================================================
    // BARRIER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_nothing_admitted_before_first_exchange() {
        let cluster = TestCluster::start(1, test_config()).await;

        let local = ClusterNode {
            id: NodeId::from("loner"),
            order: 99,
            addr: "127.0.0.1:0".parse().unwrap(),
        };
        let loner = CacheNode::new(test_config(), local, cluster.hub.clone(), None);

        assert!(matches!(
            loner.begin(TxOptions::pessimistic()),
            Err(CacheError::Topology(_))
        ));
        assert!(matches!(loner.get("any").await, Err(CacheError::Topology(_))));
        assert!(matches!(
            loner.await_topology(1, std::time::Duration::from_millis(50)).await,
            Err(CacheError::Timeout(_))
        ));

        cluster.shutdown();
    }
}
