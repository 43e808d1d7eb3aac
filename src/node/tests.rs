//! Cache Node Tests
//!
//! ## Test Scopes
//! - **Cache API**: puts and reads across nodes, removes, transforms and store read-through.
//! - **Failover**: reads served by the surviving owners after a primary fails.
//! - **Rebalancing**: a joining node preloads its partitions and every map agrees.
//! - **Near Cache**: non-owners keep read copies that primaries keep current and drop
//!   when they diverge.
//! - **HTTP Handlers**: batch transactions and error statuses.

#[cfg(test)]
mod tests {
    use crate::node::handlers::{TxOpRequest, TxRequest, handle_get, handle_tx};
    use crate::node::testkit::{TestCluster, test_config, wait_until};
    use crate::txn::types::{Concurrency, Delta, Isolation, TxState, TxVersion};
    use axum::Json;
    use axum::extract::{Extension, Path};
    use axum::http::StatusCode;
    use serde_json::json;

    // ============================================================
    // CACHE API TESTS
    // ============================================================

    #[tokio::test]
    async fn test_put_visible_from_every_node() {
        let cluster = TestCluster::start(3, test_config()).await;

        let outcome = cluster.nodes[0].put("alpha", json!("one")).await.unwrap();
        assert_eq!(outcome.state, TxState::Committed);
        assert!(outcome.excluded_keys.is_empty());

        for node in &cluster.nodes {
            assert_eq!(node.get("alpha").await.unwrap(), Some(json!("one")));
        }
        assert_eq!(cluster.store.get("alpha"), Some(json!("one")));

        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_remove_deletes_everywhere() {
        let cluster = TestCluster::start(3, test_config()).await;

        cluster.nodes[1].put("gone", json!(1)).await.unwrap();
        cluster.nodes[2].remove("gone").await.unwrap();

        for node in &cluster.nodes {
            assert_eq!(node.get("gone").await.unwrap(), None);
        }
        assert_eq!(cluster.store.get("gone"), None);

        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_transform_applies_to_current_value() {
        let cluster = TestCluster::start(3, test_config()).await;

        cluster.nodes[0].put("counter", json!(1)).await.unwrap();
        cluster.nodes[1].transform("counter", Delta::Add(5)).await.unwrap();
        cluster.nodes[2].transform("counter", Delta::Add(5)).await.unwrap();

        assert_eq!(cluster.nodes[0].get("counter").await.unwrap(), Some(json!(11)));

        let err = cluster.nodes[0]
            .transform("counter", Delta::Append("x".to_string()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot append"));

        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_read_through_loads_from_store() {
        let cluster = TestCluster::start(2, test_config()).await;
        cluster.store.insert("preloaded", json!({"name": "from-store"}));

        for node in &cluster.nodes {
            assert_eq!(
                node.get("preloaded").await.unwrap(),
                Some(json!({"name": "from-store"}))
            );
        }

        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_keys_spread_over_primaries() {
        let cluster = TestCluster::start(3, test_config()).await;

        for i in 0..30 {
            cluster.nodes[i % 3].put(&format!("key-{}", i), json!(i)).await.unwrap();
        }

        let stats: Vec<_> = cluster.nodes.iter().map(|n| n.stats()).collect();
        assert!(stats.iter().all(|s| s.entries > 0));
        // One primary and one backup copy of every key.
        assert_eq!(stats.iter().map(|s| s.entries).sum::<usize>(), 60);
        assert!(stats.iter().all(|s| s.transactions.primary == 0));

        cluster.shutdown();
    }

    // ============================================================
    // FAILOVER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_read_survives_primary_failure() {
        let mut cluster = TestCluster::start(4, test_config()).await;

        cluster.nodes[0].put("durable", json!(42)).await.unwrap();

        let primary = cluster.primary_of("durable");
        let idx = cluster
            .nodes
            .iter()
            .position(|n| n.id() == primary.id())
            .unwrap();
        cluster.fail_node(idx).await;

        for node in &cluster.nodes {
            assert_eq!(node.get("durable").await.unwrap(), Some(json!(42)));
        }

        // The new primary accepts writes.
        cluster.nodes[0].put("durable", json!(43)).await.unwrap();
        assert_eq!(cluster.nodes[1].get("durable").await.unwrap(), Some(json!(43)));

        cluster.settle().await;
        for node in &cluster.nodes {
            node.ctx.topology.verify_consistency().unwrap();
        }

        cluster.shutdown();
    }

    // ============================================================
    // REBALANCING TESTS
    // ============================================================

    #[tokio::test]
    async fn test_joining_node_preloads_partitions() {
        let mut cluster = TestCluster::start(2, test_config()).await;

        for i in 0..20 {
            cluster.nodes[0].put(&format!("item-{}", i), json!(i)).await.unwrap();
        }

        let joined = cluster.add_node().await;
        cluster.settle().await;

        let stats = joined.stats();
        assert!(stats.owning > 0);
        assert_eq!(stats.moving, 0);
        assert!(stats.entries > 0);

        for i in 0..20 {
            assert_eq!(
                joined.get(&format!("item-{}", i)).await.unwrap(),
                Some(json!(i))
            );
        }

        for node in &cluster.nodes {
            node.ctx.topology.verify_consistency().unwrap();
        }

        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_renting_partitions_are_evicted_after_join() {
        let mut cluster = TestCluster::start(2, test_config()).await;
        let founder = cluster.nodes[0].clone();
        assert_eq!(founder.stats().owning, 16);

        cluster.add_node().await;
        cluster.add_node().await;
        cluster.settle().await;

        let f = founder.clone();
        wait_until("surplus partitions to be evicted", move || {
            let stats = f.stats();
            stats.renting == 0 && stats.owning < 16
        })
        .await;

        cluster.shutdown();
    }

    // ============================================================
    // NEAR CACHE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_near_copy_updated_by_primary() {
        let cluster = TestCluster::start(3, test_config()).await;

        let key = (0..100)
            .map(|i| format!("near-{}", i))
            .find(|k| cluster.non_owner_of(k).is_some())
            .unwrap();
        let reader = cluster.non_owner_of(&key).unwrap();
        let primary = cluster.primary_of(&key);

        primary.put(&key, json!(1)).await.unwrap();
        assert_eq!(reader.get(&key).await.unwrap(), Some(json!(1)));
        assert_eq!(reader.ctx.near_get(&key).unwrap().value, Some(json!(1)));

        primary.put(&key, json!(2)).await.unwrap();

        let near = reader.ctx.near_get(&key).unwrap();
        assert_eq!(near.value, Some(json!(2)));
        assert_eq!(reader.get(&key).await.unwrap(), Some(json!(2)));

        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_diverged_near_copy_is_evicted() {
        let cluster = TestCluster::start(3, test_config()).await;

        let key = (0..100)
            .map(|i| format!("drift-{}", i))
            .find(|k| cluster.non_owner_of(k).is_some())
            .unwrap();
        let reader = cluster.non_owner_of(&key).unwrap();
        let primary = cluster.primary_of(&key);

        primary.put(&key, json!(1)).await.unwrap();
        assert_eq!(reader.get(&key).await.unwrap(), Some(json!(1)));

        // The reader's copy no longer matches the version the primary recorded.
        reader
            .ctx
            .near_put(&key, Some(json!("drifted")), TxVersion::new(999, 999, 999));

        let outcome = primary.put(&key, json!(2)).await.unwrap();
        assert_eq!(outcome.state, TxState::Committed);
        assert!(reader.ctx.near_get(&key).is_none());

        let ctx = &primary.ctx;
        let p = ctx.affinity.partition(&key);
        let part = ctx
            .topology
            .local_partition(p, ctx.barrier.ready_version(), false)
            .unwrap()
            .unwrap();
        assert!(!part.readers(&key).contains(reader.id()));

        assert_eq!(reader.get(&key).await.unwrap(), Some(json!(2)));
        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_owners_keep_no_near_copies() {
        let cluster = TestCluster::start(2, test_config()).await;

        cluster.nodes[0].put("owned", json!(true)).await.unwrap();
        // With one backup and two nodes everyone owns everything.
        for node in &cluster.nodes {
            assert_eq!(node.get("owned").await.unwrap(), Some(json!(true)));
            assert!(node.ctx.near_get("owned").is_none());
        }

        cluster.shutdown();
    }

    // ============================================================
    // HTTP HANDLER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_tx_handler_runs_batch() {
        let cluster = TestCluster::start(2, test_config()).await;
        let node = cluster.nodes[0].clone();
        node.put("balance", json!(10)).await.unwrap();

        let req = TxRequest {
            concurrency: Concurrency::Pessimistic,
            isolation: Isolation::RepeatableRead,
            timeout_ms: Some(2_000),
            ops: vec![
                TxOpRequest::Get {
                    key: "balance".to_string(),
                },
                TxOpRequest::Add {
                    key: "balance".to_string(),
                    delta: -3,
                },
                TxOpRequest::Append {
                    key: "log".to_string(),
                    suffix: "withdraw;".to_string(),
                },
            ],
        };
        let (status, Json(resp)) = handle_tx(Extension(node.clone()), Json(req)).await;

        assert_eq!(status, StatusCode::OK);
        assert!(resp.success);
        assert_eq!(resp.reads.get("balance"), Some(&Some(json!(10))));
        assert_eq!(resp.outcome.unwrap().state, TxState::Committed);

        assert_eq!(cluster.nodes[1].get("balance").await.unwrap(), Some(json!(7)));
        assert_eq!(cluster.nodes[1].get("log").await.unwrap(), Some(json!("withdraw;")));

        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_tx_handler_rejects_bad_transform() {
        let cluster = TestCluster::start(1, test_config()).await;
        let node = cluster.nodes[0].clone();
        node.put("name", json!("text")).await.unwrap();

        let req = TxRequest {
            concurrency: Concurrency::Optimistic,
            isolation: Isolation::ReadCommitted,
            timeout_ms: None,
            ops: vec![TxOpRequest::Add {
                key: "name".to_string(),
                delta: 1,
            }],
        };
        let (status, Json(resp)) = handle_tx(Extension(node.clone()), Json(req)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!resp.success);
        assert!(resp.error.is_some());
        assert_eq!(node.get("name").await.unwrap(), Some(json!("text")));

        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_get_handler_missing_key() {
        let cluster = TestCluster::start(1, test_config()).await;

        let (status, Json(resp)) =
            handle_get(Extension(cluster.nodes[0].clone()), Path("nothing".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(resp.value.is_none());

        cluster.shutdown();
    }
}
