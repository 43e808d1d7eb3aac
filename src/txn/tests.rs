//! Transaction Tests
//!
//! ## Test Scopes
//! - **Optimistic**: read validation at prepare, atomic rollback across primaries and
//!   remapping onto a newer topology.
//! - **Pessimistic**: lock waits, lock timeouts, group locks and options carried to the
//!   primary by lock requests.
//! - **Lifecycle**: explicit rollback, transaction timeouts and idempotent prepare.
//! - **Backups**: partitions a backup no longer holds, excluded keys and re-delivered
//!   prepare and finish requests.
//! - **Failures**: heuristic outcomes on store failure and on a lost backup finish,
//!   salvage of orphaned locks and of backups whose primary left mid-commit.

#[cfg(test)]
mod tests {
    use crate::error::CacheError;
    use crate::membership::types::NodeId;
    use crate::messaging::protocol::{
        CacheMessage, Envelope, FinishRequest, NearFinishRequest, NearPrepareRequest, PrepareRequest,
    };
    use crate::node::node::CacheNode;
    use crate::node::testkit::{TestCluster, test_config, wait_until};
    use crate::txn::types::{Concurrency, Isolation, TxEntry, TxOp, TxOptions, TxState};
    use serde_json::{Value, json};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    fn keys(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}-{}", prefix, i)).collect()
    }

    /// The owner of `key` that is not its primary.
    fn backup_of(cluster: &TestCluster, key: &str) -> Arc<CacheNode> {
        let primary = cluster.primary_of(key);
        let ctx = &primary.ctx;
        let version = ctx.barrier.ready_version();
        let p = ctx.affinity.partition(key);
        let id = ctx
            .topology
            .nodes(p, version)
            .into_iter()
            .find(|n| n != primary.id())
            .expect("partition has a backup");
        cluster.node(&id)
    }

    /// Value of `key` in the local copy of its partition, without a network read.
    fn stored(node: &CacheNode, key: &str) -> Option<Value> {
        let ctx = &node.ctx;
        let p = ctx.affinity.partition(key);
        ctx.topology
            .local_partition(p, ctx.barrier.ready_version(), false)
            .ok()
            .flatten()
            .and_then(|part| part.value(key))
    }

    /// Stops the local copy of `key`'s partition from taking part in transactions.
    fn evict_local(node: &CacheNode, key: &str) {
        let ctx = &node.ctx;
        let p = ctx.affinity.partition(key);
        let part = ctx
            .topology
            .local_partition(p, ctx.barrier.ready_version(), false)
            .unwrap()
            .expect("node owns the partition");
        let _ = part.rent();
    }

    /// A two-phase prepare of `key` as a primary sends it to its backup.
    fn backup_prepare(primary: &CacheNode, key: &str, value: Value) -> PrepareRequest {
        let ctx = &primary.ctx;
        let top_ver = ctx.barrier.ready_version();
        PrepareRequest {
            future_id: Uuid::new_v4(),
            mini_id: 3,
            topology_version: top_ver,
            near_xid: ctx.versions.next(top_ver),
            near_node: primary.id().clone(),
            isolation: Isolation::ReadCommitted,
            timeout_ms: 5_000,
            writes: vec![TxEntry::new(key, ctx.affinity.partition(key), TxOp::Update, Some(value))],
            near_writes: Vec::new(),
            owned_versions: BTreeMap::new(),
            last: true,
            one_phase_commit: false,
            commit_version: None,
            group_lock_key: None,
        }
    }

    // ============================================================
    // OPTIMISTIC TESTS
    // ============================================================

    #[tokio::test]
    async fn test_optimistic_conflict_detected_at_prepare() {
        let cluster = TestCluster::start(3, test_config()).await;
        cluster.nodes[0].put("stock", json!(5)).await.unwrap();

        let tx1 = cluster.nodes[1]
            .begin(TxOptions::optimistic(Isolation::RepeatableRead))
            .unwrap();
        let tx2 = cluster.nodes[2]
            .begin(TxOptions::optimistic(Isolation::RepeatableRead))
            .unwrap();

        assert_eq!(tx1.get("stock").await.unwrap(), Some(json!(5)));
        assert_eq!(tx2.get("stock").await.unwrap(), Some(json!(5)));

        tx1.put("stock", json!(4)).await.unwrap();
        tx2.put("stock", json!(3)).await.unwrap();

        let first = tx1.commit().await.unwrap();
        assert_eq!(first.state, TxState::Committed);

        let err = tx2.commit().await.unwrap_err();
        assert!(
            matches!(err, CacheError::OptimisticConflict { ref key, .. } if key == "stock"),
            "unexpected error: {}",
            err
        );

        assert_eq!(cluster.nodes[0].get("stock").await.unwrap(), Some(json!(4)));
        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_read_committed_optimistic_skips_validation() {
        let cluster = TestCluster::start(2, test_config()).await;
        cluster.nodes[0].put("note", json!("a")).await.unwrap();

        let tx = cluster.nodes[1]
            .begin(TxOptions::optimistic(Isolation::ReadCommitted))
            .unwrap();
        assert_eq!(tx.get("note").await.unwrap(), Some(json!("a")));

        cluster.nodes[0].put("note", json!("b")).await.unwrap();
        assert_eq!(tx.get("note").await.unwrap(), Some(json!("b")));

        tx.put("note", json!("c")).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(cluster.nodes[0].get("note").await.unwrap(), Some(json!("c")));

        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_conflict_rolls_back_every_primary() {
        let cluster = TestCluster::start(3, test_config()).await;
        let batch = keys("batch", 12);
        cluster.nodes[0].put(&batch[0], json!(0)).await.unwrap();

        let tx = cluster.nodes[1]
            .begin(TxOptions::optimistic(Isolation::Serializable))
            .unwrap();
        assert_eq!(tx.get(&batch[0]).await.unwrap(), Some(json!(0)));
        for key in &batch {
            tx.put(key, json!("from-tx")).await.unwrap();
        }

        // Concurrent writer invalidates the read.
        cluster.nodes[2].put(&batch[0], json!(1)).await.unwrap();

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, CacheError::OptimisticConflict { .. }));

        assert_eq!(cluster.nodes[0].get(&batch[0]).await.unwrap(), Some(json!(1)));
        for key in &batch[1..] {
            for node in &cluster.nodes {
                assert_eq!(node.get(key).await.unwrap(), None, "{} leaked", key);
            }
        }

        let nodes = cluster.nodes.clone();
        wait_until("primary transactions to finish", move || {
            nodes.iter().all(|n| n.tm.stats().primary == 0)
        })
        .await;
        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_optimistic_tx_remapped_after_join() {
        let mut cluster = TestCluster::start(2, test_config()).await;
        let batch = keys("remap", 40);

        let tx = cluster.nodes[0]
            .begin(TxOptions::optimistic(Isolation::ReadCommitted))
            .unwrap();
        let started_at = tx.topology_version();
        let first_xid = tx.xid();
        for key in &batch {
            tx.put(key, json!(key)).await.unwrap();
        }

        let joined = cluster.add_node().await;
        let ctx = &cluster.nodes[0].ctx;
        let current = ctx.barrier.ready_version();
        assert!(current > started_at);
        assert!(batch.iter().any(|k| {
            let p = ctx.affinity.partition(k);
            ctx.affinity.primary(p, started_at) != ctx.affinity.primary(p, current)
        }));

        let outcome = tx.commit().await.unwrap();
        assert_eq!(outcome.state, TxState::Committed);
        assert_ne!(outcome.xid, first_xid);

        cluster.settle().await;
        for key in &batch {
            assert_eq!(joined.get(key).await.unwrap(), Some(json!(key)));
        }
        cluster.shutdown();
    }

    // ============================================================
    // PESSIMISTIC TESTS
    // ============================================================

    #[tokio::test]
    async fn test_lock_wait_times_out() {
        let cluster = TestCluster::start(3, test_config()).await;
        cluster.nodes[0].put("seat", json!("free")).await.unwrap();

        let holder = cluster.nodes[0].begin(TxOptions::pessimistic()).unwrap();
        assert_eq!(holder.get("seat").await.unwrap(), Some(json!("free")));

        let waiter = cluster.nodes[1]
            .begin(TxOptions::pessimistic().with_timeout(Duration::from_millis(300)))
            .unwrap();
        let err = waiter.put("seat", json!("taken-by-waiter")).await.unwrap_err();
        assert!(
            matches!(err, CacheError::LockTimeout { .. } | CacheError::Timeout(_)),
            "unexpected error: {}",
            err
        );
        // Rollback-only after a failed lock.
        assert!(waiter.put("other", json!(1)).await.is_err());
        drop(waiter);

        holder.put("seat", json!("taken-by-holder")).await.unwrap();
        holder.commit().await.unwrap();
        assert_eq!(
            cluster.nodes[2].get("seat").await.unwrap(),
            Some(json!("taken-by-holder"))
        );
        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_lock_granted_after_commit() {
        let cluster = TestCluster::start(2, test_config()).await;
        cluster.nodes[0].put("counter", json!(0)).await.unwrap();

        let first = cluster.nodes[0].begin(TxOptions::pessimistic()).unwrap();
        first.get("counter").await.unwrap();

        let second_node = cluster.nodes[1].clone();
        let second = tokio::spawn(async move {
            let tx = second_node.begin(TxOptions::pessimistic()).unwrap();
            let current = tx.get("counter").await.unwrap().unwrap();
            tx.put("counter", json!(current.as_i64().unwrap() + 10))
                .await
                .unwrap();
            tx.commit().await.unwrap()
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        first.put("counter", json!(1)).await.unwrap();
        first.commit().await.unwrap();

        let outcome = second.await.unwrap();
        assert_eq!(outcome.state, TxState::Committed);
        assert_eq!(cluster.nodes[0].get("counter").await.unwrap(), Some(json!(11)));
        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_group_lock_covers_partition() {
        let cluster = TestCluster::start(2, test_config()).await;
        let ctx = &cluster.nodes[0].ctx;
        let group_p = ctx.affinity.partition("orders");
        let members: Vec<String> = (0..500)
            .map(|i| format!("order-{}", i))
            .filter(|k| ctx.affinity.partition(k) == group_p)
            .take(2)
            .collect();
        assert_eq!(members.len(), 2);

        let tx1 = cluster.nodes[0]
            .begin(TxOptions::pessimistic().with_group_lock("orders"))
            .unwrap();
        tx1.put(&members[0], json!("first")).await.unwrap();

        let tx2 = cluster.nodes[1]
            .begin(
                TxOptions::pessimistic()
                    .with_group_lock("orders")
                    .with_timeout(Duration::from_millis(300)),
            )
            .unwrap();
        assert!(tx2.put(&members[1], json!("second")).await.is_err());
        drop(tx2);

        tx1.put(&members[1], json!("first")).await.unwrap();
        tx1.commit().await.unwrap();
        for key in &members {
            assert_eq!(cluster.nodes[1].get(key).await.unwrap(), Some(json!("first")));
        }
        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_lock_request_carries_tx_options() {
        let cluster = TestCluster::start(3, test_config()).await;
        let key = (0..100)
            .map(|i| format!("strict-{}", i))
            .find(|k| cluster.non_owner_of(k).is_some())
            .unwrap();
        let near = cluster.non_owner_of(&key).unwrap();
        let primary = cluster.primary_of(&key);
        let backup = backup_of(&cluster, &key);

        let tx = near
            .begin(
                TxOptions::pessimistic()
                    .requiring_all_partitions()
                    .with_group_lock(key.clone()),
            )
            .unwrap();
        tx.put(&key, json!("all-or-nothing")).await.unwrap();

        let locked = primary.tm.find_primary(&tx.xid()).unwrap();
        assert!(locked.require_all_partitions);
        assert_eq!(locked.group_lock_key.as_deref(), Some(key.as_str()));

        // The backup drops its copy before the commit reaches it.
        evict_local(&backup, &key);

        let err = tx.commit().await.unwrap_err();
        assert!(
            matches!(err, CacheError::InvalidPartition { .. }),
            "unexpected error: {}",
            err
        );
        assert_eq!(primary.get(&key).await.unwrap(), None);
        assert_eq!(cluster.store.get(&key), None);
        cluster.shutdown();
    }

    // ============================================================
    // LIFECYCLE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_rollback_discards_writes_and_locks() {
        let cluster = TestCluster::start(3, test_config()).await;

        let tx = cluster.nodes[0].begin(TxOptions::pessimistic()).unwrap();
        tx.put("a", json!(1)).await.unwrap();
        tx.put("b", json!(2)).await.unwrap();
        let outcome = tx.rollback().await.unwrap();
        assert_eq!(outcome.state, TxState::RolledBack);

        for node in &cluster.nodes {
            assert_eq!(node.get("a").await.unwrap(), None);
            assert_eq!(node.get("b").await.unwrap(), None);
        }

        let next = cluster.nodes[1]
            .begin(TxOptions::pessimistic().with_timeout(Duration::from_millis(500)))
            .unwrap();
        next.put("a", json!(3)).await.unwrap();
        next.commit().await.unwrap();
        assert_eq!(cluster.nodes[2].get("a").await.unwrap(), Some(json!(3)));
        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_timed_out_tx_rejects_operations() {
        let cluster = TestCluster::start(2, test_config()).await;

        let tx = cluster.nodes[0]
            .begin(TxOptions::pessimistic().with_timeout(Duration::from_millis(150)))
            .unwrap();
        tx.put("slow", json!(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let err = tx.put("slow", json!(2)).await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout(_)));
        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout(_)));

        assert_eq!(cluster.nodes[1].get("slow").await.unwrap(), None);
        cluster.nodes[1].put("slow", json!(3)).await.unwrap();
        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_duplicate_prepare_answered_once() {
        let cluster = TestCluster::start(2, test_config()).await;
        let near = cluster.nodes[0].clone();
        let primary = cluster.primary_of("dup");

        let top_ver = near.ctx.barrier.ready_version();
        let p = near.ctx.affinity.partition("dup");
        let req = NearPrepareRequest {
            future_id: Uuid::new_v4(),
            mini_id: 0,
            topology_version: top_ver,
            near_xid: near.ctx.versions.next(top_ver),
            concurrency: Concurrency::Optimistic,
            isolation: Isolation::ReadCommitted,
            timeout_ms: 2_000,
            writes: vec![TxEntry::new("dup", p, TxOp::Update, Some(json!(7)))],
            reads: Vec::new(),
            one_phase_commit: true,
            require_all_partitions: false,
            group_lock_key: None,
        };

        let writes_before = cluster.store.write_count();
        let (a, b) = tokio::join!(
            primary.tm.on_near_prepare(near.id(), req.clone()),
            primary.tm.on_near_prepare(near.id(), req.clone())
        );
        let c = primary.tm.on_near_prepare(near.id(), req).await;

        assert_eq!(a.state, TxState::Committed);
        assert!(a.error.is_none());
        for other in [&b, &c] {
            assert_eq!(other.state, a.state);
            assert_eq!(other.commit_version, a.commit_version);
        }
        assert_eq!(cluster.store.write_count(), writes_before + 1);
        assert_eq!(near.get("dup").await.unwrap(), Some(json!(7)));
        cluster.shutdown();
    }

    // ============================================================
    // BACKUP TESTS
    // ============================================================

    #[tokio::test]
    async fn test_non_owner_reports_invalid_partition() {
        let cluster = TestCluster::start(3, test_config()).await;
        let key = "misrouted";
        let primary = cluster.primary_of(key);
        let stranger = cluster.non_owner_of(key).unwrap();
        let p = primary.ctx.affinity.partition(key);

        let mut req = backup_prepare(&primary, key, json!(1));
        req.one_phase_commit = true;
        req.commit_version = Some(req.near_xid);

        let response = stranger.tm.on_prepare(primary.id(), req).await;
        assert!(response.error.is_none());
        assert_eq!(response.invalid_partitions, vec![p]);
        assert_eq!(stored(&stranger, key), None);
        assert_eq!(stranger.tm.stats().remote, 0);
        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_evicted_backup_keys_are_excluded() {
        let cluster = TestCluster::start(3, test_config()).await;
        let key = "half-backed";
        let primary = cluster.primary_of(key);
        let backup = backup_of(&cluster, key);

        evict_local(&backup, key);

        let outcome = primary.put(key, json!("primary-only")).await.unwrap();
        assert_eq!(outcome.state, TxState::Committed);
        assert_eq!(outcome.excluded_keys, vec![key.to_string()]);

        assert_eq!(stored(&primary, key), Some(json!("primary-only")));
        assert_eq!(stored(&backup, key), None);
        assert_eq!(cluster.store.get(key), Some(json!("primary-only")));
        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_redelivered_backup_prepare_and_finish() {
        let config = test_config().with_salvage_timeout(Duration::from_secs(5));
        let cluster = TestCluster::start(2, config).await;
        let key = "twice";
        let primary = cluster.primary_of(key);
        let backup = backup_of(&cluster, key);

        let req = backup_prepare(&primary, key, json!("once"));
        let near_xid = req.near_xid;

        let first = backup.tm.on_prepare(primary.id(), req.clone()).await;
        let second = backup.tm.on_prepare(primary.id(), req.clone()).await;
        for response in [&first, &second] {
            assert_eq!(response.future_id, req.future_id);
            assert_eq!(response.mini_id, req.mini_id);
            assert!(response.error.is_none());
            assert!(response.invalid_partitions.is_empty());
        }
        assert_eq!(backup.tm.stats().remote, 1);
        assert_eq!(stored(&backup, key), None);

        let top_ver = req.topology_version;
        let finish = FinishRequest {
            future_id: Uuid::new_v4(),
            mini_id: 0,
            topology_version: top_ver,
            near_xid,
            commit: true,
            near_writes: Vec::new(),
            isolation: Isolation::ReadCommitted,
            one_phase_commit: false,
            pending_versions: Vec::new(),
            commit_version: Some(primary.ctx.versions.next(top_ver)),
        };
        let done = backup.tm.on_finish(primary.id(), finish.clone()).await;
        assert!(done.error.is_none());
        assert_eq!(backup.tm.stats().remote, 0);
        assert_eq!(stored(&backup, key), Some(json!("once")));

        // Late copies of both requests change nothing.
        let again = backup.tm.on_finish(primary.id(), finish).await;
        assert!(again.error.is_none());
        let late = backup.tm.on_prepare(primary.id(), req).await;
        assert!(late.error.is_none());
        assert_eq!(backup.tm.stats().remote, 0);
        assert_eq!(stored(&backup, key), Some(json!("once")));
        cluster.shutdown();
    }

    // ============================================================
    // FAILURE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_store_failure_is_heuristic() {
        let cluster = TestCluster::start(2, test_config()).await;

        cluster.store.set_fail_writes(true);
        let err = cluster.nodes[0].put("fragile", json!(1)).await.unwrap_err();
        assert!(matches!(err, CacheError::Heuristic(_)), "unexpected error: {}", err);
        assert!(!err.is_retryable());

        // Locks were released despite the failure.
        cluster.store.set_fail_writes(false);
        let outcome = cluster.nodes[1].put("fragile", json!(2)).await.unwrap();
        assert_eq!(outcome.state, TxState::Committed);
        assert_eq!(cluster.store.get("fragile"), Some(json!(2)));
        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_orphaned_lock_salvaged_after_near_failure() {
        let mut cluster = TestCluster::start(3, test_config()).await;
        let near_id = cluster.nodes[2].id().clone();
        let key = (0..100)
            .map(|i| format!("orphan-{}", i))
            .find(|k| cluster.primary_of(k).id() != &near_id)
            .unwrap();
        let primary = cluster.primary_of(&key);

        let orphan = cluster.nodes[2].begin(TxOptions::pessimistic()).unwrap();
        orphan.put(&key, json!("never")).await.unwrap();
        assert_eq!(primary.tm.stats().primary, 1);

        cluster.fail_node(2).await;

        let survivor = cluster.nodes[0]
            .begin(TxOptions::pessimistic().with_timeout(Duration::from_secs(3)))
            .unwrap();
        survivor.put(&key, json!("salvaged")).await.unwrap();
        survivor.commit().await.unwrap();

        assert_eq!(cluster.nodes[1].get(&key).await.unwrap(), Some(json!("salvaged")));
        drop(orphan);
        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_departed_primary_fails_pessimistic_tx() {
        let mut cluster = TestCluster::start(3, test_config()).await;
        let near = cluster.nodes[0].clone();
        let key = (0..100)
            .map(|i| format!("lost-{}", i))
            .find(|k| cluster.primary_of(k).id() != near.id())
            .unwrap();
        let primary_id = cluster.primary_of(&key).id().clone();

        let tx = near.begin(TxOptions::pessimistic()).unwrap();
        tx.put(&key, json!(1)).await.unwrap();

        let idx = cluster
            .nodes
            .iter()
            .position(|n| n.id() == &primary_id)
            .unwrap();
        cluster.fail_node(idx).await;

        assert!(tx.commit().await.is_err());
        assert_eq!(near.tm.stats().near, 0);
        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_lost_backup_finish_is_heuristic() {
        let cluster = TestCluster::start(2, test_config()).await;
        let key = "unconfirmed";
        let primary = cluster.primary_of(key);
        let backup = backup_of(&cluster, key);

        let top_ver = backup.ctx.barrier.ready_version();
        let near_xid = backup.ctx.versions.next(top_ver);
        let p = backup.ctx.affinity.partition(key);
        let prepared = primary
            .tm
            .on_near_prepare(
                backup.id(),
                NearPrepareRequest {
                    future_id: Uuid::new_v4(),
                    mini_id: 0,
                    topology_version: top_ver,
                    near_xid,
                    concurrency: Concurrency::Optimistic,
                    isolation: Isolation::ReadCommitted,
                    timeout_ms: 5_000,
                    writes: vec![TxEntry::new(key, p, TxOp::Update, Some(json!("applied")))],
                    reads: Vec::new(),
                    one_phase_commit: false,
                    require_all_partitions: false,
                    group_lock_key: None,
                },
            )
            .await;
        assert_eq!(prepared.state, TxState::Prepared);
        assert!(prepared.error.is_none());
        assert_eq!(backup.tm.stats().remote, 1);

        let backup_id = backup.id().clone();
        cluster.hub.drop_where(move |to: &NodeId, env: &Envelope| {
            to == &backup_id && matches!(env.message, CacheMessage::FinishRequest(_))
        });

        let finished = primary
            .tm
            .on_near_finish(
                backup.id(),
                NearFinishRequest {
                    future_id: Uuid::new_v4(),
                    mini_id: 0,
                    near_xid,
                    commit: true,
                },
            )
            .await;
        assert_eq!(finished.state, TxState::Unknown);
        assert!(finished.commit_version.is_some());
        assert!(
            matches!(finished.error, Some(CacheError::Heuristic(_))),
            "unexpected error: {:?}",
            finished.error
        );
        assert_eq!(stored(&primary, key), Some(json!("applied")));

        // The backup never got the finish and asks the primary instead.
        let resolved = backup.clone();
        wait_until("backup to apply the unconfirmed commit", move || {
            resolved.tm.stats().remote == 0 && stored(&resolved, key) == Some(json!("applied"))
        })
        .await;
        assert_eq!(
            backup.ctx.topology.local_partition(p, top_ver, false).unwrap().unwrap().version(key),
            finished.commit_version.unwrap()
        );

        cluster.hub.clear_filter();
        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_backup_salvaged_after_primary_failure() {
        let mut cluster = TestCluster::start(3, test_config()).await;
        let key = "abandoned";
        let primary = cluster.primary_of(key);
        let backup = backup_of(&cluster, key);

        // Only the departure may resolve it.
        cluster
            .hub
            .drop_where(|_: &NodeId, env: &Envelope| matches!(env.message, CacheMessage::TxStatusRequest(_)));

        let req = backup_prepare(&primary, key, json!("never"));
        let response = backup.tm.on_prepare(primary.id(), req).await;
        assert!(response.error.is_none());
        assert_eq!(backup.tm.stats().remote, 1);

        let idx = cluster
            .nodes
            .iter()
            .position(|n| n.id() == primary.id())
            .unwrap();
        cluster.fail_node(idx).await;

        let survivor = backup.clone();
        wait_until("orphaned backup tx to be salvaged", move || {
            survivor.tm.stats().remote == 0
        })
        .await;

        // No commit was decided, so nothing was applied.
        assert_eq!(backup.get(key).await.unwrap(), None);
        assert_eq!(cluster.store.get(key), None);
        cluster.hub.clear_filter();
        cluster.shutdown();
    }
}
