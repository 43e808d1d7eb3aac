//! Primary side of a transaction.
//!
//! The primary owns the locks for its keys. On prepare it validates reads, resolves
//! transforms against the current values, maps the resolved writes to backups and
//! near readers and sends them a prepare. Commit writes through to the store, applies
//! locally, finishes the participants and releases locks.

use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::core::{Transaction, TxMapping, TxResult};
use super::manager::{CompletedKey, TxManager};
use super::types::{Concurrency, Isolation, TxEntry, TxOp, TxOptions, TxRole, TxState, TxVersion};
use crate::error::{CacheError, CacheResult};
use crate::membership::types::NodeId;
use crate::messaging::protocol::{
    CacheMessage, FinishRequest, LockRequest, LockResponse, NearFinishRequest, NearFinishResponse,
    NearPrepareRequest, NearPrepareResponse, PrepareRequest, ReadEntry, TxStatusRequest,
    TxStatusResponse,
};
use crate::node::context::{CacheContext, unexpected};
use crate::node::reads;
use crate::topology::partition::LocalPartition;
use crate::topology::types::PartitionState;

// ============================================================
// SHARED HELPERS
// ============================================================

/// Local partition `p`, reserved for the lifetime of `tx`.
pub(crate) fn reserve(
    ctx: &CacheContext,
    tx: &Transaction,
    p: u32,
) -> CacheResult<Arc<LocalPartition>> {
    let mut inner = tx.inner.lock();
    if let Some(existing) = inner.reservations.get(&p)
        && existing.partition().state().is_active()
    {
        return Ok(existing.partition().clone());
    }

    let reservation = ctx.topology.reserve(p, tx.topology_version(), false)?;
    let part = reservation.partition().clone();
    inner.reservations.insert(p, reservation);
    Ok(part)
}

/// Waits for the exchange of `top_ver` and checks this node is still the primary of
/// every partition both then and now.
async fn check_primary(ctx: &CacheContext, top_ver: u64, partitions: &BTreeSet<u32>) -> CacheResult<()> {
    ctx.barrier
        .wait_for(top_ver, ctx.config.exchange_timeout)
        .await?;
    let current = ctx.barrier.ready_version();

    for p in partitions {
        let stale = !ctx.affinity.is_primary(*p, top_ver)
            || (current > top_ver && !ctx.affinity.is_primary(*p, current));
        if stale {
            tracing::debug!(
                "Not primary for partition {} at versions {}/{}",
                p,
                top_ver,
                current
            );
            return Err(CacheError::StaleTopology {
                requested: top_ver,
                current,
            });
        }
    }
    Ok(())
}

/// Pulls `key` from an owner when the local copy of its partition is still preloading.
async fn force_key(ctx: &CacheContext, part: &LocalPartition, key: &str, top_ver: u64) {
    if part.state() != PartitionState::Moving || part.entry(key).is_some() {
        return;
    }

    let owners = ctx.topology.owners(part.id(), Some(top_ver));
    for owner in owners.iter().filter(|n| *n != ctx.local_id()) {
        match reads::fetch_from(ctx, owner, key, top_ver, false, true).await {
            Ok(Some(entry)) => {
                if entry.version != TxVersion::ZERO {
                    part.apply(key, entry.value, entry.version);
                }
                return;
            }
            Ok(None) => continue,
            Err(e) => tracing::debug!("Force-key of '{}' from {} failed: {}", key, owner, e),
        }
    }
}

async fn read_for_update(
    ctx: &CacheContext,
    part: &LocalPartition,
    key: &str,
    top_ver: u64,
) -> CacheResult<ReadEntry> {
    force_key(ctx, part, key, top_ver).await;
    let entry = reads::read_local(ctx, part, key, top_ver).await?;
    ctx.versions.on_received(&entry.version);
    Ok(entry)
}

/// Key actually locked for `entry`: the group key when the entry is group locked.
fn lock_key(tx: &Transaction, entry: &TxEntry) -> String {
    match &tx.group_lock_key {
        Some(group) if entry.group_lock => group.clone(),
        _ => entry.key.clone(),
    }
}

fn release_locks(ctx: &CacheContext, tx: &Transaction) {
    let keys = std::mem::take(&mut tx.inner.lock().locked_keys);
    for key in keys {
        let p = ctx.affinity.partition(&key);
        let part = tx
            .inner
            .lock()
            .reservations
            .get(&p)
            .map(|r| r.partition().clone());
        let part = match part {
            Some(part) => Some(part),
            None => ctx.topology.local_partition(p, tx.topology_version(), false).ok().flatten(),
        };
        if let Some(part) = part {
            part.locks.unlock(&key, tx.near_xid);
        }
    }
}

fn finish_result(tx: &Transaction, state: TxState) -> TxResult {
    let inner = tx.inner.lock();
    TxResult {
        commit_version: inner.commit_version,
        excluded_keys: inner.excluded_keys.iter().cloned().collect(),
        invalid_partitions: inner.invalid_partitions.iter().copied().collect(),
        ..TxResult::ok(state)
    }
}

// ============================================================
// LOCKS
// ============================================================

pub(crate) async fn on_lock(tm: &Arc<TxManager>, from: &NodeId, req: LockRequest) -> LockResponse {
    let (future_id, mini_id) = (req.future_id, req.mini_id);

    match lock(tm, from, &req).await {
        Ok(entry) => LockResponse {
            future_id,
            mini_id,
            value: entry.value,
            version: entry.version,
            error: None,
        },
        Err(e) => {
            tracing::debug!("Lock of '{}' for tx {} failed: {}", req.key, req.near_xid, e);
            LockResponse {
                future_id,
                mini_id,
                value: None,
                version: TxVersion::ZERO,
                error: Some(e),
            }
        }
    }
}

async fn lock(tm: &Arc<TxManager>, from: &NodeId, req: &LockRequest) -> CacheResult<ReadEntry> {
    let ctx = &tm.ctx;
    ctx.ensure_assignment(req.topology_version, from).await?;
    check_primary(ctx, req.topology_version, &BTreeSet::from([req.partition])).await?;

    let timeout = Duration::from_millis(req.timeout_ms);
    let options = TxOptions {
        timeout: Some(timeout),
        require_all_partitions: req.require_all_partitions,
        group_lock_key: req.group_lock_key.clone(),
        ..TxOptions::new(Concurrency::Pessimistic, req.isolation)
    };
    let tx = tm.primary_tx(from, req.near_xid, req.topology_version, &options)?;
    tx.check_usable()?;
    tx.touch();

    let part = reserve(ctx, &tx, req.partition)?;
    part.locks
        .lock(&req.key, tx.near_xid, timeout.min(ctx.config.lock_timeout))
        .await?;
    tx.inner.lock().locked_keys.insert(req.key.clone());

    // Rolled back while waiting for the lock.
    if tx.state() != TxState::Active {
        part.locks.unlock(&req.key, tx.near_xid);
        tx.inner.lock().locked_keys.remove(&req.key);
        return Err(CacheError::Rollback(format!(
            "transaction {} finished while waiting for a lock",
            tx.near_xid
        )));
    }

    read_for_update(ctx, &part, &req.key, tx.topology_version()).await
}

// ============================================================
// PREPARE
// ============================================================

fn prepare_response(future_id: Uuid, mini_id: u32, result: TxResult) -> NearPrepareResponse {
    NearPrepareResponse {
        future_id,
        mini_id,
        state: result.state,
        commit_version: result.commit_version,
        excluded_keys: result.excluded_keys,
        error: result.error,
    }
}

pub(crate) async fn on_near_prepare(
    tm: &Arc<TxManager>,
    from: &NodeId,
    req: NearPrepareRequest,
) -> NearPrepareResponse {
    let (future_id, mini_id) = (req.future_id, req.mini_id);

    if let Some(done) = tm.completed(&CompletedKey::new(TxRole::Primary, req.near_xid, from)) {
        return prepare_response(future_id, mini_id, done);
    }

    let options = TxOptions {
        timeout: Some(Duration::from_millis(req.timeout_ms)),
        require_all_partitions: req.require_all_partitions,
        group_lock_key: req.group_lock_key.clone(),
        ..TxOptions::new(req.concurrency, req.isolation)
    };
    let tx = match tm.primary_tx(from, req.near_xid, req.topology_version, &options) {
        Ok(tx) => tx,
        Err(e) => return prepare_response(future_id, mini_id, TxResult::failed(TxState::RolledBack, e)),
    };
    tx.touch();

    let (tm2, tx2) = (tm.clone(), tx.clone());
    let result = tx.prepare_once(move || prepare(tm2, tx2, req)).await;
    prepare_response(future_id, mini_id, result)
}

async fn prepare(tm: Arc<TxManager>, tx: Arc<Transaction>, req: NearPrepareRequest) -> TxResult {
    tx.set_one_phase(req.one_phase_commit);

    match prepare_entries(&tm, &tx, req).await {
        Ok(()) if tx.is_one_phase() => commit(&tm, &tx).await,
        Ok(()) => finish_result(&tx, TxState::Prepared),
        Err(e) => {
            tracing::debug!("Prepare of tx {} failed: {}", tx.near_xid, e);
            rollback(&tm, &tx, Some(e)).await
        }
    }
}

async fn prepare_entries(tm: &TxManager, tx: &Transaction, req: NearPrepareRequest) -> CacheResult<()> {
    let ctx = &tm.ctx;
    tx.transition(TxState::Preparing)?;

    if tx.is_timed_out() {
        return Err(CacheError::Timeout(format!("transaction {} timed out", tx.near_xid)));
    }

    let top_ver = tx.topology_version();
    ctx.ensure_assignment(top_ver, &tx.near_node).await?;

    let partitions: BTreeSet<u32> = req
        .writes
        .iter()
        .chain(req.reads.iter())
        .map(|e| e.partition)
        .collect();
    check_primary(ctx, top_ver, &partitions).await?;

    // Locks are taken in key order; pessimistic keys are already held and re-enter.
    let mut to_lock: BTreeMap<String, u32> = BTreeMap::new();
    for entry in &req.writes {
        to_lock.insert(lock_key(tx, entry), entry.partition);
    }
    if tx.is_optimistic() && tx.isolation == Isolation::Serializable {
        for entry in &req.reads {
            to_lock.insert(lock_key(tx, entry), entry.partition);
        }
    }

    let lock_timeout = tx.remaining().min(ctx.config.lock_timeout);
    for (key, p) in to_lock {
        let part = reserve(ctx, tx, p)?;
        part.locks.lock(&key, tx.near_xid, lock_timeout).await?;
        tx.inner.lock().locked_keys.insert(key);
    }

    if tx.is_optimistic() && tx.tracks_reads() {
        for read in &req.reads {
            let Some(expected) = read.read_version else {
                continue;
            };
            let part = reserve(ctx, tx, read.partition)?;
            force_key(ctx, &part, &read.key, top_ver).await;
            let actual = part.version(&read.key);
            if actual != expected {
                return Err(CacheError::OptimisticConflict {
                    key: read.key.clone(),
                    expected,
                    actual,
                });
            }
        }
    }

    // Resolve transforms against the locked values.
    let mut resolved = Vec::with_capacity(req.writes.len());
    for mut entry in req.writes {
        let part = reserve(ctx, tx, entry.partition)?;
        let current = read_for_update(ctx, &part, &entry.key, top_ver).await?;

        match entry.op.clone() {
            TxOp::Transform(delta) => {
                entry.value = Some(delta.apply(current.value.as_ref())?);
                entry.op = TxOp::Update;
            }
            TxOp::Delete => entry.value = None,
            TxOp::Update => {}
            TxOp::Read => continue,
        }
        resolved.push(entry);
    }

    let mappings = map_participants(ctx, tx, &resolved, top_ver)?;
    let participants_commit = tx.is_one_phase() && mappings.len() <= 1;
    let commit_version = participants_commit
        .then(|| ctx.versions.next(top_ver.max(ctx.topology.topology_version())));

    {
        let mut inner = tx.inner.lock();
        inner.writes = resolved.into_iter().map(|e| (e.key.clone(), e)).collect();
        inner.reads = req.reads.into_iter().map(|e| (e.key.clone(), e)).collect();
        inner.commit_version = commit_version;
        inner.participants_committed = participants_commit && !mappings.is_empty();
        inner.mappings = mappings.clone();
    }

    let future_id = Uuid::new_v4();
    let requests = mappings.iter().map(|(node, mapping)| async move {
        let response = ctx
            .request(node, future_id, ctx.config.network_timeout, |future_id, mini_id| {
                CacheMessage::PrepareRequest(PrepareRequest {
                    future_id,
                    mini_id,
                    topology_version: top_ver,
                    near_xid: tx.near_xid,
                    near_node: tx.near_node.clone(),
                    isolation: tx.isolation,
                    timeout_ms: tx.remaining().as_millis() as u64,
                    writes: mapping.writes.clone(),
                    near_writes: mapping.near_writes.clone(),
                    owned_versions: mapping.owned_versions.clone(),
                    last: true,
                    one_phase_commit: participants_commit,
                    commit_version,
                    group_lock_key: tx.group_lock_key.clone(),
                })
            })
            .await;
        (node.clone(), response)
    });

    for (node, response) in join_all(requests).await {
        let response = match response? {
            CacheMessage::PrepareResponse(r) => r,
            other => return Err(unexpected(&other)),
        };
        if let Some(e) = response.error {
            return Err(e);
        }

        for p in response.invalid_partitions {
            exclude_partition(tx, &node, p)?;
        }
        for key in response.evicted_near_keys {
            let p = ctx.affinity.partition(&key);
            if let Ok(part) = reserve(ctx, tx, p) {
                part.remove_reader(&key, &node);
            }
            if let Some(m) = tx.inner.lock().mappings.get_mut(&node) {
                m.near_writes.retain(|e| e.key != key);
            }
        }
    }

    tx.transition(TxState::Prepared)?;
    Ok(())
}

/// Backups and near readers that must see the resolved writes.
fn map_participants(
    ctx: &CacheContext,
    tx: &Transaction,
    writes: &[TxEntry],
    top_ver: u64,
) -> CacheResult<BTreeMap<NodeId, TxMapping>> {
    let local = ctx.local_id();
    let mut mappings: BTreeMap<NodeId, TxMapping> = BTreeMap::new();

    for entry in writes {
        let part = reserve(ctx, tx, entry.partition)?;

        let backups: Vec<NodeId> = ctx
            .topology
            .nodes(entry.partition, top_ver)
            .into_iter()
            .filter(|n| n != local && !ctx.discovery.has_departed(n))
            .collect();
        for node in &backups {
            mappings.entry(node.clone()).or_default().writes.push(entry.clone());
        }

        for reader in part.readers(&entry.key) {
            if &reader == local
                || reader == tx.near_node
                || backups.contains(&reader)
                || ctx.discovery.has_departed(&reader)
            {
                continue;
            }
            let mapping = mappings.entry(reader).or_default();
            mapping.near_writes.push(entry.clone());
            mapping
                .owned_versions
                .insert(entry.key.clone(), part.version(&entry.key));
        }
    }

    Ok(mappings)
}

/// A backup no longer holds `p`: its keys are excluded from that backup.
fn exclude_partition(tx: &Transaction, node: &NodeId, p: u32) -> CacheResult<()> {
    let mut inner = tx.inner.lock();
    let keys: Vec<String> = inner
        .writes
        .values()
        .filter(|e| e.partition == p)
        .map(|e| e.key.clone())
        .collect();

    if tx.require_all_partitions && !keys.is_empty() {
        return Err(CacheError::InvalidPartition {
            partition: p,
            reason: format!("backup {} no longer holds it", node),
        });
    }

    tracing::debug!("Tx {}: excluding {} key(s) of partition {} on {}", tx.near_xid, keys.len(), p, node);
    if let Some(mapping) = inner.mappings.get_mut(node) {
        mapping.writes.retain(|e| e.partition != p);
    }
    inner.invalid_partitions.insert(p);
    inner.excluded_keys.extend(keys);
    Ok(())
}

// ============================================================
// COMMIT / ROLLBACK
// ============================================================

async fn write_through(ctx: &CacheContext, writes: &[TxEntry]) -> CacheResult<()> {
    if !ctx.config.write_through {
        return Ok(());
    }
    let Some(store) = ctx.store() else {
        return Ok(());
    };

    let puts: Vec<(String, serde_json::Value)> = writes
        .iter()
        .filter_map(|e| e.value.clone().map(|v| (e.key.clone(), v)))
        .collect();
    let removes: Vec<String> = writes
        .iter()
        .filter(|e| e.value.is_none())
        .map(|e| e.key.clone())
        .collect();

    if !puts.is_empty() {
        store.put_all(&puts).await?;
    }
    if !removes.is_empty() {
        store.remove_all(&removes).await?;
    }
    Ok(())
}

/// Sends the outcome to every participant and returns the ones that did not confirm.
async fn finish_participants(ctx: &CacheContext, tx: &Transaction, commit: bool) -> Vec<(NodeId, CacheError)> {
    let (mappings, commit_version, pending_versions) = {
        let inner = tx.inner.lock();
        let mut pending = BTreeSet::new();
        for key in &inner.locked_keys {
            let p = ctx.affinity.partition(key);
            if let Some(r) = inner.reservations.get(&p) {
                pending.extend(r.partition().locks.waiters(key));
            }
        }
        (
            inner.mappings.clone(),
            inner.commit_version,
            pending.into_iter().collect::<Vec<_>>(),
        )
    };

    let future_id = Uuid::new_v4();
    let pending_versions = &pending_versions;
    let requests = mappings
        .iter()
        .filter(|(node, mapping)| !mapping.is_empty() && !ctx.discovery.has_departed(node))
        .map(|(node, mapping)| async move {
            let response = ctx
                .request(node, future_id, ctx.config.network_timeout, |future_id, mini_id| {
                    CacheMessage::FinishRequest(FinishRequest {
                        future_id,
                        mini_id,
                        topology_version: tx.topology_version(),
                        near_xid: tx.near_xid,
                        commit,
                        near_writes: mapping.near_writes.clone(),
                        isolation: tx.isolation,
                        one_phase_commit: false,
                        pending_versions: pending_versions.clone(),
                        commit_version,
                    })
                })
                .await;

            let error = match response {
                Ok(CacheMessage::FinishResponse(r)) => r.error,
                Ok(other) => Some(unexpected(&other)),
                Err(e) => Some(e),
            };
            error.map(|e| (node.clone(), e))
        });

    let failures: Vec<(NodeId, CacheError)> = join_all(requests).await.into_iter().flatten().collect();
    for (node, e) in &failures {
        tracing::warn!(
            "Failed to {} tx {} on {}: {}",
            if commit { "commit" } else { "roll back" },
            tx.near_xid,
            node,
            e
        );
    }
    failures
}

pub(crate) async fn commit(tm: &TxManager, tx: &Transaction) -> TxResult {
    let ctx = &tm.ctx;
    if let Err(e) = tx.transition(TxState::Committing) {
        return TxResult::failed(tx.state(), e);
    }
    tx.decide_commit();

    let (writes, participants_committed) = {
        let mut inner = tx.inner.lock();
        if inner.commit_version.is_none() {
            let version = ctx
                .versions
                .next(tx.topology_version().max(ctx.topology.topology_version()));
            inner.commit_version = Some(version);
        }
        (
            inner.writes.values().cloned().collect::<Vec<_>>(),
            inner.participants_committed,
        )
    };

    if let Err(e) = write_through(ctx, &writes).await {
        tracing::error!("Store write for tx {} failed: {}", tx.near_xid, e);
        if !participants_committed {
            let _ = finish_participants(ctx, tx, false).await;
        }
        release_locks(ctx, tx);
        tx.release_reservations();
        let _ = tx.transition(TxState::Unknown);

        let result = TxResult::failed(
            TxState::Unknown,
            CacheError::Heuristic(format!("store write failed: {}", e)),
        );
        tm.complete(tx, result.clone());
        return result;
    }

    let commit_version = tx.inner.lock().commit_version.unwrap_or(TxVersion::ZERO);
    for entry in &writes {
        let part = tx
            .inner
            .lock()
            .reservations
            .get(&entry.partition)
            .map(|r| r.partition().clone());
        match part {
            Some(part) => {
                part.apply(&entry.key, entry.value.clone(), commit_version);
            }
            None => tracing::warn!("Tx {}: partition {} not reserved", tx.near_xid, entry.partition),
        }
    }

    let failures = if participants_committed {
        Vec::new()
    } else {
        finish_participants(ctx, tx, true).await
    };

    release_locks(ctx, tx);
    tx.release_reservations();

    // Applied here but not confirmed everywhere: the backups find out by asking.
    if !failures.is_empty() {
        let _ = tx.transition(TxState::Unknown);
        let nodes: Vec<String> = failures.iter().map(|(n, e)| format!("{} ({})", n, e)).collect();
        let result = TxResult {
            error: Some(CacheError::Heuristic(format!(
                "commit not confirmed by {}",
                nodes.join(", ")
            ))),
            ..finish_result(tx, TxState::Unknown)
        };
        tm.complete(tx, result.clone());
        return result;
    }

    let _ = tx.transition(TxState::Committed);
    let result = finish_result(tx, TxState::Committed);
    tm.complete(tx, result.clone());
    result
}

pub(crate) async fn rollback(tm: &TxManager, tx: &Transaction, error: Option<CacheError>) -> TxResult {
    let ctx = &tm.ctx;
    if !tx.try_transition(TxState::RollingBack) {
        let state = tx.state();
        return match error {
            Some(e) => TxResult::failed(state, e),
            None => TxResult::ok(state),
        };
    }

    // Participants that miss the rollback drop the transaction once they ask back.
    let _ = finish_participants(ctx, tx, false).await;
    release_locks(ctx, tx);
    tx.release_reservations();
    let _ = tx.transition(TxState::RolledBack);

    let result = match error {
        Some(e) => TxResult::failed(TxState::RolledBack, e),
        None => TxResult::ok(TxState::RolledBack),
    };
    tm.complete(tx, result.clone());
    result
}

// ============================================================
// FINISH
// ============================================================

fn finish_response(future_id: Uuid, mini_id: u32, result: TxResult) -> NearFinishResponse {
    NearFinishResponse {
        future_id,
        mini_id,
        state: result.state,
        commit_version: result.commit_version,
        excluded_keys: result.excluded_keys,
        error: result.error,
    }
}

pub(crate) async fn on_near_finish(
    tm: &Arc<TxManager>,
    from: &NodeId,
    req: NearFinishRequest,
) -> NearFinishResponse {
    let (future_id, mini_id) = (req.future_id, req.mini_id);

    let Some(tx) = tm.find_primary(&req.near_xid) else {
        let result = match tm.completed(&CompletedKey::new(TxRole::Primary, req.near_xid, from)) {
            Some(done) => done,
            None if !req.commit => TxResult::ok(TxState::RolledBack),
            None => TxResult::failed(
                TxState::RolledBack,
                CacheError::Rollback(format!("transaction {} is unknown", req.near_xid)),
            ),
        };
        return finish_response(future_id, mini_id, result);
    };
    tx.touch();

    let tm2 = tm.clone();
    let tx2 = tx.clone();
    let result = if req.commit {
        tx.finish_once(move || async move {
            match tx2.state() {
                TxState::Prepared => commit(&tm2, &tx2).await,
                state => TxResult::failed(state, CacheError::invalid_state(state, "commit")),
            }
        })
        .await
    } else {
        tx.finish_once(move || async move { rollback(&tm2, &tx2, None).await })
            .await
    };

    finish_response(future_id, mini_id, result)
}

/// Tells a backup how a transaction ended here.
///
/// A remembered result with a commit version means the writes were applied locally,
/// even if the outcome was reported as unknown to the near node.
pub(crate) fn on_status(tm: &TxManager, req: TxStatusRequest) -> TxStatusResponse {
    let (future_id, mini_id) = (req.future_id, req.mini_id);
    if tm.find_primary(&req.near_xid).is_some() {
        return TxStatusResponse {
            future_id,
            mini_id,
            committed: None,
            commit_version: None,
        };
    }

    let done = tm.completed(&CompletedKey::new(TxRole::Primary, req.near_xid, &req.near_node));
    let commit_version = done.as_ref().and_then(|r| match r.state {
        TxState::Committed | TxState::Unknown => r.commit_version,
        _ => None,
    });
    TxStatusResponse {
        future_id,
        mini_id,
        committed: Some(commit_version.is_some()),
        commit_version,
    }
}

// ============================================================
// SWEEPER
// ============================================================

/// Rolls back a primary transaction that ran past its timeout.
pub(crate) async fn expire(tm: &Arc<TxManager>, tx: &Arc<Transaction>) {
    tx.set_rollback_only();
    let (tm2, tx2) = (tm.clone(), tx.clone());
    tx.finish_once(move || async move {
        let err = CacheError::Timeout(format!("transaction {} timed out", tx2.near_xid));
        rollback(&tm2, &tx2, Some(err)).await
    })
    .await;
}

/// Resolves a primary transaction whose near node left.
///
/// A transaction the near node already decided to commit, or one prepared for a single
/// phase commit, is committed; anything else is rolled back.
pub(crate) async fn salvage(tm: &Arc<TxManager>, tx: &Arc<Transaction>) {
    let commit_it = match tx.state() {
        TxState::Prepared => tx.commit_decided() || tx.is_one_phase(),
        TxState::Active => false,
        _ => return,
    };

    tracing::info!(
        "Salvaging orphaned tx {} (near={}): {}",
        tx.near_xid,
        tx.near_node,
        if commit_it { "commit" } else { "rollback" }
    );

    let (tm2, tx2) = (tm.clone(), tx.clone());
    let result = if commit_it {
        tx.finish_once(move || async move { commit(&tm2, &tx2).await })
            .await
    } else {
        tx.finish_once(move || async move {
            let err = CacheError::Rollback(format!("near node {} left", tx2.near_node));
            rollback(&tm2, &tx2, Some(err)).await
        })
        .await
    };
    tracing::debug!("Salvaged tx {} as {:?}", tx.near_xid, result.state);
}
