//! Backup and near-reader side of a transaction.
//!
//! Remote transactions take no locks: the primary serializes writers and sends the
//! already resolved values. Writes are applied only if newer than what is stored.
//! A prepared transaction that stops hearing from its primary asks it for the outcome.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

use super::core::{Transaction, TxResult};
use super::manager::{CompletedKey, TxManager};
use super::primary::reserve;
use super::types::{TxEntry, TxRole, TxState, TxVersion};
use crate::error::CacheError;
use crate::membership::types::NodeId;
use crate::messaging::protocol::{
    CacheMessage, FinishRequest, FinishResponse, PrepareRequest, PrepareResponse, TxStatusRequest,
};

fn prepare_response(future_id: Uuid, mini_id: u32, result: TxResult) -> PrepareResponse {
    PrepareResponse {
        future_id,
        mini_id,
        invalid_partitions: result.invalid_partitions,
        evicted_near_keys: result.evicted_near_keys,
        error: result.error,
    }
}

pub(crate) async fn on_prepare(
    tm: &Arc<TxManager>,
    from: &NodeId,
    req: PrepareRequest,
) -> PrepareResponse {
    let (future_id, mini_id) = (req.future_id, req.mini_id);

    if let Some(done) = tm.completed(&CompletedKey::new(TxRole::Backup, req.near_xid, from)) {
        return prepare_response(future_id, mini_id, done);
    }

    let tx = tm.remote_tx(from, &req);
    tx.touch();

    let (tm2, tx2) = (tm.clone(), tx.clone());
    let result = tx.prepare_once(move || prepare(tm2, tx2, req)).await;
    prepare_response(future_id, mini_id, result)
}

async fn prepare(tm: Arc<TxManager>, tx: Arc<Transaction>, req: PrepareRequest) -> TxResult {
    let ctx = &tm.ctx;
    if let Err(e) = tx.transition(TxState::Preparing) {
        return TxResult::failed(tx.state(), e);
    }

    if req.topology_version > ctx.barrier.ready_version()
        && let Err(e) = ctx
            .barrier
            .wait_for(req.topology_version, ctx.config.exchange_timeout)
            .await
    {
        return rollback(&tm, &tx, Some(e));
    }

    let mut invalid = BTreeSet::new();
    let mut writes = BTreeMap::new();
    for entry in req.writes {
        if invalid.contains(&entry.partition) {
            continue;
        }
        match reserve(ctx, &tx, entry.partition) {
            Ok(_) => {
                writes.insert(entry.key.clone(), entry);
            }
            Err(e) => {
                tracing::debug!("Tx {}: partition {} is invalid here: {}", tx.near_xid, entry.partition, e);
                invalid.insert(entry.partition);
            }
        }
    }

    // A near copy whose version moved on was updated by someone else; drop it.
    let mut evicted = Vec::new();
    let mut near_writes = BTreeMap::new();
    for entry in req.near_writes {
        let owned = req.owned_versions.get(&entry.key);
        match (ctx.near_get(&entry.key), owned) {
            (Some(cached), Some(version)) if cached.version == *version => {
                near_writes.insert(entry.key.clone(), entry);
            }
            _ => {
                ctx.near_evict(&entry.key);
                evicted.push(entry.key);
            }
        }
    }

    {
        let mut inner = tx.inner.lock();
        inner.writes = writes;
        inner.near_writes = near_writes;
        inner.invalid_partitions = invalid.clone();
    }
    tx.set_one_phase(req.one_phase_commit);

    if let Err(e) = tx.transition(TxState::Prepared) {
        return TxResult::failed(tx.state(), e);
    }

    let mut result = TxResult::ok(TxState::Prepared);
    if req.last && req.one_phase_commit {
        tx.decide_commit();
        let committed = commit(&tm, &tx, req.commit_version, None);
        result.state = committed.state;
        result.commit_version = committed.commit_version;
        result.error = committed.error;
    }
    result.invalid_partitions = invalid.into_iter().collect();
    result.evicted_near_keys = evicted;
    result
}

/// Applies the prepared writes at `commit_version`.
///
/// `near_writes` from the finish request replace the prepared ones, restricted to
/// keys this node still holds a matching near copy of.
fn commit(
    tm: &TxManager,
    tx: &Transaction,
    commit_version: Option<TxVersion>,
    near_writes: Option<Vec<TxEntry>>,
) -> TxResult {
    let ctx = &tm.ctx;
    if let Err(e) = tx.transition(TxState::Committing) {
        return TxResult::failed(tx.state(), e);
    }

    let version = commit_version.unwrap_or_else(|| ctx.versions.next(tx.topology_version()));
    ctx.versions.on_received(&version);

    let (writes, near) = {
        let mut inner = tx.inner.lock();
        inner.commit_version = Some(version);
        let near: Vec<TxEntry> = match near_writes {
            Some(entries) => entries
                .into_iter()
                .filter(|e| inner.near_writes.contains_key(&e.key))
                .collect(),
            None => inner.near_writes.values().cloned().collect(),
        };
        (inner.writes.values().cloned().collect::<Vec<_>>(), near)
    };

    for entry in &writes {
        let part = tx
            .inner
            .lock()
            .reservations
            .get(&entry.partition)
            .map(|r| r.partition().clone());
        if let Some(part) = part {
            part.apply(&entry.key, entry.value.clone(), version);
        }
    }
    for entry in &near {
        ctx.near_update(&entry.key, entry.value.clone(), version);
    }

    tx.release_reservations();
    let _ = tx.transition(TxState::Committed);

    let result = TxResult {
        commit_version: Some(version),
        invalid_partitions: tx.inner.lock().invalid_partitions.iter().copied().collect(),
        ..TxResult::ok(TxState::Committed)
    };
    tm.complete(tx, result.clone());
    result
}

fn rollback(tm: &TxManager, tx: &Transaction, error: Option<CacheError>) -> TxResult {
    if !tx.try_transition(TxState::RollingBack) {
        return TxResult {
            error,
            ..TxResult::ok(tx.state())
        };
    }

    tx.release_reservations();
    let _ = tx.transition(TxState::RolledBack);

    let result = TxResult {
        error,
        ..TxResult::ok(TxState::RolledBack)
    };
    tm.complete(tx, result.clone());
    result
}

pub(crate) async fn on_finish(tm: &Arc<TxManager>, from: &NodeId, req: FinishRequest) -> FinishResponse {
    let (future_id, mini_id) = (req.future_id, req.mini_id);

    // Transactions queued behind this one are alive even if idle here.
    for pending in &req.pending_versions {
        if let Some(waiting) = tm.find_remote(*pending, from) {
            waiting.touch();
        }
    }

    let Some(tx) = tm.find_remote(req.near_xid, from) else {
        tracing::debug!("Finish for unknown tx {} from {}", req.near_xid, from);
        return FinishResponse {
            future_id,
            mini_id,
            error: None,
        };
    };
    tx.touch();

    let (tm2, tx2) = (tm.clone(), tx.clone());
    let result = if req.commit {
        tx.decide_commit();
        let (version, near_writes) = (req.commit_version, req.near_writes);
        tx.finish_once(move || async move { commit(&tm2, &tx2, version, Some(near_writes)) })
            .await
    } else {
        tx.finish_once(move || async move { rollback(&tm2, &tx2, None) })
            .await
    };

    FinishResponse {
        future_id,
        mini_id,
        error: result.error,
    }
}

/// Resolves a backup transaction whose primary left.
pub(crate) async fn salvage(tm: &Arc<TxManager>, tx: &Arc<Transaction>) {
    let commit_it = match tx.state() {
        TxState::Prepared => tx.commit_decided(),
        TxState::Active => false,
        _ => return,
    };

    tracing::info!(
        "Salvaging orphaned backup tx {} (primary={}): {}",
        tx.near_xid,
        tx.coordinator,
        if commit_it { "commit" } else { "rollback" }
    );

    let (tm2, tx2) = (tm.clone(), tx.clone());
    let result = if commit_it {
        let version = tx.inner.lock().commit_version;
        tx.finish_once(move || async move { commit(&tm2, &tx2, version, None) })
            .await
    } else {
        tx.finish_once(move || async move {
            let err = CacheError::Rollback(format!("primary {} left", tx2.coordinator));
            rollback(&tm2, &tx2, Some(err))
        })
        .await
    };
    tracing::debug!("Salvaged backup tx {} as {:?}", tx.near_xid, result.state);
}

/// Asks the primary how a prepared transaction ended when its finish never came.
pub(crate) async fn check_back(tm: &Arc<TxManager>, tx: &Arc<Transaction>) {
    let ctx = &tm.ctx;
    let response = ctx
        .request(&tx.coordinator, Uuid::new_v4(), ctx.config.network_timeout, |future_id, mini_id| {
            CacheMessage::TxStatusRequest(TxStatusRequest {
                future_id,
                mini_id,
                near_xid: tx.near_xid,
                near_node: tx.near_node.clone(),
            })
        })
        .await;

    let status = match response {
        Ok(CacheMessage::TxStatusResponse(r)) => r,
        Ok(other) => {
            tracing::warn!("Unexpected status reply from {}: {}", tx.coordinator, other.kind());
            return;
        }
        Err(e) => {
            tracing::debug!("Status of backup tx {} from {} unavailable: {}", tx.near_xid, tx.coordinator, e);
            return;
        }
    };

    let (tm2, tx2) = (tm.clone(), tx.clone());
    match status.committed {
        None => tx.touch(),
        Some(true) => {
            tracing::info!("Backup tx {} committed by {} without a finish; applying", tx.near_xid, tx.coordinator);
            tx.decide_commit();
            let version = status.commit_version;
            tx.finish_once(move || async move { commit(&tm2, &tx2, version, None) })
                .await;
        }
        Some(false) => {
            tracing::info!("Backup tx {} not committed by {}; rolling back", tx.near_xid, tx.coordinator);
            tx.finish_once(move || async move {
                let err = CacheError::Rollback(format!("primary {} did not commit", tx2.coordinator));
                rollback(&tm2, &tx2, Some(err))
            })
            .await;
        }
    }
}
