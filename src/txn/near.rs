use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

use super::core::{Transaction, TxResult};
use super::manager::TxManager;
use super::types::{Delta, TxEntry, TxOp, TxOutcome, TxState, TxVersion};
use crate::error::{CacheError, CacheResult};
use crate::membership::types::NodeId;
use crate::messaging::protocol::{
    CacheMessage, LockRequest, NearFinishRequest, NearPrepareRequest, ReadEntry,
};
use crate::node::context::unexpected;
use crate::node::reads;

/// A transaction started on this node.
///
/// Reads and writes are routed to the primary of each key at the pinned topology
/// version. Pessimistic transactions lock keys on their primary as they are touched;
/// optimistic ones record read versions and let the primaries lock and validate at
/// commit. Dropping an unfinished handle rolls the transaction back.
pub struct NearTx {
    tm: Arc<TxManager>,
    tx: Arc<Transaction>,
}

impl NearTx {
    pub(crate) fn new(tm: Arc<TxManager>, tx: Arc<Transaction>) -> Self {
        Self { tm, tx }
    }

    pub fn xid(&self) -> TxVersion {
        self.tx.near_xid
    }

    pub fn state(&self) -> TxState {
        self.tx.state()
    }

    pub fn topology_version(&self) -> u64 {
        self.tx.topology_version()
    }

    pub async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        self.tx.check_usable()?;
        self.tx.touch();

        let pending = self.tx.inner.lock().writes.get(key).cloned();
        match pending {
            Some(TxEntry {
                op: TxOp::Transform(delta),
                ..
            }) => {
                let current = self.read(key).await?;
                delta.apply(current.as_ref()).map(Some)
            }
            Some(TxEntry {
                op: TxOp::Delete, ..
            }) => Ok(None),
            Some(entry) => Ok(entry.value),
            None => self.read(key).await,
        }
    }

    async fn read(&self, key: &str) -> CacheResult<Option<Value>> {
        let ctx = &self.tm.ctx;

        if self.tx.tracks_reads() {
            let seen = self.tx.inner.lock().reads.get(key).map(|e| e.value.clone());
            if let Some(value) = seen {
                return Ok(value);
            }
        }

        let p = ctx.affinity.partition(key);
        let entry = if !self.tx.is_optimistic() && self.tx.tracks_reads() {
            self.lock(key, p).await?
        } else {
            reads::fetch(ctx, key, self.tx.topology_version(), false).await?
        };

        if self.tx.tracks_reads() {
            let mut read = TxEntry::new(key, p, TxOp::Read, entry.value.clone());
            read.read_version = Some(entry.version);
            self.tx.inner.lock().reads.insert(key.to_string(), read);
        }
        Ok(entry.value)
    }

    pub async fn put(&self, key: &str, value: Value) -> CacheResult<()> {
        self.write(key, TxOp::Update, Some(value)).await
    }

    pub async fn remove(&self, key: &str) -> CacheResult<()> {
        self.write(key, TxOp::Delete, None).await
    }

    /// Queues `delta` to be applied by the primary to the value current at commit.
    pub async fn transform(&self, key: &str, delta: Delta) -> CacheResult<()> {
        self.write(key, TxOp::Transform(delta), None).await
    }

    async fn write(&self, key: &str, op: TxOp, value: Option<Value>) -> CacheResult<()> {
        self.tx.check_usable()?;
        self.tx.touch();

        let ctx = &self.tm.ctx;
        let p = ctx.affinity.partition(key);
        let mut entry = TxEntry::new(key, p, op, value);
        entry.group_lock = self.group_locked(p);

        if !self.tx.is_optimistic() {
            self.lock(key, p).await?;
            entry.lock_version = Some(self.tx.near_xid);
        }

        let mut inner = self.tx.inner.lock();
        let entry = match inner.writes.get(key) {
            Some(previous) => fold(previous, entry)?,
            None => entry,
        };
        inner.writes.insert(key.to_string(), entry);
        Ok(())
    }

    fn group_locked(&self, p: u32) -> bool {
        self.tx
            .group_lock_key
            .as_ref()
            .is_some_and(|g| self.tm.ctx.affinity.partition(g) == p)
    }

    /// Locks `key` (or its group) on the primary and returns the locked value.
    async fn lock(&self, key: &str, p: u32) -> CacheResult<ReadEntry> {
        let ctx = &self.tm.ctx;
        let top_ver = self.tx.topology_version();

        let lock_key = match &self.tx.group_lock_key {
            Some(group) if self.group_locked(p) => group.clone(),
            _ => key.to_string(),
        };
        let already_locked = self.tx.inner.lock().locked_keys.contains(&lock_key);
        if already_locked && lock_key != key {
            return reads::fetch(ctx, key, top_ver, false).await;
        }

        let primary = ctx.affinity.primary(p, top_ver).ok_or_else(|| {
            CacheError::Topology(format!("no primary for partition {} at version {}", p, top_ver))
        })?;
        self.tx.inner.lock().primaries.insert(primary.clone());

        let timeout = self.tx.remaining();
        let response = ctx
            .request(
                &primary,
                Uuid::new_v4(),
                timeout.max(ctx.config.network_timeout),
                |future_id, mini_id| {
                    CacheMessage::LockRequest(LockRequest {
                        future_id,
                        mini_id,
                        topology_version: top_ver,
                        near_xid: self.tx.near_xid,
                        isolation: self.tx.isolation,
                        timeout_ms: timeout.as_millis() as u64,
                        key: lock_key.clone(),
                        partition: p,
                        require_all_partitions: self.tx.require_all_partitions,
                        group_lock_key: self.tx.group_lock_key.clone(),
                    })
                },
            )
            .await;

        let error = match response {
            Ok(CacheMessage::LockResponse(r)) => match r.error {
                None => {
                    self.tx.inner.lock().locked_keys.insert(lock_key.clone());
                    if lock_key != key {
                        return reads::fetch(ctx, key, top_ver, false).await;
                    }
                    return Ok(ReadEntry {
                        key: key.to_string(),
                        value: r.value,
                        version: r.version,
                    });
                }
                Some(e) => e,
            },
            Ok(other) => unexpected(&other),
            Err(e) => e,
        };

        tracing::debug!("Tx {}: lock of '{}' failed: {}", self.tx.near_xid, lock_key, error);
        self.tx.set_rollback_only();
        Err(error)
    }

    pub async fn commit(self) -> CacheResult<TxOutcome> {
        let mut tx = self.tx.clone();

        if let Err(e) = tx.check_usable() {
            if tx.state() == TxState::Active {
                abort(&self.tm, &tx).await;
            }
            return Err(e);
        }

        let mut remapped = false;
        loop {
            match commit_attempt(&self.tm, &tx).await {
                Err(CacheError::StaleTopology { current, .. }) if tx.is_optimistic() && !remapped => {
                    remapped = true;
                    tracing::info!(
                        "Remapping optimistic tx {} to topology version {}",
                        tx.near_xid,
                        current
                    );
                    tx = remap(&self.tm, &tx, current).await?;
                }
                other => return other,
            }
        }
    }

    pub async fn rollback(self) -> CacheResult<TxOutcome> {
        let state = self.tx.state();
        if state != TxState::Active {
            return Err(CacheError::invalid_state(state, "rollback"));
        }
        abort(&self.tm, &self.tx).await;
        Ok(self.tx.outcome())
    }
}

impl Drop for NearTx {
    fn drop(&mut self) {
        if self.tx.state() != TxState::Active {
            return;
        }
        tracing::debug!("Tx {} dropped while active; rolling back", self.tx.near_xid);
        let (tm, tx) = (self.tm.clone(), self.tx.clone());
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { abort(&tm, &tx).await });
        }
    }
}

/// Merges a new write into a pending write of the same key.
fn fold(previous: &TxEntry, mut next: TxEntry) -> CacheResult<TxEntry> {
    let TxOp::Transform(delta) = &next.op else {
        return Ok(next);
    };

    next.op = match (&previous.op, delta) {
        (TxOp::Update, _) => {
            next.value = Some(delta.apply(previous.value.as_ref())?);
            TxOp::Update
        }
        (TxOp::Delete, _) => {
            next.value = Some(delta.apply(None)?);
            TxOp::Update
        }
        (TxOp::Transform(Delta::Add(a)), Delta::Add(b)) => TxOp::Transform(Delta::Add(a + b)),
        (TxOp::Transform(Delta::Append(a)), Delta::Append(b)) => {
            TxOp::Transform(Delta::Append(format!("{}{}", a, b)))
        }
        (TxOp::Transform(_), _) => {
            return Err(CacheError::Serialization(format!(
                "cannot combine transforms of different kinds on '{}'",
                next.key
            )));
        }
        (TxOp::Read, _) => next.op.clone(),
    };
    next.read_version = previous.read_version;
    Ok(next)
}

/// Asks every contacted primary to roll back and closes the transaction.
async fn abort(tm: &TxManager, tx: &Transaction) {
    if !tx.try_transition(TxState::RollingBack) {
        return;
    }
    finish_primaries(tm, tx, false).await;
    let _ = tx.transition(TxState::RolledBack);
    tm.complete(tx, TxResult::ok(TxState::RolledBack));
}

struct FinishOutcome {
    commit_versions: BTreeMap<NodeId, TxVersion>,
    excluded_keys: BTreeSet<String>,
    error: Option<(TxState, CacheError)>,
}

async fn finish_primaries(tm: &TxManager, tx: &Transaction, commit: bool) -> FinishOutcome {
    let ctx = &tm.ctx;
    let primaries = tx.inner.lock().primaries.clone();
    let mut outcome = FinishOutcome {
        commit_versions: BTreeMap::new(),
        excluded_keys: BTreeSet::new(),
        error: None,
    };

    let future_id = Uuid::new_v4();
    let mut requests = Vec::new();
    for node in primaries {
        if ctx.discovery.has_departed(&node) {
            if commit {
                outcome.error = Some((
                    TxState::Unknown,
                    CacheError::Heuristic(format!("primary {} left before commit", node)),
                ));
            }
            continue;
        }

        requests.push(async move {
            let response = ctx
                .request(&node, future_id, ctx.config.network_timeout, |future_id, mini_id| {
                    CacheMessage::NearFinishRequest(NearFinishRequest {
                        future_id,
                        mini_id,
                        near_xid: tx.near_xid,
                        commit,
                    })
                })
                .await;
            (node, response)
        });
    }

    for (node, response) in join_all(requests).await {
        match response {
            Ok(CacheMessage::NearFinishResponse(r)) => {
                outcome.excluded_keys.extend(r.excluded_keys);
                if let Some(v) = r.commit_version {
                    outcome.commit_versions.insert(node.clone(), v);
                }
                // Other primaries may already have committed.
                if let Some(e) = r.error
                    && commit
                {
                    outcome.error = Some((TxState::Unknown, e));
                }
            }
            Ok(other) if commit => outcome.error = Some((TxState::Unknown, unexpected(&other))),
            Err(e) if commit => {
                outcome.error = Some((
                    TxState::Unknown,
                    CacheError::Heuristic(format!("commit on primary {} not confirmed: {}", node, e)),
                ))
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("Rollback of tx {} on {} failed: {}", tx.near_xid, node, e),
        }
    }

    outcome
}

type Groups = BTreeMap<NodeId, (Vec<TxEntry>, Vec<TxEntry>)>;

/// Groups the transaction's entries by primary at the pinned topology version.
fn group_by_primary(tm: &TxManager, tx: &Transaction) -> CacheResult<Groups> {
    let ctx = &tm.ctx;
    let top_ver = tx.topology_version();
    let inner = tx.inner.lock();
    let mut groups: Groups = BTreeMap::new();

    let primary_of = |entry: &TxEntry| {
        ctx.affinity.primary(entry.partition, top_ver).ok_or_else(|| {
            CacheError::Topology(format!(
                "no primary for partition {} at version {}",
                entry.partition, top_ver
            ))
        })
    };

    for entry in inner.writes.values() {
        groups.entry(primary_of(entry)?).or_default().0.push(entry.clone());
    }
    if tx.is_optimistic() && tx.tracks_reads() {
        for entry in inner.reads.values() {
            groups.entry(primary_of(entry)?).or_default().1.push(entry.clone());
        }
    }
    // Primaries holding our locks must hear about the outcome too.
    for node in &inner.primaries {
        groups.entry(node.clone()).or_default();
    }
    Ok(groups)
}

async fn commit_attempt(tm: &TxManager, tx: &Transaction) -> CacheResult<TxOutcome> {
    let ctx = &tm.ctx;
    tx.transition(TxState::Preparing)?;

    let groups = match group_by_primary(tm, tx) {
        Ok(groups) => groups,
        Err(e) => {
            fail(tm, tx).await;
            return Err(e);
        }
    };

    if groups.is_empty() {
        let _ = tx.transition(TxState::Prepared);
        let _ = tx.transition(TxState::Committing);
        let _ = tx.transition(TxState::Committed);
        let outcome = tx.outcome();
        tm.complete(tx, TxResult::ok(TxState::Committed));
        return Ok(outcome);
    }

    let one_phase = ctx.config.one_phase_commit && groups.len() == 1;
    let top_ver = tx.topology_version();
    let future_id = Uuid::new_v4();

    let mut commit_versions: BTreeMap<NodeId, TxVersion> = BTreeMap::new();
    let mut excluded = BTreeSet::new();

    for (node, (writes, reads)) in &groups {
        tx.inner.lock().primaries.insert(node.clone());

        let response = ctx
            .request(
                node,
                future_id,
                tx.remaining().max(ctx.config.network_timeout),
                |future_id, mini_id| {
                    CacheMessage::NearPrepareRequest(NearPrepareRequest {
                        future_id,
                        mini_id,
                        topology_version: top_ver,
                        near_xid: tx.near_xid,
                        concurrency: tx.concurrency,
                        isolation: tx.isolation,
                        timeout_ms: tx.remaining().as_millis() as u64,
                        writes: writes.clone(),
                        reads: reads.clone(),
                        one_phase_commit: one_phase,
                        require_all_partitions: tx.require_all_partitions,
                        group_lock_key: tx.group_lock_key.clone(),
                    })
                },
            )
            .await;

        let response = match response {
            Ok(CacheMessage::NearPrepareResponse(r)) => r,
            Ok(other) => {
                fail(tm, tx).await;
                return Err(unexpected(&other));
            }
            Err(e) => {
                fail(tm, tx).await;
                return Err(e);
            }
        };

        if let Some(e) = response.error {
            if response.state == TxState::Unknown {
                let _ = tx.transition(TxState::Unknown);
                tm.complete(tx, TxResult::failed(TxState::Unknown, e.clone()));
                return Err(e);
            }
            fail(tm, tx).await;
            return Err(e);
        }

        excluded.extend(response.excluded_keys);
        if let Some(v) = response.commit_version {
            commit_versions.insert(node.clone(), v);
        }
    }

    tx.transition(TxState::Prepared)?;
    tx.transition(TxState::Committing)?;

    if !one_phase {
        let finished = finish_primaries(tm, tx, true).await;
        excluded.extend(finished.excluded_keys);
        commit_versions.extend(finished.commit_versions);

        if let Some((state, e)) = finished.error {
            tracing::error!("Tx {} ended in {:?}: {}", tx.near_xid, state, e);
            let _ = tx.transition(state);
            tm.complete(tx, TxResult::failed(state, e.clone()));
            return Err(e);
        }
    }

    // Keep our own read copies current.
    for (node, (writes, _)) in &groups {
        let Some(version) = commit_versions.get(node) else {
            continue;
        };
        for entry in writes {
            match &entry.op {
                TxOp::Update | TxOp::Delete => {
                    ctx.near_update(&entry.key, entry.value.clone(), *version);
                }
                TxOp::Transform(_) => ctx.near_evict(&entry.key),
                TxOp::Read => {}
            }
        }
    }

    tx.inner.lock().excluded_keys.extend(excluded);
    let _ = tx.transition(TxState::Committed);
    let outcome = tx.outcome();
    tm.complete(tx, TxResult::ok(TxState::Committed));
    tracing::debug!("Committed tx {} on {} primary node(s)", tx.near_xid, groups.len());
    Ok(outcome)
}

/// Rolls back a failed attempt on every primary it reached.
async fn fail(tm: &TxManager, tx: &Transaction) {
    if tx.try_transition(TxState::RollingBack) {
        finish_primaries(tm, tx, false).await;
        let _ = tx.transition(TxState::RolledBack);
        tm.complete(tx, TxResult::ok(TxState::RolledBack));
    }
}

/// Restarts a failed optimistic attempt at topology version `current`.
async fn remap(tm: &Arc<TxManager>, tx: &Transaction, current: u64) -> CacheResult<Arc<Transaction>> {
    let ctx = &tm.ctx;
    ctx.barrier
        .wait_for(current, ctx.config.exchange_timeout)
        .await?;

    let options = tx.options();
    let timeout = options.timeout.unwrap_or(ctx.config.tx_timeout);
    let next = tm.register_near(&options, current.max(ctx.barrier.ready_version()), timeout);
    {
        let src = tx.inner.lock();
        let mut dst = next.inner.lock();
        dst.writes = src.writes.clone();
        dst.reads = src.reads.clone();
    }
    Ok(next)
}
