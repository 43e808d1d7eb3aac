use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::core::{Transaction, TxOrigin, TxResult};
use super::near::NearTx;
use super::types::{TxOptions, TxRole, TxState, TxVersion};
use super::{primary, remote};
use crate::error::{CacheError, CacheResult};
use crate::membership::types::NodeId;
use crate::messaging::protocol::{
    FinishRequest, FinishResponse, LockRequest, LockResponse, NearFinishRequest, NearFinishResponse,
    NearPrepareRequest, NearPrepareResponse, PrepareRequest, PrepareResponse, TxStatusRequest,
    TxStatusResponse,
};
use crate::node::context::CacheContext;

/// How many finished transactions are remembered for duplicate requests.
const COMPLETED_HISTORY: usize = 10_000;

/// Identifies a finished transaction by role, near id and the node that drove it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompletedKey {
    pub role: TxRole,
    pub near_xid: TxVersion,
    pub node: NodeId,
}

impl CompletedKey {
    pub fn new(role: TxRole, near_xid: TxVersion, node: &NodeId) -> Self {
        Self {
            role,
            near_xid,
            node: node.clone(),
        }
    }
}

#[derive(Default)]
struct CompletedTxs {
    order: VecDeque<CompletedKey>,
    results: HashMap<CompletedKey, TxResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxStats {
    pub near: usize,
    pub primary: usize,
    pub remote: usize,
    pub completed: usize,
}

/// Registry of the transactions this node takes part in.
///
/// Near transactions are keyed by their id, primary transactions by the near id, and
/// backup transactions by the near id plus the primary that prepared them. A sweeper
/// times out stuck transactions and resolves the ones whose coordinator left.
pub struct TxManager {
    pub(crate) ctx: Arc<CacheContext>,
    near: DashMap<TxVersion, Arc<Transaction>>,
    primary: DashMap<TxVersion, Arc<Transaction>>,
    remote: DashMap<(TxVersion, NodeId), Arc<Transaction>>,
    completed: Mutex<CompletedTxs>,
}

impl TxManager {
    pub fn new(ctx: Arc<CacheContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            near: DashMap::new(),
            primary: DashMap::new(),
            remote: DashMap::new(),
            completed: Mutex::new(CompletedTxs::default()),
        })
    }

    /// Spawns the timeout and salvage sweeper.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let me = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(me.ctx.config.sweep_interval);
            loop {
                ticker.tick().await;
                me.sweep().await;
            }
        })
    }

    /// Starts a transaction coordinated by this node.
    pub fn begin(self: &Arc<Self>, options: TxOptions) -> CacheResult<NearTx> {
        let top_ver = self.ctx.barrier.ready_version();
        if top_ver == 0 {
            return Err(CacheError::Topology(
                "local node has not completed its first exchange".to_string(),
            ));
        }

        let timeout = options.timeout.unwrap_or(self.ctx.config.tx_timeout);
        let tx = self.register_near(&options, top_ver, timeout);
        tracing::debug!(
            "Started {:?} tx {} at topology version {}",
            options.concurrency,
            tx.near_xid,
            top_ver
        );
        Ok(NearTx::new(self.clone(), tx))
    }

    pub(crate) fn register_near(
        &self,
        options: &TxOptions,
        top_ver: u64,
        timeout: Duration,
    ) -> Arc<Transaction> {
        let xid = self.ctx.versions.next(top_ver);
        let local = self.ctx.local_id().clone();
        let tx = Arc::new(Transaction::new(
            TxRole::Near,
            TxOrigin {
                xid,
                near_xid: xid,
                top_ver,
                near_node: local.clone(),
                coordinator: local,
            },
            options,
            timeout,
        ));
        self.near.insert(xid, tx.clone());
        tx
    }

    /// Primary transaction for `near_xid`, created on first contact.
    pub(crate) fn primary_tx(
        &self,
        near_node: &NodeId,
        near_xid: TxVersion,
        top_ver: u64,
        options: &TxOptions,
    ) -> CacheResult<Arc<Transaction>> {
        if let Some(tx) = self.primary.get(&near_xid) {
            return Ok(tx.clone());
        }
        if self
            .completed(&CompletedKey::new(TxRole::Primary, near_xid, near_node))
            .is_some()
        {
            return Err(CacheError::Rollback(format!(
                "transaction {} already finished",
                near_xid
            )));
        }

        let timeout = options.timeout.unwrap_or(self.ctx.config.tx_timeout);
        let tx = self
            .primary
            .entry(near_xid)
            .or_insert_with(|| {
                Arc::new(Transaction::new(
                    TxRole::Primary,
                    TxOrigin {
                        xid: self.ctx.versions.next(top_ver),
                        near_xid,
                        top_ver,
                        near_node: near_node.clone(),
                        coordinator: near_node.clone(),
                    },
                    options,
                    timeout,
                ))
            })
            .clone();
        Ok(tx)
    }

    pub(crate) fn find_primary(&self, near_xid: &TxVersion) -> Option<Arc<Transaction>> {
        self.primary.get(near_xid).map(|t| t.clone())
    }

    /// Backup transaction prepared by `primary`, created on first contact.
    pub(crate) fn remote_tx(&self, primary: &NodeId, req: &PrepareRequest) -> Arc<Transaction> {
        let mut options = TxOptions::pessimistic();
        options.isolation = req.isolation;
        let timeout = Duration::from_millis(req.timeout_ms).max(self.ctx.config.tx_timeout);

        self.remote
            .entry((req.near_xid, primary.clone()))
            .or_insert_with(|| {
                Arc::new(Transaction::new(
                    TxRole::Backup,
                    TxOrigin {
                        xid: self.ctx.versions.next(req.topology_version),
                        near_xid: req.near_xid,
                        top_ver: req.topology_version,
                        near_node: req.near_node.clone(),
                        coordinator: primary.clone(),
                    },
                    &options,
                    timeout,
                ))
            })
            .clone()
    }

    pub(crate) fn find_remote(&self, near_xid: TxVersion, primary: &NodeId) -> Option<Arc<Transaction>> {
        self.remote
            .get(&(near_xid, primary.clone()))
            .map(|t| t.clone())
    }

    /// Removes a finished transaction from its registry and remembers its result.
    pub(crate) fn complete(&self, tx: &Transaction, result: TxResult) {
        match tx.role {
            TxRole::Near => {
                self.near.remove(&tx.near_xid);
            }
            TxRole::Primary => {
                self.primary.remove(&tx.near_xid);
            }
            TxRole::Backup => {
                self.remote.remove(&(tx.near_xid, tx.coordinator.clone()));
            }
        }

        tracing::debug!(
            "Tx {} ({:?}) finished in state {:?}",
            tx.near_xid,
            tx.role,
            result.state
        );

        let key = CompletedKey::new(tx.role, tx.near_xid, &tx.coordinator);
        let mut completed = self.completed.lock();
        if completed.results.insert(key.clone(), result).is_none() {
            completed.order.push_back(key);
        }
        while completed.order.len() > COMPLETED_HISTORY {
            if let Some(old) = completed.order.pop_front() {
                completed.results.remove(&old);
            }
        }
    }

    pub(crate) fn completed(&self, key: &CompletedKey) -> Option<TxResult> {
        self.completed.lock().results.get(key).cloned()
    }

    // ============================================================
    // MESSAGE HANDLERS
    // ============================================================

    pub async fn on_lock_request(self: &Arc<Self>, from: &NodeId, req: LockRequest) -> LockResponse {
        primary::on_lock(self, from, req).await
    }

    pub async fn on_near_prepare(
        self: &Arc<Self>,
        from: &NodeId,
        req: NearPrepareRequest,
    ) -> NearPrepareResponse {
        primary::on_near_prepare(self, from, req).await
    }

    pub async fn on_near_finish(
        self: &Arc<Self>,
        from: &NodeId,
        req: NearFinishRequest,
    ) -> NearFinishResponse {
        primary::on_near_finish(self, from, req).await
    }

    pub async fn on_prepare(self: &Arc<Self>, from: &NodeId, req: PrepareRequest) -> PrepareResponse {
        remote::on_prepare(self, from, req).await
    }

    pub async fn on_finish(self: &Arc<Self>, from: &NodeId, req: FinishRequest) -> FinishResponse {
        remote::on_finish(self, from, req).await
    }

    pub fn on_tx_status(&self, req: TxStatusRequest) -> TxStatusResponse {
        primary::on_status(self, req)
    }

    /// Orphans every transaction coordinated by `node`.
    pub fn on_node_left(&self, node: &NodeId) {
        for tx in self.primary.iter().filter(|t| &t.near_node == node) {
            tx.mark_orphaned();
        }
        for tx in self.remote.iter().filter(|t| &t.coordinator == node) {
            tx.mark_orphaned();
        }

        // Locks held on a departed primary are gone.
        for tx in self.near.iter() {
            if !tx.is_optimistic()
                && tx.state() == TxState::Active
                && tx.inner.lock().primaries.contains(node)
            {
                tracing::info!("Tx {} lost primary {}; marking rollback-only", tx.near_xid, node);
                tx.set_rollback_only();
            }
        }
    }

    // ============================================================
    // SWEEPER
    // ============================================================

    async fn sweep(self: &Arc<Self>) {
        for tx in self.near.iter() {
            if tx.state() == TxState::Active && tx.is_timed_out() && !tx.is_rollback_only() {
                tracing::info!("Tx {} timed out; marking rollback-only", tx.near_xid);
                tx.set_rollback_only();
            }
        }

        let timed_out: Vec<Arc<Transaction>> = self
            .primary
            .iter()
            .filter(|t| t.state() == TxState::Active && t.is_timed_out())
            .map(|t| t.clone())
            .collect();
        for tx in timed_out {
            tracing::info!("Rolling back timed out tx {} (near={})", tx.near_xid, tx.near_node);
            primary::expire(self, &tx).await;
        }

        let salvage_timeout = self.ctx.config.salvage_timeout;

        let orphans: Vec<Arc<Transaction>> = self
            .primary
            .iter()
            .filter(|t| t.is_orphaned() && t.idle() >= salvage_timeout)
            .map(|t| t.clone())
            .collect();
        for tx in orphans {
            primary::salvage(self, &tx).await;
        }

        let orphans: Vec<Arc<Transaction>> = self
            .remote
            .iter()
            .filter(|t| t.is_orphaned() && t.idle() >= salvage_timeout)
            .map(|t| t.clone())
            .collect();
        for tx in orphans {
            remote::salvage(self, &tx).await;
        }

        let silent: Vec<Arc<Transaction>> = self
            .remote
            .iter()
            .filter(|t| !t.is_orphaned() && t.state() == TxState::Prepared && t.idle() >= salvage_timeout)
            .map(|t| t.clone())
            .collect();
        for tx in silent {
            remote::check_back(self, &tx).await;
        }
    }

    pub fn stats(&self) -> TxStats {
        TxStats {
            near: self.near.len(),
            primary: self.primary.len(),
            remote: self.remote.len(),
            completed: self.completed.lock().results.len(),
        }
    }
}
