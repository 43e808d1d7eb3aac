use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::context::CacheContext;
use super::reads;
use crate::affinity::partitioner::RendezvousAffinity;
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::exchange::coordinator::ExchangeCoordinator;
use crate::exchange::preloader::Preloader;
use crate::membership::discovery::DiscoveryEvent;
use crate::membership::types::{ClusterNode, NodeId};
use crate::messaging::protocol::{CacheMessage, Envelope};
use crate::messaging::transport::Transport;
use crate::topology::types::PartitionState;
use crate::txn::manager::{TxManager, TxStats};
use crate::txn::near::NearTx;
use crate::txn::store::CacheStore;
use crate::txn::types::{Delta, Isolation, TxOp, TxOptions, TxOutcome};

/// Attempts of an implicit single-key transaction before giving up.
const IMPLICIT_TX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStats {
    pub node: NodeId,
    pub topology_version: u64,
    pub ready_version: u64,
    pub update_sequence: u64,
    pub owning: usize,
    pub moving: usize,
    pub renting: usize,
    pub entries: usize,
    pub near_entries: usize,
    pub pending_requests: usize,
    pub transactions: TxStats,
}

/// One cache node: topology, exchange, transactions and the message dispatcher.
pub struct CacheNode {
    pub ctx: Arc<CacheContext>,
    pub tm: Arc<TxManager>,
    pub coordinator: Arc<ExchangeCoordinator>,
    pub preloader: Arc<Preloader>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheNode {
    pub fn new(
        config: CacheConfig,
        local: ClusterNode,
        transport: Arc<dyn Transport>,
        store: Option<Arc<dyn CacheStore>>,
    ) -> Arc<Self> {
        let function = Arc::new(RendezvousAffinity::new(config.partitions));
        let ctx = CacheContext::new(config, local, function, transport, store);
        let preloader = Preloader::new(ctx.clone());
        let coordinator = ExchangeCoordinator::new(ctx.clone(), preloader.clone());
        let tm = TxManager::new(ctx.clone());

        Arc::new(Self {
            ctx,
            tm,
            coordinator,
            preloader,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &NodeId {
        self.ctx.local_id()
    }

    /// Starts background work and begins consuming discovery events.
    pub fn start(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<DiscoveryEvent>) {
        let mut tasks = self.coordinator.start();
        tasks.push(self.tm.start());

        let me = self.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                me.on_discovery_event(event);
            }
            tracing::info!("Discovery stream closed");
        }));

        self.tasks.lock().extend(tasks);
    }

    /// Feeds envelopes from an in-process inbox into the dispatcher.
    pub fn attach_inbox(self: &Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
        let me = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                me.dispatch(envelope);
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Aborts every background task of this node.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn on_discovery_event(&self, event: DiscoveryEvent) {
        let departed = event.is_departure().then(|| event.node.id.clone());
        tracing::info!(
            "Discovery event {:?} for {} (topology version {})",
            event.kind,
            event.node.id,
            event.topology_version
        );

        self.coordinator.on_discovery_event(event);

        if let Some(node) = departed {
            let failed = self.ctx.futures.on_node_left(&node);
            if failed > 0 {
                tracing::info!("Failed {} pending request(s) to {}", failed, node);
            }
            self.tm.on_node_left(&node);
        }
    }

    /// Handles one inbound message on its own task.
    pub fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        let me = self.clone();
        tokio::spawn(async move {
            let Envelope { from, message } = envelope;

            if let Some((future_id, mini_id)) = message.response_ids() {
                me.ctx.futures.complete(future_id, mini_id, message);
                return;
            }

            if let Some(response) = me.handle(&from, message).await
                && let Err(e) = me.ctx.send(&from, response).await
            {
                tracing::debug!("Failed to reply to {}: {}", from, e);
            }
        });
    }

    async fn handle(&self, from: &NodeId, message: CacheMessage) -> Option<CacheMessage> {
        match message {
            CacheMessage::AffinityAssignmentRequest(req) => Some(
                CacheMessage::AffinityAssignmentResponse(self.ctx.assignment_response(req)),
            ),
            CacheMessage::PartitionsSingle(msg) => {
                self.coordinator.on_single(from, msg);
                None
            }
            CacheMessage::PartitionsFull(msg) => {
                self.coordinator.on_full(from, msg);
                None
            }
            CacheMessage::PartitionDemand(req) => {
                Some(CacheMessage::PartitionSupply(self.preloader.on_demand(req)))
            }
            CacheMessage::GetRequest(req) => Some(CacheMessage::GetResponse(
                reads::on_get(&self.ctx, from, req).await,
            )),
            CacheMessage::LockRequest(req) => Some(CacheMessage::LockResponse(
                self.tm.on_lock_request(from, req).await,
            )),
            CacheMessage::NearPrepareRequest(req) => Some(CacheMessage::NearPrepareResponse(
                self.tm.on_near_prepare(from, req).await,
            )),
            CacheMessage::NearFinishRequest(req) => Some(CacheMessage::NearFinishResponse(
                self.tm.on_near_finish(from, req).await,
            )),
            CacheMessage::PrepareRequest(req) => Some(CacheMessage::PrepareResponse(
                self.tm.on_prepare(from, req).await,
            )),
            CacheMessage::FinishRequest(req) => Some(CacheMessage::FinishResponse(
                self.tm.on_finish(from, req).await,
            )),
            CacheMessage::TxStatusRequest(req) => {
                Some(CacheMessage::TxStatusResponse(self.tm.on_tx_status(req)))
            }
            other => {
                tracing::warn!("Unexpected {} from {}", other.kind(), from);
                None
            }
        }
    }

    /// Waits until the exchange for `version` has completed locally.
    pub async fn await_topology(&self, version: u64, timeout: Duration) -> CacheResult<u64> {
        self.ctx.barrier.wait_for(version, timeout).await
    }

    // ============================================================
    // CACHE API
    // ============================================================

    /// Non-transactional read; served locally when this node owns the key.
    pub async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        let ctx = &self.ctx;
        let top_ver = ctx.barrier.ready_version();
        if top_ver == 0 {
            return Err(CacheError::Topology(
                "local node has not completed its first exchange".to_string(),
            ));
        }

        let p = ctx.affinity.partition(key);
        let owner = ctx.affinity.is_local(p, top_ver);
        if !owner && let Some(near) = ctx.near_get(key) {
            return Ok(near.value);
        }

        let register = ctx.config.near_cache_enabled && !owner;
        let entry = reads::fetch(ctx, key, top_ver, register).await?;
        if register && entry.value.is_some() {
            ctx.near_put(key, entry.value.clone(), entry.version);
        }
        Ok(entry.value)
    }

    pub async fn put(&self, key: &str, value: Value) -> CacheResult<TxOutcome> {
        self.write_implicit(key, TxOp::Update, Some(value)).await
    }

    pub async fn remove(&self, key: &str) -> CacheResult<TxOutcome> {
        self.write_implicit(key, TxOp::Delete, None).await
    }

    pub async fn transform(&self, key: &str, delta: Delta) -> CacheResult<TxOutcome> {
        self.write_implicit(key, TxOp::Transform(delta), None).await
    }

    /// Runs a single write as its own optimistic transaction, retrying on failures
    /// caused by topology changes.
    async fn write_implicit(&self, key: &str, op: TxOp, value: Option<Value>) -> CacheResult<TxOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let tx = self.begin(TxOptions::optimistic(Isolation::ReadCommitted))?;

            let staged = match &op {
                TxOp::Update => tx.put(key, value.clone().unwrap_or(Value::Null)).await,
                TxOp::Delete => tx.remove(key).await,
                TxOp::Transform(delta) => tx.transform(key, delta.clone()).await,
                TxOp::Read => Ok(()),
            };
            let result = match staged {
                Ok(()) => tx.commit().await,
                Err(e) => Err(e),
            };

            match result {
                Err(e) if e.is_retryable() && attempt < IMPLICIT_TX_ATTEMPTS => {
                    tracing::debug!("Retrying write of '{}' (attempt {}): {}", key, attempt, e);
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
                other => return other,
            }
        }
    }

    pub fn begin(&self, options: TxOptions) -> CacheResult<NearTx> {
        self.tm.begin(options)
    }

    pub fn stats(&self) -> NodeStats {
        let parts = self.ctx.topology.local_partitions();
        let count = |state: PartitionState| parts.iter().filter(|p| p.state() == state).count();

        NodeStats {
            node: self.id().clone(),
            topology_version: self.ctx.topology.topology_version(),
            ready_version: self.ctx.barrier.ready_version(),
            update_sequence: self.ctx.topology.update_sequence(),
            owning: count(PartitionState::Owning),
            moving: count(PartitionState::Moving),
            renting: count(PartitionState::Renting),
            entries: parts.iter().map(|p| p.len()).sum(),
            near_entries: self.ctx.near_cache.len(),
            pending_requests: self.ctx.futures.len(),
            transactions: self.tm.stats(),
        }
    }
}
