use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{CacheError, CacheResult};
use crate::membership::types::NodeId;
use crate::messaging::protocol::{CacheMessage, PartitionDemand, PartitionSupply};
use crate::node::context::{CacheContext, unexpected};
use crate::topology::partition::CacheEntry;
use crate::topology::types::PartitionState;

/// Fills MOVING partitions from their current owners after an exchange.
pub struct Preloader {
    ctx: Arc<CacheContext>,
    running: Mutex<Option<JoinHandle<()>>>,
}

impl Preloader {
    pub fn new(ctx: Arc<CacheContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            running: Mutex::new(None),
        })
    }

    /// Starts preloading for `version`, cancelling a run left over from an older one.
    pub fn start(self: &Arc<Self>, version: u64) {
        let me = self.clone();
        let handle = tokio::spawn(async move { me.preload(version).await });

        if let Some(previous) = self.running.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn preload(&self, version: u64) {
        let local = self.ctx.local_id().clone();
        let mut owned = 0;

        for part in self.ctx.topology.local_partitions() {
            if self.ctx.topology.topology_version() != version {
                tracing::debug!("Topology moved past {}, stopping preload", version);
                break;
            }

            let p = part.id();
            if part.state() != PartitionState::Moving || !self.ctx.affinity.is_local(p, version) {
                continue;
            }

            let owners: Vec<NodeId> = self
                .ctx
                .topology
                .owners(p, Some(version))
                .into_iter()
                .filter(|n| *n != local)
                .collect();
            if owners.is_empty() {
                continue;
            }

            match self.demand(p, version, &owners).await {
                Ok(entries) => {
                    let supplied = entries.len();
                    for (key, entry) in entries {
                        self.ctx.versions.on_received(&entry.version);
                        part.apply(&key, entry.value, entry.version);
                    }
                    if self.ctx.topology.own(&part) {
                        owned += 1;
                        tracing::debug!("Preloaded partition {} ({} entries)", p, supplied);
                    }
                }
                Err(e) => tracing::warn!("Failed to preload partition {}: {}", p, e),
            }
        }

        if owned > 0 {
            tracing::info!("Preloaded {} partition(s) at topology version {}", owned, version);
            self.ctx.topology.local_changes().notify_one();
        }
    }

    async fn demand(
        &self,
        partition: u32,
        version: u64,
        owners: &[NodeId],
    ) -> CacheResult<Vec<(String, CacheEntry)>> {
        let mut last_error = None;

        for owner in owners {
            let response = self
                .ctx
                .request(
                    owner,
                    Uuid::new_v4(),
                    self.ctx.config.network_timeout,
                    |future_id, mini_id| {
                        CacheMessage::PartitionDemand(PartitionDemand {
                            future_id,
                            mini_id,
                            topology_version: version,
                            partition,
                        })
                    },
                )
                .await;

            match response {
                Ok(CacheMessage::PartitionSupply(supply)) => match supply.error {
                    None => return Ok(supply.entries),
                    Some(e) => last_error = Some(e),
                },
                Ok(other) => last_error = Some(unexpected(&other)),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            CacheError::Topology(format!("no owner can supply partition {}", partition))
        }))
    }

    /// Serves a demand from a node preloading one of our OWNING partitions.
    pub fn on_demand(&self, req: PartitionDemand) -> PartitionSupply {
        let part = self
            .ctx
            .topology
            .local_partition(req.partition, req.topology_version, false);

        let (entries, error) = match part {
            Ok(Some(part)) if part.state() == PartitionState::Owning => (part.snapshot(), None),
            Ok(_) => (
                Vec::new(),
                Some(CacheError::InvalidPartition {
                    partition: req.partition,
                    reason: "not owned by the supplier".to_string(),
                }),
            ),
            Err(e) => (Vec::new(), Some(e)),
        };

        PartitionSupply {
            future_id: req.future_id,
            mini_id: req.mini_id,
            partition: req.partition,
            entries,
            error,
        }
    }
}
