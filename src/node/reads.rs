use std::collections::BTreeSet;
use uuid::Uuid;

use crate::error::{CacheError, CacheResult};
use crate::membership::types::NodeId;
use crate::messaging::protocol::{CacheMessage, GetRequest, GetResponse, ReadEntry};
use crate::node::context::{CacheContext, unexpected};
use crate::topology::partition::LocalPartition;
use crate::topology::types::PartitionState;
use crate::txn::types::TxVersion;

/// Reads `key` from a local partition, loading it from the store on the primary.
pub async fn read_local(
    ctx: &CacheContext,
    part: &LocalPartition,
    key: &str,
    top_ver: u64,
) -> CacheResult<ReadEntry> {
    if let Some(entry) = part.entry(key) {
        return Ok(ReadEntry {
            key: key.to_string(),
            value: entry.value,
            version: entry.version,
        });
    }

    if let Some(store) = ctx.store()
        && ctx.affinity.is_primary(part.id(), top_ver)
        && let Some(value) = store.load(key).await?
    {
        tracing::debug!("Loaded '{}' from store into partition {}", key, part.id());
        part.apply(key, Some(value.clone()), TxVersion::ZERO);
        return Ok(ReadEntry {
            key: key.to_string(),
            value: Some(value),
            version: TxVersion::ZERO,
        });
    }

    Ok(ReadEntry {
        key: key.to_string(),
        value: None,
        version: TxVersion::ZERO,
    })
}

/// Whether the local copy of `part` may serve reads.
fn readable(ctx: &CacheContext, part: &LocalPartition, force: bool) -> bool {
    match part.state() {
        PartitionState::Owning => true,
        PartitionState::Moving => force || !ctx.config.preload_enabled,
        _ => false,
    }
}

/// Serves a read for a remote node.
pub async fn on_get(ctx: &CacheContext, from: &NodeId, req: GetRequest) -> GetResponse {
    let mut response = GetResponse {
        future_id: req.future_id,
        mini_id: req.mini_id,
        entries: Vec::new(),
        invalid_partitions: Vec::new(),
        error: None,
    };

    if req.topology_version > ctx.barrier.ready_version()
        && let Err(e) = ctx
            .barrier
            .wait_for(req.topology_version, ctx.config.exchange_timeout)
            .await
    {
        response.error = Some(e);
        return response;
    }
    let top_ver = ctx.barrier.ready_version();

    let mut invalid = BTreeSet::new();
    for key in req.keys {
        let p = ctx.affinity.partition(&key);

        let part = match ctx.topology.local_partition(p, top_ver, false) {
            Ok(Some(part)) if readable(ctx, &part, req.force) => part,
            _ => {
                invalid.insert(p);
                continue;
            }
        };

        match read_local(ctx, &part, &key, top_ver).await {
            Ok(entry) => {
                if req.register_reader
                    && entry.value.is_some()
                    && from != ctx.local_id()
                    && !ctx.affinity.belongs(p, top_ver, from)
                {
                    part.add_reader(&key, from.clone());
                }
                response.entries.push(entry);
            }
            Err(e) => {
                response.error = Some(e);
                return response;
            }
        }
    }

    response.invalid_partitions = invalid.into_iter().collect();
    response
}

/// Asks `node` for `key`. `Ok(None)` means the node no longer serves the partition.
pub async fn fetch_from(
    ctx: &CacheContext,
    node: &NodeId,
    key: &str,
    top_ver: u64,
    register_reader: bool,
    force: bool,
) -> CacheResult<Option<ReadEntry>> {
    let response = ctx
        .request(node, Uuid::new_v4(), ctx.config.network_timeout, |future_id, mini_id| {
            CacheMessage::GetRequest(GetRequest {
                future_id,
                mini_id,
                topology_version: top_ver,
                keys: vec![key.to_string()],
                register_reader,
                force,
            })
        })
        .await?;

    let response = match response {
        CacheMessage::GetResponse(r) => r,
        other => return Err(unexpected(&other)),
    };
    if let Some(e) = response.error {
        return Err(e);
    }
    if !response.invalid_partitions.is_empty() {
        return Ok(None);
    }

    let entry = response
        .entries
        .into_iter()
        .find(|e| e.key == key)
        .unwrap_or_else(|| ReadEntry {
            key: key.to_string(),
            value: None,
            version: TxVersion::ZERO,
        });
    ctx.versions.on_received(&entry.version);
    Ok(Some(entry))
}

/// Reads `key` from the primary at `top_ver`, falling back to the other owners.
pub async fn fetch(
    ctx: &CacheContext,
    key: &str,
    top_ver: u64,
    register_reader: bool,
) -> CacheResult<ReadEntry> {
    let p = ctx.affinity.partition(key);

    let mut candidates: Vec<NodeId> = ctx.affinity.primary(p, top_ver).into_iter().collect();
    for owner in ctx.topology.owners(p, Some(top_ver)) {
        if !candidates.contains(&owner) {
            candidates.push(owner);
        }
    }

    let mut last_error = None;
    for node in candidates {
        if ctx.discovery.has_departed(&node) {
            continue;
        }

        if &node == ctx.local_id() {
            if let Ok(Some(part)) = ctx.topology.local_partition(p, top_ver, false)
                && readable(ctx, &part, false)
            {
                match read_local(ctx, &part, key, top_ver).await {
                    Ok(entry) => return Ok(entry),
                    Err(e) => last_error = Some(e),
                }
            }
            continue;
        }

        match fetch_from(ctx, &node, key, top_ver, register_reader, false).await {
            Ok(Some(entry)) => return Ok(entry),
            Ok(None) => tracing::debug!("Node {} cannot serve partition {} any more", node, p),
            Err(e) => {
                tracing::debug!("Read of '{}' from {} failed: {}", key, node, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        CacheError::Topology(format!(
            "no node can serve partition {} at topology version {}",
            p, top_ver
        ))
    }))
}
