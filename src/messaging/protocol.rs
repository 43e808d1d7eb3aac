//! Cache Network Protocol
//!
//! Every message exchanged between cache nodes. Messages travel inside an [`Envelope`]
//! that names the sender; peers post envelopes to [`ENDPOINT_MESSAGE`].
//!
//! Request/response pairs carry a `future_id` (the compound operation waiting on the
//! answer) and a `mini_id` (one outstanding request of that operation), so a response
//! completes exactly one waiter no matter how often it is re-delivered.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::CacheError;
use crate::membership::types::NodeId;
use crate::topology::partition::CacheEntry;
use crate::topology::types::{ExchangeId, FullPartitionMap, PartitionMap};
use crate::txn::types::{Concurrency, Isolation, TxEntry, TxState, TxVersion};

/// Internal endpoint every node accepts peer envelopes on.
pub const ENDPOINT_MESSAGE: &str = "/internal/message";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub message: CacheMessage,
}

// --- Affinity ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffinityAssignmentRequest {
    pub future_id: Uuid,
    pub mini_id: u32,
    pub topology_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffinityAssignmentResponse {
    pub future_id: Uuid,
    pub mini_id: u32,
    pub topology_version: u64,
    /// Owners per partition, or `None` if the peer never saw that version.
    pub partitions: Option<Vec<Vec<NodeId>>>,
}

// --- Partition exchange ---

/// One node's partition map. Sent to the oldest node during an exchange and
/// whenever local partition state changes afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionsSingleMessage {
    pub exchange_id: Option<ExchangeId>,
    pub map: PartitionMap,
}

/// The cluster-wide map, broadcast by the oldest node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionsFullMessage {
    pub exchange_id: Option<ExchangeId>,
    pub map: FullPartitionMap,
}

// --- Preloading ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionDemand {
    pub future_id: Uuid,
    pub mini_id: u32,
    pub topology_version: u64,
    pub partition: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionSupply {
    pub future_id: Uuid,
    pub mini_id: u32,
    pub partition: u32,
    pub entries: Vec<(String, CacheEntry)>,
    pub error: Option<CacheError>,
}

// --- Reads ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    pub future_id: Uuid,
    pub mini_id: u32,
    pub topology_version: u64,
    pub keys: Vec<String>,
    /// Register the sender as a near reader of the returned entries.
    pub register_reader: bool,
    /// Serve from a MOVING partition too (used to force keys onto a new primary).
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadEntry {
    pub key: String,
    pub value: Option<Value>,
    pub version: TxVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResponse {
    pub future_id: Uuid,
    pub mini_id: u32,
    pub entries: Vec<ReadEntry>,
    pub invalid_partitions: Vec<u32>,
    pub error: Option<CacheError>,
}

// --- Near -> primary ---

/// Pessimistic lock of one key on its primary, taken when the key is first touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    pub future_id: Uuid,
    pub mini_id: u32,
    pub topology_version: u64,
    pub near_xid: TxVersion,
    pub isolation: Isolation,
    pub timeout_ms: u64,
    pub key: String,
    pub partition: u32,
    pub require_all_partitions: bool,
    pub group_lock_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockResponse {
    pub future_id: Uuid,
    pub mini_id: u32,
    pub value: Option<Value>,
    pub version: TxVersion,
    pub error: Option<CacheError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NearPrepareRequest {
    pub future_id: Uuid,
    pub mini_id: u32,
    pub topology_version: u64,
    pub near_xid: TxVersion,
    pub concurrency: Concurrency,
    pub isolation: Isolation,
    pub timeout_ms: u64,
    pub writes: Vec<TxEntry>,
    /// Reads to re-validate (optimistic only).
    pub reads: Vec<TxEntry>,
    pub one_phase_commit: bool,
    pub require_all_partitions: bool,
    pub group_lock_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NearPrepareResponse {
    pub future_id: Uuid,
    pub mini_id: u32,
    pub state: TxState,
    pub commit_version: Option<TxVersion>,
    pub excluded_keys: Vec<String>,
    pub error: Option<CacheError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NearFinishRequest {
    pub future_id: Uuid,
    pub mini_id: u32,
    pub near_xid: TxVersion,
    pub commit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NearFinishResponse {
    pub future_id: Uuid,
    pub mini_id: u32,
    pub state: TxState,
    pub commit_version: Option<TxVersion>,
    pub excluded_keys: Vec<String>,
    pub error: Option<CacheError>,
}

// --- Primary -> backups and near readers ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub future_id: Uuid,
    pub mini_id: u32,
    pub topology_version: u64,
    pub near_xid: TxVersion,
    pub near_node: NodeId,
    pub isolation: Isolation,
    pub timeout_ms: u64,
    /// Resolved writes for partitions the receiver holds.
    pub writes: Vec<TxEntry>,
    /// Writes for keys the receiver caches as a near reader.
    pub near_writes: Vec<TxEntry>,
    /// Version the primary believes each near reader holds.
    pub owned_versions: BTreeMap<String, TxVersion>,
    /// No further prepare for this transaction will reach the receiver.
    pub last: bool,
    pub one_phase_commit: bool,
    /// Set when `one_phase_commit` lets the receiver commit right away.
    pub commit_version: Option<TxVersion>,
    pub group_lock_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub future_id: Uuid,
    pub mini_id: u32,
    pub invalid_partitions: Vec<u32>,
    pub evicted_near_keys: Vec<String>,
    pub error: Option<CacheError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishRequest {
    pub future_id: Uuid,
    pub mini_id: u32,
    pub topology_version: u64,
    pub near_xid: TxVersion,
    pub commit: bool,
    pub near_writes: Vec<TxEntry>,
    pub isolation: Isolation,
    pub one_phase_commit: bool,
    /// Transactions queued behind this one on the same keys at the primary.
    pub pending_versions: Vec<TxVersion>,
    pub commit_version: Option<TxVersion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishResponse {
    pub future_id: Uuid,
    pub mini_id: u32,
    pub error: Option<CacheError>,
}

/// Asked by a prepared backup that has not heard from its primary for a while.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxStatusRequest {
    pub future_id: Uuid,
    pub mini_id: u32,
    pub near_xid: TxVersion,
    pub near_node: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxStatusResponse {
    pub future_id: Uuid,
    pub mini_id: u32,
    /// `None` while the primary is still working on the transaction; otherwise
    /// whether it applied the writes.
    pub committed: Option<bool>,
    pub commit_version: Option<TxVersion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheMessage {
    AffinityAssignmentRequest(AffinityAssignmentRequest),
    AffinityAssignmentResponse(AffinityAssignmentResponse),
    PartitionsSingle(PartitionsSingleMessage),
    PartitionsFull(PartitionsFullMessage),
    PartitionDemand(PartitionDemand),
    PartitionSupply(PartitionSupply),
    GetRequest(GetRequest),
    GetResponse(GetResponse),
    LockRequest(LockRequest),
    LockResponse(LockResponse),
    NearPrepareRequest(NearPrepareRequest),
    NearPrepareResponse(NearPrepareResponse),
    NearFinishRequest(NearFinishRequest),
    NearFinishResponse(NearFinishResponse),
    PrepareRequest(PrepareRequest),
    PrepareResponse(PrepareResponse),
    FinishRequest(FinishRequest),
    FinishResponse(FinishResponse),
    TxStatusRequest(TxStatusRequest),
    TxStatusResponse(TxStatusResponse),
}

impl CacheMessage {
    /// `(future_id, mini_id)` of a response; `None` for requests and one-way messages.
    pub fn response_ids(&self) -> Option<(Uuid, u32)> {
        match self {
            CacheMessage::AffinityAssignmentResponse(m) => Some((m.future_id, m.mini_id)),
            CacheMessage::PartitionSupply(m) => Some((m.future_id, m.mini_id)),
            CacheMessage::GetResponse(m) => Some((m.future_id, m.mini_id)),
            CacheMessage::LockResponse(m) => Some((m.future_id, m.mini_id)),
            CacheMessage::NearPrepareResponse(m) => Some((m.future_id, m.mini_id)),
            CacheMessage::NearFinishResponse(m) => Some((m.future_id, m.mini_id)),
            CacheMessage::PrepareResponse(m) => Some((m.future_id, m.mini_id)),
            CacheMessage::FinishResponse(m) => Some((m.future_id, m.mini_id)),
            CacheMessage::TxStatusResponse(m) => Some((m.future_id, m.mini_id)),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CacheMessage::AffinityAssignmentRequest(_) => "AffinityAssignmentRequest",
            CacheMessage::AffinityAssignmentResponse(_) => "AffinityAssignmentResponse",
            CacheMessage::PartitionsSingle(_) => "PartitionsSingle",
            CacheMessage::PartitionsFull(_) => "PartitionsFull",
            CacheMessage::PartitionDemand(_) => "PartitionDemand",
            CacheMessage::PartitionSupply(_) => "PartitionSupply",
            CacheMessage::GetRequest(_) => "GetRequest",
            CacheMessage::GetResponse(_) => "GetResponse",
            CacheMessage::LockRequest(_) => "LockRequest",
            CacheMessage::LockResponse(_) => "LockResponse",
            CacheMessage::NearPrepareRequest(_) => "NearPrepareRequest",
            CacheMessage::NearPrepareResponse(_) => "NearPrepareResponse",
            CacheMessage::NearFinishRequest(_) => "NearFinishRequest",
            CacheMessage::NearFinishResponse(_) => "NearFinishResponse",
            CacheMessage::PrepareRequest(_) => "PrepareRequest",
            CacheMessage::PrepareResponse(_) => "PrepareResponse",
            CacheMessage::FinishRequest(_) => "FinishRequest",
            CacheMessage::FinishResponse(_) => "FinishResponse",
            CacheMessage::TxStatusRequest(_) => "TxStatusRequest",
            CacheMessage::TxStatusResponse(_) => "TxStatusResponse",
        }
    }
}
