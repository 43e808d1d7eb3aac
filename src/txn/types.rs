use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{CacheError, CacheResult};

/// Version stamp used for transactions and entries.
///
/// Ordered by topology version first, then by the per-node counter, then by the join
/// order of the node that produced it. A stamp produced after a topology change is
/// therefore newer than anything produced before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxVersion {
    pub topology_version: u64,
    pub order: u64,
    pub node_order: u64,
}

impl TxVersion {
    /// Version of a key that was never written.
    pub const ZERO: TxVersion = TxVersion {
        topology_version: 0,
        order: 0,
        node_order: 0,
    };

    pub fn new(topology_version: u64, order: u64, node_order: u64) -> Self {
        Self {
            topology_version,
            order,
            node_order,
        }
    }
}

impl fmt::Display for TxVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.topology_version, self.order, self.node_order)
    }
}

/// Per-node version source. Catches up with versions seen from peers so that stamps
/// produced here never sort before something this node has already observed.
pub struct VersionGenerator {
    node_order: u64,
    counter: AtomicU64,
}

impl VersionGenerator {
    pub fn new(node_order: u64) -> Self {
        Self {
            node_order,
            counter: AtomicU64::new(0),
        }
    }

    pub fn next(&self, topology_version: u64) -> TxVersion {
        let order = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        TxVersion::new(topology_version, order, self.node_order)
    }

    pub fn on_received(&self, version: &TxVersion) {
        self.counter.fetch_max(version.order, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxState {
    Active,
    Preparing,
    Prepared,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    Unknown,
}

impl TxState {
    pub fn can_transition(self, next: TxState) -> bool {
        use TxState::*;
        matches!(
            (self, next),
            (Active, Preparing)
                | (Active, RollingBack)
                | (Preparing, Prepared)
                | (Preparing, RollingBack)
                | (Preparing, Unknown)
                | (Prepared, Committing)
                | (Prepared, RollingBack)
                | (Committing, Committed)
                | (Committing, Unknown)
                | (RollingBack, RolledBack)
                | (RollingBack, Unknown)
        )
    }

    pub fn is_final(self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack | TxState::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Concurrency {
    Optimistic,
    Pessimistic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Isolation {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxRole {
    /// Originating node; routes operations and relays the outcome.
    Near,
    /// Primary owner of at least one key; drives prepare and finish.
    Primary,
    /// Backup owner or near reader receiving resolved writes.
    Backup,
}

/// A deferred update applied to the current value by the primary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Delta {
    Add(i64),
    Append(String),
}

impl Delta {
    pub fn apply(&self, current: Option<&Value>) -> CacheResult<Value> {
        match (self, current) {
            (Delta::Add(n), None) => Ok(Value::from(*n)),
            (Delta::Add(n), Some(v)) => v
                .as_i64()
                .map(|cur| Value::from(cur + n))
                .ok_or_else(|| CacheError::Serialization(format!("cannot add to {}", v))),
            (Delta::Append(s), None) => Ok(Value::String(s.clone())),
            (Delta::Append(s), Some(Value::String(cur))) => Ok(Value::String(format!("{}{}", cur, s))),
            (Delta::Append(_), Some(v)) => {
                Err(CacheError::Serialization(format!("cannot append to {}", v)))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TxOp {
    Read,
    Update,
    Delete,
    Transform(Delta),
}

impl TxOp {
    pub fn is_write(&self) -> bool {
        !matches!(self, TxOp::Read)
    }
}

/// One key touched by a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxEntry {
    pub key: String,
    pub partition: u32,
    pub op: TxOp,
    /// New value for `Update`; resolved value once a transform has been applied.
    pub value: Option<Value>,
    /// Version observed when the key was read, if it was.
    pub read_version: Option<TxVersion>,
    /// Version of the lock taken for this entry (pessimistic only).
    pub lock_version: Option<TxVersion>,
    pub group_lock: bool,
}

impl TxEntry {
    pub fn new(key: impl Into<String>, partition: u32, op: TxOp, value: Option<Value>) -> Self {
        Self {
            key: key.into(),
            partition,
            op,
            value,
            read_version: None,
            lock_version: None,
            group_lock: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxOptions {
    pub concurrency: Concurrency,
    pub isolation: Isolation,
    /// Falls back to the configured default.
    pub timeout: Option<Duration>,
    /// Fail instead of excluding keys whose partitions moved away.
    pub require_all_partitions: bool,
    /// Lock this key once for every key of its partition instead of each key.
    pub group_lock_key: Option<String>,
}

impl TxOptions {
    pub fn new(concurrency: Concurrency, isolation: Isolation) -> Self {
        Self {
            concurrency,
            isolation,
            timeout: None,
            require_all_partitions: false,
            group_lock_key: None,
        }
    }

    pub fn pessimistic() -> Self {
        Self::new(Concurrency::Pessimistic, Isolation::RepeatableRead)
    }

    pub fn optimistic(isolation: Isolation) -> Self {
        Self::new(Concurrency::Optimistic, isolation)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn requiring_all_partitions(mut self) -> Self {
        self.require_all_partitions = true;
        self
    }

    pub fn with_group_lock(mut self, key: impl Into<String>) -> Self {
        self.group_lock_key = Some(key.into());
        self
    }
}

/// What the caller learns once a transaction finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOutcome {
    pub xid: TxVersion,
    pub state: TxState,
    /// Keys dropped because their partition moved while the transaction ran.
    pub excluded_keys: Vec<String>,
}
