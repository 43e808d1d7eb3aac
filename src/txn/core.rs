use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;

use super::types::{Concurrency, Isolation, TxEntry, TxOptions, TxOutcome, TxRole, TxState, TxVersion};
use crate::error::{CacheError, CacheResult};
use crate::membership::types::NodeId;
use crate::topology::partition::PartitionReservation;

/// Entries one participant receives from the primary.
#[derive(Debug, Clone, Default)]
pub struct TxMapping {
    /// Resolved writes for a backup owner.
    pub writes: Vec<TxEntry>,
    /// Writes for a node holding near read copies of the keys.
    pub near_writes: Vec<TxEntry>,
    /// Entry version each near reader is expected to hold.
    pub owned_versions: BTreeMap<String, TxVersion>,
}

impl TxMapping {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.near_writes.is_empty()
    }
}

/// Mutable bookkeeping of a transaction.
#[derive(Default)]
pub struct TxInner {
    pub writes: BTreeMap<String, TxEntry>,
    pub reads: BTreeMap<String, TxEntry>,
    pub near_writes: BTreeMap<String, TxEntry>,
    pub mappings: BTreeMap<NodeId, TxMapping>,
    pub locked_keys: BTreeSet<String>,
    pub reservations: BTreeMap<u32, PartitionReservation>,
    pub excluded_keys: BTreeSet<String>,
    pub invalid_partitions: BTreeSet<u32>,
    /// Primaries a near transaction has locked keys on or prepared with.
    pub primaries: BTreeSet<NodeId>,
    pub commit_version: Option<TxVersion>,
    /// Participants already committed while handling the prepare request.
    pub participants_committed: bool,
}

/// Outcome of a prepare or finish step, kept so a re-delivered request gets the
/// same answer without running the step twice.
#[derive(Debug, Clone, PartialEq)]
pub struct TxResult {
    pub state: TxState,
    pub commit_version: Option<TxVersion>,
    pub excluded_keys: Vec<String>,
    pub invalid_partitions: Vec<u32>,
    pub evicted_near_keys: Vec<String>,
    pub error: Option<CacheError>,
}

impl TxResult {
    pub fn ok(state: TxState) -> Self {
        Self {
            state,
            commit_version: None,
            excluded_keys: Vec::new(),
            invalid_partitions: Vec::new(),
            evicted_near_keys: Vec::new(),
            error: None,
        }
    }

    pub fn failed(state: TxState, error: CacheError) -> Self {
        Self {
            error: Some(error),
            ..Self::ok(state)
        }
    }

    pub fn into_result(self) -> CacheResult<Self> {
        match self.error.clone() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

/// Identity of a transaction on one node.
#[derive(Debug, Clone)]
pub struct TxOrigin {
    /// Local id of this transaction object.
    pub xid: TxVersion,
    /// Id the near node gave the transaction; shared by every participant.
    pub near_xid: TxVersion,
    pub top_ver: u64,
    pub near_node: NodeId,
    /// Node whose departure leaves this transaction without a coordinator.
    pub coordinator: NodeId,
}

/// One transaction, in whatever role this node plays for it.
///
/// Near, primary and backup transactions share this type and its state machine.
/// Role specific behavior lives in the `near`, `primary` and `remote` modules.
pub struct Transaction {
    pub role: TxRole,
    pub xid: TxVersion,
    pub near_xid: TxVersion,
    pub near_node: NodeId,
    pub coordinator: NodeId,
    pub concurrency: Concurrency,
    pub isolation: Isolation,
    pub timeout: Duration,
    pub require_all_partitions: bool,
    pub group_lock_key: Option<String>,
    top_ver: u64,
    state: Mutex<TxState>,
    rollback_only: AtomicBool,
    one_phase: AtomicBool,
    commit_decided: AtomicBool,
    orphaned: AtomicBool,
    started: Instant,
    last_activity: Mutex<Instant>,
    pub inner: Mutex<TxInner>,
    prepare_result: OnceCell<TxResult>,
    finish_result: OnceCell<TxResult>,
}

impl Transaction {
    pub fn new(role: TxRole, origin: TxOrigin, options: &TxOptions, timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            role,
            xid: origin.xid,
            near_xid: origin.near_xid,
            near_node: origin.near_node,
            coordinator: origin.coordinator,
            concurrency: options.concurrency,
            isolation: options.isolation,
            timeout,
            require_all_partitions: options.require_all_partitions,
            group_lock_key: options.group_lock_key.clone(),
            top_ver: origin.top_ver,
            state: Mutex::new(TxState::Active),
            rollback_only: AtomicBool::new(false),
            one_phase: AtomicBool::new(false),
            commit_decided: AtomicBool::new(false),
            orphaned: AtomicBool::new(false),
            started: now,
            last_activity: Mutex::new(now),
            inner: Mutex::new(TxInner::default()),
            prepare_result: OnceCell::new(),
            finish_result: OnceCell::new(),
        }
    }

    pub fn state(&self) -> TxState {
        *self.state.lock()
    }

    /// Moves to `next` if the state machine allows it; returns the previous state.
    pub fn transition(&self, next: TxState) -> CacheResult<TxState> {
        let mut state = self.state.lock();
        let current = *state;
        if !current.can_transition(next) {
            return Err(CacheError::invalid_state(current, &format!("{:?}", next)));
        }
        tracing::trace!("Tx {} ({:?}): {:?} -> {:?}", self.near_xid, self.role, current, next);
        *state = next;
        Ok(current)
    }

    pub fn try_transition(&self, next: TxState) -> bool {
        self.transition(next).is_ok()
    }

    /// Topology version the transaction is pinned to.
    pub fn topology_version(&self) -> u64 {
        self.top_ver
    }

    pub fn is_optimistic(&self) -> bool {
        self.concurrency == Concurrency::Optimistic
    }

    /// Whether reads must be validated or locked to stay repeatable.
    pub fn tracks_reads(&self) -> bool {
        self.isolation != Isolation::ReadCommitted
    }

    pub fn set_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::SeqCst);
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }

    pub fn set_one_phase(&self, one_phase: bool) {
        self.one_phase.store(one_phase, Ordering::SeqCst);
    }

    pub fn is_one_phase(&self) -> bool {
        self.one_phase.load(Ordering::SeqCst)
    }

    /// Records that the coordinator asked this node to commit.
    pub fn decide_commit(&self) {
        self.commit_decided.store(true, Ordering::SeqCst);
    }

    pub fn commit_decided(&self) -> bool {
        self.commit_decided.load(Ordering::SeqCst)
    }

    pub fn mark_orphaned(&self) {
        if !self.orphaned.swap(true, Ordering::SeqCst) {
            tracing::info!(
                "Tx {} ({:?}) lost its coordinator {}",
                self.near_xid,
                self.role,
                self.coordinator
            );
        }
    }

    pub fn is_orphaned(&self) -> bool {
        self.orphaned.load(Ordering::SeqCst)
    }

    pub fn is_timed_out(&self) -> bool {
        self.started.elapsed() >= self.timeout
    }

    /// Time left before the transaction times out.
    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.started.elapsed())
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Fails if the transaction can no longer accept operations.
    pub fn check_usable(&self) -> CacheResult<()> {
        let state = self.state();
        if state != TxState::Active {
            return Err(CacheError::invalid_state(state, "operation"));
        }
        if self.is_timed_out() {
            self.set_rollback_only();
            return Err(CacheError::Timeout(format!(
                "transaction {} exceeded {:?}",
                self.near_xid, self.timeout
            )));
        }
        if self.is_rollback_only() {
            return Err(CacheError::Rollback(format!(
                "transaction {} is marked rollback-only",
                self.near_xid
            )));
        }
        Ok(())
    }

    /// Runs the prepare step at most once; later callers get the first result.
    pub async fn prepare_once<F, Fut>(&self, f: F) -> TxResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TxResult>,
    {
        self.prepare_result.get_or_init(f).await.clone()
    }

    pub fn prepared_result(&self) -> Option<TxResult> {
        self.prepare_result.get().cloned()
    }

    /// Runs the finish step at most once; later callers get the first result.
    pub async fn finish_once<F, Fut>(&self, f: F) -> TxResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TxResult>,
    {
        self.finish_result.get_or_init(f).await.clone()
    }

    /// Options a fresh attempt of this transaction is started with.
    pub fn options(&self) -> TxOptions {
        TxOptions {
            concurrency: self.concurrency,
            isolation: self.isolation,
            timeout: Some(self.remaining()),
            require_all_partitions: self.require_all_partitions,
            group_lock_key: self.group_lock_key.clone(),
        }
    }

    pub fn excluded_keys(&self) -> Vec<String> {
        self.inner.lock().excluded_keys.iter().cloned().collect()
    }

    pub fn outcome(&self) -> TxOutcome {
        TxOutcome {
            xid: self.near_xid,
            state: self.state(),
            excluded_keys: self.excluded_keys(),
        }
    }

    /// Drops partition reservations held by this transaction.
    pub fn release_reservations(&self) {
        let reservations = std::mem::take(&mut self.inner.lock().reservations);
        drop(reservations);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(timeout: Duration) -> Transaction {
        let xid = TxVersion::new(1, 1, 1);
        Transaction::new(
            TxRole::Primary,
            TxOrigin {
                xid,
                near_xid: xid,
                top_ver: 1,
                near_node: NodeId::from("near"),
                coordinator: NodeId::from("near"),
            },
            &TxOptions::pessimistic(),
            timeout,
        )
    }

    #[test]
    fn test_transition_follows_state_machine() {
        let tx = tx(Duration::from_secs(5));

        assert_eq!(tx.transition(TxState::Preparing).unwrap(), TxState::Active);
        assert!(tx.transition(TxState::Committed).is_err());
        assert!(tx.try_transition(TxState::Prepared));
        assert_eq!(tx.state(), TxState::Prepared);
    }

    #[tokio::test]
    async fn test_prepare_runs_once() {
        let tx = tx(Duration::from_secs(5));

        let first = tx.prepare_once(|| async { TxResult::ok(TxState::Prepared) }).await;
        let second = tx
            .prepare_once(|| async { TxResult::ok(TxState::RolledBack) })
            .await;

        assert_eq!(first.state, TxState::Prepared);
        assert_eq!(second, first);
        assert_eq!(tx.prepared_result(), Some(first));
    }

    #[tokio::test]
    async fn test_timed_out_transaction_is_unusable() {
        let tx = tx(Duration::from_millis(10));
        assert!(tx.check_usable().is_ok());

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(tx.check_usable(), Err(CacheError::Timeout(_))));
        assert!(tx.is_rollback_only());
    }

    #[test]
    fn test_retry_options_carry_remaining_time() {
        let tx = tx(Duration::from_secs(5));

        let options = tx.options();

        assert_eq!(options.concurrency, Concurrency::Pessimistic);
        assert!(options.timeout.unwrap() <= Duration::from_secs(5));
    }
}
