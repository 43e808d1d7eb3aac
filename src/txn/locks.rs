use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::oneshot;

use super::types::TxVersion;
use crate::error::{CacheError, CacheResult};

struct LockQueue {
    owner: TxVersion,
    waiters: VecDeque<(TxVersion, oneshot::Sender<()>)>,
}

/// Per-key FIFO lock queues.
///
/// A lock is owned by a transaction id and is re-entrant for that id. Waiters are
/// granted in arrival order. Deadlocks are not detected; a waiter simply gives up
/// after its timeout.
#[derive(Default)]
pub struct LockTable {
    queues: Mutex<HashMap<String, LockQueue>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str, xid: TxVersion, timeout: Duration) -> CacheResult<()> {
        let rx = {
            let mut queues = self.queues.lock();
            match queues.get_mut(key) {
                None => {
                    queues.insert(
                        key.to_string(),
                        LockQueue {
                            owner: xid,
                            waiters: VecDeque::new(),
                        },
                    );
                    return Ok(());
                }
                Some(queue) if queue.owner == xid => return Ok(()),
                Some(queue) => {
                    let (tx, rx) = oneshot::channel();
                    queue.waiters.push_back((xid, tx));
                    rx
                }
            }
        };

        tracing::debug!("Waiting for lock on '{}' (xid={})", key, xid);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(CacheError::Topology(format!(
                "lock queue for '{}' was dropped",
                key
            ))),
            Err(_) => {
                let mut queues = self.queues.lock();
                if let Some(queue) = queues.get_mut(key) {
                    // The grant may have raced with the timeout.
                    if queue.owner == xid {
                        return Ok(());
                    }
                    queue.waiters.retain(|(waiter, _)| *waiter != xid);
                }
                Err(CacheError::LockTimeout {
                    key: key.to_string(),
                })
            }
        }
    }

    /// Releases `key` if `xid` holds it and hands it to the next live waiter.
    pub fn unlock(&self, key: &str, xid: TxVersion) -> bool {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(key) else {
            return false;
        };
        if queue.owner != xid {
            return false;
        }

        while let Some((next, tx)) = queue.waiters.pop_front() {
            if tx.send(()).is_ok() {
                queue.owner = next;
                return true;
            }
        }

        queues.remove(key);
        true
    }

    pub fn owner(&self, key: &str) -> Option<TxVersion> {
        self.queues.lock().get(key).map(|q| q.owner)
    }

    /// Transactions queued behind the current owner of `key`.
    pub fn waiters(&self, key: &str) -> Vec<TxVersion> {
        self.queues
            .lock()
            .get(key)
            .map(|q| q.waiters.iter().map(|(x, _)| *x).collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().is_empty()
    }

    /// Drops every queue; pending waiters observe a closed channel.
    pub fn clear(&self) {
        self.queues.lock().clear();
    }
}
