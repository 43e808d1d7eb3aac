use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::protocol::CacheMessage;
use crate::error::{CacheError, CacheResult};
use crate::membership::types::NodeId;

struct Pending {
    node: NodeId,
    tx: oneshot::Sender<CacheResult<CacheMessage>>,
}

/// Outstanding requests keyed by `(future_id, mini_id)`.
///
/// A response completes its waiter at most once; duplicates and late responses are
/// dropped. When a node leaves, every request still waiting on it fails with a
/// topology error.
#[derive(Default)]
pub struct MiniFutures {
    pending: DashMap<(Uuid, u32), Pending>,
    next_mini: AtomicU32,
}

impl MiniFutures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        future_id: Uuid,
        node: &NodeId,
    ) -> (u32, oneshot::Receiver<CacheResult<CacheMessage>>) {
        let mini_id = self.next_mini.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            (future_id, mini_id),
            Pending {
                node: node.clone(),
                tx,
            },
        );
        (mini_id, rx)
    }

    pub fn complete(&self, future_id: Uuid, mini_id: u32, message: CacheMessage) -> bool {
        match self.pending.remove(&(future_id, mini_id)) {
            Some((_, pending)) => pending.tx.send(Ok(message)).is_ok(),
            None => {
                tracing::debug!(
                    "Dropping response for unknown future {}/{}",
                    future_id,
                    mini_id
                );
                false
            }
        }
    }

    pub fn cancel(&self, future_id: Uuid, mini_id: u32) {
        self.pending.remove(&(future_id, mini_id));
    }

    pub fn on_node_left(&self, node: &NodeId) -> usize {
        let keys: Vec<(Uuid, u32)> = self
            .pending
            .iter()
            .filter(|e| &e.value().node == node)
            .map(|e| *e.key())
            .collect();

        let mut failed = 0;
        for key in keys {
            if let Some((_, pending)) = self.pending.remove(&key) {
                let _ = pending
                    .tx
                    .send(Err(CacheError::Topology(format!("node {} left the cluster", node))));
                failed += 1;
            }
        }

        if failed > 0 {
            tracing::info!("Failed {} pending request(s) to departed node {}", failed, node);
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::protocol::FinishResponse;

    fn finish(future_id: Uuid, mini_id: u32) -> CacheMessage {
        CacheMessage::FinishResponse(FinishResponse {
            future_id,
            mini_id,
            error: None,
        })
    }

    #[tokio::test]
    async fn test_response_completes_once() {
        let futures = MiniFutures::new();
        let id = Uuid::new_v4();
        let (mini, rx) = futures.register(id, &NodeId::from("b"));

        assert!(futures.complete(id, mini, finish(id, mini)));
        assert!(!futures.complete(id, mini, finish(id, mini)), "duplicate is dropped");

        assert!(rx.await.unwrap().is_ok());
        assert!(futures.is_empty());
    }

    #[tokio::test]
    async fn test_departed_node_fails_only_its_waiters() {
        let futures = MiniFutures::new();
        let id = Uuid::new_v4();
        let (_, to_b) = futures.register(id, &NodeId::from("b"));
        let (_, to_c) = futures.register(id, &NodeId::from("c"));

        assert_eq!(futures.on_node_left(&NodeId::from("b")), 1);

        assert!(matches!(to_b.await.unwrap(), Err(CacheError::Topology(_))));
        assert_eq!(futures.len(), 1);
        drop(to_c);
    }
}
