use std::time::Duration;
use tokio::sync::watch;

use crate::error::{CacheError, CacheResult};

/// Per-version admission barrier.
///
/// Holds the highest topology version whose exchange has completed. Transactions
/// pinned to a version wait here until the local node has finished that exchange.
pub struct TopologyBarrier {
    ready: watch::Sender<u64>,
}

impl Default for TopologyBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyBarrier {
    pub fn new() -> Self {
        let (ready, _) = watch::channel(0);
        Self { ready }
    }

    /// Latest version transactions may be admitted at.
    pub fn ready_version(&self) -> u64 {
        *self.ready.borrow()
    }

    pub fn complete(&self, version: u64) {
        self.ready.send_if_modified(|ready| {
            if version > *ready {
                *ready = version;
                true
            } else {
                false
            }
        });
    }

    pub async fn wait_for(&self, version: u64, timeout: Duration) -> CacheResult<u64> {
        let mut rx = self.ready.subscribe();
        let wait = rx.wait_for(|ready| *ready >= version);

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(ready)) => Ok(*ready),
            Ok(Err(_)) => Err(CacheError::Topology("topology barrier closed".to_string())),
            Err(_) => Err(CacheError::Timeout(format!(
                "exchange for topology version {} did not complete",
                version
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_waiters_released_when_version_completes() {
        let barrier = Arc::new(TopologyBarrier::new());
        barrier.complete(1);

        let waiter = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.wait_for(3, Duration::from_secs(1)).await })
        };

        barrier.complete(2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        barrier.complete(3);
        assert_eq!(waiter.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_version_never_goes_back() {
        let barrier = TopologyBarrier::new();
        barrier.complete(5);
        barrier.complete(4);

        assert_eq!(barrier.ready_version(), 5);
        assert_eq!(barrier.wait_for(2, Duration::from_millis(10)).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let barrier = TopologyBarrier::new();

        let err = barrier.wait_for(1, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout(_)));
    }
}
