use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::protocol::{ENDPOINT_MESSAGE, Envelope};
use crate::error::{CacheError, CacheResult};
use crate::membership::types::{ClusterNode, NodeId};

/// Delivers envelopes to peers. Delivery is one-way; responses come back as their
/// own envelopes and are matched through the mini-future registry.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, to: &ClusterNode, envelope: Envelope) -> CacheResult<()>;
}

/// JSON over HTTP to [`ENDPOINT_MESSAGE`], retried with backoff and jitter.
pub struct HttpTransport {
    http_client: reqwest::Client,
    timeout: Duration,
    attempts: usize,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            timeout,
            attempts: 3,
        }
    }

    async fn post_with_retry(&self, url: String, payload: &Envelope) -> CacheResult<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..self.attempts {
            let response = self
                .http_client
                .post(url.clone())
                .json(payload)
                .timeout(self.timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == self.attempts {
                        return Err(CacheError::Transport(e.to_string()));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(CacheError::Transport("Retry attempts exhausted".to_string()))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, to: &ClusterNode, envelope: Envelope) -> CacheResult<()> {
        let kind = envelope.message.kind();
        let url = format!("http://{}{}", to.addr, ENDPOINT_MESSAGE);
        let response = self.post_with_retry(url, &envelope).await?;

        if !response.status().is_success() {
            return Err(CacheError::Transport(format!(
                "{} to {} failed with {}",
                kind,
                to.id,
                response.status()
            )));
        }

        Ok(())
    }
}

type DropFilter = Box<dyn Fn(&NodeId, &Envelope) -> bool + Send + Sync>;

/// In-process transport connecting nodes of one test cluster.
#[derive(Default)]
pub struct LocalHub {
    inboxes: DashMap<NodeId, mpsc::UnboundedSender<Envelope>>,
    filter: RwLock<Option<DropFilter>>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, id: &NodeId) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert(id.clone(), tx);
        rx
    }

    /// Makes `id` unreachable, as if its process stopped.
    pub fn unregister(&self, id: &NodeId) {
        self.inboxes.remove(id);
    }

    /// Silently drops every envelope for which `filter(to, envelope)` is true.
    pub fn drop_where<F>(&self, filter: F)
    where
        F: Fn(&NodeId, &Envelope) -> bool + Send + Sync + 'static,
    {
        *self.filter.write() = Some(Box::new(filter));
    }

    pub fn clear_filter(&self) {
        *self.filter.write() = None;
    }
}

#[async_trait]
impl Transport for LocalHub {
    async fn send(&self, to: &ClusterNode, envelope: Envelope) -> CacheResult<()> {
        if let Some(filter) = self.filter.read().as_ref()
            && filter(&to.id, &envelope)
        {
            tracing::debug!("Hub dropped {} to {}", envelope.message.kind(), to.id);
            return Ok(());
        }

        let inbox = self
            .inboxes
            .get(&to.id)
            .map(|e| e.value().clone())
            .ok_or_else(|| CacheError::Topology(format!("node {} is unreachable", to.id)))?;

        inbox
            .send(envelope)
            .map_err(|_| CacheError::Topology(format!("node {} is unreachable", to.id)))
    }
}
