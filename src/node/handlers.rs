use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::node::{CacheNode, NodeStats};
use crate::error::CacheError;
use crate::messaging::protocol::Envelope;
use crate::txn::types::{Concurrency, Delta, Isolation, TxOptions, TxOutcome};

#[derive(Debug, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WriteResponse {
    pub success: bool,
    pub outcome: Option<TxOutcome>,
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GetResponse {
    pub value: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TxOpRequest {
    Get { key: String },
    Put { key: String, value: Value },
    Remove { key: String },
    Add { key: String, delta: i64 },
    Append { key: String, suffix: String },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TxRequest {
    pub concurrency: Concurrency,
    pub isolation: Isolation,
    pub timeout_ms: Option<u64>,
    pub ops: Vec<TxOpRequest>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TxResponse {
    pub success: bool,
    pub outcome: Option<TxOutcome>,
    pub reads: BTreeMap<String, Option<Value>>,
    pub error: Option<String>,
}

fn status_of(e: &CacheError) -> StatusCode {
    match e {
        CacheError::Timeout(_) | CacheError::LockTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
        CacheError::InvalidState { .. } | CacheError::Serialization(_) => StatusCode::BAD_REQUEST,
        e if e.is_retryable() => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn handle_message(
    Extension(node): Extension<Arc<CacheNode>>,
    Json(envelope): Json<Envelope>,
) -> StatusCode {
    node.dispatch(envelope);
    StatusCode::ACCEPTED
}

pub async fn handle_put(
    Extension(node): Extension<Arc<CacheNode>>,
    Json(req): Json<PutRequest>,
) -> (StatusCode, Json<WriteResponse>) {
    match node.put(&req.key, req.value).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(WriteResponse {
                success: true,
                outcome: Some(outcome),
                error: None,
            }),
        ),
        Err(e) => {
            tracing::error!("Failed to put '{}': {}", req.key, e);
            (
                status_of(&e),
                Json(WriteResponse {
                    error: Some(e.to_string()),
                    ..Default::default()
                }),
            )
        }
    }
}

pub async fn handle_remove(
    Extension(node): Extension<Arc<CacheNode>>,
    Path(key): Path<String>,
) -> (StatusCode, Json<WriteResponse>) {
    match node.remove(&key).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(WriteResponse {
                success: true,
                outcome: Some(outcome),
                error: None,
            }),
        ),
        Err(e) => {
            tracing::error!("Failed to remove '{}': {}", key, e);
            (
                status_of(&e),
                Json(WriteResponse {
                    error: Some(e.to_string()),
                    ..Default::default()
                }),
            )
        }
    }
}

pub async fn handle_get(
    Extension(node): Extension<Arc<CacheNode>>,
    Path(key): Path<String>,
) -> (StatusCode, Json<GetResponse>) {
    match node.get(&key).await {
        Ok(Some(value)) => (
            StatusCode::OK,
            Json(GetResponse {
                value: Some(value),
                error: None,
            }),
        ),
        Ok(None) => (StatusCode::NOT_FOUND, Json(GetResponse::default())),
        Err(e) => {
            tracing::error!("Failed to get '{}': {}", key, e);
            (
                status_of(&e),
                Json(GetResponse {
                    value: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

/// Runs a batch of operations as one explicit transaction.
pub async fn handle_tx(
    Extension(node): Extension<Arc<CacheNode>>,
    Json(req): Json<TxRequest>,
) -> (StatusCode, Json<TxResponse>) {
    let mut options = TxOptions::new(req.concurrency, req.isolation);
    options.timeout = req.timeout_ms.map(Duration::from_millis);

    let fail = |e: CacheError, reads: BTreeMap<String, Option<Value>>| {
        tracing::warn!("Transaction failed: {}", e);
        (
            status_of(&e),
            Json(TxResponse {
                reads,
                error: Some(e.to_string()),
                ..Default::default()
            }),
        )
    };

    let tx = match node.begin(options) {
        Ok(tx) => tx,
        Err(e) => return fail(e, BTreeMap::new()),
    };

    let mut reads = BTreeMap::new();
    for op in req.ops {
        let result = match op {
            TxOpRequest::Get { key } => match tx.get(&key).await {
                Ok(value) => {
                    reads.insert(key, value);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            TxOpRequest::Put { key, value } => tx.put(&key, value).await,
            TxOpRequest::Remove { key } => tx.remove(&key).await,
            TxOpRequest::Add { key, delta } => tx.transform(&key, Delta::Add(delta)).await,
            TxOpRequest::Append { key, suffix } => tx.transform(&key, Delta::Append(suffix)).await,
        };
        if let Err(e) = result {
            let _ = tx.rollback().await;
            return fail(e, reads);
        }
    }

    match tx.commit().await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(TxResponse {
                success: true,
                outcome: Some(outcome),
                reads,
                error: None,
            }),
        ),
        Err(e) => fail(e, reads),
    }
}

pub async fn handle_stats(Extension(node): Extension<Arc<CacheNode>>) -> Json<NodeStats> {
    Json(node.stats())
}
