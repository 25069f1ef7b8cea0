use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::error::StoreError;
use super::protocol::{
    ACTIVITY_HEADER, ENDPOINT_KEY, ENDPOINT_REPLICATE, ENDPOINT_STATUS, ENDPOINT_VOTES,
    PartitionQuery, PartitionStatus, ReplicateRequest, ReplicateResponse, StatusResponse,
    VoteCount,
};
use super::store::CounterStore;
use super::types::{DEFAULT_PARTITION, PartitionId};

/// `Cache-Control` value for tallies, which change on every vote.
pub const NO_CACHE: &str = "no-cache, must-revalidate";

/// Everything the store node's handlers need, injected as an extension.
pub struct StoreNode {
    pub store: Arc<CounterStore>,
    /// Cancelled when the node shuts down; handlers pass child tokens down.
    pub shutdown: CancellationToken,
    /// How many times a vote is retried after a commit conflict.
    pub conflict_retries: usize,
}

impl StoreNode {
    pub fn new(store: Arc<CounterStore>, shutdown: CancellationToken, conflict_retries: usize) -> Self {
        Self {
            store,
            shutdown,
            conflict_retries,
        }
    }
}

pub fn router(node: Arc<StoreNode>) -> Router {
    Router::new()
        .route(ENDPOINT_VOTES, get(handle_get_votes))
        .route(ENDPOINT_KEY, post(handle_post_vote).delete(handle_delete_vote))
        .route(ENDPOINT_REPLICATE, post(handle_replicate))
        .route(ENDPOINT_STATUS, get(handle_status))
        .layer(Extension(node))
}

/// HTTP status for a store error.
pub fn status_for(err: &StoreError) -> StatusCode {
    match err {
        StoreError::Conflict { .. } | StoreError::AlreadyPrimary { .. } => StatusCode::CONFLICT,
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::NotPrimary { .. } | StoreError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: StoreError) -> (StatusCode, String) {
    (status_for(&err), err.to_string())
}

/// Returns the caller's activity id, or a fresh one.
pub fn activity_id(headers: &HeaderMap) -> String {
    headers
        .get(ACTIVITY_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn partition_of(query: &PartitionQuery) -> PartitionId {
    query.partition.unwrap_or(DEFAULT_PARTITION)
}

pub async fn handle_get_votes(
    Extension(node): Extension<Arc<StoreNode>>,
    Query(query): Query<PartitionQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let partition = partition_of(&query);
    let span = tracing::info_span!("get_votes", activity_id = %activity_id(&headers), partition);

    async move {
        let cancel = node.shutdown.child_token();
        let records = node
            .store
            .get_all(partition, &cancel)
            .await
            .map_err(|e| {
                tracing::error!("Failed to read votes: {}", e);
                error_response(e)
            })?;

        let votes: Vec<VoteCount> = records
            .into_iter()
            .map(|record| (record.name().to_string(), record.count()))
            .collect();
        tracing::debug!(count = votes.len(), "Served votes");

        Ok::<_, (StatusCode, String)>(([(header::CACHE_CONTROL, NO_CACHE)], Json(votes)))
    }
    .instrument(span)
    .await
}

pub async fn handle_post_vote(
    Extension(node): Extension<Arc<StoreNode>>,
    Path(key): Path<String>,
    Query(query): Query<PartitionQuery>,
    headers: HeaderMap,
) -> Result<StatusCode, (StatusCode, String)> {
    let partition = partition_of(&query);
    let span = tracing::info_span!(
        "post_vote",
        activity_id = %activity_id(&headers),
        partition,
        key = %key
    );

    async move {
        let cancel = node.shutdown.child_token();
        let mut conflicts = 0;

        loop {
            match node.store.upsert(partition, &key, 1, &cancel).await {
                Ok(record) => {
                    tracing::info!(count = record.count(), "Vote recorded");
                    return Ok(StatusCode::NO_CONTENT);
                }
                Err(StoreError::Conflict { .. }) if conflicts < node.conflict_retries => {
                    conflicts += 1;
                    tracing::debug!(attempt = conflicts, "Retrying vote after conflict");
                }
                Err(e) => {
                    tracing::warn!("Failed to record vote: {}", e);
                    return Err(error_response(e));
                }
            }
        }
    }
    .instrument(span)
    .await
}

pub async fn handle_delete_vote(
    Extension(node): Extension<Arc<StoreNode>>,
    Path(key): Path<String>,
    Query(query): Query<PartitionQuery>,
) -> Result<StatusCode, (StatusCode, String)> {
    node.store
        .delete(partition_of(&query), &key)
        .await
        .map(|_| StatusCode::OK)
        .map_err(error_response)
}

pub async fn handle_replicate(
    Extension(node): Extension<Arc<StoreNode>>,
    Json(req): Json<ReplicateRequest>,
) -> (StatusCode, Json<ReplicateResponse>) {
    let partition = req.partition;
    let lsn = req.lsn;

    match node.store.apply_replicated(partition, req.into_mutation()).await {
        Ok(applied) => {
            if applied {
                tracing::info!("Stored replica for partition {} at lsn {}", partition, lsn);
            } else {
                tracing::debug!("Ignored duplicate replica for partition {} at lsn {}", partition, lsn);
            }
            (StatusCode::OK, Json(ReplicateResponse { success: true }))
        }
        Err(e) => {
            tracing::error!("Failed to store replica: {}", e);
            (status_for(&e), Json(ReplicateResponse { success: false }))
        }
    }
}

pub async fn handle_status(Extension(node): Extension<Arc<StoreNode>>) -> Json<StatusResponse> {
    let substrate = node.store.substrate();
    let mut ids = node.store.partition_ids();
    if !ids.contains(&DEFAULT_PARTITION) {
        ids.insert(0, DEFAULT_PARTITION);
    }

    let partitions = ids
        .into_iter()
        .map(|partition| PartitionStatus {
            partition,
            lsn: node.store.last_lsn(partition),
            keys: node.store.key_count(partition),
            primary: substrate.current_primary(partition),
        })
        .collect();

    Json(StatusResponse {
        role: substrate.role(),
        partitions,
    })
}
