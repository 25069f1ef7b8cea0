use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse},
    routing::get,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Instrument;

use super::error::GatewayError;
use super::proxy::PartitionGateway;
use crate::storage::handlers::{NO_CACHE, activity_id};
use crate::storage::protocol::{ENDPOINT_KEY, ENDPOINT_VOTES};

/// The only file the gateway serves.
pub const INDEX_FILE: &str = "index.html";

#[derive(Clone)]
pub struct GatewayState {
    pub gateway: Arc<PartitionGateway>,
    /// Directory holding [`INDEX_FILE`].
    pub static_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub requests: u64,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route(ENDPOINT_VOTES, get(handle_get_votes))
        .route(
            ENDPOINT_KEY,
            get(handle_get_file)
                .post(handle_post_vote)
                .delete(handle_delete_vote),
        )
        .route("/health", get(handle_health))
        .with_state(state)
}

fn error_response(err: GatewayError) -> (StatusCode, String) {
    (err.status(), err.to_string())
}

pub async fn handle_get_votes(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    state.gateway.record_request();
    let activity = activity_id(&headers);
    let span = tracing::info_span!("gateway_get_votes", activity_id = %activity);

    async move {
        let votes = state.gateway.forward_get(&activity).await.map_err(|e| {
            tracing::warn!("Failed to read votes: {}", e);
            error_response(e)
        })?;
        Ok::<_, (StatusCode, String)>(([(header::CACHE_CONTROL, NO_CACHE)], Json(votes)))
    }
    .instrument(span)
    .await
}

pub async fn handle_post_vote(
    State(state): State<GatewayState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, (StatusCode, String)> {
    state.gateway.record_request();
    let activity = activity_id(&headers);
    let span = tracing::info_span!("gateway_post_vote", activity_id = %activity, key = %key);

    async move {
        let status = state
            .gateway
            .forward_increment(&key, &activity)
            .await
            .map_err(|e| {
                tracing::warn!("Failed to forward vote: {}", e);
                error_response(e)
            })?;
        tracing::debug!(%status, "Vote forwarded");
        Ok::<_, (StatusCode, String)>(status)
    }
    .instrument(span)
    .await
}

pub async fn handle_delete_vote(
    State(state): State<GatewayState>,
    Path(key): Path<String>,
) -> StatusCode {
    state.gateway.record_request();
    tracing::debug!("Delete requested for {}; deletes are not supported", key);
    StatusCode::NOT_FOUND
}

pub async fn handle_get_file(
    State(state): State<GatewayState>,
    Path(file): Path<String>,
) -> Result<Html<String>, StatusCode> {
    state.gateway.record_request();
    if file != INDEX_FILE {
        return Err(StatusCode::NOT_FOUND);
    }

    let path = state.static_dir.join(INDEX_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(body) => Ok(Html(body)),
        Err(e) => {
            tracing::warn!("Failed to read {}: {}", path.display(), e);
            Err(StatusCode::NOT_FOUND)
        }
    }
}

pub async fn handle_health(State(state): State<GatewayState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        requests: state.gateway.request_count(),
    })
}
