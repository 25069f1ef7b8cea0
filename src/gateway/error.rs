use axum::http::StatusCode;
use thiserror::Error;

use crate::storage::types::PartitionId;

/// Errors produced while routing a request to the store.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The resolver knows no replica accepting writes for the partition.
    #[error("no primary available for partition {partition}")]
    NoPrimary { partition: PartitionId },

    /// The resolved replica could not be reached. Re-resolve and retry.
    #[error("store unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid store response: {0}")]
    Decode(String),

    /// The store answered with a non-success status.
    #[error("store answered {status}")]
    Upstream { status: StatusCode },
}

impl GatewayError {
    /// HTTP status returned to the gateway's caller.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NoPrimary { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Transport(_) | GatewayError::Decode(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Upstream { status } => *status,
        }
    }
}
