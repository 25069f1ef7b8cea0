//! Partition resolvers.
//!
//! A resolver answers "which address accepts writes for this partition right
//! now". Answers may be cached, but the gateway invalidates them whenever the
//! address stops answering, so a failover is picked up on the next request.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;

use super::error::GatewayError;
use crate::storage::protocol::{ENDPOINT_STATUS, StatusResponse};
use crate::storage::replication::normalize_url;
use crate::storage::substrate::Role;
use crate::storage::types::PartitionId;

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[async_trait]
pub trait PartitionResolver: Send + Sync {
    /// Base URL of the current primary for `partition`.
    async fn resolve(&self, partition: PartitionId) -> Result<String, GatewayError>;

    /// Forgets `endpoint` as the primary for `partition`.
    fn invalidate(&self, partition: PartitionId, endpoint: &str);
}

/// Always resolves to one address, e.g. a load balancer in front of the store.
pub struct StaticResolver {
    endpoint: String,
}

impl StaticResolver {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: normalize_url(endpoint.into()),
        }
    }
}

#[async_trait]
impl PartitionResolver for StaticResolver {
    async fn resolve(&self, _partition: PartitionId) -> Result<String, GatewayError> {
        Ok(self.endpoint.clone())
    }

    fn invalidate(&self, _partition: PartitionId, _endpoint: &str) {}
}

/// Finds the primary among a fixed set of store nodes by probing their
/// status endpoint.
pub struct ReplicaSetResolver {
    candidates: Vec<String>,
    cache: DashMap<PartitionId, String>,
    http_client: reqwest::Client,
}

impl ReplicaSetResolver {
    pub fn new(candidates: Vec<String>) -> Self {
        Self {
            candidates: candidates.into_iter().map(normalize_url).collect(),
            cache: DashMap::new(),
            http_client: reqwest::Client::new(),
        }
    }

    /// The cached primary for `partition`, if any.
    pub fn cached(&self, partition: PartitionId) -> Option<String> {
        self.cache.get(&partition).map(|entry| entry.value().clone())
    }

    async fn probe(&self, candidate: &str) -> anyhow::Result<StatusResponse> {
        let status = self
            .http_client
            .get(format!("{}{}", candidate, ENDPOINT_STATUS))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json::<StatusResponse>()
            .await?;
        Ok(status)
    }
}

#[async_trait]
impl PartitionResolver for ReplicaSetResolver {
    async fn resolve(&self, partition: PartitionId) -> Result<String, GatewayError> {
        if let Some(endpoint) = self.cached(partition) {
            return Ok(endpoint);
        }

        for candidate in &self.candidates {
            match self.probe(candidate).await {
                Ok(status) if status.role == Role::Primary => {
                    tracing::info!("Resolved primary for partition {}: {}", partition, candidate);
                    self.cache.insert(partition, candidate.clone());
                    return Ok(candidate.clone());
                }
                Ok(_) => {
                    tracing::debug!("Candidate {} is not primary", candidate);
                }
                Err(e) => {
                    tracing::debug!("Failed to probe {}: {}", candidate, e);
                }
            }
        }

        tracing::warn!("No primary found for partition {}", partition);
        Err(GatewayError::NoPrimary { partition })
    }

    fn invalidate(&self, partition: PartitionId, endpoint: &str) {
        if self
            .cache
            .remove_if(&partition, |_, cached| cached == endpoint)
            .is_some()
        {
            tracing::info!("Invalidated route {} for partition {}", endpoint, partition);
        }
    }
}
