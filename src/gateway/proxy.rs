use axum::http::StatusCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::error::GatewayError;
use super::partitioner::Partitioner;
use super::resolver::PartitionResolver;
use crate::storage::GET_ALL_LIMIT;
use crate::storage::protocol::{ACTIVITY_HEADER, VoteCount};
use crate::storage::types::PartitionId;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_READ_ATTEMPTS: usize = 3;

/// Where a key's requests go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub partition: PartitionId,
    /// Base URL of the partition's primary replica.
    pub address: String,
}

/// Forwards vote requests to the store replica owning each key.
///
/// The gateway holds no vote state. It routes through a [`PartitionResolver`]
/// and invalidates a route as soon as its replica stops answering.
pub struct PartitionGateway {
    partitioner: Partitioner,
    resolver: Arc<dyn PartitionResolver>,
    http_client: reqwest::Client,
    request_count: AtomicU64,
    timeout: Duration,
    read_attempts: usize,
}

impl PartitionGateway {
    pub fn new(partitioner: Partitioner, resolver: Arc<dyn PartitionResolver>) -> Self {
        Self {
            partitioner,
            resolver,
            http_client: reqwest::Client::new(),
            request_count: AtomicU64::new(0),
            timeout: DEFAULT_TIMEOUT,
            read_attempts: DEFAULT_READ_ATTEMPTS,
        }
    }

    /// Per-request timeout for calls to the store.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// How many times a read is attempted before giving up (at least once).
    pub fn with_read_attempts(mut self, attempts: usize) -> Self {
        self.read_attempts = attempts.max(1);
        self
    }

    pub fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }

    /// Counts one handled request; returns the new total.
    pub fn record_request(&self) -> u64 {
        self.request_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub async fn route(&self, key: &str) -> Result<Endpoint, GatewayError> {
        let partition = self.partitioner.get_partition(key);
        let address = self.resolver.resolve(partition).await?;
        Ok(Endpoint { partition, address })
    }

    /// Reads the tallies of every partition, capped at [`GET_ALL_LIMIT`].
    pub async fn forward_get(&self, activity_id: &str) -> Result<Vec<VoteCount>, GatewayError> {
        let mut votes = Vec::new();
        for partition in self.partitioner.partitions() {
            if votes.len() >= GET_ALL_LIMIT {
                break;
            }
            votes.extend(self.fetch_partition(partition, activity_id).await?);
        }
        votes.truncate(GET_ALL_LIMIT);
        Ok(votes)
    }

    async fn fetch_partition(
        &self,
        partition: PartitionId,
        activity_id: &str,
    ) -> Result<Vec<VoteCount>, GatewayError> {
        let mut delay_ms = 150u64;
        let mut attempt = 0;

        loop {
            attempt += 1;
            // Re-resolved on every attempt: the primary may have moved.
            let endpoint = self.resolver.resolve(partition).await?;
            let response = self
                .http_client
                .get(format!("{}/api/votes?partition={}", endpoint, partition))
                .header(ACTIVITY_HEADER, activity_id)
                .timeout(self.timeout)
                .send()
                .await;

            let error = match response {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<Vec<VoteCount>>()
                        .await
                        .map_err(|e| GatewayError::Decode(e.to_string()));
                }
                Ok(resp) if resp.status() == StatusCode::SERVICE_UNAVAILABLE => {
                    GatewayError::Upstream {
                        status: resp.status(),
                    }
                }
                Ok(resp) => {
                    return Err(GatewayError::Upstream {
                        status: resp.status(),
                    });
                }
                Err(e) => GatewayError::Transport(e),
            };

            self.resolver.invalidate(partition, &endpoint);
            if attempt >= self.read_attempts {
                return Err(error);
            }
            tracing::warn!(
                "Read from {} failed (attempt {}/{}): {}",
                endpoint,
                attempt,
                self.read_attempts,
                error
            );

            let jitter = rand::random::<u64>() % 50;
            tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
            delay_ms = (delay_ms * 2).min(1200);
        }
    }

    /// Adds one vote to `key` and returns the store's status unchanged.
    ///
    /// Writes are attempted once; retrying is left to the caller.
    pub async fn forward_increment(
        &self,
        key: &str,
        activity_id: &str,
    ) -> Result<StatusCode, GatewayError> {
        let endpoint = self.route(key).await?;
        let url = format!(
            "{}/api/{}?partition={}",
            endpoint.address,
            urlencoding::encode(key),
            endpoint.partition
        );

        let response = self
            .http_client
            .post(url)
            .header(ACTIVITY_HEADER, activity_id)
            .timeout(self.timeout)
            .send()
            .await;

        match response {
            Ok(resp) => {
                let status = resp.status();
                if status == StatusCode::SERVICE_UNAVAILABLE {
                    self.resolver.invalidate(endpoint.partition, &endpoint.address);
                }
                Ok(status)
            }
            Err(e) => {
                self.resolver.invalidate(endpoint.partition, &endpoint.address);
                Err(GatewayError::Transport(e))
            }
        }
    }
}
