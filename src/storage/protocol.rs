//! Store Network Protocol
//!
//! Defines the API endpoints and Data Transfer Objects (DTOs) served by a
//! store node, both the public vote API and the internal replication API.
//!
//! These structures are serialized as JSON and sent over HTTP.

use serde::{Deserialize, Serialize};

use super::substrate::Role;
use super::types::{Mutation, PartitionId, VoteRecord};

// --- API Endpoints ---

/// Public endpoint returning every tally of a partition.
pub const ENDPOINT_VOTES: &str = "/api/votes";
/// Public endpoint for per-key operations (`POST` votes, `DELETE` removes).
pub const ENDPOINT_KEY: &str = "/api/:key";
/// Endpoint a primary uses to push committed mutations to its backups.
pub const ENDPOINT_REPLICATE: &str = "/internal/replicate";
/// Endpoint reporting the replica's role and progress.
pub const ENDPOINT_STATUS: &str = "/internal/status";

/// Header carrying the caller's activity id across hops.
pub const ACTIVITY_HEADER: &str = "activity-id";

// --- Data Transfer Objects ---

/// Query string selecting the partition a request targets.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PartitionQuery {
    /// Defaults to partition `0` when omitted.
    pub partition: Option<PartitionId>,
}

/// One `[name, count]` pair of the votes listing.
pub type VoteCount = (String, u64);

/// Payload for pushing a committed mutation from the primary to a backup.
///
/// `lsn` lets the backup ignore mutations it has already applied, so retried
/// pushes are harmless.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateRequest {
    /// The partition the mutation was committed to.
    pub partition: PartitionId,
    /// Sequence number of the commit within its partition.
    pub lsn: u64,
    /// Full new values of every record the commit wrote.
    pub records: Vec<VoteRecord>,
}

impl ReplicateRequest {
    pub fn new(partition: PartitionId, mutation: &Mutation) -> Self {
        Self {
            partition,
            lsn: mutation.lsn,
            records: mutation.records.clone(),
        }
    }

    pub fn into_mutation(self) -> Mutation {
        Mutation {
            lsn: self.lsn,
            records: self.records,
        }
    }
}

/// Acknowledgment for replication pushes.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReplicateResponse {
    /// Indicates if the mutation is durable on the backup.
    pub success: bool,
}

/// Progress of one partition hosted by the node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionStatus {
    pub partition: PartitionId,
    /// Last applied commit sequence number.
    pub lsn: u64,
    /// Number of keys in the partition.
    pub keys: usize,
    /// Address of the replica accepting writes, when known.
    pub primary: Option<String>,
}

/// Response of the status endpoint, used by resolvers to find the primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub role: Role,
    pub partitions: Vec<PartitionStatus>,
}
