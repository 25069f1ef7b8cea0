use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::CodecError;

/// Identifier of an independently replicated shard of the key space.
pub type PartitionId = u32;

/// The only partition used by the current deployment.
pub const DEFAULT_PARTITION: PartitionId = 0;

/// The tally for a single vote key.
///
/// Records are immutable: fields are private and every change goes through
/// [`VoteRecord::with_count`], which returns a fresh value. A record handed out
/// by a transaction can therefore never be half-updated in memory if that
/// transaction later aborts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawVoteRecord")]
pub struct VoteRecord {
    name: String,
    count: u64,
    max_count: u64,
    last_vote: DateTime<Utc>,
}

impl VoteRecord {
    /// Creates the first record for a key, with `count == max_count`.
    pub fn new(name: impl Into<String>, count: u64, last_vote: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            count,
            max_count: count,
            last_vote,
        }
    }

    /// Builds a record from stored parts, rejecting `max_count < count`.
    pub fn from_parts(
        name: String,
        count: u64,
        max_count: u64,
        last_vote: DateTime<Utc>,
    ) -> Option<Self> {
        if max_count < count {
            return None;
        }
        Some(Self {
            name,
            count,
            max_count,
            last_vote,
        })
    }

    /// Returns a new record carrying `count`, keeping the highest count ever seen.
    pub fn with_count(&self, count: u64, at: DateTime<Utc>) -> Self {
        Self {
            name: self.name.clone(),
            count,
            max_count: self.max_count.max(count),
            last_vote: at,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn max_count(&self) -> u64 {
        self.max_count
    }

    pub fn last_vote(&self) -> DateTime<Utc> {
        self.last_vote
    }
}

#[derive(Deserialize)]
struct RawVoteRecord {
    name: String,
    count: u64,
    max_count: u64,
    last_vote: DateTime<Utc>,
}

impl TryFrom<RawVoteRecord> for VoteRecord {
    type Error = CodecError;

    fn try_from(raw: RawVoteRecord) -> Result<Self, Self::Error> {
        let (count, max_count) = (raw.count, raw.max_count);
        VoteRecord::from_parts(raw.name, count, max_count, raw.last_vote)
            .ok_or(CodecError::InvalidCounts { count, max_count })
    }
}

/// A committed write set, as handed to the replication substrate.
///
/// `lsn` is the partition's log sequence number for this commit; it starts at
/// 1 and increases by one per commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub lsn: u64,
    pub records: Vec<VoteRecord>,
}
