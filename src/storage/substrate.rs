//! Replication substrate seam.
//!
//! The store never elects leaders or catches replicas up itself. It hands each
//! committed write set to a [`ReplicationSubstrate`], which is responsible for
//! making it durable (and visible to secondaries) before the store applies it
//! in memory and acknowledges the caller.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

use super::error::{StoreError, StoreResult};
use super::types::{Mutation, PartitionId};

/// Role of the local replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Accepts writes.
    Primary,
    /// Receives committed state from the primary; serves reads only.
    Secondary,
}

/// Outcome of handing a mutation to the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    Committed,
    /// The substrate refused the mutation because its sequence number does not
    /// follow the last durable one (another writer got there first).
    Conflict,
}

#[async_trait]
pub trait ReplicationSubstrate: Send + Sync {
    /// Makes `mutation` durable for `partition`.
    ///
    /// Only called on the primary, while the partition's commit lock is held.
    async fn commit(&self, partition: PartitionId, mutation: &Mutation)
    -> StoreResult<CommitStatus>;

    /// Persists a mutation received from the primary.
    ///
    /// Returns `false` when the mutation was already applied.
    async fn append_replicated(
        &self,
        partition: PartitionId,
        mutation: &Mutation,
    ) -> StoreResult<bool>;

    /// Address of the replica currently accepting writes for `partition`.
    fn current_primary(&self, partition: PartitionId) -> Option<String>;

    /// Whether the local replica may write to `partition`.
    fn is_primary(&self, partition: PartitionId) -> bool;

    fn role(&self) -> Role;

    /// Every durable mutation, grouped by partition, in commit order.
    async fn recover(&self) -> StoreResult<Vec<(PartitionId, Vec<Mutation>)>>;
}

/// Volatile substrate: keeps committed mutations in memory.
///
/// Used by tests and by nodes started without a data directory.
pub struct InMemorySubstrate {
    role: Role,
    primary_addr: Option<String>,
    log: DashMap<PartitionId, Vec<Mutation>>,
    fail_next_commit: AtomicBool,
}

impl InMemorySubstrate {
    pub fn new(role: Role, primary_addr: Option<String>) -> Self {
        Self {
            role,
            primary_addr,
            log: DashMap::new(),
            fail_next_commit: AtomicBool::new(false),
        }
    }

    pub fn primary() -> Self {
        Self::new(Role::Primary, None)
    }

    /// Makes the next `commit` fail with a replication error.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Number of durable mutations for `partition`.
    pub fn committed_len(&self, partition: PartitionId) -> usize {
        self.log.get(&partition).map(|log| log.len()).unwrap_or(0)
    }

    fn last_lsn(&self, partition: PartitionId) -> u64 {
        self.log
            .get(&partition)
            .and_then(|log| log.last().map(|m| m.lsn))
            .unwrap_or(0)
    }
}

#[async_trait]
impl ReplicationSubstrate for InMemorySubstrate {
    async fn commit(
        &self,
        partition: PartitionId,
        mutation: &Mutation,
    ) -> StoreResult<CommitStatus> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Replication("injected commit failure".to_string()));
        }
        if mutation.lsn != self.last_lsn(partition) + 1 {
            return Ok(CommitStatus::Conflict);
        }
        self.log.entry(partition).or_default().push(mutation.clone());
        Ok(CommitStatus::Committed)
    }

    async fn append_replicated(
        &self,
        partition: PartitionId,
        mutation: &Mutation,
    ) -> StoreResult<bool> {
        if mutation.lsn <= self.last_lsn(partition) {
            return Ok(false);
        }
        self.log.entry(partition).or_default().push(mutation.clone());
        Ok(true)
    }

    fn current_primary(&self, _partition: PartitionId) -> Option<String> {
        self.primary_addr.clone()
    }

    fn is_primary(&self, _partition: PartitionId) -> bool {
        self.role == Role::Primary
    }

    fn role(&self) -> Role {
        self.role
    }

    async fn recover(&self) -> StoreResult<Vec<(PartitionId, Vec<Mutation>)>> {
        Ok(self
            .log
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect())
    }
}
