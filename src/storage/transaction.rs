//! Scoped transactions over one partition.
//!
//! A transaction pins the partition's committed snapshot when it begins. All
//! reads are served from that snapshot (plus the transaction's own staged
//! writes), so concurrent commits never show through half-applied.
//!
//! Writes are optimistic: at commit time every written key must still carry
//! the version this transaction read, otherwise the commit fails with
//! [`StoreError::Conflict`] and nothing is applied. `get_for_update` also takes
//! the key's update lock, which keeps other writers of that key waiting until
//! this transaction commits or is dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::error::{StoreError, StoreResult};
use super::store::{KeyGuard, PartitionTable, Snapshot};
use super::substrate::{CommitStatus, ReplicationSubstrate};
use super::types::{Mutation, PartitionId, VoteRecord};

pub struct Transaction {
    table: Arc<PartitionTable>,
    substrate: Arc<dyn ReplicationSubstrate>,
    snapshot: Arc<Snapshot>,
    /// Version of each key as first seen by this transaction (`None` = absent).
    reads: HashMap<String, Option<u64>>,
    writes: BTreeMap<String, VoteRecord>,
    locks: HashMap<String, KeyGuard>,
}

impl Transaction {
    pub(crate) fn new(table: Arc<PartitionTable>, substrate: Arc<dyn ReplicationSubstrate>) -> Self {
        let snapshot = table.snapshot();
        Self {
            table,
            substrate,
            snapshot,
            reads: HashMap::new(),
            writes: BTreeMap::new(),
            locks: HashMap::new(),
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.table.id()
    }

    /// Sequence number of the commit this transaction's snapshot reflects.
    pub fn snapshot_lsn(&self) -> u64 {
        self.snapshot.lsn
    }

    /// Reads `key` as of this transaction's snapshot, including staged writes.
    pub fn get(&self, key: &str) -> Option<VoteRecord> {
        if let Some(staged) = self.writes.get(key) {
            return Some(staged.clone());
        }
        self.snapshot.records.get(key).map(|v| v.record.clone())
    }

    /// Up to `limit` committed records from the snapshot, ordered by name.
    pub fn records(&self, limit: usize) -> Vec<VoteRecord> {
        self.snapshot
            .records
            .values()
            .take(limit)
            .map(|v| v.record.clone())
            .collect()
    }

    /// Takes the update lock on `key`, then reads it.
    ///
    /// The lock is held until the transaction commits or is dropped.
    pub async fn get_for_update(
        &mut self,
        key: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<Option<VoteRecord>> {
        if !self.locks.contains_key(key) {
            let guard = tokio::select! {
                guard = self.table.lock_key(key) => Some(guard),
                _ = cancel.cancelled() => None,
            };
            let Some(guard) = guard else {
                self.table.release_key(key);
                return Err(StoreError::Cancelled);
            };
            self.locks.insert(key.to_string(), guard);
        }
        self.observe(key);
        Ok(self.get(key))
    }

    /// Stages `record` as the new value of its key.
    pub fn put(&mut self, record: VoteRecord) {
        self.observe(record.name());
        self.writes.insert(record.name().to_string(), record);
    }

    fn observe(&mut self, key: &str) {
        if !self.reads.contains_key(key) {
            let version = self.snapshot.records.get(key).map(|v| v.version);
            self.reads.insert(key.to_string(), version);
        }
    }

    /// Validates and durably commits the staged writes.
    ///
    /// Returns the sequence number of the commit. A read-only transaction
    /// commits trivially. Cancellation is honored until the mutation is handed
    /// to the substrate; from then on the commit runs to completion even if the
    /// caller stops waiting.
    pub async fn commit(self, cancel: &CancellationToken) -> StoreResult<u64> {
        if self.writes.is_empty() {
            return Ok(self.snapshot.lsn);
        }
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let partition = self.partition();
        if !self.substrate.is_primary(partition) {
            return Err(StoreError::NotPrimary { partition });
        }

        let Transaction {
            table,
            substrate,
            snapshot,
            reads,
            writes,
            locks,
        } = self;
        // A live snapshot would force `install` to copy the whole partition.
        drop(snapshot);
        let cancel = cancel.clone();

        let task = tokio::spawn(async move {
            let _locks = locks;
            let _commit = tokio::select! {
                guard = table.commit_lock().lock() => guard,
                _ = cancel.cancelled() => return Err(StoreError::Cancelled),
            };

            let current = table.snapshot();
            for key in writes.keys() {
                let expected = reads.get(key).copied().flatten();
                let actual = current.records.get(key).map(|v| v.version);
                if expected != actual {
                    tracing::debug!(partition, key = %key, ?expected, ?actual, "Commit conflict");
                    return Err(StoreError::Conflict { key: key.clone() });
                }
            }
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }

            let first_key = writes.keys().next().cloned().unwrap_or_default();
            let mutation = Mutation {
                lsn: current.lsn + 1,
                records: writes.into_values().collect(),
            };
            drop(current);

            match substrate.commit(partition, &mutation).await? {
                CommitStatus::Committed => {
                    table.install(&mutation);
                    tracing::debug!(
                        partition,
                        lsn = mutation.lsn,
                        records = mutation.records.len(),
                        "Committed"
                    );
                    Ok(mutation.lsn)
                }
                CommitStatus::Conflict => Err(StoreError::Conflict { key: first_key }),
            }
        });

        task.await
            .map_err(|e| StoreError::Replication(format!("commit task failed: {}", e)))?
    }
}
