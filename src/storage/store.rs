use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use super::error::{StoreError, StoreResult};
use super::substrate::ReplicationSubstrate;
use super::transaction::Transaction;
use super::types::{Mutation, PartitionId, VoteRecord};

/// Maximum number of records returned by [`CounterStore::get_all`].
pub const GET_ALL_LIMIT: usize = 1000;

/// A committed record together with the sequence number of the commit that
/// wrote it. The version is what optimistic commits compare against.
#[derive(Debug, Clone)]
pub(crate) struct Versioned {
    pub record: VoteRecord,
    pub version: u64,
}

/// An immutable point-in-time view of one partition.
#[derive(Debug, Clone, Default)]
pub(crate) struct Snapshot {
    pub lsn: u64,
    pub records: BTreeMap<String, Versioned>,
}

/// Committed state and locks of one partition.
pub(crate) struct PartitionTable {
    id: PartitionId,
    committed: RwLock<Arc<Snapshot>>,
    commit_lock: Mutex<()>,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PartitionTable {
    fn new(id: PartitionId) -> Self {
        Self {
            id,
            committed: RwLock::new(Arc::new(Snapshot::default())),
            commit_lock: Mutex::new(()),
            key_locks: DashMap::new(),
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.committed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn commit_lock(&self) -> &Mutex<()> {
        &self.commit_lock
    }

    /// Waits for the update lock on `key`.
    pub async fn lock_key(self: &Arc<Self>, key: &str) -> KeyGuard {
        let lock = self.key_locks.entry(key.to_string()).or_default().clone();
        let guard = lock.lock_owned().await;
        KeyGuard {
            table: self.clone(),
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Drops the lock entry of `key` once nobody holds or waits for it.
    pub fn release_key(&self, key: &str) {
        self.key_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Number of keys with a live lock entry.
    pub fn locked_keys(&self) -> usize {
        self.key_locks.len()
    }

    /// Publishes a durable mutation as the new committed snapshot.
    ///
    /// Readers holding the previous snapshot keep it; the map is copied only
    /// when such readers exist.
    pub fn install(&self, mutation: &Mutation) {
        let mut committed = self
            .committed
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let next = Arc::make_mut(&mut committed);
        next.lsn = mutation.lsn;
        for record in &mutation.records {
            next.records.insert(
                record.name().to_string(),
                Versioned {
                    record: record.clone(),
                    version: mutation.lsn,
                },
            );
        }
    }
}

/// Holds a key's update lock; the lock entry is pruned on release.
pub(crate) struct KeyGuard {
    table: Arc<PartitionTable>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.table.release_key(&self.key);
    }
}

/// Transactional vote counters, one table per partition.
///
/// Writes are serialized per partition and only accepted where the
/// [`ReplicationSubstrate`] reports the local replica as primary. Different
/// partitions commit independently.
pub struct CounterStore {
    partitions: DashMap<PartitionId, Arc<PartitionTable>>,
    substrate: Arc<dyn ReplicationSubstrate>,
}

impl CounterStore {
    /// Creates an empty store without replaying the substrate.
    pub fn new(substrate: Arc<dyn ReplicationSubstrate>) -> Self {
        Self {
            partitions: DashMap::new(),
            substrate,
        }
    }

    /// Creates a store and replays every mutation the substrate recovers.
    pub async fn open(substrate: Arc<dyn ReplicationSubstrate>) -> StoreResult<Self> {
        let store = Self::new(substrate);
        for (partition, mutations) in store.substrate.recover().await? {
            let table = store.table(partition);
            for mutation in &mutations {
                table.install(mutation);
            }
            tracing::info!(
                partition,
                lsn = table.snapshot().lsn,
                keys = table.snapshot().records.len(),
                "Partition restored"
            );
        }
        Ok(store)
    }

    pub(crate) fn table(&self, partition: PartitionId) -> Arc<PartitionTable> {
        self.partitions
            .entry(partition)
            .or_insert_with(|| Arc::new(PartitionTable::new(partition)))
            .clone()
    }

    pub fn substrate(&self) -> &Arc<dyn ReplicationSubstrate> {
        &self.substrate
    }

    /// Starts a transaction pinned to the partition's current snapshot.
    pub fn begin(&self, partition: PartitionId) -> Transaction {
        Transaction::new(self.table(partition), self.substrate.clone())
    }

    /// Returns up to [`GET_ALL_LIMIT`] records of a consistent snapshot.
    pub async fn get_all(
        &self,
        partition: PartitionId,
        cancel: &CancellationToken,
    ) -> StoreResult<Vec<VoteRecord>> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let tx = self.begin(partition);
        let records = tx.records(GET_ALL_LIMIT);
        tx.commit(cancel).await?;
        Ok(records)
    }

    /// Adds `delta` to `key`, creating the record on first vote.
    ///
    /// Fails with [`StoreError::Conflict`] when another writer committed the
    /// key after this call's snapshot was taken. The store never retries;
    /// callers choose their own retry policy.
    pub async fn upsert(
        &self,
        partition: PartitionId,
        key: &str,
        delta: u64,
        cancel: &CancellationToken,
    ) -> StoreResult<VoteRecord> {
        let mut tx = self.begin(partition);
        let now = Utc::now();
        let record = match tx.get_for_update(key, cancel).await? {
            Some(current) => current.with_count(current.count().saturating_add(delta), now),
            None => VoteRecord::new(key, delta, now),
        };
        tx.put(record.clone());
        tx.commit(cancel).await?;
        Ok(record)
    }

    /// Deleting votes is not supported: always reports the key as not found.
    pub async fn delete(&self, partition: PartitionId, key: &str) -> StoreResult<()> {
        tracing::debug!(partition, key, "Delete requested; deletes are not supported");
        Err(StoreError::NotFound {
            key: key.to_string(),
        })
    }

    /// Applies a mutation committed by the primary.
    ///
    /// Returns `false` if the mutation was already applied.
    pub async fn apply_replicated(
        &self,
        partition: PartitionId,
        mutation: Mutation,
    ) -> StoreResult<bool> {
        if self.substrate.is_primary(partition) {
            return Err(StoreError::AlreadyPrimary { partition });
        }

        let table = self.table(partition);
        let _commit = table.commit_lock().lock().await;
        if mutation.lsn <= table.snapshot().lsn {
            return Ok(false);
        }
        if !self.substrate.append_replicated(partition, &mutation).await? {
            return Ok(false);
        }
        table.install(&mutation);
        tracing::debug!(partition, lsn = mutation.lsn, "Applied replicated mutation");
        Ok(true)
    }

    /// Last committed sequence number of `partition` (0 if never written).
    pub fn last_lsn(&self, partition: PartitionId) -> u64 {
        self.partitions
            .get(&partition)
            .map(|table| table.snapshot().lsn)
            .unwrap_or(0)
    }

    /// Number of keys in `partition`.
    pub fn key_count(&self, partition: PartitionId) -> usize {
        self.partitions
            .get(&partition)
            .map(|table| table.snapshot().records.len())
            .unwrap_or(0)
    }

    /// Partitions that have been touched or recovered, in ascending order.
    pub fn partition_ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> = self.partitions.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }
}
