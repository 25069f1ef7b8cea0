//! Durable primary/backup substrate.
//!
//! The primary appends each committed mutation to the partition's on-disk
//! commit log (fsync before acknowledging), then queues it for every
//! configured backup. One task per backup drains its queue in commit order and
//! pushes over HTTP, so a slow or dead backup never holds up a commit. Backups
//! persist pushed mutations in their own logs.
//!
//! Leader election and backup catch-up are out of scope: the role of each node
//! is fixed by its configuration, and a backup that missed pushes only
//! converges again through new commits.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use super::error::{StoreError, StoreResult};
use super::log::{CommitLog, log_file_name, parse_log_file_name};
use super::protocol::{ENDPOINT_REPLICATE, ReplicateRequest};
use super::substrate::{CommitStatus, ReplicationSubstrate, Role};
use super::types::{Mutation, PartitionId};

const REPLICATE_TIMEOUT: Duration = Duration::from_millis(500);
const REPLICATE_ATTEMPTS: usize = 3;
const REPLICATE_QUEUE: usize = 1024;

type BackupQueue = mpsc::Sender<Arc<ReplicateRequest>>;

pub struct DurableSubstrate {
    data_dir: PathBuf,
    role: Role,
    /// This node's address when primary, otherwise the primary's address.
    primary_addr: Option<String>,
    backups: Vec<String>,
    /// Started on the first commit; the tasks exit once the substrate drops.
    queues: OnceLock<Vec<BackupQueue>>,
    logs: DashMap<PartitionId, Arc<Mutex<CommitLog>>>,
    http_client: reqwest::Client,
}

impl DurableSubstrate {
    pub fn new(
        data_dir: PathBuf,
        role: Role,
        primary_addr: Option<String>,
        backups: Vec<String>,
    ) -> StoreResult<Self> {
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self {
            data_dir,
            role,
            primary_addr,
            backups: backups.into_iter().map(normalize_url).collect(),
            queues: OnceLock::new(),
            logs: DashMap::new(),
            http_client: reqwest::Client::new(),
        })
    }

    fn log_for(&self, partition: PartitionId) -> StoreResult<Arc<Mutex<CommitLog>>> {
        if let Some(log) = self.logs.get(&partition) {
            return Ok(log.clone());
        }
        let path = self.data_dir.join(log_file_name(partition));
        let log = self.logs.entry(partition).or_try_insert_with(|| {
            let (log, replayed) = CommitLog::open(&path, partition)?;
            if !replayed.is_empty() {
                tracing::warn!(
                    partition,
                    entries = replayed.len(),
                    "Opened a commit log that was not recovered at startup"
                );
            }
            Ok::<_, StoreError>(Arc::new(Mutex::new(log)))
        })?;
        Ok(log.clone())
    }

    async fn append(
        &self,
        partition: PartitionId,
        mutation: &Mutation,
        replicated: bool,
    ) -> StoreResult<Option<CommitStatus>> {
        let log = self.log_for(partition)?;
        let mutation = mutation.clone();

        tokio::task::spawn_blocking(move || {
            let mut log = log.lock().unwrap_or_else(PoisonError::into_inner);
            let last = log.last_lsn();
            if replicated {
                if mutation.lsn <= last {
                    return Ok(None);
                }
                if mutation.lsn != last + 1 {
                    tracing::warn!(
                        partition,
                        last,
                        received = mutation.lsn,
                        "Gap in replicated mutations"
                    );
                }
            } else if mutation.lsn != last + 1 {
                return Ok(Some(CommitStatus::Conflict));
            }
            log.append(&mutation)?;
            Ok(Some(CommitStatus::Committed))
        })
        .await
        .map_err(|e| StoreError::Replication(format!("log append task failed: {}", e)))?
    }

    fn backup_queues(&self) -> &[BackupQueue] {
        self.queues.get_or_init(|| {
            self.backups
                .iter()
                .map(|backup| {
                    let (sender, receiver) = mpsc::channel(REPLICATE_QUEUE);
                    tokio::spawn(push_to_backup(
                        self.http_client.clone(),
                        backup.clone(),
                        receiver,
                    ));
                    sender
                })
                .collect()
        })
    }

    /// Hands a committed mutation to every backup's queue.
    fn enqueue(&self, partition: PartitionId, mutation: &Mutation) {
        let request = Arc::new(ReplicateRequest::new(partition, mutation));
        for (backup, queue) in self.backups.iter().zip(self.backup_queues()) {
            if let Err(e) = queue.try_send(request.clone()) {
                tracing::warn!(
                    partition,
                    lsn = mutation.lsn,
                    "Dropped replication to backup {}: {}",
                    backup,
                    e
                );
            }
        }
    }
}

/// Drains one backup's queue in order.
async fn push_to_backup(
    http_client: reqwest::Client,
    backup: String,
    mut queue: mpsc::Receiver<Arc<ReplicateRequest>>,
) {
    while let Some(request) = queue.recv().await {
        if let Err(e) = replicate_to_backup(&http_client, &backup, &request).await {
            tracing::warn!(
                partition = request.partition,
                lsn = request.lsn,
                "Failed to replicate to backup {}: {}",
                backup,
                e
            );
        }
    }
    tracing::debug!("Replication queue for {} closed", backup);
}

async fn replicate_to_backup(
    http_client: &reqwest::Client,
    backup: &str,
    request: &ReplicateRequest,
) -> anyhow::Result<()> {
    let response = post_with_retry(
        http_client,
        format!("{}{}", backup, ENDPOINT_REPLICATE),
        request,
        REPLICATE_TIMEOUT,
        REPLICATE_ATTEMPTS,
    )
    .await?;

    if !response.status().is_success() {
        return Err(anyhow::anyhow!("Replication failed: {}", response.status()));
    }
    Ok(())
}

async fn post_with_retry<T: serde::Serialize>(
    http_client: &reqwest::Client,
    url: String,
    payload: &T,
    timeout: Duration,
    attempts: usize,
) -> anyhow::Result<reqwest::Response> {
    let mut delay_ms = 150u64;

    for attempt in 0..attempts {
        let response = http_client
            .post(url.clone())
            .json(payload)
            .timeout(timeout)
            .send()
            .await;

        match response {
            Ok(resp) => return Ok(resp),
            Err(e) => {
                if attempt + 1 == attempts {
                    return Err(anyhow::anyhow!(e));
                }
                let jitter = rand::random::<u64>() % 50;
                tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                delay_ms = (delay_ms * 2).min(1200);
            }
        }
    }

    Err(anyhow::anyhow!("Retry attempts exhausted"))
}

#[async_trait]
impl ReplicationSubstrate for DurableSubstrate {
    async fn commit(
        &self,
        partition: PartitionId,
        mutation: &Mutation,
    ) -> StoreResult<CommitStatus> {
        let status = self
            .append(partition, mutation, false)
            .await?
            .unwrap_or(CommitStatus::Conflict);
        if status == CommitStatus::Conflict {
            return Ok(status);
        }

        // Local fsync is the durability point; backups are best effort.
        if !self.backups.is_empty() {
            self.enqueue(partition, mutation);
        }

        Ok(CommitStatus::Committed)
    }

    async fn append_replicated(
        &self,
        partition: PartitionId,
        mutation: &Mutation,
    ) -> StoreResult<bool> {
        Ok(self.append(partition, mutation, true).await?.is_some())
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
        let mut recovered = Vec::new();

        for entry in std::fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(partition) = name.to_str().and_then(parse_log_file_name) else {
                continue;
            };

            let (log, mutations) = CommitLog::open(&entry.path(), partition)?;
            tracing::info!(
                partition,
                entries = mutations.len(),
                "Recovered commit log {}",
                log.path().display()
            );
            self.logs.insert(partition, Arc::new(Mutex::new(log)));
            recovered.push((partition, mutations));
        }

        recovered.sort_by_key(|(partition, _)| *partition);
        Ok(recovered)
    }
}

/// Adds a scheme to bare `host:port` addresses and strips trailing slashes.
pub fn normalize_url(addr: String) -> String {
    let trimmed = addr.trim();
    let normalized = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };
    normalized.trim_end_matches('/').to_string()
}
