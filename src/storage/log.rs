//! Per-partition append-only commit log.
//!
//! Each committed mutation is one entry:
//!
//! ```text
//! +----------+----------+----------+----------+-----------------+
//! |  Length  |  CRC32   |   LSN    |  Count   | Record frames   |
//! | (4 bytes)| (4 bytes)| (8 bytes)| (4 bytes)| (codec frames)  |
//! +----------+----------+----------+----------+-----------------+
//! ```
//!
//! Length covers everything after the CRC; the CRC covers the same bytes.
//! All integers are little-endian. A crash mid-append leaves a torn entry at
//! the tail, which is dropped on the next open.

use bytes::{Buf, BufMut, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::codec;
use super::error::{StoreError, StoreResult};
use super::types::{Mutation, PartitionId};

/// Size of the length + CRC header.
pub const ENTRY_HEADER_SIZE: usize = 8;

const LOG_PREFIX: &str = "partition-";
const LOG_SUFFIX: &str = ".log";

/// Storage behind a [`CommitLog`].
pub trait LogFile: Read + Write + Seek + Send {
    fn sync_data(&mut self) -> io::Result<()>;
    fn set_len(&mut self, len: u64) -> io::Result<()>;
}

impl LogFile for File {
    fn sync_data(&mut self) -> io::Result<()> {
        File::sync_data(self)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }
}

pub struct CommitLog<F = File> {
    partition: PartitionId,
    path: PathBuf,
    file: F,
    /// Length of the durable prefix; appends start here.
    len: u64,
    last_lsn: u64,
    /// Set when a failed append could not be rolled back.
    poisoned: bool,
}

impl CommitLog<File> {
    /// Opens (or creates) the log at `path` and replays it.
    pub fn open(path: &Path, partition: PartitionId) -> StoreResult<(Self, Vec<Mutation>)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Self::from_file(file, path, partition)
    }
}

impl<F: LogFile> CommitLog<F> {
    /// Replays an already opened log.
    ///
    /// A torn or checksum-failing tail is truncated away. A checksummed entry
    /// that does not decode, or sequence numbers that go backwards, are
    /// reported as corruption.
    pub fn from_file(
        mut file: F,
        path: &Path,
        partition: PartitionId,
    ) -> StoreResult<(Self, Vec<Mutation>)> {
        file.seek(SeekFrom::Start(0))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let (mutations, valid_len) = decode_entries(&data, partition)?;
        if valid_len < data.len() {
            tracing::warn!(
                partition,
                dropped = data.len() - valid_len,
                "Truncating torn tail of commit log {}",
                path.display()
            );
            file.set_len(valid_len as u64)?;
            file.sync_data()?;
        }
        file.seek(SeekFrom::Start(valid_len as u64))?;

        let last_lsn = mutations.last().map(|m| m.lsn).unwrap_or(0);
        tracing::debug!(
            partition,
            entries = mutations.len(),
            last_lsn,
            "Opened commit log {}",
            path.display()
        );

        Ok((
            Self {
                partition,
                path: path.to_path_buf(),
                file,
                len: valid_len as u64,
                last_lsn,
                poisoned: false,
            },
            mutations,
        ))
    }

    /// Appends and fsyncs one mutation.
    ///
    /// On failure the log is cut back to its previous length, so a failed
    /// append leaves nothing behind for replay.
    pub fn append(&mut self, mutation: &Mutation) -> StoreResult<()> {
        if self.poisoned {
            return Err(StoreError::Corrupt {
                partition: self.partition,
                offset: self.len,
                reason: "failed append could not be rolled back",
            });
        }
        if mutation.lsn <= self.last_lsn {
            return Err(StoreError::Corrupt {
                partition: self.partition,
                offset: self.len,
                reason: "lsn does not advance",
            });
        }

        let entry = encode_entry(mutation);
        let written = self
            .file
            .write_all(&entry)
            .and_then(|_| self.file.sync_data());
        if let Err(e) = written {
            self.rollback();
            return Err(e.into());
        }

        self.len += entry.len() as u64;
        self.last_lsn = mutation.lsn;
        Ok(())
    }

    fn rollback(&mut self) {
        let len = self.len;
        let restored = self
            .file
            .set_len(len)
            .and_then(|_| self.file.seek(SeekFrom::Start(len)))
            .and_then(|_| self.file.sync_data());
        if let Err(e) = restored {
            tracing::error!(
                partition = self.partition,
                "Failed to roll back commit log {}: {}",
                self.path.display(),
                e
            );
            self.poisoned = true;
        }
    }

    pub fn last_lsn(&self) -> u64 {
        self.last_lsn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// File name holding `partition`'s log inside a data directory.
pub fn log_file_name(partition: PartitionId) -> String {
    format!("{}{}{}", LOG_PREFIX, partition, LOG_SUFFIX)
}

/// Parses a log file name back to its partition id.
pub fn parse_log_file_name(name: &str) -> Option<PartitionId> {
    name.strip_prefix(LOG_PREFIX)?
        .strip_suffix(LOG_SUFFIX)?
        .parse()
        .ok()
}

pub fn encode_entry(mutation: &Mutation) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u64_le(mutation.lsn);
    body.put_u32_le(mutation.records.len() as u32);
    for record in &mutation.records {
        codec::encode_into(record, &mut body);
    }

    let mut entry = BytesMut::with_capacity(ENTRY_HEADER_SIZE + body.len());
    entry.put_u32_le(body.len() as u32);
    entry.put_u32_le(crc32fast::hash(&body));
    entry.extend_from_slice(&body);
    entry
}

/// Decodes entries until the data ends or a torn entry is found.
///
/// Returns the mutations and the length of the valid prefix.
pub fn decode_entries(data: &[u8], partition: PartitionId) -> StoreResult<(Vec<Mutation>, usize)> {
    let mut mutations: Vec<Mutation> = Vec::new();
    let mut offset = 0usize;

    while data.len() - offset >= ENTRY_HEADER_SIZE {
        let mut header = &data[offset..offset + ENTRY_HEADER_SIZE];
        let len = header.get_u32_le() as usize;
        let crc = header.get_u32_le();

        let body_start = offset + ENTRY_HEADER_SIZE;
        if data.len() - body_start < len {
            break;
        }
        let body = &data[body_start..body_start + len];
        if crc32fast::hash(body) != crc {
            tracing::warn!(partition, offset, "Checksum mismatch in commit log");
            break;
        }

        let mutation = decode_body(body).map_err(|reason| StoreError::Corrupt {
            partition,
            offset: offset as u64,
            reason,
        })?;
        if let Some(prev) = mutations.last()
            && mutation.lsn <= prev.lsn
        {
            return Err(StoreError::Corrupt {
                partition,
                offset: offset as u64,
                reason: "lsn does not advance",
            });
        }
        mutations.push(mutation);
        offset = body_start + len;
    }

    Ok((mutations, offset))
}

fn decode_body(mut body: &[u8]) -> Result<Mutation, &'static str> {
    if body.remaining() < 12 {
        return Err("entry body too small");
    }
    let lsn = body.get_u64_le();
    let count = body.get_u32_le() as usize;
    let mut records = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let record = codec::decode_from(&mut body).map_err(|_| "undecodable record")?;
        records.push(record);
    }
    if body.has_remaining() {
        return Err("trailing bytes after records");
    }
    Ok(Mutation { lsn, records })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::VoteRecord;
    use chrono::Utc;
    use tempfile::tempdir;

    fn mutation(lsn: u64, names: &[(&str, u64)]) -> Mutation {
        Mutation {
            lsn,
            records: names
                .iter()
                .map(|(name, count)| VoteRecord::new(*name, *count, Utc::now()))
                .collect(),
        }
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(log_file_name(0));

        let (mut log, replayed) = CommitLog::open(&path, 0).unwrap();
        assert!(replayed.is_empty());
        let first = mutation(1, &[("cats", 1)]);
        let second = mutation(2, &[("cats", 2), ("dogs", 1)]);
        log.append(&first).unwrap();
        log.append(&second).unwrap();
        drop(log);

        let (log, replayed) = CommitLog::open(&path, 0).unwrap();
        assert_eq!(replayed, vec![first, second]);
        assert_eq!(log.last_lsn(), 2);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(log_file_name(3));

        let (mut log, _) = CommitLog::open(&path, 3).unwrap();
        log.append(&mutation(1, &[("cats", 1)])).unwrap();
        drop(log);
        let good_len = std::fs::metadata(&path).unwrap().len();

        let torn = encode_entry(&mutation(2, &[("cats", 2)]));
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&torn[..torn.len() - 5]).unwrap();
        drop(file);

        let (mut log, replayed) = CommitLog::open(&path, 3).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);

        // The log keeps working after truncation.
        log.append(&mutation(2, &[("cats", 2)])).unwrap();
        drop(log);
        let (_, replayed) = CommitLog::open(&path, 3).unwrap();
        assert_eq!(replayed.len(), 2);
    }

    #[test]
    fn test_checksum_mismatch_stops_replay() {
        let mut data = encode_entry(&mutation(1, &[("cats", 1)])).to_vec();
        let first_len = data.len();
        data.extend_from_slice(&encode_entry(&mutation(2, &[("cats", 2)])));
        let last = data.len() - 1;
        data[last] ^= 0xff;

        let (mutations, valid) = decode_entries(&data, 0).unwrap();
        assert_eq!(mutations.len(), 1);
        assert_eq!(valid, first_len);
    }

    #[test]
    fn test_stale_lsn_is_rejected_on_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(log_file_name(0));
        let (mut log, _) = CommitLog::open(&path, 0).unwrap();
        log.append(&mutation(1, &[("cats", 1)])).unwrap();
        assert!(matches!(
            log.append(&mutation(1, &[("cats", 1)])),
            Err(StoreError::Corrupt { .. })
        ));
    }

    /// A log file that fails on demand.
    struct FaultyFile {
        inner: File,
        /// The next write stores this many bytes and then fails.
        short_write: Option<usize>,
        fail_next_sync: bool,
        fail_set_len: bool,
    }

    impl FaultyFile {
        fn open(path: &Path) -> Self {
            let inner = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .unwrap();
            Self {
                inner,
                short_write: None,
                fail_next_sync: false,
                fail_set_len: false,
            }
        }
    }

    impl Read for FaultyFile {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl Write for FaultyFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(limit) = self.short_write.take() {
                self.inner.write_all(&buf[..limit.min(buf.len())])?;
                return Err(io::Error::other("disk full"));
            }
            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl Seek for FaultyFile {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    impl LogFile for FaultyFile {
        fn sync_data(&mut self) -> io::Result<()> {
            if std::mem::take(&mut self.fail_next_sync) {
                return Err(io::Error::other("sync failed"));
            }
            self.inner.sync_data()
        }

        fn set_len(&mut self, len: u64) -> io::Result<()> {
            if self.fail_set_len {
                return Err(io::Error::other("truncate failed"));
            }
            self.inner.set_len(len)
        }
    }

    #[test]
    fn test_failed_sync_leaves_no_entry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(log_file_name(0));
        let (mut log, _) = CommitLog::from_file(FaultyFile::open(&path), &path, 0).unwrap();
        log.append(&mutation(1, &[("cats", 1)])).unwrap();

        log.file.fail_next_sync = true;
        assert!(matches!(
            log.append(&mutation(2, &[("cats", 2)])),
            Err(StoreError::Io(_))
        ));
        assert_eq!(log.last_lsn(), 1);

        // The same sequence number is reused by the next commit.
        log.append(&mutation(2, &[("cats", 3)])).unwrap();
        drop(log);

        let (log, replayed) = CommitLog::open(&path, 0).unwrap();
        assert_eq!(
            replayed.iter().map(|m| m.lsn).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(replayed[1].records[0].count(), 3);
        assert_eq!(log.last_lsn(), 2);
    }

    #[test]
    fn test_partial_write_is_rolled_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(log_file_name(0));
        let (mut log, _) = CommitLog::from_file(FaultyFile::open(&path), &path, 0).unwrap();
        log.append(&mutation(1, &[("cats", 1)])).unwrap();
        let good_len = std::fs::metadata(&path).unwrap().len();

        log.file.short_write = Some(10);
        assert!(log.append(&mutation(2, &[("cats", 2)])).is_err());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);

        log.append(&mutation(2, &[("dogs", 1)])).unwrap();
        drop(log);

        let (_, replayed) = CommitLog::open(&path, 0).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[1].records[0].name(), "dogs");
    }

    #[test]
    fn test_failed_rollback_poisons_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(log_file_name(0));
        let (mut log, _) = CommitLog::from_file(FaultyFile::open(&path), &path, 0).unwrap();

        log.file.short_write = Some(10);
        log.file.fail_set_len = true;
        assert!(matches!(
            log.append(&mutation(1, &[("cats", 1)])),
            Err(StoreError::Io(_))
        ));

        log.file.fail_set_len = false;
        assert!(matches!(
            log.append(&mutation(1, &[("cats", 1)])),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_log_file_names() {
        assert_eq!(log_file_name(7), "partition-7.log");
        assert_eq!(parse_log_file_name("partition-7.log"), Some(7));
        assert_eq!(parse_log_file_name("partition-x.log"), None);
        assert_eq!(parse_log_file_name("other.log"), None);
    }
}
