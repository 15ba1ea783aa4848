// RocksDB-based replicated log storage
// Durable append-only entry storage with truncation, compaction and
// corrupt-tail recovery on restart

use std::fmt::Debug;
use std::ops::RangeBounds;
use std::path::Path;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use openraft::storage::{LogFlushed, LogState, RaftLogStorage};
use openraft::{
    Entry, ErrorSubject, ErrorVerb, LogId, OptionalSend, RaftLogReader, StorageError, Vote,
};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, DB};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::types::{NodeId, TypeConfig};

// Column family names
const CF_LOGS: &str = "logs";
const CF_STATE: &str = "state";

// State keys
const KEY_VOTE: &[u8] = b"vote";
const KEY_LAST_PURGED: &[u8] = b"last_purged";

/// Helper to create StorageError for vote operations
fn vote_error(
    e: impl std::error::Error + Send + Sync + 'static,
    verb: ErrorVerb,
) -> StorageError<NodeId> {
    StorageError::from_io_error(
        ErrorSubject::Vote,
        verb,
        std::io::Error::other(e.to_string()),
    )
}

/// Helper to create StorageError for log operations
fn logs_error(
    e: impl std::error::Error + Send + Sync + 'static,
    verb: ErrorVerb,
) -> StorageError<NodeId> {
    StorageError::from_io_error(
        ErrorSubject::Logs,
        verb,
        std::io::Error::other(e.to_string()),
    )
}

/// Durable log store for the coordination cluster
///
/// Entries are keyed by big-endian index so RocksDB iteration order is
/// index order. An append is acknowledged to the consensus layer only
/// after the write batch is synced.
pub struct LogStore {
    db: Arc<DB>,
    /// Cached last log ID
    last_log_id: RwLock<Option<LogId<NodeId>>>,
    /// Cached vote
    vote: RwLock<Option<Vote<NodeId>>>,
    /// Cached last purged log ID
    last_purged: RwLock<Option<LogId<NodeId>>>,
}

impl LogStore {
    /// Open (or create) the log store at `path` and recover its state
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError<NodeId>> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_LOGS, Options::default()),
            ColumnFamilyDescriptor::new(CF_STATE, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cfs)
            .map_err(|e| logs_error(e, ErrorVerb::Read))?;

        let store = Self {
            db: Arc::new(db),
            last_log_id: RwLock::new(None),
            vote: RwLock::new(None),
            last_purged: RwLock::new(None),
        };

        store.discard_corrupt_tail()?;
        store.load_cached_values().await?;

        info!("log store initialized");
        Ok(store)
    }

    /// Drop any trailing entries that no longer deserialize
    ///
    /// A crash mid-write can leave a partial record at the tail. The
    /// highest contiguous valid index wins; everything after it is
    /// removed rather than surfaced as data.
    fn discard_corrupt_tail(&self) -> Result<(), StorageError<NodeId>> {
        let mut corrupt_keys: Vec<Vec<u8>> = Vec::new();

        let mut iter = self.db.raw_iterator_cf(self.cf_logs());
        iter.seek_to_last();
        while iter.valid() {
            let value = match iter.value() {
                Some(v) => v,
                None => break,
            };
            if Self::deserialize_entry(value).is_ok() {
                break;
            }
            if let Some(key) = iter.key() {
                corrupt_keys.push(key.to_vec());
            }
            iter.prev();
        }

        if corrupt_keys.is_empty() {
            return Ok(());
        }

        warn!(
            dropped = corrupt_keys.len(),
            "discarding corrupt trailing log entries"
        );
        let mut batch = rocksdb::WriteBatch::default();
        for key in corrupt_keys {
            batch.delete_cf(self.cf_logs(), &key);
        }
        self.db
            .write(batch)
            .map_err(|e| logs_error(e, ErrorVerb::Delete))?;
        Ok(())
    }

    /// Load cached values from storage
    async fn load_cached_values(&self) -> Result<(), StorageError<NodeId>> {
        let vote = self.load_vote_internal()?;
        *self.vote.write().await = vote;

        let last_purged = self.load_last_purged_internal()?;
        *self.last_purged.write().await = last_purged;

        let last_log_id = self.scan_last_log_id()?;
        *self.last_log_id.write().await = last_log_id.or(last_purged);

        Ok(())
    }

    // Column families are created at open; a missing handle means the
    // database is unusably corrupt.
    fn cf_logs(&self) -> &ColumnFamily {
        self.db.cf_handle(CF_LOGS).expect("CF_LOGS must exist")
    }

    fn cf_state(&self) -> &ColumnFamily {
        self.db.cf_handle(CF_STATE).expect("CF_STATE must exist")
    }

    /// Encode log index to bytes (big-endian for proper ordering)
    fn encode_log_index(index: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        buf.write_u64::<BigEndian>(index)
            .expect("writing to a Vec cannot fail");
        buf
    }

    /// Decode log index from bytes
    fn decode_log_index(bytes: &[u8]) -> u64 {
        let mut cursor = std::io::Cursor::new(bytes);
        cursor.read_u64::<BigEndian>().unwrap_or(0)
    }

    fn serialize_entry(entry: &Entry<TypeConfig>) -> Result<Vec<u8>, StorageError<NodeId>> {
        serde_json::to_vec(entry).map_err(|e| logs_error(e, ErrorVerb::Write))
    }

    fn deserialize_entry(bytes: &[u8]) -> Result<Entry<TypeConfig>, StorageError<NodeId>> {
        serde_json::from_slice(bytes).map_err(|e| logs_error(e, ErrorVerb::Read))
    }

    fn load_vote_internal(&self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        match self.db.get_cf(self.cf_state(), KEY_VOTE) {
            Ok(Some(bytes)) => {
                let vote: Vote<NodeId> =
                    serde_json::from_slice(&bytes).map_err(|e| vote_error(e, ErrorVerb::Read))?;
                Ok(Some(vote))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(vote_error(e, ErrorVerb::Read)),
        }
    }

    fn load_last_purged_internal(&self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        match self.db.get_cf(self.cf_state(), KEY_LAST_PURGED) {
            Ok(Some(bytes)) => {
                let log_id: LogId<NodeId> =
                    serde_json::from_slice(&bytes).map_err(|e| logs_error(e, ErrorVerb::Read))?;
                Ok(Some(log_id))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(logs_error(e, ErrorVerb::Read)),
        }
    }

    /// Highest log id present on disk
    fn scan_last_log_id(&self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        let mut iter = self.db.raw_iterator_cf(self.cf_logs());
        iter.seek_to_last();

        if iter.valid() {
            if let Some(value) = iter.value() {
                let entry = Self::deserialize_entry(value)?;
                return Ok(Some(entry.log_id));
            }
        }

        Ok(None)
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        let start = match range.start_bound() {
            std::ops::Bound::Included(&n) => n,
            std::ops::Bound::Excluded(&n) => n + 1,
            std::ops::Bound::Unbounded => 0,
        };

        let end = match range.end_bound() {
            std::ops::Bound::Included(&n) => n + 1,
            std::ops::Bound::Excluded(&n) => n,
            std::ops::Bound::Unbounded => u64::MAX,
        };

        let mut entries = Vec::new();
        let start_key = Self::encode_log_index(start);
        let end_key = Self::encode_log_index(end);

        let mut iter = self.db.raw_iterator_cf(self.cf_logs());
        iter.seek(&start_key);

        while iter.valid() {
            if let (Some(key), Some(value)) = (iter.key(), iter.value()) {
                if key >= end_key.as_slice() {
                    break;
                }
                let entry = Self::deserialize_entry(value)?;
                entries.push(entry);
            }
            iter.next();
        }

        debug!("read {} log entries from range {:?}", entries.len(), range);
        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last_purged = *self.last_purged.read().await;
        let last_log_id = *self.last_log_id.read().await;

        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        let bytes = serde_json::to_vec(vote).map_err(|e| vote_error(e, ErrorVerb::Write))?;
        self.db
            .put_cf(self.cf_state(), KEY_VOTE, &bytes)
            .map_err(|e| vote_error(e, ErrorVerb::Write))?;

        *self.vote.write().await = Some(*vote);
        debug!("saved vote: {:?}", vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(*self.vote.read().await)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        // Arc<DB> makes the clone cheap
        LogStore {
            db: self.db.clone(),
            last_log_id: RwLock::new(*self.last_log_id.read().await),
            vote: RwLock::new(*self.vote.read().await),
            last_purged: RwLock::new(*self.last_purged.read().await),
        }
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let entries: Vec<_> = entries.into_iter().collect();
        if entries.is_empty() {
            callback.log_io_completed(Ok(()));
            return Ok(());
        }

        let mut batch = rocksdb::WriteBatch::default();
        let mut last_log_id = None;

        for entry in &entries {
            let key = Self::encode_log_index(entry.log_id.index);
            let value = Self::serialize_entry(entry)?;
            batch.put_cf(self.cf_logs(), &key, &value);
            last_log_id = Some(entry.log_id);
        }

        // Sync before acknowledging: a crash after the callback must
        // not lose the entry
        let mut write_opts = rocksdb::WriteOptions::default();
        write_opts.set_sync(true);
        self.db
            .write_opt(batch, &write_opts)
            .map_err(|e| logs_error(e, ErrorVerb::Write))?;

        if let Some(log_id) = last_log_id {
            *self.last_log_id.write().await = Some(log_id);
        }

        debug!("appended {} log entries", entries.len());
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        // Delete conflicting entries with index >= log_id.index; the
        // entry at log_id itself is in conflict and must go too
        let start_key = Self::encode_log_index(log_id.index);

        let mut batch = rocksdb::WriteBatch::default();
        let mut iter = self.db.raw_iterator_cf(self.cf_logs());
        iter.seek(&start_key);

        while iter.valid() {
            if let Some(key) = iter.key() {
                batch.delete_cf(self.cf_logs(), key);
            }
            iter.next();
        }

        self.db
            .write(batch)
            .map_err(|e| logs_error(e, ErrorVerb::Delete))?;

        let remaining = self.scan_last_log_id()?;
        let last_purged = *self.last_purged.read().await;
        *self.last_log_id.write().await = remaining.or(last_purged);

        debug!("truncated logs since index {}", log_id.index);
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        // Delete all entries with index <= log_id.index; they are
        // covered by a snapshot
        let end_key = Self::encode_log_index(log_id.index + 1);

        let mut batch = rocksdb::WriteBatch::default();
        let mut iter = self.db.raw_iterator_cf(self.cf_logs());
        iter.seek_to_first();

        while iter.valid() {
            if let Some(key) = iter.key() {
                if key >= end_key.as_slice() {
                    break;
                }
                batch.delete_cf(self.cf_logs(), key);
            }
            iter.next();
        }

        let last_purged_bytes =
            serde_json::to_vec(&log_id).map_err(|e| logs_error(e, ErrorVerb::Write))?;
        batch.put_cf(self.cf_state(), KEY_LAST_PURGED, &last_purged_bytes);

        self.db
            .write(batch)
            .map_err(|e| logs_error(e, ErrorVerb::Delete))?;

        *self.last_purged.write().await = Some(log_id);

        debug!("purged logs up to index {}", log_id.index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::request::{KeeperOp, RequestForSession};
    use openraft::{CommittedLeaderId, EntryPayload};

    fn entry(index: u64) -> Entry<TypeConfig> {
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(RequestForSession::new(1, index, 0, KeeperOp::Ping)),
        }
    }

    #[test]
    fn test_encode_decode_log_index() {
        let index = 12345u64;
        let encoded = LogStore::encode_log_index(index);
        let decoded = LogStore::decode_log_index(&encoded);
        assert_eq!(index, decoded);
    }

    #[test]
    fn test_encode_log_index_ordering() {
        // Big-endian encoding must preserve index ordering for RocksDB
        let indices = vec![0u64, 1, 100, 1000, u64::MAX];
        let encoded: Vec<_> = indices
            .iter()
            .map(|&i| LogStore::encode_log_index(i))
            .collect();

        for i in 0..encoded.len() - 1 {
            assert!(encoded[i] < encoded[i + 1]);
        }
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::new(dir.path()).await.unwrap();

        for entry in [entry(1), entry(2), entry(3)] {
            let key = LogStore::encode_log_index(entry.log_id.index);
            let value = LogStore::serialize_entry(&entry).unwrap();
            store.db.put_cf(store.cf_logs(), &key, &value).unwrap();
        }

        let entries = store.try_get_log_entries(1..=3).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].log_id.index, 1);
        assert_eq!(entries[2].log_id.index, 3);

        let partial = store.try_get_log_entries(2..3).await.unwrap();
        assert_eq!(partial.len(), 1);
        assert_eq!(partial[0].log_id.index, 2);
    }

    #[tokio::test]
    async fn test_corrupt_tail_is_discarded_on_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LogStore::new(dir.path()).await.unwrap();
            for entry in [entry(1), entry(2)] {
                let key = LogStore::encode_log_index(entry.log_id.index);
                let value = LogStore::serialize_entry(&entry).unwrap();
                store.db.put_cf(store.cf_logs(), &key, &value).unwrap();
            }
            // A torn write at the tail
            let key = LogStore::encode_log_index(3);
            store
                .db
                .put_cf(store.cf_logs(), &key, b"{\"log_id\":{\"ter")
                .unwrap();
        }

        let mut store = LogStore::new(dir.path()).await.unwrap();
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id.map(|l| l.index), Some(2));

        let entries = store.try_get_log_entries(1..).await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_truncate_and_purge() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::new(dir.path()).await.unwrap();

        for i in 1..=5 {
            let e = entry(i);
            let key = LogStore::encode_log_index(i);
            let value = LogStore::serialize_entry(&e).unwrap();
            store.db.put_cf(store.cf_logs(), &key, &value).unwrap();
        }

        store
            .truncate(LogId::new(CommittedLeaderId::new(1, 1), 4))
            .await
            .unwrap();
        let entries = store.try_get_log_entries(1..).await.unwrap();
        assert_eq!(entries.len(), 3);
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id.map(|l| l.index), Some(3));

        store
            .purge(LogId::new(CommittedLeaderId::new(1, 1), 2))
            .await
            .unwrap();
        let entries = store.try_get_log_entries(1..).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].log_id.index, 3);

        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id.map(|l| l.index), Some(2));
    }
}
