//! redb-backed storage engine.
//!
//! Each bucket is a redb table with `&str` keys and `&[u8]` values. Bucket
//! sequence counters live in a private `u64` table keyed by bucket name, so a
//! counter survives deletion of every record it minted.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use redb::{
    Database, DatabaseError, ReadTransaction, ReadableDatabase, ReadableTable, TableDefinition,
    TableError, WriteTransaction,
};
use tracing::{debug, warn};

use super::{Entry, ReadTxn, StorageEngine, WriteTxn};
use crate::error::{StateError, StateResult, map_err};

/// Sequence counters keyed by the bucket they mint ids for.
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("__sequences");

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

fn bucket_def(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

/// Thread-safe engine over a single redb database.
pub struct RedbEngine {
    db: Database,
    name: String,
}

impl RedbEngine {
    /// Open (or create) the store file at `path`, waiting up to `timeout`
    /// while another handle holds the file lock.
    pub fn open(path: &Path, timeout: Duration) -> StateResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StateError::Open(format!("{}: {e}", parent.display())))?;
        }

        let started = Instant::now();
        let db = loop {
            match Database::create(path) {
                Ok(db) => break db,
                Err(DatabaseError::DatabaseAlreadyOpen) if started.elapsed() < timeout => {
                    warn!(?path, "database locked, retrying");
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(StateError::Open(format!("{}: {e}", path.display())));
                }
            }
        };

        debug!(?path, "redb engine opened");
        Ok(Self {
            db,
            name: "redb".to_string(),
        })
    }

    /// Create an ephemeral in-memory engine (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        debug!("in-memory redb engine opened");
        Ok(Self {
            db,
            name: "memory".to_string(),
        })
    }
}

impl StorageEngine for RedbEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn begin_read(&self) -> StateResult<Box<dyn ReadTxn + '_>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        Ok(Box::new(RedbRead { txn }))
    }

    fn begin_write(&self) -> StateResult<Box<dyn WriteTxn + '_>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        Ok(Box::new(RedbWrite { txn }))
    }
}

// ── Read transactions ──────────────────────────────────────────────

struct RedbRead {
    txn: ReadTransaction,
}

impl ReadTxn for RedbRead {
    fn get(&self, bucket: &str, key: &str) -> StateResult<Option<Vec<u8>>> {
        let table = match self.txn.open_table(bucket_def(bucket)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(StateError::Table(e.to_string())),
        };
        let value = table.get(key).map_err(map_err!(Read))?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn scan(&self, bucket: &str) -> StateResult<Vec<Entry>> {
        let table = match self.txn.open_table(bucket_def(bucket)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(StateError::Table(e.to_string())),
        };
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            results.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(results)
    }
}

// ── Write transactions ─────────────────────────────────────────────

struct RedbWrite {
    txn: WriteTransaction,
}

impl ReadTxn for RedbWrite {
    fn get(&self, bucket: &str, key: &str) -> StateResult<Option<Vec<u8>>> {
        let table = self
            .txn
            .open_table(bucket_def(bucket))
            .map_err(map_err!(Table))?;
        let value = table.get(key).map_err(map_err!(Read))?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn scan(&self, bucket: &str) -> StateResult<Vec<Entry>> {
        let table = self
            .txn
            .open_table(bucket_def(bucket))
            .map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            results.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(results)
    }
}

impl WriteTxn for RedbWrite {
    fn put(&mut self, bucket: &str, key: &str, value: &[u8]) -> StateResult<()> {
        let mut table = self
            .txn
            .open_table(bucket_def(bucket))
            .map_err(map_err!(Table))?;
        table.insert(key, value).map_err(map_err!(Write))?;
        Ok(())
    }

    fn delete(&mut self, bucket: &str, key: &str) -> StateResult<bool> {
        let mut table = self
            .txn
            .open_table(bucket_def(bucket))
            .map_err(map_err!(Table))?;
        let existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        Ok(existed)
    }

    fn next_sequence(&mut self, bucket: &str) -> StateResult<u64> {
        let mut table = self.txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        let current = table
            .get(bucket)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        let next = current + 1;
        table.insert(bucket, next).map_err(map_err!(Write))?;
        Ok(next)
    }

    fn commit(self: Box<Self>) -> StateResult<()> {
        self.txn.commit().map_err(map_err!(Commit))
    }

    fn abort(self: Box<Self>) -> StateResult<()> {
        self.txn.abort().map_err(map_err!(Transaction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_bucket_reads_empty() {
        let engine = RedbEngine::open_in_memory().unwrap();
        let txn = engine.begin_read().unwrap();
        assert_eq!(txn.get("nothing", "k").unwrap(), None);
        assert!(txn.scan("nothing").unwrap().is_empty());
    }

    #[test]
    fn put_commit_then_read() {
        let engine = RedbEngine::open_in_memory().unwrap();
        let mut txn = engine.begin_write().unwrap();
        txn.put("b", "k2", b"two").unwrap();
        txn.put("b", "k1", b"one").unwrap();
        txn.commit().unwrap();

        let txn = engine.begin_read().unwrap();
        assert_eq!(txn.get("b", "k1").unwrap(), Some(b"one".to_vec()));
        let keys: Vec<String> = txn.scan("b").unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["k1", "k2"]);
    }

    #[test]
    fn abort_discards_writes() {
        let engine = RedbEngine::open_in_memory().unwrap();
        let mut txn = engine.begin_write().unwrap();
        txn.put("b", "k", b"v").unwrap();
        txn.abort().unwrap();

        let txn = engine.begin_read().unwrap();
        assert_eq!(txn.get("b", "k").unwrap(), None);
    }

    #[test]
    fn sequences_are_per_bucket_and_survive_deletes() {
        let engine = RedbEngine::open_in_memory().unwrap();
        let mut txn = engine.begin_write().unwrap();
        assert_eq!(txn.next_sequence("a").unwrap(), 1);
        assert_eq!(txn.next_sequence("a").unwrap(), 2);
        assert_eq!(txn.next_sequence("b").unwrap(), 1);
        txn.put("a", "2", b"x").unwrap();
        assert!(txn.delete("a", "2").unwrap());
        assert!(!txn.delete("a", "2").unwrap());
        txn.commit().unwrap();

        let mut txn = engine.begin_write().unwrap();
        assert_eq!(txn.next_sequence("a").unwrap(), 3);
        txn.commit().unwrap();
    }

    #[test]
    fn sequence_table_is_not_a_bucket() {
        let engine = RedbEngine::open_in_memory().unwrap();
        let mut txn = engine.begin_write().unwrap();
        txn.next_sequence("a").unwrap();
        txn.commit().unwrap();

        let txn = engine.begin_read().unwrap();
        assert!(txn.scan("a").unwrap().is_empty());
    }

    #[test]
    fn on_disk_engine_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("agent.redb");
        {
            let engine = RedbEngine::open(&path, Duration::from_secs(1)).unwrap();
            let mut txn = engine.begin_write().unwrap();
            txn.put("b", "k", b"v").unwrap();
            txn.commit().unwrap();
        }
        let engine = RedbEngine::open(&path, Duration::from_secs(1)).unwrap();
        assert_eq!(engine.name(), "redb");
        let txn = engine.begin_read().unwrap();
        assert_eq!(txn.get("b", "k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn locked_file_fails_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.redb");
        let _held = RedbEngine::open(&path, Duration::from_secs(1)).unwrap();
        let started = Instant::now();
        let err = RedbEngine::open(&path, Duration::from_millis(250)).err().unwrap();
        assert!(matches!(err, StateError::Open(_)));
        assert!(started.elapsed() >= Duration::from_millis(250));
    }
}
