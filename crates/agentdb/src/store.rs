//! Store — the typed entry point to the agent's persisted state.
//!
//! Wraps one [`StorageEngine`] and exposes scoped read and write
//! transactions plus the record helpers every entity repository builds on.
//! Repository operations live in `crate::entities`, each as an `impl Store`
//! block over its own buckets.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::codec::Record;
use crate::engine::{ReadTxn, RedbEngine, StorageEngine, WriteTxn};
use crate::error::{StateError, StateResult};
use crate::filter::{RecordFilter, matches_all};
use crate::render::{MessageRenderer, PositionalRenderer};

const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Thread-safe handle to the agent state store.
#[derive(Clone)]
pub struct Store {
    engine: Arc<dyn StorageEngine>,
    renderer: Arc<dyn MessageRenderer>,
}

impl Store {
    pub fn from_engine(engine: Arc<dyn StorageEngine>) -> Self {
        Self {
            engine,
            renderer: Arc::new(PositionalRenderer),
        }
    }

    /// Open (or create) a persistent store file at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let engine = RedbEngine::open(path, DEFAULT_OPEN_TIMEOUT)?;
        Ok(Self::from_engine(Arc::new(engine)))
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let engine = RedbEngine::open_in_memory()?;
        Ok(Self::from_engine(Arc::new(engine)))
    }

    /// Replace the renderer used for event log messages when a query does not supply one.
    pub fn with_renderer(mut self, renderer: Arc<dyn MessageRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn renderer(&self) -> &dyn MessageRenderer {
        self.renderer.as_ref()
    }

    pub fn backend_name(&self) -> &str {
        self.engine.name()
    }

    /// Release this handle. The file lock is dropped with the last clone.
    pub fn close(self) {
        info!(backend = self.engine.name(), "closing agent database");
    }

    /// Run `f` against a consistent snapshot.
    pub fn with_read<T>(&self, f: impl FnOnce(&dyn ReadTxn) -> StateResult<T>) -> StateResult<T> {
        let txn = self.engine.begin_read()?;
        f(&*txn)
    }

    /// Run `f` in an exclusive write transaction. Commits when `f` succeeds;
    /// any error aborts every write `f` made.
    pub fn with_write<T>(
        &self,
        f: impl FnOnce(&mut dyn WriteTxn) -> StateResult<T>,
    ) -> StateResult<T> {
        let mut txn = self.engine.begin_write()?;
        match f(&mut *txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = txn.abort() {
                    warn!(error = %abort_err, "failed to abort write transaction");
                }
                Err(e)
            }
        }
    }

    // ── Record helpers ─────────────────────────────────────────────

    pub(crate) fn find_by_key<T: Record>(&self, bucket: &str, key: &str) -> StateResult<Option<T>> {
        self.with_read(|txn| get_record(txn, bucket, key))
    }

    pub(crate) fn find_many<T: Record, F: RecordFilter<T>>(
        &self,
        bucket: &str,
        filters: &[F],
    ) -> StateResult<Vec<T>> {
        self.with_read(|txn| find_in(txn, bucket, filters))
    }

    pub(crate) fn put_by_key<T: Record>(&self, bucket: &str, key: &str, record: &T) -> StateResult<()> {
        self.with_write(|txn| put_record(txn, bucket, key, record))?;
        debug!(bucket, %key, "record stored");
        Ok(())
    }

    /// Remove a record. An absent record is not an error.
    pub(crate) fn delete_by_key(&self, bucket: &str, key: &str) -> StateResult<bool> {
        let existed = self.with_write(|txn| txn.delete(bucket, key))?;
        debug!(bucket, %key, existed, "record deleted");
        Ok(existed)
    }

    /// Remove a record and return what was stored, if anything.
    pub(crate) fn take_by_key<T: Record>(&self, bucket: &str, key: &str) -> StateResult<Option<T>> {
        let removed = self.with_write(|txn| {
            let current = get_record::<T, _>(&*txn, bucket, key)?;
            if current.is_some() {
                txn.delete(bucket, key)?;
            }
            Ok(current)
        })?;
        debug!(bucket, %key, existed = removed.is_some(), "record removed");
        Ok(removed)
    }

    pub(crate) fn find_singleton<T: Record>(&self, bucket: &str) -> StateResult<Option<T>> {
        self.with_read(|txn| singleton_in(txn, bucket))
    }

    pub(crate) fn save_singleton<T: Record>(&self, bucket: &str, record: &T) -> StateResult<()> {
        self.put_by_key(bucket, bucket, record)
    }

    pub(crate) fn delete_singleton(&self, bucket: &str) -> StateResult<bool> {
        self.delete_by_key(bucket, bucket)
    }

    pub(crate) fn find_raw(&self, bucket: &str, key: &str) -> StateResult<Option<Vec<u8>>> {
        self.with_read(|txn| txn.get(bucket, key))
    }

    pub(crate) fn save_raw(&self, bucket: &str, key: &str, value: &[u8]) -> StateResult<()> {
        self.with_write(|txn| txn.put(bucket, key, value))?;
        debug!(bucket, %key, "raw value stored");
        Ok(())
    }
}

// ── Transaction-scoped helpers ─────────────────────────────────────

pub(crate) fn get_record<T: Record, R: ReadTxn + ?Sized>(
    txn: &R,
    bucket: &str,
    key: &str,
) -> StateResult<Option<T>> {
    match txn.get(bucket, key)? {
        Some(bytes) => Ok(Some(T::from_bytes(bucket, key, &bytes)?)),
        None => Ok(None),
    }
}

/// Every record in a bucket with its key, in key order.
pub(crate) fn scan_records<T: Record, R: ReadTxn + ?Sized>(
    txn: &R,
    bucket: &str,
) -> StateResult<Vec<(String, T)>> {
    txn.scan(bucket)?
        .into_iter()
        .map(|(key, bytes)| {
            let record = T::from_bytes(bucket, &key, &bytes)?;
            Ok((key, record))
        })
        .collect()
}

pub(crate) fn find_in<T: Record, F: RecordFilter<T>, R: ReadTxn + ?Sized>(
    txn: &R,
    bucket: &str,
    filters: &[F],
) -> StateResult<Vec<T>> {
    Ok(scan_records::<T, R>(txn, bucket)?
        .into_iter()
        .map(|(_, record)| record)
        .filter(|record| matches_all(record, filters))
        .collect())
}

pub(crate) fn put_record<T: Record, W: WriteTxn + ?Sized>(
    txn: &mut W,
    bucket: &str,
    key: &str,
    record: &T,
) -> StateResult<()> {
    let bytes = record.to_bytes()?;
    txn.put(bucket, key, &bytes)
}

/// The one record of a singleton bucket. More than one record is corruption.
pub(crate) fn singleton_in<T: Record, R: ReadTxn + ?Sized>(
    txn: &R,
    bucket: &str,
) -> StateResult<Option<T>> {
    let mut entries = txn.scan(bucket)?;
    if entries.len() > 1 {
        return Err(StateError::InvariantViolation(format!(
            "{} records in singleton bucket {bucket}",
            entries.len()
        )));
    }
    match entries.pop() {
        Some((key, bytes)) => Ok(Some(T::from_bytes(bucket, &key, &bytes)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    impl Record for Note {}

    struct TextIs(&'static str);

    impl RecordFilter<Note> for TextIs {
        fn matches(&self, record: &Note) -> bool {
            record.text == self.0
        }
    }

    fn note(text: &str) -> Note {
        Note {
            text: text.to_string(),
        }
    }

    #[test]
    fn write_error_rolls_back() {
        let store = Store::open_in_memory().unwrap();
        let result: StateResult<()> = store.with_write(|txn| {
            put_record(txn, "notes", "a", &note("a"))?;
            Err(StateError::InvalidArgument("stop".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.find_by_key::<Note>("notes", "a").unwrap(), None);
    }

    #[test]
    fn find_many_applies_filters() {
        let store = Store::open_in_memory().unwrap();
        store.put_by_key("notes", "1", &note("x")).unwrap();
        store.put_by_key("notes", "2", &note("y")).unwrap();
        let found: Vec<Note> = store.find_many("notes", &[TextIs("y")]).unwrap();
        assert_eq!(found, vec![note("y")]);
        let none: Vec<Note> = store.find_many("missing", &[TextIs("y")]).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn singleton_rejects_multiple_records() {
        let store = Store::open_in_memory().unwrap();
        store.save_singleton("single", &note("one")).unwrap();
        assert_eq!(
            store.find_singleton::<Note>("single").unwrap(),
            Some(note("one"))
        );
        store.put_by_key("single", "other", &note("two")).unwrap();
        let err = store.find_singleton::<Note>("single").unwrap_err();
        assert!(matches!(err, StateError::InvariantViolation(_)));
    }

    #[test]
    fn deleting_absent_records_succeeds() {
        let store = Store::open_in_memory().unwrap();
        assert!(!store.delete_singleton("single").unwrap());
        assert_eq!(store.take_by_key::<Note>("notes", "x").unwrap(), None);

        store.put_by_key("notes", "x", &note("x")).unwrap();
        assert_eq!(
            store.take_by_key::<Note>("notes", "x").unwrap(),
            Some(note("x"))
        );
        assert_eq!(store.find_by_key::<Note>("notes", "x").unwrap(), None);
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.redb");
        {
            let store = Store::open(&path).unwrap();
            store.save_singleton("single", &note("kept")).unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.backend_name(), "redb");
        assert_eq!(
            store.find_singleton::<Note>("single").unwrap(),
            Some(note("kept"))
        );
    }
}
