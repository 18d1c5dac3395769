//! Storage engine abstraction.
//!
//! An engine is a single store of named buckets, each a sorted `&str -> bytes`
//! map, reachable only through scoped transactions. Write transactions are
//! exclusive and all-or-nothing; read transactions see a consistent snapshot.
//!
//! Buckets come into existence on first write. Reading a bucket that was never
//! written yields nothing, never an error.

pub mod redb_engine;

use crate::error::StateResult;

pub use redb_engine::RedbEngine;

/// A key/value pair as stored in a bucket.
pub type Entry = (String, Vec<u8>);

/// Read operations shared by both transaction kinds.
pub trait ReadTxn {
    fn get(&self, bucket: &str, key: &str) -> StateResult<Option<Vec<u8>>>;

    /// All entries of a bucket, in key order.
    fn scan(&self, bucket: &str) -> StateResult<Vec<Entry>>;

    /// Number of entries in a bucket.
    fn count(&self, bucket: &str) -> StateResult<usize> {
        Ok(self.scan(bucket)?.len())
    }
}

/// An exclusive write transaction. Dropping it without `commit` discards every write.
pub trait WriteTxn: ReadTxn {
    fn put(&mut self, bucket: &str, key: &str, value: &[u8]) -> StateResult<()>;

    /// Remove a key. Returns true if it existed.
    fn delete(&mut self, bucket: &str, key: &str) -> StateResult<bool>;

    /// Next value of the bucket's counter. Values start at 1 and are never reused.
    fn next_sequence(&mut self, bucket: &str) -> StateResult<u64>;

    fn commit(self: Box<Self>) -> StateResult<()>;

    fn abort(self: Box<Self>) -> StateResult<()>;
}

/// A transactional bucket store.
pub trait StorageEngine: Send + Sync {
    /// Backend name this engine was registered under.
    fn name(&self) -> &str;

    fn begin_read(&self) -> StateResult<Box<dyn ReadTxn + '_>>;

    fn begin_write(&self) -> StateResult<Box<dyn WriteTxn + '_>>;
}
