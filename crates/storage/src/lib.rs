//! Storage capability traits. The state layer holds a store through these
//! narrow interfaces and never touches a concrete database directly; the
//! node crate provides the persistent RocksDB backend and [`mockdb`] the
//! in-memory one for tests.

#[cfg(any(test, feature = "testing"))]
pub mod mockdb;

use thiserror::Error;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("DB error: {0}")]
    DbError(String),
}

/// Result for functions that may fail
pub type Result<T> = std::result::Result<T, Error>;

/// A key-value pair yielded by prefix iteration
pub type KVBytes = (Vec<u8>, Vec<u8>);

/// Atomic batch of writes and deletes.
pub trait DbWriteBatch: Default {
    /// Insert a value under the given key, replacing any previous value
    fn put(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>);

    /// Remove the entry for the key; a no-op if the key is absent
    fn delete(&mut self, key: impl AsRef<[u8]>);
}

/// An ordered byte-keyed database backend.
///
/// Keys are arbitrary byte strings and iteration order is bytewise. This is
/// the only seam through which the state layer performs disk I/O.
pub trait DB {
    /// A handle for batch writes
    type WriteBatch: DbWriteBatch;
    /// The concrete prefix iterator
    type PrefixIter<'iter>: Iterator<Item = KVBytes>
    where
        Self: 'iter;

    /// Point lookup
    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Point write
    fn write(&mut self, key: &[u8], value: impl AsRef<[u8]>) -> Result<()>;

    /// Point delete; a no-op if the key is absent
    fn erase(&mut self, key: &[u8]) -> Result<()>;

    /// Start a write batch
    fn batch() -> Self::WriteBatch;

    /// Execute a write batch atomically. With `sync` set, the write is
    /// flushed to durable storage before returning.
    fn exec_batch(&mut self, batch: Self::WriteBatch, sync: bool) -> Result<()>;

    /// Lazily iterate entries in bytewise key order, starting at the first
    /// key greater than or equal to `from`. The iteration is unbounded
    /// above; callers stop when keys leave their namespace.
    fn iter_from<'iter>(&'iter self, from: &[u8]) -> Self::PrefixIter<'iter>;
}
