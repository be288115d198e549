//! The persistent storage in RocksDB.
//!
//! Keys are the raw byte strings produced by the state layer's key codec;
//! no re-encoding happens here, so bytewise RocksDB iteration order is
//! exactly the consensus iteration order.

use std::env;
use std::path::Path;
use std::str::FromStr;

use caldera_storage::{DbWriteBatch, Error, KVBytes, Result, DB};
use rocksdb::{
    BlockBasedOptions, DBIterator, Direction, FlushOptions, IteratorMode,
    Options, ReadOptions, WriteBatch, WriteOptions,
};

/// Env. var to override the number of RocksDB compaction threads
const ENV_VAR_ROCKSDB_COMPACTION_THREADS: &str =
    "CALDERA_ROCKSDB_COMPACTION_THREADS";

/// A RocksDB-backed store.
#[derive(Debug)]
pub struct RocksDb(rocksdb::DB);

/// Open RocksDB at the given path, creating it if missing.
pub fn open(path: impl AsRef<Path>) -> Result<RocksDb> {
    let logical_cores = std::thread::available_parallelism()
        .map(|cores| cores.get() as i32)
        .unwrap_or(1);
    let compaction_threads = match env::var(ENV_VAR_ROCKSDB_COMPACTION_THREADS)
    {
        Ok(raw) => match i32::from_str(&raw) {
            Ok(threads) if threads > 0 => threads,
            _ => {
                tracing::warn!(
                    "Invalid {} value: {}. Expecting a positive number; \
                     using the default.",
                    ENV_VAR_ROCKSDB_COMPACTION_THREADS,
                    raw
                );
                (logical_cores / 4).max(1)
            }
        },
        // default to a quarter of the logical CPU count
        Err(_) => (logical_cores / 4).max(1),
    };
    tracing::debug!(
        "Using {} compaction threads for RocksDB.",
        compaction_threads
    );

    let mut db_opts = Options::default();
    // recommended initial setup, see
    // https://github.com/facebook/rocksdb/wiki/Setup-Options-and-Basic-Tuning
    db_opts.set_level_compaction_dynamic_level_bytes(true);
    db_opts.increase_parallelism(compaction_threads);
    db_opts.set_bytes_per_sync(1048576);
    db_opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
    db_opts.set_compression_options(0, 0, 0, 1024 * 1024);

    let mut table_opts = BlockBasedOptions::default();
    table_opts.set_block_size(16 * 1024);
    table_opts.set_cache_index_and_filter_blocks(true);
    table_opts.set_pin_l0_filter_and_index_blocks_in_cache(true);
    table_opts.set_format_version(5);
    db_opts.set_block_based_table_factory(&table_opts);

    db_opts.create_if_missing(true);

    rocksdb::DB::open(&db_opts, path)
        .map(RocksDb)
        .map_err(|e| Error::DbError(e.into_string()))
}

impl RocksDb {
    /// Flush memtables to disk, waiting for completion
    pub fn flush(&self) -> Result<()> {
        let mut flush_opts = FlushOptions::default();
        flush_opts.set_wait(true);
        self.0
            .flush_opt(&flush_opts)
            .map_err(|e| Error::DbError(e.into_string()))
    }
}

impl Drop for RocksDb {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            tracing::error!(%err, "Failed to flush RocksDB on drop");
        }
    }
}

impl DB for RocksDb {
    type PrefixIter<'iter> = PersistentPrefixIterator<'iter>;
    type WriteBatch = RocksDbWriteBatch;

    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.0
            .get(key)
            .map_err(|e| Error::DbError(e.into_string()))
    }

    fn write(&mut self, key: &[u8], value: impl AsRef<[u8]>) -> Result<()> {
        self.0
            .put(key, value)
            .map_err(|e| Error::DbError(e.into_string()))
    }

    fn erase(&mut self, key: &[u8]) -> Result<()> {
        self.0
            .delete(key)
            .map_err(|e| Error::DbError(e.into_string()))
    }

    fn batch() -> Self::WriteBatch {
        RocksDbWriteBatch::default()
    }

    fn exec_batch(&mut self, batch: Self::WriteBatch, sync: bool) -> Result<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(sync);
        self.0
            .write_opt(batch.0, &write_opts)
            .map_err(|e| Error::DbError(e.into_string()))
    }

    fn iter_from<'iter>(&'iter self, from: &[u8]) -> Self::PrefixIter<'iter> {
        let read_opts = ReadOptions::default();
        let iter = self.0.iterator_opt(
            IteratorMode::From(from, Direction::Forward),
            read_opts,
        );
        PersistentPrefixIterator(iter)
    }
}

/// A write batch buffered for atomic execution.
#[derive(Default)]
pub struct RocksDbWriteBatch(WriteBatch);

impl DbWriteBatch for RocksDbWriteBatch {
    fn put(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.0.put(key, value);
    }

    fn delete(&mut self, key: impl AsRef<[u8]>) {
        self.0.delete(key);
    }
}

/// A forward iterator over the store, bytewise ordered.
pub struct PersistentPrefixIterator<'a>(DBIterator<'a>);

impl<'a> Iterator for PersistentPrefixIterator<'a> {
    type Item = KVBytes;

    fn next(&mut self) -> Option<Self::Item> {
        match self.0.next()? {
            Ok((key, value)) => Some((key.into_vec(), value.into_vec())),
            Err(err) => {
                // iteration errors surface as an early end of the sequence
                tracing::error!(%err, "RocksDB iteration failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_ops_roundtrip() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut db = open(dir.path()).expect("open failed");
        assert_eq!(db.read(b"k").unwrap(), None);
        db.write(b"k", b"v").unwrap();
        assert_eq!(db.read(b"k").unwrap(), Some(b"v".to_vec()));
        db.erase(b"k").unwrap();
        assert_eq!(db.read(b"k").unwrap(), None);
    }

    #[test]
    fn test_batch_and_iteration_order() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut db = open(dir.path()).expect("open failed");

        let mut batch = RocksDb::batch();
        batch.put(b"b/2", b"2");
        batch.put(b"a/1", b"1");
        batch.put(b"b/1", b"3");
        batch.delete(b"a/1");
        db.exec_batch(batch, true).unwrap();

        let entries: Vec<KVBytes> = db.iter_from(b"").collect();
        assert_eq!(
            entries,
            vec![
                (b"b/1".to_vec(), b"3".to_vec()),
                (b"b/2".to_vec(), b"2".to_vec()),
            ]
        );
        // seek starts mid-range
        let from_b2: Vec<KVBytes> = db.iter_from(b"b/2").collect();
        assert_eq!(from_b2.len(), 1);
    }

    #[test]
    fn test_reopen_preserves_data() {
        let dir = tempfile::tempdir().expect("temp dir");
        {
            let mut db = open(dir.path()).expect("open failed");
            db.write(b"persisted", b"yes").unwrap();
        }
        let db = open(dir.path()).expect("reopen failed");
        assert_eq!(db.read(b"persisted").unwrap(), Some(b"yes".to_vec()));
    }
}
