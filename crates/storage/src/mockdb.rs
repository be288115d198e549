//! DB mock for testing

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::Bound::{Included, Unbounded};

use crate::{DbWriteBatch, Error, KVBytes, Result, DB};

/// An in-memory DB for testing.
#[derive(Debug, Default)]
pub struct MockDb(
    // The state is wrapped in `RefCell` to allow modifying it directly from
    // the batch write method (which requires an immutable self ref).
    RefCell<BTreeMap<Vec<u8>, Vec<u8>>>,
);

/// A batched operation, applied in order on execution.
#[derive(Debug)]
enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// An in-memory write batch, a buffered list of operations.
#[derive(Debug, Default)]
pub struct MockDbWriteBatch(Vec<BatchOp>);

impl DbWriteBatch for MockDbWriteBatch {
    fn put(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.0.push(BatchOp::Put(
            key.as_ref().to_vec(),
            value.as_ref().to_vec(),
        ));
    }

    fn delete(&mut self, key: impl AsRef<[u8]>) {
        self.0.push(BatchOp::Delete(key.as_ref().to_vec()));
    }
}

impl MockDb {
    /// The number of stored entries
    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

impl DB for MockDb {
    type PrefixIter<'iter> = MockPrefixIterator;
    type WriteBatch = MockDbWriteBatch;

    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.0.borrow().get(key).cloned())
    }

    fn write(&mut self, key: &[u8], value: impl AsRef<[u8]>) -> Result<()> {
        self.0
            .borrow_mut()
            .insert(key.to_vec(), value.as_ref().to_vec());
        Ok(())
    }

    fn erase(&mut self, key: &[u8]) -> Result<()> {
        self.0.borrow_mut().remove(key);
        Ok(())
    }

    fn batch() -> Self::WriteBatch {
        MockDbWriteBatch::default()
    }

    fn exec_batch(
        &mut self,
        batch: Self::WriteBatch,
        _sync: bool,
    ) -> Result<()> {
        let mut store = self.0.borrow_mut();
        for op in batch.0 {
            match op {
                BatchOp::Put(key, value) => {
                    store.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    store.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn iter_from<'iter>(&'iter self, from: &[u8]) -> Self::PrefixIter<'iter> {
        // cloning the range keeps the iterator free of the borrow
        let entries: Vec<KVBytes> = self
            .0
            .borrow()
            .range::<[u8], _>((Included(from), Unbounded))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        MockPrefixIterator {
            entries: entries.into_iter(),
        }
    }
}

/// A prefix iterator for the [`MockDb`].
#[derive(Debug)]
pub struct MockPrefixIterator {
    entries: std::vec::IntoIter<KVBytes>,
}

impl Iterator for MockPrefixIterator {
    type Item = KVBytes;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }
}

/// A failing DB, for exercising error paths: every operation returns
/// [`Error::DbError`].
#[derive(Debug, Default)]
pub struct FailingDb;

impl DB for FailingDb {
    type PrefixIter<'iter> = std::iter::Empty<KVBytes>;
    type WriteBatch = MockDbWriteBatch;

    fn read(&self, _key: &[u8]) -> Result<Option<Vec<u8>>> {
        Err(Error::DbError("mock read failure".to_string()))
    }

    fn write(&mut self, _key: &[u8], _value: impl AsRef<[u8]>) -> Result<()> {
        Err(Error::DbError("mock write failure".to_string()))
    }

    fn erase(&mut self, _key: &[u8]) -> Result<()> {
        Err(Error::DbError("mock erase failure".to_string()))
    }

    fn batch() -> Self::WriteBatch {
        MockDbWriteBatch::default()
    }

    fn exec_batch(
        &mut self,
        _batch: Self::WriteBatch,
        _sync: bool,
    ) -> Result<()> {
        Err(Error::DbError("mock batch failure".to_string()))
    }

    fn iter_from<'iter>(&'iter self, _from: &[u8]) -> Self::PrefixIter<'iter> {
        std::iter::empty()
    }
}
