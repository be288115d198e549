//! Contract state for the Caldera chain: a layered delta journal over an
//! ordered key/value store, the account-level abstraction (AAL) ledger that
//! collapses each contract's native-coin balance into a single shadow UTXO,
//! and the condensing-transaction builder that reconciles balances with the
//! UTXO model at the end of a block.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

pub mod condense;
pub mod events;
pub mod exec;
pub mod keys;
pub mod write_log;

use std::cell::RefCell;
use std::collections::HashSet;

use caldera_core::address::UniversalAddress;
use caldera_core::hash::Hash;
use caldera_core::transaction::OutPoint;
use caldera_storage::{DbWriteBatch, DB};
use thiserror::Error;

use crate::write_log::{DeltaCheckpoint, WriteLog};

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Db(#[from] caldera_storage::Error),
    #[error(
        "Insufficient funds: {address} holds {balance} but the transfer \
         needs {needed}"
    )]
    InsufficientFunds {
        address: UniversalAddress,
        balance: u64,
        needed: u64,
    },
    #[error("Balance overflow crediting {0}")]
    BalanceOverflow(UniversalAddress),
    #[error("Malformed AAL shadow record for {0}")]
    MalformedAalRecord(UniversalAddress),
    #[error("No {0:?} virtual machine is available")]
    UnsupportedVm(caldera_core::contract::VmVersion),
}

/// Result for functions that may fail
pub type Result<T> = std::result::Result<T, Error>;

/// An AAL shadow record: the single UTXO currently holding a contract
/// account's entire balance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AalRecord {
    /// The transaction holding the balance
    pub txid: Hash,
    /// The output index within that transaction
    pub vout: u32,
    /// The balance carried by that output
    pub balance: u64,
}

impl AalRecord {
    /// The outpoint this record names
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }
}

/// The contract state wrapper: a checkpointed journal of state writes,
/// balance changes and spent shadow UTXOs layered over a backing store.
///
/// One wrapper serves exactly one contract execution chain at a time;
/// nested calls bracket their work with [`checkpoint`](Self::checkpoint) and
/// [`revert`](Self::revert). Nothing touches the store until
/// [`commit`](Self::commit).
#[derive(Debug)]
pub struct ContractState<D>
where
    D: DB,
{
    /// The backing store
    db: D,
    /// The checkpoint stack
    log: WriteLog,
    /// Addresses known to have no AAL record on disk, to save repeated
    /// lookups. Never used to answer positive reads, and cleared on every
    /// successful commit.
    has_no_aal: RefCell<HashSet<UniversalAddress>>,
    /// Initial coins delivered by the origin transaction, if any
    initial_coins: Option<(UniversalAddress, OutPoint)>,
}

impl<D> ContractState<D>
where
    D: DB,
{
    /// Wrap the given store with a fresh journal
    pub fn new(db: D) -> Self {
        Self {
            db,
            log: WriteLog::default(),
            has_no_aal: RefCell::new(HashSet::new()),
            initial_coins: None,
        }
    }

    /// The backing store
    pub fn db(&self) -> &D {
        &self.db
    }

    /// The current checkpoint depth
    pub fn depth(&self) -> usize {
        self.log.depth()
    }

    /// Push a new checkpoint and return its index
    pub fn checkpoint(&mut self) -> usize {
        self.log.checkpoint()
    }

    /// Discard the top checkpoint (never checkpoint 0) and return the new
    /// top index
    pub fn revert(&mut self) -> usize {
        self.log.revert()
    }

    /// Merge the top checkpoint into its parent
    pub fn condense_single(&mut self) {
        self.log.condense_single();
    }

    /// Condense every checkpoint into checkpoint 0
    pub fn condense_all(&mut self) {
        self.log.condense_all();
    }

    /// A snapshot of the top checkpoint's modifications
    pub fn modified_state(&self) -> DeltaCheckpoint {
        self.log.current().clone()
    }

    /// Flush the journal to the store in one atomic batch: non-empty deltas
    /// become writes, tombstones become deletes. On success the journal is
    /// reset to a single fresh checkpoint and the negative AAL cache is
    /// cleared; on store failure the journal is left intact so the caller
    /// may retry or abort.
    pub fn commit(&mut self) -> Result<()> {
        self.log.condense_all();
        let mut batch = D::batch();
        for (key, value) in &self.log.current().deltas {
            if value.is_empty() {
                batch.delete(key);
            } else {
                batch.put(key, value);
            }
        }
        self.db.exec_batch(batch, true)?;
        self.log.reset();
        self.has_no_aal.borrow_mut().clear();
        Ok(())
    }

    /// Read a value, journal first: the topmost checkpoint containing the
    /// key wins (a tombstone reads as present-with-empty-value), otherwise
    /// the store is consulted.
    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(pending) = self.log.read(key) {
            return Ok(Some(pending.to_vec()));
        }
        Ok(self.db.read(key)?)
    }

    /// Write a value into the top checkpoint; empty bytes are a tombstone
    fn write(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.log.write(key, value);
    }

    /// The balance of an address: the topmost checkpoint that modified it,
    /// else its AAL shadow record, else zero.
    pub fn balance(&self, address: &UniversalAddress) -> Result<u64> {
        if let Some(balance) = self.log.find_balance(address) {
            return Ok(balance);
        }
        Ok(self.read_aal(address)?.map_or(0, |record| record.balance))
    }

    /// Transfer native coins between addresses.
    ///
    /// The first time an execution touches an address with an on-disk
    /// shadow UTXO, that UTXO is marked spent so the condensing transaction
    /// can re-materialize the balance; once an address appears in the
    /// journal its shadow is guaranteed spent already and the store is not
    /// consulted again. Transfers from the initial-coins receiver spend the
    /// initial outpoint instead of re-reading any shadow record.
    pub fn transfer(
        &mut self,
        from: UniversalAddress,
        to: UniversalAddress,
        value: u64,
    ) -> Result<()> {
        if value == 0 {
            return Ok(());
        }

        let from_balance = match self.log.find_balance(&from) {
            Some(balance) => balance,
            None => match self.read_aal(&from)? {
                Some(record) => {
                    self.log.spend_vin(record.outpoint());
                    record.balance
                }
                None => 0,
            },
        };
        if value > from_balance {
            return Err(Error::InsufficientFunds {
                address: from,
                balance: from_balance,
                needed: value,
            });
        }
        self.log.set_balance(from, from_balance - value);

        if let Some((receiver, initial_out)) = self.initial_coins {
            if receiver == from {
                // the initial-coins outpoint subsumes any shadow record
                self.log.spend_vin(initial_out);
            }
        }

        let to_balance = match self.log.find_balance(&to) {
            Some(balance) => balance,
            None => match self.read_aal(&to)? {
                Some(record) => {
                    self.log.spend_vin(record.outpoint());
                    record.balance
                }
                None => 0,
            },
        };
        let credited = to_balance
            .checked_add(value)
            .ok_or(Error::BalanceOverflow(to))?;
        self.log.set_balance(to, credited);
        Ok(())
    }

    /// Record the native coins delivered to a contract by the origin
    /// transaction of an execution. Must be called before any checkpoint is
    /// pushed and with a non-zero value; otherwise it is a no-op.
    pub fn set_initial_coins(
        &mut self,
        address: UniversalAddress,
        out: OutPoint,
        value: u64,
    ) -> Result<()> {
        if value == 0 || self.log.depth() != 1 {
            return Ok(());
        }
        match self.read_aal(&address)? {
            Some(prev) => {
                // both the old shadow UTXO and the incoming output get
                // condensed into a single fresh vout
                let balance = prev
                    .balance
                    .checked_add(value)
                    .ok_or(Error::BalanceOverflow(address))?;
                self.log.set_balance(address, balance);
                self.log.spend_vin(prev.outpoint());
                self.log.spend_vin(out);
            }
            None => {
                self.log.set_balance(address, value);
                // if the execution spends these coins, this record is
                // overwritten by the condensing pass
                self.write_aal(&address, &out.txid, out.n, value);
            }
        }
        self.initial_coins = Some((address, out));
        Ok(())
    }

    /// Read an AAL shadow record. Journal entries win (a tombstone means no
    /// record); a store miss is remembered in the negative cache.
    fn read_aal(
        &self,
        address: &UniversalAddress,
    ) -> Result<Option<AalRecord>> {
        let key = keys::aal_key(address);
        if let Some(pending) = self.log.read(&key) {
            if pending.is_empty() {
                return Ok(None);
            }
            return Self::decode_aal(address, pending).map(Some);
        }
        if self.has_no_aal.borrow().contains(address) {
            return Ok(None);
        }
        match self.db.read(&key)? {
            Some(value) if !value.is_empty() => {
                Self::decode_aal(address, &value).map(Some)
            }
            _ => {
                self.has_no_aal.borrow_mut().insert(*address);
                Ok(None)
            }
        }
    }

    fn decode_aal(
        address: &UniversalAddress,
        value: &[u8],
    ) -> Result<AalRecord> {
        keys::decode_aal_value(value)
            .map(|(txid, vout, balance)| AalRecord {
                txid,
                vout,
                balance,
            })
            .ok_or(Error::MalformedAalRecord(*address))
    }

    /// Write an AAL shadow record into the journal
    pub(crate) fn write_aal(
        &mut self,
        address: &UniversalAddress,
        txid: &Hash,
        vout: u32,
        balance: u64,
    ) {
        self.write(
            keys::aal_key(address),
            keys::encode_aal_value(txid, vout, balance).to_vec(),
        );
    }

    /// Remove an AAL shadow record: a tombstone in the journal
    pub(crate) fn remove_aal(&mut self, address: &UniversalAddress) {
        self.write(keys::aal_key(address), Vec::new());
    }

    /// Write a live contract state entry
    pub fn write_state(
        &mut self,
        address: &UniversalAddress,
        key: &[u8],
        value: Vec<u8>,
    ) {
        self.write(keys::state_key(address, key), value);
    }

    /// Read a live contract state entry
    pub fn read_state(
        &self,
        address: &UniversalAddress,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        self.read(&keys::state_key(address, key))
    }

    /// Write a contract's bytecode
    pub fn write_bytecode(
        &mut self,
        address: &UniversalAddress,
        bytecode: Vec<u8>,
    ) {
        self.write(keys::bytecode_key(address), bytecode);
    }

    /// Read a contract's bytecode
    pub fn read_bytecode(
        &self,
        address: &UniversalAddress,
    ) -> Result<Option<Vec<u8>>> {
        self.read(&keys::bytecode_key(address))
    }

    /// Mark a contract key as updated at the given block
    pub fn write_updated_key(
        &mut self,
        address: &UniversalAddress,
        key: &[u8],
        blk_num: u32,
        blk_hash: &Hash,
    ) {
        self.write(
            keys::updated_key(address, key),
            keys::encode_updated_value(blk_num, blk_hash),
        );
    }

    /// The block at which a contract key was last updated
    pub fn read_updated_key(
        &self,
        address: &UniversalAddress,
        key: &[u8],
    ) -> Result<Option<(u32, Hash)>> {
        Ok(self
            .read(&keys::updated_key(address, key))?
            .and_then(|value| keys::decode_updated_value(&value)))
    }

    /// Store the raw (unhashed) form of a contract key
    pub fn write_raw_key(
        &mut self,
        address: &UniversalAddress,
        key: &[u8],
        raw: Vec<u8>,
    ) {
        self.write(keys::raw_key(address, key), raw);
    }

    /// The raw (unhashed) form of a contract key
    pub fn read_raw_key(
        &self,
        address: &UniversalAddress,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        self.read(&keys::raw_key(address, key))
    }

    /// Set the current changelog iterator of a contract key
    pub fn write_current_iterator(
        &mut self,
        address: &UniversalAddress,
        key: &[u8],
        iterator: u64,
    ) {
        self.write(
            keys::current_iterator_key(address, key),
            iterator.to_le_bytes().to_vec(),
        );
    }

    /// The current changelog iterator of a contract key
    pub fn read_current_iterator(
        &self,
        address: &UniversalAddress,
        key: &[u8],
    ) -> Result<Option<u64>> {
        Ok(self
            .read(&keys::current_iterator_key(address, key))?
            .and_then(|value| {
                Some(u64::from_le_bytes(value.as_slice().try_into().ok()?))
            }))
    }

    /// Store a contract key's value at an iterator point
    pub fn write_state_at_iterator(
        &mut self,
        address: &UniversalAddress,
        key: &[u8],
        iterator: u64,
        value: Vec<u8>,
    ) {
        self.write(keys::state_at_iterator_key(address, key, iterator), value);
    }

    /// A contract key's value at an iterator point
    pub fn read_state_at_iterator(
        &self,
        address: &UniversalAddress,
        key: &[u8],
        iterator: u64,
    ) -> Result<Option<Vec<u8>>> {
        self.read(&keys::state_at_iterator_key(address, key, iterator))
    }

    /// Store update info for a contract key at an iterator point
    pub fn write_info_at_iterator(
        &mut self,
        address: &UniversalAddress,
        key: &[u8],
        iterator: u64,
        blk_num: u32,
        blk_hash: &Hash,
        txid: &Hash,
        vout: u32,
    ) {
        self.write(
            keys::info_at_iterator_key(address, key, iterator),
            keys::encode_info_value(blk_num, blk_hash, txid, vout),
        );
    }

    /// Update info for a contract key at an iterator point
    pub fn read_info_at_iterator(
        &self,
        address: &UniversalAddress,
        key: &[u8],
        iterator: u64,
    ) -> Result<Option<(u32, Hash, Hash, u32)>> {
        Ok(self
            .read(&keys::info_at_iterator_key(address, key, iterator))?
            .and_then(|value| keys::decode_info_value(&value)))
    }

    /// Store the oldest changelog iterator of a contract key
    pub fn write_oldest_iterator(
        &mut self,
        address: &UniversalAddress,
        key: &[u8],
        iterator: u64,
        blk_num: u32,
        blk_hash: &Hash,
    ) {
        self.write(
            keys::oldest_iterator_key(address, key),
            keys::encode_oldest_value(iterator, blk_num, blk_hash),
        );
    }

    /// The oldest changelog iterator of a contract key
    pub fn read_oldest_iterator(
        &self,
        address: &UniversalAddress,
        key: &[u8],
    ) -> Result<Option<(u64, u32, Hash)>> {
        Ok(self
            .read(&keys::oldest_iterator_key(address, key))?
            .and_then(|value| keys::decode_oldest_value(&value)))
    }
}
