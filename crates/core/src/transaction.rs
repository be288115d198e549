//! Transactions and outpoints. The encoding here is the canonical wire form
//! the txid is computed over; every field is fixed-width little-endian and
//! scripts are length-prefixed, so two structurally equal transactions are
//! byte-identical.

use std::fmt::{self, Display};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::hash::Hash;
use crate::script::Script;

/// The default transaction version
pub const TX_VERSION: u32 = 2;

/// A reference to a specific transaction output.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshSerialize,
    BorshDeserialize,
)]
pub struct OutPoint {
    /// The transaction id
    pub txid: Hash,
    /// The output index within the transaction
    pub n: u32,
}

impl OutPoint {
    /// An outpoint from a txid and output index
    pub fn new(txid: Hash, n: u32) -> Self {
        Self { txid, n }
    }

    /// Whether this is the null outpoint
    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.n == 0
    }
}

impl Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.n)
    }
}

/// A transaction input consuming a previous output.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TxIn {
    /// The consumed output
    pub prevout: OutPoint,
    /// The unlocking script
    pub script_sig: Script,
}

impl TxIn {
    /// An input spending the given outpoint with the given script
    pub fn new(prevout: OutPoint, script_sig: Script) -> Self {
        Self { prevout, script_sig }
    }
}

/// A transaction output.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TxOut {
    /// The amount of native coin carried, in base units
    pub value: u64,
    /// The locking script
    pub script_pubkey: Script,
}

impl TxOut {
    /// An output carrying `value` locked by `script_pubkey`
    pub fn new(value: u64, script_pubkey: Script) -> Self {
        Self { value, script_pubkey }
    }
}

/// A transaction: inputs consumed, outputs created.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Transaction {
    /// The transaction format version
    pub version: u32,
    /// The consumed outputs
    pub vins: Vec<TxIn>,
    /// The created outputs
    pub vouts: Vec<TxOut>,
    /// Earliest block height at which the tx may be included
    pub lock_time: u32,
}

impl Default for Transaction {
    fn default() -> Self {
        Self {
            version: TX_VERSION,
            vins: Vec::new(),
            vouts: Vec::new(),
            lock_time: 0,
        }
    }
}

impl Transaction {
    /// Whether the transaction has neither inputs nor outputs
    pub fn is_empty(&self) -> bool {
        self.vins.is_empty() && self.vouts.is_empty()
    }

    /// The canonical wire encoding the txid is computed over
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&(self.vins.len() as u32).to_le_bytes());
        for vin in &self.vins {
            bytes.extend_from_slice(vin.prevout.txid.as_ref());
            bytes.extend_from_slice(&vin.prevout.n.to_le_bytes());
            bytes.extend_from_slice(
                &(vin.script_sig.len() as u32).to_le_bytes(),
            );
            bytes.extend_from_slice(vin.script_sig.as_bytes());
        }
        bytes.extend_from_slice(&(self.vouts.len() as u32).to_le_bytes());
        for vout in &self.vouts {
            bytes.extend_from_slice(&vout.value.to_le_bytes());
            bytes.extend_from_slice(
                &(vout.script_pubkey.len() as u32).to_le_bytes(),
            );
            bytes.extend_from_slice(vout.script_pubkey.as_bytes());
        }
        bytes.extend_from_slice(&self.lock_time.to_le_bytes());
        bytes
    }

    /// The transaction id: double SHA-256 of the wire encoding
    pub fn txid(&self) -> Hash {
        Hash::sha256d(self.encode())
    }
}
