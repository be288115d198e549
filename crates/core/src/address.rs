//! Universal addresses: a version tag plus 20 bytes of payload, covering
//! every output kind the chain knows about. Contract kinds (EVM, x86)
//! participate in the account-level abstraction and may own a shadow UTXO.

use std::fmt::{self, Display};

use borsh::{BorshDeserialize, BorshSerialize};
use data_encoding::HEXLOWER;
use thiserror::Error;

use crate::hash::{hash160, Hash};
use crate::script::Script;

/// The length of an address payload in bytes
pub const ADDRESS_DATA_LEN: usize = 20;

/// The length of the flat ABI form: 4-byte version plus payload
pub const ADDRESS_ABI_LEN: usize = 4 + ADDRESS_DATA_LEN;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown address kind tag {0}")]
    UnknownKind(u32),
    #[error("Unexpected address payload length, expected {ADDRESS_DATA_LEN}, got {0}")]
    WrongDataLength(usize),
}

/// Result for functions that may fail
pub type Result<T> = std::result::Result<T, Error>;

/// The version tag of a [`UniversalAddress`].
///
/// The numeric values are consensus critical: they are persisted inside
/// state keys and carried in the flat ABI form handed to contract code, so
/// they must never be reassigned.
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
#[repr(u8)]
#[borsh(use_discriminant = true)]
pub enum AddressKind {
    /// Unresolvable or non-standard provenance
    #[default]
    Unknown = 0,
    /// Legacy EVM address, either pubkeyhash or EVM depending on prior use
    LegacyEvm = 1,
    /// Pay-to-pubkey-hash
    PubKeyHash = 2,
    /// EVM contract account
    Evm = 3,
    /// x86 contract account
    X86 = 4,
    /// Pay-to-script-hash
    ScriptHash = 5,
    /// Pay-to-witness-script-hash
    P2wsh = 6,
    /// Pay-to-witness-pubkey-hash
    P2wpkh = 7,
}

impl AddressKind {
    /// The single-byte tag used in state keys
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Parse a kind from its numeric tag
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::LegacyEvm),
            2 => Ok(Self::PubKeyHash),
            3 => Ok(Self::Evm),
            4 => Ok(Self::X86),
            5 => Ok(Self::ScriptHash),
            6 => Ok(Self::P2wsh),
            7 => Ok(Self::P2wpkh),
            _ => Err(Error::UnknownKind(raw)),
        }
    }
}

/// An address usable by any part of the chain, contract or plain UTXO.
///
/// Ordering is strict lexicographic on `(kind, data)`. The condensing
/// transaction's output order relies on it, so the derives below are
/// consensus critical.
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
pub struct UniversalAddress {
    /// The version tag
    pub kind: AddressKind,
    /// The 20-byte payload
    pub data: [u8; ADDRESS_DATA_LEN],
}

impl UniversalAddress {
    /// An address from a kind and payload
    pub fn new(kind: AddressKind, data: [u8; ADDRESS_DATA_LEN]) -> Self {
        Self { kind, data }
    }

    /// An address from a kind and a payload slice
    pub fn from_slice(kind: AddressKind, data: &[u8]) -> Result<Self> {
        let data: [u8; ADDRESS_DATA_LEN] = data
            .try_into()
            .map_err(|_| Error::WrongDataLength(data.len()))?;
        Ok(Self { kind, data })
    }

    /// The address of a contract created by the given output:
    /// `ripemd160(sha256(txid ‖ n))` with `n` in little-endian.
    pub fn from_output(kind: AddressKind, txid: &Hash, n: u32) -> Self {
        let mut preimage = Vec::with_capacity(crate::hash::HASH_LENGTH + 4);
        preimage.extend_from_slice(txid.as_ref());
        preimage.extend_from_slice(&n.to_le_bytes());
        Self {
            kind,
            data: hash160(&preimage),
        }
    }

    /// Extract the owner of a standard output script. Only pay-to-pubkey and
    /// pay-to-pubkey-hash scripts resolve to a concrete address; anything
    /// else yields an [`AddressKind::Unknown`] address.
    pub fn from_script(script: &Script) -> Self {
        if let Some(data) = script.match_p2pkh() {
            return Self::new(AddressKind::PubKeyHash, data);
        }
        if let Some(pubkey) = script.match_p2pk() {
            return Self::new(AddressKind::PubKeyHash, hash160(pubkey));
        }
        Self::default()
    }

    /// The flat ABI form passed to contract code: 4-byte little-endian
    /// version followed by the payload.
    pub fn to_abi(&self) -> [u8; ADDRESS_ABI_LEN] {
        let mut abi = [0u8; ADDRESS_ABI_LEN];
        abi[..4].copy_from_slice(&(self.kind.to_byte() as u32).to_le_bytes());
        abi[4..].copy_from_slice(&self.data);
        abi
    }

    /// Parse the flat ABI form
    pub fn from_abi(abi: &[u8]) -> Result<Self> {
        if abi.len() != ADDRESS_ABI_LEN {
            return Err(Error::WrongDataLength(abi.len()));
        }
        let raw = u32::from_le_bytes(abi[..4].try_into().expect("4 bytes"));
        let kind = AddressKind::from_raw(raw)?;
        Self::from_slice(kind, &abi[4..])
    }

    /// Whether this address kind keeps an AAL shadow record
    pub fn has_aal(&self) -> bool {
        matches!(self.kind, AddressKind::Evm | AddressKind::X86)
    }

    /// Whether this address names a contract account
    pub fn is_contract(&self) -> bool {
        self.has_aal()
    }

    /// Whether this is the null (unknown, all-zero) address
    pub fn is_null(&self) -> bool {
        self.kind == AddressKind::Unknown
    }
}

impl Display for UniversalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.kind.to_byte(),
            HEXLOWER.encode(&self.data)
        )
    }
}
