//! Fixed-width hashes and the digest helpers used across the chain.

use std::fmt::{self, Display};
use std::str::FromStr;

use borsh::{BorshDeserialize, BorshSerialize};
use data_encoding::HEXLOWER;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// The length of a transaction or block hash in bytes
pub const HASH_LENGTH: usize = 32;

/// The length of a RIPEMD-160 digest in bytes
pub const HASH160_LENGTH: usize = 20;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Unexpected hash length, expected {HASH_LENGTH}, got {0}")]
    WrongLength(usize),
    #[error("Failed to decode hex string: {0}")]
    FromHex(data_encoding::DecodeError),
}

/// Result for functions that may fail
pub type Result<T> = std::result::Result<T, Error>;

/// A SHA-256 family hash, used for txids and block hashes.
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshSerialize,
    BorshDeserialize,
)]
pub struct Hash(pub [u8; HASH_LENGTH]);

impl Hash {
    /// The all-zero hash
    pub const ZERO: Hash = Hash([0; HASH_LENGTH]);

    /// Hash the given data with a single round of SHA-256
    pub fn sha256(data: impl AsRef<[u8]>) -> Self {
        let digest = Sha256::digest(data.as_ref());
        Self(digest.into())
    }

    /// Hash the given data with two rounds of SHA-256, the txid digest
    pub fn sha256d(data: impl AsRef<[u8]>) -> Self {
        Self::sha256(Sha256::digest(data.as_ref()))
    }

    /// Whether this is the all-zero hash
    pub fn is_zero(&self) -> bool {
        self == &Self::ZERO
    }

    /// The raw bytes
    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; HASH_LENGTH]> for Hash {
    fn from(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Hash {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self> {
        let bytes: [u8; HASH_LENGTH] =
            value.try_into().map_err(|_| Error::WrongLength(value.len()))?;
        Ok(Self(bytes))
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", HEXLOWER.encode(&self.0))
    }
}

impl FromStr for Hash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = HEXLOWER
            .decode(s.to_lowercase().as_bytes())
            .map_err(Error::FromHex)?;
        Self::try_from(bytes.as_slice())
    }
}

/// RIPEMD-160 of SHA-256, the digest behind pay-to-pubkey-hash addresses and
/// `CREATE` contract addresses.
pub fn hash160(data: impl AsRef<[u8]>) -> [u8; HASH160_LENGTH] {
    let sha = Sha256::digest(data.as_ref());
    Ripemd160::digest(sha).into()
}
