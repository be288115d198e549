//! Construction of every key and fixed-width value layout persisted by the
//! contract state and event databases.
//!
//! All layouts here are consensus critical and must match byte-for-byte
//! across implementations. Numeric fields are little-endian fixed-width,
//! with one exception: event-index block heights are big-endian so that
//! bytewise iteration visits them in numeric order.

use caldera_core::address::UniversalAddress;
use caldera_core::hash::{Hash, HASH_LENGTH};
use caldera_core::transaction::OutPoint;
use sha2::{Digest, Sha256};

/// Prefix of every contract-state table key
pub const STATE_PREFIX: &[u8] = b"state_";
/// Prefix of event height-index keys
pub const HEIGHT_PREFIX: &[u8] = b"h_";
/// Prefix of event result-index keys
pub const RESULT_PREFIX: &[u8] = b"r_";

/// Suffix tag of contract bytecode entries
const STATE_BYTECODE: u8 = b'c';
/// Suffix tag of contract state entries
const STATE_KEY: u8 = b'_';
/// Suffix tag of AAL shadow records
const STATE_AAL: u8 = b'a';

/// Contract state keys longer than this are stored by their SHA-256 instead
const STATE_KEY_INLINE_MAX: usize = 31;

/// The fixed width of an encoded AAL shadow record value
pub const AAL_VALUE_LEN: usize = HASH_LENGTH + 4 + 8;

fn state_table(address: &UniversalAddress, tag: u8) -> Vec<u8> {
    let mut key =
        Vec::with_capacity(STATE_PREFIX.len() + 1 + address.data.len() + 1);
    key.extend_from_slice(STATE_PREFIX);
    key.push(address.kind.to_byte());
    key.extend_from_slice(&address.data);
    key.push(tag);
    key
}

/// The key of a contract's bytecode: `"state_" ‖ version ‖ addr ‖ 'c'`
pub fn bytecode_key(address: &UniversalAddress) -> Vec<u8> {
    state_table(address, STATE_BYTECODE)
}

/// The key of a contract's AAL shadow record:
/// `"state_" ‖ version ‖ addr ‖ 'a'`
pub fn aal_key(address: &UniversalAddress) -> Vec<u8> {
    state_table(address, STATE_AAL)
}

/// The key of a live contract state entry:
/// `"state_" ‖ version ‖ addr ‖ '_' ‖ tail`, where the tail is
/// `'_' ‖ key` for keys of at most 31 bytes and `sha256(key)` otherwise.
pub fn state_key(address: &UniversalAddress, key: &[u8]) -> Vec<u8> {
    let mut out = state_table(address, STATE_KEY);
    if key.len() > STATE_KEY_INLINE_MAX {
        out.extend_from_slice(&Sha256::digest(key));
    } else {
        out.push(b'_');
        out.extend_from_slice(key);
    }
    out
}

fn changelog_table(address: &UniversalAddress, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + address.data.len() + 1 + key.len());
    out.push(address.kind.to_byte());
    out.extend_from_slice(&address.data);
    out.push(b'_');
    out.extend_from_slice(key);
    out
}

/// The key of an updated-key marker: `version ‖ addr ‖ '_' ‖ key`.
///
/// Note that [`raw_key`] and [`oldest_iterator_key`] share this exact
/// layout; the three namespaces coincide on disk and the layout cannot be
/// changed without a consensus break.
pub fn updated_key(address: &UniversalAddress, key: &[u8]) -> Vec<u8> {
    changelog_table(address, key)
}

/// The key of a raw (unhashed) contract key record
pub fn raw_key(address: &UniversalAddress, key: &[u8]) -> Vec<u8> {
    changelog_table(address, key)
}

/// The key of the oldest-iterator record of a contract key
pub fn oldest_iterator_key(address: &UniversalAddress, key: &[u8]) -> Vec<u8> {
    changelog_table(address, key)
}

/// The key of a contract key's current iterator:
/// `version ‖ addr ‖ '_' ‖ 'I' ‖ '_' ‖ key`
pub fn current_iterator_key(address: &UniversalAddress, key: &[u8]) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(1 + address.data.len() + 3 + key.len());
    out.push(address.kind.to_byte());
    out.extend_from_slice(&address.data);
    out.push(b'_');
    out.push(b'I');
    out.push(b'_');
    out.extend_from_slice(key);
    out
}

/// The key of a state value at an iterator point:
/// `version ‖ addr ‖ key ‖ iterator(u64 LE)`
pub fn state_at_iterator_key(
    address: &UniversalAddress,
    key: &[u8],
    iterator: u64,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + address.data.len() + key.len() + 8);
    out.push(address.kind.to_byte());
    out.extend_from_slice(&address.data);
    out.extend_from_slice(key);
    out.extend_from_slice(&iterator.to_le_bytes());
    out
}

/// The key of key-update info at an iterator point:
/// `version ‖ addr ‖ '_' ‖ key ‖ iterator(u64 LE)`
pub fn info_at_iterator_key(
    address: &UniversalAddress,
    key: &[u8],
    iterator: u64,
) -> Vec<u8> {
    let mut out = changelog_table(address, key);
    out.extend_from_slice(&iterator.to_le_bytes());
    out
}

/// The event height-index key: `"h_" ‖ height(u32 BE) ‖ version ‖ addr`
pub fn height_key(height: u32, address: &UniversalAddress) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(HEIGHT_PREFIX.len() + 4 + 1 + address.data.len());
    out.extend_from_slice(HEIGHT_PREFIX);
    out.extend_from_slice(&height.to_be_bytes());
    out.push(address.kind.to_byte());
    out.extend_from_slice(&address.data);
    out
}

/// The event result-index key: `"r_" ‖ height(u32 BE) ‖ txid ‖ vout(u8)`.
/// Without an outpoint this is the lower bound of the height's namespace.
pub fn result_key(height: u32, vout: Option<&OutPoint>) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        RESULT_PREFIX.len() + 4 + HASH_LENGTH + 1,
    );
    out.extend_from_slice(RESULT_PREFIX);
    out.extend_from_slice(&height.to_be_bytes());
    if let Some(vout) = vout {
        out.extend_from_slice(vout.txid.as_ref());
        out.push(vout.n as u8);
    }
    out
}

/// The prefix covering a single height's height-index records
pub fn height_prefix(height: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEIGHT_PREFIX.len() + 4);
    out.extend_from_slice(HEIGHT_PREFIX);
    out.extend_from_slice(&height.to_be_bytes());
    out
}

/// Encode an AAL shadow record: `txid(32B) ‖ vout(u32 LE) ‖ balance(u64 LE)`
pub fn encode_aal_value(
    txid: &Hash,
    vout: u32,
    balance: u64,
) -> [u8; AAL_VALUE_LEN] {
    let mut out = [0u8; AAL_VALUE_LEN];
    out[..HASH_LENGTH].copy_from_slice(txid.as_ref());
    out[HASH_LENGTH..HASH_LENGTH + 4].copy_from_slice(&vout.to_le_bytes());
    out[HASH_LENGTH + 4..].copy_from_slice(&balance.to_le_bytes());
    out
}

/// Decode an AAL shadow record, `None` if the length is wrong
pub fn decode_aal_value(bytes: &[u8]) -> Option<(Hash, u32, u64)> {
    if bytes.len() != AAL_VALUE_LEN {
        return None;
    }
    let txid = Hash::try_from(&bytes[..HASH_LENGTH]).ok()?;
    let vout =
        u32::from_le_bytes(bytes[HASH_LENGTH..HASH_LENGTH + 4].try_into().ok()?);
    let balance =
        u64::from_le_bytes(bytes[HASH_LENGTH + 4..].try_into().ok()?);
    Some((txid, vout, balance))
}

/// Encode an updated-key marker value: `blk_num(u32 LE) ‖ blk_hash(32B)`
pub fn encode_updated_value(blk_num: u32, blk_hash: &Hash) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + HASH_LENGTH);
    out.extend_from_slice(&blk_num.to_le_bytes());
    out.extend_from_slice(blk_hash.as_ref());
    out
}

/// Decode an updated-key marker value
pub fn decode_updated_value(bytes: &[u8]) -> Option<(u32, Hash)> {
    if bytes.len() != 4 + HASH_LENGTH {
        return None;
    }
    let blk_num = u32::from_le_bytes(bytes[..4].try_into().ok()?);
    let blk_hash = Hash::try_from(&bytes[4..]).ok()?;
    Some((blk_num, blk_hash))
}

/// Encode iterator-point info:
/// `blk_num(u32 LE) ‖ blk_hash(32B) ‖ txid(32B) ‖ vout(u32 LE)`
pub fn encode_info_value(
    blk_num: u32,
    blk_hash: &Hash,
    txid: &Hash,
    vout: u32,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 2 * HASH_LENGTH + 4);
    out.extend_from_slice(&blk_num.to_le_bytes());
    out.extend_from_slice(blk_hash.as_ref());
    out.extend_from_slice(txid.as_ref());
    out.extend_from_slice(&vout.to_le_bytes());
    out
}

/// Decode iterator-point info
pub fn decode_info_value(bytes: &[u8]) -> Option<(u32, Hash, Hash, u32)> {
    if bytes.len() != 4 + 2 * HASH_LENGTH + 4 {
        return None;
    }
    let blk_num = u32::from_le_bytes(bytes[..4].try_into().ok()?);
    let blk_hash = Hash::try_from(&bytes[4..4 + HASH_LENGTH]).ok()?;
    let txid =
        Hash::try_from(&bytes[4 + HASH_LENGTH..4 + 2 * HASH_LENGTH]).ok()?;
    let vout =
        u32::from_le_bytes(bytes[4 + 2 * HASH_LENGTH..].try_into().ok()?);
    Some((blk_num, blk_hash, txid, vout))
}

/// Encode an oldest-iterator record:
/// `iterator(u64 LE) ‖ blk_num(u32 LE) ‖ blk_hash(32B)`
pub fn encode_oldest_value(
    iterator: u64,
    blk_num: u32,
    blk_hash: &Hash,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 4 + HASH_LENGTH);
    out.extend_from_slice(&iterator.to_le_bytes());
    out.extend_from_slice(&blk_num.to_le_bytes());
    out.extend_from_slice(blk_hash.as_ref());
    out
}

/// Decode an oldest-iterator record
pub fn decode_oldest_value(bytes: &[u8]) -> Option<(u64, u32, Hash)> {
    if bytes.len() != 8 + 4 + HASH_LENGTH {
        return None;
    }
    let iterator = u64::from_le_bytes(bytes[..8].try_into().ok()?);
    let blk_num = u32::from_le_bytes(bytes[8..12].try_into().ok()?);
    let blk_hash = Hash::try_from(&bytes[12..]).ok()?;
    Some((iterator, blk_num, blk_hash))
}
