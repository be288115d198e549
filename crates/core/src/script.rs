//! Output scripts: the handful of opcodes the chain's consensus needs,
//! canonical builders for the condensing transaction, and the restricted
//! push-stack evaluation used to parse contract outputs.

use borsh::{BorshDeserialize, BorshSerialize};
use thiserror::Error;

use crate::address::UniversalAddress;
use crate::contract::VmVersion;
use crate::hash::HASH160_LENGTH;

#[allow(missing_docs)]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("Push data extends past the end of the script")]
    TruncatedPush,
    #[error("Script number is {0} bytes long, the maximum is 8")]
    NumberTooLong(usize),
}

/// Result for functions that may fail
pub type Result<T> = std::result::Result<T, Error>;

/// The maximum length of a direct (single-byte opcode) push
const MAX_DIRECT_PUSH: u8 = 0x4b;

/// The non-push opcodes understood by this chain's consensus scripts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Push the next byte's worth of data
    PushData1 = 0x4c,
    /// Push the next two bytes' (LE) worth of data
    PushData2 = 0x4d,
    /// Push the next four bytes' (LE) worth of data
    PushData4 = 0x4e,
    /// Duplicate the top stack item
    Dup = 0x76,
    /// Pop two items, push equality
    Equal = 0x87,
    /// Pop two items, fail unless equal
    EqualVerify = 0x88,
    /// Pop an item, push its hash160
    Hash160 = 0xa9,
    /// Signature check
    CheckSig = 0xac,
    /// Create a contract from the preceding pushes
    Create = 0xc1,
    /// Call a contract identified by the preceding pushes
    Call = 0xc2,
    /// Spend an AAL shadow UTXO inside a condensing transaction
    Spend = 0xc3,
}

impl Opcode {
    /// Parse an opcode byte; push opcodes below [`Opcode::PushData1`] are
    /// not represented here and return `None`.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x4c => Some(Self::PushData1),
            0x4d => Some(Self::PushData2),
            0x4e => Some(Self::PushData4),
            0x76 => Some(Self::Dup),
            0x87 => Some(Self::Equal),
            0x88 => Some(Self::EqualVerify),
            0xa9 => Some(Self::Hash160),
            0xac => Some(Self::CheckSig),
            0xc1 => Some(Self::Create),
            0xc2 => Some(Self::Call),
            0xc3 => Some(Self::Spend),
            _ => None,
        }
    }
}

/// A serialized output or input script.
#[derive(
    Clone,
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
pub struct Script(Vec<u8>);

impl Script {
    /// An empty script
    pub fn new() -> Self {
        Self::default()
    }

    /// A script from raw bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The raw script bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The script length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the script is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append a non-push opcode
    pub fn push_opcode(&mut self, op: Opcode) -> &mut Self {
        self.0.push(op as u8);
        self
    }

    /// Append a data push with the minimal push encoding
    pub fn push_slice(&mut self, data: &[u8]) -> &mut Self {
        match data.len() {
            len if len <= MAX_DIRECT_PUSH as usize => {
                self.0.push(len as u8);
            }
            len if len <= u8::MAX as usize => {
                self.0.push(Opcode::PushData1 as u8);
                self.0.push(len as u8);
            }
            len if len <= u16::MAX as usize => {
                self.0.push(Opcode::PushData2 as u8);
                self.0.extend_from_slice(&(len as u16).to_le_bytes());
            }
            len => {
                self.0.push(Opcode::PushData4 as u8);
                self.0.extend_from_slice(&(len as u32).to_le_bytes());
            }
        }
        self.0.extend_from_slice(data);
        self
    }

    /// Append a data push of a script number
    pub fn push_int(&mut self, value: u64) -> &mut Self {
        self.push_slice(&encode_num(value))
    }

    /// The pay-to-pubkey-hash output script:
    /// `OP_DUP OP_HASH160 <20B> OP_EQUALVERIFY OP_CHECKSIG`
    pub fn p2pkh(data: &[u8; HASH160_LENGTH]) -> Self {
        let mut script = Self::new();
        script
            .push_opcode(Opcode::Dup)
            .push_opcode(Opcode::Hash160)
            .push_slice(data)
            .push_opcode(Opcode::EqualVerify)
            .push_opcode(Opcode::CheckSig);
        script
    }

    /// The pay-to-script-hash output script: `OP_HASH160 <20B> OP_EQUAL`
    pub fn p2sh(data: &[u8; HASH160_LENGTH]) -> Self {
        let mut script = Self::new();
        script
            .push_opcode(Opcode::Hash160)
            .push_slice(data)
            .push_opcode(Opcode::Equal);
        script
    }

    /// The no-exec contract output used by condensing transactions to leave
    /// coins owned by a contract without triggering execution:
    /// `<version> <empty> <empty> <empty> <address> OP_CALL`
    pub fn contract_no_exec(version: VmVersion, address: &UniversalAddress) -> Self {
        let mut script = Self::new();
        script
            .push_int(version.to_raw() as u64)
            .push_slice(&[])
            .push_slice(&[])
            .push_slice(&[])
            .push_slice(&address.data)
            .push_opcode(Opcode::Call);
        script
    }

    /// The condensing transaction input script: `<0x02> OP_SPEND`, the push
    /// carrying the AAL version tag.
    pub fn aal_spend() -> Self {
        let mut script = Self::new();
        script.push_slice(&[2]).push_opcode(Opcode::Spend);
        script
    }

    /// Evaluate the script in restricted byte-code mode: data pushes
    /// accumulate on a stack, and the first non-push opcode stops evaluation
    /// with the remaining script (opcode included) pushed as the final item.
    ///
    /// A script made only of pushes yields just those pushes.
    pub fn eval_push_stack(&self) -> Result<Vec<Vec<u8>>> {
        let mut stack = Vec::new();
        let bytes = &self.0;
        let mut pc = 0usize;
        while pc < bytes.len() {
            let op = bytes[pc];
            let (data_len, header_len) = match op {
                len if len <= MAX_DIRECT_PUSH => (len as usize, 1),
                0x4c => {
                    let len = *bytes.get(pc + 1).ok_or(Error::TruncatedPush)?;
                    (len as usize, 2)
                }
                0x4d => {
                    let raw: [u8; 2] = bytes
                        .get(pc + 1..pc + 3)
                        .ok_or(Error::TruncatedPush)?
                        .try_into()
                        .expect("2 bytes");
                    (u16::from_le_bytes(raw) as usize, 3)
                }
                0x4e => {
                    let raw: [u8; 4] = bytes
                        .get(pc + 1..pc + 5)
                        .ok_or(Error::TruncatedPush)?
                        .try_into()
                        .expect("4 bytes");
                    (u32::from_le_bytes(raw) as usize, 5)
                }
                _ => {
                    // not a push: the rest of the script is the final item
                    stack.push(bytes[pc..].to_vec());
                    return Ok(stack);
                }
            };
            let start = pc + header_len;
            let end = start + data_len;
            if end > bytes.len() {
                return Err(Error::TruncatedPush);
            }
            stack.push(bytes[start..end].to_vec());
            pc = end;
        }
        Ok(stack)
    }

    /// Match a pay-to-pubkey-hash script and return its payload
    pub fn match_p2pkh(&self) -> Option<[u8; HASH160_LENGTH]> {
        let b = &self.0;
        if b.len() == 25
            && b[0] == Opcode::Dup as u8
            && b[1] == Opcode::Hash160 as u8
            && b[2] == HASH160_LENGTH as u8
            && b[23] == Opcode::EqualVerify as u8
            && b[24] == Opcode::CheckSig as u8
        {
            return Some(b[3..23].try_into().expect("20 bytes"));
        }
        None
    }

    /// Match a pay-to-pubkey script and return the raw public key
    pub fn match_p2pk(&self) -> Option<&[u8]> {
        let b = &self.0;
        // compressed (33B) or uncompressed (65B) key pushed directly,
        // followed by a signature check
        if b.len() >= 2
            && (b[0] == 33 || b[0] == 65)
            && b.len() == b[0] as usize + 2
            && b[b.len() - 1] == Opcode::CheckSig as u8
        {
            return Some(&b[1..b.len() - 1]);
        }
        None
    }
}

/// Encode a script number: minimal little-endian, empty for zero.
pub fn encode_num(value: u64) -> Vec<u8> {
    let mut bytes = value.to_le_bytes().to_vec();
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    bytes
}

/// Decode a script number as unsigned little-endian, at most 8 bytes.
pub fn decode_num(bytes: &[u8]) -> Result<u64> {
    if bytes.len() > 8 {
        return Err(Error::NumberTooLong(bytes.len()));
    }
    let mut value = 0u64;
    for (i, byte) in bytes.iter().enumerate() {
        value |= (*byte as u64) << (8 * i);
    }
    Ok(value)
}
