//! Contract outputs and the machinery that turns a transaction output's
//! push-stack into an executable [`ContractOutput`].

use borsh::{BorshDeserialize, BorshSerialize};
use thiserror::Error;

use crate::address::{AddressKind, UniversalAddress};
use crate::hash::Hash;
use crate::script::{self, Opcode};
use crate::transaction::{OutPoint, Transaction, TxOut};

/// The number of ancestor block hashes exposed to contracts
pub const ENV_BLOCK_HASHES: usize = 256;

#[allow(missing_docs)]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("Output index {0} does not exist in the transaction")]
    NoSuchOutput(u32),
    #[error("Output script has no push stack")]
    EmptyStack,
    #[error("Push stack too small for {0:?}")]
    StackTooSmall(Opcode),
    #[error("Output script does not end in a contract opcode")]
    NotAContractOutput,
    #[error("Contract data must not be empty")]
    EmptyData,
    #[error("Gas parameter exceeds the signed 64-bit range")]
    GasOutOfRange,
    #[error("Gas price and limit multiply past the signed 64-bit range")]
    GasOverflow,
    #[error("VM version encoding is {0} bytes, the maximum is 4")]
    VersionTooLong(usize),
    #[error("Root VM {0} does not map to a contract address kind")]
    UnsupportedRootVm(u8),
    #[error("Script error: {0}")]
    Script(#[from] script::Error),
}

/// Result for functions that may fail
pub type Result<T> = std::result::Result<T, Error>;

/// The root virtual machine selector inside a [`VmVersion`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RootVm {
    /// No execution; coins only
    Null = 0,
    /// The EVM-like machine
    Evm = 1,
    /// The x86-like machine
    X86 = 2,
}

/// The 32-bit VM version tag carried by every contract output.
///
/// Bit layout of the raw little-endian word: 2 bits of format, 6 bits of
/// root-VM selector, 8 bits of VM version, 16 bits of flags.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    BorshSerialize,
    BorshDeserialize,
)]
pub struct VmVersion {
    /// Encoding format of this tag itself
    pub format: u8,
    /// Which VM executes the output
    pub root_vm: u8,
    /// Version of that VM's semantics
    pub vm_version: u8,
    /// Feature flags
    pub flag_options: u16,
}

impl VmVersion {
    /// Decode from the raw 32-bit word
    pub fn from_raw(raw: u32) -> Self {
        Self {
            format: (raw & 0x3) as u8,
            root_vm: ((raw >> 2) & 0x3f) as u8,
            vm_version: ((raw >> 8) & 0xff) as u8,
            flag_options: (raw >> 16) as u16,
        }
    }

    /// Encode into the raw 32-bit word
    pub fn to_raw(self) -> u32 {
        (self.format as u32 & 0x3)
            | ((self.root_vm as u32 & 0x3f) << 2)
            | ((self.vm_version as u32) << 8)
            | ((self.flag_options as u32) << 16)
    }

    /// The root VM, if it is a known one
    pub fn root_vm(self) -> Option<RootVm> {
        match self.root_vm {
            0 => Some(RootVm::Null),
            1 => Some(RootVm::Evm),
            2 => Some(RootVm::X86),
            _ => None,
        }
    }

    /// The tag carried by no-exec contract outputs in condensing
    /// transactions: null root VM, AAL version 2.
    pub fn no_exec_v2() -> Self {
        Self {
            format: 0,
            root_vm: RootVm::Null as u8,
            vm_version: 2,
            flag_options: 0,
        }
    }

    /// Map the root VM to the contract address kind it owns
    pub fn contract_address_kind(self) -> Option<AddressKind> {
        match self.root_vm()? {
            RootVm::Evm => Some(AddressKind::Evm),
            RootVm::X86 => Some(AddressKind::X86),
            RootVm::Null => None,
        }
    }
}

/// The outcome of a contract execution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ContractStatus {
    /// Execution completed and state was committed
    Success,
    /// Execution ran out of gas
    OutOfGas,
    /// Unhandled exception triggered in execution
    #[default]
    CodeError,
    /// The called contract does not exist
    DoesntExist,
    /// The contract executed but returned an error code
    ReturnedError,
    /// The contract chose to commit state but returned an error code
    ErrorWithCommit,
    /// Internal error with contract execution
    InternalError,
}

impl ContractStatus {
    /// The numeric status code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success => 0,
            Self::OutOfGas => 1,
            Self::CodeError => 2,
            Self::DoesntExist => 3,
            Self::ReturnedError => 4,
            Self::ErrorWithCommit => 5,
            Self::InternalError => 6,
        }
    }

    /// The human-readable status message
    pub fn message(&self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::OutOfGas => "Out of gas",
            Self::CodeError => "Unhandled exception triggered in execution",
            Self::DoesntExist => "Contract does not exist",
            Self::ReturnedError => {
                "Contract executed successfully but returned an error code"
            }
            Self::ErrorWithCommit => {
                "Contract chose to commit state, but returned an error code"
            }
            Self::InternalError => "Internal error with contract execution",
        }
    }

    /// Whether the status is any kind of failure
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Success)
    }
}

/// A parsed contract output, the unit of work handed to a VM.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContractOutput {
    /// The VM version tag
    pub version: VmVersion,
    /// Coins sent along with the call
    pub value: u64,
    /// Gas price in base units per gas
    pub gas_price: u64,
    /// Gas limit for this execution
    pub gas_limit: u64,
    /// The contract being called, or the address a creation will occupy
    pub address: UniversalAddress,
    /// Call data or creation bytecode
    pub data: Vec<u8>,
    /// The resolved sender, unknown-kind if not resolvable
    pub sender: UniversalAddress,
    /// The output this contract call came from
    pub vout: OutPoint,
    /// Whether this output creates a contract rather than calling one
    pub op_create: bool,
}

/// Read-only execution context derived from the block being processed.
#[derive(Clone, Debug, Default)]
pub struct ContractEnvironment {
    /// Height of the block under construction
    pub block_number: u32,
    /// Timestamp of the block under construction
    pub block_time: u64,
    /// Compact difficulty target
    pub difficulty: u64,
    /// Gas limit for the whole block
    pub gas_limit: u64,
    /// The block creator's address
    pub block_creator: UniversalAddress,
    /// Hashes of up to [`ENV_BLOCK_HASHES`] ancestors; index `i` holds the
    /// hash of height `block_number - 1 - i`
    pub block_hashes: Vec<Hash>,
}

/// Access to unspent outputs, used to resolve a contract caller.
pub trait CoinsView {
    /// The output the given outpoint refers to, if unspent
    fn access_coin(&self, out: &OutPoint) -> Option<TxOut>;
}

/// Fallback full-transaction lookup, used when the prevout is neither in the
/// in-progress block nor in the coins view.
pub trait TxLookup {
    /// The transaction with the given id, if known
    fn transaction(&self, txid: &Hash) -> Option<Transaction>;
}

/// Parses one output of a transaction into a [`ContractOutput`].
pub struct ContractOutputParser<'a, C, L> {
    tx: &'a Transaction,
    nvout: u32,
    coins: Option<&'a C>,
    block_txs: Option<&'a [Transaction]>,
    lookup: Option<&'a L>,
}

impl<'a, C, L> ContractOutputParser<'a, C, L>
where
    C: CoinsView,
    L: TxLookup,
{
    /// A parser for output `nvout` of `tx`. The coins view and block
    /// transactions are optional; without both, senders resolve to the
    /// unknown address.
    pub fn new(
        tx: &'a Transaction,
        nvout: u32,
        coins: Option<&'a C>,
        block_txs: Option<&'a [Transaction]>,
        lookup: Option<&'a L>,
    ) -> Self {
        Self {
            tx,
            nvout,
            coins,
            block_txs,
            lookup,
        }
    }

    /// Parse the output into a [`ContractOutput`].
    pub fn parse_output(&self) -> Result<ContractOutput> {
        let txout = self
            .tx
            .vouts
            .get(self.nvout as usize)
            .ok_or(Error::NoSuchOutput(self.nvout))?;

        let mut output = ContractOutput {
            sender: self.sender_address(),
            value: txout.value,
            ..Default::default()
        };

        let (opcode, mut stack) = self.receive_stack(txout)?;
        let receive_address = if opcode == Opcode::Call {
            let addr = stack.pop().expect("arity checked");
            UniversalAddress::from_slice(AddressKind::Unknown, &addr)
                .map_err(|_| Error::NotAContractOutput)?
                .data
        } else {
            // the created contract lives at ripemd160(sha256(txid ‖ n))
            let txid = self.tx.txid();
            UniversalAddress::from_output(
                AddressKind::Unknown,
                &txid,
                self.nvout,
            )
            .data
        };
        output.op_create = opcode == Opcode::Create;

        if stack.len() < 4 {
            return Err(Error::StackTooSmall(opcode));
        }

        let data = stack.pop().expect("arity checked");
        if data.is_empty() {
            return Err(Error::EmptyData);
        }
        let gas_price = script::decode_num(&stack.pop().expect("arity checked"))
            .map_err(|_| Error::GasOutOfRange)?;
        let gas_limit = script::decode_num(&stack.pop().expect("arity checked"))
            .map_err(|_| Error::GasOutOfRange)?;
        if gas_price > i64::MAX as u64 || gas_limit > i64::MAX as u64 {
            return Err(Error::GasOutOfRange);
        }
        // the total fee is tracked as a signed amount elsewhere, so the
        // product must stay within i64
        if gas_price != 0 && gas_limit > (i64::MAX as u64) / gas_price {
            return Err(Error::GasOverflow);
        }
        let version_bytes = stack.pop().expect("arity checked");
        if version_bytes.len() > 4 {
            return Err(Error::VersionTooLong(version_bytes.len()));
        }
        let version = VmVersion::from_raw(
            script::decode_num(&version_bytes).expect("at most 4 bytes") as u32,
        );

        let kind = version
            .contract_address_kind()
            .ok_or(Error::UnsupportedRootVm(version.root_vm))?;
        output.version = version;
        output.gas_price = gas_price;
        output.gas_limit = gas_limit;
        output.address = UniversalAddress::new(kind, receive_address);
        output.data = data;
        output.vout = OutPoint::new(self.tx.txid(), self.nvout);
        Ok(output)
    }

    /// Evaluate the output script into a push stack, pop the trailing rest
    /// script and check the arity the contract opcode requires.
    fn receive_stack(&self, txout: &TxOut) -> Result<(Opcode, Vec<Vec<u8>>)> {
        let mut stack = txout.script_pubkey.eval_push_stack()?;
        let rest = stack.pop().ok_or(Error::EmptyStack)?;
        let opcode = rest
            .first()
            .copied()
            .and_then(Opcode::from_byte)
            .ok_or(Error::NotAContractOutput)?;
        match opcode {
            Opcode::Create if stack.len() < 4 => {
                Err(Error::StackTooSmall(opcode))
            }
            Opcode::Call if stack.len() < 5 => Err(Error::StackTooSmall(opcode)),
            Opcode::Create | Opcode::Call => Ok((opcode, stack)),
            _ => Err(Error::NotAContractOutput),
        }
    }

    /// Resolve the sender: the owner of the first input's prevout. Checks
    /// the in-progress block first for zero-confirmation spends, then the
    /// coins view, then falls back to a full transaction lookup.
    pub fn sender_address(&self) -> UniversalAddress {
        let (Some(coins), Some(block_txs)) = (self.coins, self.block_txs)
        else {
            return UniversalAddress::default();
        };
        let Some(first_vin) = self.tx.vins.first() else {
            return UniversalAddress::default();
        };
        let prevout = first_vin.prevout;

        let mut script = None;
        for btx in block_txs {
            if btx.txid() == prevout.txid {
                script = btx
                    .vouts
                    .get(prevout.n as usize)
                    .map(|out| out.script_pubkey.clone());
                break;
            }
        }
        if script.is_none() {
            script = coins.access_coin(&prevout).map(|out| out.script_pubkey);
        }
        if script.is_none() {
            match self
                .lookup
                .and_then(|lookup| lookup.transaction(&prevout.txid))
            {
                Some(prev_tx) => {
                    script = prev_tx
                        .vouts
                        .get(prevout.n as usize)
                        .map(|out| out.script_pubkey.clone());
                }
                None => {
                    tracing::error!(
                        txid = %prevout.txid,
                        "Failed to fetch prevout transaction while resolving \
                         a contract sender"
                    );
                    return UniversalAddress::default();
                }
            }
        }

        match script {
            Some(script) => UniversalAddress::from_script(&script),
            None => UniversalAddress::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ADDRESS_DATA_LEN;
    use crate::script::Script;
    use crate::transaction::TxIn;

    struct NoCoins;
    impl CoinsView for NoCoins {
        fn access_coin(&self, _out: &OutPoint) -> Option<TxOut> {
            None
        }
    }

    struct NoLookup;
    impl TxLookup for NoLookup {
        fn transaction(&self, _txid: &Hash) -> Option<Transaction> {
            None
        }
    }

    struct OneCoin(OutPoint, TxOut);
    impl CoinsView for OneCoin {
        fn access_coin(&self, out: &OutPoint) -> Option<TxOut> {
            (out == &self.0).then(|| self.1.clone())
        }
    }

    fn call_script(version: u32, gas_limit: u64, gas_price: u64) -> Script {
        let mut script = Script::new();
        script
            .push_int(version as u64)
            .push_int(gas_limit)
            .push_int(gas_price)
            .push_slice(b"calldata")
            .push_slice(&[0xaa; ADDRESS_DATA_LEN])
            .push_opcode(Opcode::Call);
        script
    }

    fn create_script(version: u32, gas_limit: u64, gas_price: u64) -> Script {
        let mut script = Script::new();
        script
            .push_int(version as u64)
            .push_int(gas_limit)
            .push_int(gas_price)
            .push_slice(b"bytecode")
            .push_opcode(Opcode::Create);
        script
    }

    fn tx_with_script(script: Script) -> Transaction {
        let mut tx = Transaction::default();
        tx.vins.push(TxIn::new(
            OutPoint::new(Hash::sha256(b"funding"), 0),
            Script::new(),
        ));
        tx.vouts.push(TxOut::new(500, script));
        tx
    }

    fn parse(tx: &Transaction) -> Result<ContractOutput> {
        ContractOutputParser::<NoCoins, NoLookup>::new(tx, 0, None, None, None)
            .parse_output()
    }

    #[test]
    fn test_vm_version_raw_roundtrip() {
        let version = VmVersion {
            format: 1,
            root_vm: 2,
            vm_version: 7,
            flag_options: 0xbeef,
        };
        assert_eq!(VmVersion::from_raw(version.to_raw()), version);
        assert_eq!(VmVersion::from_raw(0), VmVersion::default());
    }

    #[test]
    fn test_parse_call_output() {
        let evm = VmVersion {
            root_vm: RootVm::Evm as u8,
            ..Default::default()
        };
        let tx = tx_with_script(call_script(evm.to_raw(), 100_000, 40));
        let output = parse(&tx).expect("parse failed");
        assert!(!output.op_create);
        assert_eq!(output.address.kind, AddressKind::Evm);
        assert_eq!(output.address.data, [0xaa; ADDRESS_DATA_LEN]);
        assert_eq!(output.gas_limit, 100_000);
        assert_eq!(output.gas_price, 40);
        assert_eq!(output.data, b"calldata");
        assert_eq!(output.value, 500);
        assert_eq!(output.vout, OutPoint::new(tx.txid(), 0));
        // no coins view was supplied
        assert!(output.sender.is_null());
    }

    #[test]
    fn test_parse_create_derives_address() {
        let x86 = VmVersion {
            root_vm: RootVm::X86 as u8,
            ..Default::default()
        };
        let tx = tx_with_script(create_script(x86.to_raw(), 50_000, 10));
        let output = parse(&tx).expect("parse failed");
        assert!(output.op_create);
        assert_eq!(output.address.kind, AddressKind::X86);
        let expected =
            UniversalAddress::from_output(AddressKind::X86, &tx.txid(), 0);
        assert_eq!(output.address.data, expected.data);
    }

    #[test]
    fn test_parse_rejects_call_arity() {
        // a call with no target address on the stack
        let evm = VmVersion {
            root_vm: RootVm::Evm as u8,
            ..Default::default()
        };
        let mut script = Script::new();
        script
            .push_int(evm.to_raw() as u64)
            .push_int(1)
            .push_int(1)
            .push_slice(b"data")
            .push_opcode(Opcode::Call);
        let tx = tx_with_script(script);
        assert_eq!(parse(&tx), Err(Error::StackTooSmall(Opcode::Call)));
    }

    #[test]
    fn test_parse_rejects_gas_overflow() {
        let evm = VmVersion {
            root_vm: RootVm::Evm as u8,
            ..Default::default()
        };
        let tx = tx_with_script(call_script(
            evm.to_raw(),
            u64::MAX / 2,
            u64::MAX / 2,
        ));
        assert!(matches!(
            parse(&tx),
            Err(Error::GasOutOfRange | Error::GasOverflow)
        ));
    }

    #[test]
    fn test_parse_rejects_long_version() {
        let mut script = Script::new();
        script
            .push_slice(&[1, 0, 0, 0, 0]) // 5-byte version encoding
            .push_int(1)
            .push_int(1)
            .push_slice(b"data")
            .push_slice(&[0xaa; ADDRESS_DATA_LEN])
            .push_opcode(Opcode::Call);
        let tx = tx_with_script(script);
        assert_eq!(parse(&tx), Err(Error::VersionTooLong(5)));
    }

    #[test]
    fn test_parse_rejects_null_root_vm() {
        let tx = tx_with_script(call_script(
            VmVersion::no_exec_v2().to_raw(),
            1,
            1,
        ));
        assert_eq!(parse(&tx), Err(Error::UnsupportedRootVm(0)));
    }

    #[test]
    fn test_parse_rejects_empty_data() {
        let evm = VmVersion {
            root_vm: RootVm::Evm as u8,
            ..Default::default()
        };
        let mut script = Script::new();
        script
            .push_int(evm.to_raw() as u64)
            .push_int(1)
            .push_int(1)
            .push_slice(&[])
            .push_slice(&[0xaa; ADDRESS_DATA_LEN])
            .push_opcode(Opcode::Call);
        let tx = tx_with_script(script);
        assert_eq!(parse(&tx), Err(Error::EmptyData));
    }

    #[test]
    fn test_sender_resolved_from_coins_view() {
        let evm = VmVersion {
            root_vm: RootVm::Evm as u8,
            ..Default::default()
        };
        let tx = tx_with_script(call_script(evm.to_raw(), 1_000, 1));
        let prevout = tx.vins[0].prevout;
        let owner = [0x33u8; ADDRESS_DATA_LEN];
        let coins = OneCoin(prevout, TxOut::new(500, Script::p2pkh(&owner)));
        let block_txs: Vec<Transaction> = vec![];
        let parser = ContractOutputParser::<_, NoLookup>::new(
            &tx,
            0,
            Some(&coins),
            Some(&block_txs),
            None,
        );
        let output = parser.parse_output().expect("parse failed");
        assert_eq!(output.sender.kind, AddressKind::PubKeyHash);
        assert_eq!(output.sender.data, owner);
    }

    #[test]
    fn test_sender_resolved_from_block_txs() {
        let evm = VmVersion {
            root_vm: RootVm::Evm as u8,
            ..Default::default()
        };
        let owner = [0x44u8; ADDRESS_DATA_LEN];
        let mut funding = Transaction::default();
        funding.vouts.push(TxOut::new(9_000, Script::p2pkh(&owner)));

        let mut tx = Transaction::default();
        tx.vins.push(TxIn::new(
            OutPoint::new(funding.txid(), 0),
            Script::new(),
        ));
        tx.vouts
            .push(TxOut::new(500, call_script(evm.to_raw(), 1_000, 1)));

        let block_txs = vec![funding];
        let parser = ContractOutputParser::<_, NoLookup>::new(
            &tx,
            0,
            Some(&NoCoins),
            Some(&block_txs),
            None,
        );
        let output = parser.parse_output().expect("parse failed");
        assert_eq!(output.sender.kind, AddressKind::PubKeyHash);
        assert_eq!(output.sender.data, owner);
    }
}
