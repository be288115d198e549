//! The execution harness gluing a virtual machine to the contract state:
//! builds the read-only environment from the block being processed, seeds
//! initial coins, attaches the condensing transaction and commits state
//! when the block sticks.

use caldera_core::address::UniversalAddress;
use caldera_core::contract::{
    ContractEnvironment, ContractOutput, RootVm, ENV_BLOCK_HASHES,
};
use caldera_core::hash::Hash;
use caldera_storage::DB;

use crate::events::ContractExecutionResult;
use crate::{ContractState, Error, Result};

/// The seam both virtual machines implement. An implementation reads and
/// writes contract state through the journal only; the harness decides
/// whether the journal is ever flushed.
pub trait ContractVm {
    /// Execute one contract output against the given state, filling in the
    /// result. Execution failures are reported through
    /// `result.status`, not the error return, which is reserved for
    /// storage-level faults.
    fn execute<D: DB>(
        &mut self,
        state: &mut ContractState<D>,
        env: &ContractEnvironment,
        output: &ContractOutput,
        result: &mut ContractExecutionResult,
        commit: bool,
    ) -> Result<()>;
}

/// What the harness needs to know about the block being processed.
#[derive(Clone, Debug, Default)]
pub struct BlockContext {
    /// Height of the block under construction
    pub number: u32,
    /// Hash of the block under construction
    pub hash: Hash,
    /// Block timestamp
    pub time: u64,
    /// Compact difficulty target
    pub difficulty: u64,
    /// The block creator's address, resolved from the coinbase or
    /// coinstake output
    pub creator: UniversalAddress,
    /// Ancestor hashes, most recent first; only the first
    /// [`ENV_BLOCK_HASHES`] are exposed to contracts
    pub ancestor_hashes: Vec<Hash>,
}

/// Drives one contract output through a VM against a [`ContractState`].
#[derive(Debug)]
pub struct ContractExecutor<'a> {
    block: &'a BlockContext,
    output: ContractOutput,
    block_gas_limit: u64,
}

impl<'a> ContractExecutor<'a> {
    /// An executor for one parsed output within the given block
    pub fn new(
        block: &'a BlockContext,
        output: ContractOutput,
        block_gas_limit: u64,
    ) -> Self {
        Self {
            block,
            output,
            block_gas_limit,
        }
    }

    /// The read-only environment handed to the VM
    pub fn build_env(&self) -> ContractEnvironment {
        let block_hashes = self
            .block
            .ancestor_hashes
            .iter()
            .take(ENV_BLOCK_HASHES)
            .copied()
            .collect();
        ContractEnvironment {
            block_number: self.block.number,
            block_time: self.block.time,
            difficulty: self.block.difficulty,
            gas_limit: self.block_gas_limit,
            block_creator: self.block.creator,
            block_hashes,
        }
    }

    /// Run the output through `vm`. For x86-rooted executions the value
    /// carried by the triggering output becomes the contract's initial
    /// coins and the condensing transaction is attached to the result.
    /// With `commit` set and the result asking for it, the journal is
    /// flushed to the store.
    pub fn execute<D, V>(
        &self,
        state: &mut ContractState<D>,
        vm: &mut V,
        commit: bool,
    ) -> Result<ContractExecutionResult>
    where
        D: DB,
        V: ContractVm,
    {
        let env = self.build_env();
        let mut result = ContractExecutionResult {
            block_hash: self.block.hash,
            block_height: self.block.number,
            tx: self.output.vout,
            address: self.output.address,
            ..Default::default()
        };
        match self.output.version.root_vm() {
            Some(RootVm::Evm) => {
                vm.execute(state, &env, &self.output, &mut result, commit)?;
            }
            Some(RootVm::X86) => {
                state.set_initial_coins(
                    self.output.address,
                    self.output.vout,
                    self.output.value,
                )?;
                vm.execute(state, &env, &self.output, &mut result, commit)?;
                result.transfer_tx = state.create_condensing_tx()?;
            }
            _ => return Err(Error::UnsupportedVm(self.output.version)),
        }
        if commit && result.commit_state {
            state.commit()?;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use caldera_core::address::AddressKind;
    use caldera_core::contract::{ContractStatus, VmVersion};
    use caldera_core::transaction::OutPoint;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::keys;
    use crate::tests::{addr, outpoint, seeded_state};

    /// A scripted VM: stores its bytecode, sends a fixed payment and
    /// reports the given status.
    struct FakeVm {
        pay_to: Option<(UniversalAddress, u64)>,
        status: ContractStatus,
    }

    impl ContractVm for FakeVm {
        fn execute<D: DB>(
            &mut self,
            state: &mut ContractState<D>,
            env: &ContractEnvironment,
            output: &ContractOutput,
            result: &mut ContractExecutionResult,
            _commit: bool,
        ) -> Result<()> {
            assert!(env.block_hashes.len() <= ENV_BLOCK_HASHES);
            state.write_bytecode(&output.address, output.data.clone());
            if let Some((to, value)) = self.pay_to {
                state.transfer(output.address, to, value)?;
            }
            result.status = self.status;
            result.used_gas = 5_000;
            result.commit_state = !self.status.is_error();
            result.modified_data = state.modified_state();
            Ok(())
        }
    }

    fn x86_output(
        address: UniversalAddress,
        vout: OutPoint,
        value: u64,
    ) -> ContractOutput {
        ContractOutput {
            version: VmVersion {
                root_vm: RootVm::X86 as u8,
                ..Default::default()
            },
            value,
            gas_price: 1,
            gas_limit: 100_000,
            address,
            data: b"\xfa\xce".to_vec(),
            vout,
            op_create: true,
            ..Default::default()
        }
    }

    fn block() -> BlockContext {
        BlockContext {
            number: 10,
            hash: Hash::sha256(b"tip"),
            time: 1_700_000_000,
            difficulty: 0x1d00ffff,
            creator: addr(AddressKind::PubKeyHash, 0xcc),
            ancestor_hashes: (0..300u32)
                .map(|i| Hash::sha256(i.to_le_bytes()))
                .collect(),
        }
    }

    #[test]
    fn test_env_caps_block_hashes() {
        let block = block();
        let executor = ContractExecutor::new(
            &block,
            x86_output(addr(AddressKind::X86, 1), outpoint(0x11, 0), 0),
            40_000_000,
        );
        let env = executor.build_env();
        assert_eq!(env.block_hashes.len(), ENV_BLOCK_HASHES);
        assert_eq!(env.block_hashes[0], block.ancestor_hashes[0]);
        assert_eq!(env.block_number, 10);
        assert_eq!(env.gas_limit, 40_000_000);
        assert_eq!(env.block_creator, block.creator);
    }

    #[test]
    fn test_x86_execution_attaches_condensing_tx() {
        let contract = addr(AddressKind::X86, 1);
        let recipient = addr(AddressKind::PubKeyHash, 2);
        let origin = outpoint(0x11, 0);
        let mut state = seeded_state(&[]);
        let block = block();

        let executor =
            ContractExecutor::new(&block, x86_output(contract, origin, 100), 40_000_000);
        let mut vm = FakeVm {
            pay_to: Some((recipient, 30)),
            status: ContractStatus::Success,
        };
        let result =
            executor.execute(&mut state, &mut vm, true).expect("execution failed");

        assert_eq!(result.status, ContractStatus::Success);
        assert!(result.commit_state);
        // initial coins split into contract change and the payment
        let transfer = &result.transfer_tx;
        assert_eq!(transfer.vins.len(), 1);
        assert_eq!(transfer.vins[0].prevout, origin);
        assert_eq!(transfer.vouts.len(), 2);
        assert_eq!(transfer.vouts[0].value, 30);
        assert_eq!(transfer.vouts[1].value, 70);

        // committed: bytecode and the rewritten shadow record are on disk
        assert_eq!(
            state.db().read(&keys::bytecode_key(&contract)).unwrap(),
            Some(b"\xfa\xce".to_vec())
        );
        let record = state
            .db()
            .read(&keys::aal_key(&contract))
            .unwrap()
            .expect("shadow record missing");
        let (txid, vout, balance) =
            keys::decode_aal_value(&record).expect("malformed record");
        assert_eq!((txid, vout, balance), (transfer.txid(), 1, 70));
    }

    #[test]
    fn test_failed_execution_does_not_commit() {
        let contract = addr(AddressKind::X86, 1);
        let mut state = seeded_state(&[]);
        let block = block();

        let executor = ContractExecutor::new(
            &block,
            x86_output(contract, outpoint(0x11, 0), 100),
            40_000_000,
        );
        let mut vm = FakeVm {
            pay_to: None,
            status: ContractStatus::OutOfGas,
        };
        let result =
            executor.execute(&mut state, &mut vm, true).expect("execution failed");

        assert!(result.status.is_error());
        assert!(!result.commit_state);
        // nothing reached the store
        assert!(state.db().is_empty());
    }

    #[test]
    fn test_unknown_root_vm_is_rejected() {
        let mut output =
            x86_output(addr(AddressKind::X86, 1), outpoint(0x11, 0), 0);
        output.version.root_vm = 0x3f;
        let block = block();
        let executor = ContractExecutor::new(&block, output, 40_000_000);
        let mut state = seeded_state(&[]);
        let mut vm = FakeVm {
            pay_to: None,
            status: ContractStatus::Success,
        };
        assert!(matches!(
            executor.execute(&mut state, &mut vm, false),
            Err(Error::UnsupportedVm(_))
        ));
    }
}
