//! The condensing transaction: the block-final transaction that consumes
//! every shadow UTXO spent during contract execution and re-materializes
//! each touched account's balance into a fresh output.
//!
//! Input and output order, tie-breaks and output scripts here are consensus
//! critical: every node must produce the byte-identical transaction from
//! the same journal contents.

use caldera_core::address::AddressKind;
use caldera_core::contract::VmVersion;
use caldera_core::script::Script;
use caldera_core::transaction::{Transaction, TxIn, TxOut};
use caldera_storage::DB;

use crate::{ContractState, Result};

/// The consensus cap on condensing-transaction outputs
pub const MAX_CONTRACT_VOUTS: usize = 1000;

impl<D> ContractState<D>
where
    D: DB,
{
    /// Build the condensing transaction for the journal's final state and
    /// rewrite the AAL shadow records to point at its outputs.
    ///
    /// Inputs are the spent shadow UTXOs in ascending `(txid, n)` order;
    /// outputs are the touched balances in ascending `(version, data)`
    /// address order, skipping zero balances (whose shadow records are
    /// removed instead). Guard failures return the empty transaction: an
    /// address kind that cannot own a UTXO, more than
    /// [`MAX_CONTRACT_VOUTS`] outputs, or inputs without outputs (and vice
    /// versa).
    pub fn create_condensing_tx(&mut self) -> Result<Transaction> {
        self.condense_all();
        let checkpoint = self.modified_state();
        if checkpoint.spent_vins.is_empty() {
            return Ok(Transaction::default());
        }

        let mut tx = Transaction::default();
        // BTreeSet iteration already yields ascending (txid, n)
        for out in &checkpoint.spent_vins {
            tx.vins.push(TxIn::new(*out, Script::aal_spend()));
        }

        // BTreeMap iteration already yields ascending (version, data)
        for (address, balance) in &checkpoint.balances {
            if *balance == 0 {
                // no need for zero-coin outputs
                continue;
            }
            let script = match address.kind {
                AddressKind::PubKeyHash => Script::p2pkh(&address.data),
                AddressKind::ScriptHash => Script::p2sh(&address.data),
                AddressKind::Evm | AddressKind::X86 => {
                    Script::contract_no_exec(VmVersion::no_exec_v2(), address)
                }
                kind => {
                    tracing::warn!(
                        ?kind,
                        %address,
                        "Condensing transaction target cannot own a UTXO"
                    );
                    return Ok(Transaction::default());
                }
            };
            tx.vouts.push(TxOut::new(*balance, script));
            if tx.vouts.len() > MAX_CONTRACT_VOUTS {
                tracing::warn!(
                    vouts = tx.vouts.len(),
                    "Condensing transaction exceeded the output cap"
                );
                return Ok(Transaction::default());
            }
        }

        if tx.vins.is_empty() && !tx.vouts.is_empty() {
            tracing::warn!("Condensing transaction has outputs but no inputs");
            return Ok(Transaction::default());
        }
        if tx.vouts.is_empty() && !tx.vins.is_empty() {
            tracing::warn!("Condensing transaction has inputs but no outputs");
            return Ok(Transaction::default());
        }

        // point every touched account's shadow record at the new outputs,
        // numbering in lockstep with the zero-skipping above
        let txid = tx.txid();
        let mut n = 0u32;
        for (address, balance) in &checkpoint.balances {
            if *balance == 0 {
                self.remove_aal(address);
                continue;
            }
            self.write_aal(address, &txid, n, *balance);
            n += 1;
        }

        Ok(tx)
    }
}
