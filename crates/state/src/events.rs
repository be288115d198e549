//! The event index: buffers contract execution results while a block is
//! being validated and, once the block is accepted, persists them under
//! height- and result-indexed keys for later range queries.
//!
//! Results are stored as JSON for schema compatibility with existing
//! consumers. A structured binary format would be cheaper; switching is a
//! follow-up that needs a migration.

use std::collections::{BTreeMap, HashSet};

use caldera_core::address::UniversalAddress;
use caldera_core::contract::ContractStatus;
use caldera_core::hash::Hash;
use caldera_core::transaction::{OutPoint, Transaction};
use caldera_storage::{DbWriteBatch, DB};
use data_encoding::HEXLOWER;
use serde_json::json;

use crate::keys;
use crate::write_log::DeltaCheckpoint;
use crate::Result;

/// The full outcome of one contract execution, including its nested calls.
#[derive(Clone, Debug, Default)]
pub struct ContractExecutionResult {
    /// The block the execution happened in
    pub block_hash: Hash,
    /// The height of that block
    pub block_height: u32,
    /// The output that triggered the execution
    pub tx: OutPoint,
    /// Gas consumed
    pub used_gas: u64,
    /// Unused gas refunded to the sender, in base units
    pub refund_sender: u64,
    /// The outcome status
    pub status: ContractStatus,
    /// The condensing transaction produced by the execution, if any
    pub transfer_tx: Transaction,
    /// Whether the execution's state changes were kept
    pub commit_state: bool,
    /// The state modifications of the execution
    pub modified_data: DeltaCheckpoint,
    /// Events emitted by the contract
    pub events: BTreeMap<String, String>,
    /// Results of nested calls, mirroring the call tree
    pub call_results: Vec<ContractExecutionResult>,
    /// The executed contract
    pub address: UniversalAddress,
}

impl ContractExecutionResult {
    /// Render the result as the JSON blob persisted by the event index
    pub fn to_json(&self) -> serde_json::Value {
        let events: serde_json::Map<String, serde_json::Value> = self
            .events
            .iter()
            .map(|(key, value)| (key.clone(), json!(value)))
            .collect();
        let calls: Vec<serde_json::Value> =
            self.call_results.iter().map(Self::to_json).collect();
        json!({
            "block-hash": self.block_hash.to_string(),
            "block-height": self.block_height,
            "tx-hash": self.tx.txid.to_string(),
            "tx-n": self.tx.n,
            "used-gas": self.used_gas,
            "sender-refund": self.refund_sender,
            "status": self.status.message(),
            "status-code": self.status.code(),
            "transfer-txid": self.transfer_tx.txid().to_string(),
            "commit-state": self.commit_state,
            "modified-state": checkpoint_to_json(&self.modified_data),
            "events": events,
            "calls": calls,
        })
    }
}

fn printable_ascii(bytes: &[u8]) -> Option<&str> {
    bytes
        .iter()
        .all(|byte| (32..127).contains(byte))
        .then(|| std::str::from_utf8(bytes).expect("ASCII is UTF-8"))
}

/// Render a checkpoint for inclusion in a result blob. Keys and values that
/// are printable ASCII are shown as text, everything else as hex; the
/// `deltas-raw` map is always hex.
fn checkpoint_to_json(checkpoint: &DeltaCheckpoint) -> serde_json::Value {
    let mut deltas = serde_json::Map::new();
    let mut deltas_raw = serde_json::Map::new();
    for (key, value) in &checkpoint.deltas {
        deltas_raw
            .insert(HEXLOWER.encode(key), json!(HEXLOWER.encode(value)));
        let readable_key = printable_ascii(key)
            .map(str::to_owned)
            .unwrap_or_else(|| HEXLOWER.encode(key));
        let readable_value = printable_ascii(value)
            .map(str::to_owned)
            .unwrap_or_else(|| HEXLOWER.encode(value));
        deltas.insert(readable_key, json!(readable_value));
    }
    let balances: serde_json::Map<String, serde_json::Value> = checkpoint
        .balances
        .iter()
        .map(|(address, balance)| (address.to_string(), json!(balance)))
        .collect();
    let vins: Vec<String> = checkpoint
        .spent_vins
        .iter()
        .map(ToString::to_string)
        .collect();
    json!({
        "deltas": deltas,
        "deltas-raw": deltas_raw,
        "modified-balances": balances,
        "spent-vins": vins,
    })
}

/// Buffers execution results during block validation and persists them on
/// commit. Owns its store, which is separate from the contract-state store.
#[derive(Debug)]
pub struct EventIndex<D>
where
    D: DB,
{
    db: D,
    results: Vec<ContractExecutionResult>,
}

impl<D> EventIndex<D>
where
    D: DB,
{
    /// An index over the given store with an empty buffer
    pub fn new(db: D) -> Self {
        Self {
            db,
            results: Vec::new(),
        }
    }

    /// The backing store
    pub fn db(&self) -> &D {
        &self.db
    }

    /// The number of buffered results
    pub fn pending(&self) -> usize {
        self.results.len()
    }

    /// Buffer a result; called after each contract execution in the block
    pub fn add_result(&mut self, result: ContractExecutionResult) {
        self.results.push(result);
    }

    /// Drop all buffered results; called on block-validation failure
    pub fn revert(&mut self) {
        self.results.clear();
    }

    /// Persist the buffered results as belonging to the block at `height`,
    /// in one atomic batch: a result record per execution, plus one
    /// height-index record per touched address listing the outpoints that
    /// touched it. Touched means the transitive closure over each result's
    /// call tree. Clears the buffer on success.
    pub fn commit(&mut self, height: u32) -> Result<()> {
        let mut batch = D::batch();
        for (address, outs) in self.address_map() {
            let mut value = Vec::with_capacity(outs.len() * (32 + 1));
            for out in outs {
                value.extend_from_slice(out.txid.as_ref());
                value.push(out.n as u8);
            }
            batch.put(keys::height_key(height, &address), value);
        }
        for result in &self.results {
            batch.put(
                keys::result_key(height, Some(&result.tx)),
                result.to_json().to_string(),
            );
        }
        self.db.exec_batch(batch, false)?;
        self.results.clear();
        Ok(())
    }

    /// Map every touched address to the outpoints of the buffered results
    /// touching it
    fn address_map(&self) -> BTreeMap<UniversalAddress, Vec<OutPoint>> {
        let mut map: BTreeMap<UniversalAddress, Vec<OutPoint>> =
            BTreeMap::new();
        for result in &self.results {
            let mut touches = HashSet::new();
            collect_touches(result, &mut touches);
            for address in touches {
                map.entry(address).or_default().push(result.tx);
            }
        }
        map
    }

    /// The stored result blobs for blocks in `min_height..=max_height`, in
    /// ascending height order, at most `max_results` of them.
    ///
    /// Results are not filtered by address; the per-address height index is
    /// written but not yet consulted here.
    pub fn results(
        &self,
        min_height: u32,
        max_height: u32,
        max_results: usize,
    ) -> Vec<String> {
        let start = keys::result_key(min_height, None);
        let end = max_height
            .checked_add(1)
            .map(|bound| keys::result_key(bound, None));
        let mut found = Vec::new();
        for (key, value) in self.db.iter_from(&start) {
            if !key.starts_with(keys::RESULT_PREFIX) {
                break;
            }
            if let Some(end) = &end {
                if &key >= end {
                    break;
                }
            }
            found.push(String::from_utf8_lossy(&value).into_owned());
            if found.len() >= max_results {
                break;
            }
        }
        found
    }

    /// Like [`results`](Self::results) but in descending height order:
    /// the `max_results` newest results in the range, newest first.
    pub fn results_desc(
        &self,
        min_height: u32,
        max_height: u32,
        max_results: usize,
    ) -> Vec<String> {
        let mut found = self.results(min_height, max_height, usize::MAX);
        found.reverse();
        found.truncate(max_results);
        found
    }

    /// Delete every record of the block at `height`, both result and
    /// height-index entries; used when disconnecting a block.
    pub fn erase_block(&mut self, height: u32) -> Result<()> {
        let mut batch = D::batch();
        for prefix in
            [keys::height_prefix(height), keys::result_key(height, None)]
        {
            for (key, _) in self.db.iter_from(&prefix) {
                if !key.starts_with(&prefix) {
                    break;
                }
                batch.delete(key);
            }
        }
        self.db.exec_batch(batch, false)?;
        Ok(())
    }
}

fn collect_touches(
    result: &ContractExecutionResult,
    touches: &mut HashSet<UniversalAddress>,
) {
    touches.insert(result.address);
    for sub in &result.call_results {
        collect_touches(sub, touches);
    }
}

#[cfg(test)]
mod tests {
    use caldera_core::address::AddressKind;
    use caldera_storage::mockdb::MockDb;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::tests::{addr, outpoint};

    fn result_at(
        out: OutPoint,
        address: UniversalAddress,
        height: u32,
    ) -> ContractExecutionResult {
        ContractExecutionResult {
            block_hash: Hash::sha256(b"block"),
            block_height: height,
            tx: out,
            used_gas: 21_000,
            status: ContractStatus::Success,
            commit_state: true,
            address,
            ..Default::default()
        }
    }

    #[test]
    fn test_commit_writes_both_indexes() {
        let a = addr(AddressKind::X86, 1);
        let out = outpoint(0x11, 0);
        let mut index = EventIndex::new(MockDb::default());
        index.add_result(result_at(out, a, 5));
        index.commit(5).expect("commit failed");
        assert_eq!(index.pending(), 0);

        let result_value = index
            .db()
            .read(&keys::result_key(5, Some(&out)))
            .unwrap()
            .expect("result record missing");
        let parsed: serde_json::Value =
            serde_json::from_slice(&result_value).expect("invalid JSON");
        assert_eq!(parsed["block-height"], 5);
        assert_eq!(parsed["status-code"], 0);

        let height_value = index
            .db()
            .read(&keys::height_key(5, &a))
            .unwrap()
            .expect("height record missing");
        // one outpoint: txid plus single-byte vout
        assert_eq!(height_value.len(), 33);
        assert_eq!(&height_value[..32], out.txid.as_ref());
        assert_eq!(height_value[32], 0);
    }

    #[test]
    fn test_touches_cover_call_tree() {
        let root = addr(AddressKind::X86, 1);
        let nested = addr(AddressKind::Evm, 2);
        let deep = addr(AddressKind::Evm, 3);
        let out = outpoint(0x11, 0);

        let mut result = result_at(out, root, 9);
        let mut sub = result_at(out, nested, 9);
        sub.call_results.push(result_at(out, deep, 9));
        result.call_results.push(sub);

        let mut index = EventIndex::new(MockDb::default());
        index.add_result(result);
        index.commit(9).expect("commit failed");

        for address in [root, nested, deep] {
            assert!(
                index
                    .db()
                    .read(&keys::height_key(9, &address))
                    .unwrap()
                    .is_some(),
                "missing height index for {address}"
            );
        }
    }

    #[test]
    fn test_revert_clears_buffer() {
        let mut index = EventIndex::new(MockDb::default());
        index.add_result(result_at(
            outpoint(0x11, 0),
            addr(AddressKind::X86, 1),
            5,
        ));
        index.revert();
        index.commit(5).expect("commit failed");
        assert!(index.db().is_empty());
    }

    #[test]
    fn test_range_query_bounds_and_cap() {
        let a = addr(AddressKind::X86, 1);
        let mut index = EventIndex::new(MockDb::default());
        for height in 1..=5u32 {
            index.add_result(result_at(outpoint(height as u8, 0), a, height));
            index.commit(height).expect("commit failed");
        }

        let all = index.results(1, 5, 100);
        assert_eq!(all.len(), 5);
        let mid = index.results(2, 4, 100);
        assert_eq!(mid.len(), 3);
        let parsed: serde_json::Value =
            serde_json::from_str(&mid[0]).expect("invalid JSON");
        assert_eq!(parsed["block-height"], 2);
        let capped = index.results(1, 5, 2);
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn test_descending_results() {
        let a = addr(AddressKind::X86, 1);
        let mut index = EventIndex::new(MockDb::default());
        for height in 1..=4u32 {
            index.add_result(result_at(outpoint(height as u8, 0), a, height));
            index.commit(height).expect("commit failed");
        }
        let newest = index.results_desc(1, 4, 2);
        assert_eq!(newest.len(), 2);
        let parsed: serde_json::Value =
            serde_json::from_str(&newest[0]).expect("invalid JSON");
        assert_eq!(parsed["block-height"], 4);
    }

    #[test]
    fn test_erase_block_removes_only_that_height() {
        let a = addr(AddressKind::X86, 1);
        let mut index = EventIndex::new(MockDb::default());
        for height in [7u32, 8] {
            index.add_result(result_at(outpoint(height as u8, 0), a, height));
            index.commit(height).expect("commit failed");
        }

        index.erase_block(7).expect("erase failed");
        assert!(index.results(7, 7, 10).is_empty());
        assert_eq!(index.results(8, 8, 10).len(), 1);
        assert!(index.db().read(&keys::height_key(7, &a)).unwrap().is_none());
        assert!(index.db().read(&keys::height_key(8, &a)).unwrap().is_some());
    }

    #[test]
    fn test_json_shape() {
        let a = addr(AddressKind::X86, 1);
        let mut result = result_at(outpoint(0x11, 3), a, 12);
        result
            .events
            .insert("Transfer".to_string(), "ok".to_string());
        result
            .modified_data
            .deltas
            .insert(b"plain".to_vec(), vec![0xff, 0x00]);
        result.call_results.push(result_at(outpoint(0x22, 0), a, 12));

        let value = result.to_json();
        assert_eq!(value["tx-n"], 3);
        assert_eq!(value["events"]["Transfer"], "ok");
        assert_eq!(value["calls"].as_array().unwrap().len(), 1);
        // a printable key stays text, the binary value turns hex
        assert_eq!(value["modified-state"]["deltas"]["plain"], "ff00");
        assert_eq!(
            value["modified-state"]["deltas-raw"]["706c61696e"],
            "ff00"
        );
    }
}
