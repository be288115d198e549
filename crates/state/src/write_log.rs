//! The write log is temporary storage for modifications performed by
//! contract executions before they are committed to the backing store: a
//! stack of checkpoints, one pushed per nested call, each holding pending
//! key/value deltas, absolute balance writes and the set of shadow UTXOs
//! spent so far.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use caldera_core::address::UniversalAddress;
use caldera_core::transaction::OutPoint;

/// One checkpoint's worth of uncommitted changes.
///
/// `balances` records are absolute post-write balances, not deltas. An empty
/// `deltas` value is a tombstone: the key is pending deletion but reads must
/// still see it as present-with-empty-value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeltaCheckpoint {
    /// Pending state writes, keyed by raw store key
    pub deltas: HashMap<Vec<u8>, Vec<u8>>,
    /// Absolute balances of every address modified in this checkpoint
    pub balances: BTreeMap<UniversalAddress, u64>,
    /// Shadow UTXOs that the condensing transaction must consume
    pub spent_vins: BTreeSet<OutPoint>,
}

impl DeltaCheckpoint {
    /// Merge `other` on top of this checkpoint: newer writes and balances
    /// win, spent vins union.
    fn absorb(&mut self, other: DeltaCheckpoint) {
        self.deltas.extend(other.deltas);
        self.balances.extend(other.balances);
        self.spent_vins.extend(other.spent_vins);
    }
}

/// The checkpoint stack. Constructed with a single immortal checkpoint at
/// index 0; `revert` never pops it.
#[derive(Clone, Debug)]
pub struct WriteLog {
    checkpoints: Vec<DeltaCheckpoint>,
}

impl Default for WriteLog {
    fn default() -> Self {
        Self {
            checkpoints: vec![DeltaCheckpoint::default()],
        }
    }
}

impl WriteLog {
    /// The number of live checkpoints, always at least 1
    pub fn depth(&self) -> usize {
        self.checkpoints.len()
    }

    /// The top checkpoint
    pub fn current(&self) -> &DeltaCheckpoint {
        self.checkpoints.last().expect("checkpoint 0 is immortal")
    }

    /// The top checkpoint, mutably
    pub fn current_mut(&mut self) -> &mut DeltaCheckpoint {
        self.checkpoints
            .last_mut()
            .expect("checkpoint 0 is immortal")
    }

    /// Push a new empty checkpoint and return its stack index
    pub fn checkpoint(&mut self) -> usize {
        self.checkpoints.push(DeltaCheckpoint::default());
        self.checkpoints.len() - 1
    }

    /// Discard the top checkpoint, unless only checkpoint 0 remains, and
    /// return the new top index
    pub fn revert(&mut self) -> usize {
        if self.checkpoints.len() > 1 {
            self.checkpoints.pop();
        }
        self.checkpoints.len() - 1
    }

    /// Merge the top checkpoint into its parent and pop it. A no-op at
    /// depth 1.
    pub fn condense_single(&mut self) {
        if self.checkpoints.len() == 1 {
            return;
        }
        let top = self.checkpoints.pop().expect("depth checked");
        self.current_mut().absorb(top);
    }

    /// Condense until only checkpoint 0 remains.
    pub fn condense_all(&mut self) {
        // applied oldest-first so the newest value wins per key
        for checkpoint in self.checkpoints.split_off(1) {
            self.checkpoints[0].absorb(checkpoint);
        }
    }

    /// Reset to a single fresh checkpoint, dropping all pending changes
    pub fn reset(&mut self) {
        self.checkpoints.clear();
        self.checkpoints.push(DeltaCheckpoint::default());
    }

    /// Read a pending value. Scans checkpoints top-down; the topmost
    /// checkpoint containing the key wins. An empty slice is a pending
    /// delete, visible here as `Some(&[])`.
    pub fn read(&self, key: &[u8]) -> Option<&[u8]> {
        self.checkpoints
            .iter()
            .rev()
            .find_map(|checkpoint| checkpoint.deltas.get(key))
            .map(Vec::as_slice)
    }

    /// Write into the top checkpoint. Empty bytes are a tombstone.
    pub fn write(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.current_mut().deltas.insert(key, value);
    }

    /// The balance of the address in the topmost checkpoint that has
    /// modified it, if any
    pub fn find_balance(&self, address: &UniversalAddress) -> Option<u64> {
        self.checkpoints
            .iter()
            .rev()
            .find_map(|checkpoint| checkpoint.balances.get(address))
            .copied()
    }

    /// Record an absolute balance in the top checkpoint
    pub fn set_balance(&mut self, address: UniversalAddress, balance: u64) {
        self.current_mut().balances.insert(address, balance);
    }

    /// Mark a shadow UTXO as spent in the top checkpoint. Re-adding a
    /// present outpoint is a no-op.
    pub fn spend_vin(&mut self, out: OutPoint) {
        self.current_mut().spent_vins.insert(out);
    }
}

#[cfg(test)]
mod tests {
    use caldera_core::address::AddressKind;
    use caldera_core::hash::Hash;
    use proptest::prelude::*;

    use super::*;

    fn addr(fill: u8) -> UniversalAddress {
        UniversalAddress::new(AddressKind::Evm, [fill; 20])
    }

    fn out(fill: u8, n: u32) -> OutPoint {
        OutPoint::new(Hash([fill; 32]), n)
    }

    #[test]
    fn test_topmost_write_wins() {
        let mut log = WriteLog::default();
        log.write(b"k".to_vec(), b"v1".to_vec());
        log.checkpoint();
        log.write(b"k".to_vec(), b"v2".to_vec());
        assert_eq!(log.read(b"k"), Some(&b"v2"[..]));
        log.checkpoint();
        // untouched in the new checkpoint, still visible
        assert_eq!(log.read(b"k"), Some(&b"v2"[..]));
    }

    #[test]
    fn test_revert_restores_prior_writes() {
        let mut log = WriteLog::default();
        log.write(b"k".to_vec(), b"v1".to_vec());
        log.checkpoint();
        log.write(b"k".to_vec(), b"v2".to_vec());
        log.revert();
        assert_eq!(log.read(b"k"), Some(&b"v1"[..]));
    }

    #[test]
    fn test_checkpoint_zero_is_immortal() {
        let mut log = WriteLog::default();
        assert_eq!(log.revert(), 0);
        assert_eq!(log.depth(), 1);
        assert_eq!(log.checkpoint(), 1);
        assert_eq!(log.checkpoint(), 2);
        assert_eq!(log.revert(), 1);
        assert_eq!(log.revert(), 0);
        assert_eq!(log.revert(), 0);
    }

    #[test]
    fn test_tombstone_reads_as_empty() {
        let mut log = WriteLog::default();
        log.write(b"k".to_vec(), b"v".to_vec());
        log.checkpoint();
        log.write(b"k".to_vec(), Vec::new());
        assert_eq!(log.read(b"k"), Some(&[][..]));
    }

    #[test]
    fn test_condense_single_merges_into_parent() {
        let mut log = WriteLog::default();
        log.write(b"a".to_vec(), b"1".to_vec());
        log.set_balance(addr(1), 10);
        log.spend_vin(out(1, 0));

        log.checkpoint();
        log.write(b"a".to_vec(), b"2".to_vec());
        log.write(b"b".to_vec(), b"3".to_vec());
        log.set_balance(addr(1), 5);
        log.set_balance(addr(2), 7);
        log.spend_vin(out(2, 0));

        log.condense_single();
        assert_eq!(log.depth(), 1);
        let checkpoint = log.current();
        assert_eq!(checkpoint.deltas[&b"a".to_vec()], b"2".to_vec());
        assert_eq!(checkpoint.deltas[&b"b".to_vec()], b"3".to_vec());
        assert_eq!(checkpoint.balances[&addr(1)], 5);
        assert_eq!(checkpoint.balances[&addr(2)], 7);
        assert!(checkpoint.spent_vins.contains(&out(1, 0)));
        assert!(checkpoint.spent_vins.contains(&out(2, 0)));
    }

    prop_compose! {
        fn arb_op()(
            key in proptest::collection::vec(any::<u8>(), 1..4),
            value in proptest::collection::vec(any::<u8>(), 0..4),
            kind in 0u8..4,
        ) -> (u8, Vec<u8>, Vec<u8>) {
            (kind, key, value)
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]
        /// `condense_all` and iterated `condense_single` agree for any
        /// sequence of writes, checkpoints and reverts
        #[test]
        fn test_condense_composition(ops in proptest::collection::vec(arb_op(), 0..64)) {
            let mut all = WriteLog::default();
            let mut single = WriteLog::default();
            for (kind, key, value) in ops {
                match kind {
                    0 => {
                        all.checkpoint();
                        single.checkpoint();
                    }
                    1 => {
                        all.revert();
                        single.revert();
                    }
                    _ => {
                        all.write(key.clone(), value.clone());
                        single.write(key, value);
                    }
                }
            }
            all.condense_all();
            while single.depth() > 1 {
                single.condense_single();
            }
            prop_assert_eq!(all.current(), single.current());
        }
    }
}
