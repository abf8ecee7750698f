//! DAG blocks and transactions as the consensus core sees them.
//!
//! The DAG ordering algorithm itself lives behind the `DagOrder`
//! collaborator; the core only needs the content identity of a DAG block
//! (its pivot, tips and transaction hashes) to recompute order hashes and
//! build proposals.

use crate::rlp::{append_bytes, append_hash_list, append_u64, wrap_list, RlpCursor};
use crate::{Hash, Result};
use plexus_crypto::keccak256;

/// A DAG block reduced to its consensus-relevant content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagBlock {
    pub pivot: Hash,
    pub level: u64,
    pub tips: Vec<Hash>,
    pub trxs: Vec<Hash>,
}

impl DagBlock {
    pub fn new(pivot: Hash, level: u64, tips: Vec<Hash>, trxs: Vec<Hash>) -> Self {
        Self { pivot, level, tips, trxs }
    }

    pub fn hash(&self) -> Hash {
        keccak256(&self.rlp())
    }

    pub fn rlp(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        append_bytes(&mut payload, &self.pivot);
        append_u64(&mut payload, self.level);
        append_hash_list(&mut payload, &self.tips);
        append_hash_list(&mut payload, &self.trxs);
        wrap_list(&payload)
    }

    pub fn from_rlp(bytes: &[u8]) -> Result<Self> {
        let mut cursor = RlpCursor::from_encoded(bytes)?;
        Self::rlp_decode(&mut cursor)
    }

    pub(crate) fn rlp_decode(cursor: &mut RlpCursor<'_>) -> Result<Self> {
        let pivot = cursor.next_hash()?;
        let level = cursor.next_u64()?;
        let tips = cursor.next_list()?.remaining_hashes()?;
        let trxs = cursor.next_list()?.remaining_hashes()?;
        Ok(Self { pivot, level, tips, trxs })
    }
}

/// A transaction as an opaque consensus payload: a nonce and raw bytes.
/// Execution semantics live in the execution engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub nonce: u64,
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn new(nonce: u64, payload: Vec<u8>) -> Self {
        Self { nonce, payload }
    }

    pub fn hash(&self) -> Hash {
        keccak256(&self.rlp())
    }

    pub fn rlp(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        append_u64(&mut payload, self.nonce);
        append_bytes(&mut payload, &self.payload);
        wrap_list(&payload)
    }

    pub fn from_rlp(bytes: &[u8]) -> Result<Self> {
        let mut cursor = RlpCursor::from_encoded(bytes)?;
        Self::rlp_decode(&mut cursor)
    }

    pub(crate) fn rlp_decode(cursor: &mut RlpCursor<'_>) -> Result<Self> {
        let nonce = cursor.next_u64()?;
        let payload = cursor.next_bytes()?;
        Ok(Self { nonce, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dag_block_rlp_round_trip() {
        let block = DagBlock::new([1; 32], 7, vec![[2; 32], [3; 32]], vec![[4; 32]]);
        let decoded = DagBlock::from_rlp(&block.rlp()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());
    }

    #[test]
    fn test_dag_block_empty_tips() {
        let block = DagBlock::new([1; 32], 0, vec![], vec![]);
        let decoded = DagBlock::from_rlp(&block.rlp()).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn test_transaction_rlp_round_trip() {
        let tx = Transaction::new(42, b"transfer".to_vec());
        let decoded = Transaction::from_rlp(&tx.rlp()).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.hash(), tx.hash());
    }

    #[test]
    fn test_transaction_hash_differs() {
        assert_ne!(
            Transaction::new(1, b"a".to_vec()).hash(),
            Transaction::new(2, b"a".to_vec()).hash()
        );
    }

    proptest::proptest! {
        #[test]
        fn prop_transaction_round_trip(nonce in proptest::prelude::any::<u64>(),
                                       payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..256)) {
            let tx = Transaction::new(nonce, payload);
            let decoded = Transaction::from_rlp(&tx.rlp()).unwrap();
            proptest::prop_assert_eq!(decoded, tx);
        }

        #[test]
        fn prop_dag_block_round_trip(level in proptest::prelude::any::<u64>(),
                                     tip_count in 0usize..8,
                                     trx_count in 0usize..8) {
            let tips: Vec<_> = (0..tip_count).map(|i| [i as u8; 32]).collect();
            let trxs: Vec<_> = (0..trx_count).map(|i| [0x80 | i as u8; 32]).collect();
            let block = DagBlock::new([7; 32], level, tips, trxs);
            let decoded = DagBlock::from_rlp(&block.rlp()).unwrap();
            proptest::prop_assert_eq!(decoded, block);
        }
    }
}
