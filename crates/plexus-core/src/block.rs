//! PBFT blocks.
//!
//! A PBFT block pins one period of the chain: the DAG anchor whose
//! closure it finalizes, the order hash binding the exact DAG/transaction
//! ordering, and the proposer's signature.

use crate::rlp::{append_bytes, append_hash_list, append_u64, wrap_list, RlpCursor};
use crate::{Address, CoreError, Hash, PbftPeriod, Result, Signature};
use plexus_crypto::{keccak256, recover_address, KeyPair};
use std::sync::OnceLock;

/// A proposed (or finalized) PBFT block.
#[derive(Debug)]
pub struct PbftBlock {
    prev_block_hash: Hash,
    dag_anchor_hash: Hash,
    order_hash: Hash,
    period: PbftPeriod,
    beneficiary: Address,
    timestamp: u64,
    signature: Signature,
    hash: Hash,
    author: OnceLock<Address>,
}

impl Clone for PbftBlock {
    fn clone(&self) -> Self {
        Self {
            prev_block_hash: self.prev_block_hash,
            dag_anchor_hash: self.dag_anchor_hash,
            order_hash: self.order_hash,
            period: self.period,
            beneficiary: self.beneficiary,
            timestamp: self.timestamp,
            signature: self.signature,
            hash: self.hash,
            author: self.author.clone(),
        }
    }
}

impl PartialEq for PbftBlock {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for PbftBlock {}

impl PbftBlock {
    /// Build and sign a new proposal.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prev_block_hash: Hash,
        dag_anchor_hash: Hash,
        order_hash: Hash,
        period: PbftPeriod,
        beneficiary: Address,
        timestamp: u64,
        keypair: &KeyPair,
    ) -> Result<Self> {
        let mut block = Self {
            prev_block_hash,
            dag_anchor_hash,
            order_hash,
            period,
            beneficiary,
            timestamp,
            signature: [0u8; 65],
            hash: [0u8; 32],
            author: OnceLock::new(),
        };
        let digest = keccak256(&block.rlp(false));
        block.signature = keypair.sign(&digest)?;
        block.hash = keccak256(&block.rlp(true));
        let _ = block.author.set(keypair.address());
        Ok(block)
    }

    /// Decode from full RLP (7 items).
    pub fn from_rlp(bytes: &[u8]) -> Result<Self> {
        let mut cursor = RlpCursor::from_encoded(bytes)?;
        let block = Self::rlp_decode(&mut cursor)?;
        if !cursor.is_empty() {
            return Err(CoreError::Rlp("trailing items in pbft block".into()));
        }
        Ok(block)
    }

    pub(crate) fn rlp_decode(cursor: &mut RlpCursor<'_>) -> Result<Self> {
        let prev_block_hash = cursor.next_hash()?;
        let dag_anchor_hash = cursor.next_hash()?;
        let order_hash = cursor.next_hash()?;
        let period = cursor.next_u64()?;
        let beneficiary = cursor.next_address()?;
        let timestamp = cursor.next_u64()?;
        let signature = cursor.next_signature()?;

        let mut block = Self {
            prev_block_hash,
            dag_anchor_hash,
            order_hash,
            period,
            beneficiary,
            timestamp,
            signature,
            hash: [0u8; 32],
            author: OnceLock::new(),
        };
        block.hash = keccak256(&block.rlp(true));
        Ok(block)
    }

    pub fn rlp(&self, inc_sig: bool) -> Vec<u8> {
        let mut payload = Vec::new();
        self.rlp_append(&mut payload, inc_sig);
        wrap_list(&payload)
    }

    pub(crate) fn rlp_append(&self, payload: &mut Vec<u8>, inc_sig: bool) {
        append_bytes(payload, &self.prev_block_hash);
        append_bytes(payload, &self.dag_anchor_hash);
        append_bytes(payload, &self.order_hash);
        append_u64(payload, self.period);
        append_bytes(payload, &self.beneficiary);
        append_u64(payload, self.timestamp);
        if inc_sig {
            append_bytes(payload, &self.signature);
        }
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn prev_block_hash(&self) -> &Hash {
        &self.prev_block_hash
    }

    pub fn dag_anchor_hash(&self) -> &Hash {
        &self.dag_anchor_hash
    }

    pub fn order_hash(&self) -> &Hash {
        &self.order_hash
    }

    pub fn period(&self) -> PbftPeriod {
        self.period
    }

    pub fn beneficiary(&self) -> &Address {
        &self.beneficiary
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Recover the proposer address from the signature, caching the result.
    pub fn author(&self) -> Result<Address> {
        if let Some(author) = self.author.get() {
            return Ok(*author);
        }
        let digest = keccak256(&self.rlp(false));
        let author = recover_address(&digest, &self.signature)?;
        let _ = self.author.set(author);
        Ok(author)
    }
}

/// Keccak over the RLP of (ordered DAG block hashes, ordered non-finalized
/// transaction hashes). Binds a PBFT block to its exact content.
pub fn calculate_order_hash(dag_block_hashes: &[Hash], trx_hashes: &[Hash]) -> Hash {
    let mut payload = Vec::new();
    append_hash_list(&mut payload, dag_block_hashes);
    append_hash_list(&mut payload, trx_hashes);
    keccak256(&wrap_list(&payload))
}
