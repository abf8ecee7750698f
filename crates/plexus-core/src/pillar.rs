//! Pillar (checkpoint) records for cross-chain certification.
//!
//! Every pillar interval the chain emits a pillar block summarizing the
//! finalized state; validators certify it with stake-weighted pillar
//! votes that light clients on other chains can verify.

use crate::rlp::{append_bytes, append_u64, wrap_list, RlpCursor};
use crate::{Address, Hash, PbftPeriod, Result, Signature};
use plexus_crypto::{keccak256, recover_address, KeyPair};
use std::sync::OnceLock;

/// A checkpoint over the finalized chain at a pillar period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PillarBlock {
    pub period: PbftPeriod,
    pub state_root: Hash,
    pub previous_pillar_hash: Hash,
}

impl PillarBlock {
    pub fn new(period: PbftPeriod, state_root: Hash, previous_pillar_hash: Hash) -> Self {
        Self { period, state_root, previous_pillar_hash }
    }

    pub fn hash(&self) -> Hash {
        keccak256(&self.rlp())
    }

    pub fn rlp(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        append_u64(&mut payload, self.period);
        append_bytes(&mut payload, &self.state_root);
        append_bytes(&mut payload, &self.previous_pillar_hash);
        wrap_list(&payload)
    }

    pub fn from_rlp(bytes: &[u8]) -> Result<Self> {
        let mut cursor = RlpCursor::from_encoded(bytes)?;
        let period = cursor.next_u64()?;
        let state_root = cursor.next_hash()?;
        let previous_pillar_hash = cursor.next_hash()?;
        Ok(Self { period, state_root, previous_pillar_hash })
    }
}

/// One validator's signature over a pillar block for a period.
#[derive(Debug)]
pub struct PillarVote {
    period: PbftPeriod,
    block_hash: Hash,
    signature: Signature,
    hash: Hash,
    voter: OnceLock<Address>,
}

impl Clone for PillarVote {
    fn clone(&self) -> Self {
        Self {
            period: self.period,
            block_hash: self.block_hash,
            signature: self.signature,
            hash: self.hash,
            voter: self.voter.clone(),
        }
    }
}

impl PartialEq for PillarVote {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for PillarVote {}

impl PillarVote {
    pub fn new(keypair: &KeyPair, period: PbftPeriod, block_hash: Hash) -> Result<Self> {
        let mut vote = Self {
            period,
            block_hash,
            signature: [0u8; 65],
            hash: [0u8; 32],
            voter: OnceLock::new(),
        };
        let digest = keccak256(&vote.rlp(false));
        vote.signature = keypair.sign(&digest)?;
        vote.hash = keccak256(&vote.rlp(true));
        let _ = vote.voter.set(keypair.address());
        Ok(vote)
    }

    pub fn rlp(&self, inc_sig: bool) -> Vec<u8> {
        let mut payload = Vec::new();
        append_u64(&mut payload, self.period);
        append_bytes(&mut payload, &self.block_hash);
        if inc_sig {
            append_bytes(&mut payload, &self.signature);
        }
        wrap_list(&payload)
    }

    pub fn from_rlp(bytes: &[u8]) -> Result<Self> {
        let mut cursor = RlpCursor::from_encoded(bytes)?;
        Self::rlp_decode(&mut cursor)
    }

    pub(crate) fn rlp_decode(cursor: &mut RlpCursor<'_>) -> Result<Self> {
        let period = cursor.next_u64()?;
        let block_hash = cursor.next_hash()?;
        let signature = cursor.next_signature()?;
        let mut vote = Self {
            period,
            block_hash,
            signature,
            hash: [0u8; 32],
            voter: OnceLock::new(),
        };
        vote.hash = keccak256(&vote.rlp(true));
        Ok(vote)
    }

    pub fn period(&self) -> PbftPeriod {
        self.period
    }

    pub fn block_hash(&self) -> &Hash {
        &self.block_hash
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    /// Recover the voter address from the signature, caching the result.
    pub fn voter(&self) -> Result<Address> {
        if let Some(address) = self.voter.get() {
            return Ok(*address);
        }
        let digest = keccak256(&self.rlp(false));
        let address = recover_address(&digest, &self.signature)?;
        let _ = self.voter.set(address);
        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pillar_block_round_trip() {
        let block = PillarBlock::new(100, [7; 32], [8; 32]);
        let decoded = PillarBlock::from_rlp(&block.rlp()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());
    }

    #[test]
    fn test_pillar_vote_round_trip() {
        let keypair = KeyPair::generate();
        let vote = PillarVote::new(&keypair, 100, [7; 32]).unwrap();

        let decoded = PillarVote::from_rlp(&vote.rlp(true)).unwrap();
        assert_eq!(decoded, vote);
        assert_eq!(decoded.voter().unwrap(), keypair.address());
    }

    #[test]
    fn test_pillar_vote_hash_binds_period() {
        let keypair = KeyPair::generate();
        let a = PillarVote::new(&keypair, 100, [7; 32]).unwrap();
        let b = PillarVote::new(&keypair, 101, [7; 32]).unwrap();
        assert_ne!(a.hash(), b.hash());
    }
}
