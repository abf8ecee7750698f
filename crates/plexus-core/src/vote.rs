//! PBFT votes.
//!
//! A vote is immutable after construction: the voted value, the VRF
//! sortition credential that seeds its weight, and a recoverable signature
//! over both. Hash, voter address and weight are cached on first use.

use crate::rlp::{append_bytes, append_u64, wrap_list, RlpCursor};
use crate::sortition::VrfSortition;
use crate::{
    Address, CoreError, Hash, PbftPeriod, PbftRound, PbftStep, Result, Signature,
    NULL_BLOCK_HASH,
};
use plexus_crypto::vrf::VrfProof;
use plexus_crypto::{keccak256, recover_address, KeyPair};
use std::sync::OnceLock;

/// Vote types are bound to step numbers: a propose vote can exist only in
/// step 1, a soft vote only in step 2, a cert vote only in step 3 and next
/// votes in any step from 4 on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VoteType {
    Propose = 1,
    Soft = 2,
    Cert = 3,
    Next = 4,
}

impl VoteType {
    /// The unique vote type a step admits.
    pub fn from_step(step: PbftStep) -> Self {
        match step {
            1 => VoteType::Propose,
            2 => VoteType::Soft,
            3 => VoteType::Cert,
            _ => VoteType::Next,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(VoteType::Propose),
            2 => Ok(VoteType::Soft),
            3 => Ok(VoteType::Cert),
            4 => Ok(VoteType::Next),
            other => Err(CoreError::Rlp(format!("invalid vote type {other}"))),
        }
    }
}

impl std::fmt::Display for VoteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            VoteType::Propose => "propose",
            VoteType::Soft => "soft",
            VoteType::Cert => "cert",
            VoteType::Next => "next",
        };
        write!(f, "{name}")
    }
}

/// The tuple seeding the VRF for a vote: (type, period, round, step).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortitionMessage {
    pub vote_type: VoteType,
    pub period: PbftPeriod,
    pub round: PbftRound,
    pub step: PbftStep,
}

impl SortitionMessage {
    pub fn new(vote_type: VoteType, period: PbftPeriod, round: PbftRound, step: PbftStep) -> Self {
        Self { vote_type, period, round, step }
    }

    /// Standalone RLP encoding, used as the VRF input string.
    pub fn rlp(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        self.rlp_append(&mut payload);
        wrap_list(&payload)
    }

    /// Append the four message fields to an enclosing payload.
    pub fn rlp_append(&self, out: &mut Vec<u8>) {
        append_u64(out, self.vote_type as u64);
        append_u64(out, self.period);
        append_u64(out, self.round);
        append_u64(out, self.step);
    }

    pub fn rlp_decode(cursor: &mut RlpCursor<'_>) -> Result<Self> {
        let vote_type = VoteType::from_u8(cursor.next_u64()? as u8)?;
        let period = cursor.next_u64()?;
        let round = cursor.next_u64()?;
        let step = cursor.next_u64()?;
        Ok(Self { vote_type, period, round, step })
    }

    /// A message is well formed when its type matches its step.
    pub fn type_matches_step(&self) -> bool {
        self.vote_type == VoteType::from_step(self.step)
    }
}

/// A signed, immutable PBFT vote.
#[derive(Debug)]
pub struct Vote {
    block_hash: Hash,
    sortition: VrfSortition,
    signature: Signature,
    /// keccak256 of the signed RLP encoding, cached at construction
    hash: Hash,
    voter: OnceLock<Address>,
    weight: OnceLock<u64>,
}

impl Clone for Vote {
    fn clone(&self) -> Self {
        Self {
            block_hash: self.block_hash,
            sortition: self.sortition.clone(),
            signature: self.signature,
            hash: self.hash,
            voter: self.voter.clone(),
            weight: self.weight.clone(),
        }
    }
}

impl PartialEq for Vote {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Vote {}

impl Vote {
    /// Create and sign a new vote.
    pub fn new(keypair: &KeyPair, sortition: VrfSortition, block_hash: Hash) -> Result<Self> {
        let mut vote = Self {
            block_hash,
            sortition,
            signature: [0u8; 65],
            hash: NULL_BLOCK_HASH,
            voter: OnceLock::new(),
            weight: OnceLock::new(),
        };
        let digest = keccak256(&vote.rlp(false, false));
        vote.signature = keypair.sign(&digest)?;
        vote.hash = keccak256(&vote.rlp(true, false));
        let _ = vote.voter.set(keypair.address());
        Ok(vote)
    }

    /// Reconstruct a vote from its full RLP encoding (3 items on the wire,
    /// 4 when a persisted weight is appended).
    pub fn from_rlp(bytes: &[u8]) -> Result<Self> {
        let mut cursor = RlpCursor::from_encoded(bytes)?;
        let item_count = cursor.remaining_items()?;
        if item_count != 3 && item_count != 4 {
            return Err(CoreError::Rlp(format!("vote rlp has {item_count} items")));
        }

        let block_hash = cursor.next_hash()?;
        let sortition_bytes = cursor.next_bytes()?;
        let mut sortition_cursor = RlpCursor::from_encoded(&sortition_bytes)?;
        let sortition = VrfSortition::rlp_decode(&mut sortition_cursor)?;
        let signature = cursor.next_signature()?;

        let mut vote = Self {
            block_hash,
            sortition,
            signature,
            hash: NULL_BLOCK_HASH,
            voter: OnceLock::new(),
            weight: OnceLock::new(),
        };
        vote.hash = keccak256(&vote.rlp(true, false));

        if item_count == 4 {
            let _ = vote.weight.set(cursor.next_u64()?);
        }
        Ok(vote)
    }

    /// Reconstruct a vote from the optimized wire envelope: the bundle's
    /// shared (block_hash, period, round, step) prefix plus this vote's
    /// proof and signature. The vote type is implied by the step.
    pub fn from_wire_parts(
        block_hash: Hash,
        period: PbftPeriod,
        round: PbftRound,
        step: PbftStep,
        proof: VrfProof,
        signature: Signature,
    ) -> Self {
        let message = SortitionMessage::new(VoteType::from_step(step), period, round, step);
        let sortition = VrfSortition::from_proof(message, proof);
        let mut vote = Self {
            block_hash,
            sortition,
            signature,
            hash: NULL_BLOCK_HASH,
            voter: OnceLock::new(),
            weight: OnceLock::new(),
        };
        vote.hash = keccak256(&vote.rlp(true, false));
        vote
    }

    /// RLP encoding: [block_hash, sortition, signature?, weight?].
    /// The sortition travels as a nested byte string so the signing digest
    /// covers its exact encoding.
    pub fn rlp(&self, inc_sig: bool, inc_weight: bool) -> Vec<u8> {
        let mut sortition_payload = Vec::new();
        self.sortition.rlp_append(&mut sortition_payload);
        let sortition_bytes = wrap_list(&sortition_payload);

        let mut payload = Vec::new();
        append_bytes(&mut payload, &self.block_hash);
        append_bytes(&mut payload, &sortition_bytes);
        if inc_sig {
            append_bytes(&mut payload, &self.signature);
        }
        if inc_weight {
            if let Some(weight) = self.weight.get() {
                append_u64(&mut payload, *weight);
            }
        }
        wrap_list(&payload)
    }

    /// The digest the vote signature covers.
    pub fn digest(&self) -> Hash {
        keccak256(&self.rlp(false, false))
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn block_hash(&self) -> &Hash {
        &self.block_hash
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn sortition(&self) -> &VrfSortition {
        &self.sortition
    }

    pub fn vote_type(&self) -> VoteType {
        self.sortition.message.vote_type
    }

    pub fn period(&self) -> PbftPeriod {
        self.sortition.message.period
    }

    pub fn round(&self) -> PbftRound {
        self.sortition.message.round
    }

    pub fn step(&self) -> PbftStep {
        self.sortition.message.step
    }

    pub fn is_null_block(&self) -> bool {
        self.block_hash == NULL_BLOCK_HASH
    }

    /// True for votes placed in a second finishing step (odd step >= 5),
    /// where the one-null-one-specific pair exception applies.
    pub fn is_second_finish_vote(&self) -> bool {
        self.step() >= 5 && self.step() % 2 == 1
    }

    /// Recover the voter address from the signature, caching the result.
    pub fn voter(&self) -> Result<Address> {
        if let Some(address) = self.voter.get() {
            return Ok(*address);
        }
        let address = recover_address(&self.digest(), &self.signature)?;
        let _ = self.voter.set(address);
        Ok(address)
    }

    /// The cached weight, if one has been computed or decoded.
    pub fn weight(&self) -> Option<u64> {
        self.weight.get().copied()
    }

    /// Compute, cache and return the vote weight for the given DPOS view.
    pub fn calculate_weight(&self, stake: u64, total_stake: u64, threshold: u64) -> Result<u64> {
        if let Some(weight) = self.weight.get() {
            return Ok(*weight);
        }
        let voter = self.voter()?;
        let weight = self.sortition.calculate_weight(stake, total_stake, threshold, &voter);
        let _ = self.weight.set(weight);
        Ok(weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_crypto::vrf::VrfKeypair;

    fn make_vote(
        keypair: &KeyPair,
        vrf: &VrfKeypair,
        block_hash: Hash,
        period: PbftPeriod,
        round: PbftRound,
        step: PbftStep,
    ) -> Vote {
        let message = SortitionMessage::new(VoteType::from_step(step), period, round, step);
        let sortition = VrfSortition::generate(vrf, message);
        Vote::new(keypair, sortition, block_hash).unwrap()
    }

    #[test]
    fn test_step_to_type() {
        assert_eq!(VoteType::from_step(1), VoteType::Propose);
        assert_eq!(VoteType::from_step(2), VoteType::Soft);
        assert_eq!(VoteType::from_step(3), VoteType::Cert);
        assert_eq!(VoteType::from_step(4), VoteType::Next);
        assert_eq!(VoteType::from_step(17), VoteType::Next);
    }

    #[test]
    fn test_vote_rlp_round_trip() {
        let keypair = KeyPair::generate();
        let vrf = VrfKeypair::from_seed(&[1u8; 32]);
        let vote = make_vote(&keypair, &vrf, [0xaa; 32], 3, 2, 5);

        let decoded = Vote::from_rlp(&vote.rlp(true, false)).unwrap();
        assert_eq!(decoded, vote);
        assert_eq!(decoded.hash(), vote.hash());
        assert_eq!(decoded.period(), 3);
        assert_eq!(decoded.round(), 2);
        assert_eq!(decoded.step(), 5);
        assert_eq!(decoded.vote_type(), VoteType::Next);
        assert_eq!(decoded.voter().unwrap(), keypair.address());
    }

    #[test]
    fn test_vote_rlp_with_weight_round_trip() {
        let keypair = KeyPair::generate();
        let vrf = VrfKeypair::from_seed(&[1u8; 32]);
        let vote = make_vote(&keypair, &vrf, [0xaa; 32], 3, 1, 3);
        vote.calculate_weight(10, 10, 10).unwrap();

        let encoded = vote.rlp(true, true);
        let decoded = Vote::from_rlp(&encoded).unwrap();
        assert_eq!(decoded.weight(), vote.weight());
        assert_eq!(decoded.hash(), vote.hash());
    }

    #[test]
    fn test_vote_sortition_verifies() {
        let keypair = KeyPair::generate();
        let vrf = VrfKeypair::from_seed(&[2u8; 32]);
        let vote = make_vote(&keypair, &vrf, [0xbb; 32], 1, 1, 2);

        vote.sortition().verify(&vrf.public_key).unwrap();
    }

    #[test]
    fn test_tampered_signature_changes_voter() {
        let keypair = KeyPair::generate();
        let vrf = VrfKeypair::from_seed(&[2u8; 32]);
        let vote = make_vote(&keypair, &vrf, [0xbb; 32], 1, 1, 2);

        let mut encoded = vote.rlp(true, false);
        // Flip a byte inside the signature item
        let len = encoded.len();
        encoded[len - 2] ^= 0xff;

        match Vote::from_rlp(&encoded) {
            Ok(tampered) => match tampered.voter() {
                Ok(addr) => assert_ne!(addr, keypair.address()),
                Err(_) => {}
            },
            Err(_) => {}
        }
    }

    #[test]
    fn test_second_finish_detection() {
        let keypair = KeyPair::generate();
        let vrf = VrfKeypair::from_seed(&[2u8; 32]);
        assert!(!make_vote(&keypair, &vrf, [0; 32], 1, 1, 4).is_second_finish_vote());
        assert!(make_vote(&keypair, &vrf, [0; 32], 1, 1, 5).is_second_finish_vote());
        assert!(!make_vote(&keypair, &vrf, [0; 32], 1, 1, 6).is_second_finish_vote());
        assert!(make_vote(&keypair, &vrf, [0; 32], 1, 1, 7).is_second_finish_vote());
    }

    #[test]
    fn test_type_step_consistency() {
        let message = SortitionMessage::new(VoteType::Soft, 1, 1, 2);
        assert!(message.type_matches_step());
        let message = SortitionMessage::new(VoteType::Soft, 1, 1, 3);
        assert!(!message.type_matches_step());
    }
}
