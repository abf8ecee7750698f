//! Vote bundle wire formats.
//!
//! Votes of one (block_hash, period, round, step) cell travel as an
//! optimized bundle that factors the common prefix out and carries only
//! the per-vote (vrf_proof, signature) pair. Receivers reconstruct each
//! vote by pairing the prefix with each pair.
//!
//! Older protocol versions shipped bundles as plain lists of fully
//! encoded votes; the tagged [`PacketEnvelope`] normalizes every version
//! to the current in-core types before anything reaches the consensus
//! stores.

use crate::rlp::{append_bytes, append_list, append_u64, wrap_list, RlpCursor};
use crate::vote::Vote;
use crate::{CoreError, Result};
use plexus_crypto::vrf::VrfProof;
use std::sync::Arc;

/// Protocol version whose encoding new packets use.
pub const CURRENT_PACKET_VERSION: u8 = 4;

/// Encode votes sharing one (block_hash, period, round, step) cell as an
/// optimized bundle: `[block_hash, period, round, step, [[proof, sig]…]]`.
pub fn encode_votes_bundle(votes: &[Arc<Vote>]) -> Result<Vec<u8>> {
    let reference = votes
        .last()
        .ok_or_else(|| CoreError::InvalidBundle("empty votes bundle".into()))?;

    let mut pairs = Vec::new();
    for vote in votes {
        if vote.block_hash() != reference.block_hash()
            || vote.period() != reference.period()
            || vote.round() != reference.round()
            || vote.step() != reference.step()
        {
            return Err(CoreError::InvalidBundle(
                "votes bundle common data mismatch".into(),
            ));
        }
        let mut pair = Vec::new();
        append_bytes(&mut pair, &vote.sortition().proof.to_bytes());
        append_bytes(&mut pair, vote.signature());
        append_list(&mut pairs, &pair);
    }

    let mut payload = Vec::new();
    append_bytes(&mut payload, reference.block_hash());
    append_u64(&mut payload, reference.period());
    append_u64(&mut payload, reference.round());
    append_u64(&mut payload, reference.step());
    append_list(&mut payload, &pairs);
    Ok(wrap_list(&payload))
}

/// Decode an optimized votes bundle back into full votes.
pub fn decode_votes_bundle(bytes: &[u8]) -> Result<Vec<Arc<Vote>>> {
    let mut cursor = RlpCursor::from_encoded(bytes)?;
    decode_votes_bundle_from(&mut cursor)
}

pub(crate) fn decode_votes_bundle_from(cursor: &mut RlpCursor<'_>) -> Result<Vec<Arc<Vote>>> {
    let block_hash = cursor.next_hash()?;
    let period = cursor.next_u64()?;
    let round = cursor.next_u64()?;
    let step = cursor.next_u64()?;

    let mut pairs = cursor.next_list()?;
    let mut votes = Vec::new();
    while !pairs.is_empty() {
        let mut pair = pairs.next_list()?;
        let proof = VrfProof::from_bytes(&pair.next_array::<96>()?);
        let signature = pair.next_signature()?;
        votes.push(Arc::new(Vote::from_wire_parts(
            block_hash, period, round, step, proof, signature,
        )));
    }
    Ok(votes)
}

/// Encode votes as a plain list of full vote encodings (legacy bundle
/// layout, and the layout used for mixed-cell persistence groups).
pub fn encode_full_votes(votes: &[Arc<Vote>]) -> Vec<u8> {
    let mut payload = Vec::new();
    for vote in votes {
        payload.extend_from_slice(&vote.rlp(true, false));
    }
    wrap_list(&payload)
}

/// Decode a plain list of full vote encodings.
pub fn decode_full_votes(bytes: &[u8]) -> Result<Vec<Arc<Vote>>> {
    let mut cursor = RlpCursor::from_encoded(bytes)?;
    let mut votes = Vec::new();
    while !cursor.is_empty() {
        let raw = cursor.next_raw()?;
        votes.push(Arc::new(Vote::from_rlp(raw)?));
    }
    Ok(votes)
}

/// A version-tagged packet. Decode paths for old versions normalize to the
/// current types, so the consensus core only ever sees current votes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketEnvelope {
    pub version: u8,
    pub payload: Vec<u8>,
}

impl PacketEnvelope {
    /// Wrap a votes bundle in the current version's envelope.
    pub fn current(votes: &[Arc<Vote>]) -> Result<Self> {
        Ok(Self { version: CURRENT_PACKET_VERSION, payload: encode_votes_bundle(votes)? })
    }

    pub fn rlp(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        append_u64(&mut payload, self.version as u64);
        append_bytes(&mut payload, &self.payload);
        wrap_list(&payload)
    }

    pub fn from_rlp(bytes: &[u8]) -> Result<Self> {
        let mut cursor = RlpCursor::from_encoded(bytes)?;
        let version = cursor.next_u64()? as u8;
        let payload = cursor.next_bytes()?;
        Ok(Self { version, payload })
    }

    /// Decode the carried votes, whatever the sender's protocol version.
    pub fn decode_votes(&self) -> Result<Vec<Arc<Vote>>> {
        match self.version {
            1..=3 => decode_full_votes(&self.payload),
            4 => decode_votes_bundle(&self.payload),
            other => Err(CoreError::UnsupportedPacketVersion(other)),
        }
    }
}
