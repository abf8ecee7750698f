//! # Plexus Core Types
//!
//! Consensus data model: PBFT votes with VRF sortition credentials, PBFT
//! blocks, DAG blocks, period data, pillar (checkpoint) records, and the
//! RLP wire formats they travel in.

pub mod block;
pub mod bundle;
pub mod constants;
pub mod dag;
pub mod error;
pub mod period_data;
pub mod pillar;
pub mod rlp;
pub mod sortition;
pub mod vote;

pub use block::{calculate_order_hash, PbftBlock};
pub use bundle::{decode_votes_bundle, encode_votes_bundle, PacketEnvelope};
pub use constants::NULL_BLOCK_HASH;
pub use dag::{DagBlock, Transaction};
pub use error::{CoreError, Result};
pub use period_data::PeriodData;
pub use pillar::{PillarBlock, PillarVote};
pub use sortition::VrfSortition;
pub use vote::{SortitionMessage, Vote, VoteType};

pub use plexus_crypto::{Address, Hash, Signature};

/// PBFT period: the slot in the linear chain being agreed upon.
pub type PbftPeriod = u64;

/// PBFT round within a period.
pub type PbftRound = u64;

/// PBFT step within a round (1 = propose, 2 = soft, 3 = cert, >= 4 finish).
pub type PbftStep = u64;

/// Format a hash as an abbreviated hex string for logging.
pub fn abridged(hash: &Hash) -> String {
    format!("0x{}…", hex::encode(&hash[..4]))
}
