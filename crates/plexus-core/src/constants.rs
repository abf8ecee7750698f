//! Consensus-wide constants.

use crate::Hash;

/// The null block sentinel. A vote for this value is a vote for "no block
/// this round".
pub const NULL_BLOCK_HASH: Hash = [0u8; 32];

/// Resolution of the PBFT step polling timer, in milliseconds.
pub const POLLING_INTERVAL_MS: u64 = 100;

/// Steps per round after which the node suspects a partition and starts
/// requesting peer syncs.
pub const MAX_STEPS: u64 = 13;

/// Multiplier (in units of 2 * lambda) for how long to wait on a soft
/// voted block before giving the value up.
pub const MAX_WAIT_FOR_SOFT_VOTED_BLOCK_STEPS: u64 = 20;

/// Multiplier (in units of 2 * lambda) for how long to wait on a next
/// voted block before giving the value up.
pub const MAX_WAIT_FOR_NEXT_VOTED_BLOCK_STEPS: u64 = 20;

/// Dev-profile PBFT committee size. Production values come from chain
/// configuration.
pub const DEFAULT_COMMITTEE_SIZE: u64 = 5;

/// How many periods ahead of the tip a vote may be before it is dropped as
/// a DoS measure.
pub const DEFAULT_ACCEPTING_PERIODS: u64 = 5;

/// How many rounds ahead of the current round a vote may be.
pub const DEFAULT_ACCEPTING_ROUNDS: u64 = 5;

/// How many steps ahead of the current step a vote may be when period and
/// round match the tip.
pub const DEFAULT_ACCEPTING_STEPS: u64 = 5;

/// Periods a cert vote may trail the tip and still be kept as a potential
/// reward vote.
pub const REWARD_VOTES_WINDOW: u64 = 1;
