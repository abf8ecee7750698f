//! Pillar (checkpoint) vote store.
//!
//! Independent of the main vote store: pillar votes are weighted by raw
//! validator stake (no sortition) and keyed one-per-validator-per-period.
//! Periods must be initialized with their stake threshold before any
//! insert.

use crate::{ConsensusError, Result};
use parking_lot::RwLock;
use plexus_core::{Address, Hash, PbftPeriod, PillarVote};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
struct BlockVotes {
    votes: HashMap<Hash, (Arc<PillarVote>, u64)>,
    stake_weight: u64,
}

struct PeriodVotes {
    per_block: HashMap<Hash, BlockVotes>,
    unique_voters: HashMap<Address, Hash>,
    threshold: u64,
}

/// Per-period stake-weighted pillar vote aggregation.
#[derive(Default)]
pub struct PillarVoteStore {
    per_period: RwLock<BTreeMap<PbftPeriod, PeriodVotes>>,
}

impl PillarVoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the period bucket with its 2t+1 stake threshold. Must run
    /// before any insert for that period.
    pub fn initialize(&self, period: PbftPeriod, threshold: u64) {
        let mut per_period = self.per_period.write();
        per_period.entry(period).or_insert_with(|| PeriodVotes {
            per_block: HashMap::new(),
            unique_voters: HashMap::new(),
            threshold,
        });
    }

    pub fn is_initialized(&self, period: PbftPeriod) -> bool {
        self.per_period.read().contains_key(&period)
    }

    pub fn vote_exists(&self, vote: &PillarVote) -> bool {
        let per_period = self.per_period.read();
        per_period
            .get(&vote.period())
            .and_then(|pv| pv.per_block.get(vote.block_hash()))
            .is_some_and(|bv| bv.votes.contains_key(vote.hash()))
    }

    /// Insert a validated vote with the validator's stake. Returns false
    /// when the validator already voted differently this period.
    pub fn insert(&self, vote: Arc<PillarVote>, validator_stake: u64) -> Result<bool> {
        let voter = vote.voter()?;
        let mut per_period = self.per_period.write();

        let period_votes = per_period
            .get_mut(&vote.period())
            .ok_or(ConsensusError::PillarPeriodUninitialized(vote.period()))?;

        match period_votes.unique_voters.entry(voter) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(*vote.hash());
            }
            std::collections::hash_map::Entry::Occupied(slot) => {
                if slot.get() != vote.hash() {
                    debug!(
                        "validator {} already pillar-voted in period {}",
                        hex::encode(voter),
                        vote.period()
                    );
                    return Ok(false);
                }
            }
        }

        let block_votes = period_votes.per_block.entry(*vote.block_hash()).or_default();
        if block_votes
            .votes
            .insert(*vote.hash(), (vote.clone(), validator_stake))
            .is_none()
        {
            block_votes.stake_weight += validator_stake;
        }
        Ok(true)
    }

    /// Accumulated stake behind a block in a period.
    pub fn stake_weight(&self, period: PbftPeriod, block_hash: &Hash) -> u64 {
        let per_period = self.per_period.read();
        per_period
            .get(&period)
            .and_then(|pv| pv.per_block.get(block_hash))
            .map(|bv| bv.stake_weight)
            .unwrap_or(0)
    }

    /// Votes for a block. With `above_threshold`, returns the minimal
    /// descending-stake prefix whose total reaches the period threshold,
    /// or nothing while the threshold is unmet.
    pub fn verified_votes(
        &self,
        period: PbftPeriod,
        block_hash: &Hash,
        above_threshold: bool,
    ) -> Vec<Arc<PillarVote>> {
        let per_period = self.per_period.read();
        let Some(period_votes) = per_period.get(&period) else { return Vec::new() };
        let Some(block_votes) = period_votes.per_block.get(block_hash) else {
            return Vec::new();
        };

        if !above_threshold {
            return block_votes.votes.values().map(|(vote, _)| vote.clone()).collect();
        }

        if block_votes.stake_weight < period_votes.threshold {
            return Vec::new();
        }

        let mut weighted: Vec<(Arc<PillarVote>, u64)> =
            block_votes.votes.values().cloned().collect();
        weighted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.hash().cmp(b.0.hash())));

        let mut picked = Vec::new();
        let mut total = 0u64;
        for (vote, stake) in weighted {
            total += stake;
            picked.push(vote);
            if total >= period_votes.threshold {
                break;
            }
        }
        picked
    }

    /// Drop all periods below `min_period`.
    pub fn erase_below(&self, min_period: PbftPeriod) {
        let mut per_period = self.per_period.write();
        per_period.retain(|&period, _| period >= min_period);
    }
}
