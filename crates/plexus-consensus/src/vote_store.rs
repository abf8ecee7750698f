//! Verified vote store: insertion, uniqueness, 2t+1 tallying, cleanup.
//!
//! Votes are validated (bounds, schema, VRF, signature, weight) and then
//! indexed period -> round -> step -> voted value. One reader-writer lock
//! protects the nested map; operations are coarse-grained but short. The
//! first insert that pushes a (period, round, kind) cell across 2t+1 is
//! the only one that reports the crossing.

use crate::interfaces::ExecutionEngine;
use crate::{ConsensusError, PbftConfig, Result};
use parking_lot::RwLock;
use plexus_core::{
    Address, Hash, PbftPeriod, PbftRound, PbftStep, Vote, VoteType, NULL_BLOCK_HASH,
};
use plexus_storage::ConsensusDb;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// The four quorum kinds tracked per (period, round).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuorumKind {
    SoftVotedBlock,
    CertVotedBlock,
    NextVotedBlock,
    NextVotedNullBlock,
}

impl QuorumKind {
    fn classify(step: PbftStep, block_hash: &Hash) -> Option<Self> {
        match step {
            1 => None,
            2 => Some(QuorumKind::SoftVotedBlock),
            3 => Some(QuorumKind::CertVotedBlock),
            _ if *block_hash == NULL_BLOCK_HASH => Some(QuorumKind::NextVotedNullBlock),
            _ => Some(QuorumKind::NextVotedBlock),
        }
    }
}

/// Outcome of a successful `insert` call.
#[derive(Debug)]
pub enum InsertResult {
    /// The vote entered the store. If this insert was the first to push
    /// its (period, round, kind) cell across 2t+1, the crossing rides
    /// along exactly once.
    Inserted { new_two_t_plus_one: Option<(QuorumKind, Hash, PbftStep)> },
    /// Exact same vote hash already present.
    Duplicate,
    /// Same voter, same cell, different value outside the second-finish
    /// null/non-null pair exception. The caller turns this into a
    /// double-voting proof.
    DoubleVote { existing: Arc<Vote> },
}

#[derive(Default)]
struct VotedValue {
    weight: u64,
    votes: HashMap<Hash, Arc<Vote>>,
}

#[derive(Default)]
struct StepVotes {
    votes: HashMap<Hash, VotedValue>,
    unique_voters: HashMap<Address, (Arc<Vote>, Option<Arc<Vote>>)>,
}

#[derive(Default)]
struct RoundVotes {
    step_votes: BTreeMap<PbftStep, StepVotes>,
    two_t_plus_one_voted_blocks: HashMap<QuorumKind, (Hash, PbftStep)>,
    network_t_plus_one_step: Option<PbftStep>,
}

type PeriodVotes = BTreeMap<PbftRound, RoundVotes>;

/// Thread-safe verified vote store.
pub struct VoteStore {
    verified: RwLock<BTreeMap<PbftPeriod, PeriodVotes>>,
    engine: Arc<dyn ExecutionEngine>,
    db: Option<Arc<ConsensusDb>>,
    committee_size: u64,
    accepting_periods: u64,
    accepting_rounds: u64,
    accepting_steps: u64,
    reward_votes_window: u64,
    tip_period: AtomicU64,
    tip_round: AtomicU64,
    tip_step: AtomicU64,
}

impl VoteStore {
    pub fn new(
        config: &PbftConfig,
        engine: Arc<dyn ExecutionEngine>,
        db: Option<Arc<ConsensusDb>>,
    ) -> Self {
        Self {
            verified: RwLock::new(BTreeMap::new()),
            engine,
            db,
            committee_size: config.committee_size,
            accepting_periods: config.accepting_periods,
            accepting_rounds: config.accepting_rounds,
            accepting_steps: config.accepting_steps,
            reward_votes_window: config.reward_votes_window,
            tip_period: AtomicU64::new(1),
            tip_round: AtomicU64::new(1),
            tip_step: AtomicU64::new(1),
        }
    }

    /// Update the accepting-window anchor. Called by the state machine on
    /// every period/round/step transition.
    pub fn set_tip(&self, period: PbftPeriod, round: PbftRound, step: PbftStep) {
        self.tip_period.store(period, Ordering::Release);
        self.tip_round.store(round, Ordering::Release);
        self.tip_step.store(step, Ordering::Release);
    }

    /// Sortition threshold at `period`: min(committee, total stake).
    pub fn sortition_threshold(&self, period: PbftPeriod) -> Result<u64> {
        let total = self.engine.dpos_eligible_total_vote_count(period)?;
        Ok(self.committee_size.min(total))
    }

    /// Byzantine quorum at `period`.
    pub fn two_t_plus_one(&self, period: PbftPeriod) -> Result<u64> {
        Ok(self.sortition_threshold(period)? * 2 / 3 + 1)
    }

    /// Validate, weigh and insert a vote.
    pub fn insert(&self, vote: Arc<Vote>) -> Result<InsertResult> {
        self.validate_bounds(&vote)?;
        self.validate_schema(&vote)?;

        let voter = vote.voter().map_err(|_| ConsensusError::InvalidSignature)?;

        let vrf_key = self.engine.dpos_vrf_key(vote.period(), &voter)?;
        vote.sortition()
            .verify(&vrf_key)
            .map_err(|_| ConsensusError::InvalidVrfProof)?;

        let stake = self.engine.dpos_eligible_vote_count(vote.period(), &voter)?;
        if stake == 0 {
            return Err(ConsensusError::InsufficientStake);
        }
        let stake = if vote.vote_type() == VoteType::Propose {
            // Proposal sortition is a 1-stake Bernoulli draw, so leader
            // eligibility is independent of stake concentration
            1
        } else {
            stake
        };
        let total = self.engine.dpos_eligible_total_vote_count(vote.period())?;
        let threshold = self.committee_size.min(total);
        let weight = vote.calculate_weight(stake, total, threshold)?;
        if weight == 0 {
            return Err(ConsensusError::InsufficientStake);
        }

        let two_t_plus_one = threshold * 2 / 3 + 1;
        let t_plus_one = threshold / 3 + 1;

        let result = self.insert_weighted(&vote, voter, two_t_plus_one, t_plus_one);
        if let (Ok(InsertResult::Inserted { .. }), Some(db)) = (&result, &self.db) {
            if let Err(e) = db.put_verified_vote(&vote) {
                warn!("failed to persist verified vote {}: {e}", hex::encode(vote.hash()));
            }
        }
        result
    }

    fn insert_weighted(
        &self,
        vote: &Arc<Vote>,
        voter: Address,
        two_t_plus_one: u64,
        t_plus_one: u64,
    ) -> Result<InsertResult> {
        let weight = vote.weight().unwrap_or(0);
        let mut verified = self.verified.write();

        let round_votes = verified
            .entry(vote.period())
            .or_default()
            .entry(vote.round())
            .or_default();
        let step_votes = round_votes.step_votes.entry(vote.step()).or_default();

        // Uniqueness first
        match step_votes.unique_voters.entry(voter) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert((vote.clone(), None));
            }
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                let (primary, secondary) = slot.get_mut();
                if primary.hash() == vote.hash() {
                    return Ok(InsertResult::Duplicate);
                }
                if let Some(existing) = secondary {
                    if existing.hash() == vote.hash() {
                        return Ok(InsertResult::Duplicate);
                    }
                    // A third value from this voter: surface the existing
                    // vote in the same null/non-null class, which is the
                    // provable equivocation
                    let conflicting = if existing.is_null_block() == vote.is_null_block() {
                        existing.clone()
                    } else {
                        primary.clone()
                    };
                    return Ok(InsertResult::DoubleVote { existing: conflicting });
                }
                // Second finishing steps allow one vote for the null block
                // and one for a specific block from the same voter
                let pair_allowed = vote.is_second_finish_vote()
                    && (primary.is_null_block() != vote.is_null_block());
                if pair_allowed {
                    *secondary = Some(vote.clone());
                } else {
                    return Ok(InsertResult::DoubleVote { existing: primary.clone() });
                }
            }
        }

        // Index by voted value and accumulate weight
        let voted_value = step_votes.votes.entry(*vote.block_hash()).or_default();
        if voted_value.votes.contains_key(vote.hash()) {
            return Ok(InsertResult::Duplicate);
        }
        voted_value.votes.insert(*vote.hash(), vote.clone());
        voted_value.weight += weight;
        let cumulative = voted_value.weight;

        trace!(
            "inserted {} vote {} for {} (period {}, round {}, step {}), cell weight {cumulative}",
            vote.vote_type(),
            plexus_core::abridged(vote.hash()),
            plexus_core::abridged(vote.block_hash()),
            vote.period(),
            vote.round(),
            vote.step(),
        );

        // Edge-triggered 2t+1 detection
        let mut new_two_t_plus_one = None;
        if let Some(kind) = QuorumKind::classify(vote.step(), vote.block_hash()) {
            if cumulative >= two_t_plus_one
                && !round_votes.two_t_plus_one_voted_blocks.contains_key(&kind)
            {
                round_votes
                    .two_t_plus_one_voted_blocks
                    .insert(kind, (*vote.block_hash(), vote.step()));
                new_two_t_plus_one = Some((kind, *vote.block_hash(), vote.step()));
                debug!(
                    "2t+1 {:?} reached for {} at period {}, round {}, step {}",
                    kind,
                    plexus_core::abridged(vote.block_hash()),
                    vote.period(),
                    vote.round(),
                    vote.step(),
                );
            }

            if vote.step() >= 4 && cumulative >= t_plus_one {
                let current = round_votes.network_t_plus_one_step.unwrap_or(0);
                if vote.step() > current {
                    round_votes.network_t_plus_one_step = Some(vote.step());
                }
            }
        }

        Ok(InsertResult::Inserted { new_two_t_plus_one })
    }

    fn validate_bounds(&self, vote: &Vote) -> Result<()> {
        let tip_period = self.tip_period.load(Ordering::Acquire);
        let tip_round = self.tip_round.load(Ordering::Acquire);
        let tip_step = self.tip_step.load(Ordering::Acquire);

        if vote.period() < tip_period {
            // Cert votes one reward window behind stay eligible as reward
            // votes; everything else is stale
            let reward_vote = vote.vote_type() == VoteType::Cert
                && vote.period() + self.reward_votes_window == tip_period;
            if !reward_vote {
                return Err(ConsensusError::OutOfBounds(format!(
                    "vote period {} behind tip {tip_period}",
                    vote.period()
                )));
            }
            return Ok(());
        }

        if vote.period() > tip_period + self.accepting_periods + 1 {
            return Err(ConsensusError::OutOfBounds(format!(
                "vote period {} too far ahead of tip {tip_period}",
                vote.period()
            )));
        }

        if vote.period() == tip_period {
            if vote.round() + 1 < tip_round {
                return Err(ConsensusError::OutOfBounds(format!(
                    "vote round {} behind current round {tip_round}",
                    vote.round()
                )));
            }
            if vote.round() > tip_round + self.accepting_rounds {
                return Err(ConsensusError::OutOfBounds(format!(
                    "vote round {} too far ahead of round {tip_round}",
                    vote.round()
                )));
            }
            if vote.round() == tip_round && vote.step() > tip_step + self.accepting_steps {
                return Err(ConsensusError::OutOfBounds(format!(
                    "vote step {} too far ahead of step {tip_step}",
                    vote.step()
                )));
            }
        }

        Ok(())
    }

    fn validate_schema(&self, vote: &Vote) -> Result<()> {
        if vote.step() == 0 || vote.round() == 0 || vote.period() == 0 {
            return Err(ConsensusError::InvalidVote("zero period/round/step".into()));
        }
        if !vote.sortition().message.type_matches_step() {
            return Err(ConsensusError::InvalidVote(format!(
                "{} vote in step {}",
                vote.vote_type(),
                vote.step()
            )));
        }
        // Round 1 proposes the null block by protocol; anywhere else a
        // null proposal is meaningless
        if vote.vote_type() == VoteType::Propose && vote.is_null_block() && vote.round() != 1 {
            return Err(ConsensusError::InvalidVote(
                "propose vote for the null block".into(),
            ));
        }
        Ok(())
    }

    /// The round consensus has moved to, judged from 2t+1 next votes: one
    /// past the highest round holding a next-vote quorum on a single
    /// value. `None` when no quorum beats `current_round`.
    pub fn determine_round(
        &self,
        period: PbftPeriod,
        current_round: PbftRound,
        two_t_plus_one: u64,
    ) -> Option<PbftRound> {
        let verified = self.verified.read();
        let rounds = verified.get(&period)?;

        for (&round, round_votes) in rounds.iter().rev() {
            if round + 1 <= current_round {
                break;
            }
            for (&step, step_votes) in round_votes.step_votes.iter() {
                if step < 4 {
                    continue;
                }
                for voted_value in step_votes.votes.values() {
                    if voted_value.weight >= two_t_plus_one {
                        return Some(round + 1);
                    }
                }
            }
        }
        None
    }

    /// The voted value (and votes) holding >= 2t+1 weight in a cell, with
    /// the vote set chosen greedily by descending single-vote weight for
    /// compact propagation.
    pub fn votes_bundle(
        &self,
        period: PbftPeriod,
        round: PbftRound,
        step: PbftStep,
        two_t_plus_one: u64,
    ) -> Option<(Hash, Vec<Arc<Vote>>)> {
        let verified = self.verified.read();
        let step_votes = verified.get(&period)?.get(&round)?.step_votes.get(&step)?;

        for (block_hash, voted_value) in step_votes.votes.iter() {
            if voted_value.weight < two_t_plus_one {
                continue;
            }
            let mut votes: Vec<Arc<Vote>> = voted_value.votes.values().cloned().collect();
            votes.sort_by(|a, b| {
                b.weight()
                    .unwrap_or(0)
                    .cmp(&a.weight().unwrap_or(0))
                    .then_with(|| a.hash().cmp(b.hash()))
            });

            let mut picked = Vec::new();
            let mut weight = 0u64;
            for vote in votes {
                weight += vote.weight().unwrap_or(0);
                picked.push(vote);
                if weight >= two_t_plus_one {
                    break;
                }
            }
            return Some((*block_hash, picked));
        }
        None
    }

    /// The recorded 2t+1 voted block for a quorum kind, if any.
    pub fn two_t_plus_one_voted_block(
        &self,
        period: PbftPeriod,
        round: PbftRound,
        kind: QuorumKind,
    ) -> Option<(Hash, PbftStep)> {
        let verified = self.verified.read();
        verified
            .get(&period)?
            .get(&round)?
            .two_t_plus_one_voted_blocks
            .get(&kind)
            .copied()
    }

    /// All votes behind a recorded 2t+1 quorum.
    pub fn two_t_plus_one_voted_block_votes(
        &self,
        period: PbftPeriod,
        round: PbftRound,
        kind: QuorumKind,
    ) -> Vec<Arc<Vote>> {
        let verified = self.verified.read();
        let Some(rounds) = verified.get(&period) else { return Vec::new() };
        let Some(round_votes) = rounds.get(&round) else { return Vec::new() };
        let Some((hash, step)) = round_votes.two_t_plus_one_voted_blocks.get(&kind) else {
            return Vec::new();
        };
        round_votes
            .step_votes
            .get(step)
            .and_then(|sv| sv.votes.get(hash))
            .map(|vv| vv.votes.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Highest step where t+1 weight of next votes has been observed.
    pub fn network_t_plus_one_step(
        &self,
        period: PbftPeriod,
        round: PbftRound,
    ) -> Option<PbftStep> {
        let verified = self.verified.read();
        verified.get(&period)?.get(&round)?.network_t_plus_one_step
    }

    /// All proposal votes of a round.
    pub fn proposal_votes(&self, period: PbftPeriod, round: PbftRound) -> Vec<Arc<Vote>> {
        let verified = self.verified.read();
        let Some(step_votes) = verified
            .get(&period)
            .and_then(|r| r.get(&round))
            .and_then(|rv| rv.step_votes.get(&1))
        else {
            return Vec::new();
        };
        step_votes
            .votes
            .values()
            .flat_map(|vv| vv.votes.values().cloned())
            .collect()
    }

    /// Erase every entry with `period < min_period`.
    pub fn prune(&self, min_period: PbftPeriod) {
        let mut verified = self.verified.write();
        verified.retain(|&period, _| period >= min_period);
    }

    /// Every verified vote, for warm-restart persistence and diagnostics.
    pub fn votes(&self) -> Vec<Arc<Vote>> {
        let verified = self.verified.read();
        verified
            .values()
            .flat_map(|rounds| rounds.values())
            .flat_map(|rv| rv.step_votes.values())
            .flat_map(|sv| sv.votes.values())
            .flat_map(|vv| vv.votes.values().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        let verified = self.verified.read();
        verified
            .values()
            .flat_map(|rounds| rounds.values())
            .flat_map(|rv| rv.step_votes.values())
            .map(|sv| sv.votes.values().map(|vv| vv.votes.len()).sum::<usize>())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
