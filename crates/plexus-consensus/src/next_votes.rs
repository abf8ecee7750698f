//! Previous-round next-vote carry-over.
//!
//! When a round completes with 2t+1 next votes, round N+1 must respect the
//! converged value. This manager holds the most recently completed round's
//! next votes, the aggregate voted value, and whether the null block also
//! reached quorum (a voter may legitimately contribute one of each in a
//! second finishing step).

use parking_lot::Mutex;
use plexus_core::{Address, Hash, Vote, NULL_BLOCK_HASH};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Default)]
struct Inner {
    votes: HashMap<Hash, Arc<Vote>>,
    unique_voters: HashMap<Address, Vec<Arc<Vote>>>,
    voted_value: Option<Hash>,
    enough_for_null: bool,
    weight: u64,
}

/// Carries 2t+1 next votes from the previous round across a round advance.
#[derive(Default)]
pub struct NextVotesManager {
    inner: Mutex<Inner>,
}

impl NextVotesManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the held set with `new_votes` merged over the current set,
    /// provided the merged set reaches `two_t_plus_one` on the null block
    /// or on exactly one specific value. Insufficient input is a no-op;
    /// returns whether the update was applied.
    pub fn update(&self, new_votes: &[Arc<Vote>], two_t_plus_one: u64) -> bool {
        let mut inner = self.inner.lock();

        // Build the candidate merged set
        let mut votes = inner.votes.clone();
        let mut unique_voters = inner.unique_voters.clone();
        for vote in new_votes {
            if vote.step() < 4 {
                warn!(
                    "skipping non-next vote {} in next-votes update",
                    plexus_core::abridged(vote.hash())
                );
                continue;
            }
            let Ok(voter) = vote.voter() else {
                warn!(
                    "skipping next vote {} with unrecoverable voter",
                    plexus_core::abridged(vote.hash())
                );
                continue;
            };
            if votes.contains_key(vote.hash()) {
                continue;
            }
            let held = unique_voters.entry(voter).or_default();
            // At most two votes per voter, one for the null block and one
            // for a specific value
            let acceptable = held.is_empty()
                || (held.len() == 1 && held[0].is_null_block() != vote.is_null_block());
            if !acceptable {
                warn!(
                    "skipping conflicting next vote {} from {}",
                    plexus_core::abridged(vote.hash()),
                    hex::encode(voter)
                );
                continue;
            }
            held.push(vote.clone());
            votes.insert(*vote.hash(), vote.clone());
        }

        // Aggregate weights per voted value
        let mut weights: HashMap<Hash, u64> = HashMap::new();
        let mut total = 0u64;
        for vote in votes.values() {
            let weight = vote.weight().unwrap_or(0);
            *weights.entry(*vote.block_hash()).or_default() += weight;
            total += weight;
        }

        let enough_for_null = weights
            .get(&NULL_BLOCK_HASH)
            .is_some_and(|w| *w >= two_t_plus_one);
        let specific: Vec<Hash> = weights
            .iter()
            .filter(|(hash, weight)| **hash != NULL_BLOCK_HASH && **weight >= two_t_plus_one)
            .map(|(hash, _)| *hash)
            .collect();

        let voted_value = match specific.as_slice() {
            [hash] => Some(*hash),
            [] => None,
            _ => {
                // Two specific quorums cannot coexist under an honest
                // super-majority; keep the previous state
                warn!("multiple specific next-vote quorums, rejecting update");
                return false;
            }
        };

        if !enough_for_null && voted_value.is_none() {
            debug!("next-votes update below 2t+1, keeping previous round state");
            return false;
        }

        inner.votes = votes;
        inner.unique_voters = unique_voters;
        inner.voted_value = voted_value;
        inner.enough_for_null = enough_for_null;
        inner.weight = total;
        debug!(
            "next votes updated: weight {total}, voted value {:?}, null quorum {enough_for_null}",
            inner.voted_value.map(|h| plexus_core::abridged(&h)),
        );
        true
    }

    /// The specific (non-null) value holding 2t+1, if any.
    pub fn voted_value(&self) -> Option<Hash> {
        self.inner.lock().voted_value
    }

    /// Whether the null block holds 2t+1.
    pub fn have_enough_for_null(&self) -> bool {
        self.inner.lock().enough_for_null
    }

    /// All held next votes, for rebroadcast and persistence.
    pub fn bundle(&self) -> Vec<Arc<Vote>> {
        self.inner.lock().votes.values().cloned().collect()
    }

    /// Total held weight.
    pub fn weight(&self) -> u64 {
        self.inner.lock().weight
    }

    /// Reset on period advance.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        *inner = Inner::default();
    }
}
