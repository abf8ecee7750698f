//! Reward-vote accounting.
//!
//! Cert votes that finalized the previous block earn rewards when they are
//! included in DAG blocks. Three disjoint sets track the lifecycle: the
//! canonical 2t+1 set from the last finalization, the subset not yet
//! claimed by any DAG block, and extra candidates DAG blocks introduced
//! beyond the canonical set (persisted with the next period's data so
//! sync stays complete).

use parking_lot::RwLock;
use plexus_core::{Hash, Vote};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
pub struct RewardsVotes {
    /// 2t+1 cert votes from the previous finalized period.
    canonical: RwLock<HashSet<Hash>>,
    /// Canonical votes not yet included in any DAG block for reward.
    unrewarded: RwLock<HashSet<Hash>>,
    /// Cert votes DAG blocks claimed as reward candidates beyond the
    /// canonical set, keyed by vote hash.
    extra_candidates: RwLock<HashMap<Hash, Arc<Vote>>>,
}

impl RewardsVotes {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the vote is in neither the canonical set nor the extra
    /// candidates, i.e. worth gossiping and tracking.
    pub fn is_new_vote(&self, vote_hash: &Hash) -> bool {
        if self.canonical.read().contains(vote_hash) {
            return false;
        }
        !self.extra_candidates.read().contains_key(vote_hash)
    }

    /// Record a cert vote some DAG block claimed as a reward candidate
    /// outside the canonical set.
    pub fn insert_extra_candidate(&self, vote: Arc<Vote>) {
        self.extra_candidates.write().insert(*vote.hash(), vote);
    }

    /// Mark canonical votes as claimed by a DAG block (created locally or
    /// received), removing them from the unrewarded set.
    pub fn mark_rewarded(&self, vote_hashes: &[Hash]) {
        let mut unrewarded = self.unrewarded.write();
        for hash in vote_hashes {
            unrewarded.remove(hash);
        }
    }

    /// Canonical votes still waiting for inclusion, e.g. to pack into the
    /// next self-produced DAG block.
    pub fn unrewarded(&self) -> Vec<Hash> {
        self.unrewarded.read().iter().copied().collect()
    }

    /// Extra candidates to persist alongside the next period's data.
    pub fn extra_candidates(&self) -> Vec<Arc<Vote>> {
        self.extra_candidates.read().values().cloned().collect()
    }

    /// Rotate on finalization: the just-committed cert votes become the
    /// canonical set (all initially unrewarded), and the extra candidates
    /// reset to those included by the just-finalized DAG blocks.
    pub fn rotate(&self, new_canonical: HashSet<Hash>, included_extras: Vec<Arc<Vote>>) {
        {
            let mut unrewarded = self.unrewarded.write();
            *unrewarded = new_canonical.clone();
        }
        {
            let mut canonical = self.canonical.write();
            *canonical = new_canonical;
        }
        let mut extra = self.extra_candidates.write();
        extra.clear();
        for vote in included_extras {
            extra.insert(*vote.hash(), vote);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_resets_sets() {
        let rewards = RewardsVotes::new();
        let hashes: HashSet<Hash> = [[1u8; 32], [2u8; 32]].into_iter().collect();

        rewards.rotate(hashes.clone(), vec![]);

        assert!(!rewards.is_new_vote(&[1u8; 32]));
        assert!(rewards.is_new_vote(&[9u8; 32]));
        assert_eq!(rewards.unrewarded().len(), 2);

        rewards.mark_rewarded(&[[1u8; 32]]);
        assert_eq!(rewards.unrewarded(), vec![[2u8; 32]]);

        // Next rotation replaces everything
        rewards.rotate([[3u8; 32]].into_iter().collect(), vec![]);
        assert!(rewards.is_new_vote(&[1u8; 32]));
        assert_eq!(rewards.unrewarded(), vec![[3u8; 32]]);
    }
}
