//! In-memory view of the finalized PBFT chain plus the unverified
//! (proposed, not yet finalized) block table.

use crate::{ConsensusError, Result};
use parking_lot::RwLock;
use plexus_core::{Hash, PbftBlock, PbftPeriod, NULL_BLOCK_HASH};
use plexus_storage::ConsensusDb;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Chain head state. Only the finalizer mutates it; everyone else reads.
pub struct PbftChain {
    db: Arc<ConsensusDb>,
    head_hash: RwLock<Hash>,
    tip_period: AtomicU64,
    unverified: RwLock<HashMap<Hash, Arc<PbftBlock>>>,
}

impl PbftChain {
    /// Load the chain head from storage (genesis state when absent).
    pub fn load(db: Arc<ConsensusDb>) -> Result<Self> {
        let (head_hash, tip_period) = match db.head()? {
            Some(head) => {
                let mut hash = NULL_BLOCK_HASH;
                let decoded = hex::decode(&head.block_hash)
                    .map_err(|e| ConsensusError::InvalidBlockPayload(format!("head hash: {e}")))?;
                if decoded.len() != 32 {
                    return Err(ConsensusError::InvalidBlockPayload("head hash width".into()));
                }
                hash.copy_from_slice(&decoded);
                (hash, head.period)
            }
            None => (NULL_BLOCK_HASH, 0),
        };
        info!(
            "PBFT chain loaded at period {tip_period}, head {}",
            plexus_core::abridged(&head_hash)
        );
        Ok(Self {
            db,
            head_hash: RwLock::new(head_hash),
            tip_period: AtomicU64::new(tip_period),
            unverified: RwLock::new(HashMap::new()),
        })
    }

    pub fn last_block_hash(&self) -> Hash {
        *self.head_hash.read()
    }

    /// Period of the last finalized block (0 before genesis).
    pub fn tip_period(&self) -> PbftPeriod {
        self.tip_period.load(Ordering::Acquire)
    }

    /// Whether a PBFT block has been finalized into the chain.
    pub fn find_block_in_chain(&self, block_hash: &Hash) -> bool {
        self.db.block_period(block_hash).ok().flatten().is_some()
    }

    /// Structural validation against the current head: parent linkage and
    /// period continuity, plus a recoverable author signature.
    pub fn check_block_validation(&self, block: &PbftBlock) -> Result<()> {
        if *block.prev_block_hash() != self.last_block_hash() {
            return Err(ConsensusError::InvalidBlockPayload(format!(
                "previous hash {} does not extend head {}",
                plexus_core::abridged(block.prev_block_hash()),
                plexus_core::abridged(&self.last_block_hash()),
            )));
        }
        if block.period() != self.tip_period() + 1 {
            return Err(ConsensusError::InvalidBlockPayload(format!(
                "block period {} does not extend tip {}",
                block.period(),
                self.tip_period(),
            )));
        }
        block
            .author()
            .map_err(|_| ConsensusError::InvalidBlockPayload("unrecoverable author".into()))?;
        Ok(())
    }

    /// Track a proposed block until it is finalized or superseded.
    pub fn push_unverified_block(&self, block: Arc<PbftBlock>) {
        self.unverified.write().insert(*block.hash(), block);
    }

    pub fn unverified_block(&self, block_hash: &Hash) -> Option<Arc<PbftBlock>> {
        self.unverified.read().get(block_hash).cloned()
    }

    /// Drop unverified blocks at or below the finalized period.
    pub fn cleanup_unverified_blocks(&self, finalized_period: PbftPeriod) {
        self.unverified
            .write()
            .retain(|_, block| block.period() > finalized_period);
    }

    /// Advance the head. Only the finalizer calls this, after the storage
    /// batch for the block has been prepared.
    pub fn update_head(&self, block: &PbftBlock) {
        *self.head_hash.write() = *block.hash();
        self.tip_period.store(block.period(), Ordering::Release);
    }
}
