//! Serialized commit path: storage batch, execution, reward-vote rotation
//! and the pillar checkpoint hook.

use crate::chain::PbftChain;
use crate::interfaces::{ExecutionEngine, FinalizationResult, NetworkHandle};
use crate::next_votes::NextVotesManager;
use crate::pillar_votes::PillarVoteStore;
use crate::rewards_votes::RewardsVotes;
use crate::sync::{SyncBlockOutcome, SyncPipeline};
use crate::vote_store::VoteStore;
use crate::{ConsensusError, PbftConfig, Result};
use parking_lot::{Mutex, RwLock};
use plexus_core::{Hash, PbftPeriod, PeriodData, PillarBlock, PillarVote, NULL_BLOCK_HASH};
use plexus_crypto::KeyPair;
use plexus_storage::{ConsensusDb, MgrVotedValue, PbftHead};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Commits finalized blocks in period order. Commits are serialized by an
/// internal lock: the finalizer thread (sync path) and the state-machine
/// thread (cert path) both land here.
pub struct Finalizer {
    db: Arc<ConsensusDb>,
    chain: Arc<PbftChain>,
    vote_store: Arc<VoteStore>,
    next_votes: Arc<NextVotesManager>,
    rewards: Arc<RewardsVotes>,
    pillar_votes: Arc<PillarVoteStore>,
    engine: Arc<dyn ExecutionEngine>,
    network: NetworkHandle,
    keypair: Arc<KeyPair>,
    sync_level_size: u64,
    pillar_activation_period: u64,
    pillar_interval: u64,
    commit: Mutex<()>,
    last_pillar_hash: RwLock<Hash>,
    executed: AtomicBool,
}

impl Finalizer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &PbftConfig,
        db: Arc<ConsensusDb>,
        chain: Arc<PbftChain>,
        vote_store: Arc<VoteStore>,
        next_votes: Arc<NextVotesManager>,
        rewards: Arc<RewardsVotes>,
        pillar_votes: Arc<PillarVoteStore>,
        engine: Arc<dyn ExecutionEngine>,
        network: NetworkHandle,
        keypair: Arc<KeyPair>,
    ) -> Self {
        Self {
            db,
            chain,
            vote_store,
            next_votes,
            rewards,
            pillar_votes,
            engine,
            network,
            keypair,
            sync_level_size: config.sync_level_size,
            pillar_activation_period: config.pillar_activation_period,
            pillar_interval: config.pillar_interval,
            commit: Mutex::new(()),
            last_pillar_hash: RwLock::new(NULL_BLOCK_HASH),
            executed: AtomicBool::new(false),
        }
    }

    /// Whether a block has been finalized since the flag was last taken.
    /// The state machine consumes this to refresh its DPOS view.
    pub fn take_executed(&self) -> bool {
        self.executed.swap(false, Ordering::AcqRel)
    }

    /// Commit one finalized block. Fatal on storage or execution failure;
    /// a period gap is a programming error surfaced as an error value.
    pub fn finalize_block(&self, data: PeriodData) -> Result<FinalizationResult> {
        let _guard = self.commit.lock();

        let period = data.pbft_block.period();
        let expected = self.chain.tip_period() + 1;
        if period != expected {
            return Err(ConsensusError::PeriodGap { expected, got: period });
        }

        let block_hash = *data.pbft_block.hash();

        // 1-2. Storage batch: period data, head pointer, DAG block periods
        let mut batch = self.db.batch();
        self.db.put_period_data(&mut batch, period, &data)?;
        let head = PbftHead::new(&block_hash, period, data.pbft_block.prev_block_hash());
        self.db.put_head(&mut batch, &head)?;
        for dag_hash in data.dag_block_hashes() {
            self.db.put_dag_period(&mut batch, &dag_hash, period)?;
        }
        self.db
            .put_mgr_voted_value(&mut batch, MgrVotedValue::LastCertVotedValue, &NULL_BLOCK_HASH)?;

        // 3. In-memory head
        self.chain.update_head(&data.pbft_block);

        // 4. Execute and wait for the state root
        let cert_votes = data.cert_votes.clone();
        let receiver = self.engine.finalize(data);
        let result = receiver.blocking_recv().map_err(|_| {
            error!("execution engine dropped the finalization result for period {period}");
            ConsensusError::Shutdown
        })?;

        // 5. Commit
        self.db.commit(batch)?;

        // 6. Rotate reward votes: the just-committed cert votes become
        // canonical; extra candidates outside the new set stay tracked
        let canonical: HashSet<Hash> = cert_votes.iter().map(|v| *v.hash()).collect();
        let kept_extras = self
            .rewards
            .extra_candidates()
            .into_iter()
            .filter(|v| !canonical.contains(v.hash()))
            .collect();
        self.rewards.rotate(canonical, kept_extras);

        // 7. Housekeeping for the new tip. The warm-restart column is
        // rewritten with the surviving votes so it cannot grow unbounded.
        self.vote_store.prune(period);
        match self.db.clear_verified_votes() {
            Ok(()) => {
                for vote in self.vote_store.votes() {
                    if let Err(e) = self.db.put_verified_vote(&vote) {
                        warn!("failed to re-persist verified vote: {e}");
                        break;
                    }
                }
            }
            Err(e) => warn!("failed to compact verified votes: {e}"),
        }
        self.next_votes.clear();
        self.chain.cleanup_unverified_blocks(period);
        self.executed.store(true, Ordering::Release);

        info!(
            "finalized period {period}, block {}, state root {}",
            plexus_core::abridged(&block_hash),
            plexus_core::abridged(&result.state_root),
        );

        self.maybe_emit_pillar_block(period, &result.state_root)?;

        Ok(result)
    }

    /// At pillar boundaries, build the checkpoint block, vote on it with
    /// own stake and gossip the vote.
    fn maybe_emit_pillar_block(&self, period: PbftPeriod, state_root: &Hash) -> Result<()> {
        if period < self.pillar_activation_period || period % self.pillar_interval != 0 {
            return Ok(());
        }

        let previous = *self.last_pillar_hash.read();
        let pillar_block = PillarBlock::new(period, *state_root, previous);
        let pillar_hash = pillar_block.hash();
        *self.last_pillar_hash.write() = pillar_hash;

        let total = self.engine.dpos_eligible_total_vote_count(period)?;
        let threshold = total * 2 / 3 + 1;
        self.pillar_votes.initialize(period, threshold);
        self.pillar_votes
            .erase_below(period.saturating_sub(self.pillar_interval));

        let own_stake = self
            .engine
            .dpos_eligible_vote_count(period, &self.keypair.address())?;
        if own_stake > 0 {
            let vote = Arc::new(PillarVote::new(&self.keypair, period, pillar_hash)?);
            self.pillar_votes.insert(vote.clone(), own_stake)?;
            self.network.broadcast_pillar_vote(vote);
        }

        info!(
            "pillar block {} emitted at period {period} (threshold {threshold})",
            plexus_core::abridged(&pillar_hash)
        );
        Ok(())
    }

    /// Finalizer thread loop: drain the sync queue through the validation
    /// cascade in bursts of `sync_level_size`, rate-limited by the polling
    /// interval.
    pub fn run(&self, pipeline: &SyncPipeline, stop: &AtomicBool) {
        info!("finalizer running");
        while !stop.load(Ordering::Acquire) {
            let Some((data, peer)) = pipeline.queue().pop_wait(stop) else {
                break;
            };

            let mut processed = 0u64;
            let mut item = Some((data, peer));
            while let Some((data, peer)) = item.take() {
                match pipeline.process(data, peer) {
                    SyncBlockOutcome::Valid(data) => {
                        let period = data.pbft_block.period();
                        match self.finalize_block(data) {
                            Ok(_) => processed += 1,
                            Err(ConsensusError::Shutdown) => return,
                            Err(ConsensusError::PeriodGap { expected, got }) if got < expected => {
                                // Lost the race to the cert-vote commit
                                // path; the period is already in
                                debug!(
                                    "synced period {got} already finalized, next expected {expected}"
                                );
                            }
                            Err(e) => {
                                // Finalization failure leaves the node in
                                // an undefined state
                                panic!("FATAL: failed to finalize synced period {period}: {e}");
                            }
                        }
                    }
                    SyncBlockOutcome::AlreadySynced => {}
                    SyncBlockOutcome::Malicious => break,
                }
                if processed >= self.sync_level_size {
                    break;
                }
                item = pipeline.queue().try_pop();
            }

            if processed >= self.sync_level_size {
                // Burst cap reached; rate-limit before asking for more
                thread::sleep(Duration::from_millis(
                    plexus_core::constants::POLLING_INTERVAL_MS,
                ));
            }
        }
        info!("finalizer stopped");
    }
}
