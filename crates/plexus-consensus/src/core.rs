//! The consensus core aggregate.
//!
//! Owns every store plus the state-machine and finalizer threads, and is
//! the single entry point for packet ingress: network threads normalize
//! incoming packets to core types and call the `handle_*` methods here.

use crate::chain::PbftChain;
use crate::finalizer::Finalizer;
use crate::interfaces::{DagOrder, ExecutionEngine, NetworkEvent, NetworkHandle, PeerId};
use crate::next_votes::NextVotesManager;
use crate::pillar_votes::PillarVoteStore;
use crate::rewards_votes::RewardsVotes;
use crate::state_machine::PbftStateMachine;
use crate::sync::{SyncPipeline, SyncQueue};
use crate::vote_store::{InsertResult, VoteStore};
use crate::{ConsensusError, PbftConfig, Result};
use parking_lot::Mutex;
use plexus_core::{Hash, PacketEnvelope, PbftBlock, PeriodData, PillarVote, Vote, VoteType};
use plexus_crypto::vrf::VrfKeypair;
use plexus_crypto::KeyPair;
use plexus_storage::ConsensusDb;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// All consensus state, shared by reference between the state-machine
/// thread, the finalizer thread and the network ingress threads.
pub struct ConsensusCore {
    pub config: PbftConfig,
    pub db: Arc<ConsensusDb>,
    pub chain: Arc<PbftChain>,
    pub vote_store: Arc<VoteStore>,
    pub next_votes: Arc<NextVotesManager>,
    pub rewards_votes: Arc<RewardsVotes>,
    pub pillar_votes: Arc<PillarVoteStore>,
    pub sync_queue: Arc<SyncQueue>,
    pub finalizer: Arc<Finalizer>,
    pub state_machine: Arc<PbftStateMachine>,
    pipeline: Arc<SyncPipeline>,
    engine: Arc<dyn ExecutionEngine>,
    network: NetworkHandle,
    stop: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsensusCore {
    /// Wire up the aggregate. Returns the core and the outbound network
    /// event stream for the network adapter to drain.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PbftConfig,
        db: Arc<ConsensusDb>,
        keypair: KeyPair,
        vrf_keypair: VrfKeypair,
        dag_genesis: Hash,
        engine: Arc<dyn ExecutionEngine>,
        dag: Arc<dyn DagOrder>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<NetworkEvent>)> {
        let (network, events) = NetworkHandle::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let keypair = Arc::new(keypair);
        let vrf_keypair = Arc::new(vrf_keypair);

        let chain = Arc::new(PbftChain::load(db.clone())?);
        let vote_store = Arc::new(VoteStore::new(&config, engine.clone(), Some(db.clone())));
        let next_votes = Arc::new(NextVotesManager::new());
        let rewards_votes = Arc::new(RewardsVotes::new());
        let pillar_votes = Arc::new(PillarVoteStore::new());
        let sync_queue = Arc::new(SyncQueue::new());

        let finalizer = Arc::new(Finalizer::new(
            &config,
            db.clone(),
            chain.clone(),
            vote_store.clone(),
            next_votes.clone(),
            rewards_votes.clone(),
            pillar_votes.clone(),
            engine.clone(),
            network.clone(),
            keypair.clone(),
        ));

        let pipeline = Arc::new(SyncPipeline::new(
            &config,
            sync_queue.clone(),
            chain.clone(),
            engine.clone(),
            network.clone(),
        ));

        let state_machine = Arc::new(PbftStateMachine::new(
            config.clone(),
            keypair,
            vrf_keypair,
            dag_genesis,
            db.clone(),
            chain.clone(),
            vote_store.clone(),
            next_votes.clone(),
            finalizer.clone(),
            sync_queue.clone(),
            engine.clone(),
            dag,
            network.clone(),
            stop.clone(),
        ));

        let core = Arc::new(Self {
            config,
            db,
            chain,
            vote_store,
            next_votes,
            rewards_votes,
            pillar_votes,
            sync_queue,
            finalizer,
            state_machine,
            pipeline,
            engine,
            network,
            stop,
            threads: Mutex::new(Vec::new()),
        });
        Ok((core, events))
    }

    /// Spawn the state-machine and finalizer threads.
    pub fn start(self: &Arc<Self>) {
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return;
        }

        let finalizer = self.finalizer.clone();
        let pipeline = self.pipeline.clone();
        let stop = self.stop.clone();
        threads.push(
            std::thread::Builder::new()
                .name("plexus-finalizer".into())
                .spawn(move || finalizer.run(&pipeline, &stop))
                .expect("spawn finalizer thread"),
        );

        let state_machine = self.state_machine.clone();
        threads.push(
            std::thread::Builder::new()
                .name("plexus-pbft".into())
                .spawn(move || state_machine.run())
                .expect("spawn pbft thread"),
        );

        info!("consensus core started");
    }

    /// Raise the stop flag, wake every sleeping thread and join them.
    /// In-flight inserts complete; no store is left inconsistent.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.state_machine.notify();
        self.sync_queue.notify();

        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            if handle.join().is_err() {
                warn!("consensus thread panicked during shutdown");
            }
        }
        info!("consensus core stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    // ── packet ingress ──────────────────────────────────────────────────

    /// Ingest one vote from the network. Double votes are answered with a
    /// slashing proof; validation failures bubble up so the packet layer
    /// can penalize the sender.
    pub fn handle_vote(&self, vote: Arc<Vote>) -> Result<()> {
        match self.vote_store.insert(vote.clone())? {
            InsertResult::Inserted { new_two_t_plus_one } => {
                if let Some((kind, hash, step)) = new_two_t_plus_one {
                    debug!(
                        "ingress vote completed {kind:?} quorum for {} at step {step}",
                        plexus_core::abridged(&hash)
                    );
                }
                // Reward votes stay gossip-worthy until claimed
                if vote.vote_type() == VoteType::Cert
                    && self.rewards_votes.is_new_vote(vote.hash())
                {
                    self.network.broadcast_vote(vote);
                }
                Ok(())
            }
            InsertResult::Duplicate => Ok(()),
            InsertResult::DoubleVote { existing } => {
                warn!(
                    "double vote detected: {} conflicts with {}",
                    plexus_core::abridged(vote.hash()),
                    plexus_core::abridged(existing.hash())
                );
                self.network.submit_double_voting_proof(existing, vote);
                Ok(())
            }
        }
    }

    /// Ingest a votes bundle (already normalized to current types).
    pub fn handle_votes_bundle(&self, votes: Vec<Arc<Vote>>) -> Result<()> {
        for vote in votes {
            self.handle_vote(vote)?;
        }
        Ok(())
    }

    /// Decode and ingest a version-tagged votes packet.
    pub fn handle_vote_packet(&self, envelope: &PacketEnvelope) -> Result<()> {
        let votes = envelope.decode_votes()?;
        self.handle_votes_bundle(votes)
    }

    /// Track a gossiped PBFT block proposal.
    pub fn handle_pbft_block(&self, block: Arc<PbftBlock>) {
        self.chain.push_unverified_block(block);
    }

    /// Queue peer-supplied finalized period data. Returns whether the
    /// block was accepted into the in-order queue.
    pub fn handle_period_data(&self, data: PeriodData, peer: PeerId) -> bool {
        self.sync_queue.push(data, peer, self.chain.tip_period())
    }

    /// Ingest a pillar vote: check the checkpoint window, weigh the
    /// validator's stake and aggregate.
    pub fn handle_pillar_vote(&self, vote: Arc<PillarVote>) -> Result<bool> {
        if vote.period() < self.config.pillar_activation_period {
            return Err(ConsensusError::OutOfBounds(format!(
                "pillar vote period {} predates activation",
                vote.period()
            )));
        }
        if !self.pillar_votes.is_initialized(vote.period()) {
            return Err(ConsensusError::PillarPeriodUninitialized(vote.period()));
        }

        let voter = vote.voter().map_err(|_| ConsensusError::InvalidSignature)?;
        let stake = self.engine.dpos_eligible_vote_count(vote.period(), &voter)?;
        if stake == 0 {
            return Err(ConsensusError::InsufficientStake);
        }
        self.pillar_votes.insert(vote, stake)
    }
}
