//! External collaborator interfaces.
//!
//! The consensus core consumes an execution engine (finalization and the
//! DPOS stake view), a DAG ordering service, and a network adapter. The
//! network dependency is inverted: the core emits [`NetworkEvent`]s into a
//! channel and never calls into the transport, which breaks the state
//! machine / network reference cycle.

use crate::Result;
use plexus_core::{
    Address, DagBlock, Hash, PbftBlock, PbftPeriod, PbftRound, PeriodData, PillarVote,
    Transaction, Vote,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Identifier of a remote peer, as assigned by the transport layer.
pub type PeerId = [u8; 32];

/// Stake snapshot for a period, derived from the execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DposView {
    pub total_stake: u64,
    pub own_stake: u64,
    /// min(committee_size, total_stake)
    pub sortition_threshold: u64,
    /// Byzantine quorum over the sortition threshold
    pub two_t_plus_one: u64,
}

impl DposView {
    /// Derive the sortition threshold and quorum from a committee size and
    /// total stake: threshold = min(committee, total), 2t+1 = 2/3 + 1.
    pub fn derive(committee_size: u64, total_stake: u64, own_stake: u64) -> Self {
        let sortition_threshold = committee_size.min(total_stake);
        Self {
            total_stake,
            own_stake,
            sortition_threshold,
            two_t_plus_one: sortition_threshold * 2 / 3 + 1,
        }
    }
}

/// Result of executing one finalized period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizationResult {
    pub period: PbftPeriod,
    pub state_root: Hash,
}

/// The execution engine finalizes committed period data and serves the
/// DPOS stake view the sortition runs against.
pub trait ExecutionEngine: Send + Sync {
    /// Execute the period's contents. The returned channel resolves with
    /// the new state root once execution completes.
    fn finalize(&self, period_data: PeriodData) -> oneshot::Receiver<FinalizationResult>;

    /// Total eligible vote count at `period`. May fail with
    /// [`crate::ConsensusError::FutureExecution`] when the engine has not
    /// executed that far yet; callers retry after a polling interval.
    fn dpos_eligible_total_vote_count(&self, period: PbftPeriod) -> Result<u64>;

    /// Eligible vote count of one account at `period`.
    fn dpos_eligible_vote_count(&self, period: PbftPeriod, address: &Address) -> Result<u64>;

    /// The VRF public key an account registered for `period`.
    fn dpos_vrf_key(&self, period: PbftPeriod, address: &Address) -> Result<[u8; 32]>;

    /// Whether a transaction has already been finalized in an earlier
    /// period (excluded from order hashes).
    fn transaction_finalized(&self, hash: &Hash) -> bool;
}

/// Deterministic DAG ordering service.
pub trait DagOrder: Send + Sync {
    /// The ghost path from `anchor` towards the DAG frontier.
    fn ghost_path(&self, anchor: &Hash) -> Vec<Hash>;

    /// Hash-ordered DAG block closure under `anchor` for `period`.
    /// An empty result signals the DAG content is not yet available.
    fn dag_block_order(&self, anchor: &Hash, period: PbftPeriod) -> Vec<Hash>;

    /// Fetch a DAG block by hash.
    fn block(&self, hash: &Hash) -> Option<DagBlock>;

    /// Fetch a transaction body carried by the DAG.
    fn transaction(&self, hash: &Hash) -> Option<Transaction>;

    /// Record the finalized order of a period's DAG blocks.
    fn set_dag_block_order(&self, anchor: &Hash, period: PbftPeriod, order: Vec<Hash>);
}

/// Reasons the core may ask the network layer to (re)start syncing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequestReason {
    MissingDag,
    InvalidCertVotedBlock,
    InvalidSoftVotedBlock,
    ExceededMaxSteps,
}

/// Outbound actions emitted by the consensus core. The network adapter
/// drains this stream and maps each event onto the wire.
#[derive(Debug)]
pub enum NetworkEvent {
    BroadcastVote(Arc<Vote>),
    BroadcastVotesBundle(Vec<Arc<Vote>>),
    BroadcastPbftBlock(Arc<PbftBlock>),
    BroadcastPillarVote(Arc<PillarVote>),
    RequestPbftSync { peer: PeerId, from_period: PbftPeriod },
    RequestNextVotesSync { period: PbftPeriod, round: PbftRound },
    RestartSyncing { reason: SyncRequestReason, force: bool },
    MaliciousPeer(PeerId),
    DoubleVotingProof { first: Arc<Vote>, second: Arc<Vote> },
}

/// Cheaply cloneable sender half of the outbound event stream. Sends never
/// block; a closed receiver (tests, shutdown) drops events silently.
#[derive(Clone)]
pub struct NetworkHandle {
    sender: mpsc::UnboundedSender<NetworkEvent>,
}

impl NetworkHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn send(&self, event: NetworkEvent) {
        let _ = self.sender.send(event);
    }

    pub fn broadcast_vote(&self, vote: Arc<Vote>) {
        self.send(NetworkEvent::BroadcastVote(vote));
    }

    pub fn broadcast_votes_bundle(&self, votes: Vec<Arc<Vote>>) {
        self.send(NetworkEvent::BroadcastVotesBundle(votes));
    }

    pub fn broadcast_pbft_block(&self, block: Arc<PbftBlock>) {
        self.send(NetworkEvent::BroadcastPbftBlock(block));
    }

    pub fn broadcast_pillar_vote(&self, vote: Arc<PillarVote>) {
        self.send(NetworkEvent::BroadcastPillarVote(vote));
    }

    pub fn request_pbft_sync(&self, peer: PeerId, from_period: PbftPeriod) {
        self.send(NetworkEvent::RequestPbftSync { peer, from_period });
    }

    pub fn request_next_votes_sync(&self, period: PbftPeriod, round: PbftRound) {
        self.send(NetworkEvent::RequestNextVotesSync { period, round });
    }

    pub fn restart_syncing(&self, reason: SyncRequestReason, force: bool) {
        self.send(NetworkEvent::RestartSyncing { reason, force });
    }

    pub fn handle_malicious_peer(&self, peer: PeerId) {
        self.send(NetworkEvent::MaliciousPeer(peer));
    }

    pub fn submit_double_voting_proof(&self, first: Arc<Vote>, second: Arc<Vote>) {
        self.send(NetworkEvent::DoubleVotingProof { first, second });
    }
}
