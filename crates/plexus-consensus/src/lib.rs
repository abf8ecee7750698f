//! # Plexus Consensus
//!
//! The consensus core of the Plexus DAG + PBFT node: VRF sortition drives
//! vote weights, a five-step PBFT round machine drives agreement, shared
//! vote stores enforce uniqueness and 2t+1 tallying, and a sync pipeline
//! plus finalizer commit finalized periods in order.

pub mod chain;
pub mod config;
pub mod core;
pub mod error;
pub mod finalizer;
pub mod interfaces;
pub mod next_votes;
pub mod pillar_votes;
pub mod rewards_votes;
pub mod state_machine;
pub mod sync;
pub mod vote_store;

pub use crate::core::ConsensusCore;
pub use chain::PbftChain;
pub use config::{ChainConfig, PbftConfig};
pub use error::{ConsensusError, Result};
pub use finalizer::Finalizer;
pub use interfaces::{
    DagOrder, DposView, ExecutionEngine, FinalizationResult, NetworkEvent, NetworkHandle, PeerId,
    SyncRequestReason,
};
pub use next_votes::NextVotesManager;
pub use pillar_votes::PillarVoteStore;
pub use rewards_votes::RewardsVotes;
pub use state_machine::{PbftStateMachine, PbftState};
pub use sync::{SyncBlockOutcome, SyncPipeline, SyncQueue};
pub use vote_store::{InsertResult, QuorumKind, VoteStore};

/// Install a tracing subscriber honoring `RUST_LOG`, for binaries and
/// integration tests. Safe to call more than once.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}
