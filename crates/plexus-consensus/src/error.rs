use plexus_core::{Hash, PbftPeriod};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid VRF proof")]
    InvalidVrfProof,

    #[error("Insufficient stake: vote weight is zero")]
    InsufficientStake,

    #[error("Invalid vote: {0}")]
    InvalidVote(String),

    #[error("Vote out of accepting bounds: {0}")]
    OutOfBounds(String),

    #[error("DAG content missing for anchor {0}")]
    MissingDag(String),

    #[error("Invalid block payload: {0}")]
    InvalidBlockPayload(String),

    #[error("Order hash mismatch: declared {declared}, computed {computed}")]
    OrderHashMismatch { declared: String, computed: String },

    #[error("Not enough valid cert votes: have weight {have}, need {need}")]
    CertVotesShort { have: u64, need: u64 },

    #[error("Period gap in finalization: expected {expected}, got {got}")]
    PeriodGap { expected: PbftPeriod, got: PbftPeriod },

    #[error("Execution engine is behind the requested period")]
    FutureExecution,

    #[error("Shutdown requested")]
    Shutdown,

    #[error("Pillar period {0} not initialized")]
    PillarPeriodUninitialized(PbftPeriod),

    #[error("Storage error: {0}")]
    Storage(#[from] plexus_storage::StorageError),

    #[error("Core error: {0}")]
    Core(#[from] plexus_core::CoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] plexus_crypto::CryptoError),
}

impl ConsensusError {
    pub fn order_hash_mismatch(declared: &Hash, computed: &Hash) -> Self {
        ConsensusError::OrderHashMismatch {
            declared: hex::encode(declared),
            computed: hex::encode(computed),
        }
    }

    pub fn missing_dag(anchor: &Hash) -> Self {
        ConsensusError::MissingDag(hex::encode(anchor))
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
