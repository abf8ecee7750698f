//! # Plexus Storage
//!
//! RocksDB persistence for the consensus core: the finalized chain
//! (period data and head pointer), and the PBFT manager's crash-recovery
//! state (round/step fields, voted values, per-round vote bundles and the
//! verified-vote warm-restart set).

pub mod db;
pub mod error;

pub use db::{ConsensusDb, MgrField, MgrStatus, MgrVotedValue, PbftHead};
pub use error::{Result, StorageError};
