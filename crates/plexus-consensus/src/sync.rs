//! Sync pipeline: ingesting peer-supplied finalized blocks.
//!
//! Peers push `PeriodData` bundles into an in-order queue; the finalizer
//! thread pops them and runs the validation cascade before committing.
//! Any cascade failure marks the source peer malicious, clears the queue
//! and restarts syncing from another peer.

use crate::chain::PbftChain;
use crate::interfaces::{ExecutionEngine, NetworkHandle, PeerId, SyncRequestReason};
use crate::{ConsensusError, PbftConfig, Result};
use parking_lot::{Condvar, Mutex};
use plexus_core::{calculate_order_hash, Hash, PbftPeriod, PeriodData, VoteType};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// In-order queue of peer-supplied period data.
pub struct SyncQueue {
    inner: Mutex<VecDeque<(PeriodData, PeerId)>>,
    available: Condvar,
}

impl Default for SyncQueue {
    fn default() -> Self {
        Self { inner: Mutex::new(VecDeque::new()), available: Condvar::new() }
    }
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest queued period, if any.
    pub fn period(&self) -> Option<PbftPeriod> {
        self.inner.lock().back().map(|(data, _)| data.pbft_block.period())
    }

    /// Push period data if it extends max(queue tail, chain tip) by
    /// exactly one. Out-of-order periods are refused; the network layer
    /// re-requests them once the gap closes.
    pub fn push(&self, data: PeriodData, peer: PeerId, chain_period: PbftPeriod) -> bool {
        let mut queue = self.inner.lock();
        let tail = queue.back().map(|(d, _)| d.pbft_block.period()).unwrap_or(chain_period);
        let expected = tail + 1;
        let period = data.pbft_block.period();
        if period != expected {
            debug!("refusing out-of-order sync block: period {period}, expected {expected}");
            return false;
        }
        queue.push_back((data, peer));
        self.available.notify_all();
        true
    }

    /// Pop the next item, waiting until one arrives or `stop` is raised.
    pub fn pop_wait(&self, stop: &AtomicBool) -> Option<(PeriodData, PeerId)> {
        let mut queue = self.inner.lock();
        loop {
            if let Some(item) = queue.pop_front() {
                return Some(item);
            }
            if stop.load(Ordering::Acquire) {
                return None;
            }
            self.available.wait_for(&mut queue, Duration::from_millis(100));
        }
    }

    /// Pop without waiting.
    pub fn try_pop(&self) -> Option<(PeriodData, PeerId)> {
        self.inner.lock().pop_front()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Wake all waiters (shutdown).
    pub fn notify(&self) {
        self.available.notify_all();
    }
}


/// Outcome of validating one queued sync block.
pub enum SyncBlockOutcome {
    /// Passed the cascade; ready for the finalizer.
    Valid(PeriodData),
    /// Already in the chain; skip silently.
    AlreadySynced,
    /// Failed validation; the peer was penalized and the queue cleared.
    Malicious,
}

/// Validates peer-supplied period data against the local chain view.
pub struct SyncPipeline {
    queue: Arc<SyncQueue>,
    chain: Arc<PbftChain>,
    engine: Arc<dyn ExecutionEngine>,
    network: NetworkHandle,
    committee_size: u64,
}

impl SyncPipeline {
    pub fn new(
        config: &PbftConfig,
        queue: Arc<SyncQueue>,
        chain: Arc<PbftChain>,
        engine: Arc<dyn ExecutionEngine>,
        network: NetworkHandle,
    ) -> Self {
        Self { queue, chain, engine, network, committee_size: config.committee_size }
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    /// Run the validation cascade on one queued item.
    pub fn process(&self, data: PeriodData, peer: PeerId) -> SyncBlockOutcome {
        let block_hash = *data.pbft_block.hash();
        let period = data.pbft_block.period();

        if period <= self.chain.tip_period() || self.chain.find_block_in_chain(&block_hash) {
            debug!(
                "sync block {} (period {period}) already present",
                plexus_core::abridged(&block_hash)
            );
            return SyncBlockOutcome::AlreadySynced;
        }

        match self.validate(&data) {
            Ok(()) => SyncBlockOutcome::Valid(data),
            Err(e) => {
                error!(
                    "sync block {} (period {period}) from peer {} failed validation: {e}",
                    plexus_core::abridged(&block_hash),
                    hex::encode(&peer[..4]),
                );
                self.queue.clear();
                self.network.handle_malicious_peer(peer);
                self.network.restart_syncing(SyncRequestReason::InvalidCertVotedBlock, true);
                SyncBlockOutcome::Malicious
            }
        }
    }

    fn validate(&self, data: &PeriodData) -> Result<()> {
        let block = &data.pbft_block;
        let block_hash = *block.hash();

        // 1. Chain linkage
        if *block.prev_block_hash() != self.chain.last_block_hash() {
            return Err(ConsensusError::InvalidBlockPayload(format!(
                "previous hash {} does not extend head {}",
                plexus_core::abridged(block.prev_block_hash()),
                plexus_core::abridged(&self.chain.last_block_hash()),
            )));
        }

        // 2. Cert votes certify this block
        for vote in &data.cert_votes {
            if vote.block_hash() != &block_hash {
                return Err(ConsensusError::InvalidBlockPayload(format!(
                    "cert vote {} is for {}, not the enclosed block",
                    plexus_core::abridged(vote.hash()),
                    plexus_core::abridged(vote.block_hash()),
                )));
            }
        }

        // 3. Order hash over the DAG closure and its non-finalized txs
        self.validate_order_hash(data)?;

        // 4. Cert vote cryptography and quorum (skipped for the
        // bootstrapped first period, which carries no votes)
        if block.period() > 1 {
            self.validate_cert_votes(data)?;
        }

        Ok(())
    }

    fn validate_order_hash(&self, data: &PeriodData) -> Result<()> {
        let dag_hashes = data.dag_block_hashes();

        let mut seen = HashSet::new();
        let mut expected_txs: Vec<Hash> = Vec::new();
        for dag_block in &data.dag_blocks {
            for trx in &dag_block.trxs {
                if seen.insert(*trx) && !self.engine.transaction_finalized(trx) {
                    expected_txs.push(*trx);
                }
            }
        }

        let carried: Vec<Hash> = data.transaction_hashes();
        if carried != expected_txs {
            return Err(ConsensusError::InvalidBlockPayload(
                "carried transactions disagree with the DAG closure".into(),
            ));
        }

        let computed = calculate_order_hash(&dag_hashes, &expected_txs);
        if computed != *data.pbft_block.order_hash() {
            return Err(ConsensusError::order_hash_mismatch(
                data.pbft_block.order_hash(),
                &computed,
            ));
        }
        Ok(())
    }

    fn validate_cert_votes(&self, data: &PeriodData) -> Result<()> {
        let period = data.pbft_block.period();
        let total = self.engine.dpos_eligible_total_vote_count(period)?;
        let threshold = self.committee_size.min(total);
        let two_t_plus_one = threshold * 2 / 3 + 1;

        let mut weight = 0u64;
        let mut voters = HashSet::new();
        for vote in &data.cert_votes {
            if vote.vote_type() != VoteType::Cert || vote.step() != 3 || vote.period() != period {
                return Err(ConsensusError::InvalidVote(format!(
                    "cert vote {} has wrong (type, period, step)",
                    plexus_core::abridged(vote.hash())
                )));
            }
            let voter = vote.voter().map_err(|_| ConsensusError::InvalidSignature)?;
            if !voters.insert(voter) {
                return Err(ConsensusError::InvalidVote(format!(
                    "duplicate cert voter {}",
                    hex::encode(voter)
                )));
            }
            let vrf_key = self.engine.dpos_vrf_key(period, &voter)?;
            vote.sortition()
                .verify(&vrf_key)
                .map_err(|_| ConsensusError::InvalidVrfProof)?;
            let stake = self.engine.dpos_eligible_vote_count(period, &voter)?;
            let vote_weight = vote.calculate_weight(stake, total, threshold)?;
            if vote_weight == 0 {
                return Err(ConsensusError::InsufficientStake);
            }
            weight += vote_weight;
        }

        if weight < two_t_plus_one {
            warn!(
                "synced block {} cert weight {weight} below quorum {two_t_plus_one}",
                plexus_core::abridged(data.pbft_block.hash())
            );
            return Err(ConsensusError::CertVotesShort { have: weight, need: two_t_plus_one });
        }

        info!(
            "synced block {} validated with cert weight {weight} (quorum {two_t_plus_one})",
            plexus_core::abridged(data.pbft_block.hash())
        );
        Ok(())
    }
}
