//! Shared fixtures for consensus integration tests: a stake-table
//! execution engine, an in-memory DAG service and vote/block builders.
#![allow(dead_code)]

use parking_lot::{Mutex, RwLock};
use plexus_consensus::{DagOrder, ExecutionEngine, FinalizationResult, Result};
use plexus_core::{
    calculate_order_hash, DagBlock, Hash, PbftBlock, PbftPeriod, PeriodData, SortitionMessage,
    Transaction, Vote, VoteType, VrfSortition,
};
use plexus_crypto::vrf::VrfKeypair;
use plexus_crypto::{keccak256, Address, KeyPair};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

pub struct TestValidator {
    pub keypair: KeyPair,
    pub vrf: VrfKeypair,
    pub address: Address,
}

impl TestValidator {
    pub fn new(seed: u8) -> Self {
        let keypair = KeyPair::from_secret(&[seed; 32]).expect("valid secret");
        let vrf = VrfKeypair::from_seed(&[seed; 32]);
        let address = keypair.address();
        Self { keypair, vrf, address }
    }

    pub fn vote(
        &self,
        block_hash: Hash,
        period: PbftPeriod,
        round: u64,
        step: u64,
    ) -> Arc<Vote> {
        let message = SortitionMessage::new(VoteType::from_step(step), period, round, step);
        let sortition = VrfSortition::generate(&self.vrf, message);
        Arc::new(Vote::new(&self.keypair, sortition, block_hash).expect("sign vote"))
    }
}

/// Execution engine backed by a static stake table. With the committee
/// size above the total stake the sortition degenerates to weight ==
/// stake, which keeps quorum arithmetic exact in tests.
pub struct TestEngine {
    stakes: HashMap<Address, u64>,
    vrf_keys: HashMap<Address, [u8; 32]>,
    total: u64,
    pub finalized: Mutex<Vec<PbftPeriod>>,
}

impl TestEngine {
    pub fn new(validators: &[&TestValidator], stake: u64) -> Arc<Self> {
        let mut stakes = HashMap::new();
        let mut vrf_keys = HashMap::new();
        for validator in validators {
            stakes.insert(validator.address, stake);
            vrf_keys.insert(validator.address, validator.vrf.public_key);
        }
        Arc::new(Self {
            total: stake * validators.len() as u64,
            stakes,
            vrf_keys,
            finalized: Mutex::new(Vec::new()),
        })
    }
}

impl ExecutionEngine for TestEngine {
    fn finalize(&self, data: PeriodData) -> oneshot::Receiver<FinalizationResult> {
        let period = data.pbft_block.period();
        self.finalized.lock().push(period);
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(FinalizationResult {
            period,
            state_root: keccak256(&period.to_be_bytes()),
        });
        receiver
    }

    fn dpos_eligible_total_vote_count(&self, _period: PbftPeriod) -> Result<u64> {
        Ok(self.total)
    }

    fn dpos_eligible_vote_count(&self, _period: PbftPeriod, address: &Address) -> Result<u64> {
        Ok(self.stakes.get(address).copied().unwrap_or(0))
    }

    fn dpos_vrf_key(&self, _period: PbftPeriod, address: &Address) -> Result<[u8; 32]> {
        self.vrf_keys
            .get(address)
            .copied()
            .ok_or(plexus_consensus::ConsensusError::InvalidVrfProof)
    }

    fn transaction_finalized(&self, _hash: &Hash) -> bool {
        false
    }
}

/// In-memory DAG service.
#[derive(Default)]
pub struct TestDag {
    pub ghost: RwLock<Vec<Hash>>,
    pub blocks: RwLock<HashMap<Hash, DagBlock>>,
    pub orders: RwLock<HashMap<Hash, Vec<Hash>>>,
    pub transactions: RwLock<HashMap<Hash, Transaction>>,
}

impl TestDag {
    pub fn with_single_block(genesis: Hash) -> (Arc<Self>, Hash) {
        let dag = Self::default();
        let block = DagBlock::new(genesis, 1, vec![], vec![]);
        let hash = block.hash();
        dag.ghost.write().extend([genesis, hash]);
        dag.blocks.write().insert(hash, block);
        dag.orders.write().insert(hash, vec![hash]);
        (Arc::new(dag), hash)
    }
}

impl DagOrder for TestDag {
    fn ghost_path(&self, _anchor: &Hash) -> Vec<Hash> {
        self.ghost.read().clone()
    }

    fn dag_block_order(&self, anchor: &Hash, _period: PbftPeriod) -> Vec<Hash> {
        self.orders.read().get(anchor).cloned().unwrap_or_default()
    }

    fn block(&self, hash: &Hash) -> Option<DagBlock> {
        self.blocks.read().get(hash).cloned()
    }

    fn transaction(&self, hash: &Hash) -> Option<Transaction> {
        self.transactions.read().get(hash).cloned()
    }

    fn set_dag_block_order(&self, anchor: &Hash, _period: PbftPeriod, order: Vec<Hash>) {
        self.orders.write().insert(*anchor, order);
    }
}

/// A signed empty block extending `prev`, with a correct order hash over
/// empty DAG/tx sets.
pub fn empty_block(prev: Hash, period: PbftPeriod, proposer: &TestValidator) -> Arc<PbftBlock> {
    let order_hash = calculate_order_hash(&[], &[]);
    Arc::new(
        PbftBlock::new(prev, [2; 32], order_hash, period, proposer.address, period, &proposer.keypair)
            .expect("sign block"),
    )
}

/// Period data for an empty block, cert-voted by every given validator.
pub fn empty_period_data(
    prev: Hash,
    period: PbftPeriod,
    validators: &[TestValidator],
) -> PeriodData {
    let block = empty_block(prev, period, &validators[0]);
    let cert_votes = if period > 1 {
        validators.iter().map(|v| v.vote(*block.hash(), period, 1, 3)).collect()
    } else {
        Vec::new()
    };
    PeriodData::new(block, cert_votes, vec![], vec![], None)
}

/// A chain of `n` empty periods starting at the null head.
pub fn empty_chain(n: u64, validators: &[TestValidator]) -> Vec<PeriodData> {
    let mut prev = [0u8; 32];
    let mut chain = Vec::new();
    for period in 1..=n {
        let data = empty_period_data(prev, period, validators);
        prev = *data.pbft_block.hash();
        chain.push(data);
    }
    chain
}
