//! Sync pipeline scenarios: ordered bursts, malicious payloads.

mod common;

use common::{empty_block, empty_chain, empty_period_data, TestEngine, TestValidator};
use plexus_consensus::{
    Finalizer, NetworkEvent, NetworkHandle, NextVotesManager, PbftChain, PbftConfig,
    PillarVoteStore, RewardsVotes, SyncBlockOutcome, SyncPipeline, SyncQueue, VoteStore,
};
use plexus_core::{PbftBlock, PeriodData};
use plexus_storage::ConsensusDb;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

struct SyncHarness {
    _dir: TempDir,
    chain: Arc<PbftChain>,
    queue: Arc<SyncQueue>,
    pipeline: Arc<SyncPipeline>,
    finalizer: Arc<Finalizer>,
    pillar_votes: Arc<PillarVoteStore>,
    engine: Arc<TestEngine>,
    events: UnboundedReceiver<NetworkEvent>,
}

fn harness(validators: &[TestValidator]) -> SyncHarness {
    harness_with_config(
        validators,
        PbftConfig { committee_size: 100, ..Default::default() },
    )
}

fn harness_with_config(validators: &[TestValidator], config: PbftConfig) -> SyncHarness {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(ConsensusDb::open(dir.path()).unwrap());
    let refs: Vec<&TestValidator> = validators.iter().collect();
    let engine = TestEngine::new(&refs, 1);
    let (network, events) = NetworkHandle::channel();

    let chain = Arc::new(PbftChain::load(db.clone()).unwrap());
    let vote_store = Arc::new(VoteStore::new(&config, engine.clone(), Some(db.clone())));
    let next_votes = Arc::new(NextVotesManager::new());
    let rewards = Arc::new(RewardsVotes::new());
    let pillar_votes = Arc::new(PillarVoteStore::new());
    let queue = Arc::new(SyncQueue::new());

    let finalizer = Arc::new(Finalizer::new(
        &config,
        db,
        chain.clone(),
        vote_store,
        next_votes,
        rewards,
        pillar_votes.clone(),
        engine.clone(),
        network.clone(),
        Arc::new(validators[0].keypair.clone()),
    ));
    let pipeline = Arc::new(SyncPipeline::new(
        &config,
        queue.clone(),
        chain.clone(),
        engine.clone(),
        network,
    ));

    SyncHarness { _dir: dir, chain, queue, pipeline, finalizer, pillar_votes, engine, events }
}

/// Five periods pushed with out-of-order attempts interleaved commit
/// strictly in period order.
#[test]
fn sync_burst_commits_in_order() {
    let validators: Vec<TestValidator> = (1..=3).map(TestValidator::new).collect();
    let h = harness(&validators);
    let chain_data = empty_chain(5, &validators);
    let peer = [7u8; 32];

    // Out-of-order pushes are refused until the gap closes
    assert!(!h.queue.push(chain_data[2].clone(), peer, h.chain.tip_period()));
    assert!(h.queue.push(chain_data[0].clone(), peer, h.chain.tip_period()));
    assert!(!h.queue.push(chain_data[4].clone(), peer, h.chain.tip_period()));
    for data in &chain_data[1..] {
        assert!(h.queue.push(data.clone(), peer, h.chain.tip_period()));
    }

    // Drain on a finalizer thread, exactly as the core wires it
    let stop = Arc::new(AtomicBool::new(false));
    let thread = {
        let finalizer = h.finalizer.clone();
        let pipeline = h.pipeline.clone();
        let stop = stop.clone();
        std::thread::spawn(move || finalizer.run(&pipeline, &stop))
    };

    let deadline = Instant::now() + Duration::from_secs(10);
    while h.chain.tip_period() < 5 {
        assert!(Instant::now() < deadline, "sync burst stalled");
        std::thread::sleep(Duration::from_millis(20));
    }

    // Periods 6 and 7: the later block is refused until its gap closes
    let data6 = empty_period_data(h.chain.last_block_hash(), 6, &validators);
    let data7 = empty_period_data(*data6.pbft_block.hash(), 7, &validators);
    assert!(!h.queue.push(data7.clone(), peer, h.chain.tip_period()));
    assert!(h.queue.push(data6, peer, h.chain.tip_period()));
    assert!(h.queue.push(data7, peer, h.chain.tip_period()));

    let deadline = Instant::now() + Duration::from_secs(10);
    while h.chain.tip_period() < 7 {
        assert!(Instant::now() < deadline, "follow-up sync stalled");
        std::thread::sleep(Duration::from_millis(20));
    }

    stop.store(true, Ordering::Release);
    h.queue.notify();
    thread.join().unwrap();

    assert_eq!(*h.engine.finalized.lock(), vec![1, 2, 3, 4, 5, 6, 7]);
}

/// A declared order hash disagreeing with the recomputed one gets the
/// peer disconnected, the queue cleared and syncing force-restarted.
#[test]
fn order_hash_mismatch_marks_peer_malicious() {
    let validators: Vec<TestValidator> = (1..=3).map(TestValidator::new).collect();
    let mut h = harness(&validators);
    let peer = [7u8; 32];

    // Block declaring a garbage order hash over empty content
    let block = Arc::new(
        PbftBlock::new(
            [0; 32],
            [2; 32],
            [9; 32],
            1,
            validators[0].address,
            1,
            &validators[0].keypair,
        )
        .unwrap(),
    );
    let bad = PeriodData::new(block, vec![], vec![], vec![], None);

    // Seed the queue so clearing is observable
    let follow_up = empty_period_data([1; 32], 1, &validators);
    h.queue.push(follow_up, peer, 0);
    assert_eq!(h.queue.len(), 1);

    assert!(matches!(h.pipeline.process(bad, peer), SyncBlockOutcome::Malicious));
    assert!(h.queue.is_empty());

    let mut malicious = false;
    let mut restarted_forced = false;
    while let Ok(event) = h.events.try_recv() {
        match event {
            NetworkEvent::MaliciousPeer(p) => malicious = p == peer,
            NetworkEvent::RestartSyncing { force, .. } => restarted_forced = force,
            _ => {}
        }
    }
    assert!(malicious, "peer was not reported malicious");
    assert!(restarted_forced, "sync restart was not forced");
}

/// Cert votes below 2t+1 abort the burst.
#[test]
fn cert_votes_below_quorum_rejected() {
    let validators: Vec<TestValidator> = (1..=3).map(TestValidator::new).collect();
    let h = harness(&validators);
    let peer = [7u8; 32];

    // Commit period 1 legitimately
    let data1 = empty_period_data([0; 32], 1, &validators);
    let head = *data1.pbft_block.hash();
    match h.pipeline.process(data1, peer) {
        SyncBlockOutcome::Valid(data) => {
            h.finalizer.finalize_block(data).unwrap();
        }
        _ => panic!("period 1 should validate"),
    }

    // Period 2 with a single cert vote (weight 1 < 2t+1 = 3)
    let block = empty_block(head, 2, &validators[0]);
    let short = PeriodData::new(
        block.clone(),
        vec![validators[0].vote(*block.hash(), 2, 1, 3)],
        vec![],
        vec![],
        None,
    );
    assert!(matches!(h.pipeline.process(short, peer), SyncBlockOutcome::Malicious));
    assert_eq!(h.chain.tip_period(), 1);
}

/// Cert votes for a different block are refused outright.
#[test]
fn cert_votes_for_wrong_block_rejected() {
    let validators: Vec<TestValidator> = (1..=3).map(TestValidator::new).collect();
    let h = harness(&validators);
    let peer = [7u8; 32];

    let data1 = empty_period_data([0; 32], 1, &validators);
    let head = *data1.pbft_block.hash();
    match h.pipeline.process(data1, peer) {
        SyncBlockOutcome::Valid(data) => h.finalizer.finalize_block(data).unwrap(),
        _ => panic!("period 1 should validate"),
    };

    let block = empty_block(head, 2, &validators[0]);
    let wrong = PeriodData::new(
        block,
        validators.iter().map(|v| v.vote([0xdd; 32], 2, 1, 3)).collect(),
        vec![],
        vec![],
        None,
    );
    assert!(matches!(h.pipeline.process(wrong, peer), SyncBlockOutcome::Malicious));
}

/// Re-delivered already-finalized periods are skipped silently.
#[test]
fn already_synced_period_skipped() {
    let validators: Vec<TestValidator> = (1..=3).map(TestValidator::new).collect();
    let mut h = harness(&validators);
    let peer = [7u8; 32];

    let data1 = empty_period_data([0; 32], 1, &validators);
    match h.pipeline.process(data1.clone(), peer) {
        SyncBlockOutcome::Valid(data) => h.finalizer.finalize_block(data).unwrap(),
        _ => panic!("period 1 should validate"),
    };

    assert!(matches!(
        h.pipeline.process(data1, peer),
        SyncBlockOutcome::AlreadySynced
    ));
    // No penalty events for a replay
    assert!(h.events.try_recv().is_err());
}

/// Pillar boundaries emit a checkpoint, cast the own stake-weighted vote
/// and serve the minimal above-threshold vote set.
#[test]
fn pillar_checkpoint_emitted_and_aggregated() {
    let validators: Vec<TestValidator> = (1..=3).map(TestValidator::new).collect();
    let config = PbftConfig {
        committee_size: 100,
        pillar_activation_period: 2,
        pillar_interval: 2,
        ..Default::default()
    };
    let mut h = harness_with_config(&validators, config);
    let peer = [7u8; 32];

    for data in empty_chain(2, &validators) {
        match h.pipeline.process(data, peer) {
            SyncBlockOutcome::Valid(data) => {
                h.finalizer.finalize_block(data).unwrap();
            }
            _ => panic!("chain should validate"),
        }
    }

    // Period 2 crossed the pillar boundary: the own vote was broadcast
    let mut pillar_hash = None;
    while let Ok(event) = h.events.try_recv() {
        if let NetworkEvent::BroadcastPillarVote(vote) = event {
            assert_eq!(vote.period(), 2);
            pillar_hash = Some(*vote.block_hash());
        }
    }
    let pillar_hash = pillar_hash.expect("own pillar vote broadcast");

    assert!(h.pillar_votes.is_initialized(2));
    assert_eq!(h.pillar_votes.stake_weight(2, &pillar_hash), 1);

    // Other validators certify the same checkpoint; threshold is
    // 2/3 of total stake + 1 = 3
    for validator in validators.iter().skip(1) {
        let vote =
            Arc::new(plexus_core::PillarVote::new(&validator.keypair, 2, pillar_hash).unwrap());
        assert!(h.pillar_votes.insert(vote, 1).unwrap());
    }
    assert_eq!(h.pillar_votes.stake_weight(2, &pillar_hash), 3);

    let quorum = h.pillar_votes.verified_votes(2, &pillar_hash, true);
    assert_eq!(quorum.len(), 3);
}

/// A finalization gap is a programming error surfaced as PeriodGap.
#[test]
fn period_gap_rejected() {
    let validators: Vec<TestValidator> = (1..=3).map(TestValidator::new).collect();
    let h = harness(&validators);

    let data3 = empty_period_data([1; 32], 3, &validators);
    let err = h.finalizer.finalize_block(data3).unwrap_err();
    assert!(matches!(
        err,
        plexus_consensus::ConsensusError::PeriodGap { expected: 1, got: 3 }
    ));
}
