//! End-to-end consensus scenarios over the full core aggregate.

mod common;

use common::{TestDag, TestEngine, TestValidator};
use plexus_consensus::{ConsensusCore, NetworkEvent, PbftConfig};
use plexus_core::NULL_BLOCK_HASH;
use plexus_storage::ConsensusDb;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn fast_config() -> PbftConfig {
    PbftConfig {
        lambda_ms_min: 200,
        committee_size: 100,
        ..Default::default()
    }
}

/// A lone validator must converge by itself: round 1 agrees on the null
/// block (nothing to certify), round 2 proposes and finalizes an own
/// block over the DAG frontier.
#[test]
fn single_node_finalizes_first_period() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(ConsensusDb::open(dir.path()).unwrap());

    let validator = TestValidator::new(1);
    let engine = TestEngine::new(&[&validator], 1);
    let genesis = [9u8; 32];
    let (dag, dag_tip) = TestDag::with_single_block(genesis);

    let (core, mut events) = ConsensusCore::new(
        fast_config(),
        db.clone(),
        validator.keypair.clone(),
        plexus_crypto::vrf::VrfKeypair::from_seed(&[1; 32]),
        genesis,
        engine.clone(),
        dag,
    )
    .unwrap();

    core.start();

    let deadline = Instant::now() + Duration::from_secs(30);
    while core.chain.tip_period() < 1 {
        assert!(Instant::now() < deadline, "no finalization within 30s");
        std::thread::sleep(Duration::from_millis(50));
    }
    core.shutdown();

    // Exactly one finalization, for period 1
    assert_eq!(engine.finalized.lock().first(), Some(&1));

    let data = db.period_data(1).unwrap().expect("period 1 persisted");
    assert_eq!(data.pbft_block.period(), 1);
    assert_eq!(data.pbft_block.author().unwrap(), validator.address);
    assert_eq!(*data.pbft_block.dag_anchor_hash(), dag_tip);
    assert_eq!(*data.pbft_block.prev_block_hash(), NULL_BLOCK_HASH);
    // The block carries its own cert quorum
    assert!(!data.cert_votes.is_empty());
    for vote in &data.cert_votes {
        assert_eq!(vote.block_hash(), data.pbft_block.hash());
    }

    // The own block was broadcast at proposal time
    let mut proposed = false;
    while let Ok(event) = events.try_recv() {
        if let NetworkEvent::BroadcastPbftBlock(block) = event {
            if block.hash() == data.pbft_block.hash() {
                proposed = true;
            }
        }
    }
    assert!(proposed, "own block proposal was never broadcast");
}

/// A restarted node reloads the chain head from storage and re-validates
/// (rather than trusts) its persisted vote set.
#[test]
fn warm_restart_reloads_chain_and_votes() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(ConsensusDb::open(dir.path()).unwrap());

    let validator = TestValidator::new(1);
    let genesis = [9u8; 32];

    let head_block_hash = {
        let engine = TestEngine::new(&[&validator], 1);
        let (dag, _) = TestDag::with_single_block(genesis);
        let (core, _events) = ConsensusCore::new(
            fast_config(),
            db.clone(),
            validator.keypair.clone(),
            plexus_crypto::vrf::VrfKeypair::from_seed(&[1; 32]),
            genesis,
            engine,
            dag,
        )
        .unwrap();
        core.start();

        let deadline = Instant::now() + Duration::from_secs(30);
        while core.chain.tip_period() < 1 {
            assert!(Instant::now() < deadline, "no finalization within 30s");
            std::thread::sleep(Duration::from_millis(50));
        }
        core.shutdown();
        core.chain.last_block_hash()
    };

    // Reboot on the same database
    let engine = TestEngine::new(&[&validator], 1);
    let (dag, _) = TestDag::with_single_block(genesis);
    let (core, _events) = ConsensusCore::new(
        fast_config(),
        db.clone(),
        validator.keypair.clone(),
        plexus_crypto::vrf::VrfKeypair::from_seed(&[1; 32]),
        genesis,
        engine,
        dag,
    )
    .unwrap();

    assert!(core.chain.tip_period() >= 1);
    assert_eq!(core.chain.last_block_hash(), head_block_hash);
    assert!(core.chain.find_block_in_chain(&head_block_hash));
    // The persisted verified-vote set survives for the resume path
    assert!(!db.verified_votes().unwrap().is_empty());
}

/// Versioned vote packets normalize to current types before ingress.
#[test]
fn vote_packet_versions_normalize_on_ingress() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(ConsensusDb::open(dir.path()).unwrap());

    let validators: Vec<TestValidator> = (1..=4).map(TestValidator::new).collect();
    let refs: Vec<&TestValidator> = validators.iter().collect();
    let engine = TestEngine::new(&refs, 1);
    let (dag, _) = TestDag::with_single_block([9; 32]);

    let (core, _events) = ConsensusCore::new(
        fast_config(),
        db,
        validators[0].keypair.clone(),
        plexus_crypto::vrf::VrfKeypair::from_seed(&[1; 32]),
        [9; 32],
        engine,
        dag,
    )
    .unwrap();

    let votes: Vec<_> = validators
        .iter()
        .take(3)
        .map(|v| v.vote([0xaa; 32], 2, 1, 2))
        .collect();

    // Current optimized envelope
    let envelope = plexus_core::PacketEnvelope::current(&votes).unwrap();
    core.handle_vote_packet(&envelope).unwrap();
    assert_eq!(core.vote_store.len(), 3);

    // Legacy envelope with full encodings replays as duplicates
    let legacy = plexus_core::PacketEnvelope {
        version: 2,
        payload: plexus_core::bundle::encode_full_votes(&votes),
    };
    core.handle_vote_packet(&legacy).unwrap();
    assert_eq!(core.vote_store.len(), 3);

    // Unknown versions are refused
    let unknown = plexus_core::PacketEnvelope { version: 9, payload: vec![] };
    assert!(core.handle_vote_packet(&unknown).is_err());
}

/// Two conflicting votes in the same cell from one voter produce a
/// slashing proof carrying both.
#[test]
fn double_vote_produces_slashing_proof() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(ConsensusDb::open(dir.path()).unwrap());

    let validators: Vec<TestValidator> = (1..=4).map(TestValidator::new).collect();
    let refs: Vec<&TestValidator> = validators.iter().collect();
    let engine = TestEngine::new(&refs, 1);
    let (dag, _) = TestDag::with_single_block([9; 32]);

    let (core, mut events) = ConsensusCore::new(
        fast_config(),
        db,
        validators[0].keypair.clone(),
        plexus_crypto::vrf::VrfKeypair::from_seed(&[1; 32]),
        [9; 32],
        engine,
        dag,
    )
    .unwrap();

    let vote_a = validators[1].vote([0xaa; 32], 5, 2, 2);
    let vote_b = validators[1].vote([0xbb; 32], 5, 2, 2);

    core.handle_vote(vote_a.clone()).unwrap();
    core.handle_vote(vote_b.clone()).unwrap();

    let mut proof = None;
    while let Ok(event) = events.try_recv() {
        if let NetworkEvent::DoubleVotingProof { first, second } = event {
            proof = Some((first, second));
        }
    }
    let (first, second) = proof.expect("slashing proof emitted");
    assert_eq!(first.hash(), vote_a.hash());
    assert_eq!(second.hash(), vote_b.hash());
}

/// A soft voted value whose block never arrives is abandoned once the
/// wait budget elapses.
#[test]
fn soft_voted_value_given_up_after_wait() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(ConsensusDb::open(dir.path()).unwrap());

    let validator = TestValidator::new(1);
    let engine = TestEngine::new(&[&validator], 1);
    let (dag, _) = TestDag::with_single_block([9; 32]);

    let config = PbftConfig {
        max_wait_for_soft_voted_block_steps: 0,
        ..fast_config()
    };
    let (core, _events) = ConsensusCore::new(
        config,
        db,
        validator.keypair.clone(),
        plexus_crypto::vrf::VrfKeypair::from_seed(&[1; 32]),
        [9; 32],
        engine,
        dag,
    )
    .unwrap();

    // Nothing soft voted yet: no value to give up
    assert!(!core.state_machine.would_give_up_soft_voted_value());

    core.state_machine.set_last_soft_voted_value([0x77; 32]);
    std::thread::sleep(Duration::from_millis(5));
    // Wait budget is zero and the block never arrived
    assert!(core.state_machine.would_give_up_soft_voted_value());
}

/// With a generous wait budget the same value is kept.
#[test]
fn soft_voted_value_kept_within_wait() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(ConsensusDb::open(dir.path()).unwrap());

    let validator = TestValidator::new(1);
    let engine = TestEngine::new(&[&validator], 1);
    let (dag, _) = TestDag::with_single_block([9; 32]);

    let (core, _events) = ConsensusCore::new(
        fast_config(),
        db,
        validator.keypair.clone(),
        plexus_crypto::vrf::VrfKeypair::from_seed(&[1; 32]),
        [9; 32],
        engine,
        dag,
    )
    .unwrap();

    core.state_machine.set_last_soft_voted_value([0x77; 32]);
    assert!(!core.state_machine.would_give_up_soft_voted_value());
}

/// A fresh round gives up the next voted value when there is none.
#[test]
fn next_voted_value_given_up_when_absent() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(ConsensusDb::open(dir.path()).unwrap());

    let validator = TestValidator::new(1);
    let engine = TestEngine::new(&[&validator], 1);
    let (dag, _) = TestDag::with_single_block([9; 32]);

    let (core, _events) = ConsensusCore::new(
        fast_config(),
        db,
        validator.keypair.clone(),
        plexus_crypto::vrf::VrfKeypair::from_seed(&[1; 32]),
        [9; 32],
        engine,
        dag,
    )
    .unwrap();

    assert!(core.state_machine.would_give_up_next_voted_value());
}
