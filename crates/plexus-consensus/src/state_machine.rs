//! The PBFT round state machine.
//!
//! One period drives possibly many rounds; one round drives steps
//! 1 (value proposal), 2 (filter), 3 (certify) and then an indefinite
//! 4/5 finish / finish-polling cycle until a 2t+1 cert quorum commits.
//! The loop runs on its own OS thread and sleeps on a condition variable
//! between step deadlines so shutdown can interrupt any wait.

use crate::chain::PbftChain;
use crate::finalizer::Finalizer;
use crate::interfaces::{DagOrder, DposView, ExecutionEngine, NetworkHandle, SyncRequestReason};
use crate::next_votes::NextVotesManager;
use crate::sync::SyncQueue;
use crate::vote_store::{InsertResult, QuorumKind, VoteStore};
use crate::{ConsensusError, PbftConfig, Result};
use parking_lot::{Condvar, Mutex};
use plexus_core::constants::POLLING_INTERVAL_MS;
use plexus_core::{
    calculate_order_hash, Hash, PbftBlock, PbftPeriod, PbftRound, PbftStep, PeriodData,
    SortitionMessage, Vote, VoteType, VrfSortition, NULL_BLOCK_HASH,
};
use plexus_crypto::vrf::VrfKeypair;
use plexus_crypto::{Address, KeyPair};
use plexus_storage::{ConsensusDb, MgrField, MgrStatus, MgrVotedValue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, trace, warn};

/// The five protocol states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PbftState {
    ValueProposal,
    Filter,
    Certify,
    Finish,
    FinishPolling,
}

impl PbftState {
    fn for_step(step: PbftStep) -> Self {
        match step {
            1 => PbftState::ValueProposal,
            2 => PbftState::Filter,
            3 => PbftState::Certify,
            s if s % 2 == 0 => PbftState::Finish,
            _ => PbftState::FinishPolling,
        }
    }
}

/// Mutable round state, owned by the state-machine thread.
struct MachineState {
    period: PbftPeriod,
    round: PbftRound,
    step: PbftStep,
    last_step: PbftStep,
    state: PbftState,
    starting_step_in_round: PbftStep,

    lambda_ms: u64,
    lambda_backoff_multiple: u64,
    next_step_time_ms: u64,
    elapsed_in_round_ms: u64,
    round_clock_start: Instant,
    current_step_clock_start: Instant,
    last_step_clock_start: Instant,

    dpos_view: DposView,
    previous_round_sortition_threshold: u64,
    previous_round_total_stake: u64,

    own_starting_value: Hash,
    proposed_block: (Hash, bool),
    soft_voted_block_for_round: (Hash, bool),
    last_soft_voted_value: Hash,
    last_cert_voted_value: Hash,
    next_voted_soft_value: bool,
    next_voted_null_block_hash: bool,
    have_executed_this_round: bool,
    should_have_cert_voted_in_this_round: bool,

    previous_round_next_voted_value: Hash,
    previous_round_next_voted_null: bool,
    time_began_waiting_soft_voted_block: Instant,
    time_began_waiting_next_voted_block: Instant,

    go_finish_state: bool,
    loop_back_finish_state: bool,

    round_last_requested_sync: PbftRound,
    step_last_requested_sync: PbftStep,
    round_last_broadcast: PbftRound,
    step_last_broadcast: PbftStep,

    /// Period data assembled for the value being certified, reused when
    /// the block commits.
    cert_period_data: Option<PeriodData>,
}

impl MachineState {
    fn fresh(lambda_ms: u64) -> Self {
        let now = Instant::now();
        Self {
            period: 1,
            round: 1,
            step: 1,
            last_step: 1,
            state: PbftState::ValueProposal,
            starting_step_in_round: 1,
            lambda_ms,
            lambda_backoff_multiple: 1,
            next_step_time_ms: 0,
            elapsed_in_round_ms: 0,
            round_clock_start: now,
            current_step_clock_start: now,
            last_step_clock_start: now,
            dpos_view: DposView::derive(1, 1, 0),
            previous_round_sortition_threshold: 0,
            previous_round_total_stake: 0,
            own_starting_value: NULL_BLOCK_HASH,
            proposed_block: (NULL_BLOCK_HASH, false),
            soft_voted_block_for_round: (NULL_BLOCK_HASH, false),
            last_soft_voted_value: NULL_BLOCK_HASH,
            last_cert_voted_value: NULL_BLOCK_HASH,
            next_voted_soft_value: false,
            next_voted_null_block_hash: false,
            have_executed_this_round: false,
            should_have_cert_voted_in_this_round: false,
            previous_round_next_voted_value: NULL_BLOCK_HASH,
            previous_round_next_voted_null: false,
            time_began_waiting_soft_voted_block: now,
            time_began_waiting_next_voted_block: now,
            go_finish_state: false,
            loop_back_finish_state: false,
            round_last_requested_sync: 0,
            step_last_requested_sync: 0,
            round_last_broadcast: 0,
            step_last_broadcast: 0,
            cert_period_data: None,
        }
    }
}

/// The PBFT state machine and its collaborators.
pub struct PbftStateMachine {
    config: PbftConfig,
    keypair: Arc<KeyPair>,
    vrf_keypair: Arc<VrfKeypair>,
    node_address: Address,
    dag_genesis: Hash,

    db: Arc<ConsensusDb>,
    chain: Arc<PbftChain>,
    vote_store: Arc<VoteStore>,
    next_votes: Arc<NextVotesManager>,
    finalizer: Arc<Finalizer>,
    sync_queue: Arc<SyncQueue>,
    engine: Arc<dyn ExecutionEngine>,
    dag: Arc<dyn DagOrder>,
    network: NetworkHandle,

    stop: Arc<AtomicBool>,
    sleep_lock: Mutex<()>,
    sleep_cv: Condvar,
    machine: Mutex<MachineState>,
}

impl PbftStateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PbftConfig,
        keypair: Arc<KeyPair>,
        vrf_keypair: Arc<VrfKeypair>,
        dag_genesis: Hash,
        db: Arc<ConsensusDb>,
        chain: Arc<PbftChain>,
        vote_store: Arc<VoteStore>,
        next_votes: Arc<NextVotesManager>,
        finalizer: Arc<Finalizer>,
        sync_queue: Arc<SyncQueue>,
        engine: Arc<dyn ExecutionEngine>,
        dag: Arc<dyn DagOrder>,
        network: NetworkHandle,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let node_address = keypair.address();
        let lambda_ms = config.lambda_ms_min;
        Self {
            config,
            keypair,
            vrf_keypair,
            node_address,
            dag_genesis,
            db,
            chain,
            vote_store,
            next_votes,
            finalizer,
            sync_queue,
            engine,
            dag,
            network,
            stop,
            sleep_lock: Mutex::new(()),
            sleep_cv: Condvar::new(),
            machine: Mutex::new(MachineState::fresh(lambda_ms)),
        }
    }

    /// Interrupt any step sleep (shutdown path).
    pub fn notify(&self) {
        self.sleep_cv.notify_all();
    }

    pub fn current_round(&self) -> PbftRound {
        self.machine.lock().round
    }

    pub fn current_step(&self) -> PbftStep {
        self.machine.lock().step
    }

    pub fn current_period(&self) -> PbftPeriod {
        self.machine.lock().period
    }

    pub fn last_cert_voted_value(&self) -> Hash {
        self.machine.lock().last_cert_voted_value
    }

    /// Only to be used for tests: seed the soft-vote wait state.
    pub fn set_last_soft_voted_value(&self, value: Hash) {
        let mut s = self.machine.lock();
        self.update_last_soft_voted_value(&mut s, value);
    }

    /// Only to be used for tests: evaluate the soft-value give-up policy.
    pub fn would_give_up_soft_voted_value(&self) -> bool {
        let s = self.machine.lock();
        self.give_up_soft_voted_block(&s)
    }

    /// Only to be used for tests: evaluate the next-value give-up policy.
    pub fn would_give_up_next_voted_value(&self) -> bool {
        let s = self.machine.lock();
        self.give_up_next_voted_block(&s)
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// The state-machine thread body. The machine lock is released before
    /// every step sleep so observers are never blocked behind a timer.
    pub fn run(&self) {
        {
            let mut s = self.machine.lock();
            if let Err(e) = self.initial_state(&mut s) {
                error!("PBFT initial state failed: {e}");
                return;
            }
            info!(
                "PBFT running at period {}, round {}, step {}",
                s.period, s.round, s.step
            );
        }

        while !self.stopped() {
            let sleep_ms = {
                let mut s = self.machine.lock();
                match self.state_operations(&mut s) {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(e) => {
                        warn!("PBFT state operations: {e}");
                    }
                }

                match s.state {
                    PbftState::ValueProposal => self.propose_block(&mut s),
                    PbftState::Filter => self.identify_block(&mut s),
                    PbftState::Certify => self.certify_block(&mut s),
                    PbftState::Finish => self.first_finish(&mut s),
                    PbftState::FinishPolling => self.second_finish(&mut s),
                }

                self.set_next_state(&mut s);
                self.sleep_duration(&mut s)
            };

            if sleep_ms > 0 {
                let mut guard = self.sleep_lock.lock();
                if !self.stopped() {
                    self.sleep_cv
                        .wait_for(&mut guard, Duration::from_millis(sleep_ms));
                }
            }
        }
        info!("PBFT stopped");
    }

    // ── startup / resume ────────────────────────────────────────────────

    /// Rebuild state after (re)start. Persisted flags are reloaded but
    /// every persisted vote is re-validated through the store rather than
    /// trusted.
    fn initial_state(&self, s: &mut MachineState) -> Result<()> {
        s.period = self.chain.tip_period() + 1;
        self.update_dpos_state(s)?;

        let round = self.db.mgr_field(MgrField::Round)?.unwrap_or(1);
        let step = self.db.mgr_field(MgrField::Step)?.unwrap_or(1);

        let step = if round == 1 && step == 1 {
            1
        } else if step < 4 {
            // Mid-round restart: skip straight to first finish so no
            // step-1..3 vote is ever double-placed
            4
        } else {
            step
        };
        s.round = round;
        s.step = step;
        s.last_step = step;
        s.starting_step_in_round = step;
        s.state = PbftState::for_step(step);
        s.lambda_ms = self.config.lambda_ms_min;
        s.lambda_backoff_multiple = 1;
        // Anchor the accepting window before any stored vote re-enters
        self.vote_store.set_tip(s.period, s.round, s.step);

        if round > 1 {
            let stored = self.db.next_votes(round - 1)?;
            let two_t_plus_one = self
                .db
                .two_t_plus_one(round - 1)?
                .unwrap_or(s.dpos_view.two_t_plus_one);
            // Re-validate rather than trust: votes flow through the store
            for vote in &stored {
                if let Err(e) = self.vote_store.insert(vote.clone()) {
                    debug!(
                        "stored next vote {} rejected on resume: {e}",
                        plexus_core::abridged(vote.hash())
                    );
                }
            }
            if !self.next_votes.update(&stored, two_t_plus_one) {
                warn!("stored next votes for round {} below quorum", round - 1);
            }
        }
        s.previous_round_next_voted_value =
            self.next_votes.voted_value().unwrap_or(NULL_BLOCK_HASH);
        s.previous_round_next_voted_null = self.next_votes.have_enough_for_null();

        s.own_starting_value = self
            .db
            .mgr_voted_value(MgrVotedValue::OwnStartingValueInRound)?
            .unwrap_or(NULL_BLOCK_HASH);
        let soft_hash = self
            .db
            .mgr_voted_value(MgrVotedValue::SoftVotedBlockHashInRound)?
            .unwrap_or(NULL_BLOCK_HASH);
        let soft_flag = self.db.mgr_status(MgrStatus::SoftVotedBlockInRound)?;
        s.soft_voted_block_for_round = (soft_hash, soft_flag);
        if soft_flag && soft_hash != NULL_BLOCK_HASH {
            s.last_soft_voted_value = soft_hash;
            for vote in self.db.soft_votes(round)? {
                if vote.block_hash() == &soft_hash {
                    if let Err(e) = self.vote_store.insert(vote.clone()) {
                        debug!(
                            "stored soft vote {} rejected on resume: {e}",
                            plexus_core::abridged(vote.hash())
                        );
                    }
                }
            }
        }

        s.last_cert_voted_value = self
            .db
            .mgr_voted_value(MgrVotedValue::LastCertVotedValue)?
            .unwrap_or(NULL_BLOCK_HASH);
        s.next_voted_soft_value = self.db.mgr_status(MgrStatus::NextVotedSoftValue)?;
        s.next_voted_null_block_hash = self.db.mgr_status(MgrStatus::NextVotedNullBlockHash)?;
        s.have_executed_this_round = self.db.mgr_status(MgrStatus::ExecutedInRound)?;

        // Warm-restart the verified vote set through full re-validation
        for vote in self.db.verified_votes()? {
            let _ = self.vote_store.insert(vote);
        }

        let now = Instant::now();
        s.round_clock_start = now;
        s.current_step_clock_start = now;
        s.last_step_clock_start = now;
        s.time_began_waiting_soft_voted_block = now;
        s.time_began_waiting_next_voted_block = now;
        s.next_step_time_ms = 0;
        Ok(())
    }

    /// Refresh the DPOS view for the working period, retrying while the
    /// execution engine is still behind.
    fn update_dpos_state(&self, s: &mut MachineState) -> Result<()> {
        loop {
            match self.try_dpos_view(s.period) {
                Ok(view) => {
                    s.previous_round_sortition_threshold = s.dpos_view.sortition_threshold;
                    s.previous_round_total_stake = s.dpos_view.total_stake;
                    s.dpos_view = view;
                    debug!(
                        "DPOS view for period {}: total {}, own {}, threshold {}, 2t+1 {} \
                         (previous threshold {}, previous total {})",
                        s.period,
                        view.total_stake,
                        view.own_stake,
                        view.sortition_threshold,
                        view.two_t_plus_one,
                        s.previous_round_sortition_threshold,
                        s.previous_round_total_stake,
                    );
                    return Ok(());
                }
                Err(ConsensusError::FutureExecution) => {
                    if self.stopped() {
                        return Err(ConsensusError::Shutdown);
                    }
                    trace!("period {} ahead of execution, waiting", s.period);
                    std::thread::sleep(Duration::from_millis(POLLING_INTERVAL_MS));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_dpos_view(&self, period: PbftPeriod) -> Result<DposView> {
        let total = self.engine.dpos_eligible_total_vote_count(period)?;
        let own = self.engine.dpos_eligible_vote_count(period, &self.node_address)?;
        Ok(DposView::derive(self.config.committee_size, total, own))
    }

    // ── per-iteration operations ────────────────────────────────────────

    /// Runs before every state handler. Returns true when the loop should
    /// restart (period or round advanced, or a block was committed).
    fn state_operations(&self, s: &mut MachineState) -> Result<bool> {
        // Blocks finalized by the sync path move the tip underneath us
        if self.finalizer.take_executed() || self.chain.tip_period() + 1 != s.period {
            if self.chain.tip_period() + 1 != s.period {
                self.advance_period(s)?;
                return Ok(true);
            }
            // Tip unchanged but rewards/views rotated (cert path commit)
            self.update_dpos_state(s)?;
        }

        self.check_previous_round_next_voted_value_change(s);

        s.elapsed_in_round_ms = s.round_clock_start.elapsed().as_millis() as u64;

        // 2t+1 cert votes commit the block mid-step
        if s.state == PbftState::Certify && !s.have_executed_this_round {
            if let Some((voted_hash, votes)) = self.vote_store.votes_bundle(
                s.period,
                s.round,
                3,
                s.dpos_view.two_t_plus_one,
            ) {
                debug!(
                    "block {} has a cert quorum in round {}",
                    plexus_core::abridged(&voted_hash),
                    s.round
                );
                if self.push_cert_voted_block(s, voted_hash, votes)? {
                    let mut batch = self.db.batch();
                    self.db.put_mgr_status(&mut batch, MgrStatus::ExecutedInRound, true)?;
                    self.db.commit(batch)?;
                    s.have_executed_this_round = true;
                    return Ok(true);
                }
            }
        }

        Ok(self.reset_round(s)?)
    }

    fn check_previous_round_next_voted_value_change(&self, s: &mut MachineState) {
        let value = self.next_votes.voted_value().unwrap_or(NULL_BLOCK_HASH);
        let null_quorum = self.next_votes.have_enough_for_null();

        if value != s.previous_round_next_voted_value {
            s.time_began_waiting_next_voted_block = Instant::now();
            s.previous_round_next_voted_value = value;
        } else if null_quorum != s.previous_round_next_voted_null {
            s.time_began_waiting_next_voted_block = Instant::now();
            s.previous_round_next_voted_null = null_quorum;
        }
    }

    /// Advance to a fresh period after a finalization.
    fn advance_period(&self, s: &mut MachineState) -> Result<()> {
        let new_period = self.chain.tip_period() + 1;
        info!("advancing to period {new_period} (round 1)");

        s.period = new_period;
        s.round = 1;
        self.reset_step(s);
        s.state = PbftState::ValueProposal;
        s.round_clock_start = Instant::now();

        s.own_starting_value = NULL_BLOCK_HASH;
        s.proposed_block = (NULL_BLOCK_HASH, false);
        s.soft_voted_block_for_round = (NULL_BLOCK_HASH, false);
        s.last_soft_voted_value = NULL_BLOCK_HASH;
        s.last_cert_voted_value = NULL_BLOCK_HASH;
        s.next_voted_soft_value = false;
        s.next_voted_null_block_hash = false;
        s.have_executed_this_round = false;
        s.should_have_cert_voted_in_this_round = false;
        s.cert_period_data = None;
        s.previous_round_next_voted_value = NULL_BLOCK_HASH;
        s.previous_round_next_voted_null = false;
        s.time_began_waiting_soft_voted_block = Instant::now();
        s.time_began_waiting_next_voted_block = Instant::now();

        let mut batch = self.db.batch();
        self.db.put_mgr_field(&mut batch, MgrField::Round, 1)?;
        self.db.put_mgr_field(&mut batch, MgrField::Step, 1)?;
        self.db.put_mgr_status(&mut batch, MgrStatus::ExecutedInRound, false)?;
        self.db.put_mgr_status(&mut batch, MgrStatus::NextVotedSoftValue, false)?;
        self.db.put_mgr_status(&mut batch, MgrStatus::NextVotedNullBlockHash, false)?;
        self.db.put_mgr_status(&mut batch, MgrStatus::SoftVotedBlockInRound, false)?;
        self.db
            .put_mgr_voted_value(&mut batch, MgrVotedValue::OwnStartingValueInRound, &NULL_BLOCK_HASH)?;
        self.db.put_mgr_voted_value(
            &mut batch,
            MgrVotedValue::SoftVotedBlockHashInRound,
            &NULL_BLOCK_HASH,
        )?;
        self.db
            .put_mgr_voted_value(&mut batch, MgrVotedValue::LastCertVotedValue, &NULL_BLOCK_HASH)?;
        self.db.commit(batch)?;

        self.update_dpos_state(s)?;
        self.vote_store.set_tip(s.period, s.round, s.step);
        Ok(())
    }

    /// Jump to the round 2t+1 next votes determine, if it is ahead of us.
    fn reset_round(&self, s: &mut MachineState) -> Result<bool> {
        let Some(new_round) =
            self.vote_store
                .determine_round(s.period, s.round, s.dpos_view.two_t_plus_one)
        else {
            return Ok(false);
        };
        if new_round <= s.round {
            return Ok(false);
        }

        info!("determined round {new_round} from votes (was {})", s.round);
        let previous_round = new_round - 1;

        // Carry the previous round's quorum next votes forward
        let mut carried = self.vote_store.two_t_plus_one_voted_block_votes(
            s.period,
            previous_round,
            QuorumKind::NextVotedBlock,
        );
        carried.extend(self.vote_store.two_t_plus_one_voted_block_votes(
            s.period,
            previous_round,
            QuorumKind::NextVotedNullBlock,
        ));
        self.next_votes.update(&carried, s.dpos_view.two_t_plus_one);

        // Persist the round transition atomically
        let mut batch = self.db.batch();
        self.db.put_mgr_field(&mut batch, MgrField::Round, new_round)?;
        self.db.put_mgr_field(&mut batch, MgrField::Step, 1)?;
        self.db.put_next_votes(&mut batch, previous_round, &carried)?;
        self.db
            .put_two_t_plus_one(&mut batch, previous_round, s.dpos_view.two_t_plus_one)?;
        if previous_round > 1 {
            self.db.remove_next_votes(&mut batch, previous_round - 1)?;
        }
        self.db.put_mgr_field(
            &mut batch,
            MgrField::PreviousRoundSortitionThreshold,
            s.dpos_view.sortition_threshold,
        )?;
        self.db.put_mgr_field(
            &mut batch,
            MgrField::PreviousRoundTotalStake,
            s.dpos_view.total_stake,
        )?;
        self.db.put_mgr_status(&mut batch, MgrStatus::ExecutedInRound, false)?;
        self.db
            .put_mgr_voted_value(&mut batch, MgrVotedValue::OwnStartingValueInRound, &NULL_BLOCK_HASH)?;
        self.db.put_mgr_status(&mut batch, MgrStatus::NextVotedNullBlockHash, false)?;
        self.db.put_mgr_status(&mut batch, MgrStatus::NextVotedSoftValue, false)?;
        self.db.put_mgr_status(&mut batch, MgrStatus::SoftVotedBlockInRound, false)?;
        self.db.put_mgr_voted_value(
            &mut batch,
            MgrVotedValue::SoftVotedBlockHashInRound,
            &NULL_BLOCK_HASH,
        )?;
        if s.soft_voted_block_for_round.1 && s.soft_voted_block_for_round.0 != NULL_BLOCK_HASH {
            self.db.remove_soft_votes(&mut batch, s.round)?;
        }
        self.db.commit(batch)?;

        s.round_clock_start = Instant::now();
        s.round = new_round;
        self.reset_step(s);
        s.state = PbftState::ValueProposal;

        s.previous_round_sortition_threshold = s.dpos_view.sortition_threshold;
        s.previous_round_total_stake = s.dpos_view.total_stake;
        s.have_executed_this_round = false;
        s.should_have_cert_voted_in_this_round = false;
        s.own_starting_value = NULL_BLOCK_HASH;
        s.next_voted_null_block_hash = false;
        s.next_voted_soft_value = false;
        s.soft_voted_block_for_round = (NULL_BLOCK_HASH, false);
        s.cert_period_data = None;

        s.previous_round_next_voted_value =
            self.next_votes.voted_value().unwrap_or(NULL_BLOCK_HASH);
        s.previous_round_next_voted_null = self.next_votes.have_enough_for_null();

        s.last_step_clock_start = s.current_step_clock_start;
        s.current_step_clock_start = Instant::now();
        self.vote_store.set_tip(s.period, s.round, s.step);
        Ok(true)
    }

    fn reset_step(&self, s: &mut MachineState) {
        s.last_step = s.step;
        s.step = 1;
        s.starting_step_in_round = 1;
        s.lambda_ms = self.config.lambda_ms_min;
        s.lambda_backoff_multiple = 1;
        s.next_step_time_ms = 0;
    }

    fn set_step(&self, s: &mut MachineState, step: PbftStep) {
        s.last_step = s.step;
        if let Err(e) = self.persist_step(step) {
            warn!("failed to persist step {step}: {e}");
        }
        s.step = step;

        if s.step > self.config.max_steps && s.lambda_backoff_multiple < 8 {
            // Exponential lambda back-off hook. Present but not engaged;
            // the round convergence path relies on next-vote syncing
            // instead.
        } else {
            s.lambda_ms = self.config.lambda_ms_min;
            s.lambda_backoff_multiple = 1;
        }
        self.vote_store.set_tip(s.period, s.round, s.step);
    }

    // ── state transitions and timing ────────────────────────────────────

    fn set_next_state(&self, s: &mut MachineState) {
        match s.state {
            PbftState::ValueProposal => self.set_filter_state(s),
            PbftState::Filter => self.set_certify_state(s),
            PbftState::Certify => {
                if s.go_finish_state {
                    self.set_finish_state(s);
                } else {
                    s.next_step_time_ms += POLLING_INTERVAL_MS;
                }
            }
            PbftState::Finish => self.set_finish_polling_state(s),
            PbftState::FinishPolling => {
                if s.loop_back_finish_state {
                    self.loop_back_finish_state(s);
                } else {
                    s.next_step_time_ms += POLLING_INTERVAL_MS;
                }
            }
        }
        trace!("next step time {} ms", s.next_step_time_ms);
    }

    fn roll_step_clock(&self, s: &mut MachineState) {
        s.last_step_clock_start = s.current_step_clock_start;
        s.current_step_clock_start = Instant::now();
    }

    fn set_filter_state(&self, s: &mut MachineState) {
        s.state = PbftState::Filter;
        self.set_step(s, s.step + 1);
        s.next_step_time_ms = 2 * s.lambda_ms;
        self.roll_step_clock(s);
    }

    fn set_certify_state(&self, s: &mut MachineState) {
        s.state = PbftState::Certify;
        self.set_step(s, s.step + 1);
        s.next_step_time_ms = 2 * s.lambda_ms;
        self.roll_step_clock(s);
    }

    fn set_finish_state(&self, s: &mut MachineState) {
        debug!("entering first finish state");
        s.state = PbftState::Finish;
        self.set_step(s, s.step + 1);
        s.next_step_time_ms = 4 * s.lambda_ms;
        self.roll_step_clock(s);
    }

    fn set_finish_polling_state(&self, s: &mut MachineState) {
        s.state = PbftState::FinishPolling;
        self.set_step(s, s.step + 1);
        self.clear_next_vote_flags(s);
        self.roll_step_clock(s);
    }

    fn loop_back_finish_state(&self, s: &mut MachineState) {
        debug!(
            "looping back to first finish in round {}, step {} (step {} ran {} ms)",
            s.round,
            s.step,
            s.last_step,
            s.last_step_clock_start.elapsed().as_millis(),
        );
        s.state = PbftState::Finish;
        self.set_step(s, s.step + 1);
        self.clear_next_vote_flags(s);
        debug_assert!(s.step >= s.starting_step_in_round);
        s.next_step_time_ms = (1 + s.step - s.starting_step_in_round) * s.lambda_ms;
        self.roll_step_clock(s);
    }

    fn clear_next_vote_flags(&self, s: &mut MachineState) {
        if let Err(e) = self.persist_next_vote_flags_cleared() {
            warn!("failed to persist next-vote flags: {e}");
        }
        s.next_voted_soft_value = false;
        s.next_voted_null_block_hash = false;
    }

    fn persist_step(&self, step: PbftStep) -> Result<()> {
        let mut batch = self.db.batch();
        self.db.put_mgr_field(&mut batch, MgrField::Step, step)?;
        self.db.commit(batch)?;
        Ok(())
    }

    fn persist_next_vote_flags_cleared(&self) -> Result<()> {
        let mut batch = self.db.batch();
        self.db.put_mgr_status(&mut batch, MgrStatus::NextVotedSoftValue, false)?;
        self.db.put_mgr_status(&mut batch, MgrStatus::NextVotedNullBlockHash, false)?;
        self.db.commit(batch)?;
        Ok(())
    }

    /// How long to sleep before the next step deadline (0 = running late).
    fn sleep_duration(&self, s: &mut MachineState) -> u64 {
        s.elapsed_in_round_ms = s.round_clock_start.elapsed().as_millis() as u64;
        // A thread rarely stalls for under ~25ms; don't bother sleeping
        if s.next_step_time_ms > s.elapsed_in_round_ms + 25 {
            let sleep_ms = s.next_step_time_ms - s.elapsed_in_round_ms;
            trace!("sleeping {sleep_ms} ms in round {}, step {}", s.round, s.step);
            sleep_ms
        } else {
            trace!("running late, skipping sleep");
            0
        }
    }

    // ── step 1: value proposal ──────────────────────────────────────────

    fn propose_block(&self, s: &mut MachineState) {
        trace!("value proposal state in round {}", s.round);

        if s.round == 1 {
            // By protocol the first round of a period proposes the null
            // block while the DAG frontier settles
            let placed = self.place_vote(s, NULL_BLOCK_HASH, VoteType::Propose);
            if placed > 0 {
                info!("proposing null block for round 1 (weight {placed})");
            }
            return;
        }

        if self.give_up_next_voted_block(s) {
            // A PBFT block is proposed once per period
            if !s.proposed_block.1 || s.proposed_block.0 == NULL_BLOCK_HASH {
                s.proposed_block = match self.propose_own_block(s) {
                    Some(hash) => (hash, true),
                    None => (NULL_BLOCK_HASH, false),
                };
            }
            if s.proposed_block.1 {
                let value = s.proposed_block.0;
                self.save_own_starting_value(s, value);
                let placed = self.place_vote(s, value, VoteType::Propose);
                if placed > 0 {
                    info!(
                        "proposing own block {} in round {} (weight {placed})",
                        plexus_core::abridged(&value),
                        s.round
                    );
                }
            }
        } else if s.previous_round_next_voted_value != NULL_BLOCK_HASH {
            let value = s.previous_round_next_voted_value;
            self.save_own_starting_value(s, value);

            let block = self.unfinalized_block(&value);
            if let Some(block) = block {
                let placed = self.place_vote(s, value, VoteType::Propose);
                if placed > 0 {
                    info!(
                        "rebroadcasting next voted block {} from previous round (weight {placed})",
                        plexus_core::abridged(&value)
                    );
                    self.network.broadcast_pbft_block(block);
                }
            } else {
                debug!(
                    "previous round next voted block {} not yet available",
                    plexus_core::abridged(&value)
                );
            }
        }
    }

    // ── step 2: filter ──────────────────────────────────────────────────

    fn identify_block(&self, s: &mut MachineState) {
        trace!("filter state in round {}", s.round);

        if s.round == 1 || self.give_up_next_voted_block(s) {
            if let Some(leader) = self.identify_leader_block(s) {
                self.save_own_starting_value(s, leader);
                debug!(
                    "leader block {} identified in round {}",
                    plexus_core::abridged(&leader),
                    s.round
                );

                let placed = self.place_vote(s, leader, VoteType::Soft);
                self.update_last_soft_voted_value(s, leader);
                if placed > 0 {
                    info!(
                        "soft voting {} in round {} (weight {placed})",
                        plexus_core::abridged(&leader),
                        s.round
                    );
                }
            }
        } else if s.previous_round_next_voted_value != NULL_BLOCK_HASH {
            let value = s.previous_round_next_voted_value;
            let placed = self.place_vote(s, value, VoteType::Soft);
            // A node can observe a previous-round next voted value that
            // differs from what it soft voted itself
            self.update_last_soft_voted_value(s, value);
            if placed > 0 {
                info!(
                    "soft voting previous round value {} (weight {placed})",
                    plexus_core::abridged(&value)
                );
            }
        }
    }

    // ── step 3: certify ─────────────────────────────────────────────────

    fn certify_block(&self, s: &mut MachineState) {
        trace!("certify state in round {}", s.round);

        s.go_finish_state = s.elapsed_in_round_ms
            > (4 * s.lambda_ms).saturating_sub(POLLING_INTERVAL_MS);

        if s.elapsed_in_round_ms < 2 * s.lambda_ms {
            // Steps 1 and 2 take 2 lambda by construction
            error!(
                "reached step 3 after only {} ms in round {}",
                s.elapsed_in_round_ms, s.round
            );
        } else if s.go_finish_state {
            debug!("step 3 expired, moving to step 4 in round {}", s.round);
        } else if !s.should_have_cert_voted_in_this_round {
            let soft_quorum = self.update_soft_voted_block_for_round(s);
            if soft_quorum {
                let soft_value = s.soft_voted_block_for_round.0;
                if self.reconstruct_period_data(s, &soft_value) {
                    let valid = match self.unfinalized_block(&soft_value) {
                        Some(block) => match self.chain.check_block_validation(&block) {
                            Ok(()) => true,
                            Err(e) => {
                                debug!(
                                    "soft voted block {} failed validation: {e}",
                                    plexus_core::abridged(&soft_value)
                                );
                                self.sync_from_peers(
                                    s,
                                    SyncRequestReason::InvalidSoftVotedBlock,
                                    false,
                                );
                                false
                            }
                        },
                        None => {
                            error!(
                                "cannot find soft voted block {} in round {} step 3",
                                plexus_core::abridged(&soft_value),
                                s.round
                            );
                            self.sync_from_peers(s, SyncRequestReason::InvalidSoftVotedBlock, false);
                            false
                        }
                    };

                    if valid {
                        s.last_cert_voted_value = soft_value;
                        s.should_have_cert_voted_in_this_round = true;

                        if let Err(e) = self.persist_cert_voted_value(&soft_value) {
                            warn!("failed to persist cert voted value: {e}");
                        }

                        let placed = self.place_vote(s, soft_value, VoteType::Cert);
                        if placed > 0 {
                            info!(
                                "cert voting {} in round {} (weight {placed})",
                                plexus_core::abridged(&soft_value),
                                s.round
                            );
                        }
                    }
                }
            }
        }
    }

    // ── step 4 (even): first finish ─────────────────────────────────────

    fn first_finish(&self, s: &mut MachineState) {
        trace!("first finish at step {} in round {}", s.step, s.round);

        if s.last_cert_voted_value != NULL_BLOCK_HASH {
            let value = s.last_cert_voted_value;
            let placed = self.place_vote(s, value, VoteType::Next);
            if placed > 0 {
                info!(
                    "next voting cert voted value {} at step {} (weight {placed})",
                    plexus_core::abridged(&value),
                    s.step
                );
            }
            // Periodic rebroadcast in case peers never received the block
            if s.step % 20 == 0 {
                if let Ok(Some(block)) = self.db.cert_voted_block(&value) {
                    self.network.broadcast_pbft_block(Arc::new(block));
                }
            }
            return;
        }

        // Give up the soft voted value only when it was carried from the
        // previous round and its block is unusable
        let own_value = s.own_starting_value;
        let give_up_soft = own_value == s.previous_round_next_voted_value
            && self.give_up_soft_voted_block(s)
            && !self.reconstruct_period_data(s, &own_value);

        if s.round >= 2 && (self.give_up_next_voted_block(s) || give_up_soft) {
            let placed = self.place_vote(s, NULL_BLOCK_HASH, VoteType::Next);
            if placed > 0 {
                info!("next voting null block at step {} (weight {placed})", s.step);
            }
        } else {
            let prev_value = s.previous_round_next_voted_value;
            if s.own_starting_value != prev_value
                && prev_value != NULL_BLOCK_HASH
                && !self.chain.find_block_in_chain(&prev_value)
            {
                if s.own_starting_value == NULL_BLOCK_HASH {
                    debug!(
                        "updating starting value from null to previous round value {}",
                        plexus_core::abridged(&prev_value)
                    );
                    self.save_own_starting_value(s, prev_value);
                } else if self.reconstruct_period_data(s, &prev_value) {
                    // The carried value is viable; adopt it
                    debug!(
                        "updating starting value {} to previous round value {}",
                        plexus_core::abridged(&s.own_starting_value),
                        plexus_core::abridged(&prev_value)
                    );
                    self.save_own_starting_value(s, prev_value);
                }
            }

            let value = s.own_starting_value;
            let placed = self.place_vote(s, value, VoteType::Next);
            if placed > 0 {
                info!(
                    "next voting own starting value {} at step {} (weight {placed})",
                    plexus_core::abridged(&value),
                    s.step
                );
            }
        }
    }

    // ── step 5 (odd): second finish ─────────────────────────────────────

    fn second_finish(&self, s: &mut MachineState) {
        trace!("second finish at step {} in round {}", s.step, s.round);
        debug_assert!(s.step >= s.starting_step_in_round);
        let end_time_for_step = ((2 + s.step - s.starting_step_in_round) * s.lambda_ms)
            .saturating_sub(POLLING_INTERVAL_MS);

        self.update_soft_voted_block_for_round(s);

        let soft_value = s.soft_voted_block_for_round.0;
        let give_up_soft = s.last_cert_voted_value == NULL_BLOCK_HASH
            && s.last_soft_voted_value == s.previous_round_next_voted_value
            && self.give_up_soft_voted_block(s)
            && !self.reconstruct_period_data(s, &soft_value);

        if !s.next_voted_soft_value
            && s.soft_voted_block_for_round.1
            && s.soft_voted_block_for_round.0 != NULL_BLOCK_HASH
            && !give_up_soft
        {
            let value = s.soft_voted_block_for_round.0;
            let placed = self.place_vote(s, value, VoteType::Next);
            if placed > 0 {
                info!(
                    "next voting soft value {} at step {} (weight {placed})",
                    plexus_core::abridged(&value),
                    s.step
                );
                if let Err(e) = self.persist_status(MgrStatus::NextVotedSoftValue, true) {
                    warn!("failed to persist next-voted-soft flag: {e}");
                }
                s.next_voted_soft_value = true;
            }
        }

        if !s.next_voted_null_block_hash
            && s.round >= 2
            && (give_up_soft || self.give_up_next_voted_block(s))
        {
            let placed = self.place_vote(s, NULL_BLOCK_HASH, VoteType::Next);
            if placed > 0 {
                info!("next voting null block at step {} (weight {placed})", s.step);
                if let Err(e) = self.persist_status(MgrStatus::NextVotedNullBlockHash, true) {
                    warn!("failed to persist next-voted-null flag: {e}");
                }
                s.next_voted_null_block_hash = true;
            }
        }

        let max_steps = self.config.max_steps;
        if s.step > max_steps + 1 && (s.step - max_steps - 2) % 100 == 0 {
            self.sync_from_peers(s, SyncRequestReason::ExceededMaxSteps, true);

            if !self.broadcast_already_this_step(s) {
                debug!(
                    "broadcasting previous round next votes bundle at step {}",
                    s.step
                );
                let bundle = self.next_votes.bundle();
                if !bundle.is_empty() {
                    self.network.broadcast_votes_bundle(bundle);
                }
                if s.round >= 2 {
                    self.network.request_next_votes_sync(s.period, s.round - 1);
                }
                s.round_last_broadcast = s.round;
                s.step_last_broadcast = s.step;
            }
        }

        s.loop_back_finish_state = s.elapsed_in_round_ms > end_time_for_step;
    }

    // ── voting helpers ──────────────────────────────────────────────────

    /// Generate, weigh, store and broadcast an own vote. Returns the vote
    /// weight (0 when not elected or without stake).
    fn place_vote(&self, s: &mut MachineState, block_hash: Hash, vote_type: VoteType) -> u64 {
        if s.dpos_view.own_stake == 0 {
            return 0;
        }

        let message = SortitionMessage::new(vote_type, s.period, s.round, s.step);
        let sortition = VrfSortition::generate(&self.vrf_keypair, message);
        let vote = match Vote::new(&self.keypair, sortition, block_hash) {
            Ok(vote) => Arc::new(vote),
            Err(e) => {
                error!("failed to sign own vote: {e}");
                return 0;
            }
        };

        match self.vote_store.insert(vote.clone()) {
            Ok(InsertResult::Inserted { .. }) => {
                let weight = vote.weight().unwrap_or(0);
                self.network.broadcast_vote(vote);
                weight
            }
            Ok(InsertResult::Duplicate) => vote.weight().unwrap_or(0),
            Ok(InsertResult::DoubleVote { existing }) => {
                // Only reachable on re-entry bugs; never sign both sides
                error!(
                    "own vote {} conflicts with {}",
                    plexus_core::abridged(vote.hash()),
                    plexus_core::abridged(existing.hash())
                );
                0
            }
            Err(ConsensusError::InsufficientStake) => 0,
            Err(e) => {
                debug!("own vote rejected: {e}");
                0
            }
        }
    }

    fn save_own_starting_value(&self, s: &mut MachineState, value: Hash) {
        if let Err(e) = self.persist_voted_value(MgrVotedValue::OwnStartingValueInRound, &value) {
            warn!("failed to persist starting value: {e}");
        }
        s.own_starting_value = value;
    }

    fn persist_voted_value(&self, field: MgrVotedValue, value: &Hash) -> Result<()> {
        let mut batch = self.db.batch();
        self.db.put_mgr_voted_value(&mut batch, field, value)?;
        self.db.commit(batch)?;
        Ok(())
    }

    fn persist_status(&self, status: MgrStatus, value: bool) -> Result<()> {
        let mut batch = self.db.batch();
        self.db.put_mgr_status(&mut batch, status, value)?;
        self.db.commit(batch)?;
        Ok(())
    }

    fn persist_cert_voted_value(&self, value: &Hash) -> Result<()> {
        let mut batch = self.db.batch();
        self.db
            .put_mgr_voted_value(&mut batch, MgrVotedValue::LastCertVotedValue, value)?;
        if let Some(block) = self.unfinalized_block(value) {
            self.db.put_cert_voted_block(&mut batch, &block)?;
        }
        self.db.commit(batch)?;
        Ok(())
    }

    fn update_last_soft_voted_value(&self, s: &mut MachineState, value: Hash) {
        if value != s.last_soft_voted_value {
            s.time_began_waiting_soft_voted_block = Instant::now();
        }
        s.last_soft_voted_value = value;
    }

    /// Refresh the round's 2t+1 soft voted block from the store. Returns
    /// whether a non-null soft quorum is known.
    fn update_soft_voted_block_for_round(&self, s: &mut MachineState) -> bool {
        if s.soft_voted_block_for_round.1 {
            return s.soft_voted_block_for_round.0 != NULL_BLOCK_HASH;
        }

        let bundle =
            self.vote_store
                .votes_bundle(s.period, s.round, 2, s.dpos_view.two_t_plus_one);

        let (hash, enough) = match &bundle {
            Some((hash, _)) => (*hash, true),
            None => (NULL_BLOCK_HASH, false),
        };

        if let Err(e) = self.persist_soft_voted_block(s.round, &hash, enough, &bundle) {
            warn!("failed to persist soft voted block: {e}");
        }

        s.soft_voted_block_for_round = (hash, enough);

        if enough && hash != NULL_BLOCK_HASH {
            if s.state == PbftState::FinishPolling {
                // Help laggards: regossip the quorum soft votes
                if let Some((_, votes)) = bundle {
                    debug!(
                        "regossiping soft quorum votes for {}",
                        plexus_core::abridged(&hash)
                    );
                    self.network.broadcast_votes_bundle(votes);
                }
            }
            return true;
        }
        false
    }

    fn persist_soft_voted_block(
        &self,
        round: PbftRound,
        hash: &Hash,
        enough: bool,
        bundle: &Option<(Hash, Vec<Arc<Vote>>)>,
    ) -> Result<()> {
        let mut batch = self.db.batch();
        self.db
            .put_mgr_voted_value(&mut batch, MgrVotedValue::SoftVotedBlockHashInRound, hash)?;
        self.db
            .put_mgr_status(&mut batch, MgrStatus::SoftVotedBlockInRound, enough)?;
        if let Some((hash, votes)) = bundle {
            if *hash != NULL_BLOCK_HASH {
                self.db.put_soft_votes(&mut batch, round, votes)?;
            }
        }
        self.db.commit(batch)?;
        Ok(())
    }

    // ── leader selection ────────────────────────────────────────────────

    fn identify_leader_block(&self, s: &mut MachineState) -> Option<Hash> {
        let votes = self.vote_store.proposal_votes(s.period, s.round);

        let give_up_soft = self.give_up_soft_voted_block(s);
        let mut leader: Option<(plexus_crypto::vrf::VrfOutput, Hash)> = None;

        for vote in votes {
            if vote.round() != s.round || vote.vote_type() != VoteType::Propose {
                continue;
            }
            let proposed = *vote.block_hash();

            // Never keep soft voting a value being given up
            if proposed == s.last_soft_voted_value && give_up_soft {
                continue;
            }

            let eligible = s.round == 1
                || (proposed != NULL_BLOCK_HASH && !self.chain.find_block_in_chain(&proposed));
            if !eligible {
                continue;
            }

            let credential = vote.sortition().output;
            let smaller = match &leader {
                None => true,
                Some((best, _)) => credential[..] < best[..],
            };
            if smaller {
                leader = Some((credential, proposed));
            }
        }

        leader.map(|(_, hash)| hash)
    }

    // ── own block proposal ──────────────────────────────────────────────

    /// VRF-elect and build an own block over the DAG frontier. `None`
    /// when not elected or no new DAG content exists.
    fn propose_own_block(&self, s: &mut MachineState) -> Option<Hash> {
        if s.dpos_view.own_stake == 0 {
            return None;
        }

        // Proposal election is a stake-1 draw
        let message = SortitionMessage::new(VoteType::Propose, s.period, s.round, s.step);
        let sortition = VrfSortition::generate(&self.vrf_keypair, message);
        let elected = sortition.calculate_weight(
            1,
            s.dpos_view.total_stake,
            s.dpos_view.sortition_threshold,
            &self.node_address,
        );
        if elected == 0 {
            return None;
        }

        let last_block_hash = self.chain.last_block_hash();
        let last_anchor = if last_block_hash == NULL_BLOCK_HASH {
            self.dag_genesis
        } else {
            match self.db.period_data(self.chain.tip_period()) {
                Ok(Some(data)) => *data.pbft_block.dag_anchor_hash(),
                _ => self.dag_genesis,
            }
        };

        let ghost = self.dag.ghost_path(&last_anchor);
        if ghost.is_empty() {
            debug!("ghost path empty, nothing to propose");
            return None;
        }

        let anchor = if (ghost.len() as u64) <= self.config.dag_blocks_size {
            // Step back from the frontier so slower peers can still sync
            // the DAG before the block arrives
            let move_back = self.config.ghost_path_move_back as usize;
            let mut index = if ghost.len() < move_back + 1 {
                0
            } else {
                ghost.len() - 1 - move_back
            };
            while index < ghost.len() - 1 && ghost[index] == last_anchor {
                index += 1;
            }
            ghost[index]
        } else {
            ghost[self.config.dag_blocks_size as usize - 1]
        };

        if anchor == self.dag_genesis || anchor == last_anchor {
            debug!("no new DAG blocks since last anchor, not proposing");
            return None;
        }

        let order = self.dag.dag_block_order(&anchor, s.period);
        if order.is_empty() {
            warn!(
                "DAG order unavailable for proposed anchor {}",
                plexus_core::abridged(&anchor)
            );
            self.sync_from_peers(s, SyncRequestReason::MissingDag, true);
            return None;
        }

        let mut seen = std::collections::HashSet::new();
        let mut non_finalized: Vec<Hash> = Vec::new();
        for dag_hash in &order {
            let dag_block = self.dag.block(dag_hash)?;
            for trx in &dag_block.trxs {
                if seen.insert(*trx) && !self.engine.transaction_finalized(trx) {
                    non_finalized.push(*trx);
                }
            }
        }

        let order_hash = calculate_order_hash(&order, &non_finalized);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let block = match PbftBlock::new(
            last_block_hash,
            anchor,
            order_hash,
            s.period,
            self.node_address,
            timestamp,
            &self.keypair,
        ) {
            Ok(block) => Arc::new(block),
            Err(e) => {
                error!("failed to sign proposed block: {e}");
                return None;
            }
        };
        let block_hash = *block.hash();

        self.chain.push_unverified_block(block.clone());
        self.network.broadcast_pbft_block(block);

        info!(
            "proposed block {} for period {}, round {}",
            plexus_core::abridged(&block_hash),
            s.period,
            s.round
        );
        Some(block_hash)
    }

    // ── DAG reconstruction ──────────────────────────────────────────────

    /// Verify the DAG holds the complete content behind `block_hash` and
    /// its declared order hash, assembling the PeriodData for commit.
    /// Triggers a DAG sync and returns false when content is missing.
    fn reconstruct_period_data(&self, s: &mut MachineState, block_hash: &Hash) -> bool {
        if let Some(cached) = &s.cert_period_data {
            if cached.pbft_block.hash() == block_hash {
                return true;
            }
        }

        let Some(block) = self.unfinalized_block(block_hash) else {
            return false;
        };

        let anchor = *block.dag_anchor_hash();
        let order = self.dag.dag_block_order(&anchor, block.period());
        if order.is_empty() {
            self.sync_from_peers(s, SyncRequestReason::MissingDag, true);
            return false;
        }

        let mut dag_blocks = Vec::with_capacity(order.len());
        let mut seen = std::collections::HashSet::new();
        let mut non_finalized: Vec<Hash> = Vec::new();
        for dag_hash in &order {
            let Some(dag_block) = self.dag.block(dag_hash) else {
                self.sync_from_peers(s, SyncRequestReason::MissingDag, true);
                return false;
            };
            for trx in &dag_block.trxs {
                if seen.insert(*trx) && !self.engine.transaction_finalized(trx) {
                    non_finalized.push(*trx);
                }
            }
            dag_blocks.push(dag_block);
        }

        let computed = calculate_order_hash(&order, &non_finalized);
        if computed != *block.order_hash() {
            error!(
                "order hash mismatch for block {}: declared {}, computed {}",
                plexus_core::abridged(block_hash),
                plexus_core::abridged(block.order_hash()),
                plexus_core::abridged(&computed),
            );
            return false;
        }

        let mut transactions = Vec::with_capacity(non_finalized.len());
        for trx_hash in &non_finalized {
            let Some(trx) = self.dag.transaction(trx_hash) else {
                self.sync_from_peers(s, SyncRequestReason::MissingDag, true);
                return false;
            };
            transactions.push(trx);
        }

        s.cert_period_data = Some(PeriodData::new(
            block,
            Vec::new(),
            dag_blocks,
            transactions,
            None,
        ));
        true
    }

    // ── commit path ─────────────────────────────────────────────────────

    /// Push a block holding a 2t+1 cert quorum into the chain.
    fn push_cert_voted_block(
        &self,
        s: &mut MachineState,
        block_hash: Hash,
        cert_votes: Vec<Arc<Vote>>,
    ) -> Result<bool> {
        let Some(block) = self.unfinalized_block(&block_hash) else {
            debug!(
                "cert voted block {} not yet held",
                plexus_core::abridged(&block_hash)
            );
            return Ok(false);
        };

        if let Err(e) = self.chain.check_block_validation(&block) {
            warn!(
                "cert voted block {} failed validation: {e}",
                plexus_core::abridged(&block_hash)
            );
            self.sync_from_peers(s, SyncRequestReason::InvalidCertVotedBlock, false);
            return Ok(false);
        }

        if !self.reconstruct_period_data(s, &block_hash) {
            debug!(
                "DAG not yet built up for cert voted block {}",
                plexus_core::abridged(&block_hash)
            );
            return Ok(false);
        }

        let mut data = s.cert_period_data.take().unwrap_or_else(|| {
            PeriodData::new(block.clone(), Vec::new(), Vec::new(), Vec::new(), None)
        });
        data.cert_votes = cert_votes;

        self.finalizer.finalize_block(data)?;
        let _ = self.finalizer.take_executed();

        s.last_cert_voted_value = NULL_BLOCK_HASH;
        s.proposed_block = (NULL_BLOCK_HASH, false);
        info!(
            "pushed cert voted block {} for period {} in round {}",
            plexus_core::abridged(&block_hash),
            s.period,
            s.round
        );

        self.advance_period(s)?;
        Ok(true)
    }

    // ── give-up policy ──────────────────────────────────────────────────

    fn give_up_soft_voted_block(&self, s: &MachineState) -> bool {
        if s.last_soft_voted_value == NULL_BLOCK_HASH {
            return false;
        }

        if let Some(block) = self.unfinalized_block(&s.previous_round_next_voted_value) {
            if self.chain.check_block_validation(&block).is_err() {
                // Block received, but it cannot extend the chain
                return true;
            }
        }

        let waited_ms = s.time_began_waiting_soft_voted_block.elapsed().as_millis() as u64;
        if waited_ms > self.config.max_wait_for_soft_voted_block_ms() {
            debug!(
                "waited {waited_ms} ms for soft voted block {}, giving up",
                plexus_core::abridged(&s.last_soft_voted_value)
            );
            return true;
        }
        false
    }

    fn give_up_next_voted_block(&self, s: &MachineState) -> bool {
        if s.last_cert_voted_value != NULL_BLOCK_HASH {
            return false;
        }

        if s.previous_round_next_voted_value == NULL_BLOCK_HASH {
            return true;
        }
        if s.previous_round_next_voted_null {
            // Two voted values in the previous round and the null block
            // also reached quorum
            return true;
        }

        if self.chain.find_block_in_chain(&s.previous_round_next_voted_value) {
            debug!(
                "next voted value {} already in chain, giving it up",
                plexus_core::abridged(&s.previous_round_next_voted_value)
            );
            return true;
        }

        if let Some(block) = self.unfinalized_block(&s.previous_round_next_voted_value) {
            if self.chain.check_block_validation(&block).is_err() {
                return true;
            }
        }

        false
    }

    // ── misc helpers ────────────────────────────────────────────────────

    /// A proposed-but-unfinalized block, from the in-memory table or the
    /// persisted cert-voted block column.
    fn unfinalized_block(&self, block_hash: &Hash) -> Option<Arc<PbftBlock>> {
        if *block_hash == NULL_BLOCK_HASH {
            return None;
        }
        if let Some(block) = self.chain.unverified_block(block_hash) {
            return Some(block);
        }
        match self.db.cert_voted_block(block_hash) {
            Ok(Some(block)) => {
                let block = Arc::new(block);
                self.chain.push_unverified_block(block.clone());
                Some(block)
            }
            _ => None,
        }
    }

    fn sync_requested_already_this_step(&self, s: &MachineState) -> bool {
        s.round == s.round_last_requested_sync && s.step == s.step_last_requested_sync
    }

    fn broadcast_already_this_step(&self, s: &MachineState) -> bool {
        s.round == s.round_last_broadcast && s.step == s.step_last_broadcast
    }

    /// Ask the network layer to (re)start syncing, at most once per step.
    fn sync_from_peers(&self, s: &mut MachineState, reason: SyncRequestReason, force: bool) {
        if self.stopped() {
            return;
        }
        if !self.sync_queue.is_empty() {
            trace!("sync queue still draining, skipping sync request");
            return;
        }
        if self.sync_requested_already_this_step(s) {
            return;
        }

        info!(
            "requesting pbft sync ({reason:?}) in round {}, step {}",
            s.round, s.step
        );
        self.network.restart_syncing(reason, force);
        s.round_last_requested_sync = s.round;
        s.step_last_requested_sync = s.step;
    }
}
