//! The consensus state machine.
//!
//! One event loop owns the entire round state: external gossip messages,
//! the node's own votes and proposals, and timeout firings all arrive
//! through a single multi-producer single-consumer queue, and every event
//! is appended to the WAL (fsynced) before the machine acts on it. No
//! state-machine mutation ever races with another mutation; readers get a
//! consistent snapshot through [`ConsensusHandle::get_round_state`].
//!
//! ## Height / round / step driver
//!
//! Heights advance only on commit. Within a height, rounds advance on
//! precommit-wait timeouts; within a round the steps run
//! `NewRound → Propose → Prevote → (PrevoteWait) → Precommit →
//! (PrecommitWait) → Commit`. Transitions are guarded so that stale or
//! replayed events can never move the machine backwards.
//!
//! ## Locking rules
//!
//! On 2f+1 prevotes for block B at round r the node locks on B
//! (`locked_round = r`) and precommits it; from then on it prevotes only B
//! until a later-round prevote quorum for a different block unlocks it.
//! On 2f+1 prevotes for nil it unlocks and precommits nil. These two rules
//! are what make two conflicting commits at one height impossible with
//! less than a third of the power misbehaving.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use tessera_config::ConsensusConfig;
use tessera_crypto::Address;
use tessera_types::{
    Block, BlockId, Commit, ExtendedCommit, Header, Height, PartSet, Proposal, Round,
    SignatureCache, TimestampMs, ValidatorSet, ValidatorSetError, Vote, VoteType,
    BLOCK_PART_SIZE_BYTES,
};

use crate::app::{Application, FinalizeBlockRequest};
use crate::current_time_ms;
use crate::evidence_pool::EvidencePool;
use crate::messages::{ConsensusMessage, GossipMessage, StateEvent, WalMessage};
use crate::privval::{PrivValidator, PrivValidatorError, SignStep};
use crate::store::{BlockStore, ChainState, Mempool, StateStore};
use crate::timeout::{TimeoutInfo, TimeoutScheduler};
use crate::vote_set::{HeightVoteSet, VoteSetError};
use crate::wal::{Wal, WalError};
use crate::CancelToken;

/// The step of the state machine within a round.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Step {
    /// Quiescence after a commit, before round 0 of the next height
    NewHeight,
    /// Round started, waiting to enter propose (possibly for transactions)
    NewRound,
    /// Waiting for (or producing) the round's proposal
    Propose,
    /// Prevote broadcast, collecting prevotes
    Prevote,
    /// 2f+1 prevotes seen without a majority, waiting for stragglers
    PrevoteWait,
    /// Precommit broadcast, collecting precommits
    Precommit,
    /// 2f+1 precommits seen without a majority, waiting for stragglers
    PrecommitWait,
    /// 2f+1 precommits for a block, waiting for its parts / finalizing
    Commit,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Step::NewHeight => "NewHeight",
            Step::NewRound => "NewRound",
            Step::Propose => "Propose",
            Step::Prevote => "Prevote",
            Step::PrevoteWait => "PrevoteWait",
            Step::Precommit => "Precommit",
            Step::PrecommitWait => "PrecommitWait",
            Step::Commit => "Commit",
        };
        write!(f, "{name}")
    }
}

/// Errors from the consensus state machine.
///
/// Anything that could corrupt consensus state is fatal and tears the loop
/// down; per-message problems are handled locally and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The WAL could not be written; continuing would lose crash safety
    #[error("WAL failure: {0}")]
    Wal(#[from] WalError),

    /// The application returned a different app hash than the chain agreed on
    #[error("app hash mismatch at height {height}: expected {expected}, got {got}")]
    AppHashMismatch {
        /// Height of the divergence
        height: Height,
        /// Hash recorded by consensus
        expected: String,
        /// Hash the application produced
        got: String,
    },

    /// The application supplied validator updates the set rejects
    #[error("invalid validator updates from application: {0}")]
    InvalidValidatorUpdates(#[from] ValidatorSetError),

    /// An internal invariant was violated
    #[error("consensus state corrupted: {0}")]
    Corrupted(String),

    /// The event channel closed while the machine was running
    #[error("event channel closed")]
    ChannelClosed,

    /// The operation was cancelled via its token
    #[error("cancelled")]
    Cancelled,
}

/// Immutable snapshot of the state machine's per-height state.
#[derive(Debug, Clone)]
pub struct RoundState {
    /// Current height
    pub height: Height,
    /// Current round
    pub round: Round,
    /// Current step
    pub step: Step,
    /// When this height started (Unix millis)
    pub start_time: TimestampMs,
    /// Validator set for the current round (priorities advanced to `round`)
    pub validators: ValidatorSet,
    /// The round's proposal, if received
    pub proposal: Option<Proposal>,
    /// The proposed block, once all parts arrived
    pub proposal_block: Option<Block>,
    /// Parts of the proposed block as they arrive
    pub proposal_block_parts: Option<PartSet>,
    /// Round we locked in, -1 if not locked
    pub locked_round: Round,
    /// The locked block
    pub locked_block: Option<Block>,
    /// Most recent round with a prevote quorum for a block, -1 if none
    pub valid_round: Round,
    /// The block that gathered that quorum (re-proposable)
    pub valid_block: Option<Block>,
    /// Round in which the commit quorum formed, -1 before commit
    pub commit_round: Round,
    /// Extended commit for the previous height (drives `last_commit`)
    pub last_commit: Option<ExtendedCommit>,
    /// All votes of this height, by round and type
    pub votes: HeightVoteSet,
    /// Whether the precommit-wait timeout was already armed this round
    triggered_precommit_wait: bool,
}

impl RoundState {
    fn new(
        chain_id: &str,
        height: Height,
        validators: ValidatorSet,
        last_commit: Option<ExtendedCommit>,
    ) -> Self {
        Self {
            height,
            round: 0,
            step: Step::NewHeight,
            start_time: current_time_ms(),
            votes: HeightVoteSet::new(chain_id, height, validators.clone()),
            validators,
            proposal: None,
            proposal_block: None,
            proposal_block_parts: None,
            locked_round: -1,
            locked_block: None,
            valid_round: -1,
            valid_block: None,
            commit_round: -1,
            last_commit,
            triggered_precommit_wait: false,
        }
    }
}

#[cfg(test)]
impl RoundState {
    pub(crate) fn new_for_tests(height: Height, validators: ValidatorSet) -> Self {
        Self::new("test-chain", height, validators, None)
    }
}

impl std::fmt::Display for RoundState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RoundState(h={} r={} step={} locked_r={} valid_r={})",
            self.height, self.round, self.step, self.locked_round, self.valid_round
        )
    }
}

/// Cloneable handle for feeding events into the machine and reading
/// snapshots out of it.
#[derive(Clone)]
pub struct ConsensusHandle {
    event_tx: mpsc::Sender<StateEvent>,
    shared: Arc<RwLock<RoundState>>,
}

impl ConsensusHandle {
    /// Deliver a message received from `peer_id`.
    pub async fn send_external(
        &self,
        peer_id: &str,
        msg: ConsensusMessage,
    ) -> Result<(), StateError> {
        self.event_tx
            .send(StateEvent::External {
                peer_id: peer_id.to_string(),
                msg,
            })
            .await
            .map_err(|_| StateError::ChannelClosed)
    }

    /// Ask the event loop to stop after the current event.
    pub async fn quit(&self) -> Result<(), StateError> {
        self.event_tx
            .send(StateEvent::Quit)
            .await
            .map_err(|_| StateError::ChannelClosed)
    }

    /// A consistent snapshot of the round state (read-lock and clone).
    pub fn get_round_state(&self) -> RoundState {
        self.shared.read().clone()
    }
}

#[cfg(test)]
impl ConsensusHandle {
    pub(crate) fn new_for_tests(
        event_tx: mpsc::Sender<StateEvent>,
        shared: Arc<RwLock<RoundState>>,
    ) -> Self {
        Self { event_tx, shared }
    }
}

/// The consensus state machine and its event loop.
pub struct ConsensusState<A: Application> {
    config: ConsensusConfig,
    chain_state: ChainState,
    rs: RoundState,

    wal: Wal,
    privval: Option<Box<dyn PrivValidator>>,
    privval_address: Option<Address>,
    app: Arc<A>,
    block_store: Arc<dyn BlockStore>,
    state_store: Arc<dyn StateStore>,
    mempool: Arc<dyn Mempool>,
    evidence_pool: Arc<EvidencePool>,

    event_tx: mpsc::Sender<StateEvent>,
    event_rx: mpsc::Receiver<StateEvent>,
    timeout_rx: mpsc::Receiver<TimeoutInfo>,
    timeouts: TimeoutScheduler,
    outbound_tx: mpsc::Sender<GossipMessage>,
    shared: Arc<RwLock<RoundState>>,
    sig_cache: SignatureCache,
    replay_mode: bool,
}

impl<A: Application> ConsensusState<A> {
    /// Build the state machine around its collaborators.
    ///
    /// `privval` is `None` for a full node that follows consensus without
    /// voting.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ConsensusConfig,
        chain_state: ChainState,
        app: Arc<A>,
        block_store: Arc<dyn BlockStore>,
        state_store: Arc<dyn StateStore>,
        mempool: Arc<dyn Mempool>,
        evidence_pool: Arc<EvidencePool>,
        privval: Option<Box<dyn PrivValidator>>,
    ) -> Result<(Self, ConsensusHandle, mpsc::Receiver<GossipMessage>), StateError> {
        let wal = Wal::open(&config.wal_file(), false)?;

        let privval_address = match &privval {
            Some(pv) => match pv.pub_key() {
                Ok(key) => Some(key.address()),
                Err(PrivValidatorError::PubKeyIsNotSet) => None,
                Err(e) => {
                    warn!(error = %e, "priv validator has no usable key; running as full node");
                    None
                }
            },
            None => None,
        };

        let height = chain_state.next_height();
        let last_commit = if chain_state.last_block_height > 0 {
            block_store.load_seen_commit(chain_state.last_block_height)
        } else {
            None
        };
        let rs = RoundState::new(
            &chain_state.chain_id,
            height,
            chain_state.validators.clone(),
            last_commit,
        );

        let (event_tx, event_rx) = mpsc::channel(1024);
        let (timeout_tx, timeout_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::channel(1024);
        let shared = Arc::new(RwLock::new(rs.clone()));

        let handle = ConsensusHandle {
            event_tx: event_tx.clone(),
            shared: shared.clone(),
        };

        Ok((
            Self {
                config,
                chain_state,
                rs,
                wal,
                privval,
                privval_address,
                app,
                block_store,
                state_store,
                mempool,
                evidence_pool,
                event_tx,
                event_rx,
                timeout_rx,
                timeouts: TimeoutScheduler::new(timeout_tx),
                outbound_tx,
                shared,
                sig_cache: SignatureCache::new(4096),
                replay_mode: false,
            },
            handle,
            outbound_rx,
        ))
    }

    /// The chain state after the last committed height.
    pub fn chain_state(&self) -> &ChainState {
        &self.chain_state
    }

    /// Run the event loop until `Quit` or a fatal error.
    ///
    /// Replays the WAL past the last `EndHeight` marker first, then starts
    /// the current height and processes events in arrival order.
    pub async fn run(mut self, cancel: CancelToken) -> Result<(), StateError> {
        let replayed = self.replay_wal().await?;
        if replayed > 0 {
            info!(
                frames = replayed,
                height = self.rs.height,
                round = self.rs.round,
                step = %self.rs.step,
                "WAL replay complete"
            );
        }
        if self.rs.step == Step::NewHeight {
            self.start_height().await?;
        }
        self.publish_round_state();

        loop {
            if cancel.is_cancelled() {
                self.timeouts.cancel_all();
                return Err(StateError::Cancelled);
            }
            tokio::select! {
                event = self.event_rx.recv() => {
                    let Some(event) = event else {
                        return Err(StateError::ChannelClosed);
                    };
                    if matches!(event, StateEvent::Quit) {
                        info!("consensus state machine stopping");
                        self.timeouts.cancel_all();
                        return Ok(());
                    }
                    // Persist before acting: the effect of an event must
                    // never be observable unless the event survives a crash.
                    self.wal.write_sync(WalMessage::Event(event.clone()))?;
                    self.handle_event(event).await?;
                }
                timeout = self.timeout_rx.recv() => {
                    let Some(timeout) = timeout else {
                        return Err(StateError::ChannelClosed);
                    };
                    self.wal.write_sync(WalMessage::Timeout(timeout))?;
                    self.handle_timeout(timeout).await?;
                }
            }
            self.publish_round_state();
        }
    }

    fn publish_round_state(&self) {
        *self.shared.write() = self.rs.clone();
    }

    /// Replay WAL frames recorded after the last committed height.
    async fn replay_wal(&mut self) -> Result<usize, StateError> {
        let committed = self.chain_state.last_block_height;
        let mut reader = if committed == 0 {
            self.wal.reader()?
        } else {
            match self.wal.search_for_end_height(committed)? {
                Some(reader) => reader,
                None => {
                    if self.wal.size() > 0 {
                        warn!(
                            height = committed,
                            "no EndHeight marker in WAL; starting height fresh"
                        );
                    }
                    return Ok(0);
                }
            }
        };

        self.replay_mode = true;
        let mut frames = 0usize;
        while let Some(timed) = reader.next_message()? {
            frames += 1;
            match timed.msg {
                WalMessage::Event(event) => {
                    self.restore_sign_state(&event);
                    self.handle_event(event).await?;
                }
                WalMessage::Timeout(info) => self.handle_timeout(info).await?,
                WalMessage::EndHeight(h) => {
                    // A later marker than the state store knows about means
                    // the stores and the WAL disagree; the handshake should
                    // have reconciled this.
                    return Err(StateError::Corrupted(format!(
                        "unexpected EndHeight({h}) past committed height {committed}"
                    )));
                }
            }
        }
        self.replay_mode = false;
        Ok(frames)
    }

    /// Re-seed the signer's last-sign-state from our own replayed
    /// messages, so post-replay decisions cannot double-sign.
    fn restore_sign_state(&mut self, event: &StateEvent) {
        let StateEvent::Internal(msg) = event else {
            return;
        };
        let Some(our_address) = self.privval_address else {
            return;
        };
        let Some(privval) = self.privval.as_mut() else {
            return;
        };
        let chain_id = &self.chain_state.chain_id;
        match msg {
            ConsensusMessage::Vote(vote) if vote.validator_address == our_address => {
                privval.restore_sign_state(
                    vote.height,
                    vote.round,
                    SignStep::from(vote.vote_type),
                    &vote.sign_bytes(chain_id),
                    &vote.signature,
                );
            }
            ConsensusMessage::Proposal(proposal) => {
                privval.restore_sign_state(
                    proposal.height,
                    proposal.round,
                    SignStep::Propose,
                    &proposal.sign_bytes(chain_id),
                    &proposal.signature,
                );
            }
            _ => {}
        }
    }

    /// Begin the current height: schedule the post-commit quiescence that
    /// leads into round 0.
    async fn start_height(&mut self) -> Result<(), StateError> {
        info!(height = self.rs.height, "starting height");
        self.timeouts.schedule(
            Step::NewHeight,
            self.rs.height,
            0,
            self.config.commit_timeout(),
        );
        Ok(())
    }

    async fn handle_event(&mut self, event: StateEvent) -> Result<(), StateError> {
        match event {
            StateEvent::External { peer_id, msg } => {
                trace!(peer = %peer_id, %msg, "external message");
                self.handle_msg(msg, false).await
            }
            StateEvent::Internal(msg) => {
                trace!(%msg, "internal message");
                self.handle_msg(msg, true).await
            }
            StateEvent::Quit => Ok(()),
        }
    }

    async fn handle_msg(&mut self, msg: ConsensusMessage, own: bool) -> Result<(), StateError> {
        match msg {
            ConsensusMessage::Proposal(proposal) => {
                if self.set_proposal(proposal.clone()) && own {
                    self.gossip(GossipMessage::Proposal(proposal)).await;
                }
                // A proposal with a single already-complete part set can
                // only become complete through its parts.
                Ok(())
            }
            ConsensusMessage::BlockPart {
                height,
                round,
                part,
            } => {
                let added = self.add_proposal_block_part(height, round, part.clone()).await?;
                if added && own {
                    self.gossip(GossipMessage::BlockPart {
                        height,
                        round,
                        part,
                    })
                    .await;
                }
                Ok(())
            }
            ConsensusMessage::Vote(vote) => {
                let added = self.try_add_vote(vote.clone()).await?;
                if added && own {
                    self.gossip(GossipMessage::Vote(vote)).await;
                }
                Ok(())
            }
        }
    }

    /// Send a message to the gossip layer (dropped silently when no
    /// reactor is attached, e.g. in single-node tests).
    async fn gossip(&self, msg: GossipMessage) {
        if self.replay_mode {
            return;
        }
        let _ = self.outbound_tx.send(msg).await;
    }

    async fn handle_timeout(&mut self, info: TimeoutInfo) -> Result<(), StateError> {
        if info.height != self.rs.height
            || info.round < self.rs.round
            || (info.round == self.rs.round && info.step < self.rs.step)
        {
            trace!(%info, current = %self.rs, "ignoring stale timeout");
            return Ok(());
        }
        debug!(%info, "timeout fired");
        match info.step {
            Step::NewHeight => self.enter_new_round(info.height, 0).await,
            Step::NewRound => {
                // Waiting for transactions before proposing an empty block.
                if self.config.create_empty_blocks || self.mempool.size() > 0 {
                    self.enter_propose(info.height, info.round).await
                } else {
                    self.schedule_wait_for_txs(info.height, info.round);
                    Ok(())
                }
            }
            Step::Propose => self.enter_prevote(info.height, info.round).await,
            Step::PrevoteWait => self.enter_precommit(info.height, info.round).await,
            Step::PrecommitWait => self.enter_new_round(info.height, info.round + 1).await,
            _ => Ok(()),
        }
    }

    fn schedule_wait_for_txs(&self, height: Height, round: Round) {
        let interval = if self.config.create_empty_blocks_interval.is_zero() {
            self.config.peer_gossip_sleep_duration
        } else {
            self.config.create_empty_blocks_interval
        };
        self.timeouts.schedule(Step::NewRound, height, round, interval);
    }

    // ------------------------------------------------------------------
    // Step transitions
    // ------------------------------------------------------------------

    /// Enter a round: reset per-round proposal state, advance the proposer
    /// election, and head for propose (possibly waiting for transactions).
    async fn enter_new_round(&mut self, height: Height, round: Round) -> Result<(), StateError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step != Step::NewHeight)
        {
            return Ok(());
        }
        info!(height, round, "entering new round");

        if round > 0 {
            self.rs.validators = self
                .chain_state
                .validators
                .copy_increment_proposer_priority(round);
            self.rs.proposal = None;
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = None;
        }
        self.rs.round = round;
        self.rs.step = Step::NewRound;
        self.rs.triggered_precommit_wait = false;

        self.broadcast_new_round_step().await;

        let wait_for_txs = !self.config.create_empty_blocks && self.mempool.size() == 0;
        if wait_for_txs {
            self.schedule_wait_for_txs(height, round);
            Ok(())
        } else if !self.config.create_empty_blocks_interval.is_zero()
            && self.mempool.size() == 0
            && round == 0
        {
            // Empty blocks allowed, but rate-limited.
            self.timeouts.schedule(
                Step::NewRound,
                height,
                round,
                self.config.create_empty_blocks_interval,
            );
            Ok(())
        } else {
            self.enter_propose(height, round).await
        }
    }

    async fn broadcast_new_round_step(&self) {
        self.gossip(GossipMessage::NewRoundStep {
            height: self.rs.height,
            round: self.rs.round,
            step: self.rs.step,
            seconds_since_start_time: current_time_ms().saturating_sub(self.rs.start_time) / 1000,
            last_commit_round: self
                .rs
                .last_commit
                .as_ref()
                .map(|c| c.round)
                .unwrap_or(-1),
        })
        .await;
    }

    /// Enter propose: arm the propose deadline and, when we are this
    /// round's proposer, build and sign the proposal.
    async fn enter_propose(&mut self, height: Height, round: Round) -> Result<(), StateError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::Propose)
        {
            return Ok(());
        }
        debug!(height, round, "entering propose");
        self.rs.round = round;
        self.rs.step = Step::Propose;

        self.timeouts.schedule(
            Step::Propose,
            height,
            round,
            self.config.propose_timeout(round),
        );

        let our_turn = match (&self.privval_address, self.rs.validators.proposer()) {
            (Some(address), Some(proposer)) => address == &proposer.address,
            _ => false,
        };
        if our_turn {
            info!(height, round, "we are the proposer");
            self.decide_proposal(height, round).await;
        }

        // The proposal may already be complete (replay, late entry).
        if self.is_proposal_complete() {
            self.enter_prevote(height, round).await?;
        }
        Ok(())
    }

    /// Whether we hold the round's proposal and its full block.
    fn is_proposal_complete(&self) -> bool {
        self.rs.proposal.is_some() && self.rs.proposal_block.is_some()
    }

    /// Build (or reuse) a block, sign the proposal, and feed proposal and
    /// parts through the internal queue.
    async fn decide_proposal(&mut self, height: Height, round: Round) {
        if self.replay_mode {
            return;
        }
        let (block, parts) = if let Some(valid) = self.rs.valid_block.clone() {
            debug!(height, round, "re-proposing valid block");
            let parts = valid.make_part_set(BLOCK_PART_SIZE_BYTES);
            (valid, parts)
        } else {
            match self.create_proposal_block().await {
                Some(pair) => pair,
                None => {
                    debug!(height, round, "cannot build a proposal block yet");
                    return;
                }
            }
        };

        let block_id = BlockId {
            hash: block.hash(),
            part_set_header: parts.header(),
        };
        let mut proposal = Proposal::new(height, round, self.rs.valid_round, block_id);
        proposal.timestamp = current_time_ms();

        let Some(privval) = self.privval.as_mut() else {
            return;
        };
        match privval.sign_proposal(&self.chain_state.chain_id, &mut proposal) {
            Ok(()) => {}
            Err(PrivValidatorError::PubKeyIsNotSet) => {
                debug!(height, round, "no signing key; skipping proposal");
                return;
            }
            Err(e) => {
                error!(height, round, error = %e, "failed to sign proposal");
                return;
            }
        }

        info!(height, round, block_id = %proposal.block_id, "proposing block");

        // Through the internal queue so the WAL sees them before any
        // effect. try_send because this loop is the queue's only consumer:
        // awaiting a full queue here would deadlock it.
        self.queue_internal(ConsensusMessage::Proposal(proposal));
        for index in 0..parts.total() {
            if let Some(part) = parts.get_part(index) {
                self.queue_internal(ConsensusMessage::BlockPart {
                    height,
                    round,
                    part: part.clone(),
                });
            }
        }
    }

    fn queue_internal(&self, msg: ConsensusMessage) {
        if let Err(e) = self.event_tx.try_send(StateEvent::Internal(msg)) {
            error!(error = %e, "internal event queue full; dropping own message");
        }
    }

    /// Assemble a fresh block from the mempool, the evidence pool, and the
    /// previous height's commit.
    async fn create_proposal_block(&mut self) -> Option<(Block, PartSet)> {
        let height = self.rs.height;
        let last_commit = if height == self.chain_state.initial_height {
            Commit::default()
        } else if let Some(extended) = &self.rs.last_commit {
            extended.to_commit()
        } else {
            self.block_store
                .load_seen_commit(height - 1)
                .map(|e| e.to_commit())?
        };

        let params = &self.chain_state.consensus_params;
        let evidence = self
            .evidence_pool
            .pending_evidence(params.evidence.max_bytes);
        let raw_txs = self.mempool.reap(params.block.max_bytes);
        let txs = self
            .app
            .prepare_proposal(raw_txs, params.block.max_bytes)
            .await;

        let time = current_time_ms().max(self.chain_state.last_block_time + 1);
        let mut block = Block {
            header: Header {
                chain_id: self.chain_state.chain_id.clone(),
                height,
                time,
                last_block_id: self.chain_state.last_block_id,
                validators_hash: self.chain_state.validators.hash(),
                next_validators_hash: self.chain_state.next_validators.hash(),
                consensus_hash: params.hash(),
                app_hash: self.chain_state.app_hash,
                last_results_hash: self.chain_state.last_results_hash,
                proposer_address: self.privval_address?,
                ..Default::default()
            },
            data: txs,
            evidence,
            last_commit,
        };
        block.header.data_hash = tessera_crypto::merkle_root(
            &block.data.iter().map(|tx| tx.hash()).collect::<Vec<_>>(),
        );
        block.header.evidence_hash = tessera_crypto::merkle_root(
            &block.evidence.iter().map(|e| e.hash()).collect::<Vec<_>>(),
        );
        block.header.last_commit_hash = block.last_commit.hash();

        let parts = block.make_part_set(BLOCK_PART_SIZE_BYTES);
        Some((block, parts))
    }

    /// Accept the round's proposal after verifying the proposer signature.
    ///
    /// Returns whether the proposal was accepted.
    fn set_proposal(&mut self, proposal: Proposal) -> bool {
        if self.rs.proposal.is_some() {
            return false;
        }
        if proposal.height != self.rs.height || proposal.round != self.rs.round {
            trace!(%proposal, current = %self.rs, "proposal for other height/round");
            return false;
        }
        if proposal.validate_basic().is_err() {
            warn!(%proposal, "malformed proposal");
            return false;
        }

        let Some(proposer) = self.rs.validators.proposer() else {
            return false;
        };
        let Some(proposer_key) = proposer.pub_key.clone() else {
            return false;
        };
        if !proposer_key.verify(
            &proposal.sign_bytes(&self.chain_state.chain_id),
            &proposal.signature,
        ) {
            warn!(%proposal, proposer = %proposer.address, "invalid proposal signature");
            return false;
        }

        debug!(%proposal, "proposal accepted");
        if self.rs.proposal_block_parts.is_none() {
            self.rs.proposal_block_parts =
                Some(PartSet::new_for_header(proposal.block_id.part_set_header));
        }
        self.rs.proposal = Some(proposal);
        true
    }

    /// Add one block part; completing the block may advance the step.
    ///
    /// Returns whether the part was new.
    async fn add_proposal_block_part(
        &mut self,
        height: Height,
        _round: Round,
        part: tessera_types::Part,
    ) -> Result<bool, StateError> {
        if height != self.rs.height {
            trace!(height, current = self.rs.height, "part for other height");
            return Ok(false);
        }
        let Some(parts) = self.rs.proposal_block_parts.as_mut() else {
            trace!("no part set expected yet");
            return Ok(false);
        };
        let added = match parts.add_part(part) {
            Ok(added) => added,
            Err(e) => {
                warn!(error = %e, "rejecting block part");
                return Ok(false);
            }
        };
        if !added || !parts.is_complete() {
            return Ok(added);
        }

        // Block complete: decode and slot it in.
        let bytes = parts
            .assemble()
            .map_err(|e| StateError::Corrupted(e.to_string()))?;
        let block = match Block::from_part_bytes(&bytes) {
            Ok(block) => block,
            Err(e) => {
                warn!(error = %e, "assembled block does not decode");
                self.rs.proposal_block_parts = None;
                return Ok(true);
            }
        };
        if let Some(proposal) = &self.rs.proposal {
            if block.hash() != proposal.block_id.hash {
                warn!("assembled block hash does not match the proposal");
                self.rs.proposal_block_parts = None;
                return Ok(true);
            }
        }
        info!(height, block_hash = %hex::encode(&block.hash()[..8]), "received complete proposal block");
        self.rs.proposal_block = Some(block);

        let round = self.rs.round;
        if self.rs.step == Step::Propose && self.is_proposal_complete() {
            self.enter_prevote(height, round).await?;
        } else if self.rs.step >= Step::Commit {
            self.try_finalize_commit(height).await?;
        } else {
            // A prevote quorum may already point at this block.
            let maj23 = self
                .rs
                .votes
                .prevotes(round)
                .and_then(|set| set.two_thirds_majority());
            if let (Some(maj23), Some(block)) = (maj23, self.rs.proposal_block.as_ref()) {
                if !maj23.is_zero() && maj23.hash == block.hash() && self.rs.valid_round < round {
                    self.rs.valid_round = round;
                    self.rs.valid_block = self.rs.proposal_block.clone();
                }
            }
        }
        Ok(true)
    }

    /// Enter prevote: vote for the locked block, a valid proposal, or nil.
    async fn enter_prevote(&mut self, height: Height, round: Round) -> Result<(), StateError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::Prevote)
        {
            return Ok(());
        }
        debug!(height, round, "entering prevote");
        self.rs.round = round;
        self.rs.step = Step::Prevote;
        self.timeouts.cancel(Step::Propose, height, round);

        let block_id = self.decide_prevote().await;
        self.sign_and_queue_vote(VoteType::Prevote, block_id).await;
        Ok(())
    }

    async fn decide_prevote(&mut self) -> BlockId {
        // Locked: only the locked block until a later polka unlocks us.
        if self.rs.locked_round >= 0 {
            if let Some(locked) = &self.rs.locked_block {
                debug!("prevoting locked block");
                let parts_header = self
                    .rs
                    .proposal
                    .as_ref()
                    .filter(|p| p.block_id.hash == locked.hash())
                    .map(|p| p.block_id.part_set_header)
                    .unwrap_or_else(|| locked.make_part_set(BLOCK_PART_SIZE_BYTES).header());
                return BlockId {
                    hash: locked.hash(),
                    part_set_header: parts_header,
                };
            }
        }

        let Some(block) = self.rs.proposal_block.clone() else {
            debug!("no proposal block; prevoting nil");
            return BlockId::zero();
        };
        let Some(proposal) = self.rs.proposal.clone() else {
            debug!("no proposal; prevoting nil");
            return BlockId::zero();
        };

        if let Err(reason) = self.validate_block(&block) {
            warn!(%reason, "invalid proposal block; prevoting nil");
            return BlockId::zero();
        }
        if !self.app.process_proposal(&block).await {
            warn!("application rejected the proposal; prevoting nil");
            return BlockId::zero();
        }
        proposal.block_id
    }

    /// Enter prevote-wait: 2f+1 prevoted but no single majority yet.
    async fn enter_prevote_wait(&mut self, height: Height, round: Round) -> Result<(), StateError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::PrevoteWait)
        {
            return Ok(());
        }
        debug!(height, round, "entering prevote wait");
        self.rs.step = Step::PrevoteWait;
        self.timeouts.schedule(
            Step::PrevoteWait,
            height,
            round,
            self.config.prevote_timeout(round),
        );
        Ok(())
    }

    /// Enter precommit: lock and precommit on a prevote majority, unlock
    /// on a nil majority, otherwise precommit nil keeping the lock.
    async fn enter_precommit(&mut self, height: Height, round: Round) -> Result<(), StateError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::Precommit)
        {
            return Ok(());
        }
        debug!(height, round, "entering precommit");
        self.rs.round = round;
        self.rs.step = Step::Precommit;
        self.timeouts.cancel(Step::PrevoteWait, height, round);

        let maj23 = self
            .rs
            .votes
            .prevotes(round)
            .and_then(|set| set.two_thirds_majority());

        let vote_id = match maj23 {
            None => {
                debug!("no prevote majority; precommitting nil (lock kept)");
                BlockId::zero()
            }
            Some(id) if id.is_zero() => {
                if self.rs.locked_block.is_some() {
                    info!("prevote majority for nil; unlocking");
                    self.rs.locked_round = -1;
                    self.rs.locked_block = None;
                }
                BlockId::zero()
            }
            Some(id) => {
                if self
                    .rs
                    .locked_block
                    .as_ref()
                    .map(|b| b.hash() == id.hash)
                    .unwrap_or(false)
                {
                    debug!("relocking on the locked block");
                    self.rs.locked_round = round;
                    id
                } else if self
                    .rs
                    .proposal_block
                    .as_ref()
                    .map(|b| b.hash() == id.hash)
                    .unwrap_or(false)
                {
                    let block = self.rs.proposal_block.clone().expect("checked above");
                    if let Err(reason) = self.validate_block(&block) {
                        // We cannot precommit a block that fails validation,
                        // however many prevotes it gathered.
                        error!(%reason, "prevote majority for an invalid block");
                        BlockId::zero()
                    } else {
                        info!(block_id = %id, round, "locking on block");
                        self.rs.locked_round = round;
                        self.rs.locked_block = Some(block.clone());
                        self.rs.valid_round = round;
                        self.rs.valid_block = Some(block);
                        id
                    }
                } else {
                    // Majority for a block we have not seen: drop the lock,
                    // start fetching it, precommit nil.
                    debug!(block_id = %id, "prevote majority for an unseen block");
                    self.rs.locked_round = -1;
                    self.rs.locked_block = None;
                    if self
                        .rs
                        .proposal_block_parts
                        .as_ref()
                        .map(|p| p.header() != id.part_set_header)
                        .unwrap_or(true)
                    {
                        self.rs.proposal_block = None;
                        self.rs.proposal_block_parts =
                            Some(PartSet::new_for_header(id.part_set_header));
                    }
                    BlockId::zero()
                }
            }
        };

        self.sign_and_queue_vote(VoteType::Precommit, vote_id).await;
        Ok(())
    }

    /// Enter precommit-wait: 2f+1 precommitted without a majority; arm the
    /// round-change timeout.
    async fn enter_precommit_wait(
        &mut self,
        height: Height,
        round: Round,
    ) -> Result<(), StateError> {
        if self.rs.height != height || round < self.rs.round || self.rs.triggered_precommit_wait {
            return Ok(());
        }
        debug!(height, round, "entering precommit wait");
        self.rs.triggered_precommit_wait = true;
        if self.rs.step < Step::PrecommitWait {
            self.rs.step = Step::PrecommitWait;
        }
        self.timeouts.schedule(
            Step::PrecommitWait,
            height,
            round,
            self.config.precommit_timeout(round),
        );
        Ok(())
    }

    /// Enter commit: a precommit majority exists for a block; finalize as
    /// soon as we hold all its parts.
    async fn enter_commit(&mut self, height: Height, commit_round: Round) -> Result<(), StateError> {
        if self.rs.height != height || self.rs.step >= Step::Commit {
            return Ok(());
        }
        info!(height, commit_round, "entering commit");
        self.rs.step = Step::Commit;
        self.rs.commit_round = commit_round;
        self.timeouts.cancel(Step::PrevoteWait, height, commit_round);
        self.timeouts.cancel(Step::PrecommitWait, height, commit_round);

        let maj23 = self
            .rs
            .votes
            .precommits(commit_round)
            .and_then(|set| set.two_thirds_majority())
            .ok_or_else(|| {
                StateError::Corrupted("enter_commit without a precommit majority".into())
            })?;

        // The locked block is the committed block more often than not.
        if let Some(locked) = &self.rs.locked_block {
            if locked.hash() == maj23.hash {
                self.rs.proposal_block = Some(locked.clone());
            }
        }
        if self
            .rs
            .proposal_block
            .as_ref()
            .map(|b| b.hash() != maj23.hash)
            .unwrap_or(false)
        {
            self.rs.proposal_block = None;
        }
        if self
            .rs
            .proposal_block_parts
            .as_ref()
            .map(|p| p.header() != maj23.part_set_header)
            .unwrap_or(true)
        {
            if self.rs.proposal_block.is_none() {
                debug!(block_id = %maj23, "committed block not held; awaiting parts");
                self.rs.proposal_block_parts = Some(PartSet::new_for_header(maj23.part_set_header));
            }
        }

        self.try_finalize_commit(height).await
    }

    /// Finalize once the committed block is fully held: execute against
    /// the application, persist everything, and move to the next height.
    async fn try_finalize_commit(&mut self, height: Height) -> Result<(), StateError> {
        if self.rs.height != height || self.rs.step != Step::Commit {
            return Ok(());
        }
        let commit_round = self.rs.commit_round;
        let Some(maj23) = self
            .rs
            .votes
            .precommits(commit_round)
            .and_then(|set| set.two_thirds_majority())
        else {
            return Ok(());
        };
        let Some(block) = self.rs.proposal_block.clone() else {
            return Ok(());
        };
        if block.hash() != maj23.hash {
            return Ok(());
        }

        if let Err(reason) = self.validate_block(&block) {
            // A majority precommitted an invalid block; this node cannot
            // follow them without corrupting its state.
            return Err(StateError::Corrupted(format!(
                "2/3 committed an invalid block at height {height}: {reason}"
            )));
        }

        info!(
            height,
            round = commit_round,
            block_hash = %hex::encode(&block.hash()[..8]),
            txs = block.data.len(),
            evidence = block.evidence.len(),
            "finalizing block"
        );

        let response = self
            .app
            .finalize_block(FinalizeBlockRequest {
                block: block.clone(),
                height,
            })
            .await;

        let seen_commit = self
            .rs
            .votes
            .precommits(commit_round)
            .and_then(|set| set.make_extended_commit())
            .ok_or_else(|| StateError::Corrupted("commit majority without a commit".into()))?;

        let parts_header = maj23.part_set_header;
        self.block_store
            .save_block(block.clone(), parts_header, seen_commit.clone());
        self.state_store.save_finalize_response(height, &response);

        // Advance the chain state: validator sets rotate one height
        // forward and the application's updates land two heights out.
        let next_next_validators = self
            .chain_state
            .apply_validator_updates(&response.validator_updates)?;
        let mut new_state = self.chain_state.clone();
        new_state.last_block_height = height;
        new_state.last_block_id = maj23;
        new_state.last_block_time = block.header.time;
        new_state.last_validators = std::mem::replace(
            &mut new_state.validators,
            new_state.next_validators.clone(),
        );
        new_state.next_validators = next_next_validators;
        new_state.last_results_hash = response.results_hash();
        new_state.app_hash = response.app_hash;
        if let Some(params) = &response.consensus_param_updates {
            new_state.consensus_params = params.clone();
        }
        self.state_store.save(&new_state);
        self.chain_state = new_state;

        self.evidence_pool.update(
            height,
            block.header.time,
            &block.evidence,
            &self.chain_state.consensus_params.evidence,
        );
        self.mempool.update(height, &block.data);

        let retain_height = self.app.commit().await;
        if retain_height > 0 {
            self.state_store.save_retain_height("app", retain_height);
            let pruned = self.block_store.prune_blocks(retain_height);
            if pruned > 0 {
                debug!(retain_height, pruned, "pruned block store");
            }
        }

        // The height is durably committed; mark it so replay starts here.
        self.wal.write_sync(WalMessage::EndHeight(height))?;

        self.timeouts.cancel_all();
        self.rs = RoundState::new(
            &self.chain_state.chain_id,
            self.chain_state.next_height(),
            self.chain_state.validators.clone(),
            Some(seen_commit),
        );
        self.start_height().await
    }

    // ------------------------------------------------------------------
    // Votes
    // ------------------------------------------------------------------

    async fn sign_and_queue_vote(&mut self, vote_type: VoteType, block_id: BlockId) {
        if self.replay_mode {
            return;
        }
        let Some(address) = self.privval_address else {
            // PubKeyIsNotSet: the round proceeds without our vote.
            return;
        };
        let Some((index, _)) = self.rs.validators.get_by_address(&address) else {
            debug!("not a validator at this height; not voting");
            return;
        };

        let mut vote = Vote::new(
            vote_type,
            self.rs.height,
            self.rs.round,
            block_id,
            address,
            index as i32,
        );
        vote.timestamp = current_time_ms();
        if vote_type == VoteType::Precommit && !block_id.is_zero() {
            vote.extension = self.app.extend_vote(self.rs.height, self.rs.round).await;
        }

        let Some(privval) = self.privval.as_mut() else {
            return;
        };
        match privval.sign_vote(&self.chain_state.chain_id, &mut vote) {
            Ok(()) => {}
            Err(PrivValidatorError::PubKeyIsNotSet) => return,
            Err(e) => {
                // Refusing to sign is the safety net working, not a crash.
                error!(error = %e, %vote, "signer refused the vote");
                return;
            }
        }

        debug!(%vote, "signed vote");
        self.queue_internal(ConsensusMessage::Vote(vote));
    }

    /// Add a vote to the height's vote sets and run the quorum-driven
    /// transitions. Returns whether the vote was new.
    async fn try_add_vote(&mut self, vote: Vote) -> Result<bool, StateError> {
        if vote.height != self.rs.height {
            trace!(%vote, height = self.rs.height, "vote for other height");
            return Ok(false);
        }

        let result = match self.rs.votes.add_vote(vote.clone()) {
            Ok(result) => result,
            Err(VoteSetError::Equivocation {
                address,
                existing,
                conflicting,
            }) => {
                // Retain as evidence; never double-count.
                warn!(validator = %address, height = vote.height, "equivocation observed");
                if let Err(e) = self.evidence_pool.report_conflicting_votes(
                    *existing,
                    *conflicting,
                    self.chain_state.last_block_time,
                ) {
                    debug!(error = %e, "conflicting votes not admitted as evidence");
                }
                return Ok(false);
            }
            Err(e) => {
                trace!(error = %e, %vote, "vote rejected");
                return Ok(false);
            }
        };
        if !result.added {
            return Ok(false);
        }

        self.gossip(GossipMessage::HasVote {
            height: vote.height,
            round: vote.round,
            vote_type: vote.vote_type,
            index: vote.validator_index,
        })
        .await;

        match vote.vote_type {
            VoteType::Prevote => self.on_prevote_added(vote.round).await?,
            VoteType::Precommit => self.on_precommit_added(vote.round).await?,
        }
        Ok(true)
    }

    async fn on_prevote_added(&mut self, vote_round: Round) -> Result<(), StateError> {
        let height = self.rs.height;
        let (maj23, has_any) = {
            let prevotes = self.rs.votes.prevotes(vote_round);
            (
                prevotes.and_then(|set| set.two_thirds_majority()),
                prevotes.map(|set| set.has_two_thirds_any()).unwrap_or(false),
            )
        };

        if let Some(maj23) = maj23 {
            // A later polka overrides an earlier lock.
            if let Some(locked) = &self.rs.locked_block {
                if self.rs.locked_round < vote_round
                    && vote_round <= self.rs.round
                    && locked.hash() != maj23.hash
                {
                    info!(round = vote_round, "unlocking on newer polka");
                    self.rs.locked_round = -1;
                    self.rs.locked_block = None;
                }
            }
            // Track the most recent valid block.
            if !maj23.is_zero() && self.rs.valid_round < vote_round && vote_round == self.rs.round {
                if self
                    .rs
                    .proposal_block
                    .as_ref()
                    .map(|b| b.hash() == maj23.hash)
                    .unwrap_or(false)
                {
                    debug!(round = vote_round, block_id = %maj23, "block became valid");
                    self.rs.valid_round = vote_round;
                    self.rs.valid_block = self.rs.proposal_block.clone();
                } else if self
                    .rs
                    .proposal_block_parts
                    .as_ref()
                    .map(|p| p.header() != maj23.part_set_header)
                    .unwrap_or(true)
                {
                    // A block we do not hold became valid; start fetching it.
                    self.rs.proposal_block = None;
                    self.rs.proposal_block_parts =
                        Some(PartSet::new_for_header(maj23.part_set_header));
                }
            }
        }

        if self.rs.round < vote_round && has_any {
            // The network moved ahead; catch up.
            self.catchup_to_round(height, vote_round).await?;
        } else if self.rs.round == vote_round && self.rs.step >= Step::Prevote {
            if let Some(maj23) = maj23 {
                if maj23.is_zero() || self.is_proposal_complete() {
                    self.enter_precommit(height, vote_round).await?;
                } else if has_any {
                    self.enter_prevote_wait(height, vote_round).await?;
                }
            } else if has_any {
                self.enter_prevote_wait(height, vote_round).await?;
            }
        } else {
            // A POL for the proposal's claimed round lets us prevote it.
            let pol_round = self.rs.proposal.as_ref().map(|p| p.pol_round);
            if pol_round == Some(vote_round)
                && self.rs.step == Step::Propose
                && self.is_proposal_complete()
            {
                let round = self.rs.round;
                self.enter_prevote(height, round).await?;
            }
        }
        Ok(())
    }

    async fn on_precommit_added(&mut self, vote_round: Round) -> Result<(), StateError> {
        let height = self.rs.height;
        let (maj23, has_any) = {
            let precommits = self.rs.votes.precommits(vote_round);
            (
                precommits.and_then(|set| set.two_thirds_majority()),
                precommits
                    .map(|set| set.has_two_thirds_any())
                    .unwrap_or(false),
            )
        };

        if let Some(maj23) = maj23 {
            if self.rs.round < vote_round {
                self.catchup_to_round(height, vote_round).await?;
            }
            if maj23.is_zero() {
                // The round is dead; wait out stragglers then move on.
                self.enter_precommit_wait(height, vote_round).await?;
            } else {
                self.enter_commit(height, vote_round).await?;
            }
        } else if has_any && self.rs.round <= vote_round {
            if self.rs.round < vote_round {
                self.catchup_to_round(height, vote_round).await?;
            }
            self.enter_precommit_wait(height, vote_round).await?;
        }
        Ok(())
    }

    /// Jump to a later round the network has demonstrably reached.
    async fn catchup_to_round(&mut self, height: Height, round: Round) -> Result<(), StateError> {
        info!(
            height,
            from = self.rs.round,
            to = round,
            "catching up to later round"
        );
        // Make the round-entry guard accept the jump.
        self.rs.step = Step::NewHeight;
        self.enter_new_round(height, round).await
    }

    // ------------------------------------------------------------------
    // Block validation
    // ------------------------------------------------------------------

    /// Validate a proposed block against the chain state.
    fn validate_block(&mut self, block: &Block) -> Result<(), String> {
        block.validate_basic().map_err(|e| e.to_string())?;

        let header = &block.header;
        let state = &self.chain_state;
        if header.chain_id != state.chain_id {
            return Err(format!("wrong chain id {}", header.chain_id));
        }
        if header.height != self.rs.height {
            return Err(format!(
                "wrong height {} (expected {})",
                header.height, self.rs.height
            ));
        }
        if header.last_block_id != state.last_block_id {
            return Err("wrong last block id".into());
        }
        if header.app_hash != state.app_hash {
            return Err(format!(
                "app hash mismatch: block has {}, state has {}",
                hex::encode(header.app_hash),
                hex::encode(state.app_hash)
            ));
        }
        if header.validators_hash != state.validators.hash() {
            return Err("wrong validators hash".into());
        }
        if header.next_validators_hash != state.next_validators.hash() {
            return Err("wrong next validators hash".into());
        }
        if header.consensus_hash != state.consensus_params.hash() {
            return Err("wrong consensus params hash".into());
        }
        if header.last_results_hash != state.last_results_hash {
            return Err("wrong last results hash".into());
        }
        if header.time <= state.last_block_time {
            return Err("block time does not advance".into());
        }

        if header.height > state.initial_height {
            state
                .last_validators
                .verify_commit_with_cache(
                    &state.chain_id,
                    &state.last_block_id,
                    header.height - 1,
                    &block.last_commit,
                    Some(&mut self.sig_cache),
                )
                .map_err(|e| format!("invalid last commit: {e}"))?;
        } else if !block.last_commit.is_empty() {
            return Err("initial block carries a last commit".into());
        }

        for evidence in &block.evidence {
            let tessera_types::Evidence::DuplicateVote(dve) = evidence;
            let vals = self
                .state_store
                .load_validators(dve.height())
                .ok_or_else(|| format!("no validators for evidence height {}", dve.height()))?;
            dve.verify(&state.chain_id, &vals)
                .map_err(|e| format!("invalid evidence: {e}"))?;
            dve.check_age(
                self.rs.height,
                header.time,
                &state.consensus_params.evidence,
            )
            .map_err(|e| format!("expired evidence: {e}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_ordering_matches_round_flow() {
        assert!(Step::NewHeight < Step::NewRound);
        assert!(Step::NewRound < Step::Propose);
        assert!(Step::Propose < Step::Prevote);
        assert!(Step::Prevote < Step::PrevoteWait);
        assert!(Step::PrevoteWait < Step::Precommit);
        assert!(Step::Precommit < Step::PrecommitWait);
        assert!(Step::PrecommitWait < Step::Commit);
    }

    #[test]
    fn test_step_display() {
        assert_eq!(Step::PrevoteWait.to_string(), "PrevoteWait");
        assert_eq!(Step::Commit.to_string(), "Commit");
    }
}
