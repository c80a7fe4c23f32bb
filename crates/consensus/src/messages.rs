//! Consensus message types.
//!
//! Three layers of messages:
//!
//! - [`GossipMessage`] - the logical messages the gossip layer must deliver
//!   (ordering per sender preserved, duplicates tolerated)
//! - [`ConsensusMessage`] - the data-carrying subset the state machine
//!   consumes (proposals, block parts, votes)
//! - [`StateEvent`] - the tagged union flowing through the state machine's
//!   single-consumer event queue
//!
//! Every event is serialized into a [`TimedWalMessage`] and written to the
//! WAL before the state machine acts on it.

use serde::{Deserialize, Serialize};

use tessera_types::{
    BlockId, Height, Part, PartSetHeader, Proposal, Round, TimestampMs, Vote, VoteType,
};

use crate::state::Step;
use crate::timeout::TimeoutInfo;

/// A data-carrying consensus message processed by the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    /// A signed block proposal
    Proposal(Proposal),
    /// One part of a proposed block
    BlockPart {
        /// Height the part belongs to
        height: Height,
        /// Round the part was proposed in
        round: Round,
        /// The part with its inclusion proof
        part: Part,
    },
    /// A prevote or precommit
    Vote(Vote),
}

impl std::fmt::Display for ConsensusMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsensusMessage::Proposal(p) => write!(f, "{p}"),
            ConsensusMessage::BlockPart { height, round, part } => {
                write!(f, "BlockPart(h={height} r={round} i={})", part.index)
            }
            ConsensusMessage::Vote(v) => write!(f, "{v}"),
        }
    }
}

/// The logical gossip messages of the consensus reactor.
///
/// The engine only requires that the transport deliver them in per-sender
/// order; it never requires deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipMessage {
    /// Announces the sender's current height/round/step
    NewRoundStep {
        /// Sender's height
        height: Height,
        /// Sender's round
        round: Round,
        /// Sender's step
        step: Step,
        /// Milliseconds the sender has spent in this height
        seconds_since_start_time: u64,
        /// Round of the sender's last commit
        last_commit_round: Round,
    },
    /// Announces that the sender holds a block that reached 2f+1 prevotes
    NewValidBlock {
        /// Height of the valid block
        height: Height,
        /// Round the block became valid in
        round: Round,
        /// Part-set commitment of the block
        block_part_set_header: PartSetHeader,
        /// Which parts the sender holds
        block_parts: Vec<bool>,
        /// Whether the block is already committed
        is_commit: bool,
    },
    /// A signed block proposal
    Proposal(Proposal),
    /// Which prevotes the sender saw for the proposal's POL round
    ProposalPol {
        /// Height of the proposal
        height: Height,
        /// The proposal's POL round
        proposal_pol_round: Round,
        /// Bit per validator: prevoted for the proposal's block
        proposal_pol: Vec<bool>,
    },
    /// One part of a proposed block
    BlockPart {
        /// Height the part belongs to
        height: Height,
        /// Round the part was proposed in
        round: Round,
        /// The part with its inclusion proof
        part: Part,
    },
    /// A prevote or precommit
    Vote(Vote),
    /// Announces that the sender holds a particular vote
    HasVote {
        /// Vote height
        height: Height,
        /// Vote round
        round: Round,
        /// Prevote or precommit
        vote_type: VoteType,
        /// Validator index of the vote
        index: i32,
    },
    /// Claims a 2/3 majority for a block id
    VoteSetMaj23 {
        /// Height of the claim
        height: Height,
        /// Round of the claim
        round: Round,
        /// Prevote or precommit
        vote_type: VoteType,
        /// The majority block id
        block_id: BlockId,
    },
    /// Bitmap answer to a [`GossipMessage::VoteSetMaj23`] query
    VoteSetBits {
        /// Height of the answer
        height: Height,
        /// Round of the answer
        round: Round,
        /// Prevote or precommit
        vote_type: VoteType,
        /// The queried block id
        block_id: BlockId,
        /// Bit per validator: has a vote for that block id
        votes: Vec<bool>,
    },
}

impl GossipMessage {
    /// Short tag for logging and rate-limit bookkeeping.
    pub fn kind(&self) -> &'static str {
        match self {
            GossipMessage::NewRoundStep { .. } => "NewRoundStep",
            GossipMessage::NewValidBlock { .. } => "NewValidBlock",
            GossipMessage::Proposal(_) => "Proposal",
            GossipMessage::ProposalPol { .. } => "ProposalPol",
            GossipMessage::BlockPart { .. } => "BlockPart",
            GossipMessage::Vote(_) => "Vote",
            GossipMessage::HasVote { .. } => "HasVote",
            GossipMessage::VoteSetMaj23 { .. } => "VoteSetMaj23",
            GossipMessage::VoteSetBits { .. } => "VoteSetBits",
        }
    }
}

/// An event consumed by the state machine's single event loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateEvent {
    /// A message received from a peer
    External {
        /// Identifier of the sending peer
        peer_id: String,
        /// The message
        msg: ConsensusMessage,
    },
    /// A message the node generated itself (its own votes and proposals)
    Internal(ConsensusMessage),
    /// Stop the event loop
    Quit,
}

/// Payload of one WAL frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalMessage {
    /// An event the state machine was about to act on
    Event(StateEvent),
    /// An internally generated timeout that fired
    Timeout(TimeoutInfo),
    /// Height `h` committed; frames before this marker may be pruned
    EndHeight(Height),
}

/// A WAL frame payload with its wall-clock write time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedWalMessage {
    /// When the frame was written (Unix millis)
    pub time: TimestampMs,
    /// The payload
    pub msg: WalMessage,
}
