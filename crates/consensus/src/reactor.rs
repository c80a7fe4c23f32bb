//! Thin reactor glue between the gossip layer and the state machine.
//!
//! The reactor validates envelope sizes, rate-limits query-style messages
//! per peer, keeps minimal per-peer round bookkeeping, and forwards the
//! data-carrying messages into the state machine's event queue. It holds
//! no protocol logic: every consensus decision lives in
//! [`crate::state::ConsensusState`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use tessera_types::{Height, Round};

use crate::messages::{ConsensusMessage, GossipMessage};
use crate::state::{ConsensusHandle, StateError, Step};

/// Maximum serialized envelope size accepted from a peer.
pub const MAX_ENVELOPE_SIZE_BYTES: usize = 2 * 1024 * 1024;

/// Token-bucket capacity for query-style messages per peer.
const QUERY_BUCKET_CAPACITY: u32 = 10;
/// One token refills this often.
const QUERY_TOKEN_INTERVAL: Duration = Duration::from_millis(100);

/// Errors from envelope handling
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    /// The envelope exceeds the size limit
    #[error("envelope of {size} bytes from {peer_id} exceeds the maximum {max}")]
    EnvelopeTooLarge {
        /// Sending peer
        peer_id: String,
        /// Claimed size
        size: usize,
        /// The limit
        max: usize,
    },

    /// The peer exceeded its query rate budget
    #[error("peer {0} is rate limited")]
    RateLimited(String),

    /// The state machine is gone
    #[error(transparent)]
    State(#[from] StateError),
}

/// A message as received from the transport, attributed to a peer.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Identifier of the sending peer
    pub peer_id: String,
    /// Serialized size as reported by the transport
    pub size: usize,
    /// The decoded message
    pub message: GossipMessage,
}

/// What the reactor knows about one peer's consensus position.
#[derive(Debug, Clone, Default)]
pub struct PeerRoundState {
    /// Peer's reported height
    pub height: Height,
    /// Peer's reported round
    pub round: Round,
    /// Peer's reported step
    pub step: Option<Step>,
}

struct PeerState {
    round_state: PeerRoundState,
    query_tokens: u32,
    last_refill: Instant,
}

impl PeerState {
    fn new() -> Self {
        Self {
            round_state: PeerRoundState::default(),
            query_tokens: QUERY_BUCKET_CAPACITY,
            last_refill: Instant::now(),
        }
    }

    /// Refill then take one token; false when the bucket is empty.
    fn take_query_token(&mut self) -> bool {
        let elapsed = self.last_refill.elapsed();
        let refill = (elapsed.as_millis() / QUERY_TOKEN_INTERVAL.as_millis()) as u32;
        if refill > 0 {
            self.query_tokens = (self.query_tokens + refill).min(QUERY_BUCKET_CAPACITY);
            self.last_refill = Instant::now();
        }
        if self.query_tokens == 0 {
            return false;
        }
        self.query_tokens -= 1;
        true
    }
}

/// Demultiplexes gossip envelopes into the consensus state machine.
pub struct ConsensusReactor {
    handle: ConsensusHandle,
    peers: Mutex<HashMap<String, PeerState>>,
}

impl ConsensusReactor {
    /// Create a reactor feeding `handle`.
    pub fn new(handle: ConsensusHandle) -> Self {
        Self {
            handle,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// The consensus position last reported by `peer_id`.
    pub fn peer_round_state(&self, peer_id: &str) -> Option<PeerRoundState> {
        self.peers
            .lock()
            .get(peer_id)
            .map(|p| p.round_state.clone())
    }

    /// Forget a disconnected peer.
    pub fn remove_peer(&self, peer_id: &str) {
        self.peers.lock().remove(peer_id);
    }

    /// Validate and route one envelope.
    pub async fn handle_envelope(&self, envelope: Envelope) -> Result<(), ReactorError> {
        if envelope.size > MAX_ENVELOPE_SIZE_BYTES {
            warn!(
                peer = %envelope.peer_id,
                size = envelope.size,
                "dropping oversized envelope"
            );
            return Err(ReactorError::EnvelopeTooLarge {
                peer_id: envelope.peer_id,
                size: envelope.size,
                max: MAX_ENVELOPE_SIZE_BYTES,
            });
        }

        let peer_id = envelope.peer_id.clone();
        trace!(peer = %peer_id, kind = envelope.message.kind(), "envelope received");

        match envelope.message {
            // Data-carrying messages go straight to the state machine.
            GossipMessage::Proposal(proposal) => {
                self.handle
                    .send_external(&peer_id, ConsensusMessage::Proposal(proposal))
                    .await?;
            }
            GossipMessage::BlockPart {
                height,
                round,
                part,
            } => {
                self.handle
                    .send_external(
                        &peer_id,
                        ConsensusMessage::BlockPart {
                            height,
                            round,
                            part,
                        },
                    )
                    .await?;
            }
            GossipMessage::Vote(vote) => {
                self.handle
                    .send_external(&peer_id, ConsensusMessage::Vote(vote))
                    .await?;
            }

            // Peer-state bookkeeping only.
            GossipMessage::NewRoundStep {
                height,
                round,
                step,
                ..
            } => {
                let mut peers = self.peers.lock();
                let peer = peers.entry(peer_id).or_insert_with(PeerState::new);
                peer.round_state = PeerRoundState {
                    height,
                    round,
                    step: Some(step),
                };
            }
            GossipMessage::NewValidBlock { height, round, .. }
            | GossipMessage::ProposalPol {
                height,
                proposal_pol_round: round,
                ..
            } => {
                let mut peers = self.peers.lock();
                let peer = peers.entry(peer_id).or_insert_with(PeerState::new);
                peer.round_state.height = peer.round_state.height.max(height);
                let _ = round;
            }
            GossipMessage::HasVote { .. } => {
                // Gossip optimization input; nothing for the thin reactor.
            }

            // Query-style messages are rate limited per peer.
            GossipMessage::VoteSetMaj23 { .. } | GossipMessage::VoteSetBits { .. } => {
                let allowed = {
                    let mut peers = self.peers.lock();
                    let peer = peers.entry(peer_id.clone()).or_insert_with(PeerState::new);
                    peer.take_query_token()
                };
                if !allowed {
                    debug!(peer = %peer_id, "rate limiting vote-set query");
                    return Err(ReactorError::RateLimited(peer_id));
                }
                // The thin reactor records the claim; answering the query
                // is gossip-layer work driven off the round-state snapshot.
            }
        }
        Ok(())
    }
}
