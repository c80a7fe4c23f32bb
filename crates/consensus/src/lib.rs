//! # Tessera Consensus
//!
//! The tessera BFT consensus engine: a Tendermint-style, multi-round voting
//! state machine that drives a deterministic application through a sequence
//! of heights, committing at most one block per height with cryptographic
//! proof, despite up to `f = (n-1)/3` byzantine validators.
//!
//! ## Consensus Flow
//!
//! ```text
//! Round r, Height h:
//!
//! ┌──────────────┐
//! │   PROPOSE    │  proposer = validator_set.proposer_for(h, r)
//! │              │  broadcast Proposal{h, r, block_id, pol_round} + parts
//! └──────┬───────┘
//!        │
//!        ▼
//! ┌──────────────┐
//! │   PREVOTE    │  IF locked: prevote locked block
//! │              │  ELSE IF valid(block): prevote block
//! │              │  ELSE: prevote nil
//! └──────┬───────┘
//!        │
//!        ▼
//! ┌──────────────┐
//! │  PRECOMMIT   │  ON 2f+1 prevotes for block B:
//! │              │      lock on B, precommit B
//! │              │  ON 2f+1 prevotes for nil: unlock, precommit nil
//! └──────┬───────┘
//!        │
//!        ▼
//! ┌──────────────┐
//! │    COMMIT    │  ON 2f+1 precommits for B != nil:
//! │              │      wait for full block, finalize against the app,
//! │              │      persist block + extended commit, next height
//! └──────────────┘
//! ```
//!
//! ## Crash safety
//!
//! Every event (gossip message, internal message, timeout) is appended to
//! the write-ahead log and fsynced before the state machine acts on it.
//! On restart, the [`replay`] subsystem reconciles the state store, the
//! block store and the application, then replays the WAL from the last
//! `EndHeight` marker, so a correct node can never sign conflicting votes
//! across a crash.
//!
//! ## Safety guarantees
//!
//! - **Agreement**: no two correct validators commit different blocks at
//!   the same height.
//! - **At-most-one signature** per `(height, round, step)`, enforced by the
//!   signer's last-sign-state and the WAL replay.
//! - **Evidence**: conflicting votes from the same validator are captured
//!   as [`tessera_types::DuplicateVoteEvidence`] and published in a later
//!   block, never double-counted in a tally.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod app;
pub mod evidence_pool;
pub mod messages;
pub mod privval;
pub mod reactor;
pub mod replay;
pub mod state;
pub mod store;
pub mod timeout;
pub mod vote_set;
pub mod wal;

// Re-export main types at the crate root
pub use app::{
    AppInfo, Application, FinalizeBlockRequest, FinalizeBlockResponse, InitChainRequest,
    InitChainResponse, KvStoreApp, TxResult, ValidatorUpdate,
};
pub use evidence_pool::{EvidencePool, EvidencePoolError};
pub use messages::{ConsensusMessage, GossipMessage, StateEvent, TimedWalMessage, WalMessage};
pub use privval::{LocalSigner, PrivValidator, PrivValidatorError, SignStep, SigningPolicy};
pub use reactor::{ConsensusReactor, Envelope, ReactorError};
pub use replay::{Handshaker, HandshakeError};
pub use state::{ConsensusHandle, ConsensusState, RoundState, StateError, Step};
pub use store::{
    BlockStore, ChainState, MemoryBlockStore, MemoryMempool, MemoryStateStore, Mempool, StateStore,
};
pub use timeout::{TimeoutInfo, TimeoutScheduler};
pub use vote_set::{AddVoteResult, HeightVoteSet, VoteSet, VoteSetError};
pub use wal::{Wal, WalError, WalReader, WalResult};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cooperative cancellation token.
///
/// Long-running subroutines (handshake, replay, block building) check the
/// token between steps and bail out with a `Canceled` error; cancelling
/// never interrupts a write in progress.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Current wall-clock time in Unix milliseconds.
pub(crate) fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
