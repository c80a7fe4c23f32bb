//! # Tessera Types
//!
//! Core type definitions for the tessera consensus engine.
//!
//! This crate provides the data model the engine agrees on:
//! - [`Validator`] and [`ValidatorSet`] - identities, voting power, and the
//!   deterministic proposer election
//! - [`Vote`], [`Commit`] and [`ExtendedCommit`] - canonical signed objects
//!   and their verification against a validator set
//! - [`Block`], [`Header`] and [`BlockId`] - the immutable block object with
//!   per-field Merkle commitments
//! - [`DuplicateVoteEvidence`] - cryptographic proof of double-signing
//! - safe voting-power arithmetic used by every power computation
//!
//! ## Example
//!
//! ```rust
//! use tessera_types::{Validator, ValidatorSet};
//! use tessera_crypto::PrivateKey;
//!
//! let key = PrivateKey::generate_ed25519();
//! let validator = Validator::new(key.public_key(), 100);
//! let mut set = ValidatorSet::new(vec![validator]).unwrap();
//!
//! let proposer = set.proposer().unwrap().clone();
//! set.increment_proposer_priority(1);
//! assert_eq!(set.proposer().unwrap().address, proposer.address);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod arith;
pub mod block;
pub mod commit;
pub mod evidence;
pub mod params;
pub mod validator;
pub mod verify;
pub mod vote;

// Re-export main types at crate root
pub use arith::{
    safe_add, safe_add_clip, safe_mul, safe_sub, safe_sub_clip, MAX_TOTAL_VOTING_POWER,
    PRIORITY_WINDOW_SIZE_FACTOR,
};
pub use block::{
    Block, BlockError, BlockId, Header, Part, PartSet, PartSetHeader, Tx, BLOCK_PART_SIZE_BYTES,
};
pub use commit::{BlockIdFlag, Commit, CommitError, CommitSig, ExtendedCommit, ExtendedCommitSig};
pub use evidence::{DuplicateVoteEvidence, Evidence, EvidenceError};
pub use params::{BlockParams, ConsensusParams, EvidenceParams, ValidatorParams};
pub use validator::{Validator, ValidatorSet, ValidatorSetError};
pub use verify::{CommitVerifyError, SignatureCache, TrustLevel};
pub use vote::{domains, Proposal, Vote, VoteError, VoteType};

/// Block height. Monotonic, starts at 1 for the first committed block.
pub type Height = i64;

/// Consensus round within a height. Resets to 0 at every new height.
pub type Round = i32;

/// Unix timestamp in milliseconds, the time representation used across all
/// signed consensus objects.
pub type TimestampMs = u64;
