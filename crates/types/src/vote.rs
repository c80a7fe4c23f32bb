//! Vote messages and their canonical sign bytes.
//!
//! A [`Vote`] is one validator's prevote or precommit at a specific
//! `(height, round)`. The signature covers a domain-separated canonical
//! encoding that includes the chain id, so a signature can never be replayed
//! on another chain or reinterpreted across message kinds. Vote extensions
//! are signed under their own domain for the same reason.

use serde::{Deserialize, Serialize};

use tessera_crypto::{Address, Signature};

use crate::block::BlockId;
use crate::{Height, Round, TimestampMs};

/// Domain separators for signature security.
///
/// A prevote signature cannot be reused as a precommit, a proposal, or a
/// vote extension, and vice versa.
pub mod domains {
    /// Domain separator for prevote messages
    pub const PREVOTE: &[u8] = b"TESSERA_PREVOTE_V1";
    /// Domain separator for precommit messages
    pub const PRECOMMIT: &[u8] = b"TESSERA_PRECOMMIT_V1";
    /// Domain separator for block proposals
    pub const PROPOSAL: &[u8] = b"TESSERA_PROPOSAL_V1";
    /// Domain separator for vote extensions
    pub const VOTE_EXTENSION: &[u8] = b"TESSERA_VOTE_EXTENSION_V1";
    /// Domain separator for evidence hashing
    pub const EVIDENCE: &[u8] = b"TESSERA_EVIDENCE_V1";
}

/// Errors from vote validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoteError {
    /// Height is not positive
    #[error("non-positive vote height: {0}")]
    InvalidHeight(Height),

    /// Round is negative
    #[error("negative vote round: {0}")]
    InvalidRound(Round),

    /// Validator index is negative
    #[error("negative validator index: {0}")]
    InvalidValidatorIndex(i32),

    /// The signature field is empty
    #[error("vote has no signature")]
    MissingSignature,

    /// A prevote carried a vote extension
    #[error("only precommits may carry vote extensions")]
    UnexpectedExtension,

    /// A nil precommit carried a vote extension
    #[error("nil precommits may not carry vote extensions")]
    ExtensionOnNilVote,
}

/// The two vote kinds of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteType {
    /// First voting phase: the validator saw a valid proposal
    Prevote,
    /// Second voting phase: the validator saw a prevote quorum
    Precommit,
}

impl std::fmt::Display for VoteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoteType::Prevote => write!(f, "Prevote"),
            VoteType::Precommit => write!(f, "Precommit"),
        }
    }
}

/// A signed prevote or precommit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// Prevote or precommit
    pub vote_type: VoteType,
    /// Block height
    pub height: Height,
    /// Consensus round
    pub round: Round,
    /// The block voted for; the zero value is a nil vote
    pub block_id: BlockId,
    /// When the vote was signed (Unix millis)
    pub timestamp: TimestampMs,
    /// Address of the signing validator
    pub validator_address: Address,
    /// Index of the signing validator in the set for this height
    pub validator_index: i32,
    /// Signature over [`Vote::sign_bytes`]
    pub signature: Signature,
    /// Application-defined vote extension (precommits only)
    pub extension: Vec<u8>,
    /// Signature over [`Vote::extension_sign_bytes`]
    pub extension_signature: Signature,
}

impl Vote {
    /// Create a new unsigned vote.
    pub fn new(
        vote_type: VoteType,
        height: Height,
        round: Round,
        block_id: BlockId,
        validator_address: Address,
        validator_index: i32,
    ) -> Self {
        Self {
            vote_type,
            height,
            round,
            block_id,
            timestamp: 0,
            validator_address,
            validator_index,
            signature: Signature::empty(),
            extension: Vec::new(),
            extension_signature: Signature::empty(),
        }
    }

    /// Whether this vote is for nil.
    pub fn is_nil(&self) -> bool {
        self.block_id.is_zero()
    }

    /// The canonical bytes covered by [`Vote::signature`].
    ///
    /// Layout: domain tag, length-prefixed chain id, height, round, the
    /// canonical block id, and the timestamp. All integers little-endian.
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        let domain = match self.vote_type {
            VoteType::Prevote => domains::PREVOTE,
            VoteType::Precommit => domains::PRECOMMIT,
        };
        canonical_vote_bytes(
            domain,
            chain_id,
            self.height,
            self.round,
            &self.block_id,
            self.timestamp,
        )
    }

    /// The canonical bytes covered by [`Vote::extension_signature`].
    ///
    /// Uses a separate domain tag so an extension signature can never be
    /// replayed as a vote signature.
    pub fn extension_sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        let mut bytes = canonical_vote_bytes(
            domains::VOTE_EXTENSION,
            chain_id,
            self.height,
            self.round,
            &self.block_id,
            self.timestamp,
        );
        bytes.extend_from_slice(&(self.extension.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.extension);
        bytes
    }

    /// Stateless validity checks.
    pub fn validate_basic(&self) -> Result<(), VoteError> {
        if self.height < 1 {
            return Err(VoteError::InvalidHeight(self.height));
        }
        if self.round < 0 {
            return Err(VoteError::InvalidRound(self.round));
        }
        if self.validator_index < 0 {
            return Err(VoteError::InvalidValidatorIndex(self.validator_index));
        }
        if self.signature.is_empty() {
            return Err(VoteError::MissingSignature);
        }
        match self.vote_type {
            VoteType::Prevote => {
                if !self.extension.is_empty() || !self.extension_signature.is_empty() {
                    return Err(VoteError::UnexpectedExtension);
                }
            }
            VoteType::Precommit => {
                if self.is_nil()
                    && (!self.extension.is_empty() || !self.extension_signature.is_empty())
                {
                    return Err(VoteError::ExtensionOnNilVote);
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Vote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Vote({} h={} r={} {} val={})",
            self.vote_type, self.height, self.round, self.block_id, self.validator_address
        )
    }
}

/// Shared canonical layout for vote-shaped sign bytes.
fn canonical_vote_bytes(
    domain: &[u8],
    chain_id: &str,
    height: Height,
    round: Round,
    block_id: &BlockId,
    timestamp: TimestampMs,
) -> Vec<u8> {
    let chain = chain_id.as_bytes();
    let mut bytes = Vec::with_capacity(domain.len() + 4 + chain.len() + 8 + 4 + 68 + 8);
    bytes.extend_from_slice(domain);
    bytes.extend_from_slice(&(chain.len() as u32).to_le_bytes());
    bytes.extend_from_slice(chain);
    bytes.extend_from_slice(&height.to_le_bytes());
    bytes.extend_from_slice(&round.to_le_bytes());
    bytes.extend_from_slice(&block_id.canonical_bytes());
    bytes.extend_from_slice(&timestamp.to_le_bytes());
    bytes
}

/// A signed block proposal.
///
/// `pol_round` is the round of the proof-of-lock that lets a correct
/// proposer re-propose a block that already gathered a prevote quorum;
/// `-1` when there is none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// Block height
    pub height: Height,
    /// Consensus round
    pub round: Round,
    /// Round of the proof-of-lock, or -1
    pub pol_round: Round,
    /// Id of the proposed block
    pub block_id: BlockId,
    /// When the proposal was signed (Unix millis)
    pub timestamp: TimestampMs,
    /// Proposer signature over [`Proposal::sign_bytes`]
    pub signature: Signature,
}

impl Proposal {
    /// Create a new unsigned proposal.
    pub fn new(height: Height, round: Round, pol_round: Round, block_id: BlockId) -> Self {
        Self {
            height,
            round,
            pol_round,
            block_id,
            timestamp: 0,
            signature: Signature::empty(),
        }
    }

    /// The canonical bytes covered by the proposal signature.
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        let mut bytes = canonical_vote_bytes(
            domains::PROPOSAL,
            chain_id,
            self.height,
            self.round,
            &self.block_id,
            self.timestamp,
        );
        bytes.extend_from_slice(&self.pol_round.to_le_bytes());
        bytes
    }

    /// Stateless validity checks.
    pub fn validate_basic(&self) -> Result<(), VoteError> {
        if self.height < 1 {
            return Err(VoteError::InvalidHeight(self.height));
        }
        if self.round < 0 {
            return Err(VoteError::InvalidRound(self.round));
        }
        if self.pol_round < -1 || self.pol_round >= self.round {
            return Err(VoteError::InvalidRound(self.pol_round));
        }
        if self.signature.is_empty() {
            return Err(VoteError::MissingSignature);
        }
        Ok(())
    }
}

impl std::fmt::Display for Proposal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Proposal(h={} r={} pol={} {})",
            self.height, self.round, self.pol_round, self.block_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::PartSetHeader;

    fn block_id(byte: u8) -> BlockId {
        BlockId {
            hash: [byte; 32],
            part_set_header: PartSetHeader {
                total: 1,
                hash: [byte; 32],
            },
        }
    }

    fn vote() -> Vote {
        let mut v = Vote::new(
            VoteType::Prevote,
            5,
            2,
            block_id(1),
            Address([7u8; 20]),
            3,
        );
        v.timestamp = 1000;
        v.signature = Signature(vec![1, 2, 3]);
        v
    }

    #[test]
    fn test_sign_bytes_include_chain_id() {
        let v = vote();
        assert_ne!(v.sign_bytes("chain-a"), v.sign_bytes("chain-b"));
    }

    #[test]
    fn test_sign_bytes_domain_separated_by_type() {
        let v = vote();
        let mut precommit = v.clone();
        precommit.vote_type = VoteType::Precommit;
        assert_ne!(v.sign_bytes("c"), precommit.sign_bytes("c"));
    }

    #[test]
    fn test_extension_bytes_use_distinct_domain() {
        let mut v = vote();
        v.vote_type = VoteType::Precommit;
        // Even with an empty extension the domains must differ.
        assert_ne!(v.sign_bytes("c"), v.extension_sign_bytes("c"));
    }

    #[test]
    fn test_sign_bytes_cover_block_id() {
        let v = vote();
        let mut other = v.clone();
        other.block_id = block_id(2);
        assert_ne!(v.sign_bytes("c"), other.sign_bytes("c"));

        let mut nil = v.clone();
        nil.block_id = BlockId::zero();
        assert_ne!(v.sign_bytes("c"), nil.sign_bytes("c"));
    }

    #[test]
    fn test_validate_basic() {
        vote().validate_basic().unwrap();

        let mut v = vote();
        v.height = 0;
        assert_eq!(v.validate_basic(), Err(VoteError::InvalidHeight(0)));

        let mut v = vote();
        v.signature = Signature::empty();
        assert_eq!(v.validate_basic(), Err(VoteError::MissingSignature));

        let mut v = vote();
        v.extension = vec![1];
        assert_eq!(v.validate_basic(), Err(VoteError::UnexpectedExtension));

        let mut v = vote();
        v.vote_type = VoteType::Precommit;
        v.block_id = BlockId::zero();
        v.extension = vec![1];
        assert_eq!(v.validate_basic(), Err(VoteError::ExtensionOnNilVote));
    }

    #[test]
    fn test_proposal_sign_bytes_cover_pol_round() {
        let mut p = Proposal::new(5, 2, -1, block_id(1));
        p.timestamp = 9;
        let a = p.sign_bytes("c");
        p.pol_round = 1;
        assert_ne!(a, p.sign_bytes("c"));
    }

    #[test]
    fn test_proposal_validate_basic() {
        let mut p = Proposal::new(5, 2, 1, block_id(1));
        p.signature = Signature(vec![1]);
        p.validate_basic().unwrap();

        p.pol_round = 2; // pol_round must be < round
        assert!(p.validate_basic().is_err());
    }
}
