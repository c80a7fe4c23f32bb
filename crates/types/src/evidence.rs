//! Equivocation evidence.
//!
//! A [`DuplicateVoteEvidence`] is a cryptographic proof that a validator
//! signed two different votes at the same `(height, round, vote type)`.
//! Evidence is only acceptable inside an age window bounded both by blocks
//! and by wall-clock time, and it carries the voting power context of the
//! height it happened at so a later verifier can weigh it.

use serde::{Deserialize, Serialize};

use tessera_crypto::{sha256, Address, Hash};

use crate::params::EvidenceParams;
use crate::validator::ValidatorSet;
use crate::vote::{domains, Vote, VoteType};
use crate::{Height, TimestampMs};

/// Errors from evidence construction and validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvidenceError {
    /// The two votes are from different validators
    #[error("votes are from different validators: {0} vs {1}")]
    DifferentValidators(Address, Address),

    /// The two votes are at different heights
    #[error("votes are at different heights: {0} vs {1}")]
    DifferentHeights(Height, Height),

    /// The two votes are in different rounds
    #[error("votes are in different rounds: {0} vs {1}")]
    DifferentRounds(i32, i32),

    /// The two votes have different types
    #[error("votes have different types: {0} vs {1}")]
    DifferentTypes(VoteType, VoteType),

    /// The two votes agree on the block id, which is not an offense
    #[error("votes have the same block id")]
    SameBlockId,

    /// The signature on one of the votes does not verify
    #[error("invalid signature on vote {which} from validator {address}")]
    InvalidSignature {
        /// "a" or "b"
        which: &'static str,
        /// The offending validator
        address: Address,
    },

    /// The equivocating validator is not in the set for that height
    #[error("validator {0} not in the validator set at the evidence height")]
    ValidatorNotFound(Address),

    /// The evidence is older than the block-count bound
    #[error(
        "evidence from height {evidence_height} expired at height {current_height} \
         (max age {max_age_num_blocks} blocks)"
    )]
    ExpiredByHeight {
        /// Height of the offense
        evidence_height: Height,
        /// Current chain height
        current_height: Height,
        /// The block-count bound
        max_age_num_blocks: i64,
    },

    /// The evidence is older than the wall-clock bound
    #[error("evidence from {evidence_time} expired at {current_time} (max age {max_age_ms} ms)")]
    ExpiredByTime {
        /// When the offense happened
        evidence_time: TimestampMs,
        /// Current time
        current_time: TimestampMs,
        /// The wall-clock bound in milliseconds
        max_age_ms: u64,
    },

    /// The recorded voting power does not match the validator set
    #[error("evidence voting power mismatch: recorded {recorded}, actual {actual}")]
    PowerMismatch {
        /// Power recorded in the evidence
        recorded: i64,
        /// Power in the validator set
        actual: i64,
    },

    /// Structural problem with the evidence
    #[error("invalid evidence: {0}")]
    Invalid(String),
}

/// Proof that a validator signed two conflicting votes.
///
/// `vote_a` is always the vote with the lexicographically smaller canonical
/// block id, making the hash of the evidence independent of detection
/// order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateVoteEvidence {
    /// The conflicting vote with the smaller block id
    pub vote_a: Vote,
    /// The conflicting vote with the larger block id
    pub vote_b: Vote,
    /// Total voting power at the evidence height
    pub total_voting_power: i64,
    /// The offender's voting power at the evidence height
    pub validator_power: i64,
    /// Block time of the evidence height (Unix millis)
    pub timestamp: TimestampMs,
}

impl DuplicateVoteEvidence {
    /// Build evidence from two conflicting votes, ordering them
    /// canonically and checking the structural equivocation conditions.
    /// Signatures are verified separately by [`Self::verify`].
    pub fn new(
        vote_a: Vote,
        vote_b: Vote,
        block_time: TimestampMs,
        validator_power: i64,
        total_voting_power: i64,
    ) -> Result<Self, EvidenceError> {
        if vote_a.validator_address != vote_b.validator_address {
            return Err(EvidenceError::DifferentValidators(
                vote_a.validator_address,
                vote_b.validator_address,
            ));
        }
        if vote_a.height != vote_b.height {
            return Err(EvidenceError::DifferentHeights(vote_a.height, vote_b.height));
        }
        if vote_a.round != vote_b.round {
            return Err(EvidenceError::DifferentRounds(vote_a.round, vote_b.round));
        }
        if vote_a.vote_type != vote_b.vote_type {
            return Err(EvidenceError::DifferentTypes(
                vote_a.vote_type,
                vote_b.vote_type,
            ));
        }
        if vote_a.block_id == vote_b.block_id {
            return Err(EvidenceError::SameBlockId);
        }

        let (vote_a, vote_b) =
            if vote_a.block_id.canonical_bytes() <= vote_b.block_id.canonical_bytes() {
                (vote_a, vote_b)
            } else {
                (vote_b, vote_a)
            };

        Ok(Self {
            vote_a,
            vote_b,
            total_voting_power,
            validator_power,
            timestamp: block_time,
        })
    }

    /// The height the offense happened at.
    pub fn height(&self) -> Height {
        self.vote_a.height
    }

    /// The offending validator.
    pub fn validator_address(&self) -> Address {
        self.vote_a.validator_address
    }

    /// Canonical hash for deduplication and the block evidence root.
    pub fn hash(&self) -> Hash {
        let mut bytes = Vec::with_capacity(256);
        bytes.extend_from_slice(domains::EVIDENCE);
        bytes.extend_from_slice(self.vote_a.validator_address.as_bytes());
        bytes.extend_from_slice(&self.vote_a.height.to_le_bytes());
        bytes.extend_from_slice(&self.vote_a.round.to_le_bytes());
        bytes.push(match self.vote_a.vote_type {
            VoteType::Prevote => 0,
            VoteType::Precommit => 1,
        });
        bytes.extend_from_slice(&self.vote_a.block_id.canonical_bytes());
        bytes.extend_from_slice(&self.vote_b.block_id.canonical_bytes());
        bytes.extend_from_slice(&self.vote_a.signature.0);
        bytes.extend_from_slice(&self.vote_b.signature.0);
        sha256(&bytes)
    }

    /// Approximate wire size, used for the per-block evidence byte budget.
    pub fn byte_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }

    /// Structural validity of the evidence itself.
    pub fn validate_basic(&self) -> Result<(), EvidenceError> {
        if self.vote_a.validator_address != self.vote_b.validator_address {
            return Err(EvidenceError::DifferentValidators(
                self.vote_a.validator_address,
                self.vote_b.validator_address,
            ));
        }
        if self.vote_a.height != self.vote_b.height {
            return Err(EvidenceError::DifferentHeights(
                self.vote_a.height,
                self.vote_b.height,
            ));
        }
        if self.vote_a.block_id == self.vote_b.block_id {
            return Err(EvidenceError::SameBlockId);
        }
        if self.vote_a.block_id.canonical_bytes() > self.vote_b.block_id.canonical_bytes() {
            return Err(EvidenceError::Invalid(
                "votes are not in canonical order".into(),
            ));
        }
        if self.total_voting_power < self.validator_power || self.validator_power <= 0 {
            return Err(EvidenceError::Invalid(format!(
                "implausible voting powers: validator {}, total {}",
                self.validator_power, self.total_voting_power
            )));
        }
        self.vote_a
            .validate_basic()
            .map_err(|e| EvidenceError::Invalid(format!("vote a: {e}")))?;
        self.vote_b
            .validate_basic()
            .map_err(|e| EvidenceError::Invalid(format!("vote b: {e}")))?;
        Ok(())
    }

    /// Full verification against the validator set as of the evidence
    /// height: both signatures must verify and the recorded powers must
    /// match the set.
    pub fn verify(
        &self,
        chain_id: &str,
        vals_at_height: &ValidatorSet,
    ) -> Result<(), EvidenceError> {
        self.validate_basic()?;

        let address = self.validator_address();
        let Some((_, validator)) = vals_at_height.get_by_address(&address) else {
            return Err(EvidenceError::ValidatorNotFound(address));
        };
        let Some(pub_key) = &validator.pub_key else {
            return Err(EvidenceError::ValidatorNotFound(address));
        };

        if !pub_key.verify(&self.vote_a.sign_bytes(chain_id), &self.vote_a.signature) {
            return Err(EvidenceError::InvalidSignature {
                which: "a",
                address,
            });
        }
        if !pub_key.verify(&self.vote_b.sign_bytes(chain_id), &self.vote_b.signature) {
            return Err(EvidenceError::InvalidSignature {
                which: "b",
                address,
            });
        }

        if validator.voting_power != self.validator_power {
            return Err(EvidenceError::PowerMismatch {
                recorded: self.validator_power,
                actual: validator.voting_power,
            });
        }
        if vals_at_height.total_voting_power() != self.total_voting_power {
            return Err(EvidenceError::PowerMismatch {
                recorded: self.total_voting_power,
                actual: vals_at_height.total_voting_power(),
            });
        }
        Ok(())
    }

    /// Check the evidence against both age bounds.
    pub fn check_age(
        &self,
        current_height: Height,
        current_time: TimestampMs,
        params: &EvidenceParams,
    ) -> Result<(), EvidenceError> {
        let age_blocks = current_height - self.height();
        if age_blocks > params.max_age_num_blocks {
            return Err(EvidenceError::ExpiredByHeight {
                evidence_height: self.height(),
                current_height,
                max_age_num_blocks: params.max_age_num_blocks,
            });
        }
        let age_ms = current_time.saturating_sub(self.timestamp);
        if age_ms > params.max_age_duration_ms {
            return Err(EvidenceError::ExpiredByTime {
                evidence_time: self.timestamp,
                current_time,
                max_age_ms: params.max_age_duration_ms,
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for DuplicateVoteEvidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DuplicateVoteEvidence(val={} h={} r={} {})",
            self.validator_address(),
            self.height(),
            self.vote_a.round,
            self.vote_a.vote_type,
        )
    }
}

/// The evidence variants a block may carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Evidence {
    /// Proof of double-signing
    DuplicateVote(DuplicateVoteEvidence),
}

impl Evidence {
    /// Canonical hash of the evidence.
    pub fn hash(&self) -> Hash {
        match self {
            Evidence::DuplicateVote(ev) => ev.hash(),
        }
    }

    /// Height of the offense.
    pub fn height(&self) -> Height {
        match self {
            Evidence::DuplicateVote(ev) => ev.height(),
        }
    }

    /// Approximate wire size in bytes.
    pub fn byte_size(&self) -> usize {
        match self {
            Evidence::DuplicateVote(ev) => ev.byte_size(),
        }
    }

    /// Structural validity.
    pub fn validate_basic(&self) -> Result<(), EvidenceError> {
        match self {
            Evidence::DuplicateVote(ev) => ev.validate_basic(),
        }
    }
}

impl From<DuplicateVoteEvidence> for Evidence {
    fn from(ev: DuplicateVoteEvidence) -> Self {
        Evidence::DuplicateVote(ev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockId, PartSetHeader};
    use tessera_crypto::Signature;

    fn block_id(byte: u8) -> BlockId {
        BlockId {
            hash: [byte; 32],
            part_set_header: PartSetHeader {
                total: 1,
                hash: [byte; 32],
            },
        }
    }

    fn vote(byte: u8, addr: u8) -> Vote {
        let mut v = Vote::new(
            VoteType::Prevote,
            2,
            0,
            block_id(byte),
            Address([addr; 20]),
            0,
        );
        v.timestamp = 100;
        v.signature = Signature(vec![byte; 64]);
        v
    }

    #[test]
    fn test_new_orders_votes_canonically() {
        let ev1 = DuplicateVoteEvidence::new(vote(1, 7), vote(2, 7), 100, 10, 40).unwrap();
        let ev2 = DuplicateVoteEvidence::new(vote(2, 7), vote(1, 7), 100, 10, 40).unwrap();
        assert_eq!(ev1, ev2);
        assert_eq!(ev1.hash(), ev2.hash());
    }

    #[test]
    fn test_new_rejects_non_equivocation() {
        // Same block id is not an offense.
        assert_eq!(
            DuplicateVoteEvidence::new(vote(1, 7), vote(1, 7), 100, 10, 40).unwrap_err(),
            EvidenceError::SameBlockId
        );

        // Different validators.
        assert!(matches!(
            DuplicateVoteEvidence::new(vote(1, 7), vote(2, 8), 100, 10, 40).unwrap_err(),
            EvidenceError::DifferentValidators(..)
        ));

        // Different heights.
        let mut other = vote(2, 7);
        other.height = 3;
        assert!(matches!(
            DuplicateVoteEvidence::new(vote(1, 7), other, 100, 10, 40).unwrap_err(),
            EvidenceError::DifferentHeights(2, 3)
        ));

        // Different vote types.
        let mut other = vote(2, 7);
        other.vote_type = VoteType::Precommit;
        assert!(matches!(
            DuplicateVoteEvidence::new(vote(1, 7), other, 100, 10, 40).unwrap_err(),
            EvidenceError::DifferentTypes(..)
        ));
    }

    #[test]
    fn test_nil_vs_block_is_equivocation() {
        let mut nil_vote = vote(0, 7);
        nil_vote.block_id = BlockId::zero();
        let ev = DuplicateVoteEvidence::new(nil_vote, vote(2, 7), 100, 10, 40).unwrap();
        ev.validate_basic().unwrap();
    }

    #[test]
    fn test_check_age() {
        let ev = DuplicateVoteEvidence::new(vote(1, 7), vote(2, 7), 1_000, 10, 40).unwrap();
        let params = EvidenceParams {
            max_age_num_blocks: 10,
            max_age_duration_ms: 500,
            max_bytes: 1 << 20,
        };

        // Inside both bounds.
        ev.check_age(5, 1_200, &params).unwrap();

        // Too many blocks later.
        assert!(matches!(
            ev.check_age(13, 1_200, &params),
            Err(EvidenceError::ExpiredByHeight { .. })
        ));

        // Too much wall-clock later.
        assert!(matches!(
            ev.check_age(5, 2_000, &params),
            Err(EvidenceError::ExpiredByTime { .. })
        ));
    }

    #[test]
    fn test_verify_with_real_signatures() {
        let key = tessera_crypto::PrivateKey::from_seed_ed25519([3u8; 32]);
        let validator = crate::validator::Validator::new(key.public_key(), 10);
        let address = validator.address;
        let vals = ValidatorSet::new(vec![validator]).unwrap();

        let chain_id = "evidence-test";
        let mut vote_a = vote(1, 0);
        vote_a.validator_address = address;
        vote_a.signature = key.sign(&vote_a.sign_bytes(chain_id));
        let mut vote_b = vote(2, 0);
        vote_b.validator_address = address;
        vote_b.signature = key.sign(&vote_b.sign_bytes(chain_id));

        let ev =
            DuplicateVoteEvidence::new(vote_a.clone(), vote_b.clone(), 100, 10, 10).unwrap();
        ev.verify(chain_id, &vals).unwrap();

        // A forged signature fails.
        let mut forged = vote_b;
        forged.signature = Signature(vec![0u8; 64]);
        let bad = DuplicateVoteEvidence::new(vote_a, forged, 100, 10, 10).unwrap();
        assert!(matches!(
            bad.verify(chain_id, &vals),
            Err(EvidenceError::InvalidSignature { .. })
        ));
    }
}
