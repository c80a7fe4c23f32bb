//! Commits and extended commits.
//!
//! A [`Commit`] is the aggregate of precommit signatures that finalized a
//! block: `signatures[i]` corresponds to `validator_set[i]` and carries a
//! flag saying whether that validator signed the committed block, signed
//! nil, or was absent. An [`ExtendedCommit`] additionally carries the
//! application-defined vote extension of each signer.

use serde::{Deserialize, Serialize};

use tessera_crypto::merkle::merkle_root;
use tessera_crypto::{Address, Hash, Signature};

use crate::block::BlockId;
use crate::vote::{Vote, VoteType};
use crate::{Height, Round, TimestampMs};

/// Errors from commit validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommitError {
    /// Height is not positive
    #[error("non-positive commit height: {0}")]
    InvalidHeight(Height),

    /// Round is negative
    #[error("negative commit round: {0}")]
    InvalidRound(Round),

    /// Commit has no signatures
    #[error("commit has no signatures")]
    NoSignatures,

    /// Commit block id is nil
    #[error("commit for a nil block id")]
    NilBlockId,

    /// A commit signature entry is malformed
    #[error("invalid commit signature #{index}: {reason}")]
    InvalidCommitSig {
        /// Index of the offending entry
        index: usize,
        /// Why the entry is malformed
        reason: String,
    },
}

/// Per-validator participation flag in a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum BlockIdFlag {
    /// The validator did not vote, or its vote was not received
    #[default]
    Absent,
    /// The validator signed the committed block
    Commit,
    /// The validator signed nil
    Nil,
}

/// One validator's entry in a [`Commit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CommitSig {
    /// What this validator signed, if anything
    pub flag: BlockIdFlag,
    /// Address of the validator (zero when absent)
    pub validator_address: Address,
    /// When the vote was signed (Unix millis; zero when absent)
    pub timestamp: TimestampMs,
    /// The precommit signature (empty when absent)
    pub signature: Signature,
}

impl CommitSig {
    /// An absent entry: a placeholder contributing zero voting power.
    pub fn absent() -> Self {
        Self::default()
    }

    /// Whether this entry counts toward the committed block.
    pub fn for_block(&self) -> bool {
        self.flag == BlockIdFlag::Commit
    }

    /// Whether this entry is the absent placeholder.
    pub fn is_absent(&self) -> bool {
        self.flag == BlockIdFlag::Absent
    }

    /// The block id this entry effectively voted for, given the commit's
    /// block id: entries flagged `Commit` voted for it, everything else is
    /// treated as nil.
    pub fn effective_block_id(&self, commit_block_id: &BlockId) -> BlockId {
        match self.flag {
            BlockIdFlag::Commit => *commit_block_id,
            BlockIdFlag::Absent | BlockIdFlag::Nil => BlockId::zero(),
        }
    }

    /// Canonical byte encoding used for the commit hash.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + 20 + 8 + self.signature.0.len());
        bytes.push(match self.flag {
            BlockIdFlag::Absent => 0,
            BlockIdFlag::Commit => 1,
            BlockIdFlag::Nil => 2,
        });
        bytes.extend_from_slice(self.validator_address.as_bytes());
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(&self.signature.0);
        bytes
    }

    /// Stateless validity checks.
    pub fn validate_basic(&self) -> Result<(), String> {
        match self.flag {
            BlockIdFlag::Absent => {
                if !self.validator_address.is_zero() {
                    return Err("absent entry carries a validator address".into());
                }
                if !self.signature.is_empty() {
                    return Err("absent entry carries a signature".into());
                }
                if self.timestamp != 0 {
                    return Err("absent entry carries a timestamp".into());
                }
            }
            BlockIdFlag::Commit | BlockIdFlag::Nil => {
                if self.validator_address.is_zero() {
                    return Err("entry is missing the validator address".into());
                }
                if self.signature.is_empty() {
                    return Err("entry is missing the signature".into());
                }
            }
        }
        Ok(())
    }
}

/// The set of precommit signatures that finalized a block at a height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Commit {
    /// Height the commit is for
    pub height: Height,
    /// Round in which the block was committed
    pub round: Round,
    /// Id of the committed block
    pub block_id: BlockId,
    /// One entry per validator, in validator-set order
    pub signatures: Vec<CommitSig>,
}

impl Commit {
    /// Create a new commit.
    pub fn new(height: Height, round: Round, block_id: BlockId, signatures: Vec<CommitSig>) -> Self {
        Self {
            height,
            round,
            block_id,
            signatures,
        }
    }

    /// Number of signature entries (equals the validator-set size).
    pub fn size(&self) -> usize {
        self.signatures.len()
    }

    /// Whether the commit carries no entries (only valid for height 1's
    /// `last_commit`).
    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Merkle root over the canonical signature entries, committed into the
    /// next block's header.
    pub fn hash(&self) -> Hash {
        merkle_root(
            &self
                .signatures
                .iter()
                .map(|sig| sig.canonical_bytes())
                .collect::<Vec<_>>(),
        )
    }

    /// Reconstruct the precommit vote that entry `index` signed, so its
    /// signature can be verified with [`Vote::sign_bytes`].
    pub fn vote_at(&self, index: usize) -> Option<Vote> {
        let sig = self.signatures.get(index)?;
        let mut vote = Vote::new(
            VoteType::Precommit,
            self.height,
            self.round,
            sig.effective_block_id(&self.block_id),
            sig.validator_address,
            index as i32,
        );
        vote.timestamp = sig.timestamp;
        vote.signature = sig.signature.clone();
        Some(vote)
    }

    /// The canonical sign bytes entry `index` must have signed.
    pub fn vote_sign_bytes(&self, chain_id: &str, index: usize) -> Option<Vec<u8>> {
        self.vote_at(index).map(|vote| vote.sign_bytes(chain_id))
    }

    /// Stateless validity checks.
    pub fn validate_basic(&self) -> Result<(), CommitError> {
        if self.height < 1 {
            return Err(CommitError::InvalidHeight(self.height));
        }
        if self.round < 0 {
            return Err(CommitError::InvalidRound(self.round));
        }
        if self.block_id.is_zero() {
            return Err(CommitError::NilBlockId);
        }
        if self.signatures.is_empty() {
            return Err(CommitError::NoSignatures);
        }
        for (index, sig) in self.signatures.iter().enumerate() {
            sig.validate_basic()
                .map_err(|reason| CommitError::InvalidCommitSig { index, reason })?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Commit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let signed = self.signatures.iter().filter(|s| !s.is_absent()).count();
        write!(
            f,
            "Commit(h={} r={} {} {}/{} signed)",
            self.height,
            self.round,
            self.block_id,
            signed,
            self.signatures.len()
        )
    }
}

/// One validator's entry in an [`ExtendedCommit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExtendedCommitSig {
    /// The plain commit entry
    pub commit_sig: CommitSig,
    /// Application-defined vote extension
    pub extension: Vec<u8>,
    /// Signature over the extension sign bytes
    pub extension_signature: Signature,
}

impl ExtendedCommitSig {
    /// Stateless validity checks; extensions may only accompany `Commit`
    /// flagged entries.
    pub fn validate_basic(&self) -> Result<(), String> {
        self.commit_sig.validate_basic()?;
        if self.commit_sig.flag != BlockIdFlag::Commit
            && (!self.extension.is_empty() || !self.extension_signature.is_empty())
        {
            return Err("vote extension on a non-commit entry".into());
        }
        Ok(())
    }
}

/// A [`Commit`] enriched with per-voter vote extensions.
///
/// This is what the engine persists as the "seen commit" so extensions can
/// be handed back to the application when the next block is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExtendedCommit {
    /// Height the commit is for
    pub height: Height,
    /// Round in which the block was committed
    pub round: Round,
    /// Id of the committed block
    pub block_id: BlockId,
    /// One entry per validator, in validator-set order
    pub extended_signatures: Vec<ExtendedCommitSig>,
}

impl ExtendedCommit {
    /// Strip the extensions, yielding the plain commit.
    pub fn to_commit(&self) -> Commit {
        Commit {
            height: self.height,
            round: self.round,
            block_id: self.block_id,
            signatures: self
                .extended_signatures
                .iter()
                .map(|e| e.commit_sig.clone())
                .collect(),
        }
    }

    /// Stateless validity checks.
    pub fn validate_basic(&self) -> Result<(), CommitError> {
        self.to_commit().validate_basic()?;
        for (index, sig) in self.extended_signatures.iter().enumerate() {
            sig.validate_basic()
                .map_err(|reason| CommitError::InvalidCommitSig { index, reason })?;
        }
        Ok(())
    }
}
