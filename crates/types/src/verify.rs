//! Commit verification against a validator set.
//!
//! Three verification modes, all gated on strict `> 2/3` voting power:
//!
//! - [`ValidatorSet::verify_commit`] - full verification, every signature
//!   checked, one-to-one index correspondence with the set
//! - [`ValidatorSet::verify_commit_light`] - stops verifying once the
//!   quorum is tallied (block sync / state replay path)
//! - [`ValidatorSet::verify_commit_light_trusting`] - light-client path:
//!   validators are looked up by address and a configurable trust fraction
//!   replaces the 2/3 threshold
//!
//! An optional [`SignatureCache`] memoizes successful verifications; a miss
//! always re-verifies, so the cache can never mask a failure.

use std::collections::HashMap;

use tessera_crypto::{sha256, Address, Hash, Signature};
use tracing::trace;

use crate::commit::{Commit, CommitSig};
use crate::block::BlockId;
use crate::validator::ValidatorSet;
use crate::Height;

/// Errors from commit verification
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommitVerifyError {
    /// The commit is for a different height than expected
    #[error("invalid commit height: expected {expected}, got {got}")]
    InvalidCommitHeight {
        /// Height the caller expected
        expected: Height,
        /// Height carried by the commit
        got: Height,
    },

    /// The commit does not carry one entry per validator
    #[error("invalid commit: expected {expected} signatures, got {got}")]
    InvalidCommitSignatures {
        /// Validator-set size
        expected: usize,
        /// Number of entries in the commit
        got: usize,
    },

    /// The commit certifies a different block than expected
    #[error("invalid commit: wrong block id, want {want}, got {got}")]
    WrongBlockId {
        /// Expected block id
        want: String,
        /// Block id carried by the commit
        got: String,
    },

    /// A signature failed verification
    #[error("wrong signature (#{index}): {signature}")]
    InvalidSignature {
        /// Index of the offending entry
        index: usize,
        /// Hex of the offending signature
        signature: String,
    },

    /// A validator signed twice within one commit (by-address lookup path)
    #[error("commit contains two votes from validator {0}")]
    DoubleVote(Address),

    /// A counted validator has no public key configured
    #[error("validator {0} has no public key")]
    MissingPublicKey(Address),

    /// The tallied voting power does not exceed the threshold
    #[error("not enough voting power: got {got}, need more than {needed}")]
    NotEnoughVotingPower {
        /// Tallied power
        got: i64,
        /// Threshold that must be strictly exceeded
        needed: i64,
    },

    /// The trust level fraction is outside [1/3, 1]
    #[error("invalid trust level: {numerator}/{denominator}")]
    InvalidTrustLevel {
        /// Numerator
        numerator: i64,
        /// Denominator
        denominator: i64,
    },
}

/// A fraction of the total voting power that a light client trusts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustLevel {
    /// Numerator of the fraction
    pub numerator: i64,
    /// Denominator of the fraction
    pub denominator: i64,
}

impl TrustLevel {
    /// The default light-client trust level of one third.
    pub const ONE_THIRD: TrustLevel = TrustLevel {
        numerator: 1,
        denominator: 3,
    };

    /// Validate that the fraction lies in `[1/3, 1]`.
    pub fn validate(&self) -> Result<(), CommitVerifyError> {
        if self.denominator <= 0
            || self.numerator <= 0
            || self.numerator * 3 < self.denominator
            || self.numerator > self.denominator
        {
            return Err(CommitVerifyError::InvalidTrustLevel {
                numerator: self.numerator,
                denominator: self.denominator,
            });
        }
        Ok(())
    }
}

/// Memoizes successful signature verifications across commits.
///
/// Keys are `(public key bytes, SHA-256 of the sign bytes, signature)`.
/// Only `valid == true` results are stored: a hit is authoritative, a miss
/// re-verifies. Insertion evicts nothing until `capacity`, then clears;
/// the cache is an accelerator, not a source of truth.
#[derive(Debug)]
pub struct SignatureCache {
    entries: HashMap<(Vec<u8>, Hash, Vec<u8>), ()>,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl SignatureCache {
    /// Create a cache bounded to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            hits: 0,
            misses: 0,
        }
    }

    /// Whether this exact verification has already succeeded.
    pub fn contains(&mut self, key_bytes: &[u8], msg: &[u8], signature: &Signature) -> bool {
        let key = (key_bytes.to_vec(), sha256(msg), signature.0.clone());
        if self.entries.contains_key(&key) {
            self.hits += 1;
            true
        } else {
            self.misses += 1;
            false
        }
    }

    /// Record a successful verification. Failures are never recorded.
    pub fn insert_valid(&mut self, key_bytes: &[u8], msg: &[u8], signature: &Signature) {
        if self.entries.len() >= self.capacity {
            trace!(capacity = self.capacity, "signature cache full, clearing");
            self.entries.clear();
        }
        self.entries
            .insert((key_bytes.to_vec(), sha256(msg), signature.0.clone()), ());
    }

    /// `(hits, misses)` counters.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    /// Number of cached verifications.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ValidatorSet {
    /// Fully verify `commit` as the finalization of `block_id` at `height`.
    ///
    /// Every non-absent signature is checked against the validator at the
    /// same index; `Commit`-flagged entries tally voting power. Accepts iff
    /// the tally strictly exceeds `2/3` of the total voting power.
    pub fn verify_commit(
        &self,
        chain_id: &str,
        block_id: &BlockId,
        height: Height,
        commit: &Commit,
    ) -> Result<(), CommitVerifyError> {
        self.verify_commit_with_cache(chain_id, block_id, height, commit, None)
    }

    /// [`verify_commit`](Self::verify_commit) with a shared signature cache.
    pub fn verify_commit_with_cache(
        &self,
        chain_id: &str,
        block_id: &BlockId,
        height: Height,
        commit: &Commit,
        cache: Option<&mut SignatureCache>,
    ) -> Result<(), CommitVerifyError> {
        self.check_vals_and_commit(block_id, height, commit)?;
        let needed = self.quorum_threshold();
        verify_commit_single(
            chain_id,
            self,
            commit,
            needed,
            |sig| sig.is_absent(),
            CommitSig::for_block,
            true,
            true,
            cache,
        )
    }

    /// Verify only as many signatures as are needed to cross the quorum.
    ///
    /// Trusts that the remaining entries are well-formed; used where the
    /// commit was already accepted by the network (replay, block sync).
    pub fn verify_commit_light(
        &self,
        chain_id: &str,
        block_id: &BlockId,
        height: Height,
        commit: &Commit,
    ) -> Result<(), CommitVerifyError> {
        self.check_vals_and_commit(block_id, height, commit)?;
        let needed = self.quorum_threshold();
        verify_commit_single(
            chain_id,
            self,
            commit,
            needed,
            |sig| !sig.for_block(),
            CommitSig::for_block,
            false,
            true,
            None,
        )
    }

    /// Light-client verification against a possibly different validator
    /// set: entries are matched by address, double votes are rejected, and
    /// the threshold is `trust_level` of this set's total power.
    pub fn verify_commit_light_trusting(
        &self,
        chain_id: &str,
        commit: &Commit,
        trust_level: TrustLevel,
    ) -> Result<(), CommitVerifyError> {
        trust_level.validate()?;
        // totals are capped at i64::MAX / 8, so this product cannot overflow
        let needed = self.total_voting_power() * trust_level.numerator / trust_level.denominator;
        verify_commit_single(
            chain_id,
            self,
            commit,
            needed,
            |sig| !sig.for_block(),
            CommitSig::for_block,
            false,
            false,
            None,
        )
    }

    fn check_vals_and_commit(
        &self,
        block_id: &BlockId,
        height: Height,
        commit: &Commit,
    ) -> Result<(), CommitVerifyError> {
        if commit.height != height {
            return Err(CommitVerifyError::InvalidCommitHeight {
                expected: height,
                got: commit.height,
            });
        }
        if commit.size() != self.len() {
            return Err(CommitVerifyError::InvalidCommitSignatures {
                expected: self.len(),
                got: commit.size(),
            });
        }
        if &commit.block_id != block_id {
            return Err(CommitVerifyError::WrongBlockId {
                want: block_id.to_string(),
                got: commit.block_id.to_string(),
            });
        }
        Ok(())
    }
}

/// Single-pass commit verification shared by every mode.
///
/// `ignore` skips entries entirely, `count` decides which verified entries
/// tally voting power, `count_all` disables the early exit at quorum, and
/// `lookup_by_index` switches between one-to-one index correspondence and
/// by-address lookup (with double-vote detection).
#[allow(clippy::too_many_arguments)]
fn verify_commit_single<Ignore, Count>(
    chain_id: &str,
    vals: &ValidatorSet,
    commit: &Commit,
    voting_power_needed: i64,
    ignore: Ignore,
    count: Count,
    count_all: bool,
    lookup_by_index: bool,
    mut cache: Option<&mut SignatureCache>,
) -> Result<(), CommitVerifyError>
where
    Ignore: Fn(&CommitSig) -> bool,
    Count: Fn(&CommitSig) -> bool,
{
    let mut tallied: i64 = 0;
    let mut seen: HashMap<Address, usize> = HashMap::new();

    for (index, commit_sig) in commit.signatures.iter().enumerate() {
        if ignore(commit_sig) {
            continue;
        }

        let val = if lookup_by_index {
            // check_vals_and_commit guaranteed the 1:1 correspondence
            vals.get_by_index(index).expect("length checked")
        } else {
            let Some((_, val)) = vals.get_by_address(&commit_sig.validator_address) else {
                continue;
            };
            if seen.insert(commit_sig.validator_address, index).is_some() {
                return Err(CommitVerifyError::DoubleVote(commit_sig.validator_address));
            }
            val
        };

        let Some(pub_key) = &val.pub_key else {
            return Err(CommitVerifyError::MissingPublicKey(val.address));
        };

        let sign_bytes = commit
            .vote_sign_bytes(chain_id, index)
            .expect("index in bounds");

        let cached = cache
            .as_mut()
            .map(|c| c.contains(pub_key.as_bytes(), &sign_bytes, &commit_sig.signature))
            .unwrap_or(false);
        if !cached {
            if !pub_key.verify(&sign_bytes, &commit_sig.signature) {
                return Err(CommitVerifyError::InvalidSignature {
                    index,
                    signature: hex::encode(&commit_sig.signature.0),
                });
            }
            if let Some(c) = cache.as_mut() {
                c.insert_valid(pub_key.as_bytes(), &sign_bytes, &commit_sig.signature);
            }
        }

        if count(commit_sig) {
            tallied += val.voting_power;
        }

        if !count_all && tallied > voting_power_needed {
            return Ok(());
        }
    }

    if tallied <= voting_power_needed {
        return Err(CommitVerifyError::NotEnoughVotingPower {
            got: tallied,
            needed: voting_power_needed,
        });
    }
    Ok(())
}
