//! Vote collection and quorum detection.
//!
//! A [`VoteSet`] gathers the votes of one `(height, round, type)`: it
//! verifies signatures against the validator set, tallies voting power per
//! block id, and reports when some block id (or nil) has crossed the
//! strict 2/3 threshold. Conflicting votes from the same validator are
//! surfaced as equivocation (for the evidence pipeline) and never change
//! the tally.
//!
//! [`HeightVoteSet`] tracks the prevote/precommit pair for every round of
//! one height and answers proof-of-lock queries.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, trace, warn};

use tessera_crypto::Address;
use tessera_types::{
    BlockId, BlockIdFlag, Commit, CommitSig, ExtendedCommit, ExtendedCommitSig, Height, Round,
    ValidatorSet, Vote, VoteType,
};

/// Errors from adding a vote to a set
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoteSetError {
    /// The vote is for a different height
    #[error("vote height {got} does not match {expected}")]
    WrongHeight {
        /// Height carried by the vote
        got: Height,
        /// The set's height
        expected: Height,
    },

    /// The vote is for a different round
    #[error("vote round {got} does not match {expected}")]
    WrongRound {
        /// Round carried by the vote
        got: Round,
        /// The set's round
        expected: Round,
    },

    /// The vote has the wrong type for this set
    #[error("vote type mismatch")]
    WrongType,

    /// The claimed validator index does not carry the claimed address
    #[error("validator index {index} does not match address {address}")]
    IndexAddressMismatch {
        /// Claimed index
        index: i32,
        /// Claimed address
        address: Address,
    },

    /// The voter is not in the validator set
    #[error("unknown validator {0}")]
    UnknownValidator(Address),

    /// The vote signature does not verify
    #[error("invalid signature from validator {0}")]
    InvalidSignature(Address),

    /// The vote extension signature does not verify
    #[error("invalid vote extension signature from validator {0}")]
    InvalidExtensionSignature(Address),

    /// The same validator signed a conflicting vote
    #[error("conflicting vote from validator {address}")]
    Equivocation {
        /// The equivocating validator
        address: Address,
        /// The vote that was already in the set
        existing: Box<Vote>,
        /// The conflicting vote that was just received
        conflicting: Box<Vote>,
    },

    /// Structural problem with the vote
    #[error("invalid vote: {0}")]
    InvalidVote(String),
}

/// Outcome of [`VoteSet::add_vote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddVoteResult {
    /// Whether the vote changed the set (false for an exact duplicate)
    pub added: bool,
    /// The block id that crossed 2/3 with this vote, if any
    pub new_maj23: Option<BlockId>,
}

/// Votes of a single `(height, round, type)`, power-tallied by block id.
#[derive(Debug, Clone)]
pub struct VoteSet {
    chain_id: String,
    height: Height,
    round: Round,
    vote_type: VoteType,
    validators: ValidatorSet,
    votes: HashMap<Address, Vote>,
    power_by_block: HashMap<BlockId, i64>,
    total_voted_power: i64,
    maj23: Option<BlockId>,
}

impl VoteSet {
    /// Create an empty vote set.
    pub fn new(
        chain_id: &str,
        height: Height,
        round: Round,
        vote_type: VoteType,
        validators: ValidatorSet,
    ) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            height,
            round,
            vote_type,
            validators,
            votes: HashMap::new(),
            power_by_block: HashMap::new(),
            total_voted_power: 0,
            maj23: None,
        }
    }

    /// The set's height.
    pub fn height(&self) -> Height {
        self.height
    }

    /// The set's round.
    pub fn round(&self) -> Round {
        self.round
    }

    /// The set's vote type.
    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    /// Add a vote after full verification.
    ///
    /// An exact duplicate returns `added: false`. A conflicting vote from
    /// the same validator returns [`VoteSetError::Equivocation`] carrying
    /// both votes; the tally is left untouched.
    pub fn add_vote(&mut self, vote: Vote) -> Result<AddVoteResult, VoteSetError> {
        if vote.height != self.height {
            return Err(VoteSetError::WrongHeight {
                got: vote.height,
                expected: self.height,
            });
        }
        if vote.round != self.round {
            return Err(VoteSetError::WrongRound {
                got: vote.round,
                expected: self.round,
            });
        }
        if vote.vote_type != self.vote_type {
            return Err(VoteSetError::WrongType);
        }
        vote.validate_basic()
            .map_err(|e| VoteSetError::InvalidVote(e.to_string()))?;

        let validator = match self.validators.get_by_index(vote.validator_index.max(0) as usize) {
            Some(v) if v.address == vote.validator_address => v,
            Some(_) => {
                return Err(VoteSetError::IndexAddressMismatch {
                    index: vote.validator_index,
                    address: vote.validator_address,
                })
            }
            None => return Err(VoteSetError::UnknownValidator(vote.validator_address)),
        };
        let Some(pub_key) = validator.pub_key.clone() else {
            return Err(VoteSetError::UnknownValidator(vote.validator_address));
        };
        let voting_power = validator.voting_power;

        // Duplicate or equivocation?
        if let Some(existing) = self.votes.get(&vote.validator_address) {
            if existing.block_id == vote.block_id {
                return Ok(AddVoteResult {
                    added: false,
                    new_maj23: None,
                });
            }
            // Verify before accusing: a forged conflicting vote must not
            // produce evidence against an honest validator.
            if !pub_key.verify(&vote.sign_bytes(&self.chain_id), &vote.signature) {
                return Err(VoteSetError::InvalidSignature(vote.validator_address));
            }
            warn!(
                height = self.height,
                round = self.round,
                validator = %vote.validator_address,
                "conflicting vote detected"
            );
            return Err(VoteSetError::Equivocation {
                address: vote.validator_address,
                existing: Box::new(existing.clone()),
                conflicting: Box::new(vote),
            });
        }

        if !pub_key.verify(&vote.sign_bytes(&self.chain_id), &vote.signature) {
            return Err(VoteSetError::InvalidSignature(vote.validator_address));
        }
        // Precommits for a block must carry a verifiable extension
        // signature when one is present.
        if !vote.extension_signature.is_empty()
            && !pub_key.verify(
                &vote.extension_sign_bytes(&self.chain_id),
                &vote.extension_signature,
            )
        {
            return Err(VoteSetError::InvalidExtensionSignature(
                vote.validator_address,
            ));
        }

        trace!(
            height = self.height,
            round = self.round,
            vote_type = %self.vote_type,
            validator = %vote.validator_address,
            block_id = %vote.block_id,
            power = voting_power,
            "adding vote"
        );

        let block_power = self
            .power_by_block
            .entry(vote.block_id)
            .or_insert(0);
        *block_power += voting_power;
        let block_power = *block_power;
        self.total_voted_power += voting_power;
        let block_id = vote.block_id;
        self.votes.insert(vote.validator_address, vote);

        let mut new_maj23 = None;
        if self.maj23.is_none() && block_power > self.validators.quorum_threshold() {
            debug!(
                height = self.height,
                round = self.round,
                vote_type = %self.vote_type,
                block_id = %block_id,
                power = block_power,
                "2/3 majority reached"
            );
            self.maj23 = Some(block_id);
            new_maj23 = Some(block_id);
        }

        Ok(AddVoteResult {
            added: true,
            new_maj23,
        })
    }

    /// The block id that holds a 2/3 majority, if any (may be nil).
    pub fn two_thirds_majority(&self) -> Option<BlockId> {
        self.maj23
    }

    /// Whether 2/3 of the power has voted for *anything* (possibly split).
    pub fn has_two_thirds_any(&self) -> bool {
        self.total_voted_power > self.validators.quorum_threshold()
    }

    /// Whether the majority, if reached, is for nil.
    pub fn has_two_thirds_nil(&self) -> bool {
        self.maj23.map(|id| id.is_zero()).unwrap_or(false)
    }

    /// The vote of a specific validator, if present.
    pub fn get_vote(&self, address: &Address) -> Option<&Vote> {
        self.votes.get(address)
    }

    /// Whether a validator has voted in this set.
    pub fn has_voted(&self, address: &Address) -> bool {
        self.votes.contains_key(address)
    }

    /// Number of votes collected.
    pub fn vote_count(&self) -> usize {
        self.votes.len()
    }

    /// Voting power tallied for a specific block id.
    pub fn power_for(&self, block_id: &BlockId) -> i64 {
        self.power_by_block.get(block_id).copied().unwrap_or(0)
    }

    /// Total voting power that has voted.
    pub fn total_voted_power(&self) -> i64 {
        self.total_voted_power
    }

    /// Bit per validator (in canonical order): voted for `block_id`.
    pub fn bit_array_for(&self, block_id: &BlockId) -> Vec<bool> {
        self.validators
            .validators()
            .iter()
            .map(|v| {
                self.votes
                    .get(&v.address)
                    .map(|vote| &vote.block_id == block_id)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Build the canonical [`Commit`] once a non-nil majority exists.
    ///
    /// Entry `i` reflects validator `i`'s precommit: `Commit` for the
    /// majority block, `Nil` for an explicit nil vote, `Absent` otherwise.
    pub fn make_commit(&self) -> Option<Commit> {
        if self.vote_type != VoteType::Precommit {
            return None;
        }
        let maj23 = self.maj23.filter(|id| !id.is_zero())?;

        let signatures: Vec<CommitSig> = self
            .validators
            .validators()
            .iter()
            .map(|validator| match self.votes.get(&validator.address) {
                Some(vote) if vote.block_id == maj23 => CommitSig {
                    flag: BlockIdFlag::Commit,
                    validator_address: validator.address,
                    timestamp: vote.timestamp,
                    signature: vote.signature.clone(),
                },
                Some(vote) if vote.is_nil() => CommitSig {
                    flag: BlockIdFlag::Nil,
                    validator_address: validator.address,
                    timestamp: vote.timestamp,
                    signature: vote.signature.clone(),
                },
                // A precommit for a *different* block cannot be represented
                // in a commit; it counts as absent.
                _ => CommitSig::absent(),
            })
            .collect();

        Some(Commit::new(self.height, self.round, maj23, signatures))
    }

    /// Build the [`ExtendedCommit`] (commit plus vote extensions).
    pub fn make_extended_commit(&self) -> Option<ExtendedCommit> {
        let commit = self.make_commit()?;
        let extended_signatures: Vec<ExtendedCommitSig> = commit
            .signatures
            .iter()
            .map(|sig| {
                let (extension, extension_signature) = if sig.flag == BlockIdFlag::Commit {
                    self.votes
                        .get(&sig.validator_address)
                        .map(|v| (v.extension.clone(), v.extension_signature.clone()))
                        .unwrap_or_default()
                } else {
                    Default::default()
                };
                ExtendedCommitSig {
                    commit_sig: sig.clone(),
                    extension,
                    extension_signature,
                }
            })
            .collect();
        Some(ExtendedCommit {
            height: commit.height,
            round: commit.round,
            block_id: commit.block_id,
            extended_signatures,
        })
    }
}

/// Prevote/precommit pair per round for one height.
#[derive(Debug, Clone)]
pub struct HeightVoteSet {
    chain_id: String,
    height: Height,
    validators: ValidatorSet,
    rounds: BTreeMap<Round, RoundVoteSet>,
}

#[derive(Debug, Clone)]
struct RoundVoteSet {
    prevotes: VoteSet,
    precommits: VoteSet,
}

impl HeightVoteSet {
    /// Create the vote bookkeeping for `height`.
    pub fn new(chain_id: &str, height: Height, validators: ValidatorSet) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            height,
            validators,
            rounds: BTreeMap::new(),
        }
    }

    /// The height being tracked.
    pub fn height(&self) -> Height {
        self.height
    }

    fn round_entry(&mut self, round: Round) -> &mut RoundVoteSet {
        let chain_id = self.chain_id.clone();
        let height = self.height;
        let validators = self.validators.clone();
        self.rounds.entry(round).or_insert_with(|| RoundVoteSet {
            prevotes: VoteSet::new(
                &chain_id,
                height,
                round,
                VoteType::Prevote,
                validators.clone(),
            ),
            precommits: VoteSet::new(&chain_id, height, round, VoteType::Precommit, validators),
        })
    }

    /// Route a vote into the right round and type set.
    pub fn add_vote(&mut self, vote: Vote) -> Result<AddVoteResult, VoteSetError> {
        if vote.height != self.height {
            return Err(VoteSetError::WrongHeight {
                got: vote.height,
                expected: self.height,
            });
        }
        let round = vote.round;
        let entry = self.round_entry(round);
        match vote.vote_type {
            VoteType::Prevote => entry.prevotes.add_vote(vote),
            VoteType::Precommit => entry.precommits.add_vote(vote),
        }
    }

    /// The prevote set of `round`, creating it on first access.
    pub fn prevotes_mut(&mut self, round: Round) -> &mut VoteSet {
        &mut self.round_entry(round).prevotes
    }

    /// The precommit set of `round`, creating it on first access.
    pub fn precommits_mut(&mut self, round: Round) -> &mut VoteSet {
        &mut self.round_entry(round).precommits
    }

    /// The prevote set of `round`, if any votes arrived.
    pub fn prevotes(&self, round: Round) -> Option<&VoteSet> {
        self.rounds.get(&round).map(|r| &r.prevotes)
    }

    /// The precommit set of `round`, if any votes arrived.
    pub fn precommits(&self, round: Round) -> Option<&VoteSet> {
        self.rounds.get(&round).map(|r| &r.precommits)
    }

    /// The earliest round at or after `min_round` whose prevotes hold a
    /// 2/3 majority for `block_id` (a proof of lock).
    pub fn pol_round_for(&self, block_id: &BlockId, min_round: Round) -> Option<Round> {
        self.rounds
            .range(min_round..)
            .find(|(_, sets)| sets.prevotes.two_thirds_majority().as_ref() == Some(block_id))
            .map(|(round, _)| *round)
    }

    /// Rounds that have seen any vote, ascending.
    pub fn rounds(&self) -> Vec<Round> {
        self.rounds.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_crypto::PrivateKey;
    use tessera_types::{PartSetHeader, Validator};

    const CHAIN_ID: &str = "vote-set-test";

    fn fixture(n: usize) -> (ValidatorSet, Vec<PrivateKey>) {
        let keys: Vec<PrivateKey> = (0..n)
            .map(|i| PrivateKey::from_seed_ed25519([i as u8 + 1; 32]))
            .collect();
        let vals = ValidatorSet::new(
            keys.iter()
                .map(|k| Validator::new(k.public_key(), 10))
                .collect(),
        )
        .unwrap();
        // Reorder keys into canonical validator order so that index i signs
        // for validator i.
        let keys = {
            let mut sorted: Vec<PrivateKey> = Vec::with_capacity(n);
            for v in vals.validators() {
                let pos = keys
                    .iter()
                    .position(|k| Some(k.public_key()) == v.pub_key)
                    .unwrap();
                sorted.push(PrivateKey::from_seed_ed25519([pos as u8 + 1; 32]));
            }
            sorted
        };
        (vals, keys)
    }

    fn block_id(byte: u8) -> BlockId {
        BlockId {
            hash: [byte; 32],
            part_set_header: PartSetHeader {
                total: 1,
                hash: [byte; 32],
            },
        }
    }

    fn signed_vote(
        vals: &ValidatorSet,
        keys: &[PrivateKey],
        index: usize,
        vote_type: VoteType,
        round: Round,
        id: BlockId,
    ) -> Vote {
        let validator = vals.get_by_index(index).unwrap();
        let mut vote = Vote::new(vote_type, 1, round, id, validator.address, index as i32);
        vote.timestamp = 1000 + index as u64;
        vote.signature = keys[index].sign(&vote.sign_bytes(CHAIN_ID));
        vote
    }

    #[test]
    fn test_quorum_detection() {
        let (vals, keys) = fixture(4);
        let mut set = VoteSet::new(CHAIN_ID, 1, 0, VoteType::Prevote, vals.clone());
        let id = block_id(1);

        for i in 0..2 {
            let result = set
                .add_vote(signed_vote(&vals, &keys, i, VoteType::Prevote, 0, id))
                .unwrap();
            assert!(result.added);
            assert!(result.new_maj23.is_none());
        }
        // Third vote crosses 30 > 26.
        let result = set
            .add_vote(signed_vote(&vals, &keys, 2, VoteType::Prevote, 0, id))
            .unwrap();
        assert_eq!(result.new_maj23, Some(id));
        assert_eq!(set.two_thirds_majority(), Some(id));
    }

    #[test]
    fn test_duplicate_vote_is_noop() {
        let (vals, keys) = fixture(4);
        let mut set = VoteSet::new(CHAIN_ID, 1, 0, VoteType::Prevote, vals.clone());
        let vote = signed_vote(&vals, &keys, 0, VoteType::Prevote, 0, block_id(1));

        assert!(set.add_vote(vote.clone()).unwrap().added);
        let result = set.add_vote(vote).unwrap();
        assert!(!result.added);
        assert_eq!(set.vote_count(), 1);
        assert_eq!(set.total_voted_power(), 10);
    }

    #[test]
    fn test_equivocation_detected_and_not_tallied() {
        let (vals, keys) = fixture(4);
        let mut set = VoteSet::new(CHAIN_ID, 1, 0, VoteType::Prevote, vals.clone());

        set.add_vote(signed_vote(&vals, &keys, 0, VoteType::Prevote, 0, block_id(1)))
            .unwrap();
        let err = set
            .add_vote(signed_vote(&vals, &keys, 0, VoteType::Prevote, 0, block_id(2)))
            .unwrap_err();

        let VoteSetError::Equivocation {
            address,
            existing,
            conflicting,
        } = err
        else {
            panic!("expected equivocation");
        };
        assert_eq!(address, vals.get_by_index(0).unwrap().address);
        assert_eq!(existing.block_id, block_id(1));
        assert_eq!(conflicting.block_id, block_id(2));

        // The tally still counts the first vote only.
        assert_eq!(set.power_for(&block_id(1)), 10);
        assert_eq!(set.power_for(&block_id(2)), 0);
        assert_eq!(set.total_voted_power(), 10);
    }

    #[test]
    fn test_forged_conflicting_vote_is_not_equivocation() {
        let (vals, keys) = fixture(4);
        let mut set = VoteSet::new(CHAIN_ID, 1, 0, VoteType::Prevote, vals.clone());

        set.add_vote(signed_vote(&vals, &keys, 0, VoteType::Prevote, 0, block_id(1)))
            .unwrap();

        // An attacker relays a conflicting vote with a bad signature; this
        // must be a signature error, not evidence.
        let mut forged = signed_vote(&vals, &keys, 0, VoteType::Prevote, 0, block_id(2));
        forged.signature = tessera_crypto::Signature(vec![0u8; 64]);
        assert!(matches!(
            set.add_vote(forged).unwrap_err(),
            VoteSetError::InvalidSignature(_)
        ));
    }

    #[test]
    fn test_nil_majority() {
        let (vals, keys) = fixture(4);
        let mut set = VoteSet::new(CHAIN_ID, 1, 0, VoteType::Prevote, vals.clone());

        for i in 0..3 {
            set.add_vote(signed_vote(
                &vals,
                &keys,
                i,
                VoteType::Prevote,
                0,
                BlockId::zero(),
            ))
            .unwrap();
        }
        assert!(set.has_two_thirds_nil());
        assert_eq!(set.two_thirds_majority(), Some(BlockId::zero()));
    }

    #[test]
    fn test_split_votes_reach_any_but_no_majority() {
        let (vals, keys) = fixture(4);
        let mut set = VoteSet::new(CHAIN_ID, 1, 0, VoteType::Prevote, vals.clone());

        set.add_vote(signed_vote(&vals, &keys, 0, VoteType::Prevote, 0, block_id(1)))
            .unwrap();
        set.add_vote(signed_vote(&vals, &keys, 1, VoteType::Prevote, 0, block_id(2)))
            .unwrap();
        set.add_vote(signed_vote(&vals, &keys, 2, VoteType::Prevote, 0, BlockId::zero()))
            .unwrap();

        assert!(set.has_two_thirds_any());
        assert_eq!(set.two_thirds_majority(), None);
    }

    #[test]
    fn test_wrong_index_rejected() {
        let (vals, keys) = fixture(4);
        let mut set = VoteSet::new(CHAIN_ID, 1, 0, VoteType::Prevote, vals.clone());

        let mut vote = signed_vote(&vals, &keys, 0, VoteType::Prevote, 0, block_id(1));
        vote.validator_index = 1;
        vote.signature = keys[0].sign(&vote.sign_bytes(CHAIN_ID));
        assert!(matches!(
            set.add_vote(vote).unwrap_err(),
            VoteSetError::IndexAddressMismatch { .. }
        ));
    }

    #[test]
    fn test_make_commit_reflects_votes() {
        let (vals, keys) = fixture(4);
        let mut set = VoteSet::new(CHAIN_ID, 1, 2, VoteType::Precommit, vals.clone());
        let id = block_id(7);

        for i in 0..3 {
            set.add_vote(signed_vote(&vals, &keys, i, VoteType::Precommit, 2, id))
                .unwrap();
        }
        set.add_vote(signed_vote(
            &vals,
            &keys,
            3,
            VoteType::Precommit,
            2,
            BlockId::zero(),
        ))
        .unwrap();

        let commit = set.make_commit().unwrap();
        assert_eq!(commit.height, 1);
        assert_eq!(commit.round, 2);
        assert_eq!(commit.block_id, id);
        assert_eq!(commit.signatures.len(), 4);
        assert_eq!(commit.signatures[0].flag, BlockIdFlag::Commit);
        assert_eq!(commit.signatures[3].flag, BlockIdFlag::Nil);

        // The produced commit verifies against the set.
        vals.verify_commit(CHAIN_ID, &id, 1, &commit).unwrap();
    }

    #[test]
    fn test_height_vote_set_pol_round() {
        let (vals, keys) = fixture(4);
        let mut hvs = HeightVoteSet::new(CHAIN_ID, 1, vals.clone());
        let id = block_id(1);

        for i in 0..3 {
            hvs.add_vote(signed_vote(&vals, &keys, i, VoteType::Prevote, 1, id))
                .unwrap();
        }

        assert_eq!(hvs.pol_round_for(&id, 0), Some(1));
        assert_eq!(hvs.pol_round_for(&id, 1), Some(1));
        assert_eq!(hvs.pol_round_for(&id, 2), None);
        assert_eq!(hvs.pol_round_for(&block_id(9), 0), None);
    }
}
