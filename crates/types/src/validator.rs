//! Validators and the validator set.
//!
//! The [`ValidatorSet`] holds the identities allowed to vote at a height,
//! keeps them in canonical order (descending voting power, ties broken by
//! ascending address), caches the total voting power, and runs the
//! deterministic proposer election over `proposer_priority`.
//!
//! ## Proposer election
//!
//! Each increment adds every validator's voting power to its priority,
//! elects the validator with the highest priority (ties go to the smallest
//! address), and subtracts the total voting power from the winner. Before
//! incrementing, priorities are rescaled so their spread stays within
//! `2 * total_voting_power` and centered so their sum stays in `(-n, n)`.
//! The sequence of elected proposers is reproducible bit-for-bit from the
//! initial set and the number of increments; a change in tie-break or
//! rounding behavior is a consensus failure.
//!
//! ## Updates
//!
//! [`ValidatorSet::update_with_change_set`] applies a batch of power
//! changes (zero power = removal) atomically and independently of input
//! order. Freshly added validators enter at the low end of the priority
//! window so they cannot jump the election queue.

use serde::{Deserialize, Serialize};
use tracing::debug;

use tessera_crypto::merkle::merkle_root;
use tessera_crypto::{Address, Hash, PublicKey};

use crate::arith::{
    safe_add, safe_add_clip, safe_sub_clip, MAX_TOTAL_VOTING_POWER, PRIORITY_WINDOW_SIZE_FACTOR,
};

/// Errors from validator-set construction and updates
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidatorSetError {
    /// The set is nil or empty where a non-empty set is required
    #[error("validator set is nil or empty")]
    Empty,

    /// The same address appears twice in a change set
    #[error("duplicate validator address in changes: {0}")]
    DuplicateAddress(Address),

    /// A change carries a negative voting power
    #[error("voting power can't be negative: {power} (validator {address})")]
    NegativeVotingPower {
        /// Offending validator
        address: Address,
        /// The negative power
        power: i64,
    },

    /// Applying the changes would push the total voting power over the cap
    #[error("total voting power would exceed the maximum {0}")]
    TotalVotingPowerOverflow(i64),

    /// A removal names a validator that is not in the set
    #[error("failed to find validator {0} to remove")]
    ValidatorNotFound(Address),

    /// Applying the changes would leave the set empty
    #[error("applying the validator changes would result in an empty set")]
    WouldBeEmpty,

    /// Deletions are not allowed in this context (genesis construction)
    #[error("cannot process validators with voting power 0 here")]
    UnexpectedRemoval,

    /// A validator failed its basic checks
    #[error("invalid validator: {0}")]
    InvalidValidator(String),

    /// The proposer pointer names a validator outside the set
    #[error("proposer is not in the validator set")]
    ProposerNotInSet,
}

/// A consensus validator: identity, weight, and scheduling state.
///
/// `proposer_priority` is ephemeral election state; it is never part of the
/// validator-set hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    /// 20-byte address derived from the public key
    pub address: Address,
    /// Consensus public key; may be absent for placeholder entries used in
    /// change sets keyed purely by address
    pub pub_key: Option<PublicKey>,
    /// Voting weight; strictly positive inside a set
    pub voting_power: i64,
    /// Proposer election accumulator
    pub proposer_priority: i64,
}

impl Validator {
    /// Create a validator from its public key, deriving the address.
    pub fn new(pub_key: PublicKey, voting_power: i64) -> Self {
        Self {
            address: pub_key.address(),
            pub_key: Some(pub_key),
            voting_power,
            proposer_priority: 0,
        }
    }

    /// Create a change-set entry addressed directly; used for removals and
    /// in tests that exercise the election with synthetic addresses.
    pub fn with_address(address: Address, voting_power: i64) -> Self {
        Self {
            address,
            pub_key: None,
            voting_power,
            proposer_priority: 0,
        }
    }

    /// Stateless validity checks for a member of a set.
    pub fn validate_basic(&self) -> Result<(), ValidatorSetError> {
        if self.pub_key.is_none() {
            return Err(ValidatorSetError::InvalidValidator(
                "validator does not have a public key".into(),
            ));
        }
        if self.voting_power < 0 {
            return Err(ValidatorSetError::InvalidValidator(format!(
                "validator has negative voting power: {}",
                self.voting_power
            )));
        }
        if let Some(key) = &self.pub_key {
            if key.address() != self.address {
                return Err(ValidatorSetError::InvalidValidator(
                    "validator address does not match its public key".into(),
                ));
            }
        }
        Ok(())
    }

    /// Canonical leaf encoding for the validator-set hash: address and
    /// voting power only.
    fn hash_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(20 + 8);
        bytes.extend_from_slice(self.address.as_bytes());
        bytes.extend_from_slice(&self.voting_power.to_le_bytes());
        bytes
    }

    /// Canonical leaf encoding for the priority hash: address and priority.
    fn priority_hash_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(20 + 8);
        bytes.extend_from_slice(self.address.as_bytes());
        bytes.extend_from_slice(&self.proposer_priority.to_le_bytes());
        bytes
    }
}

impl std::fmt::Display for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Validator{{{} power={} priority={}}}",
            self.address, self.voting_power, self.proposer_priority
        )
    }
}

/// An ordered set of validators with cached total voting power and the
/// current proposer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    proposer: Option<Address>,
    total_voting_power: i64,
}

impl Default for ValidatorSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl ValidatorSet {
    /// The empty set. Useful as the base for genesis construction; most
    /// operations on it are errors or panics.
    pub fn empty() -> Self {
        Self {
            validators: Vec::new(),
            proposer: None,
            total_voting_power: 0,
        }
    }

    /// Build a set from the given validators.
    ///
    /// Rejects duplicates, non-positive powers, and totals over
    /// [`MAX_TOTAL_VOTING_POWER`]. A non-empty set gets one priority
    /// increment so the proposer pointer is populated.
    pub fn new(validators: Vec<Validator>) -> Result<Self, ValidatorSetError> {
        let mut set = Self::empty();
        set.update_with_change_set_internal(&validators, false)?;
        if !set.validators.is_empty() {
            set.increment_proposer_priority(1);
        }
        Ok(set)
    }

    /// Number of validators in the set.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// The validators in canonical order.
    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    /// Whether `address` belongs to a validator in the set.
    pub fn has_address(&self, address: &Address) -> bool {
        self.validators.iter().any(|v| &v.address == address)
    }

    /// Look a validator up by address, returning its index as well.
    pub fn get_by_address(&self, address: &Address) -> Option<(usize, &Validator)> {
        self.validators
            .iter()
            .enumerate()
            .find(|(_, v)| &v.address == address)
    }

    /// Look a validator up by canonical index.
    pub fn get_by_index(&self, index: usize) -> Option<&Validator> {
        self.validators.get(index)
    }

    /// The cached total voting power.
    pub fn total_voting_power(&self) -> i64 {
        self.total_voting_power
    }

    /// The voting power a commit must exceed two thirds of.
    ///
    /// Acceptance is `tallied > 2 * tvp / 3` (strict).
    pub fn quorum_threshold(&self) -> i64 {
        self.total_voting_power / 3 * 2
    }

    /// The current proposer, or `None` for an empty set.
    ///
    /// When no increment has populated the pointer (e.g. right after a
    /// deserialization that dropped it), the validator with the highest
    /// priority is elected on the fly.
    pub fn proposer(&self) -> Option<&Validator> {
        if self.validators.is_empty() {
            return None;
        }
        if let Some(addr) = &self.proposer {
            if let Some((_, val)) = self.get_by_address(addr) {
                return Some(val);
            }
        }
        self.find_most_priority()
    }

    /// Merkle root over the canonical `(address, voting_power)` pairs.
    ///
    /// Stable under priority increments and copies; the empty set hashes to
    /// the empty Merkle root.
    pub fn hash(&self) -> Hash {
        merkle_root(
            &self
                .validators
                .iter()
                .map(|v| v.hash_bytes())
                .collect::<Vec<_>>(),
        )
    }

    /// Merkle root over the `(address, proposer_priority)` pairs, or `None`
    /// for an empty set. Changes on every increment.
    pub fn proposer_priority_hash(&self) -> Option<Hash> {
        if self.validators.is_empty() {
            return None;
        }
        Some(merkle_root(
            &self
                .validators
                .iter()
                .map(|v| v.priority_hash_bytes())
                .collect::<Vec<_>>(),
        ))
    }

    /// Advance the proposer election by `times` rounds.
    ///
    /// # Panics
    ///
    /// Panics on an empty set or `times < 1`; both indicate a caller bug
    /// that would otherwise corrupt the deterministic election.
    pub fn increment_proposer_priority(&mut self, times: i32) {
        assert!(
            !self.validators.is_empty(),
            "cannot increment proposer priority of an empty validator set"
        );
        assert!(times > 0, "cannot call increment_proposer_priority with non-positive times");

        // Cap the priority spread, then center the distribution, so repeated
        // increments can never drift the accumulators toward the i64 bounds.
        let diff_max = PRIORITY_WINDOW_SIZE_FACTOR * self.total_voting_power;
        self.rescale_priorities(diff_max);
        self.shift_by_avg_proposer_priority();

        let mut proposer_index = 0;
        for _ in 0..times {
            proposer_index = self.increment_once();
        }
        self.proposer = Some(self.validators[proposer_index].address);
    }

    /// Clone the set and advance the clone's election; the receiver is left
    /// untouched. This is the read path for scheduling lookups.
    pub fn copy_increment_proposer_priority(&self, times: i32) -> Self {
        let mut copy = self.clone();
        copy.increment_proposer_priority(times);
        copy
    }

    /// One election step: accumulate, elect, debit the winner.
    fn increment_once(&mut self) -> usize {
        for val in &mut self.validators {
            val.proposer_priority = safe_add_clip(val.proposer_priority, val.voting_power);
        }
        let winner = self
            .most_priority_index()
            .expect("non-empty set has a winner");
        self.validators[winner].proposer_priority =
            safe_sub_clip(self.validators[winner].proposer_priority, self.total_voting_power);
        winner
    }

    /// Index of the validator with the highest priority, ties broken by the
    /// smallest address.
    fn most_priority_index(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, val) in self.validators.iter().enumerate() {
            best = match best {
                None => Some(i),
                Some(b) => {
                    let current = &self.validators[b];
                    if val.proposer_priority > current.proposer_priority
                        || (val.proposer_priority == current.proposer_priority
                            && val.address < current.address)
                    {
                        Some(i)
                    } else {
                        Some(b)
                    }
                }
            };
        }
        best
    }

    fn find_most_priority(&self) -> Option<&Validator> {
        self.most_priority_index().map(|i| &self.validators[i])
    }

    /// Compress the priority spread to at most `diff_max` by integer
    /// division with `ceil(diff / diff_max)`; rounding is toward zero per
    /// the reference behavior.
    ///
    /// # Panics
    ///
    /// Panics on an empty set.
    pub fn rescale_priorities(&mut self, diff_max: i64) {
        assert!(
            !self.validators.is_empty(),
            "cannot rescale priorities of an empty validator set"
        );
        if diff_max <= 0 {
            return;
        }
        let diff = self.max_min_priority_diff();
        if diff > diff_max {
            let ratio = (diff + diff_max - 1) / diff_max;
            for val in &mut self.validators {
                val.proposer_priority /= ratio;
            }
        }
    }

    /// `max(priority) - min(priority)`, computed in wide arithmetic and
    /// clamped so extreme priorities cannot wrap.
    fn max_min_priority_diff(&self) -> i64 {
        let mut max = i64::MIN;
        let mut min = i64::MAX;
        for val in &self.validators {
            max = max.max(val.proposer_priority);
            min = min.min(val.proposer_priority);
        }
        let diff = (max as i128) - (min as i128);
        diff.clamp(0, i64::MAX as i128) as i64
    }

    /// Floor average of the priorities, computed in `i128` so the sum can
    /// never overflow. Euclidean division keeps the average exact for
    /// negative sums, matching the reference rounding.
    fn compute_avg_proposer_priority(&self) -> i64 {
        let n = self.validators.len() as i128;
        let sum: i128 = self
            .validators
            .iter()
            .map(|v| v.proposer_priority as i128)
            .sum();
        let avg = sum.div_euclid(n);
        // The average of i64 values always fits an i64.
        avg as i64
    }

    /// Center the priorities around zero by subtracting the average, so
    /// `|sum(priority)| < len`.
    ///
    /// # Panics
    ///
    /// Panics on an empty set.
    pub fn shift_by_avg_proposer_priority(&mut self) {
        assert!(
            !self.validators.is_empty(),
            "cannot shift priorities of an empty validator set"
        );
        let avg = self.compute_avg_proposer_priority();
        for val in &mut self.validators {
            val.proposer_priority = safe_sub_clip(val.proposer_priority, avg);
        }
    }

    /// Apply a batch of validator changes.
    ///
    /// A change with `voting_power == 0` removes the validator; any other
    /// change updates an existing validator or adds a new one. The update is
    /// atomic (the receiver is unchanged on error) and the result does not
    /// depend on the order of the changes.
    pub fn update_with_change_set(
        &mut self,
        changes: &[Validator],
    ) -> Result<(), ValidatorSetError> {
        self.update_with_change_set_internal(changes, true)
    }

    fn update_with_change_set_internal(
        &mut self,
        changes: &[Validator],
        allow_deletes: bool,
    ) -> Result<(), ValidatorSetError> {
        if changes.is_empty() {
            return Ok(());
        }

        let (mut updates, deletes) = process_changes(changes)?;
        if !allow_deletes && !deletes.is_empty() {
            return Err(ValidatorSetError::UnexpectedRemoval);
        }

        // The resulting set must keep at least one validator.
        let num_new = updates
            .iter()
            .filter(|u| !self.has_address(&u.address))
            .count();
        if num_new == 0 && deletes.len() == self.validators.len() {
            return Err(ValidatorSetError::WouldBeEmpty);
        }

        // All verification happens before any mutation, which is what makes
        // a failed update atomic.
        let removed_power = self.verify_removals(&deletes)?;
        let tvp_after_updates_before_removals = self.verify_updates(&updates, removed_power)?;

        compute_new_priorities(&mut updates, self, tvp_after_updates_before_removals);

        self.apply_updates(updates);
        self.apply_removals(&deletes);
        self.update_total_voting_power();

        self.rescale_priorities(PRIORITY_WINDOW_SIZE_FACTOR * self.total_voting_power);
        self.shift_by_avg_proposer_priority();
        self.validators.sort_by(canonical_order);

        // Drop the proposer pointer if the update removed that validator;
        // the next lookup re-elects from priorities.
        if let Some(addr) = self.proposer {
            if !self.has_address(&addr) {
                self.proposer = None;
            }
        }

        debug!(
            validators = self.validators.len(),
            total_voting_power = self.total_voting_power,
            "validator set updated"
        );
        Ok(())
    }

    /// Check every removal names a known validator; returns the voting
    /// power that will be removed.
    fn verify_removals(&self, deletes: &[Validator]) -> Result<i64, ValidatorSetError> {
        let mut removed_power = 0i64;
        for del in deletes {
            let Some((_, val)) = self.get_by_address(&del.address) else {
                return Err(ValidatorSetError::ValidatorNotFound(del.address));
            };
            removed_power += val.voting_power;
        }
        Ok(removed_power)
    }

    /// Check that applying the updates cannot push the total voting power
    /// over the cap, independent of input order.
    ///
    /// Deltas are accumulated smallest-first so that the check fires exactly
    /// when the mathematical total (after removals) would cross the cap;
    /// returns the total after updates and before removals.
    fn verify_updates(
        &self,
        updates: &[Validator],
        removed_power: i64,
    ) -> Result<i64, ValidatorSetError> {
        let delta = |u: &Validator| -> i64 {
            match self.get_by_address(&u.address) {
                Some((_, val)) => u.voting_power - val.voting_power,
                None => u.voting_power,
            }
        };
        let mut sorted: Vec<&Validator> = updates.iter().collect();
        sorted.sort_by_key(|u| delta(u));

        let mut tvp_after_removals = self.total_voting_power - removed_power;
        for update in sorted {
            tvp_after_removals += delta(update);
            if tvp_after_removals > MAX_TOTAL_VOTING_POWER {
                return Err(ValidatorSetError::TotalVotingPowerOverflow(
                    MAX_TOTAL_VOTING_POWER,
                ));
            }
        }
        Ok(tvp_after_removals + removed_power)
    }

    /// Merge address-sorted updates into the set, replacing on equal
    /// addresses.
    fn apply_updates(&mut self, updates: Vec<Validator>) {
        let mut existing = std::mem::take(&mut self.validators);
        existing.sort_by(|a, b| a.address.cmp(&b.address));

        let mut merged = Vec::with_capacity(existing.len() + updates.len());
        let mut existing_iter = existing.into_iter().peekable();
        for update in updates {
            while let Some(val) = existing_iter.peek() {
                if val.address < update.address {
                    merged.push(existing_iter.next().expect("peeked"));
                } else {
                    break;
                }
            }
            if let Some(val) = existing_iter.peek() {
                if val.address == update.address {
                    existing_iter.next();
                }
            }
            merged.push(update);
        }
        merged.extend(existing_iter);
        self.validators = merged;
    }

    /// Remove the deleted validators.
    fn apply_removals(&mut self, deletes: &[Validator]) {
        self.validators
            .retain(|v| !deletes.iter().any(|d| d.address == v.address));
    }

    /// Recompute the cached total.
    ///
    /// # Panics
    ///
    /// Panics if the sum exceeds [`MAX_TOTAL_VOTING_POWER`]; every update
    /// path verifies the bound first, so a trip here is an internal
    /// invariant violation.
    fn update_total_voting_power(&mut self) {
        let mut total = 0i64;
        for val in &self.validators {
            total = safe_add(total, val.voting_power)
                .filter(|t| *t <= MAX_TOTAL_VOTING_POWER)
                .unwrap_or_else(|| {
                    panic!(
                        "total voting power exceeded the maximum {}",
                        MAX_TOTAL_VOTING_POWER
                    )
                });
        }
        self.total_voting_power = total;
    }

    /// Structural validity of the whole set.
    pub fn validate_basic(&self) -> Result<(), ValidatorSetError> {
        if self.validators.is_empty() {
            return Err(ValidatorSetError::Empty);
        }
        for val in &self.validators {
            val.validate_basic()?;
        }
        match &self.proposer {
            None => Err(ValidatorSetError::ProposerNotInSet),
            Some(addr) if !self.has_address(addr) => Err(ValidatorSetError::ProposerNotInSet),
            Some(_) => Ok(()),
        }
    }
}

impl std::fmt::Display for ValidatorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ValidatorSet({} validators, tvp={})",
            self.validators.len(),
            self.total_voting_power
        )
    }
}

/// Canonical validator ordering: descending voting power, ties broken by
/// ascending address.
fn canonical_order(a: &Validator, b: &Validator) -> std::cmp::Ordering {
    b.voting_power
        .cmp(&a.voting_power)
        .then_with(|| a.address.cmp(&b.address))
}

/// Sort a change set by address, reject duplicates and bad powers, and
/// split it into updates and removals.
fn process_changes(
    changes: &[Validator],
) -> Result<(Vec<Validator>, Vec<Validator>), ValidatorSetError> {
    let mut sorted: Vec<Validator> = changes.to_vec();
    sorted.sort_by(|a, b| a.address.cmp(&b.address));

    let mut updates = Vec::new();
    let mut deletes = Vec::new();
    let mut prev_addr: Option<Address> = None;

    for change in sorted {
        if prev_addr == Some(change.address) {
            return Err(ValidatorSetError::DuplicateAddress(change.address));
        }
        if change.voting_power < 0 {
            return Err(ValidatorSetError::NegativeVotingPower {
                address: change.address,
                power: change.voting_power,
            });
        }
        // A single power above the cap is guaranteed to overflow the total.
        if change.voting_power > MAX_TOTAL_VOTING_POWER {
            return Err(ValidatorSetError::TotalVotingPowerOverflow(
                MAX_TOTAL_VOTING_POWER,
            ));
        }
        prev_addr = Some(change.address);
        if change.voting_power == 0 {
            deletes.push(change);
        } else {
            updates.push(change);
        }
    }
    Ok((updates, deletes))
}

/// Give updated validators their previous priority and place additions at
/// the low end of the window (`-1.125 * tvp'`), so re-bonding cannot reset
/// an earned debt.
fn compute_new_priorities(
    updates: &mut [Validator],
    vals: &ValidatorSet,
    tvp_after_updates_before_removals: i64,
) {
    for update in updates.iter_mut() {
        match vals.get_by_address(&update.address) {
            Some((_, existing)) => update.proposer_priority = existing.proposer_priority,
            None => {
                update.proposer_priority =
                    -(tvp_after_updates_before_removals + (tvp_after_updates_before_removals >> 3))
            }
        }
    }
}
