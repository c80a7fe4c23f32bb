//! The evidence pool.
//!
//! Collects verified [`Evidence`] until it is committed in a block,
//! deduplicates by canonical hash, enforces the per-block byte budget when
//! handing evidence to a proposer, and expires entries that fall outside
//! the age window at every height commit.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use tessera_crypto::Hash;
use tessera_types::{
    DuplicateVoteEvidence, Evidence, EvidenceError, EvidenceParams, Height, TimestampMs,
};

use crate::store::StateStore;

/// Errors from pool operations
#[derive(Debug, thiserror::Error)]
pub enum EvidencePoolError {
    /// The evidence failed verification
    #[error(transparent)]
    Invalid(#[from] EvidenceError),

    /// The evidence was already in the pool or already committed
    #[error("duplicate evidence {0}")]
    Duplicate(String),

    /// No validator set is stored for the evidence height
    #[error("no validator set for evidence height {0}")]
    UnknownHeight(Height),
}

/// Pending evidence, ordered by offense height.
pub struct EvidencePool {
    chain_id: String,
    state_store: Arc<dyn StateStore>,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    params: EvidenceParams,
    pending: Vec<Evidence>,
    seen: HashSet<Hash>,
    committed: HashSet<Hash>,
    height: Height,
    time: TimestampMs,
}

impl EvidencePool {
    /// Create a pool that verifies incoming evidence against the validator
    /// sets in `state_store`.
    pub fn new(
        chain_id: &str,
        state_store: Arc<dyn StateStore>,
        params: EvidenceParams,
        height: Height,
        time: TimestampMs,
    ) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            state_store,
            inner: Mutex::new(PoolInner {
                params,
                pending: Vec::new(),
                seen: HashSet::new(),
                committed: HashSet::new(),
                height,
                time,
            }),
        }
    }

    /// Verify and admit a piece of evidence.
    ///
    /// Verification runs against the validator set as of the offense
    /// height; age is checked against the pool's current height and time.
    pub fn add_evidence(&self, evidence: Evidence) -> Result<(), EvidencePoolError> {
        let hash = evidence.hash();
        let mut inner = self.inner.lock();

        if inner.seen.contains(&hash) || inner.committed.contains(&hash) {
            return Err(EvidencePoolError::Duplicate(hex::encode(&hash[..8])));
        }

        let Evidence::DuplicateVote(ref dve) = evidence;
        let vals = self
            .state_store
            .load_validators(dve.height())
            .ok_or(EvidencePoolError::UnknownHeight(dve.height()))?;
        dve.verify(&self.chain_id, &vals)?;
        dve.check_age(inner.height, inner.time, &inner.params)?;

        info!(
            evidence = %dve,
            hash = %hex::encode(&hash[..8]),
            "evidence admitted to pool"
        );
        inner.seen.insert(hash);
        inner.pending.push(evidence);
        inner.pending.sort_by_key(|e| e.height());
        Ok(())
    }

    /// Build evidence from two conflicting votes observed by the vote
    /// machinery and admit it.
    pub fn report_conflicting_votes(
        &self,
        vote_a: tessera_types::Vote,
        vote_b: tessera_types::Vote,
        block_time: TimestampMs,
    ) -> Result<(), EvidencePoolError> {
        let height = vote_a.height;
        let vals = self
            .state_store
            .load_validators(height)
            .ok_or(EvidencePoolError::UnknownHeight(height))?;
        let Some((_, validator)) = vals.get_by_address(&vote_a.validator_address) else {
            return Err(EvidencePoolError::Invalid(
                EvidenceError::ValidatorNotFound(vote_a.validator_address),
            ));
        };
        let evidence = DuplicateVoteEvidence::new(
            vote_a,
            vote_b,
            block_time,
            validator.voting_power,
            vals.total_voting_power(),
        )?;
        self.add_evidence(Evidence::DuplicateVote(evidence))
    }

    /// Evidence for a proposer to include, oldest first, within
    /// `max_bytes`.
    pub fn pending_evidence(&self, max_bytes: i64) -> Vec<Evidence> {
        let inner = self.inner.lock();
        let mut total = 0i64;
        let mut out = Vec::new();
        for evidence in &inner.pending {
            let size = evidence.byte_size() as i64;
            if total + size > max_bytes {
                break;
            }
            total += size;
            out.push(evidence.clone());
        }
        out
    }

    /// Number of pending entries.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Advance the pool to a freshly committed height: mark the committed
    /// evidence, adopt new params if they changed, and expire entries that
    /// fell out of the age window.
    pub fn update(
        &self,
        height: Height,
        time: TimestampMs,
        committed: &[Evidence],
        params: &EvidenceParams,
    ) {
        let mut inner = self.inner.lock();
        inner.height = height;
        inner.time = time;
        inner.params = params.clone();

        for evidence in committed {
            let hash = evidence.hash();
            inner.committed.insert(hash);
            inner.seen.remove(&hash);
        }
        let committed_hashes: HashSet<Hash> = committed.iter().map(|e| e.hash()).collect();
        inner
            .pending
            .retain(|e| !committed_hashes.contains(&e.hash()));

        // Expire what no longer fits the window.
        let params = inner.params.clone();
        let mut expired = 0usize;
        inner.pending.retain(|evidence| {
            let Evidence::DuplicateVote(dve) = evidence;
            let keep = dve.check_age(height, time, &params).is_ok();
            if !keep {
                expired += 1;
            }
            keep
        });
        if expired > 0 {
            warn!(height, expired, "expired aged-out evidence");
        }
        debug!(
            height,
            pending = inner.pending.len(),
            committed = committed.len(),
            "evidence pool updated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStateStore, StateStore};
    use tessera_crypto::PrivateKey;
    use tessera_types::{BlockId, PartSetHeader, Validator, ValidatorSet, Vote, VoteType};

    const CHAIN_ID: &str = "evidence-pool-test";

    struct Fixture {
        pool: EvidencePool,
        keys: Vec<PrivateKey>,
        vals: ValidatorSet,
    }

    fn fixture() -> Fixture {
        let keys: Vec<PrivateKey> = (0..4)
            .map(|i| PrivateKey::from_seed_ed25519([i as u8 + 1; 32]))
            .collect();
        let vals = ValidatorSet::new(
            keys.iter()
                .map(|k| Validator::new(k.public_key(), 10))
                .collect(),
        )
        .unwrap();
        let store = Arc::new(MemoryStateStore::new());
        for h in 1..=10 {
            store.save_validators(h, &vals);
        }
        let pool = EvidencePool::new(
            CHAIN_ID,
            store,
            EvidenceParams {
                max_age_num_blocks: 5,
                max_age_duration_ms: 10_000,
                max_bytes: 1 << 20,
            },
            3,
            5_000,
        );
        Fixture { pool, keys, vals }
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

    fn conflicting_votes(fx: &Fixture, key_index: usize, height: Height) -> (Vote, Vote) {
        let key = &fx.keys[key_index];
        let address = key.public_key().address();
        let index = fx
            .vals
            .get_by_address(&address)
            .map(|(i, _)| i as i32)
            .unwrap();
        let mut vote_a = Vote::new(VoteType::Prevote, height, 0, block_id(1), address, index);
        vote_a.timestamp = 4_000;
        vote_a.signature = key.sign(&vote_a.sign_bytes(CHAIN_ID));
        let mut vote_b = Vote::new(VoteType::Prevote, height, 0, block_id(2), address, index);
        vote_b.timestamp = 4_001;
        vote_b.signature = key.sign(&vote_b.sign_bytes(CHAIN_ID));
        (vote_a, vote_b)
    }

    #[test]
    fn test_report_and_pending() {
        let fx = fixture();
        let (a, b) = conflicting_votes(&fx, 0, 2);
        fx.pool.report_conflicting_votes(a, b, 4_000).unwrap();
        assert_eq!(fx.pool.pending_count(), 1);

        let pending = fx.pool.pending_evidence(i64::MAX);
        assert_eq!(pending.len(), 1);
        let Evidence::DuplicateVote(dve) = &pending[0];
        assert_eq!(dve.height(), 2);
    }

    #[test]
    fn test_duplicate_rejected() {
        let fx = fixture();
        let (a, b) = conflicting_votes(&fx, 0, 2);
        fx.pool
            .report_conflicting_votes(a.clone(), b.clone(), 4_000)
            .unwrap();
        // Same offense reported in the opposite order hashes identically.
        let err = fx.pool.report_conflicting_votes(b, a, 4_000).unwrap_err();
        assert!(matches!(err, EvidencePoolError::Duplicate(_)));
        assert_eq!(fx.pool.pending_count(), 1);
    }

    #[test]
    fn test_byte_budget_respected() {
        let fx = fixture();
        for i in 0..3 {
            let (a, b) = conflicting_votes(&fx, i, 2);
            fx.pool.report_conflicting_votes(a, b, 4_000).unwrap();
        }
        let all = fx.pool.pending_evidence(i64::MAX);
        assert_eq!(all.len(), 3);
        let one_size = all[0].byte_size() as i64;

        let limited = fx.pool.pending_evidence(one_size * 2);
        assert_eq!(limited.len(), 2);
        let none = fx.pool.pending_evidence(one_size - 1);
        assert!(none.is_empty());
    }

    #[test]
    fn test_update_removes_committed_and_expired() {
        let fx = fixture();
        let (a, b) = conflicting_votes(&fx, 0, 2);
        fx.pool.report_conflicting_votes(a, b, 4_000).unwrap();
        let (c, d) = conflicting_votes(&fx, 1, 4);
        fx.pool.report_conflicting_votes(c, d, 4_500).unwrap();
        assert_eq!(fx.pool.pending_count(), 2);

        // Commit the first; the second stays.
        let committed = fx.pool.pending_evidence(i64::MAX)[0].clone();
        let params = EvidenceParams {
            max_age_num_blocks: 5,
            max_age_duration_ms: 10_000,
            max_bytes: 1 << 20,
        };
        fx.pool.update(5, 6_000, std::slice::from_ref(&committed), &params);
        assert_eq!(fx.pool.pending_count(), 1);

        // Advancing far expires the rest.
        fx.pool.update(10, 20_000, &[], &params);
        assert_eq!(fx.pool.pending_count(), 0);

        // Committed evidence cannot be re-admitted.
        assert!(matches!(
            fx.pool.add_evidence(committed),
            Err(EvidencePoolError::Duplicate(_))
        ));
    }

    #[test]
    fn test_expired_evidence_rejected_on_entry() {
        let fx = fixture();
        let params = EvidenceParams {
            max_age_num_blocks: 5,
            max_age_duration_ms: 10_000,
            max_bytes: 1 << 20,
        };
        // Height 4 keeps the offense inside the block bound, but the pool's
        // clock has moved past the wall-clock bound.
        fx.pool.update(4, 20_000, &[], &params);

        let (a, b) = conflicting_votes(&fx, 0, 2);
        let err = fx.pool.report_conflicting_votes(a, b, 0).unwrap_err();
        assert!(matches!(
            err,
            EvidencePoolError::Invalid(EvidenceError::ExpiredByTime { .. })
        ));

        // And past the block bound it fails on height.
        fx.pool.update(9, 20_000, &[], &params);
        let (a, b) = conflicting_votes(&fx, 1, 2);
        let err = fx.pool.report_conflicting_votes(a, b, 19_000).unwrap_err();
        assert!(matches!(
            err,
            EvidencePoolError::Invalid(EvidenceError::ExpiredByHeight { .. })
        ));
    }

    #[test]
    fn test_unknown_height_rejected() {
        let fx = fixture();
        let (a, b) = conflicting_votes(&fx, 0, 2);
        let mut a = a;
        let mut b = b;
        a.height = 99;
        b.height = 99;
        assert!(matches!(
            fx.pool.report_conflicting_votes(a, b, 4_000).unwrap_err(),
            EvidencePoolError::UnknownHeight(99)
        ));
    }
}
