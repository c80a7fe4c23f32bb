//! The private-validator capability.
//!
//! [`PrivValidator`] is the only component allowed to produce consensus
//! signatures. [`LocalSigner`] wraps an in-process key and keeps a
//! last-sign-state so that at most one signature exists per
//! `(height, round, step)`; signing the identical payload twice returns
//! the recorded signature instead of a fresh one.
//!
//! The double-sign check is a policy the strategy may elide:
//! [`SigningPolicy::Permissive`] signs anything and exists solely to play
//! the byzantine role in fault-injection tests.

use tessera_crypto::{sha256, Hash, PrivateKey, PublicKey};
use tessera_types::{Height, Proposal, Round, Vote, VoteType};
use tracing::warn;

/// Errors from signing requests
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrivValidatorError {
    /// No signing key is configured (the node runs as a full node)
    #[error("no signing key is set")]
    PubKeyIsNotSet,

    /// The request regresses behind the last signed position
    #[error(
        "sign request for h={height} r={round} step={step:?} regresses behind \
         h={last_height} r={last_round} step={last_step:?}"
    )]
    Regression {
        /// Requested height
        height: Height,
        /// Requested round
        round: Round,
        /// Requested step
        step: SignStep,
        /// Last signed height
        last_height: Height,
        /// Last signed round
        last_round: Round,
        /// Last signed step
        last_step: SignStep,
    },

    /// A different payload was already signed at this position
    #[error("conflicting sign request at h={height} r={round} step={step:?}")]
    DoubleSign {
        /// Requested height
        height: Height,
        /// Requested round
        round: Round,
        /// Requested step
        step: SignStep,
    },
}

/// The signing position within a round, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SignStep {
    /// Proposal signature
    Propose = 1,
    /// Prevote signature
    Prevote = 2,
    /// Precommit signature
    Precommit = 3,
}

impl From<VoteType> for SignStep {
    fn from(vote_type: VoteType) -> Self {
        match vote_type {
            VoteType::Prevote => SignStep::Prevote,
            VoteType::Precommit => SignStep::Precommit,
        }
    }
}

/// Capability to sign consensus messages.
pub trait PrivValidator: Send + Sync {
    /// The signer's public key.
    fn pub_key(&self) -> Result<PublicKey, PrivValidatorError>;

    /// Sign a vote in place (sets `vote.signature`, and for precommits the
    /// extension signature when an extension is present).
    fn sign_vote(&mut self, chain_id: &str, vote: &mut Vote) -> Result<(), PrivValidatorError>;

    /// Sign a proposal in place.
    fn sign_proposal(
        &mut self,
        chain_id: &str,
        proposal: &mut Proposal,
    ) -> Result<(), PrivValidatorError>;

    /// Re-seed the last-sign-state from a signature recovered during WAL
    /// replay, so the signer cannot conflict with its pre-crash self.
    ///
    /// Signers without state may leave this as the default no-op.
    fn restore_sign_state(
        &mut self,
        height: Height,
        round: Round,
        step: SignStep,
        sign_bytes: &[u8],
        signature: &tessera_crypto::Signature,
    ) {
        let _ = (height, round, step, sign_bytes, signature);
    }
}

/// Whether the signer enforces its anti-equivocation checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigningPolicy {
    /// Refuse conflicting signatures (every production signer)
    #[default]
    Enforcing,
    /// Sign anything (byzantine test role)
    Permissive,
}

/// What was last signed, the anti-equivocation ground truth.
#[derive(Debug, Clone, Default)]
struct LastSignState {
    height: Height,
    round: Round,
    step: Option<SignStep>,
    sign_bytes_hash: Hash,
    signature: Option<tessera_crypto::Signature>,
}

/// An in-process signer with a last-sign-state.
pub struct LocalSigner {
    key: PrivateKey,
    policy: SigningPolicy,
    last: LastSignState,
}

impl LocalSigner {
    /// Create an enforcing signer around `key`.
    pub fn new(key: PrivateKey) -> Self {
        Self {
            key,
            policy: SigningPolicy::Enforcing,
            last: LastSignState::default(),
        }
    }

    /// Create a signer with an explicit policy.
    ///
    /// Only tests exercising byzantine behavior should pass
    /// [`SigningPolicy::Permissive`].
    pub fn with_policy(key: PrivateKey, policy: SigningPolicy) -> Self {
        if policy == SigningPolicy::Permissive {
            warn!("permissive signer created: double-sign protection disabled");
        }
        Self {
            key,
            policy,
            last: LastSignState::default(),
        }
    }

    /// Check the request position against the last-sign-state.
    ///
    /// Returns the recorded signature when the identical payload is being
    /// re-signed; errors on regressions and conflicts.
    fn check_position(
        &self,
        height: Height,
        round: Round,
        step: SignStep,
        sign_bytes: &[u8],
    ) -> Result<Option<tessera_crypto::Signature>, PrivValidatorError> {
        if self.policy == SigningPolicy::Permissive {
            return Ok(None);
        }
        let Some(last_step) = self.last.step else {
            return Ok(None);
        };

        let last_pos = (self.last.height, self.last.round, last_step);
        let req_pos = (height, round, step);
        if req_pos < last_pos {
            return Err(PrivValidatorError::Regression {
                height,
                round,
                step,
                last_height: self.last.height,
                last_round: self.last.round,
                last_step,
            });
        }
        if req_pos == last_pos {
            if self.last.sign_bytes_hash == sha256(sign_bytes) {
                // Same payload: idempotent re-sign.
                return Ok(self.last.signature.clone());
            }
            return Err(PrivValidatorError::DoubleSign {
                height,
                round,
                step,
            });
        }
        Ok(None)
    }

    fn record(
        &mut self,
        height: Height,
        round: Round,
        step: SignStep,
        sign_bytes: &[u8],
        signature: &tessera_crypto::Signature,
    ) {
        self.last = LastSignState {
            height,
            round,
            step: Some(step),
            sign_bytes_hash: sha256(sign_bytes),
            signature: Some(signature.clone()),
        };
    }
}

impl PrivValidator for LocalSigner {
    fn pub_key(&self) -> Result<PublicKey, PrivValidatorError> {
        Ok(self.key.public_key())
    }

    fn restore_sign_state(
        &mut self,
        height: Height,
        round: Round,
        step: SignStep,
        sign_bytes: &[u8],
        signature: &tessera_crypto::Signature,
    ) {
        // Only move forward: replay feeds signatures in WAL order.
        let restored = (height, round, step);
        let current = (
            self.last.height,
            self.last.round,
            self.last.step.unwrap_or(SignStep::Propose),
        );
        if self.last.step.is_none() || restored >= current {
            self.record(height, round, step, sign_bytes, signature);
        }
    }

    fn sign_vote(&mut self, chain_id: &str, vote: &mut Vote) -> Result<(), PrivValidatorError> {
        let step = SignStep::from(vote.vote_type);
        let sign_bytes = vote.sign_bytes(chain_id);

        if let Some(saved) = self.check_position(vote.height, vote.round, step, &sign_bytes)? {
            vote.signature = saved;
            return Ok(());
        }

        let signature = self.key.sign(&sign_bytes);
        self.record(vote.height, vote.round, step, &sign_bytes, &signature);
        vote.signature = signature;

        if vote.vote_type == VoteType::Precommit && !vote.extension.is_empty() {
            vote.extension_signature = self.key.sign(&vote.extension_sign_bytes(chain_id));
        }
        Ok(())
    }

    fn sign_proposal(
        &mut self,
        chain_id: &str,
        proposal: &mut Proposal,
    ) -> Result<(), PrivValidatorError> {
        let sign_bytes = proposal.sign_bytes(chain_id);

        if let Some(saved) =
            self.check_position(proposal.height, proposal.round, SignStep::Propose, &sign_bytes)?
        {
            proposal.signature = saved;
            return Ok(());
        }

        let signature = self.key.sign(&sign_bytes);
        self.record(
            proposal.height,
            proposal.round,
            SignStep::Propose,
            &sign_bytes,
            &signature,
        );
        proposal.signature = signature;
        Ok(())
    }
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigner")
            .field("policy", &self.policy)
            .field("last_height", &self.last.height)
            .field("last_round", &self.last.round)
            .field("last_step", &self.last.step)
            .finish_non_exhaustive()
    }
}
