//! Consensus parameters.
//!
//! These parameters are agreed on-chain and may change at every height via
//! the application's consensus-param updates. Their hash is committed into
//! every block header.

use serde::{Deserialize, Serialize};

use tessera_crypto::{sha256, Hash};

/// Limits on block size and gas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockParams {
    /// Maximum serialized block size in bytes
    pub max_bytes: i64,
    /// Maximum total gas per block (-1 = unlimited)
    pub max_gas: i64,
}

impl Default for BlockParams {
    fn default() -> Self {
        Self {
            max_bytes: 4 * 1024 * 1024,
            max_gas: -1,
        }
    }
}

/// Bounds on acceptable evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceParams {
    /// Maximum evidence age in blocks
    pub max_age_num_blocks: i64,
    /// Maximum evidence age in wall-clock milliseconds
    pub max_age_duration_ms: u64,
    /// Maximum total evidence bytes per block
    pub max_bytes: i64,
}

impl Default for EvidenceParams {
    fn default() -> Self {
        Self {
            max_age_num_blocks: 100_000,
            // 48 hours
            max_age_duration_ms: 48 * 60 * 60 * 1000,
            max_bytes: 1024 * 1024,
        }
    }
}

/// Which key schemes validators may use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorParams {
    /// Allowed key type names ("ed25519", "secp256k1")
    pub pub_key_types: Vec<String>,
}

impl Default for ValidatorParams {
    fn default() -> Self {
        Self {
            pub_key_types: vec!["ed25519".into()],
        }
    }
}

/// The full consensus parameter set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConsensusParams {
    /// Block limits
    pub block: BlockParams,
    /// Evidence bounds
    pub evidence: EvidenceParams,
    /// Validator key policy
    pub validator: ValidatorParams,
}

impl ConsensusParams {
    /// Hash of the parameters, committed into the block header.
    pub fn hash(&self) -> Hash {
        let bytes = serde_json::to_vec(self).expect("params serialization cannot fail");
        sha256(&bytes)
    }

    /// Validate internal consistency.
    pub fn validate_basic(&self) -> Result<(), String> {
        if self.block.max_bytes <= 0 {
            return Err(format!(
                "block.max_bytes must be positive, got {}",
                self.block.max_bytes
            ));
        }
        if self.block.max_gas < -1 {
            return Err(format!(
                "block.max_gas must be -1 or non-negative, got {}",
                self.block.max_gas
            ));
        }
        if self.evidence.max_age_num_blocks <= 0 {
            return Err(format!(
                "evidence.max_age_num_blocks must be positive, got {}",
                self.evidence.max_age_num_blocks
            ));
        }
        if self.evidence.max_bytes < 0 {
            return Err(format!(
                "evidence.max_bytes cannot be negative, got {}",
                self.evidence.max_bytes
            ));
        }
        if self.evidence.max_bytes > self.block.max_bytes {
            return Err(format!(
                "evidence.max_bytes ({}) cannot exceed block.max_bytes ({})",
                self.evidence.max_bytes, self.block.max_bytes
            ));
        }
        if self.validator.pub_key_types.is_empty() {
            return Err("validator.pub_key_types cannot be empty".into());
        }
        for key_type in &self.validator.pub_key_types {
            if key_type != "ed25519" && key_type != "secp256k1" {
                return Err(format!("unknown pub key type: {key_type}"));
            }
        }
        Ok(())
    }
}
