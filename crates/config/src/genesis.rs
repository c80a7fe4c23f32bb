//! Genesis document handling.
//!
//! The genesis document pins everything the first height needs: the chain
//! id, the starting height, the consensus parameters, the initial validator
//! set, and the opaque application state handed to `init_chain`.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tessera_crypto::PublicKey;
use tessera_types::{ConsensusParams, Validator, ValidatorSet};

use crate::error::{ConfigError, ConfigResult};

/// One validator entry in the genesis document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisValidator {
    /// Human-readable name (informational only)
    pub name: String,
    /// Consensus public key
    pub pub_key: PublicKey,
    /// Initial voting power
    pub power: i64,
}

/// The genesis document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisDoc {
    /// Chain start time (Unix millis)
    pub genesis_time: u64,
    /// Chain identifier; part of every signature scope
    pub chain_id: String,
    /// First block height (usually 1)
    pub initial_height: i64,
    /// Consensus parameters in force at the initial height
    pub consensus_params: ConsensusParams,
    /// The initial validator set
    pub validators: Vec<GenesisValidator>,
    /// Opaque application state handed to `init_chain`
    #[serde(default)]
    pub app_state: serde_json::Value,
}

impl GenesisDoc {
    /// Load a genesis document from a JSON file.
    pub fn load_json(path: &Path) -> ConfigResult<Self> {
        info!("loading genesis from {:?}", path);
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileAccess {
            path: path.to_path_buf(),
            source: e,
        })?;
        let doc: GenesisDoc = serde_json::from_str(&content)?;
        doc.validate_basic()?;
        Ok(doc)
    }

    /// Save the genesis document to a JSON file.
    pub fn save_json(&self, path: &Path) -> ConfigResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::FileAccess {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Validate the document.
    pub fn validate_basic(&self) -> ConfigResult<()> {
        debug!(chain_id = %self.chain_id, "validating genesis document");

        if self.chain_id.is_empty() || self.chain_id.len() > 50 {
            return Err(ConfigError::InvalidChainId(self.chain_id.clone()));
        }
        if self.initial_height < 1 {
            return Err(ConfigError::InvalidInitialHeight(self.initial_height));
        }
        self.consensus_params
            .validate_basic()
            .map_err(ConfigError::InvalidConsensusParams)?;
        if self.validators.is_empty() {
            return Err(ConfigError::NoValidators);
        }

        let mut seen = HashSet::new();
        for validator in &self.validators {
            if validator.power <= 0 {
                return Err(ConfigError::InvalidValidator {
                    name: validator.name.clone(),
                    reason: format!("non-positive power {}", validator.power),
                });
            }
            let key_type = validator.pub_key.key_type().to_string();
            if !self
                .consensus_params
                .validator
                .pub_key_types
                .contains(&key_type)
            {
                return Err(ConfigError::InvalidValidator {
                    name: validator.name.clone(),
                    reason: format!("key type {key_type} not allowed by consensus params"),
                });
            }
            if !seen.insert(validator.pub_key.address()) {
                return Err(ConfigError::DuplicateValidator(validator.name.clone()));
            }
        }
        Ok(())
    }

    /// Materialize the initial [`ValidatorSet`].
    pub fn validator_set(&self) -> ConfigResult<ValidatorSet> {
        let validators: Vec<Validator> = self
            .validators
            .iter()
            .map(|v| Validator::new(v.pub_key.clone(), v.power))
            .collect();
        ValidatorSet::new(validators).map_err(|e| ConfigError::InvalidValidator {
            name: "genesis".into(),
            reason: e.to_string(),
        })
    }
}
