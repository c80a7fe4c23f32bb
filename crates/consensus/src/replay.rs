//! Startup handshake and block replay.
//!
//! On boot three heights are in play: the state store's last committed
//! height, the block store's head, and the height the application reports
//! through `info`. The [`Handshaker`] reconciles them:
//!
//! | block store vs state | state - app | action |
//! |----------------------|-------------|--------|
//! | equal                | 0           | up to date, nothing to do |
//! | equal                | 1           | re-run finalize of the last block against the app |
//! | store ahead          | >= 0        | apply the missing blocks through the executor |
//! | anything else        | *           | fatal mismatch |
//!
//! An app-hash mismatch at any step is non-recoverable: it means the
//! application is non-deterministic or storage was tampered with, and the
//! process must stop rather than sign anything. No partial commit is ever
//! made.

use std::sync::Arc;

use tracing::{error, info};

use tessera_config::GenesisDoc;
use tessera_types::{Height, Validator, ValidatorSet};

use crate::app::{Application, FinalizeBlockRequest, InitChainRequest, ValidatorUpdate};
use crate::store::{BlockStore, ChainState, StateStore};
use crate::CancelToken;

/// Errors from the startup handshake
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The application replayed to a different app hash. Fatal: the
    /// operator must intervene.
    #[error(
        "app hash mismatch at height {height}: state has {expected}, application produced {got}"
    )]
    AppHashMismatch {
        /// Height of the divergence
        height: Height,
        /// Hash recorded by consensus
        expected: String,
        /// Hash the application produced
        got: String,
    },

    /// The three heights cannot be reconciled
    #[error(
        "irreconcilable stores: state height {state_height}, block store height \
         {store_height}, app height {app_height}"
    )]
    HeightMismatch {
        /// State store height
        state_height: Height,
        /// Block store height
        store_height: Height,
        /// Application height
        app_height: Height,
    },

    /// A block required for replay is missing from the block store
    #[error("block store has no block at height {0}")]
    MissingBlock(Height),

    /// The genesis document could not seed a validator set
    #[error("invalid genesis: {0}")]
    InvalidGenesis(String),

    /// The handshake was cancelled
    #[error("handshake cancelled")]
    Cancelled,
}

/// Reconciles the persisted state, the block store, and the application on
/// startup.
pub struct Handshaker<A: Application> {
    app: Arc<A>,
    state_store: Arc<dyn StateStore>,
    block_store: Arc<dyn BlockStore>,
    genesis: GenesisDoc,
}

impl<A: Application> Handshaker<A> {
    /// Create a handshaker over the three parties.
    pub fn new(
        app: Arc<A>,
        state_store: Arc<dyn StateStore>,
        block_store: Arc<dyn BlockStore>,
        genesis: GenesisDoc,
    ) -> Self {
        Self {
            app,
            state_store,
            block_store,
            genesis,
        }
    }

    /// Run the handshake, returning the chain state consensus should
    /// resume from.
    pub async fn handshake(&self, cancel: &CancelToken) -> Result<ChainState, HandshakeError> {
        let app_info = self.app.info().await;
        let app_height = app_info.last_block_height;

        // Load the persisted state or initialize the chain from genesis.
        let mut state = match self.state_store.load() {
            Some(state) => state,
            None => self.init_chain().await?,
        };

        let state_height = state.last_block_height;
        let store_height = self.block_store.height();
        info!(
            state_height,
            store_height, app_height, "handshaking application and stores"
        );

        if cancel.is_cancelled() {
            return Err(HandshakeError::Cancelled);
        }

        let mismatch = HandshakeError::HeightMismatch {
            state_height,
            store_height,
            app_height,
        };

        // The application can never be ahead of consensus, the block store
        // can never be behind the state store, and the application can lag
        // the state by at most one finalize.
        if app_height > state_height
            || store_height < state_height
            || state_height - app_height > 1
        {
            error!(
                state_height,
                store_height, app_height, "irreconcilable store heights"
            );
            return Err(mismatch);
        }

        if store_height == state_height {
            if state_height == app_height {
                info!(height = state_height, "stores and application are in sync");
                return Ok(state);
            }
            // The block and its results were persisted but the application
            // crashed before (or during) its own commit: re-run finalize.
            self.replay_finalize(&state, state_height).await?;
            info!(
                height = state_height,
                "replayed last finalize against the application"
            );
            return Ok(state);
        }

        // Block store is ahead: bring the application (and then the state)
        // up to the store head, one verified block at a time.
        if state_height == app_height + 1 {
            self.replay_finalize(&state, state_height).await?;
        }
        state = self
            .replay_blocks(state, state_height + 1, store_height, cancel)
            .await?;
        Ok(state)
    }

    /// First boot: hand genesis to the application and build the initial
    /// state from its response.
    async fn init_chain(&self) -> Result<ChainState, HandshakeError> {
        info!(chain_id = %self.genesis.chain_id, "initializing chain from genesis");
        let genesis_validators: Vec<ValidatorUpdate> = self
            .genesis
            .validators
            .iter()
            .map(|v| ValidatorUpdate {
                pub_key: v.pub_key.clone(),
                power: v.power,
            })
            .collect();

        let response = self
            .app
            .init_chain(InitChainRequest {
                chain_id: self.genesis.chain_id.clone(),
                initial_height: self.genesis.initial_height,
                consensus_params: self.genesis.consensus_params.clone(),
                validators: genesis_validators,
                app_state: self.genesis.app_state.clone(),
            })
            .await;

        // The application may override the genesis validators wholesale.
        let validators = if response.validators.is_empty() {
            self.genesis
                .validator_set()
                .map_err(|e| HandshakeError::InvalidGenesis(e.to_string()))?
        } else {
            let validators: Vec<Validator> = response
                .validators
                .iter()
                .map(|u| Validator::new(u.pub_key.clone(), u.power))
                .collect();
            ValidatorSet::new(validators)
                .map_err(|e| HandshakeError::InvalidGenesis(e.to_string()))?
        };

        let mut state = ChainState::from_genesis(&self.genesis, validators, response.app_hash);
        if let Some(params) = response.consensus_params {
            state.consensus_params = params;
        }
        self.state_store.save(&state);
        self.state_store
            .save_validators(state.next_height(), &state.validators);
        Ok(state)
    }

    /// Re-run finalize-block of `height` against the application and check
    /// the app hash against what consensus recorded.
    async fn replay_finalize(
        &self,
        state: &ChainState,
        height: Height,
    ) -> Result<(), HandshakeError> {
        let block = self
            .block_store
            .load_block(height)
            .ok_or(HandshakeError::MissingBlock(height))?;
        let response = self
            .app
            .finalize_block(FinalizeBlockRequest {
                block,
                height,
            })
            .await;
        self.app.commit().await;

        if response.app_hash != state.app_hash {
            error!(
                height,
                expected = %hex::encode(state.app_hash),
                got = %hex::encode(response.app_hash),
                "FATAL: application replayed to a different app hash"
            );
            return Err(HandshakeError::AppHashMismatch {
                height,
                expected: hex::encode(state.app_hash),
                got: hex::encode(response.app_hash),
            });
        }
        Ok(())
    }

    /// Apply stored blocks `from..=to` through the block executor,
    /// verifying the app hash of every step against the next block's
    /// header (which is where consensus recorded it).
    async fn replay_blocks(
        &self,
        mut state: ChainState,
        from: Height,
        to: Height,
        cancel: &CancelToken,
    ) -> Result<ChainState, HandshakeError> {
        info!(from, to, "replaying blocks against the application");
        for height in from..=to {
            if cancel.is_cancelled() {
                return Err(HandshakeError::Cancelled);
            }
            let block = self
                .block_store
                .load_block(height)
                .ok_or(HandshakeError::MissingBlock(height))?;
            let expected_app_hash_known = self
                .block_store
                .load_block(height + 1)
                .map(|next| next.header.app_hash);

            let response = self
                .app
                .finalize_block(FinalizeBlockRequest {
                    block: block.clone(),
                    height,
                })
                .await;
            self.app.commit().await;

            if let Some(expected) = expected_app_hash_known {
                if response.app_hash != expected {
                    error!(
                        height,
                        expected = %hex::encode(expected),
                        got = %hex::encode(response.app_hash),
                        "FATAL: application replayed to a different app hash"
                    );
                    return Err(HandshakeError::AppHashMismatch {
                        height,
                        expected: hex::encode(expected),
                        got: hex::encode(response.app_hash),
                    });
                }
            }

            // Advance the state snapshot exactly the way the live path does.
            let next_next_validators = state
                .apply_validator_updates(&response.validator_updates)
                .map_err(|e| HandshakeError::InvalidGenesis(e.to_string()))?;
            let commit = self
                .block_store
                .load_block_commit(height)
                .ok_or(HandshakeError::MissingBlock(height))?;
            state.last_block_height = height;
            state.last_block_id = commit.block_id;
            state.last_block_time = block.header.time;
            state.last_validators =
                std::mem::replace(&mut state.validators, state.next_validators.clone());
            state.next_validators = next_next_validators;
            state.last_results_hash = response.results_hash();
            state.app_hash = response.app_hash;
            if let Some(ref params) = response.consensus_param_updates {
                state.consensus_params = params.clone();
            }
            self.state_store.save(&state);
            self.state_store.save_finalize_response(height, &response);
        }
        info!(replayed = to - from + 1, head = to, "block replay complete");
        Ok(state)
    }
}
