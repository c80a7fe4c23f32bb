//! Store interfaces and the chain state snapshot.
//!
//! The block store and state store are external collaborators of the
//! engine; they are referenced through traits here so the state machine,
//! the handshaker and the tests can share in-memory implementations.
//! Both stores are single-writer (the state machine) and many-reader:
//! the in-memory implementations guard their maps with `RwLock` and
//! lookups return owned copies, never interior references.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use tessera_crypto::Hash;
use tessera_config::GenesisDoc;
use tessera_types::{
    Block, BlockId, Commit, ConsensusParams, ExtendedCommit, Height, PartSetHeader, TimestampMs,
    Tx, ValidatorSet,
};

use crate::app::ValidatorUpdate;

/// Consensus-relevant chain state after some committed height.
///
/// `validators` votes on height `last_block_height + 1`; `next_validators`
/// on the height after that; `last_validators` signed `last_block_height`'s
/// commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    /// Chain identifier
    pub chain_id: String,
    /// First block height of this chain
    pub initial_height: Height,
    /// Height of the last committed block (0 before any commit)
    pub last_block_height: Height,
    /// Id of the last committed block
    pub last_block_id: BlockId,
    /// Time of the last committed block
    pub last_block_time: TimestampMs,
    /// Validators for height `last_block_height + 1`
    pub validators: ValidatorSet,
    /// Validators for height `last_block_height + 2`
    pub next_validators: ValidatorSet,
    /// Validators that signed height `last_block_height`
    pub last_validators: ValidatorSet,
    /// Consensus parameters for the next height
    pub consensus_params: ConsensusParams,
    /// Digest of the last block's transaction results
    pub last_results_hash: Hash,
    /// App-state digest after the last block
    pub app_hash: Hash,
}

impl ChainState {
    /// Build the initial state from a genesis document and the app hash
    /// reported by `init_chain`.
    pub fn from_genesis(
        genesis: &GenesisDoc,
        validators: ValidatorSet,
        app_hash: Hash,
    ) -> Self {
        let next_validators = validators.copy_increment_proposer_priority(1);
        Self {
            chain_id: genesis.chain_id.clone(),
            initial_height: genesis.initial_height,
            last_block_height: 0,
            last_block_id: BlockId::zero(),
            last_block_time: genesis.genesis_time,
            validators,
            next_validators,
            last_validators: ValidatorSet::empty(),
            consensus_params: genesis.consensus_params.clone(),
            last_results_hash: tessera_crypto::sha256(b""),
            app_hash,
        }
    }

    /// Height the engine is currently deciding.
    pub fn next_height(&self) -> Height {
        if self.last_block_height == 0 {
            self.initial_height
        } else {
            self.last_block_height + 1
        }
    }

    /// Apply validator updates from a finalized block, producing the set
    /// for two heights ahead.
    pub fn apply_validator_updates(
        &self,
        updates: &[ValidatorUpdate],
    ) -> Result<ValidatorSet, tessera_types::ValidatorSetError> {
        let mut next = self.next_validators.clone();
        if !updates.is_empty() {
            // Zero-power entries are removals.
            let changes: Vec<tessera_types::Validator> = updates
                .iter()
                .map(|u| tessera_types::Validator::new(u.pub_key.clone(), u.power))
                .collect();
            next.update_with_change_set(&changes)?;
        }
        next.increment_proposer_priority(1);
        Ok(next)
    }
}

/// Persistent store for committed blocks and their commits.
///
/// The canonical commit for height `h` is carried by block `h+1` as its
/// `last_commit`; the locally observed commit (with extensions) is stored
/// as the seen commit under `h` so the engine can propose `h+1` before any
/// peer does.
pub trait BlockStore: Send + Sync {
    /// Lowest retained height (0 when empty).
    fn base(&self) -> Height;
    /// Highest stored height (0 when empty).
    fn height(&self) -> Height;
    /// Persist a block with its part-set commitment and seen commit.
    fn save_block(&self, block: Block, parts: PartSetHeader, seen_commit: ExtendedCommit);
    /// Load the block at `height`.
    fn load_block(&self, height: Height) -> Option<Block>;
    /// Load the part-set commitment of the block at `height`.
    fn load_part_set_header(&self, height: Height) -> Option<PartSetHeader>;
    /// Load the canonical commit for `height` (from block `height + 1` or
    /// the seen commit).
    fn load_block_commit(&self, height: Height) -> Option<Commit>;
    /// Load the locally observed extended commit for `height`.
    fn load_seen_commit(&self, height: Height) -> Option<ExtendedCommit>;
    /// Drop blocks below `height`; returns how many were pruned.
    fn prune_blocks(&self, height: Height) -> u64;
}

/// Persistent store for consensus state snapshots and per-height data.
pub trait StateStore: Send + Sync {
    /// Load the latest state snapshot.
    fn load(&self) -> Option<ChainState>;
    /// Persist the state snapshot.
    fn save(&self, state: &ChainState);
    /// Load the validator set that votes at `height`.
    fn load_validators(&self, height: Height) -> Option<ValidatorSet>;
    /// Persist the validator set voting at `height`.
    fn save_validators(&self, height: Height, validators: &ValidatorSet);
    /// Load the consensus params in force at `height`.
    fn load_consensus_params(&self, height: Height) -> Option<ConsensusParams>;
    /// Persist the consensus params in force at `height`.
    fn save_consensus_params(&self, height: Height, params: &ConsensusParams);
    /// Load the finalize-block response of `height`.
    fn load_finalize_response(&self, height: Height) -> Option<crate::app::FinalizeBlockResponse>;
    /// Persist the finalize-block response of `height`.
    fn save_finalize_response(&self, height: Height, resp: &crate::app::FinalizeBlockResponse);
    /// Read a named retain-height pointer ("app", "companion", "abci-res").
    fn retain_height(&self, name: &str) -> Height;
    /// Persist a named retain-height pointer.
    fn save_retain_height(&self, name: &str, height: Height);
}

/// Source of transactions for block building; the real mempool lives
/// outside the engine.
pub trait Mempool: Send + Sync {
    /// Take up to `max_bytes` of pending transactions, in arrival order.
    fn reap(&self, max_bytes: i64) -> Vec<Tx>;
    /// Remove committed transactions after a block applies.
    fn update(&self, height: Height, committed: &[Tx]);
    /// Number of pending transactions.
    fn size(&self) -> usize;
}

/// In-memory block store for tests and light deployments.
#[derive(Default)]
pub struct MemoryBlockStore {
    inner: RwLock<BlockStoreInner>,
}

#[derive(Default)]
struct BlockStoreInner {
    blocks: HashMap<Height, Block>,
    parts: HashMap<Height, PartSetHeader>,
    seen_commits: HashMap<Height, ExtendedCommit>,
    base: Height,
    height: Height,
}

impl MemoryBlockStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for MemoryBlockStore {
    fn base(&self) -> Height {
        self.inner.read().base
    }

    fn height(&self) -> Height {
        self.inner.read().height
    }

    fn save_block(&self, block: Block, parts: PartSetHeader, seen_commit: ExtendedCommit) {
        let mut inner = self.inner.write();
        let height = block.header.height;
        inner.blocks.insert(height, block);
        inner.parts.insert(height, parts);
        inner.seen_commits.insert(height, seen_commit);
        if inner.base == 0 {
            inner.base = height;
        }
        inner.height = inner.height.max(height);
    }

    fn load_block(&self, height: Height) -> Option<Block> {
        self.inner.read().blocks.get(&height).cloned()
    }

    fn load_part_set_header(&self, height: Height) -> Option<PartSetHeader> {
        self.inner.read().parts.get(&height).copied()
    }

    fn load_block_commit(&self, height: Height) -> Option<Commit> {
        let inner = self.inner.read();
        // Prefer the canonical commit carried by the next block.
        if let Some(next) = inner.blocks.get(&(height + 1)) {
            return Some(next.last_commit.clone());
        }
        inner.seen_commits.get(&height).map(|e| e.to_commit())
    }

    fn load_seen_commit(&self, height: Height) -> Option<ExtendedCommit> {
        self.inner.read().seen_commits.get(&height).cloned()
    }

    fn prune_blocks(&self, height: Height) -> u64 {
        let mut inner = self.inner.write();
        let mut pruned = 0;
        let from = inner.base.max(1);
        for h in from..height.min(inner.height + 1) {
            if inner.blocks.remove(&h).is_some() {
                inner.parts.remove(&h);
                inner.seen_commits.remove(&h);
                pruned += 1;
            }
        }
        if pruned > 0 {
            inner.base = height;
        }
        pruned
    }
}

/// In-memory state store for tests and light deployments.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: RwLock<StateStoreInner>,
}

#[derive(Default)]
struct StateStoreInner {
    state: Option<ChainState>,
    validators: HashMap<Height, ValidatorSet>,
    params: HashMap<Height, ConsensusParams>,
    finalize_responses: HashMap<Height, crate::app::FinalizeBlockResponse>,
    retain_heights: HashMap<String, Height>,
}

impl MemoryStateStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Option<ChainState> {
        self.inner.read().state.clone()
    }

    fn save(&self, state: &ChainState) {
        let mut inner = self.inner.write();
        inner.state = Some(state.clone());
        inner
            .validators
            .insert(state.next_height(), state.validators.clone());
        inner
            .params
            .insert(state.next_height(), state.consensus_params.clone());
    }

    fn load_validators(&self, height: Height) -> Option<ValidatorSet> {
        self.inner.read().validators.get(&height).cloned()
    }

    fn save_validators(&self, height: Height, validators: &ValidatorSet) {
        self.inner
            .write()
            .validators
            .insert(height, validators.clone());
    }

    fn load_consensus_params(&self, height: Height) -> Option<ConsensusParams> {
        self.inner.read().params.get(&height).cloned()
    }

    fn save_consensus_params(&self, height: Height, params: &ConsensusParams) {
        self.inner.write().params.insert(height, params.clone());
    }

    fn load_finalize_response(&self, height: Height) -> Option<crate::app::FinalizeBlockResponse> {
        self.inner.read().finalize_responses.get(&height).cloned()
    }

    fn save_finalize_response(&self, height: Height, resp: &crate::app::FinalizeBlockResponse) {
        self.inner
            .write()
            .finalize_responses
            .insert(height, resp.clone());
    }

    fn retain_height(&self, name: &str) -> Height {
        self.inner
            .read()
            .retain_heights
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    fn save_retain_height(&self, name: &str, height: Height) {
        self.inner
            .write()
            .retain_heights
            .insert(name.to_string(), height);
    }
}

/// In-memory FIFO mempool for tests.
#[derive(Default)]
pub struct MemoryMempool {
    txs: RwLock<Vec<Tx>>,
}

impl MemoryMempool {
    /// An empty mempool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a transaction.
    pub fn add(&self, tx: Tx) {
        self.txs.write().push(tx);
    }
}

impl Mempool for MemoryMempool {
    fn reap(&self, max_bytes: i64) -> Vec<Tx> {
        let txs = self.txs.read();
        let mut total = 0i64;
        txs.iter()
            .take_while(|tx| {
                total += tx.len() as i64;
                total <= max_bytes
            })
            .cloned()
            .collect()
    }

    fn update(&self, _height: Height, committed: &[Tx]) {
        let mut txs = self.txs.write();
        txs.retain(|tx| !committed.contains(tx));
    }

    fn size(&self) -> usize {
        self.txs.read().len()
    }
}
