//! The application boundary.
//!
//! The engine drives a deterministic application through the
//! [`Application`] trait: the application decides transaction ordering
//! refinements, validates proposals, extends votes, and executes finalized
//! blocks into an app-state digest. The engine never interprets
//! transaction contents.
//!
//! [`KvStoreApp`] is the in-memory reference application used by tests:
//! transactions are `key=value` strings and the app hash is a digest of
//! the sorted store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use tessera_crypto::{Address, Hash, PublicKey};
use tessera_types::{Block, ConsensusParams, Height, Round, Tx};

/// Application identity and sync position, returned by [`Application::info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    /// Application name/version string
    pub app_version: String,
    /// Height of the last block the application executed
    pub last_block_height: Height,
    /// App-state digest after that block
    pub last_block_app_hash: Hash,
}

/// A change to a validator's power requested by the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorUpdate {
    /// The validator's consensus key
    pub pub_key: PublicKey,
    /// New voting power; zero removes the validator
    pub power: i64,
}

/// Request for [`Application::init_chain`].
#[derive(Debug, Clone)]
pub struct InitChainRequest {
    /// Chain identifier
    pub chain_id: String,
    /// First block height
    pub initial_height: Height,
    /// Genesis consensus parameters
    pub consensus_params: ConsensusParams,
    /// Genesis validators as updates
    pub validators: Vec<ValidatorUpdate>,
    /// Opaque genesis application state
    pub app_state: serde_json::Value,
}

/// Response from [`Application::init_chain`].
#[derive(Debug, Clone, Default)]
pub struct InitChainResponse {
    /// Validator overrides (empty = accept the genesis set)
    pub validators: Vec<ValidatorUpdate>,
    /// Consensus param overrides
    pub consensus_params: Option<ConsensusParams>,
    /// Initial app-state digest
    pub app_hash: Hash,
}

/// The result of one executed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResult {
    /// Zero means the transaction succeeded
    pub code: u32,
    /// Opaque result payload
    pub data: Vec<u8>,
    /// Human-readable log line
    pub log: String,
}

/// Request for [`Application::finalize_block`].
#[derive(Debug, Clone)]
pub struct FinalizeBlockRequest {
    /// The decided block
    pub block: Block,
    /// Height of the decided block
    pub height: Height,
}

/// Response from [`Application::finalize_block`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeBlockResponse {
    /// One result per transaction, in block order
    pub tx_results: Vec<TxResult>,
    /// App-state digest after executing the block
    pub app_hash: Hash,
    /// Validator power changes to apply at height + 2
    pub validator_updates: Vec<ValidatorUpdate>,
    /// Consensus parameter changes, if any
    pub consensus_param_updates: Option<ConsensusParams>,
}

impl FinalizeBlockResponse {
    /// Merkle-style digest of the transaction results, committed into the
    /// next header's `last_results_hash`.
    pub fn results_hash(&self) -> Hash {
        let leaves: Vec<Vec<u8>> = self
            .tx_results
            .iter()
            .map(|r| {
                let mut bytes = r.code.to_le_bytes().to_vec();
                bytes.extend_from_slice(&r.data);
                bytes
            })
            .collect();
        tessera_crypto::merkle_root(&leaves)
    }
}

/// The deterministic state machine the engine replicates.
///
/// All methods take `&self`; implementations manage their own interior
/// mutability. Calls are made from the consensus event loop and are
/// bounded by the loop's timeouts.
#[async_trait]
pub trait Application: Send + Sync + 'static {
    /// Report the application's identity and last executed height.
    async fn info(&self) -> AppInfo;

    /// Initialize the chain from genesis state.
    async fn init_chain(&self, req: InitChainRequest) -> InitChainResponse;

    /// Let the application reorder/augment/drop transactions for a block
    /// it is about to propose. `max_bytes` bounds the total size.
    async fn prepare_proposal(&self, txs: Vec<Tx>, max_bytes: i64) -> Vec<Tx>;

    /// Ask the application whether a proposed block is acceptable.
    async fn process_proposal(&self, block: &Block) -> bool;

    /// Produce an application-defined vote extension for a precommit.
    async fn extend_vote(&self, height: Height, round: Round) -> Vec<u8>;

    /// Verify another validator's vote extension.
    async fn verify_vote_extension(
        &self,
        height: Height,
        round: Round,
        validator: Address,
        extension: &[u8],
    ) -> bool;

    /// Execute a decided block, returning results and the new app hash.
    async fn finalize_block(&self, req: FinalizeBlockRequest) -> FinalizeBlockResponse;

    /// Persist application state; returns the height below which the
    /// application no longer needs blocks (retain height).
    async fn commit(&self) -> Height;
}

/// In-memory key/value application.
///
/// Transactions are UTF-8 `key=value` pairs; anything else fails with a
/// non-zero code. The app hash is the SHA-256 of the sorted store plus
/// the executed height, which makes non-determinism across replicas
/// immediately visible.
#[derive(Debug, Default)]
pub struct KvStoreApp {
    inner: Mutex<KvInner>,
}

#[derive(Debug, Default, Clone)]
struct KvInner {
    entries: BTreeMap<String, String>,
    /// Height of the last finalized (executed) block
    height: Height,
    /// App hash after the last finalized block
    app_hash: Hash,
    /// Height made durable by the last `commit` call; `info` reports this
    committed_height: Height,
    /// App hash as of `committed_height`
    committed_app_hash: Hash,
    retain_blocks: Height,
}

impl KvStoreApp {
    /// A fresh, empty application.
    pub fn new() -> Self {
        Self::default()
    }

    /// An application that reports `retain_blocks` as its retain height
    /// offset on commit (zero keeps everything).
    pub fn with_retain_blocks(retain_blocks: Height) -> Self {
        Self {
            inner: Mutex::new(KvInner {
                retain_blocks,
                ..Default::default()
            }),
        }
    }

    /// Read a value back (test helper).
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().entries.get(key).cloned()
    }

    fn compute_app_hash(entries: &BTreeMap<String, String>, height: Height) -> Hash {
        let mut hasher = tessera_crypto::Hasher::new();
        hasher.update(&height.to_le_bytes());
        for (key, value) in entries {
            hasher.update(key.as_bytes());
            hasher.update(&[0]);
            hasher.update(value.as_bytes());
            hasher.update(&[0xff]);
        }
        hasher.finalize()
    }
}

#[async_trait]
impl Application for KvStoreApp {
    async fn info(&self) -> AppInfo {
        let inner = self.inner.lock();
        AppInfo {
            app_version: "kvstore/1".into(),
            last_block_height: inner.committed_height,
            last_block_app_hash: inner.committed_app_hash,
        }
    }

    async fn init_chain(&self, req: InitChainRequest) -> InitChainResponse {
        let mut inner = self.inner.lock();
        inner.height = req.initial_height - 1;
        inner.app_hash = Self::compute_app_hash(&inner.entries, inner.height);
        inner.committed_height = inner.height;
        inner.committed_app_hash = inner.app_hash;
        debug!(chain_id = %req.chain_id, "kvstore initialized");
        InitChainResponse {
            validators: Vec::new(),
            consensus_params: None,
            app_hash: inner.app_hash,
        }
    }

    async fn prepare_proposal(&self, txs: Vec<Tx>, max_bytes: i64) -> Vec<Tx> {
        // Keep order, enforce the byte budget.
        let mut total = 0i64;
        txs.into_iter()
            .take_while(|tx| {
                total += tx.len() as i64;
                total <= max_bytes
            })
            .collect()
    }

    async fn process_proposal(&self, block: &Block) -> bool {
        block
            .data
            .iter()
            .all(|tx| std::str::from_utf8(&tx.0).map(|s| s.contains('=')).unwrap_or(false))
    }

    async fn extend_vote(&self, height: Height, _round: Round) -> Vec<u8> {
        format!("ext-{height}").into_bytes()
    }

    async fn verify_vote_extension(
        &self,
        height: Height,
        _round: Round,
        _validator: Address,
        extension: &[u8],
    ) -> bool {
        extension.is_empty() || extension == format!("ext-{height}").as_bytes()
    }

    async fn finalize_block(&self, req: FinalizeBlockRequest) -> FinalizeBlockResponse {
        let mut inner = self.inner.lock();
        let mut tx_results = Vec::with_capacity(req.block.data.len());
        for tx in &req.block.data {
            match std::str::from_utf8(&tx.0)
                .ok()
                .and_then(|s| s.split_once('='))
            {
                Some((key, value)) => {
                    inner.entries.insert(key.to_string(), value.to_string());
                    tx_results.push(TxResult {
                        code: 0,
                        data: Vec::new(),
                        log: String::new(),
                    });
                }
                None => tx_results.push(TxResult {
                    code: 1,
                    data: Vec::new(),
                    log: "malformed transaction".into(),
                }),
            }
        }
        inner.height = req.height;
        inner.app_hash = Self::compute_app_hash(&inner.entries, inner.height);
        FinalizeBlockResponse {
            tx_results,
            app_hash: inner.app_hash,
            validator_updates: Vec::new(),
            consensus_param_updates: None,
        }
    }

    async fn commit(&self) -> Height {
        let mut inner = self.inner.lock();
        inner.committed_height = inner.height;
        inner.committed_app_hash = inner.app_hash;
        if inner.retain_blocks > 0 {
            (inner.height - inner.retain_blocks).max(0)
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::{Commit, Header};

    fn block_with_txs(height: Height, txs: Vec<&str>) -> Block {
        Block {
            header: Header {
                chain_id: "kv-test".into(),
                height,
                ..Default::default()
            },
            data: txs.into_iter().map(|s| Tx(s.as_bytes().to_vec())).collect(),
            evidence: Vec::new(),
            last_commit: Commit::default(),
        }
    }

    #[tokio::test]
    async fn test_finalize_applies_txs_deterministically() {
        let app1 = KvStoreApp::new();
        let app2 = KvStoreApp::new();
        let block = block_with_txs(1, vec!["a=1", "b=2"]);

        let r1 = app1
            .finalize_block(FinalizeBlockRequest {
                block: block.clone(),
                height: 1,
            })
            .await;
        let r2 = app2
            .finalize_block(FinalizeBlockRequest { block, height: 1 })
            .await;

        assert_eq!(r1.app_hash, r2.app_hash);
        assert_eq!(app1.get("a").as_deref(), Some("1"));
        assert!(r1.tx_results.iter().all(|r| r.code == 0));
    }

    #[tokio::test]
    async fn test_malformed_tx_gets_nonzero_code() {
        let app = KvStoreApp::new();
        let block = block_with_txs(1, vec!["a=1", "garbage"]);
        let resp = app
            .finalize_block(FinalizeBlockRequest { block, height: 1 })
            .await;
        assert_eq!(resp.tx_results[0].code, 0);
        assert_eq!(resp.tx_results[1].code, 1);
    }

    #[tokio::test]
    async fn test_app_hash_tracks_height_and_state() {
        let app = KvStoreApp::new();
        let r1 = app
            .finalize_block(FinalizeBlockRequest {
                block: block_with_txs(1, vec![]),
                height: 1,
            })
            .await;
        let r2 = app
            .finalize_block(FinalizeBlockRequest {
                block: block_with_txs(2, vec![]),
                height: 2,
            })
            .await;
        // Even empty blocks advance the digest.
        assert_ne!(r1.app_hash, r2.app_hash);
    }

    #[tokio::test]
    async fn test_process_proposal_rejects_garbage() {
        let app = KvStoreApp::new();
        assert!(app.process_proposal(&block_with_txs(1, vec!["x=y"])).await);
        assert!(!app.process_proposal(&block_with_txs(1, vec!["xy"])).await);
    }

    #[tokio::test]
    async fn test_prepare_proposal_respects_budget() {
        let app = KvStoreApp::new();
        let txs = vec![Tx(vec![b'a'; 40]), Tx(vec![b'b'; 40]), Tx(vec![b'c'; 40])];
        let kept = app.prepare_proposal(txs, 100).await;
        assert_eq!(kept.len(), 2);
    }

    #[tokio::test]
    async fn test_vote_extensions_roundtrip() {
        let app = KvStoreApp::new();
        let ext = app.extend_vote(5, 0).await;
        assert!(
            app.verify_vote_extension(5, 0, Address::ZERO, &ext).await
        );
        assert!(!app.verify_vote_extension(6, 0, Address::ZERO, &ext).await);
    }
}
