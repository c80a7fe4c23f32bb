//! End-to-end tests for the consensus state machine.
//!
//! These spin up real `ConsensusState` event loops (one per validator)
//! over in-memory stores and a channel-based gossip router, and observe
//! committed blocks through the block stores.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use tessera_config::{ConsensusConfig, GenesisDoc, GenesisValidator};
use tessera_consensus::{
    BlockStore, CancelToken, ConsensusHandle, ConsensusMessage, ConsensusState, EvidencePool,
    GossipMessage, Handshaker, KvStoreApp, LocalSigner, MemoryBlockStore, MemoryMempool,
    MemoryStateStore, StateStore,
};
use tessera_crypto::PrivateKey;
use tessera_types::{
    BlockId, ConsensusParams, Evidence, PartSetHeader, Tx, ValidatorParams, Vote, VoteType,
};

const CHAIN_ID: &str = "sm-test-chain";

struct Node {
    handle: ConsensusHandle,
    block_store: Arc<MemoryBlockStore>,
    state_store: Arc<MemoryStateStore>,
    mempool: Arc<MemoryMempool>,
    app: Arc<KvStoreApp>,
    cancel: CancelToken,
}

fn genesis(keys: &[PrivateKey]) -> GenesisDoc {
    GenesisDoc {
        genesis_time: 1,
        chain_id: CHAIN_ID.into(),
        initial_height: 1,
        consensus_params: ConsensusParams {
            validator: ValidatorParams {
                pub_key_types: vec!["ed25519".into()],
            },
            ..Default::default()
        },
        validators: keys
            .iter()
            .enumerate()
            .map(|(i, key)| GenesisValidator {
                name: format!("node{i}"),
                pub_key: key.public_key(),
                power: 10,
            })
            .collect(),
        app_state: serde_json::json!({}),
    }
}

fn node_config(dir: &std::path::Path, pacing_ms: u64) -> ConsensusConfig {
    let mut config = ConsensusConfig::test_config(dir);
    config.create_empty_blocks = true;
    config.create_empty_blocks_interval = Duration::from_millis(pacing_ms);
    config
}

/// Start one validator node and return its surfaces.
async fn start_node(
    key: PrivateKey,
    genesis: &GenesisDoc,
    config: ConsensusConfig,
) -> (Node, mpsc::Receiver<GossipMessage>) {
    let app = Arc::new(KvStoreApp::new());
    let block_store = Arc::new(MemoryBlockStore::new());
    let state_store = Arc::new(MemoryStateStore::new());
    let mempool = Arc::new(MemoryMempool::new());

    let handshaker = Handshaker::new(
        app.clone(),
        state_store.clone() as Arc<dyn StateStore>,
        block_store.clone() as Arc<dyn BlockStore>,
        genesis.clone(),
    );
    let cancel = CancelToken::new();
    let chain_state = handshaker.handshake(&cancel).await.unwrap();

    let evidence_pool = Arc::new(EvidencePool::new(
        CHAIN_ID,
        state_store.clone(),
        genesis.consensus_params.evidence.clone(),
        chain_state.last_block_height,
        chain_state.last_block_time,
    ));

    let (state, handle, outbound_rx) = ConsensusState::new(
        config,
        chain_state,
        app.clone(),
        block_store.clone(),
        state_store.clone(),
        mempool.clone(),
        evidence_pool,
        Some(Box::new(LocalSigner::new(key))),
    )
    .unwrap();

    let run_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = state.run(run_cancel).await;
    });

    (
        Node {
            handle,
            block_store,
            state_store,
            mempool,
            app,
            cancel,
        },
        outbound_rx,
    )
}

/// Route every node's outbound gossip to every other node's event queue.
fn route_gossip(nodes: &[Node], outbounds: Vec<mpsc::Receiver<GossipMessage>>) {
    for (from, mut outbound) in outbounds.into_iter().enumerate() {
        let peers: Vec<(usize, ConsensusHandle)> = nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != from)
            .map(|(i, n)| (i, n.handle.clone()))
            .collect();
        tokio::spawn(async move {
            let peer_name = format!("node{from}");
            while let Some(msg) = outbound.recv().await {
                let consensus_msg = match msg {
                    GossipMessage::Proposal(p) => Some(ConsensusMessage::Proposal(p)),
                    GossipMessage::BlockPart {
                        height,
                        round,
                        part,
                    } => Some(ConsensusMessage::BlockPart {
                        height,
                        round,
                        part,
                    }),
                    GossipMessage::Vote(v) => Some(ConsensusMessage::Vote(v)),
                    _ => None,
                };
                if let Some(consensus_msg) = consensus_msg {
                    for (_, handle) in &peers {
                        let _ = handle.send_external(&peer_name, consensus_msg.clone()).await;
                    }
                }
            }
        });
    }
}

async fn wait_for_height(nodes: &[Node], height: i64, budget: Duration) {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if nodes.iter().all(|n| n.block_store.height() >= height) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "nodes did not reach height {height}: {:?}",
            nodes
                .iter()
                .map(|n| n.block_store.height())
                .collect::<Vec<_>>()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_validator_commits_blocks() {
    let keys = vec![PrivateKey::from_seed_ed25519([1u8; 32])];
    let genesis = genesis(&keys);
    let dir = tempfile::tempdir().unwrap();

    let (node, _outbound) = start_node(
        keys.into_iter().next().unwrap(),
        &genesis,
        node_config(dir.path(), 0),
    )
    .await;

    node.mempool.add(Tx(b"alpha=1".to_vec()));
    node.mempool.add(Tx(b"beta=2".to_vec()));

    wait_for_height(std::slice::from_ref(&node), 3, Duration::from_secs(20)).await;

    // The transactions were committed and executed.
    assert_eq!(node.app.get("alpha").as_deref(), Some("1"));
    assert_eq!(node.app.get("beta").as_deref(), Some("2"));

    // Each block links to its parent.
    let b1 = node.block_store.load_block(1).unwrap();
    let b2 = node.block_store.load_block(2).unwrap();
    assert_eq!(b2.header.last_block_id.hash, b1.hash());
    assert_eq!(b2.last_commit.height, 1);

    // The seen commit verifies against the stored validator set.
    let seen = node.block_store.load_seen_commit(2).unwrap();
    let vals = node.state_store.load_validators(2).unwrap();
    vals.verify_commit(CHAIN_ID, &seen.block_id, 2, &seen.to_commit())
        .unwrap();

    node.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn four_validators_agree_on_every_height() {
    let keys: Vec<PrivateKey> = (0..4)
        .map(|i| PrivateKey::from_seed_ed25519([i as u8 + 1; 32]))
        .collect();
    let genesis = genesis(&keys);
    let dirs: Vec<_> = (0..4).map(|_| tempfile::tempdir().unwrap()).collect();

    let mut nodes = Vec::new();
    let mut outbounds = Vec::new();
    for (i, key) in keys.into_iter().enumerate() {
        let (node, outbound) = start_node(key, &genesis, node_config(dirs[i].path(), 30)).await;
        nodes.push(node);
        outbounds.push(outbound);
    }
    route_gossip(&nodes, outbounds);

    nodes[0].mempool.add(Tx(b"shared=value".to_vec()));
    wait_for_height(&nodes, 4, Duration::from_secs(60)).await;

    // Agreement: every node stored the identical block at every height.
    for height in 1..=4 {
        let reference = nodes[0].block_store.load_block(height).unwrap();
        for node in &nodes[1..] {
            let block = node.block_store.load_block(height).unwrap();
            assert_eq!(
                block.hash(),
                reference.hash(),
                "disagreement at height {height}"
            );
        }
    }

    for node in &nodes {
        node.cancel.cancel();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn byzantine_equivocation_lands_in_a_block_as_evidence() {
    let keys: Vec<PrivateKey> = (0..4)
        .map(|i| PrivateKey::from_seed_ed25519([i as u8 + 10; 32]))
        .collect();
    let byzantine_key = PrivateKey::from_seed_ed25519([10u8; 32]);
    let byzantine_address = byzantine_key.public_key().address();
    let genesis = genesis(&keys);
    let dirs: Vec<_> = (0..4).map(|_| tempfile::tempdir().unwrap()).collect();

    let mut nodes = Vec::new();
    let mut outbounds = Vec::new();
    for (i, key) in keys.into_iter().enumerate() {
        // Slow pacing so every node is observably at height 2 together.
        let (node, outbound) = start_node(key, &genesis, node_config(dirs[i].path(), 400)).await;
        nodes.push(node);
        outbounds.push(outbound);
    }
    route_gossip(&nodes, outbounds);

    // Wait for every node to sit at height 2 (inside the empty-block wait).
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let heights: Vec<i64> = nodes
            .iter()
            .map(|n| n.handle.get_round_state().height)
            .collect();
        if heights.iter().all(|h| *h == 2) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "nodes never aligned at height 2: {heights:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // The byzantine validator signs two conflicting prevotes at height 2
    // and the gossip layer spreads both halves everywhere.
    let rs = nodes[1].handle.get_round_state();
    let (index, _) = rs
        .validators
        .get_by_address(&byzantine_address)
        .expect("byzantine validator is in the set");

    let make_vote = |hash_byte: u8| {
        let block_id = if hash_byte == 0 {
            BlockId::zero()
        } else {
            BlockId {
                hash: [hash_byte; 32],
                part_set_header: PartSetHeader {
                    total: 1,
                    hash: [hash_byte; 32],
                },
            }
        };
        let mut vote = Vote::new(
            VoteType::Prevote,
            2,
            0,
            block_id,
            byzantine_address,
            index as i32,
        );
        vote.timestamp = 1_000;
        vote.signature = byzantine_key.sign(&vote.sign_bytes(CHAIN_ID));
        vote
    };
    let vote_block = make_vote(0xaa);
    let vote_nil = make_vote(0);

    for node in &nodes {
        node.handle
            .send_external("byzantine", ConsensusMessage::Vote(vote_block.clone()))
            .await
            .unwrap();
        node.handle
            .send_external("byzantine", ConsensusMessage::Vote(vote_nil.clone()))
            .await
            .unwrap();
    }

    // By some height <= 6 every correct node's chain carries the evidence.
    wait_for_height(&nodes, 6, Duration::from_secs(60)).await;
    for (i, node) in nodes.iter().enumerate() {
        let mut found = false;
        for height in 2..=6 {
            if let Some(block) = node.block_store.load_block(height) {
                for evidence in &block.evidence {
                    let Evidence::DuplicateVote(dve) = evidence;
                    if dve.validator_address() == byzantine_address && dve.height() == 2 {
                        found = true;
                    }
                }
            }
        }
        assert!(found, "node {i} never committed the equivocation evidence");
    }

    for node in &nodes {
        node.cancel.cancel();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn node_restart_resumes_from_wal_and_commits_again() {
    let keys = vec![PrivateKey::from_seed_ed25519([42u8; 32])];
    let key_bytes = [42u8; 32];
    let genesis = genesis(&keys);
    let dir = tempfile::tempdir().unwrap();

    let (node, _outbound) = start_node(
        keys.into_iter().next().unwrap(),
        &genesis,
        node_config(dir.path(), 0),
    )
    .await;
    wait_for_height(std::slice::from_ref(&node), 2, Duration::from_secs(20)).await;

    // "Crash": stop the loop mid-flight.
    node.cancel.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let height_at_crash = node.block_store.height();
    let Node {
        block_store,
        state_store,
        mempool,
        app,
        ..
    } = node;

    // Restart over the same stores, WAL, and application.
    let handshaker = Handshaker::new(
        app.clone(),
        state_store.clone() as Arc<dyn StateStore>,
        block_store.clone() as Arc<dyn BlockStore>,
        genesis.clone(),
    );
    let cancel = CancelToken::new();
    let chain_state = handshaker.handshake(&cancel).await.unwrap();
    assert_eq!(chain_state.last_block_height, height_at_crash);

    let evidence_pool = Arc::new(EvidencePool::new(
        CHAIN_ID,
        state_store.clone(),
        genesis.consensus_params.evidence.clone(),
        chain_state.last_block_height,
        chain_state.last_block_time,
    ));
    let (state, _handle, _outbound) = ConsensusState::new(
        node_config(dir.path(), 0),
        chain_state,
        app,
        block_store.clone(),
        state_store,
        mempool,
        evidence_pool,
        Some(Box::new(LocalSigner::new(PrivateKey::from_seed_ed25519(
            key_bytes,
        )))),
    )
    .unwrap();
    let run_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = state.run(run_cancel).await;
    });

    // Liveness after restart: at least one more block commits.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while block_store.height() <= height_at_crash {
        assert!(
            tokio::time::Instant::now() < deadline,
            "no progress after restart (stuck at {height_at_crash})"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();
}
