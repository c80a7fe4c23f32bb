//! Block, header, and block-part types.
//!
//! A [`Block`] is the unit the engine agrees on: a [`Header`] that
//! Merkle-commits to every field, the transaction payload, the evidence
//! list, and the commit for the previous height. Blocks travel the gossip
//! layer split into fixed-size [`Part`]s, each carrying a Merkle inclusion
//! proof against the [`PartSetHeader`] in the block id.

use serde::{Deserialize, Serialize};

use tessera_crypto::merkle::{merkle_root, MerkleProof};
use tessera_crypto::{sha256, Address, Hash};

use crate::commit::Commit;
use crate::evidence::Evidence;
use crate::{Height, TimestampMs};

/// Size of a single block part on the wire.
pub const BLOCK_PART_SIZE_BYTES: usize = 65536;

/// Errors from block and header validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    /// A header field failed its basic validity check
    #[error("invalid block header: {0}")]
    InvalidHeader(String),

    /// The block body does not match the header commitments
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    /// A block part failed its inclusion proof or bounds check
    #[error("invalid block part {index}: {reason}")]
    InvalidPart {
        /// Part index
        index: u32,
        /// Why the part was rejected
        reason: String,
    },
}

/// A single transaction, opaque to the consensus engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx(pub Vec<u8>);

impl Tx {
    /// Hash of the transaction bytes.
    pub fn hash(&self) -> Hash {
        sha256(&self.0)
    }

    /// Length of the transaction in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the transaction is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for Tx {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Commitment to the part-set a serialized block was split into.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, PartialOrd, Ord,
)]
pub struct PartSetHeader {
    /// Number of parts
    pub total: u32,
    /// Merkle root over the part bytes
    pub hash: Hash,
}

impl PartSetHeader {
    /// The zero part-set header (component of the nil block id).
    pub fn zero() -> Self {
        Self::default()
    }

    /// Whether this is the zero header.
    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.hash == [0u8; 32]
    }

    /// Canonical byte encoding, embedded in vote sign bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + 32);
        bytes.extend_from_slice(&self.total.to_le_bytes());
        bytes.extend_from_slice(&self.hash);
        bytes
    }
}

/// Identifies a block: the header hash plus the part-set commitment.
///
/// The all-zero value denotes "nil" (a vote for no block). Equality is
/// bit-exact.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, PartialOrd, Ord,
)]
pub struct BlockId {
    /// Hash of the block header
    pub hash: Hash,
    /// Commitment to the block's part set
    pub part_set_header: PartSetHeader,
}

impl BlockId {
    /// The nil block id.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Whether this is the nil block id.
    pub fn is_zero(&self) -> bool {
        self.hash == [0u8; 32] && self.part_set_header.is_zero()
    }

    /// Canonical byte encoding, embedded in vote sign bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(32 + 4 + 32);
        bytes.extend_from_slice(&self.hash);
        bytes.extend_from_slice(&self.part_set_header.canonical_bytes());
        bytes
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_zero() {
            write!(f, "nil")
        } else {
            write!(
                f,
                "{}:{}",
                hex::encode(&self.hash[..8]),
                self.part_set_header.total
            )
        }
    }
}

/// The block header. Every field is committed into the header hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Header {
    /// Chain identifier (prevents cross-chain replay)
    pub chain_id: String,
    /// Block height
    pub height: Height,
    /// Proposal timestamp (Unix millis)
    pub time: TimestampMs,
    /// Id of the previous block (zero for the initial height)
    pub last_block_id: BlockId,
    /// Merkle root of the previous height's commit signatures
    pub last_commit_hash: Hash,
    /// Merkle root of the transactions in this block
    pub data_hash: Hash,
    /// Hash of the validator set voting on this block
    pub validators_hash: Hash,
    /// Hash of the validator set for the next height
    pub next_validators_hash: Hash,
    /// Hash of the consensus parameters in force at this height
    pub consensus_hash: Hash,
    /// Application state digest after the previous block
    pub app_hash: Hash,
    /// Merkle root of the previous block's transaction results
    pub last_results_hash: Hash,
    /// Merkle root of the evidence included in this block
    pub evidence_hash: Hash,
    /// Address of the proposer that built this block
    pub proposer_address: Address,
}

impl Header {
    /// Compute the header hash: Merkle root over the encoded fields, in
    /// declaration order.
    pub fn hash(&self) -> Hash {
        let fields: Vec<Vec<u8>> = vec![
            self.chain_id.as_bytes().to_vec(),
            self.height.to_le_bytes().to_vec(),
            self.time.to_le_bytes().to_vec(),
            self.last_block_id.canonical_bytes(),
            self.last_commit_hash.to_vec(),
            self.data_hash.to_vec(),
            self.validators_hash.to_vec(),
            self.next_validators_hash.to_vec(),
            self.consensus_hash.to_vec(),
            self.app_hash.to_vec(),
            self.last_results_hash.to_vec(),
            self.evidence_hash.to_vec(),
            self.proposer_address.as_bytes().to_vec(),
        ];
        merkle_root(&fields)
    }

    /// Per-field validity checks that need no external context.
    pub fn validate_basic(&self) -> Result<(), BlockError> {
        if self.chain_id.is_empty() {
            return Err(BlockError::InvalidHeader("empty chain id".into()));
        }
        if self.chain_id.len() > 50 {
            return Err(BlockError::InvalidHeader(format!(
                "chain id too long: {} > 50",
                self.chain_id.len()
            )));
        }
        if self.height < 1 {
            return Err(BlockError::InvalidHeader(format!(
                "non-positive height: {}",
                self.height
            )));
        }
        if self.height > 1 && self.last_block_id.is_zero() {
            return Err(BlockError::InvalidHeader(
                "non-initial block must reference the previous block".into(),
            ));
        }
        if self.proposer_address.is_zero() {
            return Err(BlockError::InvalidHeader("zero proposer address".into()));
        }
        Ok(())
    }
}

/// A complete block: header, transactions, evidence, and the commit that
/// finalized the previous height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// The block header
    pub header: Header,
    /// Ordered transaction payload
    pub data: Vec<Tx>,
    /// Evidence of validator misbehavior to be punished
    pub evidence: Vec<Evidence>,
    /// Commit certifying the previous block (empty at the initial height)
    pub last_commit: Commit,
}

impl Block {
    /// Hash of the block (the header hash).
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Serialize the block for splitting into parts.
    pub fn to_part_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("block serialization cannot fail")
    }

    /// Reassemble a block from part bytes.
    pub fn from_part_bytes(bytes: &[u8]) -> Result<Self, BlockError> {
        serde_json::from_slice(bytes)
            .map_err(|e| BlockError::InvalidBlock(format!("undecodable block bytes: {e}")))
    }

    /// Split the block into a complete [`PartSet`].
    pub fn make_part_set(&self, part_size: usize) -> PartSet {
        PartSet::from_bytes(&self.to_part_bytes(), part_size)
    }

    /// The block id for this block given its part set.
    pub fn block_id(&self, part_set: &PartSet) -> BlockId {
        BlockId {
            hash: self.hash(),
            part_set_header: part_set.header(),
        }
    }

    /// Validate the block body against the header commitments and run
    /// per-field header checks.
    pub fn validate_basic(&self) -> Result<(), BlockError> {
        self.header.validate_basic()?;

        let data_hash = merkle_root(&self.data.iter().map(|tx| tx.hash()).collect::<Vec<_>>());
        if data_hash != self.header.data_hash {
            return Err(BlockError::InvalidBlock(format!(
                "data hash mismatch: header {}, computed {}",
                hex::encode(self.header.data_hash),
                hex::encode(data_hash)
            )));
        }

        let evidence_hash = merkle_root(
            &self
                .evidence
                .iter()
                .map(|ev| ev.hash())
                .collect::<Vec<_>>(),
        );
        if evidence_hash != self.header.evidence_hash {
            return Err(BlockError::InvalidBlock(format!(
                "evidence hash mismatch: header {}, computed {}",
                hex::encode(self.header.evidence_hash),
                hex::encode(evidence_hash)
            )));
        }

        let last_commit_hash = self.last_commit.hash();
        if last_commit_hash != self.header.last_commit_hash {
            return Err(BlockError::InvalidBlock(format!(
                "last commit hash mismatch: header {}, computed {}",
                hex::encode(self.header.last_commit_hash),
                hex::encode(last_commit_hash)
            )));
        }

        if self.header.height > 1 {
            self.last_commit
                .validate_basic()
                .map_err(|e| BlockError::InvalidBlock(format!("invalid last commit: {e}")))?;
            if self.last_commit.height != self.header.height - 1 {
                return Err(BlockError::InvalidBlock(format!(
                    "last commit is for height {}, expected {}",
                    self.last_commit.height,
                    self.header.height - 1
                )));
            }
        }

        for ev in &self.evidence {
            ev.validate_basic()
                .map_err(|e| BlockError::InvalidBlock(format!("invalid evidence: {e}")))?;
        }

        Ok(())
    }
}

/// One gossiped piece of a serialized block, with its inclusion proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    /// Zero-based index of this part
    pub index: u32,
    /// The raw part bytes
    pub bytes: Vec<u8>,
    /// Merkle proof of inclusion under the part-set hash
    pub proof: MerkleProof,
}

/// A set of block parts, either complete (built from a block) or being
/// assembled from gossip.
#[derive(Debug, Clone)]
pub struct PartSet {
    header: PartSetHeader,
    parts: Vec<Option<Part>>,
    count: u32,
    byte_size: usize,
}

impl PartSet {
    /// Split serialized block bytes into proven parts.
    pub fn from_bytes(bytes: &[u8], part_size: usize) -> Self {
        let chunks: Vec<Vec<u8>> = if bytes.is_empty() {
            vec![Vec::new()]
        } else {
            bytes.chunks(part_size).map(|c| c.to_vec()).collect()
        };
        let (root, proofs) = MerkleProof::from_leaves(&chunks);
        let parts: Vec<Option<Part>> = chunks
            .into_iter()
            .zip(proofs)
            .enumerate()
            .map(|(i, (bytes, proof))| {
                Some(Part {
                    index: i as u32,
                    bytes,
                    proof,
                })
            })
            .collect();
        let total = parts.len() as u32;
        let byte_size = bytes.len();
        PartSet {
            header: PartSetHeader { total, hash: root },
            parts,
            count: total,
            byte_size,
        }
    }

    /// Start assembling a part set described by `header`.
    pub fn new_for_header(header: PartSetHeader) -> Self {
        PartSet {
            parts: vec![None; header.total as usize],
            header,
            count: 0,
            byte_size: 0,
        }
    }

    /// The part-set commitment.
    pub fn header(&self) -> PartSetHeader {
        self.header
    }

    /// Number of parts received so far.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Total number of parts expected.
    pub fn total(&self) -> u32 {
        self.header.total
    }

    /// Whether every part has been received.
    pub fn is_complete(&self) -> bool {
        self.count == self.header.total
    }

    /// Whether the part at `index` is present.
    pub fn has_part(&self, index: u32) -> bool {
        self.parts
            .get(index as usize)
            .map(|p| p.is_some())
            .unwrap_or(false)
    }

    /// Add a gossiped part, verifying its proof against the set header.
    ///
    /// Returns `Ok(true)` if the part was added, `Ok(false)` if it was
    /// already present.
    pub fn add_part(&mut self, part: Part) -> Result<bool, BlockError> {
        let index = part.index;
        if index >= self.header.total {
            return Err(BlockError::InvalidPart {
                index,
                reason: format!("index out of bounds (total {})", self.header.total),
            });
        }
        if self.parts[index as usize].is_some() {
            return Ok(false);
        }
        part.proof
            .verify(&self.header.hash, &part.bytes)
            .map_err(|e| BlockError::InvalidPart {
                index,
                reason: e.to_string(),
            })?;
        if part.proof.index != index || part.proof.total != self.header.total {
            return Err(BlockError::InvalidPart {
                index,
                reason: "proof position does not match part index".into(),
            });
        }
        self.byte_size += part.bytes.len();
        self.parts[index as usize] = Some(part);
        self.count += 1;
        Ok(true)
    }

    /// Get a part by index.
    pub fn get_part(&self, index: u32) -> Option<&Part> {
        self.parts.get(index as usize).and_then(|p| p.as_ref())
    }

    /// Concatenate all parts back into the serialized block bytes.
    ///
    /// Only meaningful when [`is_complete`](Self::is_complete) is true.
    pub fn assemble(&self) -> Result<Vec<u8>, BlockError> {
        if !self.is_complete() {
            return Err(BlockError::InvalidBlock(format!(
                "part set incomplete: {}/{}",
                self.count, self.header.total
            )));
        }
        let mut bytes = Vec::with_capacity(self.byte_size);
        for part in self.parts.iter().flatten() {
            bytes.extend_from_slice(&part.bytes);
        }
        Ok(bytes)
    }
}
