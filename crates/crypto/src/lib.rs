//! # Tessera Crypto
//!
//! Cryptographic primitives for the tessera consensus engine.
//!
//! This crate provides:
//! - **SHA-256 hashing** - all consensus hashing (headers, votes, evidence)
//! - **Merkle trees** - RFC 6962 style roots and inclusion proofs
//! - **Consensus keys** - Ed25519 and secp256k1 signing and verification,
//!   with 20-byte addresses derived from the public key bytes
//!
//! ## Example
//!
//! ```rust
//! use tessera_crypto::{sha256, PrivateKey};
//!
//! // Hash some data
//! let digest = sha256(b"hello world");
//! assert_eq!(digest.len(), 32);
//!
//! // Generate an Ed25519 key and sign
//! let private_key = PrivateKey::generate_ed25519();
//! let public_key = private_key.public_key();
//! let signature = private_key.sign(b"message");
//! assert!(public_key.verify(b"message", &signature));
//!
//! // Derive the validator address
//! let address = public_key.address();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod hash;
pub mod keys;
pub mod merkle;

// Re-export commonly used items
pub use hash::{sha256, sha256_concat, Hasher};
pub use keys::{Address, KeyType, PrivateKey, PublicKey, Signature, ADDRESS_SIZE};
pub use merkle::{merkle_root, MerkleProof};

/// Common type alias for a 32-byte digest.
pub type Hash = [u8; 32];

/// Errors that can occur during cryptographic operations
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Invalid private key bytes
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// Invalid public key bytes
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Invalid signature bytes
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Invalid input length
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Merkle proof does not match the claimed root
    #[error("invalid merkle proof: {0}")]
    InvalidProof(String),

    /// Hex decoding error
    #[error("hex decoding error: {0}")]
    HexError(String),
}

impl From<hex::FromHexError> for CryptoError {
    fn from(e: hex::FromHexError) -> Self {
        CryptoError::HexError(e.to_string())
    }
}

/// Result type for cryptographic operations
pub type Result<T> = std::result::Result<T, CryptoError>;
