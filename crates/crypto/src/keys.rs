//! # Consensus Keys and Addresses
//!
//! Validator signing keys for the two supported schemes:
//!
//! - **Ed25519** - the default consensus key scheme
//! - **secp256k1** - permitted alongside Ed25519 within a validator set
//!
//! A validator address is the first 20 bytes of the SHA-256 digest of the
//! canonical public key bytes, regardless of scheme.

use ed25519_dalek::Verifier as _;
use k256::ecdsa::signature::{Signer as _, Verifier as _};
use k256::elliptic_curve::sec1::ToEncodedPoint as _;
use serde::{Deserialize, Serialize};

use crate::hash::sha256;
use crate::{CryptoError, Result};

/// Size of a validator address in bytes.
pub const ADDRESS_SIZE: usize = 20;

/// Size of an Ed25519 public key in bytes.
pub const ED25519_PUBKEY_SIZE: usize = 32;

/// Size of a compressed secp256k1 public key in bytes.
pub const SECP256K1_PUBKEY_SIZE: usize = 33;

/// A 20-byte validator address.
///
/// Addresses order and compare byte-wise; the ordering is observable in
/// proposer selection tie-breaks and in the canonical validator ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Address(pub [u8; ADDRESS_SIZE]);

impl Address {
    /// The all-zero address.
    pub const ZERO: Address = Address([0u8; ADDRESS_SIZE]);

    /// Construct an address from a slice, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ADDRESS_SIZE {
            return Err(CryptoError::InvalidLength {
                expected: ADDRESS_SIZE,
                actual: bytes.len(),
            });
        }
        let mut addr = [0u8; ADDRESS_SIZE];
        addr.copy_from_slice(bytes);
        Ok(Address(addr))
    }

    /// View the address as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Check whether this is the all-zero address.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ADDRESS_SIZE]
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

/// The key scheme of a validator public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    /// Ed25519 keys
    Ed25519,
    /// secp256k1 keys
    Secp256k1,
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyType::Ed25519 => write!(f, "ed25519"),
            KeyType::Secp256k1 => write!(f, "secp256k1"),
        }
    }
}

/// A validator public key.
///
/// Stored as raw canonical bytes so equality, ordering and serialization are
/// bit-exact; the curve point is reconstructed on verification.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PublicKey {
    /// Ed25519 verifying key bytes
    Ed25519([u8; ED25519_PUBKEY_SIZE]),
    /// Compressed secp256k1 verifying key bytes (SEC1, 33 bytes)
    Secp256k1(Vec<u8>),
}

impl PublicKey {
    /// The key scheme of this public key.
    pub fn key_type(&self) -> KeyType {
        match self {
            PublicKey::Ed25519(_) => KeyType::Ed25519,
            PublicKey::Secp256k1(_) => KeyType::Secp256k1,
        }
    }

    /// Canonical key bytes (the address preimage).
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            PublicKey::Ed25519(bytes) => bytes,
            PublicKey::Secp256k1(bytes) => bytes,
        }
    }

    /// Derive the validator address: first 20 bytes of SHA-256 of the
    /// canonical key bytes.
    pub fn address(&self) -> Address {
        let digest = sha256(self.as_bytes());
        let mut addr = [0u8; ADDRESS_SIZE];
        addr.copy_from_slice(&digest[..ADDRESS_SIZE]);
        Address(addr)
    }

    /// Verify `signature` over `message`.
    ///
    /// Returns `false` for malformed key bytes, malformed signatures, and
    /// verification failures alike; callers treat all three as a bad
    /// signature.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        match self {
            PublicKey::Ed25519(bytes) => {
                let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(bytes) else {
                    return false;
                };
                let Ok(sig) = ed25519_dalek::Signature::from_slice(&signature.0) else {
                    return false;
                };
                key.verify(message, &sig).is_ok()
            }
            PublicKey::Secp256k1(bytes) => {
                let Ok(key) = k256::ecdsa::VerifyingKey::from_sec1_bytes(bytes) else {
                    return false;
                };
                let Ok(sig) = k256::ecdsa::Signature::from_slice(&signature.0) else {
                    return false;
                };
                key.verify(message, &sig).is_ok()
            }
        }
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.key_type(), hex::encode(self.as_bytes()))
    }
}

/// A signature produced by a validator private key.
///
/// The byte layout depends on the scheme (64 bytes for Ed25519, fixed-size
/// DER-less encoding for secp256k1); consumers only compare and transport
/// the raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    /// An empty (absent) signature.
    pub fn empty() -> Self {
        Signature(Vec::new())
    }

    /// Whether the signature carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// View the raw signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A validator private key for one of the supported schemes.
pub enum PrivateKey {
    /// Ed25519 signing key
    Ed25519(ed25519_dalek::SigningKey),
    /// secp256k1 signing key
    Secp256k1(k256::ecdsa::SigningKey),
}

impl PrivateKey {
    /// Generate a fresh Ed25519 key from the OS RNG.
    pub fn generate_ed25519() -> Self {
        PrivateKey::Ed25519(ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng))
    }

    /// Generate a fresh secp256k1 key from the OS RNG.
    pub fn generate_secp256k1() -> Self {
        PrivateKey::Secp256k1(k256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng))
    }

    /// Deterministically derive an Ed25519 key from a 32-byte seed.
    ///
    /// Intended for tests that need reproducible validator identities.
    pub fn from_seed_ed25519(seed: [u8; 32]) -> Self {
        PrivateKey::Ed25519(ed25519_dalek::SigningKey::from_bytes(&seed))
    }

    /// The key scheme of this private key.
    pub fn key_type(&self) -> KeyType {
        match self {
            PrivateKey::Ed25519(_) => KeyType::Ed25519,
            PrivateKey::Secp256k1(_) => KeyType::Secp256k1,
        }
    }

    /// The matching public key.
    pub fn public_key(&self) -> PublicKey {
        match self {
            PrivateKey::Ed25519(key) => PublicKey::Ed25519(key.verifying_key().to_bytes()),
            PrivateKey::Secp256k1(key) => PublicKey::Secp256k1(
                key.verifying_key()
                    .to_encoded_point(true)
                    .as_bytes()
                    .to_vec(),
            ),
        }
    }

    /// Sign `message`, producing a scheme-specific signature.
    pub fn sign(&self, message: &[u8]) -> Signature {
        match self {
            PrivateKey::Ed25519(key) => {
                use ed25519_dalek::Signer as _;
                Signature(key.sign(message).to_bytes().to_vec())
            }
            PrivateKey::Secp256k1(key) => {
                let sig: k256::ecdsa::Signature = key.sign(message);
                Signature(sig.to_bytes().to_vec())
            }
        }
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("key_type", &self.key_type())
            .finish_non_exhaustive()
    }
}
