//! Signing and digest layer for gitseal.
//!
//! Every RSL entry is signed with Ed25519 and chained with SHA-256. Keys are
//! identified by the hex SHA-256 of their public key bytes, so policy
//! documents can authorize keys without embedding them twice.
//!
//! The byte wrappers here do not implement `Display` and redact their
//! contents in `Debug` output, preventing accidental leakage of key or
//! signature material via logs and error reports.

pub mod ed25519;

pub use ed25519::{verify_detached, Keypair};

use sha2::{Digest, Sha256};

/// Opaque wrapper for Ed25519 public key bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKeyBytes(pub Vec<u8>);

impl std::fmt::Debug for PublicKeyBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKeyBytes([{} bytes])", self.0.len())
    }
}

impl PublicKeyBytes {
    /// Hex encoding, as stored in policy documents.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Stable identity of this key: hex SHA-256 of the raw public key bytes.
    pub fn key_id(&self) -> String {
        sha256_hex(&self.0)
    }
}

/// Opaque wrapper for signature bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct SignatureBytes(pub Vec<u8>);

impl std::fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SignatureBytes([{} bytes])", self.0.len())
    }
}

/// Hex-encoded SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
