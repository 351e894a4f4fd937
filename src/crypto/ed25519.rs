//! Ed25519 signing and verification using `ed25519-dalek`.
//!
//! Verification uses `verify_strict()`, which rejects weak public keys and
//! non-canonical signatures. Signing keys are loaded from 32-byte raw seeds
//! (or their hex encoding) through the guarded reader; key generation itself
//! is delegated to external tooling (`ssh-keygen`, CI secrets) and is out of
//! scope here.

use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

use crate::crypto::{PublicKeyBytes, SignatureBytes};
use crate::errors::{Result, SealError};
use crate::fs_guard;

/// Maximum key file size. A raw seed is 32 bytes, hex is 64 (plus newline);
/// anything larger is not a key.
const MAX_KEY_FILE_BYTES: u64 = 1024;

/// An Ed25519 signing keypair with its derived key ID.
pub struct Keypair {
    signing: SigningKey,
    key_id: String,
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair(key_id={})", self.key_id)
    }
}

impl Keypair {
    /// Builds a keypair from a 32-byte seed.
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        let seed: &[u8; 32] = seed.try_into().map_err(|_| {
            SealError::KeyMaterial(format!(
                "Ed25519 seed must be 32 bytes, got {}",
                seed.len()
            ))
        })?;
        let signing = SigningKey::from_bytes(seed);
        let key_id = PublicKeyBytes(signing.verifying_key().to_bytes().to_vec()).key_id();
        Ok(Self { signing, key_id })
    }

    /// Loads a keypair from a file holding a raw 32-byte seed or its hex
    /// encoding (trailing whitespace tolerated).
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs_guard::read_validated(path, MAX_KEY_FILE_BYTES)?;
        if bytes.len() == 32 {
            return Self::from_seed(&bytes);
        }
        let text = std::str::from_utf8(&bytes)
            .map_err(|_| SealError::KeyMaterial("key file is neither raw nor hex".into()))?;
        let decoded = hex::decode(text.trim())
            .map_err(|e| SealError::KeyMaterial(format!("invalid hex seed: {e}")))?;
        Self::from_seed(&decoded)
    }

    /// Stable identity of this key (hex SHA-256 of the public key).
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn public_key(&self) -> PublicKeyBytes {
        PublicKeyBytes(self.signing.verifying_key().to_bytes().to_vec())
    }

    /// Signs `message`, returning a detached signature.
    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        SignatureBytes(self.signing.sign(message).to_bytes().to_vec())
    }
}

/// Verifies a detached signature.
///
/// Returns `Ok(true)` for a valid signature, `Ok(false)` for a well-formed
/// but non-matching one, and `Err` when the key or signature bytes are
/// malformed. Callers decide how to report `false` — the crypto layer does
/// not know which RSL entry it is verifying.
pub fn verify_detached(
    public_key: &PublicKeyBytes,
    message: &[u8],
    signature: &SignatureBytes,
) -> Result<bool> {
    let pk_bytes: &[u8; 32] = public_key.0.as_slice().try_into().map_err(|_| {
        SealError::KeyMaterial(format!(
            "Ed25519 public key must be 32 bytes, got {}",
            public_key.0.len()
        ))
    })?;
    let vk = VerifyingKey::from_bytes(pk_bytes)
        .map_err(|e| SealError::KeyMaterial(format!("invalid Ed25519 public key: {e}")))?;

    let sig = match Signature::try_from(signature.0.as_slice()) {
        Ok(sig) => sig,
        // Malformed signature bytes are an invalid signature, not an error:
        // attacker-controlled data must not abort chain verification early.
        Err(_) => return Ok(false),
    };

    Ok(vk.verify_strict(message, &sig).is_ok())
}
