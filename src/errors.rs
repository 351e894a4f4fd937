//! Error taxonomy for gitseal operations.
//!
//! Every failure mode a caller can act on has its own variant. Retryable
//! conditions (`Conflict`, `Timeout`) are distinguished from fatal integrity
//! failures (`ChainIntegrity`, `Signature`), and advisory conditions
//! (`HookIntegrity`) carry enough detail to report without aborting the
//! surrounding operation. Error messages never include key material.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the RSL, metadata, and verification layers.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum SealError {
    /// A concurrent writer advanced the tip between read and append.
    /// Retryable: pull to re-anchor, then append again.
    #[error("concurrent update on '{ref_name}': expected tip seq {expected:?}, found {found:?}")]
    Conflict {
        ref_name: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    /// The hash chain is broken. Fatal; requires manual audit.
    #[error("hash chain broken at seq {seq}: {details}")]
    ChainIntegrity { seq: u64, details: String },

    /// An entry's signatures are invalid or do not meet the quorum of the
    /// policy in effect at that point in history. Fatal for the entry.
    #[error("signature rejected at seq {seq}: {reason}")]
    Signature { seq: u64, reason: String },

    /// The log holds no policy document; no trust root is established.
    #[error("no trust root: the log contains no policy document")]
    PolicyNotFound,

    /// A signer lacks the role required for the attempted action.
    #[error("unauthorized for role '{role}': {details}")]
    PolicyViolation { role: String, details: String },

    /// Hook script content does not match its registered manifest hash.
    /// Advisory at commit time; enforced at the push/pull boundary.
    #[error("hook '{stage}' content mismatch: registered {expected}, found {actual}")]
    HookIntegrity {
        stage: String,
        expected: String,
        actual: String,
    },

    /// A network operation exceeded its caller-supplied deadline. Retryable.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    /// Key bytes are malformed (wrong length, invalid encoding, weak key).
    #[error("invalid key material: {0}")]
    KeyMaterial(String),

    /// The policy document itself is malformed (unknown key IDs in a role,
    /// threshold larger than the key set, version not advancing).
    #[error("invalid policy document: {0}")]
    PolicyMalformed(String),

    /// A file failed the guarded-read checks (symlink, over size limit).
    #[error("{0}")]
    UnsafeFile(String),

    /// An underlying `git` invocation exited non-zero. The stderr carried
    /// here has already been truncated and redacted.
    #[error("git {command} failed: {stderr}")]
    GitCommand { command: String, stderr: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Persisted log data is not valid UTF-8. Surfaced rather than decoded
    /// lossily: silent replacement would mask tampering.
    #[error("persisted log is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("timestamp formatting error: {0}")]
    Time(#[from] time::error::Format),
}

impl SealError {
    /// True for transient failures the adapter layer may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Timeout { .. })
    }

    /// Process exit code for scripting and CI gating. Each rejection kind
    /// gets a distinct code so callers can branch without parsing output.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ChainIntegrity { .. } => 2,
            Self::Signature { .. } => 3,
            Self::HookIntegrity { .. } => 4,
            Self::PolicyViolation { .. } | Self::PolicyNotFound | Self::PolicyMalformed(_) => 5,
            Self::Conflict { .. } => 6,
            Self::Timeout { .. } => 7,
            _ => 1,
        }
    }
}

/// Result type for gitseal operations.
pub type Result<T> = std::result::Result<T, SealError>;
