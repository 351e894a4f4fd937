//! The Reference State Log: an append-only, hash-chained, signed record of
//! every reference update.
//!
//! Each entry links to its predecessor by SHA-256 and is signed to the
//! quorum of the policy *in effect at append time*, so historical entries
//! are always audited under the rules that applied when they were written.
//! The log is the single source of truth for ordering; the metadata store
//! and hook registry are views rebuilt by replaying it.
//!
//! Entries live in an arena indexed by sequence number, with a small side
//! index mapping reference name to its latest sequence number. Nothing in
//! the public API mutates or removes an appended entry.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::crypto::{sha256_hex, Keypair};
use crate::errors::{Result, SealError};
use crate::fs_guard;
use crate::hooks::HookManifestEntry;
use crate::metadata::{PolicyDocument, ROLE_HOOKS, ROLE_POLICY, ROLE_PUSH};

/// Reference under which policy documents are recorded.
pub const REF_POLICY: &str = "refs/gitseal/policy";
/// Reference under which hook manifests are recorded.
pub const REF_HOOKS: &str = "refs/gitseal/hooks";

/// Persisted log size bound (the log is line-delimited JSON).
const MAX_RSL_BYTES: u64 = 64 * 1024 * 1024;

/// What an entry records, beyond the reference advancement itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryKind {
    /// An ordinary branch tip advancement.
    RefUpdate,
    /// A new policy document superseding the previous version.
    PolicyUpdate { policy: PolicyDocument },
    /// A new hook manifest entry superseding the previous one for its stage.
    HookUpdate { manifest: HookManifestEntry },
}

impl EntryKind {
    /// The role whose quorum must sign an entry of this kind.
    pub fn required_role(&self) -> &'static str {
        match self {
            Self::RefUpdate => ROLE_PUSH,
            Self::PolicyUpdate { .. } => ROLE_POLICY,
            Self::HookUpdate { .. } => ROLE_HOOKS,
        }
    }
}

/// One signature over an entry's signing payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySignature {
    /// Key ID of the signer (hex SHA-256 of its public key).
    pub key_id: String,
    /// Hex-encoded detached Ed25519 signature.
    pub signature: String,
}

/// A single record in the reference state log. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RslEntry {
    /// Position in the log; strictly increasing, assigned on append.
    pub seq: u64,
    /// Reference this entry advances (e.g. `refs/heads/main`).
    pub ref_name: String,
    /// Target commit hash (or content hash, for policy/hook entries).
    pub target: String,
    /// Hash of the immediately prior entry; `None` only at genesis.
    pub prev_hash: Option<String>,
    /// Version of the policy document in effect at append time.
    pub policy_version: u64,
    /// RFC 3339 timestamp of the append.
    pub recorded_at: String,
    pub kind: EntryKind,
    pub signatures: Vec<EntrySignature>,
}

impl RslEntry {
    /// Canonical bytes covered by signatures: the entry with its signature
    /// list emptied. Field order is fixed by the struct definition and all
    /// policy maps are ordered, so serialization is deterministic.
    pub fn signing_payload(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signatures.clear();
        Ok(serde_json::to_vec(&unsigned)?)
    }

    /// Hash of the complete entry, signatures included, so tampering with
    /// a signature list also breaks the chain link of the next entry.
    pub fn entry_hash(&self) -> Result<String> {
        Ok(sha256_hex(&serde_json::to_vec(self)?))
    }
}

/// The append-only log and its reference-name index.
#[derive(Debug, Default, Clone)]
pub struct ReferenceStateLog {
    entries: Vec<RslEntry>,
    ref_index: HashMap<String, u64>,
}

impl ReferenceStateLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[RslEntry] {
        &self.entries
    }

    pub fn get(&self, seq: u64) -> Option<&RslEntry> {
        self.entries.get(usize::try_from(seq).ok()?)
    }

    /// The last entry in the log, regardless of reference.
    pub fn tip(&self) -> Option<&RslEntry> {
        self.entries.last()
    }

    pub fn tip_seq(&self) -> Option<u64> {
        self.tip().map(|e| e.seq)
    }

    /// Hash of the current tip entry, the value the next append must link to.
    pub fn tip_hash(&self) -> Result<Option<String>> {
        self.tip().map(RslEntry::entry_hash).transpose()
    }

    /// Latest entry for a reference, or `None` if never recorded.
    pub fn tip_for(&self, ref_name: &str) -> Option<&RslEntry> {
        let seq = *self.ref_index.get(ref_name)?;
        self.get(seq)
    }

    /// The policy in effect before position `seq` (latest policy-update
    /// entry strictly below it).
    fn policy_before(&self, seq: u64) -> Option<&PolicyDocument> {
        self.entries[..usize::try_from(seq).ok()?]
            .iter()
            .rev()
            .find_map(|e| match &e.kind {
                EntryKind::PolicyUpdate { policy } => Some(policy),
                _ => None,
            })
    }

    /// Builds and signs a new entry linked to the current tip, without
    /// appending it. The caller publishes it (compare-and-swap against the
    /// remote) before committing it locally via [`append_prepared`].
    ///
    /// [`append_prepared`]: ReferenceStateLog::append_prepared
    pub fn build_entry(
        &self,
        ref_name: &str,
        target: &str,
        kind: EntryKind,
        signers: &[&Keypair],
    ) -> Result<RslEntry> {
        let seq = self.len();
        let policy_version = match (&kind, self.policy_before(seq)) {
            // Rotations record the superseded version; genesis records its own.
            (_, Some(active)) => active.version,
            (EntryKind::PolicyUpdate { policy }, None) => policy.version,
            (_, None) => return Err(SealError::PolicyNotFound),
        };

        let mut entry = RslEntry {
            seq,
            ref_name: ref_name.to_string(),
            target: target.to_string(),
            prev_hash: self.tip_hash()?,
            policy_version,
            recorded_at: OffsetDateTime::now_utc().format(&Rfc3339)?,
            kind,
            signatures: Vec::new(),
        };

        let payload = entry.signing_payload()?;
        for signer in signers {
            entry.signatures.push(EntrySignature {
                key_id: signer.key_id().to_string(),
                signature: hex::encode(signer.sign(&payload).0),
            });
        }
        Ok(entry)
    }

    /// Appends a prepared entry after re-validating it against the current
    /// tip. `expected_tip` is the tip sequence the caller observed when it
    /// built the entry; a mismatch means a concurrent append won the race.
    pub fn append_prepared(&mut self, entry: RslEntry, expected_tip: Option<u64>) -> Result<()> {
        if self.tip_seq() != expected_tip {
            return Err(SealError::Conflict {
                ref_name: entry.ref_name,
                expected: expected_tip,
                found: self.tip_seq(),
            });
        }
        if entry.seq != self.len() {
            return Err(SealError::ChainIntegrity {
                seq: entry.seq,
                details: format!("entry seq {} does not extend log of {} entries", entry.seq, self.len()),
            });
        }
        self.check_links(&entry)?;
        self.check_signatures(&entry)?;
        self.ref_index.insert(entry.ref_name.clone(), entry.seq);
        self.entries.push(entry);
        Ok(())
    }

    /// Builds, signs, and appends in one step: the `append` contract.
    /// Fails with a conflict if the tip moved past `expected_tip`.
    pub fn append(
        &mut self,
        ref_name: &str,
        target: &str,
        kind: EntryKind,
        signers: &[&Keypair],
        expected_tip: Option<u64>,
    ) -> Result<RslEntry> {
        if self.tip_seq() != expected_tip {
            return Err(SealError::Conflict {
                ref_name: ref_name.to_string(),
                expected: expected_tip,
                found: self.tip_seq(),
            });
        }
        let entry = self.build_entry(ref_name, target, kind, signers)?;
        self.append_prepared(entry.clone(), expected_tip)?;
        Ok(entry)
    }

    /// Verifies the hash chain and every signature over `[from_seq, to_seq]`
    /// (inclusive), walking strictly in sequence order. Signatures are
    /// checked against the policy in effect at each entry's position, not
    /// the latest one.
    pub fn verify_chain(&self, from_seq: u64, to_seq: u64) -> Result<()> {
        if from_seq > to_seq || to_seq >= self.len() {
            return Err(SealError::ChainIntegrity {
                seq: to_seq,
                details: format!(
                    "verification range {from_seq}..={to_seq} outside log of {} entries",
                    self.len()
                ),
            });
        }
        for seq in from_seq..=to_seq {
            let entry = self.get(seq).ok_or(SealError::ChainIntegrity {
                seq,
                details: "entry missing from arena".into(),
            })?;
            if entry.seq != seq {
                return Err(SealError::ChainIntegrity {
                    seq,
                    details: format!("entry records seq {} at position {seq}", entry.seq),
                });
            }
            self.check_links(entry)?;
            self.check_signatures(entry)?;
        }
        Ok(())
    }

    /// Hash-chain structure checks for one entry against its predecessor.
    fn check_links(&self, entry: &RslEntry) -> Result<()> {
        if entry.seq == 0 {
            if entry.prev_hash.is_some() {
                return Err(SealError::ChainIntegrity {
                    seq: 0,
                    details: "genesis entry carries a predecessor hash".into(),
                });
            }
            if !matches!(entry.kind, EntryKind::PolicyUpdate { .. }) {
                return Err(SealError::ChainIntegrity {
                    seq: 0,
                    details: "genesis entry must establish a trust root".into(),
                });
            }
            return Ok(());
        }
        let prev = self.get(entry.seq - 1).ok_or(SealError::ChainIntegrity {
            seq: entry.seq,
            details: "predecessor entry missing".into(),
        })?;
        let expected = prev.entry_hash()?;
        if entry.prev_hash.as_deref() != Some(expected.as_str()) {
            return Err(SealError::ChainIntegrity {
                seq: entry.seq,
                details: format!(
                    "predecessor hash mismatch: entry links to {}, predecessor hashes to {expected}",
                    entry.prev_hash.as_deref().unwrap_or("<none>")
                ),
            });
        }
        Ok(())
    }

    /// Signature and authorization checks for one entry under its era's
    /// policy. Rotations must satisfy the *old* policy's quorum for the
    /// policy role and advance the version; the genesis document is
    /// validated against itself (trust on first use).
    fn check_signatures(&self, entry: &RslEntry) -> Result<()> {
        let role = entry.kind.required_role();
        let payload = entry.signing_payload()?;

        let era_policy = self.policy_before(entry.seq);
        let governing = match (era_policy, &entry.kind) {
            (Some(active), EntryKind::PolicyUpdate { policy }) => {
                policy.validate().map_err(|e| SealError::Signature {
                    seq: entry.seq,
                    reason: e.to_string(),
                })?;
                if policy.version <= active.version {
                    return Err(SealError::ChainIntegrity {
                        seq: entry.seq,
                        details: format!(
                            "policy version did not advance: {} -> {}",
                            active.version, policy.version
                        ),
                    });
                }
                active
            }
            (Some(active), _) => active,
            (None, EntryKind::PolicyUpdate { policy }) => {
                policy.validate().map_err(|e| SealError::Signature {
                    seq: entry.seq,
                    reason: e.to_string(),
                })?;
                policy
            }
            (None, _) => return Err(SealError::PolicyNotFound),
        };

        if entry.policy_version != governing.version {
            return Err(SealError::ChainIntegrity {
                seq: entry.seq,
                details: format!(
                    "entry records policy version {}, era policy is version {}",
                    entry.policy_version, governing.version
                ),
            });
        }

        if !governing.quorum_satisfied(role, &entry.signatures, &payload)? {
            return Err(SealError::Signature {
                seq: entry.seq,
                reason: format!(
                    "quorum not met for role '{role}' under policy version {}",
                    governing.version
                ),
            });
        }
        Ok(())
    }

    /// Builds a log from fetched entries. Structural only (sequence order
    /// and index rebuild): callers run `verify_chain` before trusting it.
    pub fn from_entries(entries: Vec<RslEntry>) -> Result<Self> {
        let mut log = Self::new();
        for (idx, entry) in entries.into_iter().enumerate() {
            if entry.seq != idx as u64 {
                return Err(SealError::ChainIntegrity {
                    seq: idx as u64,
                    details: format!("fetched entry out of order (records seq {})", entry.seq),
                });
            }
            log.ref_index.insert(entry.ref_name.clone(), entry.seq);
            log.entries.push(entry);
        }
        Ok(log)
    }

    /// Persists the log as line-delimited JSON, written atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, out)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Loads a persisted log. Structural only: callers run `verify_chain`
    /// before trusting the result.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs_guard::read_validated(path, MAX_RSL_BYTES)?;
        let text = String::from_utf8(bytes)?;
        let mut log = Self::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: RslEntry = serde_json::from_str(line)?;
            if entry.seq != log.len() {
                return Err(SealError::ChainIntegrity {
                    seq: log.len(),
                    details: format!("persisted entry out of order (records seq {})", entry.seq),
                });
            }
            log.ref_index.insert(entry.ref_name.clone(), entry.seq);
            log.entries.push(entry);
        }
        Ok(log)
    }
}
