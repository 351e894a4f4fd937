//! Trust metadata: signed policy documents and the replay-built store.
//!
//! A [`PolicyDocument`] names the keys that exist and which roles they hold,
//! with a signature threshold per role. Policies are never edited in place:
//! a rotation appends a new version to the RSL, signed to the *previous*
//! version's quorum for the policy role. Removing a key is just rotating in
//! a document that omits it.
//!
//! The [`MetadataStore`] is a materialized view rebuilt by replaying the RSL
//! from genesis; the log remains the single source of truth for ordering.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::crypto::{self, PublicKeyBytes, SignatureBytes};
use crate::errors::{Result, SealError};
use crate::rsl::{EntryKind, EntrySignature, ReferenceStateLog};

/// Role gating policy rotations (the self-referential trust root).
pub const ROLE_POLICY: &str = "policy";
/// Role gating hook manifest updates.
pub const ROLE_HOOKS: &str = "hooks";
/// Role gating ordinary reference updates.
pub const ROLE_PUSH: &str = "push";

/// A set of authorized keys and the signature quorum for one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDefinition {
    /// Key IDs (hex SHA-256 of the public key) authorized for this role.
    pub key_ids: BTreeSet<String>,
    /// Minimum count of distinct authorized signatures required.
    pub threshold: u32,
}

/// A signed policy document: which keys exist, who may act, and with what
/// quorum. Superseded (never edited) by a newer version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Monotonically increasing version; rotations must advance it.
    pub version: u64,
    /// Key ID -> hex-encoded Ed25519 public key.
    pub keys: BTreeMap<String, String>,
    /// Role name -> authorized keys and threshold.
    pub roles: BTreeMap<String, RoleDefinition>,
}

impl PolicyDocument {
    /// Structural validation: every role references known key IDs, every
    /// key ID matches the digest of its public key, and thresholds are
    /// satisfiable.
    pub fn validate(&self) -> Result<()> {
        for (key_id, pub_hex) in &self.keys {
            let raw = hex::decode(pub_hex)
                .map_err(|e| SealError::PolicyMalformed(format!("key {key_id}: bad hex: {e}")))?;
            let derived = PublicKeyBytes(raw).key_id();
            if &derived != key_id {
                return Err(SealError::PolicyMalformed(format!(
                    "key ID {key_id} does not match its public key (expected {derived})"
                )));
            }
        }
        for (role, def) in &self.roles {
            if def.threshold == 0 {
                return Err(SealError::PolicyMalformed(format!(
                    "role '{role}' has threshold 0"
                )));
            }
            if (def.threshold as usize) > def.key_ids.len() {
                return Err(SealError::PolicyMalformed(format!(
                    "role '{role}' threshold {} exceeds its {} key(s)",
                    def.threshold,
                    def.key_ids.len()
                )));
            }
            for key_id in &def.key_ids {
                if !self.keys.contains_key(key_id) {
                    return Err(SealError::PolicyMalformed(format!(
                        "role '{role}' references unknown key {key_id}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether `key_id` may act under `role` at all (membership, not quorum).
    pub fn authorizes(&self, role: &str, key_id: &str) -> bool {
        self.roles
            .get(role)
            .is_some_and(|def| def.key_ids.contains(key_id))
    }

    /// Threshold-aware quorum check over a signed payload.
    ///
    /// A role is satisfied only if at least `threshold` *distinct* keys
    /// authorized for it produced valid signatures over `payload`.
    /// Signatures from unknown or unauthorized keys are ignored, not errors:
    /// an attacker must not be able to poison a quorum check by adding junk.
    pub fn quorum_satisfied(
        &self,
        role: &str,
        signatures: &[EntrySignature],
        payload: &[u8],
    ) -> Result<bool> {
        let Some(def) = self.roles.get(role) else {
            return Ok(false);
        };
        let mut counted: BTreeSet<&str> = BTreeSet::new();
        for sig in signatures {
            if counted.contains(sig.key_id.as_str()) || !def.key_ids.contains(&sig.key_id) {
                continue;
            }
            let Some(pub_hex) = self.keys.get(&sig.key_id) else {
                continue;
            };
            let public = PublicKeyBytes(hex::decode(pub_hex).map_err(|e| {
                SealError::PolicyMalformed(format!("key {}: bad hex: {e}", sig.key_id))
            })?);
            let raw_sig = match hex::decode(&sig.signature) {
                Ok(raw) => SignatureBytes(raw),
                Err(_) => continue,
            };
            if crypto::verify_detached(&public, payload, &raw_sig)? {
                counted.insert(&sig.key_id);
            }
        }
        Ok(counted.len() >= def.threshold as usize)
    }
}

/// Materialized view of policy history, rebuilt by replaying the RSL.
#[derive(Debug, Default)]
pub struct MetadataStore {
    /// (entry seq, document) in append order.
    policies: Vec<(u64, PolicyDocument)>,
}

impl MetadataStore {
    /// Rebuilds the store by replaying policy-update entries from genesis.
    /// Replay batching does not matter: the result depends only on entry
    /// order, which the log fixes.
    pub fn replay(log: &ReferenceStateLog) -> Self {
        let mut policies = Vec::new();
        for entry in log.entries() {
            if let EntryKind::PolicyUpdate { policy } = &entry.kind {
                policies.push((entry.seq, policy.clone()));
            }
        }
        Self { policies }
    }

    /// Latest policy, or `PolicyNotFound` before bootstrap.
    pub fn current_policy(&self) -> Result<&PolicyDocument> {
        self.policies
            .last()
            .map(|(_, p)| p)
            .ok_or(SealError::PolicyNotFound)
    }

    /// The policy in effect *before* the entry at `seq` was appended —
    /// the rules historical entries must be audited under. For the genesis
    /// policy entry itself there is no prior era and this returns `None`;
    /// that entry is validated against the document it carries.
    pub fn policy_before(&self, seq: u64) -> Option<&PolicyDocument> {
        self.policies
            .iter()
            .rev()
            .find(|(s, _)| *s < seq)
            .map(|(_, p)| p)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::Keypair;

    /// Builds a policy granting all three roles to `keys` with `threshold`.
    pub(crate) fn policy_for(keys: &[&Keypair], threshold: u32, version: u64) -> PolicyDocument {
        let mut key_map = BTreeMap::new();
        let mut ids = BTreeSet::new();
        for kp in keys {
            key_map.insert(kp.key_id().to_string(), kp.public_key().to_hex());
            ids.insert(kp.key_id().to_string());
        }
        let def = RoleDefinition {
            key_ids: ids,
            threshold,
        };
        let mut roles = BTreeMap::new();
        roles.insert(ROLE_POLICY.to_string(), def.clone());
        roles.insert(ROLE_HOOKS.to_string(), def.clone());
        roles.insert(ROLE_PUSH.to_string(), def);
        PolicyDocument {
            version,
            keys: key_map,
            roles,
        }
    }

    fn keypair(seed: u8) -> Keypair {
        Keypair::from_seed(&[seed; 32]).unwrap()
    }

    #[test]
    fn validate_accepts_well_formed_policy() {
        let a = keypair(1);
        policy_for(&[&a], 1, 1).validate().unwrap();
    }

    #[test]
    fn validate_rejects_unknown_key_in_role() {
        let a = keypair(1);
        let mut policy = policy_for(&[&a], 1, 1);
        policy
            .roles
            .get_mut(ROLE_PUSH)
            .unwrap()
            .key_ids
            .insert("deadbeef".into());
        assert!(policy.validate().is_err());
    }

    #[test]
    fn validate_rejects_mismatched_key_id() {
        let a = keypair(1);
        let b = keypair(2);
        let mut policy = policy_for(&[&a], 1, 1);
        // Re-bind a's key ID to b's public key.
        policy
            .keys
            .insert(a.key_id().to_string(), b.public_key().to_hex());
        assert!(policy.validate().is_err());
    }

    #[test]
    fn validate_rejects_unsatisfiable_threshold() {
        let a = keypair(1);
        let policy = policy_for(&[&a], 2, 1);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn quorum_needs_distinct_authorized_keys() {
        let a = keypair(1);
        let b = keypair(2);
        let policy = policy_for(&[&a, &b], 2, 1);
        let payload = b"payload";

        let sig_a = EntrySignature {
            key_id: a.key_id().to_string(),
            signature: hex::encode(a.sign(payload).0),
        };
        // One signer, even repeated, cannot meet a threshold of 2.
        assert!(!policy
            .quorum_satisfied(ROLE_HOOKS, &[sig_a.clone(), sig_a.clone()], payload)
            .unwrap());

        let sig_b = EntrySignature {
            key_id: b.key_id().to_string(),
            signature: hex::encode(b.sign(payload).0),
        };
        assert!(policy
            .quorum_satisfied(ROLE_HOOKS, &[sig_a, sig_b], payload)
            .unwrap());
    }

    #[test]
    fn quorum_ignores_unauthorized_signers() {
        let a = keypair(1);
        let outsider = keypair(9);
        let policy = policy_for(&[&a], 1, 1);
        let payload = b"payload";
        let sig = EntrySignature {
            key_id: outsider.key_id().to_string(),
            signature: hex::encode(outsider.sign(payload).0),
        };
        assert!(!policy.quorum_satisfied(ROLE_PUSH, &[sig], payload).unwrap());
    }

    #[test]
    fn quorum_rejects_invalid_signature_from_authorized_key() {
        let a = keypair(1);
        let policy = policy_for(&[&a], 1, 1);
        let sig = EntrySignature {
            key_id: a.key_id().to_string(),
            signature: hex::encode(a.sign(b"something else").0),
        };
        assert!(!policy
            .quorum_satisfied(ROLE_PUSH, &[sig], b"payload")
            .unwrap());
    }

    #[test]
    fn missing_role_is_not_satisfied() {
        let a = keypair(1);
        let mut policy = policy_for(&[&a], 1, 1);
        policy.roles.remove(ROLE_HOOKS);
        assert!(!policy.quorum_satisfied(ROLE_HOOKS, &[], b"x").unwrap());
    }

    #[test]
    fn empty_store_has_no_policy() {
        let store = MetadataStore::default();
        assert!(matches!(
            store.current_policy(),
            Err(SealError::PolicyNotFound)
        ));
    }
}
