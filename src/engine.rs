//! Verification engine: drives accept/reject decisions around clone, pull,
//! commit, and push.
//!
//! Each operation kind is a tagged variant carrying its own state
//! transitions. Clone verifies the fetched chain in full; pull verifies
//! only the delta against the already-trusted local tip; commit runs
//! advisory checks (hook integrity, author authorization) that warn but
//! never block local history; push appends, signs, and propagates under
//! optimistic concurrency, re-anchoring on conflict instead of ever
//! force-overwriting the chain.
//!
//! Commit-time checks are advisory; the same violations are hard failures
//! once an entry crosses a repository boundary at push or pull.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::crypto::{sha256_hex, Keypair};
use crate::errors::{Result, SealError};
use crate::git::RslRemote;
use crate::hooks::{HookManifestEntry, HookRegistry};
use crate::metadata::{MetadataStore, PolicyDocument, ROLE_PUSH};
use crate::rsl::{EntryKind, ReferenceStateLog, RslEntry, REF_HOOKS, REF_POLICY};

/// Outcome of one verification call. Ephemeral; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub accepted: bool,
    /// Why a rejection happened, or a note qualifying an acceptance.
    pub reason: Option<String>,
    /// RSL sequence number the verification was anchored at.
    pub anchor_seq: Option<u64>,
}

impl VerificationResult {
    pub fn accepted(anchor_seq: Option<u64>) -> Self {
        Self {
            accepted: true,
            reason: None,
            anchor_seq,
        }
    }

    pub fn accepted_with_reason(anchor_seq: Option<u64>, reason: String) -> Self {
        Self {
            accepted: true,
            reason: Some(reason),
            anchor_seq,
        }
    }

    pub fn rejected(anchor_seq: Option<u64>, reason: String) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
            anchor_seq,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneState {
    Fetching,
    VerifyingChain,
    Materializing,
    Done,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullState {
    FetchingDelta,
    VerifyingDelta,
    Merging,
    Done,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    RunningHooks,
    CheckingPolicy,
    Recorded,
    Warned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    Appending,
    SigningEntry,
    Propagating,
    Done,
    Conflict,
}

/// Operation kind, each variant carrying its own state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Clone(CloneState),
    Pull(PullState),
    Commit(CommitState),
    Push(PushState),
}

fn trace(state: OperationState) {
    debug!(?state, "verification state");
}

/// Engine configuration: network deadlines and retry bounds.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Deadline for each remote fetch/publish call.
    pub network_timeout: Duration,
    /// Bounded retries for conflicts and timeouts; integrity failures are
    /// never retried.
    pub max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network_timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

/// Outcome of commit-time advisory verification.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub state: CommitState,
    pub hook: VerificationResult,
    pub policy: VerificationResult,
}

impl CommitOutcome {
    /// Human-readable warnings for the commit path to print.
    pub fn warnings(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if !self.hook.accepted {
            if let Some(r) = self.hook.reason.as_deref() {
                out.push(r);
            }
        }
        if !self.policy.accepted {
            if let Some(r) = self.policy.reason.as_deref() {
                out.push(r);
            }
        }
        out
    }
}

/// The verification engine: a trusted local RSL view plus the remote it
/// synchronizes with.
pub struct Engine<R: RslRemote> {
    log: ReferenceStateLog,
    remote: R,
    config: EngineConfig,
}

impl<R: RslRemote> std::fmt::Debug for Engine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("tip_seq", &self.log.tip_seq())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<R: RslRemote> Engine<R> {
    /// Wraps an already-trusted local log (e.g. reloaded from disk).
    pub fn with_log(log: ReferenceStateLog, remote: R, config: EngineConfig) -> Self {
        Self {
            log,
            remote,
            config,
        }
    }

    pub fn log(&self) -> &ReferenceStateLog {
        &self.log
    }

    pub fn into_log(self) -> ReferenceStateLog {
        self.log
    }

    /// Current hook registry view, rebuilt by replay.
    pub fn hook_registry(&self) -> HookRegistry {
        HookRegistry::replay(&self.log)
    }

    /// Current metadata store view, rebuilt by replay.
    pub fn metadata(&self) -> MetadataStore {
        MetadataStore::replay(&self.log)
    }

    /// Bounded retry around a remote fetch: transient timeouts are retried
    /// up to the configured budget, everything else propagates.
    fn fetch_with_retry(
        remote: &R,
        after: Option<u64>,
        config: &EngineConfig,
    ) -> Result<Vec<RslEntry>> {
        let mut attempts = 0;
        loop {
            match remote.fetch_since(after, config.network_timeout) {
                Ok(entries) => return Ok(entries),
                Err(e) if e.is_retryable() && attempts < config.max_retries => {
                    attempts += 1;
                    warn!(attempt = attempts, error = %e, "fetch failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Clone: fetch the full RSL, verify the chain from genesis, and
    /// materialize a trusted local view only if verification passes.
    pub fn clone_from(remote: R, config: EngineConfig) -> Result<(Self, VerificationResult)> {
        trace(OperationState::Clone(CloneState::Fetching));
        let entries = Self::fetch_with_retry(&remote, None, &config)?;

        trace(OperationState::Clone(CloneState::VerifyingChain));
        let log = ReferenceStateLog::from_entries(entries)?;
        if !log.is_empty() {
            if let Err(e) = log.verify_chain(0, log.len() - 1) {
                trace(OperationState::Clone(CloneState::Rejected));
                return Err(e);
            }
        }

        trace(OperationState::Clone(CloneState::Materializing));
        let anchor = log.tip_seq();
        let engine = Self::with_log(log, remote, config);
        trace(OperationState::Clone(CloneState::Done));
        info!(anchor_seq = ?anchor, "clone verified");
        Ok((engine, VerificationResult::accepted(anchor)))
    }

    /// Pull: fetch entries past the trusted local tip and verify only that
    /// delta. The segment must chain from the known tip — verification is
    /// incremental, not a replay from genesis. A segment that fails to
    /// verify is discarded whole; the trusted view is swapped only after
    /// every new entry has been checked.
    pub fn pull(&mut self) -> Result<VerificationResult> {
        trace(OperationState::Pull(PullState::FetchingDelta));
        let delta = Self::fetch_with_retry(&self.remote, self.log.tip_seq(), &self.config)?;
        if delta.is_empty() {
            trace(OperationState::Pull(PullState::Done));
            return Ok(VerificationResult::accepted(self.log.tip_seq()));
        }

        trace(OperationState::Pull(PullState::VerifyingDelta));
        let mut scratch = self.log.clone();
        for entry in delta {
            let expected = scratch.tip_seq();
            if let Err(e) = scratch.append_prepared(entry, expected) {
                trace(OperationState::Pull(PullState::Rejected));
                return Err(match e {
                    // A delta that does not extend our tip is a broken
                    // chain from this client's point of view.
                    SealError::Conflict { ref_name, .. } => SealError::ChainIntegrity {
                        seq: expected.map_or(0, |s| s + 1),
                        details: format!("fetched segment does not chain from local tip ({ref_name})"),
                    },
                    other => other,
                });
            }
        }

        trace(OperationState::Pull(PullState::Merging));
        self.log = scratch;
        trace(OperationState::Pull(PullState::Done));
        info!(new_tip = ?self.log.tip_seq(), "pull verified");
        Ok(VerificationResult::accepted(self.log.tip_seq()))
    }

    /// Commit-time advisory verification: hook integrity and author
    /// authorization. Failures downgrade to `Warned` and never block the
    /// local commit; the same violations are hard failures at the
    /// push/pull boundary.
    pub fn preflight_commit(
        &self,
        stage: &str,
        script: Option<&[u8]>,
        author: &Keypair,
    ) -> CommitOutcome {
        trace(OperationState::Commit(CommitState::RunningHooks));
        let hook = match script {
            Some(content) => self.hook_registry().verify_before_execution(stage, content),
            None => VerificationResult::accepted_with_reason(
                None,
                format!("no '{stage}' hook present"),
            ),
        };

        trace(OperationState::Commit(CommitState::CheckingPolicy));
        let policy = match self.metadata().current_policy() {
            Ok(current) if current.authorizes(ROLE_PUSH, author.key_id()) => {
                VerificationResult::accepted(self.log.tip_seq())
            }
            Ok(current) => VerificationResult::rejected(
                self.log.tip_seq(),
                format!(
                    "author key {} not authorized for role '{ROLE_PUSH}' under policy version {}",
                    author.key_id(),
                    current.version
                ),
            ),
            Err(SealError::PolicyNotFound) => VerificationResult::rejected(
                None,
                "no trust root established; commit is unverified".into(),
            ),
            Err(e) => VerificationResult::rejected(self.log.tip_seq(), e.to_string()),
        };

        let state = if hook.accepted && policy.accepted {
            CommitState::Recorded
        } else {
            CommitState::Warned
        };
        trace(OperationState::Commit(state));
        let outcome = CommitOutcome {
            state,
            hook,
            policy,
        };
        for w in outcome.warnings() {
            warn!("{w}");
        }
        outcome
    }

    /// Push: record a reference advancement in the RSL and propagate it.
    pub fn push(
        &mut self,
        ref_name: &str,
        target: &str,
        signers: &[&Keypair],
    ) -> Result<RslEntry> {
        self.publish_entry(ref_name, target, EntryKind::RefUpdate, signers)
    }

    /// Registers a hook manifest as an RSL entry tagged for the hooks role.
    /// Fails at append if the signers lack that role's quorum.
    pub fn register_hook(
        &mut self,
        stage: &str,
        script_sha256: &str,
        signers: &[&Keypair],
    ) -> Result<RslEntry> {
        let signer = signers
            .first()
            .map(|k| k.key_id().to_string())
            .unwrap_or_default();
        let manifest = HookManifestEntry {
            stage: stage.to_string(),
            script_sha256: script_sha256.to_string(),
            signer,
            enabled: true,
        };
        self.publish_entry(
            REF_HOOKS,
            script_sha256,
            EntryKind::HookUpdate { manifest },
            signers,
        )
    }

    /// Rotates the policy. The append path enforces the *old* policy's
    /// quorum for the policy role, so rotation can never bypass the
    /// existing trust root.
    pub fn rotate_policy(
        &mut self,
        policy: PolicyDocument,
        signers: &[&Keypair],
    ) -> Result<RslEntry> {
        let target = sha256_hex(&serde_json::to_vec(&policy)?);
        self.publish_entry(REF_POLICY, &target, EntryKind::PolicyUpdate { policy }, signers)
    }

    /// Append-sign-propagate with bounded retry. The built entry is
    /// validated against a scratch copy of the trusted log *before* it is
    /// published: an entry that fails quorum or linkage leaves no side
    /// effects, locally or on the shared store. On a remote conflict the
    /// engine pulls to re-anchor against the new tip and rebuilds the
    /// entry; it never force-overwrites the chain. Timeouts are retried
    /// as-is. Integrity failures propagate immediately; a locally built
    /// entry that cannot meet its role's quorum surfaces as a policy
    /// violation rather than a signature failure on fetched data.
    fn publish_entry(
        &mut self,
        ref_name: &str,
        target: &str,
        kind: EntryKind,
        signers: &[&Keypair],
    ) -> Result<RslEntry> {
        let mut attempts = 0;
        loop {
            trace(OperationState::Push(PushState::Appending));
            trace(OperationState::Push(PushState::SigningEntry));
            let expected_tip = self.log.tip_seq();
            let entry = self
                .log
                .build_entry(ref_name, target, kind.clone(), signers)?;

            let mut scratch = self.log.clone();
            if let Err(e) = scratch.append_prepared(entry.clone(), expected_tip) {
                return Err(match e {
                    SealError::Signature { reason, .. } => SealError::PolicyViolation {
                        role: kind.required_role().to_string(),
                        details: reason,
                    },
                    other => other,
                });
            }

            trace(OperationState::Push(PushState::Propagating));
            match self.remote.publish(
                self.log.tip_hash()?,
                &entry,
                self.config.network_timeout,
            ) {
                Ok(()) => {
                    self.log = scratch;
                    trace(OperationState::Push(PushState::Done));
                    info!(seq = entry.seq, ref_name, "RSL entry propagated");
                    return Ok(entry);
                }
                Err(e) if e.is_retryable() && attempts < self.config.max_retries => {
                    attempts += 1;
                    warn!(attempt = attempts, error = %e, "propagation failed, retrying");
                    if matches!(e, SealError::Conflict { .. }) {
                        trace(OperationState::Push(PushState::Conflict));
                        self.pull()?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
