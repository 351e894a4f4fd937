//! Hook registry: signed manifests binding hook stages to script hashes.
//!
//! Hook manifests ride the RSL like everything else, so verified hook
//! distribution needs no side channel. A new manifest for a stage
//! supersedes the previous one; nothing is edited in place.
//!
//! Hook verification is *advisory* at commit time: a content mismatch is
//! reported but the surrounding commit proceeds. Materializing hooks into
//! `.git/hooks` is stricter — only scripts matching their manifest are
//! installed.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::sha256_hex;
use crate::engine::VerificationResult;
use crate::errors::{Result, SealError};
use crate::fs_guard;
use crate::rsl::{EntryKind, ReferenceStateLog};

/// Hook scripts are small; anything over this is not a hook.
pub const MAX_HOOK_SCRIPT_BYTES: u64 = 1024 * 1024;

/// A signed binding of a hook stage to an authorized script hash.
/// Immutable once recorded; superseded by a later entry for the same stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookManifestEntry {
    /// Hook stage name, e.g. `pre-commit`.
    pub stage: String,
    /// Hex SHA-256 of the authorized script content.
    pub script_sha256: String,
    /// Key ID of the registering signer.
    pub signer: String,
    /// A disabled manifest suppresses the hook without deleting history.
    pub enabled: bool,
}

/// Hashes a hook script from disk: symlink-refusing, size-bounded,
/// streaming SHA-256.
pub fn hash_script(path: &Path) -> Result<String> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Err(SealError::UnsafeFile(format!(
            "refusing to hash symlink: {}",
            path.display()
        )));
    }
    if meta.len() > MAX_HOOK_SCRIPT_BYTES {
        return Err(SealError::UnsafeFile(format!(
            "hook script too large: {} ({} bytes, max {MAX_HOOK_SCRIPT_BYTES})",
            path.display(),
            meta.len()
        )));
    }
    let mut f = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Materialized view of hook manifests, rebuilt by replaying the RSL.
#[derive(Debug, Default)]
pub struct HookRegistry {
    /// Stage -> (entry seq, latest manifest).
    entries: BTreeMap<String, (u64, HookManifestEntry)>,
}

impl HookRegistry {
    /// Rebuilds the registry from the log. Later entries supersede earlier
    /// ones for the same stage; the result is independent of replay batching.
    pub fn replay(log: &ReferenceStateLog) -> Self {
        let mut entries = BTreeMap::new();
        for entry in log.entries() {
            if let EntryKind::HookUpdate { manifest } = &entry.kind {
                entries.insert(manifest.stage.clone(), (entry.seq, manifest.clone()));
            }
        }
        Self { entries }
    }

    /// Latest manifest for a stage, or `None` if never registered.
    pub fn resolve(&self, stage: &str) -> Option<&HookManifestEntry> {
        self.entries.get(stage).map(|(_, m)| m)
    }

    pub fn stages(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Compares actual script content against the registered manifest.
    ///
    /// A mismatch is a rejection, but callers in the commit path treat it
    /// as a warning: commit proceeds regardless. With no manifest (or a
    /// disabled one) there is nothing to check and the script is accepted.
    pub fn verify_before_execution(&self, stage: &str, script: &[u8]) -> VerificationResult {
        match self.entries.get(stage) {
            None => VerificationResult::accepted_with_reason(
                None,
                format!("no manifest registered for stage '{stage}'"),
            ),
            Some((seq, manifest)) if !manifest.enabled => VerificationResult::accepted_with_reason(
                Some(*seq),
                format!("manifest for stage '{stage}' is disabled"),
            ),
            Some((seq, manifest)) => {
                let actual = sha256_hex(script);
                if actual == manifest.script_sha256 {
                    VerificationResult::accepted(Some(*seq))
                } else {
                    VerificationResult::rejected(
                        Some(*seq),
                        SealError::HookIntegrity {
                            stage: stage.to_string(),
                            expected: manifest.script_sha256.clone(),
                            actual,
                        }
                        .to_string(),
                    )
                }
            }
        }
    }

    /// Installs every enabled, content-verified hook from `scripts_dir`
    /// into `git_hooks_dir`. Scripts failing verification are skipped, not
    /// installed; per-stage results are returned for reporting.
    pub fn materialize_into(
        &self,
        scripts_dir: &Path,
        git_hooks_dir: &Path,
    ) -> Result<Vec<(String, VerificationResult)>> {
        fs::create_dir_all(git_hooks_dir)?;
        let mut results = Vec::new();
        for (stage, (_, manifest)) in &self.entries {
            if !manifest.enabled {
                continue;
            }
            let src = scripts_dir.join(stage);
            let script = fs_guard::read_validated(&src, MAX_HOOK_SCRIPT_BYTES)?;
            let result = self.verify_before_execution(stage, &script);
            if result.accepted {
                let dst = git_hooks_dir.join(stage);
                fs::write(&dst, &script)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(&dst, fs::Permissions::from_mode(0o755))?;
                }
            }
            results.push((stage.clone(), result));
        }
        Ok(results)
    }
}
