//! Git operation adapter: the thin seam between the verification core and
//! the underlying version-control primitives.
//!
//! Two capabilities are consumed through traits. [`GitTransport`] is the
//! ordinary clone/fetch/commit/push surface, backed by the `git` binary
//! with caller-supplied deadlines and sanitized stderr. [`RslRemote`] is
//! the authoritative multi-writer store for RSL entries: publication is
//! compare-and-swap against the remote tip hash, so a lost race surfaces
//! as a retryable conflict instead of ever rewriting the chain.
//!
//! The remote stores are deliberately dumb — all verification is
//! client-side, against the locally trusted view.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::debug;

use crate::errors::{Result, SealError};
use crate::fs_guard;
use crate::rsl::RslEntry;

const MAX_TOOL_ERR_BYTES: usize = 8 * 1024;
const MAX_REMOTE_RSL_BYTES: u64 = 64 * 1024 * 1024;
const LOCK_POLL: Duration = Duration::from_millis(25);

/// Authoritative store for RSL entries, shared by every writer.
pub trait RslRemote {
    /// Entries with sequence number strictly greater than `after`
    /// (`None` fetches the whole log).
    fn fetch_since(&self, after: Option<u64>, timeout: Duration) -> Result<Vec<RslEntry>>;

    /// Appends `entry` iff the remote tip entry still hashes to
    /// `expected_tip_hash` (`None` means the remote log must be empty).
    /// A mismatch is a conflict: some other writer advanced the tip.
    fn publish(
        &self,
        expected_tip_hash: Option<String>,
        entry: &RslEntry,
        timeout: Duration,
    ) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory remote (tests, demos)

#[derive(Default)]
struct MemoryInner {
    entries: Vec<RslEntry>,
    fail_publishes: bool,
    fail_next_fetches: u32,
    publish_attempts: u32,
}

/// In-memory multi-writer remote. `Clone` shares the underlying store, so
/// several engines can race against the same log.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        // A poisoned lock means another writer panicked mid-publish; the
        // data itself is still a consistent Vec.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Makes every subsequent publish time out (network-stall simulation).
    pub fn fail_publishes_with_timeout(&self) {
        self.lock().fail_publishes = true;
    }

    /// Makes the next `n` fetches time out (transient network stall).
    pub fn fail_fetches_with_timeout(&self, n: u32) {
        self.lock().fail_next_fetches = n;
    }

    pub fn publish_attempts(&self) -> u32 {
        self.lock().publish_attempts
    }

    pub fn len(&self) -> u64 {
        self.lock().entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}

impl RslRemote for MemoryRemote {
    fn fetch_since(&self, after: Option<u64>, timeout: Duration) -> Result<Vec<RslEntry>> {
        let mut inner = self.lock();
        if inner.fail_next_fetches > 0 {
            inner.fail_next_fetches -= 1;
            return Err(SealError::Timeout {
                operation: "fetch".into(),
                timeout,
            });
        }
        let skip = after.map_or(0, |s| s as usize + 1);
        Ok(inner.entries.iter().skip(skip).cloned().collect())
    }

    fn publish(
        &self,
        expected_tip_hash: Option<String>,
        entry: &RslEntry,
        timeout: Duration,
    ) -> Result<()> {
        let mut inner = self.lock();
        inner.publish_attempts += 1;
        if inner.fail_publishes {
            return Err(SealError::Timeout {
                operation: "publish".into(),
                timeout,
            });
        }
        let tip_hash = inner.entries.last().map(RslEntry::entry_hash).transpose()?;
        if tip_hash != expected_tip_hash {
            return Err(SealError::Conflict {
                ref_name: entry.ref_name.clone(),
                expected: entry.seq.checked_sub(1),
                found: inner.entries.last().map(|e| e.seq),
            });
        }
        inner.entries.push(entry.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File-backed remote (RSL co-located with a path-addressable repository)

/// RSL store backed by a line-delimited JSON file, e.g.
/// `<remote-repo>/.gitseal/rsl.jsonl`. Writers serialize through a lock
/// file; acquisition is bounded by the caller's timeout.
pub struct FileRemote {
    path: PathBuf,
}

struct LockGuard(PathBuf);

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

impl FileRemote {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn acquire_lock(&self, timeout: Duration) -> Result<LockGuard> {
        let lock_path = self.path.with_extension("lock");
        let deadline = Instant::now() + timeout;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(_) => return Ok(LockGuard(lock_path)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(SealError::Timeout {
                            operation: "acquire RSL lock".into(),
                            timeout,
                        });
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(SealError::Io(e)),
            }
        }
    }

    fn read_entries(&self) -> Result<Vec<RslEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let bytes = fs_guard::read_validated(&self.path, MAX_REMOTE_RSL_BYTES)?;
        let text = String::from_utf8(bytes)?;
        let mut entries = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(line)?);
        }
        Ok(entries)
    }
}

impl RslRemote for FileRemote {
    fn fetch_since(&self, after: Option<u64>, timeout: Duration) -> Result<Vec<RslEntry>> {
        let _lock = self.acquire_lock(timeout)?;
        let entries = self.read_entries()?;
        let skip = after.map_or(0, |s| s as usize + 1);
        Ok(entries.into_iter().skip(skip).collect())
    }

    fn publish(
        &self,
        expected_tip_hash: Option<String>,
        entry: &RslEntry,
        timeout: Duration,
    ) -> Result<()> {
        let _lock = self.acquire_lock(timeout)?;
        let entries = self.read_entries()?;
        let tip_hash = entries.last().map(RslEntry::entry_hash).transpose()?;
        if tip_hash != expected_tip_hash {
            return Err(SealError::Conflict {
                ref_name: entry.ref_name.clone(),
                expected: entry.seq.checked_sub(1),
                found: entries.last().map(|e| e.seq),
            });
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        f.write_all(line.as_bytes())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Command-line git transport

/// Ordinary git primitives, consumed as a capability.
pub trait GitTransport {
    fn clone_repo(&self, url: &str, dir: &Path, timeout: Duration) -> Result<()>;
    fn fetch(&self, timeout: Duration) -> Result<()>;
    fn add(&self, path: &Path) -> Result<()>;
    fn commit(&self, message: &str) -> Result<()>;
    fn push(&self, remote: &str, branch: &str, timeout: Duration) -> Result<()>;
    /// Commit hash of HEAD, the target a push entry records.
    fn head_commit(&self) -> Result<String>;
    /// Configured URL of a named remote.
    fn remote_url(&self, remote: &str) -> Result<String>;
}

/// `git` binary invoker. Every call carries a deadline; on expiry the
/// child is killed and a timeout surfaces instead of a hang.
pub struct CommandGit {
    repo_dir: PathBuf,
}

impl CommandGit {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }

    fn run(&self, args: &[&str], timeout: Duration) -> Result<String> {
        run_git(Some(&self.repo_dir), args, timeout)
    }
}

fn run_git(cwd: Option<&Path>, args: &[&str], timeout: Duration) -> Result<String> {
    let mut cmd = Command::new("git");
    if let Some(dir) = cwd {
        cmd.arg("-C").arg(dir);
    }
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    debug!(?args, "running git");

    let mut child = cmd.spawn()?;

    // Drain pipes on their own threads so a chatty child can't fill the
    // pipe buffer and outlive its deadline.
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let out_handle = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(p) = stdout_pipe.as_mut() {
            let _ = p.read_to_end(&mut buf);
        }
        buf
    });
    let err_handle = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(p) = stderr_pipe.as_mut() {
            let _ = p.read_to_end(&mut buf);
        }
        buf
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SealError::Timeout {
                    operation: format!("git {}", args.first().unwrap_or(&"")),
                    timeout,
                });
            }
            None => std::thread::sleep(LOCK_POLL),
        }
    };

    let stdout = out_handle.join().unwrap_or_default();
    let stderr = err_handle.join().unwrap_or_default();

    if !status.success() {
        return Err(SealError::GitCommand {
            command: args.join(" "),
            stderr: sanitize_tool_stderr(&stderr),
        });
    }
    Ok(String::from_utf8_lossy(&stdout).trim().to_string())
}

impl GitTransport for CommandGit {
    fn clone_repo(&self, url: &str, dir: &Path, timeout: Duration) -> Result<()> {
        run_git(
            None,
            &["clone", url, &dir.display().to_string()],
            timeout,
        )?;
        Ok(())
    }

    fn fetch(&self, timeout: Duration) -> Result<()> {
        self.run(&["fetch", "--all"], timeout)?;
        Ok(())
    }

    fn add(&self, path: &Path) -> Result<()> {
        self.run(&["add", &path.display().to_string()], Duration::from_secs(60))?;
        Ok(())
    }

    fn commit(&self, message: &str) -> Result<()> {
        self.run(&["commit", "-m", message], Duration::from_secs(60))?;
        Ok(())
    }

    fn push(&self, remote: &str, branch: &str, timeout: Duration) -> Result<()> {
        self.run(&["push", remote, branch], timeout)?;
        Ok(())
    }

    fn head_commit(&self) -> Result<String> {
        self.run(&["rev-parse", "HEAD"], Duration::from_secs(10))
    }

    fn remote_url(&self, remote: &str) -> Result<String> {
        self.run(&["remote", "get-url", remote], Duration::from_secs(10))
    }
}

/// Truncates and redacts external tool stderr before it reaches reports
/// or logs: tokens, private keys, and absolute paths are scrubbed.
pub fn sanitize_tool_stderr(stderr: &[u8]) -> String {
    let mut s = String::from_utf8_lossy(stderr).to_string();
    if s.len() > MAX_TOOL_ERR_BYTES {
        let mut cut = MAX_TOOL_ERR_BYTES;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push_str("\n[TRUNCATED]");
    }

    let patterns = [
        (r"AKIA[0-9A-Z]{16}", "AKIA****************"),
        (r"(?i)ghp_[A-Za-z0-9]{30,60}", "ghp_****************"),
        (
            r"(?i)BEGIN (RSA|EC|OPENSSH) PRIVATE KEY",
            "BEGIN [REDACTED] PRIVATE KEY",
        ),
        (
            r"(?i)(password|token)\s*[:=]\s*[^\s]+",
            "[REDACTED]=[REDACTED]",
        ),
        (r"(?i)bearer\s+[a-z0-9\-_\.=]{1,500}", "bearer [REDACTED]"),
    ];
    for (pat, repl) in patterns {
        if let Ok(re) = Regex::new(pat) {
            s = re.replace_all(&s, repl).to_string();
        }
    }

    s.lines()
        .map(|line| {
            if line.trim_start().starts_with('/') {
                "[REDACTED_PATH]"
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::metadata::tests::policy_for;
    use crate::rsl::{EntryKind, ReferenceStateLog, REF_POLICY};

    fn keypair(seed: u8) -> Keypair {
        Keypair::from_seed(&[seed; 32]).unwrap()
    }

    fn genesis_entry(kp: &Keypair) -> RslEntry {
        let mut log = ReferenceStateLog::new();
        log.append(
            REF_POLICY,
            "genesis",
            EntryKind::PolicyUpdate {
                policy: policy_for(&[kp], 1, 1),
            },
            &[kp],
            None,
        )
        .unwrap()
    }

    #[test]
    fn memory_remote_cas_rejects_stale_tip() {
        let kp = keypair(1);
        let remote = MemoryRemote::new();
        let genesis = genesis_entry(&kp);
        remote
            .publish(None, &genesis, Duration::from_secs(1))
            .unwrap();

        // A second writer that still believes the log is empty loses.
        let err = remote
            .publish(None, &genesis, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, SealError::Conflict { .. }));
        assert_eq!(remote.len(), 1);
    }

    #[test]
    fn memory_remote_fetch_since_skips_known_entries() {
        let kp = keypair(1);
        let remote = MemoryRemote::new();
        let genesis = genesis_entry(&kp);
        remote
            .publish(None, &genesis, Duration::from_secs(1))
            .unwrap();

        assert_eq!(
            remote
                .fetch_since(None, Duration::from_secs(1))
                .unwrap()
                .len(),
            1
        );
        assert!(remote
            .fetch_since(Some(0), Duration::from_secs(1))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn file_remote_round_trip_and_cas() {
        let kp = keypair(1);
        let dir = tempfile::tempdir().unwrap();
        let remote = FileRemote::new(dir.path().join("rsl.jsonl"));
        let genesis = genesis_entry(&kp);

        remote
            .publish(None, &genesis, Duration::from_secs(1))
            .unwrap();
        let fetched = remote.fetch_since(None, Duration::from_secs(1)).unwrap();
        assert_eq!(fetched, vec![genesis.clone()]);

        let err = remote
            .publish(None, &genesis, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, SealError::Conflict { .. }));
    }

    #[test]
    fn file_remote_rejects_invalid_utf8_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rsl.jsonl");
        std::fs::write(&path, [0xFF, 0xFE, b'\n']).unwrap();
        let remote = FileRemote::new(&path);
        let err = remote
            .fetch_since(None, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, SealError::Utf8(_)));
    }

    #[test]
    fn file_remote_lock_contention_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rsl.jsonl");
        // Simulate a crashed writer holding the lock.
        std::fs::write(path.with_extension("lock"), b"").unwrap();

        let remote = FileRemote::new(&path);
        let err = remote
            .fetch_since(None, Duration::from_millis(80))
            .unwrap_err();
        assert!(matches!(err, SealError::Timeout { .. }));
    }

    #[test]
    fn concurrent_writers_get_exactly_one_winner_per_race() {
        let kp = keypair(1);
        let remote = MemoryRemote::new();
        let genesis = genesis_entry(&kp);
        remote
            .publish(None, &genesis, Duration::from_secs(1))
            .unwrap();
        let tip_hash = genesis.entry_hash().unwrap();

        // Build one candidate successor per writer, all anchored at the
        // same tip, and race them from separate threads.
        let mut log = ReferenceStateLog::from_entries(vec![genesis]).unwrap();
        let candidate = log
            .append(
                "refs/heads/main",
                "aaa111",
                EntryKind::RefUpdate,
                &[&kp],
                Some(0),
            )
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let remote = remote.clone();
            let entry = candidate.clone();
            let expected = Some(tip_hash.clone());
            handles.push(std::thread::spawn(move || {
                remote.publish(expected, &entry, Duration::from_secs(1))
            }));
        }
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| matches!(r, Err(SealError::Conflict { .. }))));
        // No two entries share a sequence number.
        let entries = remote.fetch_since(None, Duration::from_secs(1)).unwrap();
        let mut seqs: Vec<_> = entries.iter().map(|e| e.seq).collect();
        seqs.dedup();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[test]
    fn stderr_sanitizer_redacts_tokens_and_paths() {
        let raw = b"fatal: auth failed\ntoken=abc123\n/home/user/.ssh/id_ed25519";
        let clean = sanitize_tool_stderr(raw);
        assert!(!clean.contains("abc123"));
        assert!(!clean.contains("/home/user"));
        assert!(clean.contains("fatal: auth failed"));
    }

    #[test]
    fn stderr_sanitizer_truncates_oversized_output() {
        let raw = vec![b'e'; MAX_TOOL_ERR_BYTES * 2];
        let clean = sanitize_tool_stderr(&raw);
        assert!(clean.len() <= MAX_TOOL_ERR_BYTES + 32);
        assert!(clean.ends_with("[TRUNCATED]"));
    }
}
