use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use gitseal::crypto::Keypair;
use gitseal::engine::{CommitState, Engine, EngineConfig};
use gitseal::git::{CommandGit, FileRemote, GitTransport};
use gitseal::hooks::{self, MAX_HOOK_SCRIPT_BYTES};
use gitseal::rsl::ReferenceStateLog;
use gitseal::{fs_guard, SealError};

/// Per-repository state directory (trusted RSL copy, hook script store,
/// default signing key location).
const STATE_DIR: &str = ".gitseal";
const RSL_FILE: &str = "rsl.jsonl";
const PENDING_FILE: &str = "pending.json";
const MAX_PENDING_BYTES: u64 = 64 * 1024;

#[derive(Parser)]
#[command(name = "gitseal", about = "Signed reference state log on top of git", version)]
struct Cli {
    /// Signing key (raw or hex Ed25519 seed). Defaults to .gitseal/key.
    #[arg(long, global = true)]
    key: Option<PathBuf>,

    /// Network deadline in seconds for fetch/push/publish calls.
    #[arg(long, global = true, default_value_t = 30)]
    timeout: u64,

    /// Log filter (tracing EnvFilter syntax).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Clone a repository and verify its RSL from genesis.
    Clone { url: String, dir: PathBuf },

    /// Fetch and verify new RSL entries against the trusted local tip.
    Pull,

    /// Stage a file (passthrough to git).
    Add { path: PathBuf },

    /// Commit with advisory hook and policy verification.
    Commit {
        #[arg(short, long)]
        message: String,
    },

    /// Push a branch and record the advancement in the RSL.
    Push { remote: String, branch: String },

    /// Manage verified hooks.
    Hooks {
        #[command(subcommand)]
        cmd: HooksCmd,
    },
}

#[derive(Subcommand)]
enum HooksCmd {
    /// Create the gitseal state directories.
    Init,
    /// Stage a hook script for registration.
    Add {
        path: PathBuf,
        #[arg(long)]
        stage: String,
    },
    /// Publish staged hook manifests as RSL entries.
    Apply,
    /// Verify and install registered hooks into .git/hooks.
    Load,
}

/// Hook stages added but not yet applied.
#[derive(Default, Serialize, Deserialize)]
struct PendingHooks {
    stages: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(e) = run(cli) {
        eprintln!("✗ {e:#}");
        let code = e
            .downcast_ref::<SealError>()
            .map_or(1, SealError::exit_code);
        std::process::exit(code);
    }
}

fn run(cli: Cli) -> Result<()> {
    let timeout = Duration::from_secs(cli.timeout);
    let config = EngineConfig {
        network_timeout: timeout,
        ..EngineConfig::default()
    };

    match cli.cmd {
        Cmd::Clone { url, dir } => cmd_clone(&url, &dir, config),
        Cmd::Pull => cmd_pull(config),
        Cmd::Add { path } => {
            CommandGit::new(".").add(&path)?;
            Ok(())
        }
        Cmd::Commit { message } => cmd_commit(&message, cli.key.as_deref(), config),
        Cmd::Push { remote, branch } => {
            cmd_push(&remote, &branch, cli.key.as_deref(), config, timeout)
        }
        Cmd::Hooks { cmd } => match cmd {
            HooksCmd::Init => cmd_hooks_init(),
            HooksCmd::Add { path, stage } => cmd_hooks_add(&path, &stage),
            HooksCmd::Apply => cmd_hooks_apply(cli.key.as_deref(), config),
            HooksCmd::Load => cmd_hooks_load(config),
        },
    }
}

/// RSL remote co-located with a path-addressable repository. Non-path
/// remotes (ssh/https) would need server-side support; this CLI targets
/// the path transport.
fn rsl_remote_for(url: &str) -> Result<FileRemote> {
    let path = Path::new(url);
    if !path.exists() {
        return Err(anyhow!(
            "remote '{url}' is not a local path; RSL synchronization requires a path remote"
        ));
    }
    Ok(FileRemote::new(path.join(STATE_DIR).join(RSL_FILE)))
}

fn state_dir(repo: &Path) -> PathBuf {
    repo.join(STATE_DIR)
}

fn load_log(repo: &Path) -> Result<ReferenceStateLog> {
    let path = state_dir(repo).join(RSL_FILE);
    if !path.exists() {
        return Ok(ReferenceStateLog::new());
    }
    let log = ReferenceStateLog::load(&path)?;
    // The on-disk copy is untrusted until the chain re-verifies: a
    // tampered state file must not be served (or re-saved) as trusted.
    if !log.is_empty() {
        log.verify_chain(0, log.len() - 1)
            .with_context(|| format!("persisted RSL at {} failed verification", path.display()))?;
    }
    Ok(log)
}

fn save_log(repo: &Path, log: &ReferenceStateLog) -> Result<()> {
    fs::create_dir_all(state_dir(repo))?;
    log.save(&state_dir(repo).join(RSL_FILE))?;
    Ok(())
}

fn load_key(repo: &Path, key: Option<&Path>) -> Result<Keypair> {
    let path = key
        .map(Path::to_path_buf)
        .unwrap_or_else(|| state_dir(repo).join("key"));
    Keypair::load(&path).with_context(|| format!("loading signing key from {}", path.display()))
}

fn engine_for(repo: &Path, config: EngineConfig) -> Result<Engine<FileRemote>> {
    let git = CommandGit::new(repo);
    let url = git.remote_url("origin")?;
    let remote = rsl_remote_for(&url)?;
    Ok(Engine::with_log(load_log(repo)?, remote, config))
}

fn cmd_clone(url: &str, dir: &Path, config: EngineConfig) -> Result<()> {
    CommandGit::new(".").clone_repo(url, dir, config.network_timeout)?;

    let remote = rsl_remote_for(url)?;
    let (engine, result) = Engine::clone_from(remote, config)?;
    save_log(dir, engine.log())?;

    match result.anchor_seq {
        Some(seq) => println!("✓ RSL verified from genesis (tip seq {seq})"),
        None => println!("✓ cloned; remote has no RSL yet"),
    }
    Ok(())
}

fn cmd_pull(config: EngineConfig) -> Result<()> {
    let repo = Path::new(".");
    CommandGit::new(repo).fetch(config.network_timeout)?;

    let mut engine = engine_for(repo, config)?;
    let before = engine.log().len();
    let result = engine.pull()?;
    save_log(repo, engine.log())?;

    let fetched = engine.log().len() - before;
    println!(
        "✓ pull verified: {fetched} new RSL entr{} (tip seq {:?})",
        if fetched == 1 { "y" } else { "ies" },
        result.anchor_seq
    );
    Ok(())
}

fn cmd_commit(message: &str, key: Option<&Path>, config: EngineConfig) -> Result<()> {
    let repo = Path::new(".");
    let engine = engine_for(repo, config)?;
    let author = load_key(repo, key)?;

    let hook_path = repo.join(".git").join("hooks").join("pre-commit");
    let script = hook_path
        .exists()
        .then(|| fs_guard::read_validated(&hook_path, MAX_HOOK_SCRIPT_BYTES))
        .transpose()?;

    let outcome = engine.preflight_commit("pre-commit", script.as_deref(), &author);
    for warning in outcome.warnings() {
        eprintln!("⚠ {warning}");
    }
    if outcome.state == CommitState::Warned {
        eprintln!("⚠ verification warnings above are advisory; commit proceeds");
    }

    CommandGit::new(repo).commit(message)?;
    println!("✓ commit recorded");
    Ok(())
}

fn cmd_push(
    remote: &str,
    branch: &str,
    key: Option<&Path>,
    config: EngineConfig,
    timeout: Duration,
) -> Result<()> {
    let repo = Path::new(".");
    let git = CommandGit::new(repo);
    let signer = load_key(repo, key)?;

    git.push(remote, branch, timeout)?;

    let url = git.remote_url(remote)?;
    let rsl_remote = rsl_remote_for(&url)?;
    let mut engine = Engine::with_log(load_log(repo)?, rsl_remote, config);

    let target = git.head_commit()?;
    let ref_name = format!("refs/heads/{branch}");
    let entry = engine.push(&ref_name, &target, &[&signer])?;
    save_log(repo, engine.log())?;

    println!("✓ pushed {branch}; RSL entry {} records {target}", entry.seq);
    Ok(())
}

fn cmd_hooks_init() -> Result<()> {
    let repo = Path::new(".");
    fs::create_dir_all(state_dir(repo).join("hooks"))?;
    fs::create_dir_all(repo.join(".git").join("hooks"))?;
    println!("✓ gitseal hook directories initialized");
    Ok(())
}

fn cmd_hooks_add(path: &Path, stage: &str) -> Result<()> {
    let repo = Path::new(".");
    let script = fs_guard::read_validated(path, MAX_HOOK_SCRIPT_BYTES)?;

    let store = state_dir(repo).join("hooks");
    fs::create_dir_all(&store)?;
    fs::write(store.join(stage), &script)?;

    let mut pending = load_pending(repo)?;
    if !pending.stages.iter().any(|s| s == stage) {
        pending.stages.push(stage.to_string());
    }
    save_pending(repo, &pending)?;

    println!("✓ staged hook '{stage}' ({})", hooks::hash_script(&store.join(stage))?);
    Ok(())
}

fn cmd_hooks_apply(key: Option<&Path>, config: EngineConfig) -> Result<()> {
    let repo = Path::new(".");
    let signer = load_key(repo, key)?;
    let mut engine = engine_for(repo, config)?;

    let pending = load_pending(repo)?;
    if pending.stages.is_empty() {
        println!("nothing to apply");
        return Ok(());
    }

    for stage in &pending.stages {
        let script_path = state_dir(repo).join("hooks").join(stage);
        let digest = hooks::hash_script(&script_path)?;
        let entry = engine.register_hook(stage, &digest, &[&signer])?;
        println!("✓ hook '{stage}' registered at RSL seq {}", entry.seq);
    }
    save_log(repo, engine.log())?;
    save_pending(repo, &PendingHooks::default())?;
    Ok(())
}

fn cmd_hooks_load(config: EngineConfig) -> Result<()> {
    let repo = Path::new(".");
    let engine = engine_for(repo, config)?;
    let registry = engine.hook_registry();

    let results = registry.materialize_into(
        &state_dir(repo).join("hooks"),
        &repo.join(".git").join("hooks"),
    )?;
    if results.is_empty() {
        println!("no hooks registered");
        return Ok(());
    }

    let mut failed = None;
    for (stage, result) in &results {
        if result.accepted {
            println!("✓ hook '{stage}' verified and installed");
        } else {
            eprintln!(
                "✗ hook '{stage}' rejected: {}",
                result.reason.as_deref().unwrap_or("content mismatch")
            );
            failed = Some(stage.clone());
        }
    }
    if let Some(stage) = failed {
        return Err(SealError::HookIntegrity {
            stage,
            expected: "registered manifest hash".into(),
            actual: "local script content".into(),
        }
        .into());
    }
    Ok(())
}

fn load_pending(repo: &Path) -> Result<PendingHooks> {
    let path = state_dir(repo).join(PENDING_FILE);
    if !path.exists() {
        return Ok(PendingHooks::default());
    }
    Ok(serde_json::from_slice(&fs_guard::read_validated(
        &path,
        MAX_PENDING_BYTES,
    )?)?)
}

fn save_pending(repo: &Path, pending: &PendingHooks) -> Result<()> {
    fs::create_dir_all(state_dir(repo))?;
    fs::write(
        state_dir(repo).join(PENDING_FILE),
        serde_json::to_vec_pretty(pending)?,
    )?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use gitseal::metadata::{PolicyDocument, RoleDefinition, ROLE_HOOKS, ROLE_POLICY, ROLE_PUSH};
    use gitseal::rsl::{EntryKind, REF_POLICY};
    use std::collections::{BTreeMap, BTreeSet};

    fn policy_for(kp: &Keypair) -> PolicyDocument {
        let mut keys = BTreeMap::new();
        keys.insert(kp.key_id().to_string(), kp.public_key().to_hex());
        let def = RoleDefinition {
            key_ids: BTreeSet::from([kp.key_id().to_string()]),
            threshold: 1,
        };
        let mut roles = BTreeMap::new();
        roles.insert(ROLE_POLICY.to_string(), def.clone());
        roles.insert(ROLE_HOOKS.to_string(), def.clone());
        roles.insert(ROLE_PUSH.to_string(), def);
        PolicyDocument {
            version: 1,
            keys,
            roles,
        }
    }

    fn saved_repo(dir: &Path) -> Keypair {
        let kp = Keypair::from_seed(&[7; 32]).unwrap();
        let mut log = ReferenceStateLog::new();
        log.append(
            REF_POLICY,
            "genesis",
            EntryKind::PolicyUpdate {
                policy: policy_for(&kp),
            },
            &[&kp],
            None,
        )
        .unwrap();
        log.append("refs/heads/main", "aaa111", EntryKind::RefUpdate, &[&kp], Some(0))
            .unwrap();
        save_log(dir, &log).unwrap();
        kp
    }

    #[test]
    fn load_log_accepts_intact_state() {
        let dir = tempfile::tempdir().unwrap();
        saved_repo(dir.path());
        let log = load_log(dir.path()).unwrap();
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn load_log_rejects_tampered_state() {
        let dir = tempfile::tempdir().unwrap();
        saved_repo(dir.path());

        // Rewrite entry 1's target in the persisted JSONL behind the
        // tool's back.
        let path = state_dir(dir.path()).join(RSL_FILE);
        let tampered = fs::read_to_string(&path)
            .unwrap()
            .replace("aaa111", "bbb222");
        fs::write(&path, tampered).unwrap();

        assert!(load_log(dir.path()).is_err());
    }

    #[test]
    fn load_log_of_missing_state_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_log(dir.path()).unwrap().is_empty());
    }
}
