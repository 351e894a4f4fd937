//! # gitseal
//!
//! A signed, hash-chained reference state log (RSL) and verified hook
//! distribution layered on top of ordinary git operations.
//!
//! gitseal does not replace git: the object store and transport stay
//! underneath, consumed as a capability. What gitseal adds is tamper-evident
//! ordering (every reference update is an append-only, signed, hash-chained
//! log entry), a self-referential trust root (signed policy documents that
//! can only be rotated under their own quorum), and hook manifests that
//! travel the same log, so a hook script can be verified against its
//! registered hash before it runs.
//!
//! ## Security Properties
//!
//! - **`#![forbid(unsafe_code)]`**: no `unsafe` blocks anywhere.
//! - **Append-only chain**: entries are never mutated or removed; history
//!   rewrites break the hash chain and are rejected at clone/pull.
//! - **Era-correct auditing**: signatures are checked against the policy in
//!   effect when the entry was appended, not the latest one.
//! - **Optimistic concurrency**: publication is compare-and-swap against
//!   the remote tip; a lost race is a retryable conflict, never an
//!   overwrite.
//! - **Defensive input handling**: keys, policies, hook scripts, and the
//!   persisted log are read symlink-checked and size-bounded via
//!   [`fs_guard::read_validated`].
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`crypto`] | Ed25519 signing/verification, SHA-256 digests, key IDs |
//! | [`rsl`] | The append-only, hash-chained reference state log |
//! | [`metadata`] | Policy documents, thresholds, replay-built trust store |
//! | [`hooks`] | Signed hook manifests and advisory content verification |
//! | [`engine`] | Clone/pull/commit/push verification state machines |
//! | [`git`] | Git transport and compare-and-swap RSL remotes |
//! | [`errors`] | Error taxonomy with per-kind exit codes |
//! | [`fs_guard`] | Symlink-safe, size-bounded file reads |

#![forbid(unsafe_code)]

pub mod crypto;
pub mod engine;
pub mod errors;
pub mod fs_guard;
pub mod git;
pub mod hooks;
pub mod metadata;
pub mod rsl;

pub use errors::{Result, SealError};
