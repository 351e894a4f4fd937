//! Symlink-safe, size-bounded file reads. Single source of truth for all
//! untrusted file I/O in gitseal: signing keys, policy documents, hook
//! scripts, and the persisted RSL all come through here.

use std::{fs, path::Path};

use crate::errors::{Result, SealError};

/// Reads a file after verifying it is not a symlink and is within `max_bytes`.
///
/// NOTE: narrow TOCTOU window between `symlink_metadata()` and `fs::read()`.
/// Closing it fully requires `O_NOFOLLOW` or `fstat` on the fd. The check
/// still catches accidental symlinks and raises the bar for exploitation.
pub fn read_validated(path: &Path, max_bytes: u64) -> Result<Vec<u8>> {
    let meta = fs::symlink_metadata(path).map_err(SealError::Io)?;
    if meta.file_type().is_symlink() {
        return Err(SealError::UnsafeFile(format!(
            "refusing to read symlink: {}",
            path.display()
        )));
    }
    if meta.len() > max_bytes {
        return Err(SealError::UnsafeFile(format!(
            "file too large: {} ({} bytes, max {max_bytes} bytes)",
            path.display(),
            meta.len(),
        )));
    }
    fs::read(path).map_err(SealError::Io)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn reads_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("key.pub");
        fs::write(&p, b"contents").unwrap();
        assert_eq!(read_validated(&p, 1024).unwrap(), b"contents");
    }

    #[test]
    fn rejects_oversized_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("rsl.jsonl");
        fs::write(&p, vec![b'x'; 32]).unwrap();
        let err = read_validated(&p, 16).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        fs::write(&real, b"x").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();
        let err = read_validated(&link, 1024).unwrap_err();
        assert!(err.to_string().contains("symlink"));
    }
}
