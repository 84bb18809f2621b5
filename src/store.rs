//! Store layout — index root, month buckets, and the umask scope.
//!
//! # Directory tree
//!
//! ```text
//! <root>/
//!   YYYY_MM/                      one bucket per UTC month of source mtime
//!     packfile                    append-only concatenation of records
//!     packfile_index              sorted array of {u64 hash, u64 be offset}
//!     .packfile.lock              present while a pack runs
//!     HHHHHHHHHHHHHHHH_NNN        one loose record
//!     .HHHHHHHHHHHHHHHH_NNN.lock  present while that record is being written
//!     .packfile_index.tmp         transient, during the index rename
//! ```
//!
//! The root is resolved once at startup and carried as a value; nothing in
//! the crate consults the environment after that. Buckets are created on
//! demand with permissive mode so independent processes (and users) can share
//! one store.

use std::ffi::CString;
use std::fs::DirBuilder;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use chrono::DateTime;
use thiserror::Error;

use crate::bitmap::ScanError;
use crate::record::RecordError;

/// Fixed system-wide store location, preferred when read-writable.
pub const SYSTEM_ROOT: &str = "/4gram";
/// Per-user fallback, created under `$HOME/.cache`.
pub const USER_CACHE_DIR: &str = "4gram";

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum StoreError {
    /// The source file is missing or cannot be canonicalised.
    #[error("source not found: {0}")]
    NotFound(PathBuf),
    /// All 1000 collision slots for one hash prefix are taken.
    #[error("no free slot for loose record {0}")]
    NoSlot(String),
    /// A gzip-compressed source ended mid-member during scanning.
    #[error("gzip stream ended mid-member")]
    Truncated,
    /// No writable location for the index root.
    #[error("no read-writable index root (tried /4gram and $HOME/.cache/4gram)")]
    NoRoot,
    /// The mtime does not map to a representable UTC month.
    #[error("mtime {0} is outside the representable UTC range")]
    MtimeOutOfRange(i64),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<ScanError> for StoreError {
    fn from(e: ScanError) -> Self {
        match e {
            ScanError::TruncatedGzip => StoreError::Truncated,
            ScanError::Io(e) => StoreError::Io(e),
        }
    }
}

// ── Store ────────────────────────────────────────────────────────────────────

/// The resolved index root. Cheap to clone; all operations take it by
/// reference.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Use an explicit root (created if missing).
    pub fn at(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            DirBuilder::new().recursive(true).mode(0o777).create(&root)?;
        }
        Ok(Self { root })
    }

    /// Resolve the default root: the fixed system path when read-writable,
    /// otherwise `$HOME/.cache/4gram` (creating `.cache` at 0700 and the
    /// store directory at 0777).
    pub fn open_default() -> Result<Self, StoreError> {
        if is_read_writable(Path::new(SYSTEM_ROOT)) {
            return Ok(Self { root: PathBuf::from(SYSTEM_ROOT) });
        }
        let home = std::env::var_os("HOME").ok_or(StoreError::NoRoot)?;
        let cache = Path::new(&home).join(".cache");
        let _ = DirBuilder::new().mode(0o700).create(&cache);
        let root = cache.join(USER_CACHE_DIR);
        let _ = DirBuilder::new().mode(0o777).create(&root);
        if is_read_writable(&root) {
            Ok(Self { root })
        } else {
            Err(StoreError::NoRoot)
        }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `YYYY_MM` bucket name for a source mtime, in UTC. Works across the
    /// whole 64-bit range chrono can represent, including pre-epoch times.
    pub fn bucket_name(mtime: i64) -> Result<String, StoreError> {
        let at = DateTime::from_timestamp(mtime, 0)
            .ok_or(StoreError::MtimeOutOfRange(mtime))?;
        Ok(at.format("%Y_%m").to_string())
    }

    /// Bucket directory for `mtime`, created on demand with mode 0777.
    pub fn bucket_dir(&self, mtime: i64) -> Result<PathBuf, StoreError> {
        let dir = self.root.join(Self::bucket_name(mtime)?);
        match DirBuilder::new().mode(0o777).create(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
        Ok(dir)
    }
}

/// `access(2)` check for both read and write permission.
fn is_read_writable(path: &Path) -> bool {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // access() follows the real uid, matching how shared stores are used.
    unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::W_OK) == 0 }
}

// ── Umask scope ──────────────────────────────────────────────────────────────

/// Clears the process umask so created files honour their explicit mode
/// bits, and restores the previous mask when dropped. Must not outlive the
/// store operation it protects.
pub struct UmaskGuard {
    previous: libc::mode_t,
}

impl UmaskGuard {
    pub fn clear() -> Self {
        let previous = unsafe { libc::umask(0) };
        Self { previous }
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        unsafe {
            libc::umask(self.previous);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_names_follow_utc_months() {
        assert_eq!(Store::bucket_name(0).unwrap(), "1970_01");
        assert_eq!(Store::bucket_name(-1).unwrap(), "1969_12");
        assert_eq!(Store::bucket_name(1502920742).unwrap(), "2017_08");
        assert_eq!(Store::bucket_name(1i64 << 31).unwrap(), "2038_01");
    }

    #[test]
    fn bucket_dir_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::at(dir.path()).unwrap();
        let a = store.bucket_dir(0).unwrap();
        let b = store.bucket_dir(0).unwrap();
        assert_eq!(a, b);
        assert!(a.is_dir());
        assert!(a.ends_with("1970_01"));
    }
}
