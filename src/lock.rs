//! Advisory sidecar lock files.
//!
//! A lock named `NAME` is the file `.NAME.lock` in the same directory as the
//! resource it guards. Presence signals exclusive intent; it is honoured by
//! convention, not enforced by the kernel. Creation uses `O_EXCL` on the
//! sidecar, which is atomic on every filesystem the store targets (including
//! NFS).
//!
//! A holder that dies leaves the lock behind. Readers treat a lock older
//! than [`STALE_LOCK_AGE`] as abandoned: `held()` reports it as free, and
//! `acquire()` reclaims it. Long-running holders call [`LockFile::touch`]
//! periodically to stay inside the threshold.

use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use filetime::FileTime;

/// Age after which an untouched lock is considered abandoned.
pub const STALE_LOCK_AGE: Duration = Duration::from_secs(300);

/// Sidecar lock path for `name` inside `dir`.
pub fn lock_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!(".{name}.lock"))
}

/// An acquired advisory lock. Removed on drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Try to take the lock. `Ok(None)` means another holder is live.
    /// A stale lock is reclaimed (removed and re-created) once.
    pub fn acquire(path: impl Into<PathBuf>) -> io::Result<Option<LockFile>> {
        let path = path.into();
        for attempt in 0..2 {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o666)
                .open(&path)
            {
                Ok(_) => return Ok(Some(LockFile { path })),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if attempt == 0 && is_stale(&path) {
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Is a live (non-stale) holder present?
    pub fn held(path: &Path) -> bool {
        path.exists() && !is_stale(path)
    }

    /// Refresh the lock mtime so other processes keep honouring it.
    pub fn touch(&self) -> io::Result<()> {
        filetime::set_file_mtime(&self.path, FileTime::now())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn is_stale(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        // Vanished between checks — not a live holder either way.
        return false;
    };
    match meta.modified().map(|m| SystemTime::now().duration_since(m)) {
        Ok(Ok(age)) => age > STALE_LOCK_AGE,
        // Clock skew puts the lock in the future; treat it as live.
        _ => false,
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
