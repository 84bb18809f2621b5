//! Loose records — the write path of the store.
//!
//! A loose file holds exactly one record and is named
//! `HHHHHHHHHHHHHHHH_NNN`: the first 16 characters are the upper-case
//! canonical (big-endian) hex of `XXH64(path, seed 0xfe5000)`, the 3-digit
//! decimal counter resolves collisions — different paths sharing a hash, or
//! the same path written concurrently. The lowest free slot wins.
//!
//! The writer reserves a slot with an exclusive create, then takes the
//! record's sidecar lock before putting any bytes in the file. Readers that
//! see the lock treat the record as in-progress. Losing either race advances
//! to the next slot; a reserved-but-unlocked file is left behind as an empty
//! slot, which every reader and the packer tolerate.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use xxhash_rust::xxh64::xxh64;

use crate::bitmap::Bitmap;
use crate::lock::{lock_path, LockFile};
use crate::record::{self, WRITE_COMPRESSION_LEVEL};
use crate::store::StoreError;

/// Seed for every path hash in the store. A format constant.
pub const HASH_SEED: u64 = 0xfe5000;
/// Collision counter range `_000..=_999`; exhaustion is a hard error.
pub const MAX_SLOTS: u32 = 1000;

/// XXH64 of the path bytes under the store seed.
#[inline]
pub fn path_hash(path: &[u8]) -> u64 {
    xxh64(path, HASH_SEED)
}

/// Canonical file-name rendering of a path hash: 16 upper-case hex digits,
/// most significant byte first.
#[inline]
pub fn hash_hex(hash: u64) -> String {
    format!("{hash:016X}")
}

/// Loose file name for a hash prefix and slot counter.
#[inline]
pub fn slot_name(hex: &str, slot: u32) -> String {
    format!("{hex}_{slot:03}")
}

/// Decode the 16 hex digits of a loose file name back into the path hash.
/// `None` for stray files that do not follow the naming scheme.
pub fn hash_from_name(name: &str) -> Option<u64> {
    let prefix = name.get(..16)?;
    let digest: [u8; 8] = hex::decode(prefix).ok()?.try_into().ok()?;
    Some(u64::from_be_bytes(digest))
}

/// Persist one record as a loose file in `bucket`.
///
/// Returns the path of the written file. Fails with [`StoreError::NoSlot`]
/// when all 1000 collision slots are occupied — that means a hash-collision
/// attack or a bug, and is treated as hard.
pub fn write_loose(
    bucket: &Path,
    bitmap: &Bitmap,
    source_path: &[u8],
    mtime: i64,
) -> Result<PathBuf, StoreError> {
    let hex = hash_hex(path_hash(source_path));
    for slot in 0..MAX_SLOTS {
        let name = slot_name(&hex, slot);
        let full = bucket.join(&name);
        let file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o666)
            .open(&full)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        };
        let lock = match LockFile::acquire(lock_path(bucket, &name))? {
            Some(l) => l,
            // Lost the lock race after reserving the slot; the empty file
            // stays behind and readers skip it.
            None => continue,
        };

        let mut writer = BufWriter::new(file);
        record::encode(bitmap, source_path, mtime, WRITE_COMPRESSION_LEVEL, &mut writer)?;
        writer.flush().map_err(StoreError::Io)?;
        let file = writer.into_inner().map_err(|e| StoreError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);
        drop(lock);
        log::debug!("wrote loose record {}", full.display());
        return Ok(full);
    }
    Err(StoreError::NoSlot(hex))
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_hex_is_canonical_uppercase() {
        let h = path_hash(b"/var/log/messages");
        let hex = hash_hex(h);
        assert_eq!(hex.len(), 16);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!hex.chars().any(|c| c.is_ascii_lowercase()));
        assert_eq!(hash_from_name(&slot_name(&hex, 0)), Some(h));
    }

    #[test]
    fn stray_names_do_not_decode() {
        assert_eq!(hash_from_name("packfile"), None);
        assert_eq!(hash_from_name("NOT-HEX-AT-ALL!!_000"), None);
        assert_eq!(hash_from_name("ABC"), None);
    }

    #[test]
    fn collision_advances_to_next_slot() {
        let dir = tempfile::tempdir().unwrap();
        let bitmap = Bitmap::new();

        let first = write_loose(dir.path(), &bitmap, b"/a", 0).unwrap();
        let second = write_loose(dir.path(), &bitmap, b"/a", 0).unwrap();
        assert_ne!(first, second);
        assert!(first.to_string_lossy().ends_with("_000"));
        assert!(second.to_string_lossy().ends_with("_001"));
    }

    #[test]
    fn writer_releases_its_lock() {
        let dir = tempfile::tempdir().unwrap();
        let bitmap = Bitmap::new();
        let written = write_loose(dir.path(), &bitmap, b"/a", 0).unwrap();
        let name = written.file_name().unwrap().to_string_lossy().into_owned();
        assert!(!LockFile::held(&lock_path(dir.path(), &name)));
    }
}
