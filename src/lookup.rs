//! Lookup — find the bitmap for a (path, mtime) key, loose files first,
//! then the pack.
//!
//! The key is exact: a record is returned only when both the stored path
//! bytes and the stored mtime match. Stale versions of a path (older mtime)
//! stay in the store until repacked but are never returned for a different
//! key. Loose files win over the pack because a loose record always reflects
//! a later-or-equal write than the pack's snapshot.
//!
//! The loose scan walks slots `_000, _001, …` and stops at the first absent
//! slot. It also stops at the first slot whose lock is held: that record is
//! mid-write and the slots above it are not meaningful yet. Corrupt slots
//! are removed on sight (self-heal) and the scan continues past them; empty
//! slots are in-progress writes and are skipped without deleting.
//!
//! The pack side memory-maps the index read-only and binary-searches the
//! hash column. A stale NFS handle (ESTALE) during the pack search is
//! retried once before the error surfaces.

use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom};
use std::path::Path;

use memmap2::Mmap;

use crate::bitmap::Bitmap;
use crate::lock::{lock_path, LockFile};
use crate::loose::{hash_hex, path_hash, slot_name, MAX_SLOTS};
use crate::pack::{IndexEntry, INDEX_ENTRY_SIZE, PACKFILE_NAME, PACK_INDEX_NAME};
use crate::record::{self, LooseStatus};
use crate::store::{Store, StoreError};

/// Look up `(source_path, mtime)` in the bucket its mtime selects.
/// `Ok(None)` is a miss; the caller falls back to scanning the source.
pub fn lookup(store: &Store, source_path: &[u8], mtime: i64) -> Result<Option<Bitmap>, StoreError> {
    let bucket = store.bucket_dir(mtime)?;
    lookup_in_bucket(&bucket, source_path, mtime)
}

/// Lookup against one already-resolved bucket directory.
pub fn lookup_in_bucket(
    bucket: &Path,
    source_path: &[u8],
    mtime: i64,
) -> Result<Option<Bitmap>, StoreError> {
    if let Some(bitmap) = find_loose(bucket, source_path, mtime)? {
        return Ok(Some(bitmap));
    }
    find_in_pack(bucket, source_path, mtime)
}

// ── Loose search ─────────────────────────────────────────────────────────────

/// Scan the loose slots for the key. `Ok(None)` covers both "no such
/// record" and "record in progress" — either way the pack is consulted next.
pub fn find_loose(
    bucket: &Path,
    source_path: &[u8],
    mtime: i64,
) -> Result<Option<Bitmap>, StoreError> {
    let hex = hash_hex(path_hash(source_path));
    for slot in 0..MAX_SLOTS {
        let name = slot_name(&hex, slot);
        let full = bucket.join(&name);
        let mut file = match File::open(&full) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                log::warn!("cannot open loose record {}: {e}", full.display());
                return Ok(None);
            }
        };
        // A held lock means this slot is mid-write and the slots above it
        // are not meaningful yet; end the loose search here.
        if LockFile::held(&lock_path(bucket, &name)) {
            return Ok(None);
        }
        match record::loose_status(&mut file) {
            Ok(LooseStatus::Ok) => {}
            Ok(LooseStatus::Empty) => continue,
            Ok(LooseStatus::Corrupt) => {
                log::warn!("removing corrupt loose record {}", full.display());
                let _ = fs::remove_file(&full);
                continue;
            }
            Err(e) => {
                log::warn!("cannot check loose record {}: {e}", full.display());
                continue;
            }
        }
        file.rewind()?;
        let header = match record::read_header(&mut file) {
            Ok(h) => h,
            Err(e) => {
                log::warn!("unreadable loose record {}: {e}", full.display());
                continue;
            }
        };
        if header.path != source_path || header.mtime != mtime {
            // Hash collision or a stale version of the same path.
            continue;
        }
        match record::read_bitmap_payload(&mut file, header.compressed_len) {
            Ok(bitmap) => return Ok(Some(bitmap)),
            Err(e) => {
                log::warn!("undecodable loose record {}: {e}", full.display());
                continue;
            }
        }
    }
    Ok(None)
}

// ── Pack search ──────────────────────────────────────────────────────────────

/// Search the bucket's packfile via its index. Retries once on ESTALE.
pub fn find_in_pack(
    bucket: &Path,
    source_path: &[u8],
    mtime: i64,
) -> Result<Option<Bitmap>, StoreError> {
    match search_pack(bucket, source_path, mtime) {
        Err(StoreError::Io(e)) if is_stale_handle(&e) => {
            log::debug!("stale NFS handle on {}, retrying once", bucket.display());
            search_pack(bucket, source_path, mtime)
        }
        other => other,
    }
}

fn is_stale_handle(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::ESTALE)
}

fn search_pack(
    bucket: &Path,
    source_path: &[u8],
    mtime: i64,
) -> Result<Option<Bitmap>, StoreError> {
    let mut packfile = match File::open(bucket.join(PACKFILE_NAME)) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let index_file = match File::open(bucket.join(PACK_INDEX_NAME)) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    // Read-only map; the index is only ever replaced whole via rename, so a
    // mapped generation stays internally consistent.
    let map = unsafe { Mmap::map(&index_file)? };
    let entries = map.len() / INDEX_ENTRY_SIZE;
    if entries == 0 {
        return Ok(None);
    }

    let hash = path_hash(source_path);
    let mut at = lower_bound(&map, entries, hash);
    while at < entries {
        let entry = entry_at(&map, at);
        if entry.hash != hash {
            break;
        }
        match read_candidate(&mut packfile, entry.offset, source_path, mtime)? {
            Candidate::Match(bitmap) => return Ok(Some(bitmap)),
            Candidate::Other => {}
        }
        at += 1;
    }
    Ok(None)
}

enum Candidate {
    Match(Bitmap),
    Other,
}

/// Read the record at `offset` and decide whether it is the key we want.
/// Decode failures fail only this candidate.
fn read_candidate(
    packfile: &mut File,
    offset: u64,
    source_path: &[u8],
    mtime: i64,
) -> Result<Candidate, StoreError> {
    packfile.seek(SeekFrom::Start(offset))?;
    let header = match record::read_header(&mut *packfile) {
        Ok(h) => h,
        Err(e) => {
            log::warn!("unreadable pack record at offset {offset}: {e}");
            return Ok(Candidate::Other);
        }
    };
    if header.path != source_path || header.mtime != mtime {
        return Ok(Candidate::Other);
    }
    match record::read_bitmap_payload(&mut *packfile, header.compressed_len) {
        Ok(bitmap) => Ok(Candidate::Match(bitmap)),
        Err(e) => {
            log::warn!("undecodable pack record at offset {offset}: {e}");
            Ok(Candidate::Other)
        }
    }
}

#[inline]
fn entry_at(map: &[u8], index: usize) -> IndexEntry {
    let start = index * INDEX_ENTRY_SIZE;
    let raw: &[u8; INDEX_ENTRY_SIZE] =
        map[start..start + INDEX_ENTRY_SIZE].try_into().expect("entry in bounds");
    IndexEntry::from_bytes(raw)
}

/// First position whose hash is `>= hash`.
fn lower_bound(map: &[u8], entries: usize, hash: u64) -> usize {
    let (mut lo, mut hi) = (0usize, entries);
    while lo < hi {
        let mid = (lo + hi) / 2;
        if entry_at(map, mid).hash < hash {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::parse_index;

    fn index_image(hashes: &[u64]) -> Vec<u8> {
        let mut raw = Vec::new();
        for (i, &hash) in hashes.iter().enumerate() {
            raw.extend_from_slice(&IndexEntry { hash, offset: i as u64 }.to_bytes());
        }
        raw
    }

    #[test]
    fn lower_bound_finds_first_equal_hash() {
        let raw = index_image(&[1, 3, 3, 3, 9]);
        let entries = parse_index(&raw).len();
        assert_eq!(lower_bound(&raw, entries, 0), 0);
        assert_eq!(lower_bound(&raw, entries, 3), 1);
        assert_eq!(lower_bound(&raw, entries, 4), 4);
        assert_eq!(lower_bound(&raw, entries, 9), 4);
        assert_eq!(lower_bound(&raw, entries, 10), 5);
    }

    #[test]
    fn missing_pack_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let got = find_in_pack(dir.path(), b"/a", 0).unwrap();
        assert!(got.is_none());
    }
}
