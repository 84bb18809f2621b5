//! Pack file and packer — coalescing loose records per bucket.
//!
//! # On-disk pieces
//!
//! `packfile` is an append-only concatenation of records in insertion order;
//! existing bytes are never rewritten, so offsets into it are stable.
//! `packfile_index` is a flat array of 16-byte entries sorted ascending by
//! hash; duplicate hashes are stored consecutively.
//!
//! ```text
//! Offset  Size  Field
//!    0      8   hash    XXH64(path)  — host byte order on disk
//!    8      8   offset  of the record in packfile — big-endian on disk
//! ```
//!
//! The mixed endianness is a quirk of the format and must be preserved for
//! compatibility; [`IndexEntry::from_bytes`] / [`IndexEntry::to_bytes`] are
//! the only places that know about it.
//!
//! # Crash safety
//!
//! The packer appends all record bytes, fsyncs, then replaces the index by
//! writing `.packfile_index.tmp` and renaming it over `packfile_index`. The
//! rename is the commit point: before it, the index describes only the
//! pre-pack state; after it, every appended record is discoverable. Loose
//! files are deleted only after the rename succeeds, so an aborted pack
//! leaves an unindexed packfile tail (dead bytes, rescanned never re-indexed)
//! and all of its loose files intact.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Instant;

use rayon::prelude::*;

use crate::lock::{lock_path, LockFile};
use crate::loose::hash_from_name;
use crate::record::{self, LooseStatus};
use crate::store::{Store, StoreError, UmaskGuard};

pub const PACKFILE_NAME: &str = "packfile";
pub const PACK_INDEX_NAME: &str = "packfile_index";
pub const PACK_INDEX_TMP_NAME: &str = ".packfile_index.tmp";

/// Files read concurrently per batch, and deleter workers.
pub const PARALLEL_FILES: usize = 50;
/// The pack lock is touched at least this often during a long pack.
pub const LOCK_REFRESH_SECS: u64 = 60;

// ── Index entries ────────────────────────────────────────────────────────────

pub const INDEX_ENTRY_SIZE: usize = 16;

/// One pack-index entry, in host representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub hash: u64,
    pub offset: u64,
}

impl IndexEntry {
    /// Decode one on-disk entry. `hash` is stored in host byte order,
    /// `offset` big-endian — the format quirk lives here and nowhere else.
    #[inline]
    pub fn from_bytes(raw: &[u8; INDEX_ENTRY_SIZE]) -> Self {
        let hash = u64::from_ne_bytes(raw[..8].try_into().expect("8-byte slice"));
        let offset = u64::from_be_bytes(raw[8..].try_into().expect("8-byte slice"));
        Self { hash, offset }
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; INDEX_ENTRY_SIZE] {
        let mut raw = [0u8; INDEX_ENTRY_SIZE];
        raw[..8].copy_from_slice(&self.hash.to_ne_bytes());
        raw[8..].copy_from_slice(&self.offset.to_be_bytes());
        raw
    }
}

/// Parse a whole index image. A trailing partial entry (torn write) is
/// ignored.
pub fn parse_index(raw: &[u8]) -> Vec<IndexEntry> {
    raw.chunks_exact(INDEX_ENTRY_SIZE)
        .map(|chunk| IndexEntry::from_bytes(chunk.try_into().expect("exact chunk")))
        .collect()
}

// ── Packing one bucket ───────────────────────────────────────────────────────

/// What one `pack_bucket` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackOutcome {
    /// Another packer holds the bucket lock; nothing was modified.
    Busy,
    /// The bucket was packed; `files` loose records moved into the pack.
    Packed { files: usize },
}

/// Aggregate result of packing a whole store.
#[derive(Debug, Default, Clone, Copy)]
pub struct PackReport {
    pub buckets: usize,
    pub busy: usize,
    pub files: usize,
}

/// Move every completed loose record in `bucket` into the packfile, update
/// the index atomically, and delete the originals.
pub fn pack_bucket(bucket: &Path) -> Result<PackOutcome, StoreError> {
    let _umask = UmaskGuard::clear();

    let packfile_path = bucket.join(PACKFILE_NAME);
    ensure_exists(&packfile_path)?;

    let lock = match LockFile::acquire(lock_path(bucket, PACKFILE_NAME))? {
        Some(l) => l,
        None => return Ok(PackOutcome::Busy),
    };

    let mut packfile = OpenOptions::new().append(true).open(&packfile_path)?;
    let mut offset = packfile.metadata()?.len();

    // Everything that is not hidden and not the pack itself is a candidate.
    let mut candidates: Vec<String> = Vec::new();
    for entry in fs::read_dir(bucket)? {
        let entry = entry?;
        let name = match entry.file_name().into_string() {
            Ok(n) => n,
            Err(_) => continue,
        };
        if name.starts_with('.') || name == PACKFILE_NAME || name == PACK_INDEX_NAME {
            continue;
        }
        candidates.push(name);
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(PARALLEL_FILES)
        .build()
        .map_err(|e| StoreError::Io(io::Error::new(io::ErrorKind::Other, e)))?;

    let mut new_entries: Vec<IndexEntry> = Vec::with_capacity(candidates.len());
    let mut packed_names: Vec<String> = Vec::with_capacity(candidates.len());
    let mut last_touch = Instant::now();

    for batch in candidates.chunks(PARALLEL_FILES) {
        let contents: Vec<Option<Vec<u8>>> =
            pool.install(|| batch.par_iter().map(|name| read_loose_bytes(bucket, name)).collect());

        for (name, bytes) in batch.iter().zip(contents) {
            if let Some(bytes) = bytes {
                let Some(hash) = hash_from_name(name) else {
                    log::warn!("skipping stray file in bucket: {}", bucket.join(name).display());
                    continue;
                };
                packfile.write_all(&bytes)?;
                new_entries.push(IndexEntry { hash, offset });
                packed_names.push(name.clone());
                offset += bytes.len() as u64;
            }
            if last_touch.elapsed().as_secs() >= LOCK_REFRESH_SECS {
                lock.touch()?;
                last_touch = Instant::now();
            }
        }
    }

    if new_entries.is_empty() {
        return Ok(PackOutcome::Packed { files: 0 });
    }

    packfile.sync_all()?;

    // Commit point. On failure nothing is deleted: the appended tail stays
    // unreachable and every loose file survives for the next attempt.
    merge_into_index(bucket, new_entries)?;

    let files = packed_names.len();
    let chunk = files.div_ceil(PARALLEL_FILES);
    pool.install(|| {
        packed_names.par_chunks(chunk.max(1)).for_each(|names| {
            for name in names {
                let _ = fs::remove_file(bucket.join(name));
            }
        });
    });

    drop(lock);
    Ok(PackOutcome::Packed { files })
}

/// Pack every non-hidden bucket under the store root. Per-bucket failures
/// are logged and do not stop the sweep.
pub fn pack_store(store: &Store) -> Result<PackReport, StoreError> {
    let mut report = PackReport::default();
    for entry in fs::read_dir(store.root())? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        match pack_bucket(&path) {
            Ok(PackOutcome::Busy) => {
                report.buckets += 1;
                report.busy += 1;
            }
            Ok(PackOutcome::Packed { files }) => {
                report.buckets += 1;
                report.files += files;
            }
            Err(e) => {
                log::warn!("packing {} failed: {e}", path.display());
            }
        }
    }
    Ok(report)
}

// ── Internals ────────────────────────────────────────────────────────────────

fn ensure_exists(path: &Path) -> io::Result<()> {
    match OpenOptions::new().write(true).create_new(true).mode(0o666).open(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// One parallel reader. `None` means "leave this file out of the pack":
/// in-progress (locked or empty), removed as corrupt, or unreadable.
fn read_loose_bytes(bucket: &Path, name: &str) -> Option<Vec<u8>> {
    if LockFile::held(&lock_path(bucket, name)) {
        return None;
    }
    let path = bucket.join(name);
    let mut file = match File::open(&path) {
        Ok(f) => f,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("cannot open {}: {e}", path.display());
            }
            return None;
        }
    };
    match record::loose_status(&mut file) {
        Ok(LooseStatus::Ok) => {}
        Ok(LooseStatus::Empty) => return None,
        Ok(LooseStatus::Corrupt) => {
            log::warn!("removing corrupt loose record {}", path.display());
            let _ = fs::remove_file(&path);
            return None;
        }
        Err(e) => {
            log::warn!("cannot check {}: {e}", path.display());
            return None;
        }
    }
    if file.rewind().is_err() {
        return None;
    }
    let mut bytes = Vec::new();
    match file.read_to_end(&mut bytes) {
        Ok(_) => Some(bytes),
        Err(e) => {
            log::warn!("cannot read {}: {e}", path.display());
            None
        }
    }
}

/// Sort the fresh entries, two-finger-merge them with the existing index,
/// and atomically replace `packfile_index`.
fn merge_into_index(bucket: &Path, mut fresh: Vec<IndexEntry>) -> Result<(), StoreError> {
    fresh.sort_by_key(|e| e.hash);

    let index_path = bucket.join(PACK_INDEX_NAME);
    let existing = match fs::read(&index_path) {
        Ok(raw) => parse_index(&raw),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    let mut merged = Vec::with_capacity(existing.len() + fresh.len());
    let (mut i, mut j) = (0, 0);
    while i < existing.len() || j < fresh.len() {
        let take_existing = i < existing.len()
            && (j >= fresh.len() || existing[i].hash <= fresh[j].hash);
        if take_existing {
            merged.push(existing[i]);
            i += 1;
        } else {
            merged.push(fresh[j]);
            j += 1;
        }
    }

    let tmp_path = bucket.join(PACK_INDEX_TMP_NAME);
    let tmp = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o666)
        .open(&tmp_path)?;
    let mut writer = BufWriter::new(tmp);
    for entry in &merged {
        writer.write_all(&entry.to_bytes())?;
    }
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|e| StoreError::Io(e.into_error()))?
        .sync_all()?;
    fs::rename(&tmp_path, &index_path)?;
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────────────
