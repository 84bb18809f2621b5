//! Orchestration — obtain a bitmap for a candidate file and apply a filter.
//!
//! The index is advisory. For each candidate the engine tries the store
//! first; on a miss it scans the file itself (gzip-transparent) and persists
//! the fresh bitmap as a loose record on a best-effort basis — an index that
//! cannot be written never fails a query, it only costs the next caller a
//! rescan.

use std::fs::{self, File};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::bitmap::Bitmap;
use crate::filter::NgramFilter;
use crate::lookup::lookup_in_bucket;
use crate::loose::write_loose;
use crate::store::{Store, StoreError, UmaskGuard};

/// Result of filtering one candidate file. The `NewBitmap` variants report
/// that the store grew as a side effect of this query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    /// The bitmap may match the filter; the caller should scan the file.
    Match,
    /// The bitmap rules the file out; the caller can skip it.
    NoMatch,
    /// As `Match`, and the bitmap was computed and indexed just now.
    MatchNewBitmap,
    /// As `NoMatch`, and the bitmap was computed and indexed just now.
    NoMatchNewBitmap,
}

impl FilterOutcome {
    #[inline]
    pub fn is_match(self) -> bool {
        matches!(self, FilterOutcome::Match | FilterOutcome::MatchNewBitmap)
    }

    /// Did this query add a bitmap to the index?
    #[inline]
    pub fn bitmap_created(self) -> bool {
        matches!(self, FilterOutcome::MatchNewBitmap | FilterOutcome::NoMatchNewBitmap)
    }
}

/// Fetch the bitmap for `path`: index lookup first, then a scan that also
/// populates the index. The boolean reports whether the bitmap was created
/// by this call.
pub fn bitmap_for_file(store: &Store, path: &Path) -> Result<(Bitmap, bool), StoreError> {
    let real = fs::canonicalize(path).map_err(|_| StoreError::NotFound(path.to_owned()))?;
    let mtime = fs::metadata(&real)?.mtime();
    let bucket = store.bucket_dir(mtime)?;
    let path_bytes = real.as_os_str().as_bytes();

    if let Some(bitmap) = lookup_in_bucket(&bucket, path_bytes, mtime)? {
        log::debug!("index hit for {}", real.display());
        return Ok((bitmap, false));
    }

    let file = File::open(&real)?;
    let mut bitmap = Bitmap::new();
    bitmap.apply_stream(file)?;

    // Best-effort persist: the query already has its bitmap.
    if let Err(e) = write_loose(&bucket, &bitmap, path_bytes, mtime) {
        log::warn!("could not index {}: {e}", real.display());
    }
    Ok((bitmap, true))
}

/// Decide whether `path` can match `filter`, indexing it on the way if it
/// was not indexed yet.
pub fn filter_file(
    store: &Store,
    path: &Path,
    filter: &NgramFilter,
) -> Result<FilterOutcome, StoreError> {
    let _umask = UmaskGuard::clear();
    let (bitmap, created) = bitmap_for_file(store, path)?;
    Ok(match (filter.matches(&bitmap), created) {
        (true, false) => FilterOutcome::Match,
        (false, false) => FilterOutcome::NoMatch,
        (true, true) => FilterOutcome::MatchNewBitmap,
        (false, true) => FilterOutcome::NoMatchNewBitmap,
    })
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture() -> (tempfile::TempDir, Store, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let store = Store::at(root.path().join("index")).unwrap();
        let sources = tempfile::tempdir().unwrap();
        (root, store, sources)
    }

    #[test]
    fn miss_scan_then_hit() {
        let (_root, store, sources) = fixture();
        let candidate = sources.path().join("app.log");
        File::create(&candidate)
            .unwrap()
            .write_all(b"worker panicked: index out of range")
            .unwrap();

        let filter = NgramFilter::any_of(&[b"panicked".as_ref()]);
        let first = filter_file(&store, &candidate, &filter).unwrap();
        assert_eq!(first, FilterOutcome::MatchNewBitmap);

        // Second query is served from the loose record written above.
        let second = filter_file(&store, &candidate, &filter).unwrap();
        assert_eq!(second, FilterOutcome::Match);
    }

    #[test]
    fn non_matching_file_is_skippable() {
        let (_root, store, sources) = fixture();
        let candidate = sources.path().join("quiet.log");
        File::create(&candidate)
            .unwrap()
            .write_all(b"nothing interesting happened today")
            .unwrap();

        let filter = NgramFilter::any_of(&[b"panicked".as_ref()]);
        let got = filter_file(&store, &candidate, &filter).unwrap();
        assert_eq!(got, FilterOutcome::NoMatchNewBitmap);
        assert!(!got.is_match());
        assert!(got.bitmap_created());
    }

    #[test]
    fn missing_source_is_not_found() {
        let (_root, store, sources) = fixture();
        let gone = sources.path().join("no-such-file");
        match bitmap_for_file(&store, &gone) {
            Err(StoreError::NotFound(p)) => assert_eq!(p, gone),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }
}
