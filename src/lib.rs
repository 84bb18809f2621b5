//! # fourgram — persistent n-gram presence index
//!
//! Accelerates substring search across large corpora of (possibly gzipped)
//! text files by caching one n-gram presence bitmap per file version in a
//! shared on-disk store. A filter stage consults the store to rule files
//! out before anyone bothers to scan them; a miss falls back to scanning
//! and populates the store as a side effect. The index is advisory: losing
//! it costs rescans, never answers.
//!
//! Store guarantees (frozen):
//! - All record framing fields are big-endian; the bitmap payload is one
//!   Zstandard frame of exactly 128 KiB decoded
//! - Records are keyed (path, mtime); lookups return exact matches only
//! - File names are content-addressed: canonical XXH64(path, seed 0xfe5000)
//! - The pack file is append-only; its index is replaced only by atomic
//!   rename, and the index `hash` column is host-endian on disk while
//!   `offset` is big-endian (a compatibility quirk, kept)
//! - Cross-process coordination is advisory `O_EXCL` sidecar lock files;
//!   a record is visible the instant its loose file closes or the index
//!   rename lands
//! - A corrupt loose record is defined by one size law and is removed on
//!   sight; an empty loose file is an in-progress write and is left alone

pub mod bitmap;
pub mod record;
pub mod store;
pub mod lock;
pub mod loose;
pub mod lookup;
pub mod pack;
pub mod filter;
pub mod engine;

// Flat re-exports for the most common types.
pub use bitmap::{Bitmap, NgramState, ScanError, BITMAP_BYTES, NGRAM_CHARS, NGRAM_CHAR_BITS};
pub use engine::{bitmap_for_file, filter_file, FilterOutcome};
pub use filter::{ngram_indices, sorted_indices, NgramFilter};
pub use lookup::lookup;
pub use loose::{path_hash, write_loose, HASH_SEED};
pub use pack::{pack_bucket, pack_store, PackOutcome, PackReport};
pub use record::{LooseStatus, RecordError};
pub use store::{Store, StoreError};
