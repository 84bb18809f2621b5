//! Record codec — one (path, mtime, bitmap) entry, loose or packed.
//!
//! # On-disk layout (all multi-byte integers big-endian)
//!
//! ```text
//! Offset            Size             Field
//!    0                 2             path_len        (BE u16)
//!    2          path_len             path            (raw bytes, no NUL)
//!    2+path_len         8            mtime           (BE i64, seconds since epoch)
//!   10+path_len         4            compressed_len  (BE u32)
//!   14+path_len  compressed_len      compressed      (Zstandard frame, exactly
//!                                                     BITMAP_BYTES when decoded)
//! ```
//!
//! A well-formed record is exactly `2 + path_len + 8 + 4 + compressed_len`
//! bytes. That size law is the only structural check: [`loose_status`]
//! compares it against the file size without decompressing anything, and any
//! deviation marks the record corrupt. A zero-byte file is *not* corrupt —
//! it is an in-progress write and must be left alone.
//!
//! The same byte layout is used verbatim inside the pack file; the packer
//! copies loose records without re-encoding them.

use std::fs::File;
use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::bitmap::{Bitmap, BITMAP_BYTES};

/// Zstandard level used by the loose writer.
pub const WRITE_COMPRESSION_LEVEL: i32 = 8;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum RecordError {
    /// Structural failure: short read, size mismatch, or a Zstandard frame
    /// that does not decode to exactly one bitmap.
    #[error("corrupt record: {0}")]
    Corrupt(&'static str),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("path of {0} bytes exceeds the u16 framing limit")]
    PathTooLong(usize),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Header ───────────────────────────────────────────────────────────────────

/// The fixed-order fields preceding the compressed payload.
#[derive(Debug, Clone)]
pub struct RecordHeader {
    pub path: Vec<u8>,
    pub mtime: i64,
    pub compressed_len: u32,
}

impl RecordHeader {
    /// Total record size implied by this header.
    pub fn record_len(&self) -> u64 {
        2 + self.path.len() as u64 + 8 + 4 + self.compressed_len as u64
    }
}

/// Read the header fields in on-disk order. Any short read is `Corrupt`.
pub fn read_header<R: Read>(mut source: R) -> Result<RecordHeader, RecordError> {
    let path_len = source
        .read_u16::<BigEndian>()
        .map_err(|_| RecordError::Corrupt("short read in path length"))?;
    let mut path = vec![0u8; path_len as usize];
    source
        .read_exact(&mut path)
        .map_err(|_| RecordError::Corrupt("short read in path"))?;
    let mtime = source
        .read_i64::<BigEndian>()
        .map_err(|_| RecordError::Corrupt("short read in mtime"))?;
    let compressed_len = source
        .read_u32::<BigEndian>()
        .map_err(|_| RecordError::Corrupt("short read in compressed length"))?;
    Ok(RecordHeader { path, mtime, compressed_len })
}

// ── Encode ───────────────────────────────────────────────────────────────────

/// Compress `bitmap` with Zstandard at `level` and write a full record to
/// `sink` as one buffered sequence.
pub fn encode<W: Write>(
    bitmap: &Bitmap,
    path: &[u8],
    mtime: i64,
    level: i32,
    mut sink: W,
) -> Result<(), RecordError> {
    if path.len() > u16::MAX as usize {
        return Err(RecordError::PathTooLong(path.len()));
    }
    let compressed = zstd::encode_all(bitmap.as_bytes(), level)
        .map_err(|e| RecordError::Compression(e.to_string()))?;

    sink.write_u16::<BigEndian>(path.len() as u16)?;
    sink.write_all(path)?;
    sink.write_i64::<BigEndian>(mtime)?;
    sink.write_u32::<BigEndian>(compressed.len() as u32)?;
    sink.write_all(&compressed)?;
    sink.flush()?;
    Ok(())
}

// ── Decode ───────────────────────────────────────────────────────────────────

/// Read and decompress the payload that follows a header.
pub fn read_bitmap_payload<R: Read>(
    mut source: R,
    compressed_len: u32,
) -> Result<Bitmap, RecordError> {
    let mut compressed = vec![0u8; compressed_len as usize];
    source
        .read_exact(&mut compressed)
        .map_err(|_| RecordError::Corrupt("short read in payload"))?;
    let raw = zstd::decode_all(&compressed[..])
        .map_err(|_| RecordError::Corrupt("payload is not a valid zstd frame"))?;
    Bitmap::from_bytes(raw).ok_or(RecordError::Corrupt("payload does not decode to one bitmap"))
}

/// Read one full record.
pub fn decode<R: Read>(mut source: R) -> Result<(Vec<u8>, i64, Bitmap), RecordError> {
    let header = read_header(&mut source)?;
    let bitmap = read_bitmap_payload(&mut source, header.compressed_len)?;
    Ok((header.path, header.mtime, bitmap))
}

// ── Structural check ─────────────────────────────────────────────────────────

/// Verdict of the size-law check on a loose file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LooseStatus {
    /// Header-implied size equals the file size.
    Ok,
    /// Zero bytes — an in-progress write, never deleted.
    Empty,
    /// Anything else.
    Corrupt,
}

/// Compare the size implied by the header against the actual file size,
/// without decompressing. The file's read position is left unspecified;
/// rewind before reusing the handle.
pub fn loose_status(file: &mut File) -> io::Result<LooseStatus> {
    let actual = file.metadata()?.len();
    if actual == 0 {
        return Ok(LooseStatus::Empty);
    }
    // Any header-read failure counts as corrupt, same as a size mismatch.
    match read_header(&mut *file) {
        Ok(header) if header.record_len() == actual => Ok(LooseStatus::Ok),
        _ => Ok(LooseStatus::Corrupt),
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::{Seek, Write};

    fn sample_bitmap(indices: &[u32]) -> Bitmap {
        let mut b = Bitmap::new();
        for &i in indices {
            b.set(i);
        }
        b
    }

    #[test]
    fn roundtrip_preserves_all_fields() {
        let bitmap = sample_bitmap(&[0, 0x11111, 0xFFFFF]);
        let mut buf = Vec::new();
        encode(&bitmap, b"/var/log/syslog.7.gz", 1502920742, 3, &mut buf).unwrap();

        let (path, mtime, decoded) = decode(&buf[..]).unwrap();
        assert_eq!(path, b"/var/log/syslog.7.gz");
        assert_eq!(mtime, 1502920742);
        assert_eq!(decoded.as_bytes(), bitmap.as_bytes());
    }

    #[test]
    fn record_len_matches_encoded_size() {
        let bitmap = sample_bitmap(&[42]);
        let mut buf = Vec::new();
        encode(&bitmap, b"/a", -1, 3, &mut buf).unwrap();
        let header = read_header(&buf[..]).unwrap();
        assert_eq!(header.record_len(), buf.len() as u64);
    }

    #[test]
    fn truncated_payload_is_corrupt() {
        let bitmap = sample_bitmap(&[1, 2, 3]);
        let mut buf = Vec::new();
        encode(&bitmap, b"/a", 0, 3, &mut buf).unwrap();
        buf.truncate(buf.len() - 1);
        match decode(&buf[..]) {
            Err(RecordError::Corrupt(_)) => {}
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn oversized_path_is_rejected() {
        let bitmap = Bitmap::new();
        let path = vec![b'p'; u16::MAX as usize + 1];
        match encode(&bitmap, &path, 0, 3, Vec::new()) {
            Err(RecordError::PathTooLong(_)) => {}
            other => panic!("expected PathTooLong, got {other:?}"),
        }
    }

    #[test]
    fn loose_status_distinguishes_ok_empty_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record");

        let mut f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        assert_eq!(loose_status(&mut f).unwrap(), LooseStatus::Empty);

        let bitmap = sample_bitmap(&[9]);
        let mut buf = Vec::new();
        encode(&bitmap, b"/a", 0, 3, &mut buf).unwrap();
        f.write_all(&buf).unwrap();
        f.rewind().unwrap();
        assert_eq!(loose_status(&mut f).unwrap(), LooseStatus::Ok);

        f.set_len(buf.len() as u64 - 3).unwrap();
        f.rewind().unwrap();
        assert_eq!(loose_status(&mut f).unwrap(), LooseStatus::Corrupt);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn roundtrip_any_path_mtime_and_bits(
            path in proptest::collection::vec(any::<u8>(), 1..200),
            mtime in any::<i64>(),
            indices in proptest::collection::vec(0u32..crate::bitmap::NGRAM_COUNT as u32, 0..64),
        ) {
            let bitmap = sample_bitmap(&indices);
            let mut buf = Vec::new();
            encode(&bitmap, &path, mtime, 3, &mut buf).unwrap();
            let (p, m, b) = decode(&buf[..]).unwrap();
            prop_assert_eq!(p, path);
            prop_assert_eq!(m, mtime);
            prop_assert_eq!(b.as_bytes(), bitmap.as_bytes());
        }
    }
}
