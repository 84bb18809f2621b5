//! N-gram presence bitmap — the unit of indexing.
//!
//! # Shape
//!
//! One bitmap covers one source file version. It has `NGRAM_COUNT` =
//! 2^(`NGRAM_CHARS` × `NGRAM_CHAR_BITS`) bits (2^20 with the default 5×4
//! configuration, i.e. 128 KiB). A bitmap index is built by concatenating the
//! low `NGRAM_CHAR_BITS` bits of `NGRAM_CHARS` consecutive input bytes, most
//! recent byte in the low-order position. Only presence is recorded: order,
//! count and position within the source are discarded.
//!
//! Folding each byte to its low 4 bits keeps the bitmap small enough to stay
//! resident in L2 while still discriminating well for alphabetic text, and
//! makes the index insensitive to the case bits of ASCII letters.
//!
//! # Bit order
//!
//! Bit `i` lives at `byte[i / 8]`, mask `1 << (i % 8)`. The raw byte array is
//! the exported bitmap format (no header).
//!
//! # Input streams
//!
//! [`Bitmap::apply_stream`] accepts both plain and gzip-compressed input and
//! decodes gzip on the fly (multi-member, like zlib's `gzread`). A gzip
//! stream that ends mid-member reports [`ScanError::TruncatedGzip`]; the bits
//! applied before the truncation point remain valid.

use std::io::{self, Read};

use flate2::read::MultiGzDecoder;
use thiserror::Error;

// ── Format constants ─────────────────────────────────────────────────────────

/// Bytes per n-gram window.
pub const NGRAM_CHARS: usize = 5;
/// Low bits kept from each byte.
pub const NGRAM_CHAR_BITS: u32 = 4;
/// Total number of distinct n-gram indices (2^20 by default).
pub const NGRAM_COUNT: usize = 1 << (NGRAM_CHARS as u32 * NGRAM_CHAR_BITS);
/// Size of one bitmap on disk and in memory.
pub const BITMAP_BYTES: usize = NGRAM_COUNT / 8;

/// Mask selecting the bits kept from one input byte.
pub const CHAR_MASK: u32 = (1 << NGRAM_CHAR_BITS) - 1;
/// Mask keeping a rolling state inside the index range.
pub const NGRAM_MASK: u32 = (NGRAM_COUNT - 1) as u32;

const SCAN_BUF: usize = 8 * 1024;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ScanError {
    /// The input was gzip-compressed and ended in the middle of a member.
    #[error("gzip stream ended mid-member")]
    TruncatedGzip,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Rolling state ────────────────────────────────────────────────────────────

/// Incremental n-gram index over a byte stream.
///
/// Each pushed byte shifts the previous state left by `NGRAM_CHAR_BITS` and
/// ORs in the byte's low bits; the returned value is the bitmap index of the
/// window ending at that byte (meaningful once `NGRAM_CHARS` bytes are in).
#[derive(Debug, Clone, Copy, Default)]
pub struct NgramState(u32);

impl NgramState {
    #[inline]
    pub fn push(&mut self, byte: u8) -> u32 {
        self.0 = ((self.0 << NGRAM_CHAR_BITS) & NGRAM_MASK) | (byte as u32 & CHAR_MASK);
        self.0
    }
}

// ── Bitmap ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Bitmap {
    bits: Box<[u8]>,
}

impl Bitmap {
    /// A zeroed bitmap.
    pub fn new() -> Self {
        Self { bits: vec![0u8; BITMAP_BYTES].into_boxed_slice() }
    }

    /// Rebuild a bitmap from its raw byte form. `None` if the length is wrong.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        if bytes.len() != BITMAP_BYTES {
            return None;
        }
        Some(Self { bits: bytes.into_boxed_slice() })
    }

    /// The raw byte form — also the exported on-disk format.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    #[inline]
    pub fn set(&mut self, index: u32) {
        self.bits[index as usize / 8] |= 1 << (index % 8);
    }

    #[inline]
    pub fn get(&self, index: u32) -> bool {
        self.bits[index as usize / 8] & (1 << (index % 8)) != 0
    }

    /// Number of set bits (diagnostics).
    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// A new bitmap set at every index where either operand is set.
    pub fn union(&self, other: &Bitmap) -> Bitmap {
        let mut out = Bitmap::new();
        for (o, (a, b)) in out.bits.iter_mut().zip(self.bits.iter().zip(other.bits.iter())) {
            *o = a | b;
        }
        out
    }

    /// Consume a byte stream and set the bit of every length-`NGRAM_CHARS`
    /// sliding window. Streams shorter than one window leave the bitmap
    /// unchanged. Gzip input is decoded transparently.
    pub fn apply_stream<R: Read>(&mut self, reader: R) -> Result<(), ScanError> {
        let mut source = TransparentGz::new(reader)?;
        let mut buf = [0u8; SCAN_BUF];
        let mut state = NgramState::default();
        // Bytes still missing before the first full window.
        let mut warmup = NGRAM_CHARS - 1;
        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if source.is_gzip() && e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(ScanError::TruncatedGzip);
                }
                Err(e) => return Err(ScanError::Io(e)),
            };
            for &byte in &buf[..n] {
                let index = state.push(byte);
                if warmup > 0 {
                    warmup -= 1;
                } else {
                    self.set(index);
                }
            }
        }
        Ok(())
    }
}

impl Default for Bitmap {
    fn default() -> Self {
        Self::new()
    }
}

// ── Transparent gzip source ──────────────────────────────────────────────────

/// Reader that sniffs the gzip magic and decodes gzip members on the fly;
/// anything else passes through untouched.
enum TransparentGz<R: Read> {
    Plain(io::Chain<io::Cursor<Vec<u8>>, R>),
    Gzip(MultiGzDecoder<io::Chain<io::Cursor<Vec<u8>>, R>>),
}

impl<R: Read> TransparentGz<R> {
    fn new(mut reader: R) -> io::Result<Self> {
        let mut head = Vec::with_capacity(2);
        let mut byte = [0u8; 1];
        while head.len() < 2 {
            match reader.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => head.push(byte[0]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        let gzip = head == GZIP_MAGIC;
        let chained = io::Cursor::new(head).chain(reader);
        Ok(if gzip {
            TransparentGz::Gzip(MultiGzDecoder::new(chained))
        } else {
            TransparentGz::Plain(chained)
        })
    }

    fn is_gzip(&self) -> bool {
        matches!(self, TransparentGz::Gzip(_))
    }
}

impl<R: Read> Read for TransparentGz<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            TransparentGz::Plain(r) => r.read(buf),
            TransparentGz::Gzip(r) => r.read(buf),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn empty_stream_leaves_bitmap_zero() {
        let mut b = Bitmap::new();
        b.apply_stream(&b""[..]).unwrap();
        assert_eq!(b.count_ones(), 0);
    }

    #[test]
    fn stream_shorter_than_window_leaves_bitmap_zero() {
        let mut b = Bitmap::new();
        b.apply_stream(&b"aaaa"[..]).unwrap();
        assert_eq!(b.count_ones(), 0);
    }

    #[test]
    fn single_window_sets_exactly_one_bit() {
        // 'a' & 0xF = 1, five times over: 0x11111.
        let mut b = Bitmap::new();
        b.apply_stream(&b"aaaaa"[..]).unwrap();
        assert!(b.get(0x11111));
        assert_eq!(b.count_ones(), 1);
    }

    #[test]
    fn overlapping_windows_set_both_bits() {
        let mut b = Bitmap::new();
        b.apply_stream(&b"aaaaaz"[..]).unwrap();
        let second = ((0x11111 << NGRAM_CHAR_BITS) & NGRAM_MASK) | (b'z' as u32 & CHAR_MASK);
        assert!(b.get(0x11111));
        assert!(b.get(second));
        assert_eq!(second, 0x1111A);
        assert_eq!(b.count_ones(), 2);
    }

    #[test]
    fn gzip_input_matches_plain_input() {
        let text = b"the quick brown fox jumps over the lazy dog";
        let mut plain = Bitmap::new();
        plain.apply_stream(&text[..]).unwrap();

        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(text).unwrap();
        let gz = enc.finish().unwrap();

        let mut zipped = Bitmap::new();
        zipped.apply_stream(&gz[..]).unwrap();
        assert_eq!(plain.as_bytes(), zipped.as_bytes());
    }

    #[test]
    fn truncated_gzip_is_reported() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&vec![b'x'; 4096]).unwrap();
        let mut gz = enc.finish().unwrap();
        gz.truncate(gz.len() / 2);

        let mut b = Bitmap::new();
        match b.apply_stream(&gz[..]) {
            Err(ScanError::TruncatedGzip) => {}
            other => panic!("expected TruncatedGzip, got {other:?}"),
        }
    }

    #[test]
    fn union_sets_bits_of_both_operands() {
        let mut a = Bitmap::new();
        let mut b = Bitmap::new();
        a.set(7);
        b.set(0x11111);
        let u = a.union(&b);
        assert!(u.get(7));
        assert!(u.get(0x11111));
        assert_eq!(u.count_ones(), 2);
    }
}
