//! Query-side n-gram filtering — sum-of-products over bitmap indices.
//!
//! A filter is a disjunction of conjunctions: each conjunction is the set of
//! n-gram indices of one literal substring, and a candidate bitmap matches
//! when at least one conjunction has *all* of its bits set. A file whose
//! bitmap matches may still not contain the substring (hash aliasing); a
//! file whose bitmap does not match cannot contain it. The filter is always
//! safe to apply: under-selective, never over-selective.

use crate::bitmap::{Bitmap, NgramState, NGRAM_CHARS};

/// Bitmap indices of every length-`NGRAM_CHARS` window of `s`, in stream
/// order. Strings shorter than one window produce a single synthetic index:
/// the partial window folded into the low bits, zeros above.
pub fn ngram_indices(s: &[u8]) -> Vec<u32> {
    if s.is_empty() {
        return Vec::new();
    }
    let mut state = NgramState::default();
    if s.len() < NGRAM_CHARS {
        let mut last = 0;
        for &byte in s {
            last = state.push(byte);
        }
        return vec![last];
    }
    let mut indices = Vec::with_capacity(s.len() - NGRAM_CHARS + 1);
    for (i, &byte) in s.iter().enumerate() {
        let index = state.push(byte);
        if i + 1 >= NGRAM_CHARS {
            indices.push(index);
        }
    }
    indices
}

/// All indices of all `terms`, merged and sorted ascending, ready for
/// ordered set operations. Duplicates are kept.
pub fn sorted_indices<S: AsRef<[u8]>>(terms: &[S]) -> Vec<u32> {
    let mut all: Vec<u32> = terms.iter().flat_map(|t| ngram_indices(t.as_ref())).collect();
    all.sort_unstable();
    all
}

// ── Filter ───────────────────────────────────────────────────────────────────

/// Sum-of-products filter over bitmap indices.
#[derive(Debug, Clone, Default)]
pub struct NgramFilter {
    conjunctions: Vec<Vec<u32>>,
}

impl NgramFilter {
    pub fn new(conjunctions: Vec<Vec<u32>>) -> Self {
        Self { conjunctions }
    }

    /// One conjunction per term: a bitmap matches when it holds every
    /// n-gram of *some* term (OR of substrings).
    pub fn any_of<S: AsRef<[u8]>>(terms: &[S]) -> Self {
        Self::new(terms.iter().map(|t| ngram_indices(t.as_ref())).collect())
    }

    /// One conjunction with every n-gram of every term: a bitmap matches
    /// only when it holds all of them (AND of substrings).
    pub fn all_of<S: AsRef<[u8]>>(terms: &[S]) -> Self {
        Self::new(vec![sorted_indices(terms)])
    }

    pub fn is_empty(&self) -> bool {
        self.conjunctions.is_empty()
    }

    pub fn conjunctions(&self) -> &[Vec<u32>] {
        &self.conjunctions
    }

    /// Does some conjunction have all of its bits set in `bitmap`?
    /// An empty filter matches nothing.
    pub fn matches(&self, bitmap: &Bitmap) -> bool {
        self.conjunctions
            .iter()
            .any(|conj| conj.iter().all(|&index| bitmap.get(index)))
    }

    /// True when the file behind `bitmap` cannot match any conjunction and
    /// scanning it can be skipped.
    pub fn should_skip(&self, bitmap: &Bitmap) -> bool {
        !self.matches(bitmap)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_indices_match_the_bitmap_builder() {
        let mut bitmap = Bitmap::new();
        bitmap.apply_stream(&b"error: disk offline"[..]).unwrap();
        for index in ngram_indices(b"disk offline") {
            assert!(bitmap.get(index));
        }
    }

    #[test]
    fn full_window_count() {
        assert_eq!(ngram_indices(b"aaaaa"), vec![0x11111]);
        assert_eq!(ngram_indices(b"aaaaaz").len(), 2);
        assert_eq!(ngram_indices(b"abcdefgh").len(), 4);
    }

    #[test]
    fn short_term_yields_one_synthetic_index() {
        assert_eq!(ngram_indices(b"ab").len(), 1);
        assert_eq!(ngram_indices(b""), Vec::<u32>::new());
    }

    #[test]
    fn sorted_indices_are_sorted() {
        let got = sorted_indices(&[b"zyxwvu".as_ref(), b"abcdef".as_ref()]);
        assert!(got.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(got.len(), 4);
    }

    #[test]
    fn any_of_matches_when_one_term_is_present() {
        let mut bitmap = Bitmap::new();
        bitmap.apply_stream(&b"connection reset by peer"[..]).unwrap();

        let filter = NgramFilter::any_of(&[b"no such term here".as_ref(), b"reset".as_ref()]);
        assert!(filter.matches(&bitmap));
        assert!(!filter.should_skip(&bitmap));
    }

    #[test]
    fn all_of_requires_every_term() {
        let mut bitmap = Bitmap::new();
        bitmap.apply_stream(&b"connection reset by peer"[..]).unwrap();

        assert!(NgramFilter::all_of(&[b"connection".as_ref(), b"peer".as_ref()]).matches(&bitmap));
        assert!(NgramFilter::all_of(&[b"connection".as_ref(), b"zzzzz".as_ref()])
            .should_skip(&bitmap));
    }

    #[test]
    fn empty_filter_matches_nothing() {
        let bitmap = Bitmap::new();
        let filter = NgramFilter::default();
        assert!(!filter.matches(&bitmap));
        assert!(filter.should_skip(&bitmap));
    }
}
