use bitvec::prelude::*;
use std::fmt;
use std::ops::Range;

/// Packed bit vector; the one set ADT the whole engine is expressed over.
///
/// Bit positions are either node indices (node maps) or flat core positions
/// produced by the core map (core maps). All binary operations require
/// equal-length operands.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct Bitmap(BitVec);

impl Bitmap {
    #[inline]
    pub fn zeros(nbits: usize) -> Self {
        Bitmap(BitVec::repeat(false, nbits))
    }

    pub fn from_indices(nbits: usize, indices: &[usize]) -> Self {
        let mut map = Self::zeros(nbits);
        for &i in indices {
            map.set(i);
        }
        map
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn test(&self, idx: usize) -> bool {
        self.0[idx]
    }

    #[inline]
    pub fn set(&mut self, idx: usize) {
        self.0.set(idx, true);
    }

    #[inline]
    pub fn clear(&mut self, idx: usize) {
        self.0.set(idx, false);
    }

    #[inline]
    pub fn assign(&mut self, idx: usize, value: bool) {
        self.0.set(idx, value);
    }

    /// Word-parallel popcount.
    #[inline]
    pub fn set_count(&self) -> usize {
        self.0.count_ones()
    }

    #[inline]
    pub fn count_range(&self, range: Range<usize>) -> usize {
        self.0[range].count_ones()
    }

    #[inline]
    pub fn first_set(&self) -> Option<usize> {
        self.0.first_one()
    }

    #[inline]
    pub fn last_set(&self) -> Option<usize> {
        self.0.last_one()
    }

    #[inline]
    pub fn any(&self) -> bool {
        self.0.any()
    }

    #[inline]
    pub fn range_any(&self, range: Range<usize>) -> bool {
        self.0[range].any()
    }

    pub fn clear_all(&mut self) {
        self.0.fill(false);
    }

    pub fn set_range(&mut self, range: Range<usize>) {
        self.0[range].fill(true);
    }

    pub fn clear_range(&mut self, range: Range<usize>) {
        self.0[range].fill(false);
    }

    pub fn or_with(&mut self, other: &Bitmap) {
        debug_assert_eq!(self.len(), other.len());
        self.0 |= other.0.as_bitslice();
    }

    pub fn and_with(&mut self, other: &Bitmap) {
        debug_assert_eq!(self.len(), other.len());
        self.0 &= other.0.as_bitslice();
    }

    pub fn and_not(&mut self, other: &Bitmap) {
        debug_assert_eq!(self.len(), other.len());
        self.0 &= !other.0.clone();
    }

    pub fn invert(&mut self) {
        let bits = std::mem::take(&mut self.0);
        self.0 = !bits;
    }

    /// OR `len` bits of `other` starting at `src_start` into `self` at `dst_start`.
    pub fn or_range(&mut self, dst_start: usize, other: &Bitmap, src_start: usize, len: usize) {
        let dst = &mut self.0[dst_start..dst_start + len];
        *dst |= &other.0[src_start..src_start + len];
    }

    /// Clear in `self` every bit set in `other[src_start..src_start+len]`,
    /// aligned at `dst_start`.
    pub fn and_not_range(&mut self, dst_start: usize, other: &Bitmap, src_start: usize, len: usize) {
        for i in other.0[src_start..src_start + len].iter_ones() {
            self.0.set(dst_start + i, false);
        }
    }

    /// True when `self[my]` and `other[theirs]` (ranges of equal length)
    /// share no set bit.
    pub fn range_disjoint(&self, my: Range<usize>, other: &Bitmap, theirs_start: usize) -> bool {
        self.0[my]
            .iter_ones()
            .all(|i| !other.0[theirs_start + i])
    }

    pub fn is_disjoint(&self, other: &Bitmap) -> bool {
        debug_assert_eq!(self.len(), other.len());
        self.0.iter_ones().all(|i| !other.0[i])
    }

    pub fn is_subset_of(&self, other: &Bitmap) -> bool {
        debug_assert_eq!(self.len(), other.len());
        self.0.iter_ones().all(|i| other.0[i])
    }

    /// Splice `range` out of the map, shifting the bits above it down.
    /// Used when a node leaves a packed per-job core map.
    pub fn remove_range(&mut self, range: Range<usize>) {
        let removed = range.len();
        let mut out = Bitmap::zeros(self.len() - removed);
        for i in self.0.iter_ones() {
            if i < range.start {
                out.set(i);
            } else if i >= range.end {
                out.set(i - removed);
            }
        }
        *self = out;
    }

    #[inline]
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter_ones()
    }

    /// Absolute positions of set bits within `range`.
    pub fn ones_in_range(&self, range: Range<usize>) -> impl Iterator<Item = usize> + '_ {
        let start = range.start;
        self.0[range].iter_ones().map(move |i| start + i)
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitmap[{}; ", self.0.len())?;
        let mut first = true;
        for idx in self.0.iter_ones() {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{idx}")?;
            first = false;
        }
        write!(f, "]")
    }
}
