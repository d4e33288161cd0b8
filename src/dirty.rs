//! Per-slot dirty page tracking.
//!
//! One bit per guest page, relative to the owning slot's base. Writers set
//! bits concurrently with log retrieval; a bit that is set stays set until
//! [`DirtyBitmap::clear`] is called by whichever layer drives log rotation.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::slots::PAGE_SHIFT;

const BITS_PER_WORD: u64 = 64;

/// Number of bytes needed to hold one bit per page, rounded up to whole
/// 64-bit words.
pub fn bitmap_bytes(npages: u64) -> usize {
    let words = npages.div_ceil(BITS_PER_WORD);
    (words * 8) as usize
}

/// Atomic dirty bitmap for one memory slot.
///
/// The allocation is twice the minimum byte size: the second half is headroom
/// reserved for the log-retrieval protocol and never addresses extra pages.
#[derive(Debug)]
pub struct DirtyBitmap {
    words: Box<[AtomicU64]>,
    npages: u64,
}

impl DirtyBitmap {
    pub fn new(npages: u64) -> Self {
        let words = 2 * (bitmap_bytes(npages) / 8);
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            npages,
        }
    }

    /// Number of guest pages covered by this bitmap.
    pub fn npages(&self) -> u64 {
        self.npages
    }

    /// Bytes of meaningful bitmap data (the first, non-headroom half).
    pub fn bytes(&self) -> usize {
        bitmap_bytes(self.npages)
    }

    /// Set the dirty bit for the page at `rel_gfn` pages past the slot base.
    pub fn set(&self, rel_gfn: u64) {
        debug_assert!(rel_gfn < self.npages);
        let word = (rel_gfn / BITS_PER_WORD) as usize;
        let bit = rel_gfn % BITS_PER_WORD;
        self.words[word].fetch_or(1 << bit, Ordering::SeqCst);
    }

    pub fn test(&self, rel_gfn: u64) -> bool {
        debug_assert!(rel_gfn < self.npages);
        let word = (rel_gfn / BITS_PER_WORD) as usize;
        let bit = rel_gfn % BITS_PER_WORD;
        self.words[word].load(Ordering::SeqCst) & (1 << bit) != 0
    }

    /// Copy the meaningful bitmap bytes (little-endian bit order, matching
    /// page index order) into `dst`, which must be exactly [`Self::bytes`]
    /// long.
    pub fn copy_to(&self, dst: &mut [u8]) {
        assert_eq!(dst.len(), self.bytes());
        for (chunk, word) in dst.chunks_mut(8).zip(self.words.iter()) {
            let bytes = word.load(Ordering::SeqCst).to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    /// Whether any page has been marked dirty since the last clear.
    pub fn any_set(&self) -> bool {
        let words = self.bytes() / 8;
        self.words[..words]
            .iter()
            .any(|w| w.load(Ordering::SeqCst) != 0)
    }

    /// Reset every bit. Log rotation policy lives outside the core; this is
    /// the primitive it builds on.
    pub fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::SeqCst);
        }
    }
}

/// Guest page number for a guest physical address.
pub(crate) fn gpa_to_gfn(gpa: u64) -> u64 {
    gpa >> PAGE_SHIFT
}
