// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;

use crate::Asid;

const BITS: usize = usize::BITS as usize;

/// One bit per ASID in `0..=asid_max`, set when the ASID may not be handed out.
///
/// The kernel ASID is always set, it is part of every reset state.
#[derive(Clone, PartialEq, Eq)]
pub struct AsidBitmap {
    words: Vec<usize>,
    asid_max: u16,
}

impl fmt::Debug for AsidBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsidBitmap")
            .field("asid_max", &self.asid_max)
            .field("in_use", &self.count_user())
            .finish_non_exhaustive()
    }
}

impl AsidBitmap {
    /// Returns a bitmap in its reset state covering `0..=asid_max`.
    pub fn new(asid_max: u16) -> Self {
        let len = (usize::from(asid_max) + 1).div_ceil(BITS);
        let mut this = Self {
            words: vec![0; len],
            asid_max,
        };
        this.reset();
        this
    }

    pub const fn asid_max(&self) -> u16 {
        self.asid_max
    }

    /// Clears every bit except the kernel reservation.
    pub fn reset(&mut self) {
        self.words.fill(0);
        self.words[0] = 1 << Asid::KERNEL.get();
    }

    /// # Panics
    ///
    /// Panics if `asid` is larger than the largest ASID this bitmap covers.
    pub fn contains(&self, asid: u16) -> bool {
        let (word, bit) = self.locate(asid);
        self.words[word] & (1 << bit) != 0
    }

    /// Marks `asid` as used, returning `true` if it was previously clear.
    ///
    /// # Panics
    ///
    /// Panics if `asid` is larger than the largest ASID this bitmap covers.
    pub fn insert(&mut self, asid: u16) -> bool {
        let (word, bit) = self.locate(asid);
        let was_clear = self.words[word] & (1 << bit) == 0;
        self.words[word] |= 1 << bit;
        was_clear
    }

    /// Marks `asid` as free, returning `true` if it was previously set.
    ///
    /// # Panics
    ///
    /// Panics if `asid` is the kernel ASID or larger than the largest ASID this bitmap covers.
    pub fn remove(&mut self, asid: u16) -> bool {
        assert!(
            asid != Asid::KERNEL.get(),
            "the kernel ASID reservation cannot be released"
        );
        let (word, bit) = self.locate(asid);
        let was_set = self.words[word] & (1 << bit) != 0;
        self.words[word] &= !(1 << bit);
        was_set
    }

    /// Number of user ASIDs currently marked, the kernel reservation is not counted.
    pub fn count_user(&self) -> usize {
        let total: u32 = self.words.iter().map(|word| word.count_ones()).sum();
        total as usize - usize::from(self.contains(Asid::KERNEL.get()))
    }

    /// Iterates over all marked user ASIDs in ascending order.
    pub fn iter_user(&self) -> impl Iterator<Item = u16> + '_ {
        (Asid::FIRST_USER..=self.asid_max).filter(|asid| self.contains(*asid))
    }

    /// Finds the first clear user ASID at or after `start`, wrapping around to the first user ASID
    /// once the end of the ASID space is reached.
    pub fn find_clear_from(&self, start: u16) -> Option<u16> {
        let first = usize::from(Asid::FIRST_USER);
        let end = usize::from(self.asid_max) + 1;
        let start = usize::from(start).clamp(first, end);

        self.first_clear_in(start..end)
            .or_else(|| self.first_clear_in(first..start))
            .and_then(|asid| u16::try_from(asid).ok())
    }

    fn first_clear_in(&self, range: Range<usize>) -> Option<usize> {
        if range.is_empty() {
            return None;
        }

        let first_word = range.start / BITS;
        let last_word = (range.end - 1) / BITS;

        for idx in first_word..=last_word {
            let mut free = !self.words[idx];
            if idx == first_word {
                free &= usize::MAX << (range.start % BITS);
            }
            if idx == last_word {
                free &= usize::MAX >> (BITS - 1 - (range.end - 1) % BITS);
            }
            if free != 0 {
                return Some(idx * BITS + free.trailing_zeros() as usize);
            }
        }

        None
    }

    fn locate(&self, asid: u16) -> (usize, usize) {
        assert!(
            asid <= self.asid_max,
            "ASID {asid} out of range (max {})",
            self.asid_max
        );
        let n = usize::from(asid);
        (n / BITS, n % BITS)
    }
}
