//! # Priority Bitmap
//!
//! Two-level presence set over all priority levels. Each of the
//! `PRIORITY_LEVELS / 32` words covers 32 levels; a summary word has bit
//! *w* set whenever word *w* is non-zero. Finding the highest occupied
//! level is two `leading_zeros` operations (CLZ on Cortex-M4), independent
//! of how many levels are occupied.
//!
//! ```text
//!   summary:  0b...0101          words[2] != 0, words[0] != 0
//!                 │ │
//!   words[2]: 0b..1000.. ───► highest level = 2*32 + bit
//!   words[0]: 0b....01
//! ```

use crate::config::PRIORITY_LEVELS;
use crate::task::Priority;

const WORDS: usize = PRIORITY_LEVELS / 32;

/// Set of occupied priority levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityBitmap {
    summary: u32,
    words: [u32; WORDS],
}

#[inline]
const fn split(level: Priority) -> (usize, u32) {
    (level.index() / 32, 1 << (level.index() % 32))
}

#[inline]
const fn top_bit(word: u32) -> u32 {
    31 - word.leading_zeros()
}

impl PriorityBitmap {
    pub const fn new() -> Self {
        Self {
            summary: 0,
            words: [0; WORDS],
        }
    }

    #[inline]
    pub fn set(&mut self, level: Priority) {
        let (w, bit) = split(level);
        self.words[w] |= bit;
        self.summary |= 1 << w;
    }

    #[inline]
    pub fn clear(&mut self, level: Priority) {
        let (w, bit) = split(level);
        self.words[w] &= !bit;
        if self.words[w] == 0 {
            self.summary &= !(1 << w);
        }
    }

    #[inline]
    pub fn is_set(&self, level: Priority) -> bool {
        let (w, bit) = split(level);
        self.words[w] & bit != 0
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.summary == 0
    }

    /// Highest occupied level, O(1).
    #[inline]
    pub fn highest(&self) -> Option<Priority> {
        if self.summary == 0 {
            return None;
        }
        let w = top_bit(self.summary) as usize;
        let bit = top_bit(self.words[w]) as usize;
        Some(level_at(w * 32 + bit))
    }

    /// Highest occupied level strictly below `level`.
    pub fn next_below(&self, level: Priority) -> Option<Priority> {
        let (w, bit) = split(level);
        let below = self.words[w] & (bit - 1);
        if below != 0 {
            return Some(level_at(w * 32 + top_bit(below) as usize));
        }
        let lower_words = self.summary & ((1u32 << w) - 1);
        if lower_words == 0 {
            return None;
        }
        let lw = top_bit(lower_words) as usize;
        Some(level_at(lw * 32 + top_bit(self.words[lw]) as usize))
    }

    /// Occupied levels, most urgent first.
    pub fn iter(&self) -> impl Iterator<Item = Priority> + '_ {
        let mut next = self.highest();
        core::iter::from_fn(move || {
            let current = next?;
            next = self.next_below(current);
            Some(current)
        })
    }

    /// Number of occupied levels.
    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    pub fn clear_all(&mut self) {
        *self = Self::new();
    }

    /// Summary word agrees with the level words.
    pub fn summary_consistent(&self) -> bool {
        self.words
            .iter()
            .enumerate()
            .all(|(w, word)| (*word != 0) == (self.summary & (1 << w) != 0))
    }
}

impl Default for PriorityBitmap {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn level_at(index: usize) -> Priority {
    // index < PRIORITY_LEVELS <= 256 by construction
    match Priority::new(index as u8) {
        Ok(p) => p,
        Err(_) => Priority::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(raw: u8) -> Priority {
        Priority::new(raw).unwrap()
    }

    #[test]
    fn test_empty_bitmap() {
        let bm = PriorityBitmap::new();
        assert!(bm.is_empty());
        assert_eq!(bm.highest(), None);
        assert_eq!(bm.next_below(p(200)), None);
    }

    #[test]
    fn test_highest_across_words() {
        let mut bm = PriorityBitmap::new();
        bm.set(p(3));
        bm.set(p(64));
        bm.set(p(31));
        assert_eq!(bm.highest(), Some(p(64)));
        bm.clear(p(64));
        assert_eq!(bm.highest(), Some(p(31)));
        bm.set(p(255));
        assert_eq!(bm.highest(), Some(p(255)));
        assert!(bm.summary_consistent());
    }

    #[test]
    fn test_next_below_and_iter() {
        let mut bm = PriorityBitmap::new();
        for raw in [0, 7, 32, 33, 200] {
            bm.set(p(raw));
        }
        assert_eq!(bm.next_below(p(200)), Some(p(33)));
        assert_eq!(bm.next_below(p(33)), Some(p(32)));
        assert_eq!(bm.next_below(p(32)), Some(p(7)));
        assert_eq!(bm.next_below(p(0)), None);

        let order: Vec<u8> = bm.iter().map(|l| l.get()).collect();
        assert_eq!(order, vec![200, 33, 32, 7, 0]);
        assert_eq!(bm.count(), 5);
    }

    #[test]
    fn test_clear_keeps_summary_in_sync() {
        let mut bm = PriorityBitmap::new();
        bm.set(p(40));
        bm.set(p(41));
        bm.clear(p(40));
        assert!(bm.is_set(p(41)));
        bm.clear(p(41));
        assert!(bm.is_empty());
        assert!(bm.summary_consistent());
    }
}
