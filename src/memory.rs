//! In-memory program image.
//!
//! Sparse, word-addressed view of the target's program and configuration
//! space. Every location is either *filled* (the hex source or a device
//! read supplied a value) or defaults to the family's erased pattern.
//! Unfilled locations are never programmed except as explicit erased-pattern
//! padding inside a partially filled write block.

use std::collections::BTreeMap;

/// Erased flash pattern of a device family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErasedPattern {
    /// 14-bit program words, erased to 0x3FFF.
    Word14,
    /// 24-bit instructions split over two image words: the even location
    /// holds the lower 16 bits (erased 0xFFFF), the odd location the upper
    /// byte (erased 0x00FF).
    Wide24,
}

impl ErasedPattern {
    pub fn value(self, addr: u32) -> u16 {
        match self {
            ErasedPattern::Word14 => 0x3FFF,
            ErasedPattern::Wide24 => {
                if addr % 2 == 0 {
                    0xFFFF
                } else {
                    0x00FF
                }
            }
        }
    }
}

/// Ordered mapping from word address to 16-bit value, plus the implicit
/// filled mask (presence in the map).
#[derive(Debug, Clone)]
pub struct MemoryImage {
    words: BTreeMap<u32, u16>,
    erased: ErasedPattern,
}

impl MemoryImage {
    pub fn new(erased: ErasedPattern) -> Self {
        MemoryImage {
            words: BTreeMap::new(),
            erased,
        }
    }

    pub fn erased_pattern(&self) -> ErasedPattern {
        self.erased
    }

    /// Value at `addr`: the stored word when filled, the erased pattern
    /// otherwise.
    pub fn word(&self, addr: u32) -> u16 {
        self.words.get(&addr).copied().unwrap_or(self.erased.value(addr))
    }

    pub fn filled(&self, addr: u32) -> bool {
        self.words.contains_key(&addr)
    }

    pub fn set(&mut self, addr: u32, value: u16) {
        self.words.insert(addr, value);
    }

    /// Merge one byte into the image, as the hex decoder sees them. Even
    /// byte addresses land in the low half of the word, odd ones in the
    /// high half; the untouched half of a previously unfilled word starts
    /// from zero, matching a zero-initialized image buffer.
    pub fn set_byte(&mut self, byte_addr: u32, value: u8) {
        let addr = byte_addr / 2;
        let cur = self.words.get(&addr).copied().unwrap_or(0);
        let word = if byte_addr % 2 == 0 {
            (cur & 0xFF00) | value as u16
        } else {
            (cur & 0x00FF) | ((value as u16) << 8)
        };
        self.words.insert(addr, word);
    }

    pub fn filled_count(&self) -> usize {
        self.words.len()
    }

    pub fn iter_filled(&self) -> impl Iterator<Item = (u32, u16)> + '_ {
        self.words.iter().map(|(&a, &w)| (a, w))
    }

    /// True if any location in `addr..addr + len` is filled.
    pub fn any_filled(&self, addr: u32, len: u32) -> bool {
        self.words.range(addr..addr + len).next().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unfilled_reads_erased_pattern() {
        let image = MemoryImage::new(ErasedPattern::Word14);
        assert_eq!(image.word(0), 0x3FFF);
        assert!(!image.filled(0));

        let image = MemoryImage::new(ErasedPattern::Wide24);
        assert_eq!(image.word(0x100), 0xFFFF);
        assert_eq!(image.word(0x101), 0x00FF);
    }

    #[test]
    fn set_and_read_back() {
        let mut image = MemoryImage::new(ErasedPattern::Word14);
        image.set(0x20, 0x1234);
        assert!(image.filled(0x20));
        assert_eq!(image.word(0x20), 0x1234);
        assert_eq!(image.filled_count(), 1);
    }

    #[test]
    fn byte_merge_halves() {
        let mut image = MemoryImage::new(ErasedPattern::Wide24);
        image.set_byte(0x10, 0x34);
        image.set_byte(0x11, 0x12);
        assert_eq!(image.word(0x8), 0x1234);
    }

    #[test]
    fn any_filled_window() {
        let mut image = MemoryImage::new(ErasedPattern::Word14);
        image.set(35, 1);
        assert!(image.any_filled(32, 32));
        assert!(!image.any_filled(0, 32));
        assert!(!image.any_filled(64, 32));
    }
}
