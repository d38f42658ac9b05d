// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use fixedbitset::FixedBitSet;

///
/// A packed bitset over topological indices, marking the nodes that must be re-examined in the
/// next pass.
///
/// The scan cursor skips whole blocks of zeros, so a pass over a mostly clean graph touches a
/// handful of words rather than every node.
///
pub struct DirtySet {
    bits: FixedBitSet,
}

// FixedBitSet packs into 32-bit blocks.
const BLOCK_BITS: usize = 32;

impl DirtySet {
    pub fn new(len: usize) -> DirtySet {
        DirtySet {
            bits: FixedBitSet::with_capacity(len),
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    #[inline]
    pub fn insert(&mut self, topo_index: usize) {
        self.bits.insert(topo_index);
    }

    #[inline]
    pub fn remove(&mut self, topo_index: usize) {
        self.bits.set(topo_index, false);
    }

    #[inline]
    pub fn contains(&self, topo_index: usize) -> bool {
        self.bits.contains(topo_index)
    }

    pub fn count_ones(&self) -> usize {
        self.bits.count_ones(..)
    }

    pub fn is_empty(&self) -> bool {
        self.count_ones() == 0
    }

    ///
    /// The smallest set bit at or after `from`, skipping empty blocks word-at-a-time.
    ///
    pub fn next_set_bit(&self, from: usize) -> Option<usize> {
        let len = self.bits.len();
        if from >= len {
            return None;
        }
        let blocks = self.bits.as_slice();
        let mut block_index = from / BLOCK_BITS;
        let mut block = blocks[block_index] & (!0_u32 << (from % BLOCK_BITS));
        loop {
            if block != 0 {
                let bit = block_index * BLOCK_BITS + block.trailing_zeros() as usize;
                // The final block may carry capacity bits past `len`.
                return if bit < len { Some(bit) } else { None };
            }
            block_index += 1;
            if block_index >= blocks.len() {
                return None;
            }
            block = blocks[block_index];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DirtySet;

    #[test]
    fn set_clear_test() {
        let mut dirty = DirtySet::new(80);
        assert!(dirty.is_empty());
        dirty.insert(3);
        dirty.insert(64);
        assert!(dirty.contains(3));
        assert!(dirty.contains(64));
        assert!(!dirty.contains(4));
        assert_eq!(dirty.count_ones(), 2);
        dirty.remove(3);
        assert!(!dirty.contains(3));
        assert_eq!(dirty.count_ones(), 1);
    }

    #[test]
    fn scan_skips_empty_blocks() {
        let mut dirty = DirtySet::new(200);
        dirty.insert(0);
        dirty.insert(130);
        dirty.insert(199);
        assert_eq!(dirty.next_set_bit(0), Some(0));
        assert_eq!(dirty.next_set_bit(1), Some(130));
        assert_eq!(dirty.next_set_bit(130), Some(130));
        assert_eq!(dirty.next_set_bit(131), Some(199));
        assert_eq!(dirty.next_set_bit(200), None);
    }

    #[test]
    fn scan_drains_in_order() {
        let mut dirty = DirtySet::new(300);
        for index in [7_usize, 31, 32, 63, 64, 255, 299] {
            dirty.insert(index);
        }
        let mut drained = Vec::new();
        let mut cursor = 0_usize;
        while let Some(index) = dirty.next_set_bit(cursor) {
            dirty.remove(index);
            drained.push(index);
            cursor = index + 1;
        }
        assert_eq!(drained, vec![7, 31, 32, 63, 64, 255, 299]);
        assert!(dirty.is_empty());
    }

    #[test]
    fn empty_set_scans_to_none() {
        let dirty = DirtySet::new(0);
        assert_eq!(dirty.next_set_bit(0), None);
    }
}
