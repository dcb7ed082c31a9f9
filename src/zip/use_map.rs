//! Free-space bookkeeping for an archive file.
//!
//! The file is modelled as contiguous, disjoint blocks covering
//! `[0, size)`. Each block is either free or owned by one key. Blocks are
//! indexed by start offset, and free blocks are also indexed by length so
//! that best-fit placement does not scan the whole file.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::ops::Range;

use crate::error::{Error, Result};

/// Strategy used to pick a free block for new data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PositionAlgorithm {
    /// Smallest free block that fits
    #[default]
    BestFit,
    /// Lowest-offset free block that fits
    FirstFit,
}

#[derive(Debug, Clone)]
struct Block<O> {
    end: u64,
    owner: Option<O>,
}

/// Map of used and free byte ranges in a file.
#[derive(Debug, Clone)]
pub struct FileUseMap<O> {
    size: u64,
    blocks: BTreeMap<u64, Block<O>>,
    /// Free blocks as `(len, start)`
    free: BTreeSet<(u64, u64)>,
    owners: HashMap<O, u64>,
    used: u64,
    min_free_size: u64,
}

impl<O: Copy + Eq + Hash + Debug> FileUseMap<O> {
    /// Create a map of `size` free bytes.
    ///
    /// Placement never leaves a free gap smaller than `min_free_size`
    /// between blocks.
    pub fn new(size: u64, min_free_size: u64) -> Self {
        let mut map = Self {
            size,
            blocks: BTreeMap::new(),
            free: BTreeSet::new(),
            owners: HashMap::new(),
            used: 0,
            min_free_size,
        };
        if size > 0 {
            map.insert_free(0, size);
        }
        map
    }

    /// Total tracked bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Sum of the sizes of all used blocks
    pub fn used_size(&self) -> u64 {
        self.used
    }

    /// End of the last used block, or 0 when nothing is used
    pub fn used_end(&self) -> u64 {
        match self.blocks.last_key_value() {
            Some((start, block)) if block.owner.is_none() => *start,
            Some(_) => self.size,
            None => 0,
        }
    }

    /// Grow the map to `size` bytes, appending free space.
    pub fn extend(&mut self, size: u64) -> Result<()> {
        if size < self.size {
            return Err(Error::InvalidState(format!(
                "cannot shrink file use map from {} to {}",
                self.size, size
            )));
        }
        if size == self.size {
            return Ok(());
        }

        let start = self.size;
        self.size = size;
        self.insert_free(start, size);
        self.coalesce(start);
        Ok(())
    }

    /// Mark `[start, end)` as used by `owner`.
    ///
    /// The range must lie entirely inside one free block.
    pub fn add(&mut self, start: u64, end: u64, owner: O) -> Result<()> {
        if start >= end || end > self.size {
            return Err(Error::InvalidState(format!(
                "range {}..{} is outside 0..{}",
                start, end, self.size
            )));
        }
        if self.owners.contains_key(&owner) {
            return Err(Error::InvalidState(format!(
                "{:?} already owns a block",
                owner
            )));
        }

        let (container_start, container_end) = match self.blocks.range(..=start).next_back() {
            Some((&s, block)) if block.owner.is_none() && block.end >= end => (s, block.end),
            _ => {
                return Err(Error::InvalidState(format!(
                    "range {}..{} overlaps a used block",
                    start, end
                )));
            }
        };

        self.remove_block(container_start);
        if container_start < start {
            self.insert_free(container_start, start);
        }
        self.blocks.insert(
            start,
            Block {
                end,
                owner: Some(owner),
            },
        );
        self.owners.insert(owner, start);
        self.used += end - start;
        if end < container_end {
            self.insert_free(end, container_end);
        }
        Ok(())
    }

    /// Free the block owned by `owner`, returning its range.
    pub fn remove(&mut self, owner: &O) -> Option<Range<u64>> {
        let start = *self.owners.get(owner)?;
        let block = self.remove_block(start)?;
        self.insert_free(start, block.end);
        self.coalesce(start);
        Some(start..block.end)
    }

    /// Free the used block spanning exactly `[start, end)`, returning its owner.
    pub fn remove_range(&mut self, start: u64, end: u64) -> Result<O> {
        match self.blocks.get(&start) {
            Some(Block {
                end: block_end,
                owner: Some(owner),
            }) if *block_end == end => {
                let owner = *owner;
                self.remove(&owner);
                Ok(owner)
            }
            _ => Err(Error::InvalidState(format!(
                "no used block spans {}..{}",
                start, end
            ))),
        }
    }

    /// Range currently owned by `owner`
    pub fn range_of(&self, owner: &O) -> Option<Range<u64>> {
        let start = *self.owners.get(owner)?;
        self.blocks.get(&start).map(|block| start..block.end)
    }

    /// Find where `len` bytes can go so that `start + align_offset` is a
    /// multiple of `align`.
    ///
    /// Returns a start inside an existing free block when one fits, or
    /// the aligned position after the last used block otherwise. In the
    /// latter case the caller must [`extend`](Self::extend) the map.
    pub fn locate_free(
        &self,
        len: u64,
        align_offset: u64,
        align: u64,
        algorithm: PositionAlgorithm,
    ) -> u64 {
        let candidates: Box<dyn Iterator<Item = (u64, u64)> + '_> = match algorithm {
            PositionAlgorithm::BestFit => Box::new(
                self.free
                    .range((len, 0)..)
                    .map(|&(size, start)| (start, start + size)),
            ),
            PositionAlgorithm::FirstFit => Box::new(
                self.blocks
                    .iter()
                    .filter(|(_, block)| block.owner.is_none())
                    .map(|(&start, block)| (start, block.end)),
            ),
        };

        for (start, end) in candidates {
            let padding = self.alignment_padding(start, align_offset, align);
            let Some(needed) = len.checked_add(padding) else {
                continue;
            };
            if end - start < needed {
                continue;
            }
            // A trailing gap smaller than the minimum is only tolerable at
            // the end of the file, where it gets truncated away.
            let left = end - start - needed;
            if left > 0 && left < self.min_free_size && end < self.size {
                continue;
            }
            return start + padding;
        }

        self.locate_tail(align_offset, align)
    }

    /// Aligned position right after the last used block
    pub fn locate_tail(&self, align_offset: u64, align: u64) -> u64 {
        let first_free = self.used_end();
        first_free + self.alignment_padding(first_free, align_offset, align)
    }

    /// Drop the trailing free block, if any
    pub fn truncate(&mut self) {
        let trailing = match self.blocks.last_key_value() {
            Some((&start, block)) if block.owner.is_none() => start,
            _ => return,
        };
        self.remove_block(trailing);
        self.size = trailing;
    }

    /// Free blocks, in file order, excluding a trailing one
    pub fn free_areas(&self) -> Vec<Range<u64>> {
        self.blocks
            .iter()
            .filter(|(_, block)| block.owner.is_none() && block.end != self.size)
            .map(|(&start, block)| start..block.end)
            .collect()
    }

    /// Free block ending exactly at `start`, if there is one
    pub fn free_before(&self, start: u64) -> Option<Range<u64>> {
        let (&prev_start, prev) = self.blocks.range(..start).next_back()?;
        (prev.owner.is_none() && prev.end == start).then_some(prev_start..prev.end)
    }

    /// Used blocks in file order
    pub fn used_blocks(&self) -> impl Iterator<Item = (Range<u64>, O)> + '_ {
        self.blocks
            .iter()
            .filter_map(|(&start, block)| block.owner.map(|owner| (start..block.end, owner)))
    }

    fn alignment_padding(&self, start: u64, align_offset: u64, align: u64) -> u64 {
        if align <= 1 {
            return 0;
        }
        let mut padding = (align - (start + align_offset) % align) % align;
        if padding > 0 && padding < self.min_free_size {
            padding += align * (self.min_free_size - padding).div_ceil(align);
        }
        padding
    }

    fn insert_free(&mut self, start: u64, end: u64) {
        self.blocks.insert(start, Block { end, owner: None });
        self.free.insert((end - start, start));
    }

    fn remove_block(&mut self, start: u64) -> Option<Block<O>> {
        let block = self.blocks.remove(&start)?;
        match block.owner {
            None => {
                self.free.remove(&(block.end - start, start));
            }
            Some(owner) => {
                self.owners.remove(&owner);
                self.used -= block.end - start;
            }
        }
        Some(block)
    }

    /// Merge the free block at `start` with free neighbours.
    fn coalesce(&mut self, start: u64) {
        let Some(end) = self.blocks.get(&start).map(|block| block.end) else {
            return;
        };

        let mut merged_start = start;
        let mut merged_end = end;
        if let Some(prev) = self.free_before(start) {
            merged_start = prev.start;
        }
        if let Some(next) = self.blocks.get(&end) {
            if next.owner.is_none() {
                merged_end = next.end;
            }
        }
        if merged_start == start && merged_end == end {
            return;
        }

        if merged_start != start {
            self.remove_block(merged_start);
        }
        if merged_end != end {
            self.remove_block(end);
        }
        self.remove_block(start);
        self.insert_free(merged_start, merged_end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_blocks(map: &FileUseMap<u32>) -> Vec<Range<u64>> {
        map.blocks
            .iter()
            .filter(|(_, b)| b.owner.is_none())
            .map(|(&s, b)| s..b.end)
            .collect()
    }

    #[test]
    fn test_add_splits_free_block() {
        let mut map = FileUseMap::new(100, 0);
        map.add(10, 20, 1u32).unwrap();

        assert_eq!(map.used_size(), 10);
        assert_eq!(free_blocks(&map), vec![0..10, 20..100]);
        assert_eq!(map.range_of(&1), Some(10..20));
    }

    #[test]
    fn test_add_rejects_overlap() {
        let mut map = FileUseMap::new(100, 0);
        map.add(10, 20, 1u32).unwrap();

        assert!(map.add(15, 25, 2).is_err());
        assert!(map.add(5, 11, 2).is_err());
        assert!(map.add(90, 101, 2).is_err());
        assert!(map.add(30, 40, 1).is_err());
        assert!(map.add(20, 30, 2).is_ok());
    }

    #[test]
    fn test_remove_coalesces_neighbours() {
        let mut map = FileUseMap::new(60, 0);
        map.add(0, 10, 1u32).unwrap();
        map.add(10, 20, 2).unwrap();
        map.add(20, 30, 3).unwrap();

        assert_eq!(map.remove(&1), Some(0..10));
        assert_eq!(map.remove(&3), Some(20..30));
        assert_eq!(free_blocks(&map), vec![0..10, 20..60]);

        assert_eq!(map.remove_range(10, 20).unwrap(), 2);
        assert_eq!(free_blocks(&map), vec![0..60]);
        assert_eq!(map.used_size(), 0);
        assert_eq!(map.free.len(), 1);
    }

    #[test]
    fn test_remove_range_requires_exact_span() {
        let mut map = FileUseMap::new(60, 0);
        map.add(10, 20, 1u32).unwrap();

        assert!(map.remove_range(10, 19).is_err());
        assert!(map.remove_range(0, 10).is_err());
        assert_eq!(map.remove(&7), None);
    }

    #[test]
    fn test_extend_merges_trailing_free_block() {
        let mut map = FileUseMap::new(0, 0);
        assert_eq!(map.used_end(), 0);

        map.extend(10).unwrap();
        map.add(0, 5, 1u32).unwrap();
        map.extend(20).unwrap();

        assert_eq!(map.size(), 20);
        assert_eq!(free_blocks(&map), vec![5..20]);
        assert!(map.extend(10).is_err());
    }

    #[test]
    fn test_best_fit_picks_smallest_block() {
        let mut map = FileUseMap::new(100, 0);
        map.add(10, 20, 1u32).unwrap();
        map.add(25, 40, 2).unwrap();
        map.add(48, 90, 3).unwrap();
        // free: 0..10, 20..25, 40..48, 90..100

        assert_eq!(map.locate_free(5, 0, 1, PositionAlgorithm::BestFit), 20);
        assert_eq!(map.locate_free(8, 0, 1, PositionAlgorithm::BestFit), 40);
        assert_eq!(map.locate_free(9, 0, 1, PositionAlgorithm::BestFit), 0);
        assert_eq!(map.locate_free(5, 0, 1, PositionAlgorithm::FirstFit), 0);
        // nothing fits: aligned tail after the last used block
        assert_eq!(map.locate_free(11, 0, 1, PositionAlgorithm::BestFit), 90);
    }

    #[test]
    fn test_locate_free_honors_alignment_offset() {
        let mut map = FileUseMap::new(100, 0);
        map.add(0, 3, 1u32).unwrap();

        // data starts 7 bytes after the block start and must land on 16
        let start = map.locate_free(10, 7, 16, PositionAlgorithm::BestFit);
        assert_eq!(start, 9);
        assert_eq!((start + 7) % 16, 0);

        // align 0 and 1 mean no constraint
        assert_eq!(map.locate_free(10, 7, 0, PositionAlgorithm::BestFit), 3);
        assert_eq!(map.locate_free(10, 7, 1, PositionAlgorithm::BestFit), 3);
    }

    #[test]
    fn test_locate_tail_when_nothing_fits() {
        let mut map = FileUseMap::new(50, 0);
        map.add(0, 45, 1u32).unwrap();

        let start = map.locate_free(20, 0, 8, PositionAlgorithm::BestFit);
        assert_eq!(start, 48);
        map.extend(start + 20).unwrap();
        map.add(start, start + 20, 2).unwrap();
        assert_eq!(map.size(), 68);
        assert_eq!(free_blocks(&map), vec![45..48]);
    }

    #[test]
    fn test_min_free_size_avoids_tiny_gaps() {
        let mut map = FileUseMap::new(100, 6);
        map.add(0, 10, 1u32).unwrap();
        map.add(30, 100, 2).unwrap();
        // free: 10..30

        // exact fit is fine, leaving 3 bytes behind is not
        assert_eq!(map.locate_free(20, 0, 1, PositionAlgorithm::BestFit), 10);
        assert_eq!(map.locate_free(17, 0, 1, PositionAlgorithm::BestFit), 100);
        assert_eq!(map.locate_free(14, 0, 1, PositionAlgorithm::BestFit), 10);

        // padding of 2 would be too small, so it grows by one alignment step
        assert_eq!(map.locate_free(4, 0, 4, PositionAlgorithm::BestFit), 16);
    }

    #[test]
    fn test_truncate_and_free_areas() {
        let mut map = FileUseMap::new(100, 0);
        map.add(10, 20, 1u32).unwrap();
        map.add(30, 40, 2).unwrap();

        assert_eq!(map.free_areas(), vec![0..10, 20..30]);
        assert_eq!(map.used_end(), 40);

        map.truncate();
        assert_eq!(map.size(), 40);
        assert_eq!(map.free_areas(), vec![0..10, 20..30]);
        assert_eq!(map.free_before(30), Some(20..30));
        assert_eq!(map.free_before(20), None);

        let used: Vec<_> = map.used_blocks().collect();
        assert_eq!(used, vec![(10..20, 1), (30..40, 2)]);
    }

    #[test]
    fn test_truncate_empty_map() {
        let mut map: FileUseMap<u32> = FileUseMap::new(30, 0);
        map.truncate();
        assert_eq!(map.size(), 0);
        assert_eq!(map.locate_tail(0, 1), 0);
    }
}
