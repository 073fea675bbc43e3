#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block {
    pub offset: u64,
    pub size: u64,
}
impl Block {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Set of byte ranges, kept sorted by offset with touching or overlapping ranges merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockStructure {
    blocks: Vec<Block>,
}
impl BlockStructure {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn from_block(offset: u64, size: u64) -> Self {
        let mut structure = Self::new();
        structure.add(offset, size);
        structure
    }
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
    pub fn total_size(&self) -> u64 {
        self.blocks.iter().map(|b| b.size).sum()
    }
    /// The only block when the structure is one contiguous range.
    pub fn single_block(&self) -> Option<Block> {
        match self.blocks.as_slice() {
            [block] => Some(*block),
            _ => None,
        }
    }

    pub fn add(&mut self, offset: u64, size: u64) {
        if size == 0 {
            return;
        }
        let mut merged = Block::new(offset, size);
        // first block that touches or follows the new range
        let first = self.blocks.partition_point(|b| b.end() < merged.offset);
        let mut last = first;
        while last < self.blocks.len() && self.blocks[last].offset <= merged.end() {
            let block = self.blocks[last];
            let end = block.end().max(merged.end());
            merged.offset = merged.offset.min(block.offset);
            merged.size = end - merged.offset;
            last += 1;
        }
        self.blocks.splice(first..last, [merged]);
    }
    pub fn add_structure(&mut self, other: &BlockStructure) {
        for block in &other.blocks {
            self.add(block.offset, block.size);
        }
    }

    pub fn intersect(&self, other: &BlockStructure) -> BlockStructure {
        let mut blocks = vec![];
        let (mut i, mut j) = (0, 0);
        while i < self.blocks.len() && j < other.blocks.len() {
            let a = self.blocks[i];
            let b = other.blocks[j];
            let start = a.offset.max(b.offset);
            let end = a.end().min(b.end());
            if start < end {
                blocks.push(Block::new(start, end - start));
            }
            if a.end() < b.end() {
                i += 1;
            } else {
                j += 1;
            }
        }
        BlockStructure { blocks }
    }
    pub fn intersects(&self, other: &BlockStructure) -> bool {
        !self.intersect(other).is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_add_merges() {
        let mut s = BlockStructure::new();
        s.add(10, 5);
        s.add(30, 10);
        s.add(0, 2);
        assert_eq!(3, s.blocks().len());
        s.add(15, 15); // bridges [10,15) and [30,40)
        assert_eq!(&[Block::new(0, 2), Block::new(10, 30)], s.blocks());
        s.add(2, 8);
        assert_eq!(Some(Block::new(0, 40)), s.single_block());
        s.add(5, 100);
        assert_eq!(Some(Block::new(0, 105)), s.single_block());
        assert_eq!(105, s.total_size());
    }

    #[test]
    fn test_intersect() {
        let mut a = BlockStructure::new();
        a.add(0, 10);
        a.add(20, 10);
        let mut b = BlockStructure::new();
        b.add(5, 20);
        assert_eq!(&[Block::new(5, 5), Block::new(20, 5)], a.intersect(&b).blocks());
        assert!(!a.intersects(&BlockStructure::from_block(10, 10)));
        assert!(a.intersects(&BlockStructure::from_block(29, 10)));
    }
}
