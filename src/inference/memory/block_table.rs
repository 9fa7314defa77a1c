//! Block tables - map logical block indices to physical block IDs

use super::BlockId;
use crate::error::{Error, Result};

/// Per-sequence block table - maps logical block indices to physical block IDs
#[derive(Debug, Clone)]
pub struct BlockTable {
    pub blocks: Vec<BlockId>,
    pub num_tokens: usize,
    pub block_size: usize,
}

impl BlockTable {
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            num_tokens: 0,
            block_size,
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks_needed(num_tokens: usize, block_size: usize) -> usize {
        num_tokens.div_ceil(block_size)
    }

    pub fn additional_blocks_needed(&self, additional_tokens: usize) -> usize {
        let total_tokens = self.num_tokens + additional_tokens;
        let total_blocks_needed = Self::blocks_needed(total_tokens, self.block_size);
        total_blocks_needed.saturating_sub(self.blocks.len())
    }

    pub fn append_blocks(&mut self, new_blocks: Vec<BlockId>) {
        self.blocks.extend(new_blocks);
    }

    pub fn set_num_tokens(&mut self, num_tokens: usize) {
        self.num_tokens = num_tokens;
    }

    pub fn get_block(&self, logical_idx: usize) -> Option<BlockId> {
        self.blocks.get(logical_idx).copied()
    }

    pub fn get_slot(&self, token_pos: usize) -> Option<(BlockId, usize)> {
        let logical_block = token_pos / self.block_size;
        let slot_in_block = token_pos % self.block_size;
        self.get_block(logical_block)
            .map(|block_id| (block_id, slot_in_block))
    }

    /// Flat slot index (`block * block_size + slot`) for a logical token position,
    /// the form consumed by [`PagedKvCache::reshape_and_cache`](crate::inference::PagedKvCache::reshape_and_cache).
    pub fn slot_mapping(&self, token_pos: usize) -> Option<i32> {
        self.get_slot(token_pos)
            .map(|(block, slot)| (block as usize * self.block_size + slot) as i32)
    }

    pub fn to_device_format(&self) -> Vec<i32> {
        self.blocks.iter().map(|&b| b as i32).collect()
    }
}

/// Batched block table: `[num_seqs, max_blocks_per_seq]` of `i32`.
///
/// Rows shorter than `max_blocks_per_seq` are padded with `-1`. Padding is
/// never dereferenced for positions below the sequence's `kv_len`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTables {
    data: Vec<i32>,
    num_seqs: usize,
    max_blocks: usize,
}

impl BlockTables {
    /// Padding value for unused table entries.
    pub const PAD: i32 = -1;

    /// Wrap a flat `[num_seqs, max_blocks]` table.
    pub fn new(data: Vec<i32>, num_seqs: usize, max_blocks: usize) -> Result<Self> {
        if data.len() != num_seqs * max_blocks {
            return Err(Error::shape("block_table", &[num_seqs, max_blocks], &[data.len()]));
        }
        Ok(Self {
            data,
            num_seqs,
            max_blocks,
        })
    }

    /// Build from ragged rows, padding to the longest row.
    pub fn from_rows(rows: &[Vec<i32>]) -> Self {
        let max_blocks = rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut data = vec![Self::PAD; rows.len() * max_blocks];
        for (i, row) in rows.iter().enumerate() {
            data[i * max_blocks..i * max_blocks + row.len()].copy_from_slice(row);
        }
        Self {
            data,
            num_seqs: rows.len(),
            max_blocks,
        }
    }

    /// Build from per-sequence [`BlockTable`]s.
    pub fn from_tables(tables: &[BlockTable]) -> Self {
        let rows: Vec<Vec<i32>> = tables.iter().map(BlockTable::to_device_format).collect();
        Self::from_rows(&rows)
    }

    pub fn num_seqs(&self) -> usize {
        self.num_seqs
    }

    pub fn max_blocks(&self) -> usize {
        self.max_blocks
    }

    pub fn row(&self, seq: usize) -> Result<&[i32]> {
        if seq >= self.num_seqs {
            return Err(Error::OutOfRange {
                what: "sequence",
                index: seq,
                limit: self.num_seqs,
            });
        }
        Ok(&self.data[seq * self.max_blocks..(seq + 1) * self.max_blocks])
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.data
    }

    /// Check `row_len >= ceil(kv_len / block_size)` for every sequence.
    pub fn check_coverage(&self, kv_lens: &[usize], block_size: usize) -> Result<()> {
        if kv_lens.len() != self.num_seqs {
            return Err(Error::shape("kv_lens", &[self.num_seqs], &[kv_lens.len()]));
        }
        for &kv_len in kv_lens {
            let needed = BlockTable::blocks_needed(kv_len, block_size);
            if needed > self.max_blocks {
                return Err(Error::OutOfRange {
                    what: "logical block",
                    index: needed - 1,
                    limit: self.max_blocks,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_table_create() {
        let table = BlockTable::new(16);
        assert_eq!(table.num_blocks(), 0);
        assert_eq!(table.num_tokens, 0);
        assert_eq!(table.block_size, 16);
    }

    #[test]
    fn test_block_table_blocks_needed() {
        assert_eq!(BlockTable::blocks_needed(0, 16), 0);
        assert_eq!(BlockTable::blocks_needed(1, 16), 1);
        assert_eq!(BlockTable::blocks_needed(16, 16), 1);
        assert_eq!(BlockTable::blocks_needed(17, 16), 2);
        assert_eq!(BlockTable::blocks_needed(256, 128), 2);
    }

    #[test]
    fn test_block_table_additional_blocks() {
        let mut table = BlockTable::new(16);
        table.blocks = vec![0, 1];
        table.num_tokens = 20;

        assert_eq!(table.additional_blocks_needed(12), 0);
        assert_eq!(table.additional_blocks_needed(13), 1);
        assert_eq!(table.additional_blocks_needed(30), 2);
    }

    #[test]
    fn test_block_table_get_slot() {
        let mut table = BlockTable::new(16);
        table.blocks = vec![5, 10, 15];

        assert_eq!(table.get_slot(0), Some((5, 0)));
        assert_eq!(table.get_slot(15), Some((5, 15)));
        assert_eq!(table.get_slot(16), Some((10, 0)));
        assert_eq!(table.get_slot(48), None);
        assert_eq!(table.slot_mapping(17), Some(10 * 16 + 1));
    }

    #[test]
    fn test_block_tables_padding() {
        let tables = BlockTables::from_rows(&[vec![3, 1], vec![7]]);
        assert_eq!(tables.num_seqs(), 2);
        assert_eq!(tables.max_blocks(), 2);
        assert_eq!(tables.row(1).unwrap(), &[7, BlockTables::PAD]);
        assert!(matches!(
            tables.row(2),
            Err(Error::OutOfRange { index: 2, .. })
        ));
    }

    #[test]
    fn test_block_tables_coverage() {
        let tables = BlockTables::from_rows(&[vec![0, 1], vec![2, 3]]);
        assert!(tables.check_coverage(&[32, 17], 16).is_ok());
        assert!(tables.check_coverage(&[33, 0], 16).is_err());
        assert!(tables.check_coverage(&[1], 16).is_err());
    }

    #[test]
    fn test_block_tables_flat_shape_checked() {
        assert!(BlockTables::new(vec![0; 6], 2, 3).is_ok());
        assert!(matches!(
            BlockTables::new(vec![0; 5], 2, 3),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
