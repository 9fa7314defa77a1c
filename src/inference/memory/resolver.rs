//! Logical → physical address resolution for the paged KV cache
//!
//! A logical `(sequence, position)` pair resolves to
//! `(block_table[seq][pos / block_size], pos % block_size)`. With the
//! compressed-head layout each KV head owns a contiguous range of
//! `num_blocks_per_head` physical blocks and the table entry is offset by
//! `kv_head * num_blocks_per_head`.

use super::BlockTables;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// How KV heads map onto physical blocks. Fixed when the cache is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HeadAddressing {
    /// Every slot stores all KV heads side by side.
    #[default]
    #[serde(alias = "standard")]
    Shared,
    /// Each KV head owns `num_blocks_per_head` blocks; a slot stores one head.
    CompressedHead { num_blocks_per_head: usize },
}

impl HeadAddressing {
    /// Number of KV heads stored per slot for a cache with `num_kv_heads` heads.
    pub fn heads_per_slot(&self, num_kv_heads: usize) -> usize {
        match self {
            HeadAddressing::Shared => num_kv_heads,
            HeadAddressing::CompressedHead { .. } => 1,
        }
    }

    /// Head index inside a slot for logical KV head `kv_head`.
    pub fn head_in_slot(&self, kv_head: usize) -> usize {
        match self {
            HeadAddressing::Shared => kv_head,
            HeadAddressing::CompressedHead { .. } => 0,
        }
    }

    /// Physical block holding `kv_head`'s data for table entry `table_block`.
    pub fn physical_block(&self, table_block: usize, kv_head: usize) -> usize {
        match self {
            HeadAddressing::Shared => table_block,
            HeadAddressing::CompressedHead {
                num_blocks_per_head,
            } => kv_head * num_blocks_per_head + table_block,
        }
    }

    /// Bound on raw table entries.
    pub(crate) fn table_entry_limit(&self, num_blocks: usize) -> usize {
        match self {
            HeadAddressing::Shared => num_blocks,
            HeadAddressing::CompressedHead {
                num_blocks_per_head,
            } => *num_blocks_per_head,
        }
    }
}

/// Physical address of one token slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotAddress {
    pub block: usize,
    pub slot: usize,
}

/// Pure lookup from logical KV positions to physical cache slots.
#[derive(Debug, Clone, Copy)]
pub struct BlockCacheResolver<'a> {
    tables: &'a BlockTables,
    kv_lens: &'a [usize],
    block_size: usize,
    num_blocks: usize,
    addressing: HeadAddressing,
}

impl<'a> BlockCacheResolver<'a> {
    pub fn new(
        tables: &'a BlockTables,
        kv_lens: &'a [usize],
        block_size: usize,
        num_blocks: usize,
        addressing: HeadAddressing,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::InvalidArgument {
                arg: "block_size",
                reason: "must be > 0".into(),
            });
        }
        tables.check_coverage(kv_lens, block_size)?;
        Ok(Self {
            tables,
            kv_lens,
            block_size,
            num_blocks,
            addressing,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn kv_len(&self, seq: usize) -> Result<usize> {
        self.kv_lens.get(seq).copied().ok_or(Error::OutOfRange {
            what: "sequence",
            index: seq,
            limit: self.kv_lens.len(),
        })
    }

    /// Resolve position `pos` of sequence `seq` for KV head `kv_head`.
    pub fn resolve(&self, seq: usize, pos: usize, kv_head: usize) -> Result<SlotAddress> {
        let kv_len = self.kv_len(seq)?;
        if pos >= kv_len {
            return Err(Error::OutOfRange {
                what: "kv position",
                index: pos,
                limit: kv_len,
            });
        }

        let row = self.tables.row(seq)?;
        let entry = row[pos / self.block_size];
        let limit = self.addressing.table_entry_limit(self.num_blocks);
        if entry < 0 || entry as usize >= limit {
            return Err(Error::OutOfRange {
                what: "block id",
                index: entry.max(0) as usize,
                limit,
            });
        }

        let block = self.addressing.physical_block(entry as usize, kv_head);
        if block >= self.num_blocks {
            return Err(Error::OutOfRange {
                what: "block id",
                index: block,
                limit: self.num_blocks,
            });
        }

        Ok(SlotAddress {
            block,
            slot: pos % self.block_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_shared() {
        let tables = BlockTables::from_rows(&[vec![5, 2], vec![7]]);
        let kv_lens = [20, 3];
        let r = BlockCacheResolver::new(&tables, &kv_lens, 16, 8, HeadAddressing::Shared).unwrap();

        assert_eq!(r.resolve(0, 0, 0).unwrap(), SlotAddress { block: 5, slot: 0 });
        assert_eq!(r.resolve(0, 17, 3).unwrap(), SlotAddress { block: 2, slot: 1 });
        assert_eq!(r.resolve(1, 2, 0).unwrap(), SlotAddress { block: 7, slot: 2 });
    }

    #[test]
    fn test_resolve_rejects_position_past_kv_len() {
        let tables = BlockTables::from_rows(&[vec![0, 1]]);
        let kv_lens = [20];
        let r = BlockCacheResolver::new(&tables, &kv_lens, 16, 2, HeadAddressing::Shared).unwrap();
        assert!(matches!(
            r.resolve(0, 20, 0),
            Err(Error::OutOfRange { what: "kv position", index: 20, limit: 20 })
        ));
        assert!(r.resolve(1, 0, 0).is_err());
    }

    #[test]
    fn test_resolve_rejects_block_beyond_pool() {
        let tables = BlockTables::from_rows(&[vec![9], vec![-1]]);
        let kv_lens = [4, 4];
        let r = BlockCacheResolver::new(&tables, &kv_lens, 16, 8, HeadAddressing::Shared).unwrap();
        assert!(matches!(
            r.resolve(0, 0, 0),
            Err(Error::OutOfRange { what: "block id", index: 9, limit: 8 })
        ));
        assert!(r.resolve(1, 0, 0).is_err());
    }

    #[test]
    fn test_short_table_fails_at_construction() {
        let tables = BlockTables::from_rows(&[vec![0]]);
        let kv_lens = [17];
        assert!(BlockCacheResolver::new(&tables, &kv_lens, 16, 4, HeadAddressing::Shared).is_err());
    }

    #[test]
    fn test_resolve_compressed_head_offsets_by_head() {
        let addressing = HeadAddressing::CompressedHead {
            num_blocks_per_head: 4,
        };
        let tables = BlockTables::from_rows(&[vec![1, 3]]);
        let kv_lens = [32];
        let r = BlockCacheResolver::new(&tables, &kv_lens, 16, 8, addressing).unwrap();

        assert_eq!(r.resolve(0, 0, 0).unwrap(), SlotAddress { block: 1, slot: 0 });
        assert_eq!(r.resolve(0, 0, 1).unwrap(), SlotAddress { block: 5, slot: 0 });
        assert_eq!(r.resolve(0, 31, 1).unwrap(), SlotAddress { block: 7, slot: 15 });
        assert_eq!(addressing.heads_per_slot(2), 1);
    }

    #[test]
    fn test_compressed_head_entry_bounded_by_head_range() {
        let addressing = HeadAddressing::CompressedHead {
            num_blocks_per_head: 4,
        };
        let tables = BlockTables::from_rows(&[vec![4]]);
        let kv_lens = [1];
        let r = BlockCacheResolver::new(&tables, &kv_lens, 16, 8, addressing).unwrap();
        assert!(matches!(
            r.resolve(0, 0, 0),
            Err(Error::OutOfRange { index: 4, limit: 4, .. })
        ));
    }
}
