//! Block-based memory allocator for the paged KV cache
//!
//! The cache is a fixed pool of `total_blocks` blocks of `block_size` token
//! slots. Sequences grow by taking blocks from a FIFO free list and address
//! them through a [`BlockTable`].

use super::BlockTable;
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Statistics for block allocator
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockAllocatorStats {
    pub total_blocks: usize,
    pub allocated_blocks: usize,
    pub free_blocks: usize,
    pub block_size: usize,
    pub total_allocations: usize,
    pub total_frees: usize,
    pub peak_usage: usize,
}

/// Block ID type - represents a physical block in the pool
pub type BlockId = u32;

/// Per-slot storage footprint used to size the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotFootprint {
    /// KV heads stored in each slot
    pub heads_per_slot: usize,
    /// Key width (non-rope + rope)
    pub key_dim: usize,
    /// Separately stored value width, 0 when values alias the key
    pub value_dim: usize,
    /// Bytes per stored element
    pub elem_bytes: usize,
}

impl SlotFootprint {
    pub fn bytes_per_slot(&self) -> usize {
        self.heads_per_slot * (self.key_dim + self.value_dim) * self.elem_bytes
    }
}

/// Block allocator trait for fixed-size block management
pub trait BlockAllocator: Send + Sync + Clone {
    fn allocate(&self, count: usize) -> Result<Vec<BlockId>>;
    fn free(&self, blocks: &[BlockId]) -> Result<()>;
    fn block_size(&self) -> usize;
    fn total_blocks(&self) -> usize;
    fn free_block_count(&self) -> usize;
    fn stats(&self) -> BlockAllocatorStats;

    fn can_allocate(&self, count: usize) -> bool {
        self.free_block_count() >= count
    }

    /// Allocate a fresh table holding `num_tokens` tokens.
    fn allocate_table(&self, num_tokens: usize) -> Result<BlockTable> {
        let mut table = BlockTable::new(self.block_size());
        self.grow_table(&mut table, num_tokens)?;
        Ok(table)
    }

    /// Grow `table` by `additional_tokens`, taking only the blocks it lacks.
    fn grow_table(&self, table: &mut BlockTable, additional_tokens: usize) -> Result<()> {
        let needed = table.additional_blocks_needed(additional_tokens);
        let blocks = self.allocate(needed)?;
        table.append_blocks(blocks);
        table.set_num_tokens(table.num_tokens + additional_tokens);
        Ok(())
    }

    /// Return all of `table`'s blocks to the pool.
    fn release_table(&self, table: &mut BlockTable) -> Result<()> {
        self.free(&table.blocks)?;
        table.blocks.clear();
        table.set_num_tokens(0);
        Ok(())
    }
}

struct BlockAllocatorState {
    total_blocks: usize,
    block_size: usize,
    free_list: VecDeque<BlockId>,
    total_allocations: usize,
    total_frees: usize,
    peak_usage: usize,
}

impl BlockAllocatorState {
    fn allocated_count(&self) -> usize {
        self.total_blocks - self.free_list.len()
    }
}

/// CPU-side block allocator shared between cache-fill callers
#[derive(Clone)]
pub struct CpuBlockAllocator {
    state: Arc<Mutex<BlockAllocatorState>>,
}

impl CpuBlockAllocator {
    pub fn new(total_blocks: usize, block_size: usize) -> Self {
        let free_list: VecDeque<BlockId> = (0..total_blocks as BlockId).collect();
        Self {
            state: Arc::new(Mutex::new(BlockAllocatorState {
                total_blocks,
                block_size,
                free_list,
                total_allocations: 0,
                total_frees: 0,
                peak_usage: 0,
            })),
        }
    }

    /// Size the pool so that it fits inside `memory_budget_bytes`.
    pub fn from_memory_budget(
        memory_budget_bytes: usize,
        block_size: usize,
        footprint: SlotFootprint,
    ) -> Self {
        let block_bytes = (block_size * footprint.bytes_per_slot()).max(1);
        Self::new(memory_budget_bytes / block_bytes, block_size)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BlockAllocatorState>> {
        self.state.lock().map_err(|e| Error::InvalidArgument {
            arg: "allocator",
            reason: format!("block allocator mutex poisoned: {e}"),
        })
    }
}

impl BlockAllocator for CpuBlockAllocator {
    fn allocate(&self, count: usize) -> Result<Vec<BlockId>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut state = self.lock()?;
        if state.free_list.len() < count {
            return Err(Error::OutOfRange {
                what: "free block",
                index: count,
                limit: state.free_list.len(),
            });
        }

        let blocks: Vec<BlockId> = state.free_list.drain(0..count).collect();
        state.total_allocations += 1;
        state.peak_usage = state.peak_usage.max(state.allocated_count());

        debug!(count, free = state.free_list.len(), "allocated kv blocks");
        Ok(blocks)
    }

    fn free(&self, blocks: &[BlockId]) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }

        let mut state = self.lock()?;
        if let Some(&bad) = blocks
            .iter()
            .find(|&&b| b as usize >= state.total_blocks)
        {
            return Err(Error::OutOfRange {
                what: "block id",
                index: bad as usize,
                limit: state.total_blocks,
            });
        }

        state.free_list.extend(blocks.iter().copied());
        state.total_frees += 1;

        debug!(count = blocks.len(), free = state.free_list.len(), "freed kv blocks");
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .block_size
    }

    fn total_blocks(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .total_blocks
    }

    fn free_block_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .free_list
            .len()
    }

    fn stats(&self) -> BlockAllocatorStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        BlockAllocatorStats {
            total_blocks: state.total_blocks,
            allocated_blocks: state.allocated_count(),
            free_blocks: state.free_list.len(),
            block_size: state.block_size,
            total_allocations: state.total_allocations,
            total_frees: state.total_frees,
            peak_usage: state.peak_usage,
        }
    }
}
