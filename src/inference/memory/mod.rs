pub mod block_allocator;
pub mod block_table;
pub mod resolver;

pub use block_allocator::{
    BlockAllocator, BlockAllocatorStats, BlockId, CpuBlockAllocator, SlotFootprint,
};
pub use block_table::{BlockTable, BlockTables};
pub use resolver::{BlockCacheResolver, HeadAddressing, SlotAddress};
