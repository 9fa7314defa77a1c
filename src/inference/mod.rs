pub mod kv_cache;
pub mod memory;
pub mod storage;

pub use kv_cache::{KvCacheLayout, PagedKvCache, PagedKvCacheBuilder, ValueStorage};
pub use memory::{
    BlockAllocator, BlockAllocatorStats, BlockCacheResolver, BlockId, BlockTable, BlockTables,
    CpuBlockAllocator, HeadAddressing, SlotAddress, SlotFootprint,
};
pub use storage::{ChannelQuant, KvStorage, StorageDType};
