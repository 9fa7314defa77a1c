pub mod paged_attention;
pub mod ring_merge;

pub use paged_attention::{Int8CacheScales, PagedAttentionOps};
pub use ring_merge::RingMergeOps;
