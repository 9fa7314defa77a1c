pub mod cpu;
pub mod traits;

pub use traits::{Int8CacheScales, PagedAttentionOps, RingMergeOps};
