pub mod attention;

pub use attention::{Int8CacheScales, PagedAttentionOps, RingMergeOps};
