//! Configuration: attention layout and output tolerance policy

pub mod attention;
pub mod precision;

pub use attention::AttentionConfig;
pub use precision::{PrecisionBreakpoint, PrecisionPolicy, PrecisionReport};
