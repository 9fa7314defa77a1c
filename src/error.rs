//! pagemla error types

use numr::dtype::DType;

/// pagemla result type
pub type Result<T> = std::result::Result<T, Error>;

/// pagemla errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from numr operations
    #[error("numr error: {0}")]
    Numr(#[from] numr::error::Error),

    /// Block-table index or logical position beyond its declared length
    #[error("{what} index {index} out of range (limit {limit})")]
    OutOfRange {
        /// What was being indexed
        what: &'static str,
        /// The offending index
        index: usize,
        /// Exclusive upper bound
        limit: usize,
    },

    /// Query head count not divisible by KV head count
    #[error("invalid head grouping: {num_heads} query heads over {num_kv_heads} kv heads")]
    InvalidGrouping {
        /// Number of query heads
        num_heads: usize,
        /// Number of KV heads
        num_kv_heads: usize,
    },

    /// Mismatched ranks/dims between query, cache, mask or ring-merge inputs
    #[error("shape mismatch for '{arg}': expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Argument name
        arg: &'static str,
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        got: Vec<usize>,
    },

    /// Reserved. Max-subtraction in the online softmax is the overflow
    /// mitigation; nothing raises this today.
    #[error("numeric overflow: {reason}")]
    NumericOverflow {
        /// Description of what overflowed
        reason: String,
    },

    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// DType mismatch at the tensor boundary
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        /// Expected dtype
        expected: DType,
        /// Actual dtype
        got: DType,
    },

    /// Configuration load/parse error
    #[error("config error: {reason}")]
    Config {
        /// Description of what went wrong
        reason: String,
    },
}

impl Error {
    pub(crate) fn shape(arg: &'static str, expected: &[usize], got: &[usize]) -> Self {
        Error::ShapeMismatch {
            arg,
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}
