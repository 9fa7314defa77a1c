//! Ring merge operations trait

use crate::error::Result;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Log-sum-exp merge of two partial attention results over disjoint KV shards.
///
/// # Layout contract
///
/// - `output`, `carried_output`: `[num_tokens, num_heads, head_dim_v]`
/// - `lse`, `carried_lse`: `[num_tokens, num_heads]` (F32)
/// - Returns the merged `(output, lse)`; output keeps the dtype of `output`
///
/// Rows with `lse = -inf` contribute nothing. Mismatched shapes are an error.
pub trait RingMergeOps<R: Runtime> {
    fn ring_merge(
        &self,
        output: &Tensor<R>,
        lse: &Tensor<R>,
        carried_output: &Tensor<R>,
        carried_lse: &Tensor<R>,
    ) -> Result<(Tensor<R>, Tensor<R>)>;
}
