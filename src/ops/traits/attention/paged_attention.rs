//! Paged attention operations trait
//!
//! Block-table KV cache attention with optional multi-latent (non-rope + rope)
//! key split, int8 caches and ring-mode partial result merging.
//!
//! Key differences from contiguous attention:
//! - K/V stored in a fixed pool of blocks: `[num_blocks, block_size, heads_per_slot, dim]`
//! - Block table maps logical token positions to physical block addresses
//! - Queries of all sequences are packed along the token axis

use crate::attention::AttentionMask;
use crate::config::AttentionConfig;
use crate::error::Result;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Per-channel int8 dequantization tensors.
///
/// `value = (q as i32 + offset[c]) as f32 * scale[c]` with channel
/// `c = kv_head * dim + d`. Scales are F32 `[num_kv_heads * dim]`, offsets
/// I32 of the same length.
#[derive(Debug, Clone, Copy)]
pub struct Int8CacheScales<'a, R: Runtime> {
    pub key_scale: &'a Tensor<R>,
    pub key_offset: Option<&'a Tensor<R>>,
    pub value_scale: Option<&'a Tensor<R>>,
    pub value_offset: Option<&'a Tensor<R>>,
}

/// Paged attention forward with block-table KV cache indirection
///
/// # Layout contract
///
/// - `q`: `[num_tokens, num_heads, dim_qk]`, or with `q_rope` the non-rope part
///   `[num_tokens, num_heads, head_dim_nope]`
/// - `q_rope`: `[num_tokens, num_heads, head_dim_rope]` (split MLA query)
/// - `key_cache`: `[num_blocks, block_size, heads_per_slot, dim_qk]`
/// - `value_cache`: `[num_blocks, block_size, heads_per_slot, head_dim_v]`, `None`
///   for the combined layout (values alias the non-rope key)
/// - `block_table`: `[num_seqs, max_blocks]` — I32, logical → physical block
/// - `q_lens`, `kv_lens`: per-sequence lengths, `sum(q_lens) == num_tokens`
/// - `carried`: prior `(output, lse)` from other ring participants
/// - Output: `[num_tokens, num_heads, head_dim_v]` in the query dtype
/// - Logsumexp: `[num_tokens, num_heads]` (F32)
#[allow(clippy::too_many_arguments)]
pub trait PagedAttentionOps<R: Runtime> {
    /// Paged attention forward pass (F32, F16, BF16)
    fn paged_attention_fwd(
        &self,
        q: &Tensor<R>,
        q_rope: Option<&Tensor<R>>,
        key_cache: &Tensor<R>,
        value_cache: Option<&Tensor<R>>,
        block_table: &Tensor<R>,
        q_lens: &[usize],
        kv_lens: &[usize],
        mask: &AttentionMask,
        carried: Option<(&Tensor<R>, &Tensor<R>)>,
        config: &AttentionConfig,
    ) -> Result<(Tensor<R>, Tensor<R>)>;

    /// Paged attention forward pass over int8 caches
    fn paged_attention_fwd_int8(
        &self,
        q: &Tensor<R>,
        q_rope: Option<&Tensor<R>>,
        key_cache: &Tensor<R>,
        value_cache: Option<&Tensor<R>>,
        scales: Int8CacheScales<'_, R>,
        block_table: &Tensor<R>,
        q_lens: &[usize],
        kv_lens: &[usize],
        mask: &AttentionMask,
        carried: Option<(&Tensor<R>, &Tensor<R>)>,
        config: &AttentionConfig,
    ) -> Result<(Tensor<R>, Tensor<R>)>;
}
