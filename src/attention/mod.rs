//! Paged attention core: score engine, online softmax, ring merge and masks
//!
//! Everything here works on host `f32` slices. The tensor-level entry points
//! live in [`crate::ops`] and call down into [`paged::PagedAttention`].
//!
//! ```text
//! BlockCacheResolver ─► ScoreEngine ─► AttentionState ─► ring::merge ─► output
//!                            ▲
//!                       AttentionMask
//! ```

pub mod mask;
pub mod paged;
pub mod reference;
pub mod ring;
pub mod score;
pub(crate) mod simd;
pub mod softmax;

pub use mask::{AttentionMask, DenseMask, MaskContext, alibi_slopes};
pub use paged::{AttentionParams, PagedAttention, SequenceBatch};
pub use reference::{DenseSequence, reference_attention};
pub use ring::{RingExchange, merge, merge_all, merge_into};
pub use score::{DotAccumulator, KvTile, QueryRow, QueryTile, ScoreEngine};
pub use softmax::{AttentionState, Phase};

use crate::error::{Error, Result};

/// Per-head widths. `rope == 0` means an ordinary (unsplit) key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadDims {
    /// Non-rope (content) part of the query/key
    pub nope: usize,
    /// Rope (positional) part of the query/key
    pub rope: usize,
    /// Value / output width
    pub v: usize,
}

impl HeadDims {
    pub fn new(nope: usize, rope: usize, v: usize) -> Self {
        Self { nope, rope, v }
    }

    /// MLA layout: 512 + 64 key, 512 value.
    pub fn mla() -> Self {
        Self::new(512, 64, 512)
    }

    pub fn qk(&self) -> usize {
        self.nope + self.rope
    }
}

/// Attention result for `num_tokens × num_heads` rows.
///
/// `output` is `[num_tokens, num_heads, head_dim_v]`, `lse` is
/// `[num_tokens, num_heads]`. Rows that saw no unmasked key have zero output
/// and `lse = -inf`, which is also the identity for [`ring::merge`].
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionOutput {
    pub output: Vec<f32>,
    pub lse: Vec<f32>,
    pub num_tokens: usize,
    pub num_heads: usize,
    pub head_dim_v: usize,
}

impl AttentionOutput {
    /// A partial result over zero tokens.
    pub fn empty(num_tokens: usize, num_heads: usize, head_dim_v: usize) -> Self {
        Self {
            output: vec![0.0; num_tokens * num_heads * head_dim_v],
            lse: vec![f32::NEG_INFINITY; num_tokens * num_heads],
            num_tokens,
            num_heads,
            head_dim_v,
        }
    }

    pub fn from_parts(
        output: Vec<f32>,
        lse: Vec<f32>,
        num_tokens: usize,
        num_heads: usize,
        head_dim_v: usize,
    ) -> Result<Self> {
        let rows = num_tokens * num_heads;
        if output.len() != rows * head_dim_v {
            return Err(Error::shape(
                "output",
                &[num_tokens, num_heads, head_dim_v],
                &[output.len()],
            ));
        }
        if lse.len() != rows {
            return Err(Error::shape("lse", &[num_tokens, num_heads], &[lse.len()]));
        }
        Ok(Self {
            output,
            lse,
            num_tokens,
            num_heads,
            head_dim_v,
        })
    }

    pub fn num_rows(&self) -> usize {
        self.num_tokens * self.num_heads
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.num_tokens, self.num_heads, self.head_dim_v]
    }

    pub fn row(&self, token: usize, head: usize) -> &[f32] {
        let r = token * self.num_heads + head;
        &self.output[r * self.head_dim_v..(r + 1) * self.head_dim_v]
    }

    pub(crate) fn check_same_shape(&self, other: &Self, arg: &'static str) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(Error::shape(arg, &self.shape(), &other.shape()));
        }
        Ok(())
    }
}
