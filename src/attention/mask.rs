//! Additive mask / bias provider
//!
//! Every variant is stateless given its construction parameters and resolves
//! to a bias `bias(batch, head, q_idx, k_pos)` added to the scaled score.
//! A bias of `-inf` excludes the key outright (the score becomes `-inf`
//! regardless of its raw value); a finite sentinel such as `-1e4` is added
//! like any other bias.
//!
//! Query anchoring: `Causal` and non-prefix `SlidingWindow` place query
//! index `t` at position `t`. Prefix variants, ALiBi and razor fusion place
//! it at `kv_len - q_len + t`, i.e. the queries are the last `q_len` tokens
//! of the sequence.

use crate::error::{Error, Result};

/// Mask variant, chosen once per invocation.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AttentionMask {
    /// No masking.
    #[default]
    None,
    /// Keys above the diagonal `k > t` are masked.
    Causal,
    /// Causal with the diagonal anchored at `kv_len - q_len`.
    PrefixCausal,
    /// Keys within `window` positions at or before the query are kept.
    SlidingWindow { window: usize, prefix: bool },
    /// `slope[head] * (k_pos - q_pos)`, optionally combined with causal masking.
    Alibi { slopes: Vec<f32>, causal: bool },
    /// Block-banded mask: a query in block `qb` sees key blocks
    /// `qb - pre_blocks ..= qb + next_blocks`.
    RazorFusion {
        block_len: usize,
        pre_blocks: usize,
        next_blocks: usize,
    },
    /// Explicit additive bias tensor.
    Dense(DenseMask),
}

/// Explicit bias tensor, `[batch, q_len, kv_len]` or
/// `[batch, heads, q_len, kv_len]`. A batch or head extent of 1 broadcasts.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseMask {
    data: Vec<f32>,
    batch: usize,
    heads: Option<usize>,
    q_len: usize,
    kv_len: usize,
}

impl DenseMask {
    /// Per-batch mask shared by all heads.
    pub fn per_batch(data: Vec<f32>, batch: usize, q_len: usize, kv_len: usize) -> Result<Self> {
        Self::build(data, batch, None, q_len, kv_len)
    }

    /// Per-batch, per-head mask.
    pub fn per_head(
        data: Vec<f32>,
        batch: usize,
        heads: usize,
        q_len: usize,
        kv_len: usize,
    ) -> Result<Self> {
        Self::build(data, batch, Some(heads), q_len, kv_len)
    }

    fn build(
        data: Vec<f32>,
        batch: usize,
        heads: Option<usize>,
        q_len: usize,
        kv_len: usize,
    ) -> Result<Self> {
        let expected = batch * heads.unwrap_or(1) * q_len * kv_len;
        if data.len() != expected {
            let shape: Vec<usize> = match heads {
                Some(h) => vec![batch, h, q_len, kv_len],
                None => vec![batch, q_len, kv_len],
            };
            return Err(Error::shape("mask", &shape, &[data.len()]));
        }
        Ok(Self {
            data,
            batch,
            heads,
            q_len,
            kv_len,
        })
    }

    pub fn shape(&self) -> Vec<usize> {
        match self.heads {
            Some(h) => vec![self.batch, h, self.q_len, self.kv_len],
            None => vec![self.batch, self.q_len, self.kv_len],
        }
    }

    fn value(&self, seq: usize, head: usize, t: usize, k: usize) -> f32 {
        let b = if self.batch == 1 { 0 } else { seq };
        let (h, nh) = match self.heads {
            Some(1) | None => (0, 1),
            Some(n) => (head, n),
        };
        self.data[((b * nh + h) * self.q_len + t) * self.kv_len + k]
    }

    fn validate(&self, num_seqs: usize, num_heads: usize, max_q: usize, max_kv: usize) -> Result<()> {
        let batch_ok = self.batch == 1 || self.batch == num_seqs;
        let heads_ok = match self.heads {
            Some(h) => h == 1 || h == num_heads,
            None => true,
        };
        if !batch_ok || !heads_ok || self.q_len < max_q || self.kv_len < max_kv {
            let expected: Vec<usize> = match self.heads {
                Some(_) => vec![num_seqs, num_heads, max_q, max_kv],
                None => vec![num_seqs, max_q, max_kv],
            };
            return Err(Error::shape("mask", &expected, &self.shape()));
        }
        Ok(())
    }
}

/// ALiBi slopes for `num_heads` heads.
///
/// For a power of two `n` the slopes are `2^(-8 i / n)` for `i = 1..=n`.
/// Otherwise the closest lower power of two is used and the remainder is
/// interleaved from the `2n` sequence.
pub fn alibi_slopes(num_heads: usize) -> Vec<f32> {
    if num_heads == 0 {
        return Vec::new();
    }
    let closest = if num_heads.is_power_of_two() {
        num_heads
    } else {
        num_heads.next_power_of_two() / 2
    };

    let ratio = 8.0 / closest as f32;
    let mut slopes: Vec<f32> = (1..=closest)
        .map(|i| 2f32.powf(-(i as f32) * ratio))
        .collect();

    let extra_ratio = 4.0 / closest as f32;
    slopes.extend(
        (0..num_heads - closest).map(|i| 2f32.powf(-((2 * i + 1) as f32) * extra_ratio)),
    );
    slopes
}

impl AttentionMask {
    /// ALiBi mask with the standard slope sequence.
    pub fn alibi(num_heads: usize, causal: bool) -> Self {
        AttentionMask::Alibi {
            slopes: alibi_slopes(num_heads),
            causal,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AttentionMask::None => "none",
            AttentionMask::Causal => "causal",
            AttentionMask::PrefixCausal => "prefix_causal",
            AttentionMask::SlidingWindow { .. } => "sliding_window",
            AttentionMask::Alibi { .. } => "alibi",
            AttentionMask::RazorFusion { .. } => "razor_fusion",
            AttentionMask::Dense(_) => "dense",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, AttentionMask::None)
    }

    /// Check the mask parameters against the batch it will be applied to.
    pub fn validate(&self, num_heads: usize, q_lens: &[usize], kv_lens: &[usize]) -> Result<()> {
        match self {
            AttentionMask::SlidingWindow { window: 0, .. } => Err(Error::InvalidArgument {
                arg: "window",
                reason: "sliding window must be > 0".into(),
            }),
            AttentionMask::RazorFusion { block_len: 0, .. } => Err(Error::InvalidArgument {
                arg: "block_len",
                reason: "razor fusion block length must be > 0".into(),
            }),
            AttentionMask::Alibi { slopes, .. } if slopes.len() != num_heads => Err(
                Error::shape("alibi slopes", &[num_heads], &[slopes.len()]),
            ),
            AttentionMask::Dense(dense) => {
                let max_q = q_lens.iter().copied().max().unwrap_or(0);
                let max_kv = kv_lens.iter().copied().max().unwrap_or(0);
                dense.validate(q_lens.len(), num_heads, max_q, max_kv)
            }
            _ => Ok(()),
        }
    }

    /// Bind the mask to one sequence.
    pub fn context(&self, seq: usize, q_len: usize, kv_len: usize, sentinel: f32) -> MaskContext<'_> {
        MaskContext {
            mask: self,
            seq,
            q_offset: kv_len.saturating_sub(q_len),
            sentinel,
        }
    }
}

/// A mask bound to one sequence of the batch.
#[derive(Debug, Clone, Copy)]
pub struct MaskContext<'a> {
    mask: &'a AttentionMask,
    seq: usize,
    q_offset: usize,
    sentinel: f32,
}

impl MaskContext<'_> {
    /// Absolute position of query index `t` for prefix-anchored variants.
    pub fn query_position(&self, t: usize) -> usize {
        self.q_offset + t
    }

    /// Additive bias for query index `t` of `head` against key position `k`.
    pub fn bias(&self, head: usize, t: usize, k: usize) -> f32 {
        let blocked = self.sentinel;
        match self.mask {
            AttentionMask::None => 0.0,
            AttentionMask::Causal => {
                if k > t {
                    blocked
                } else {
                    0.0
                }
            }
            AttentionMask::PrefixCausal => {
                if k > self.query_position(t) {
                    blocked
                } else {
                    0.0
                }
            }
            AttentionMask::SlidingWindow { window, prefix } => {
                let qp = if *prefix { self.query_position(t) } else { t };
                if k > qp || qp - k >= *window {
                    blocked
                } else {
                    0.0
                }
            }
            AttentionMask::Alibi { slopes, causal } => {
                let qp = self.query_position(t);
                if *causal && k > qp {
                    blocked
                } else {
                    slopes[head] * (k as f32 - qp as f32)
                }
            }
            AttentionMask::RazorFusion {
                block_len,
                pre_blocks,
                next_blocks,
            } => {
                let qb = self.query_position(t) / block_len;
                let kb = k / block_len;
                if kb + pre_blocks >= qb && kb <= qb + next_blocks {
                    0.0
                } else {
                    blocked
                }
            }
            AttentionMask::Dense(dense) => dense.value(self.seq, head, t, k),
        }
    }

    /// Add the bias row for `(head, t)` to `scores`, whose first entry is key
    /// position `k_start`.
    pub fn apply(&self, head: usize, t: usize, k_start: usize, scores: &mut [f32]) {
        if self.mask.is_none() {
            return;
        }
        for (j, s) in scores.iter_mut().enumerate() {
            let b = self.bias(head, t, k_start + j);
            if b == f32::NEG_INFINITY {
                *s = f32::NEG_INFINITY;
            } else {
                *s += b;
            }
        }
    }
}
