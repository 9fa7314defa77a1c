//! Single-pass golden attention over contiguous KV
//!
//! Materializes the full score row, fused 576-wide (or `nope + rope`)
//! contraction, in `f64`. Used to check the tiled paged path.

use super::mask::AttentionMask;
use super::{AttentionOutput, HeadDims};
use crate::error::{Error, Result};

/// Contiguous keys `[kv_len, kv_heads, dim_qk]` and values
/// `[kv_len, kv_heads, head_dim_v]` of one sequence.
#[derive(Debug, Clone)]
pub struct DenseSequence {
    keys: Vec<f32>,
    values: Vec<f32>,
    kv_len: usize,
    num_kv_heads: usize,
    dims: HeadDims,
}

impl DenseSequence {
    pub fn new(
        keys: Vec<f32>,
        values: Vec<f32>,
        num_kv_heads: usize,
        dims: HeadDims,
    ) -> Result<Self> {
        let row = num_kv_heads * dims.qk();
        if row == 0 || keys.len() % row != 0 {
            return Err(Error::shape(
                "keys",
                &[keys.len() / row.max(1), num_kv_heads, dims.qk()],
                &[keys.len()],
            ));
        }
        let kv_len = keys.len() / row;
        if values.len() != kv_len * num_kv_heads * dims.v {
            return Err(Error::shape(
                "values",
                &[kv_len, num_kv_heads, dims.v],
                &[values.len()],
            ));
        }
        Ok(Self {
            keys,
            values,
            kv_len,
            num_kv_heads,
            dims,
        })
    }

    pub fn kv_len(&self) -> usize {
        self.kv_len
    }

    /// Positions `range` as a new sequence (a ring shard).
    pub fn slice(&self, range: std::ops::Range<usize>) -> Result<Self> {
        if range.end > self.kv_len || range.start > range.end {
            return Err(Error::OutOfRange {
                what: "kv position",
                index: range.end,
                limit: self.kv_len,
            });
        }
        let kr = self.num_kv_heads * self.dims.qk();
        let vr = self.num_kv_heads * self.dims.v;
        Self::new(
            self.keys[range.start * kr..range.end * kr].to_vec(),
            self.values[range.start * vr..range.end * vr].to_vec(),
            self.num_kv_heads,
            self.dims,
        )
    }

    fn key(&self, pos: usize, kv_head: usize) -> &[f32] {
        let qk = self.dims.qk();
        let at = (pos * self.num_kv_heads + kv_head) * qk;
        &self.keys[at..at + qk]
    }

    fn value(&self, pos: usize, kv_head: usize) -> &[f32] {
        let dv = self.dims.v;
        let at = (pos * self.num_kv_heads + kv_head) * dv;
        &self.values[at..at + dv]
    }
}

/// Attention of fused queries `[sum(q_lens), num_heads, dim_qk]` over
/// `seqs`, one softmax pass per row.
pub fn reference_attention(
    query: &[f32],
    q_lens: &[usize],
    seqs: &[DenseSequence],
    num_heads: usize,
    scale: f32,
    mask: &AttentionMask,
    mask_sentinel: f32,
) -> Result<AttentionOutput> {
    let first = seqs.first().ok_or(Error::InvalidArgument {
        arg: "seqs",
        reason: "empty batch".into(),
    })?;
    let dims = first.dims;
    let num_kv_heads = first.num_kv_heads;
    if q_lens.len() != seqs.len() {
        return Err(Error::shape("q_lens", &[seqs.len()], &[q_lens.len()]));
    }
    if seqs
        .iter()
        .any(|s| s.dims != dims || s.num_kv_heads != num_kv_heads)
    {
        return Err(Error::InvalidArgument {
            arg: "seqs",
            reason: "sequences disagree on head layout".into(),
        });
    }
    if num_kv_heads == 0 || num_heads % num_kv_heads != 0 {
        return Err(Error::InvalidGrouping {
            num_heads,
            num_kv_heads,
        });
    }
    let num_tokens: usize = q_lens.iter().sum();
    let qk = dims.qk();
    if query.len() != num_tokens * num_heads * qk {
        return Err(Error::shape(
            "query",
            &[num_tokens, num_heads, qk],
            &[query.len()],
        ));
    }
    let kv_lens: Vec<usize> = seqs.iter().map(DenseSequence::kv_len).collect();
    mask.validate(num_heads, q_lens, &kv_lens)?;

    let group = num_heads / num_kv_heads;
    let dv = dims.v;
    let mut out = AttentionOutput::empty(num_tokens, num_heads, dv);
    let mut token = 0;

    for (i, (seq, &q_len)) in seqs.iter().zip(q_lens).enumerate() {
        let ctx = mask.context(i, q_len, seq.kv_len, mask_sentinel);
        for t in 0..q_len {
            for h in 0..num_heads {
                let kv_head = h / group;
                let row = token * num_heads + h;
                let q = &query[row * qk..(row + 1) * qk];

                let scores: Vec<f64> = (0..seq.kv_len)
                    .map(|k| {
                        let dot: f64 = q
                            .iter()
                            .zip(seq.key(k, kv_head))
                            .map(|(&a, &b)| a as f64 * b as f64)
                            .sum();
                        let bias = ctx.bias(h, t, k);
                        if bias == f32::NEG_INFINITY {
                            f64::NEG_INFINITY
                        } else {
                            dot * scale as f64 + bias as f64
                        }
                    })
                    .collect();

                let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                if max == f64::NEG_INFINITY {
                    continue;
                }
                let mut sum = 0.0f64;
                let mut acc = vec![0.0f64; dv];
                for (k, &s) in scores.iter().enumerate() {
                    let w = (s - max).exp();
                    sum += w;
                    for (a, &v) in acc.iter_mut().zip(seq.value(k, kv_head)) {
                        *a += w * v as f64;
                    }
                }
                for (o, a) in out.output[row * dv..(row + 1) * dv].iter_mut().zip(&acc) {
                    *o = (a / sum) as f32;
                }
                out.lse[row] = (max + sum.ln()) as f32;
            }
            token += 1;
        }
    }
    Ok(out)
}
