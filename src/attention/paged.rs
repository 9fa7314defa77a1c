//! Paged attention driver
//!
//! One invocation splits into `(sequence, kv_head)` tasks run on the rayon
//! pool. A task walks the sequence's KV positions in tiles of
//! `kv_tile_len`, gathers each tile once through the resolver and feeds it
//! to every query head of its group. Results are scattered into the output
//! after the parallel map, and a carried ring pair, if any, is merged last.

use super::ring::merge_into;
use super::score::{KvTile, QueryRow, QueryTile, ScoreEngine};
use super::softmax::AttentionState;
use super::{AttentionMask, AttentionOutput, HeadDims};
use crate::error::{Error, Result};
use crate::inference::PagedKvCache;
use crate::inference::memory::{BlockCacheResolver, BlockTables};
use rayon::prelude::*;
use tracing::{debug, trace};

/// Scalar parameters of one attention invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttentionParams {
    pub num_heads: usize,
    pub num_kv_heads: usize,
    /// Score scale, conventionally `1/sqrt(dim_qk)`
    pub scale: f32,
    /// KV positions per tile; 0 uses the cache block size
    pub kv_tile_len: usize,
    /// Bias used for disallowed positions
    pub mask_sentinel: f32,
}

impl AttentionParams {
    /// Defaults for `dims`: `1/sqrt(dim_qk)` scale, block-sized tiles, `-inf` sentinel.
    pub fn new(num_heads: usize, num_kv_heads: usize, dims: HeadDims) -> Self {
        Self {
            num_heads,
            num_kv_heads,
            scale: (dims.qk() as f32).sqrt().recip(),
            kv_tile_len: 0,
            mask_sentinel: f32::NEG_INFINITY,
        }
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_kv_tile_len(mut self, kv_tile_len: usize) -> Self {
        self.kv_tile_len = kv_tile_len;
        self
    }

    pub fn with_mask_sentinel(mut self, sentinel: f32) -> Self {
        self.mask_sentinel = sentinel;
        self
    }
}

/// Per-sequence lengths and block tables of one batch.
///
/// Query tokens are packed: sequence `i` owns query rows
/// `sum(q_lens[..i]) .. sum(q_lens[..=i])`.
#[derive(Debug, Clone, Copy)]
pub struct SequenceBatch<'a> {
    q_lens: &'a [usize],
    kv_lens: &'a [usize],
    tables: &'a BlockTables,
}

impl<'a> SequenceBatch<'a> {
    pub fn new(q_lens: &'a [usize], kv_lens: &'a [usize], tables: &'a BlockTables) -> Result<Self> {
        if q_lens.len() != kv_lens.len() {
            return Err(Error::shape("q_lens", &[kv_lens.len()], &[q_lens.len()]));
        }
        if tables.num_seqs() != kv_lens.len() {
            return Err(Error::shape(
                "block_table",
                &[kv_lens.len(), tables.max_blocks()],
                &[tables.num_seqs(), tables.max_blocks()],
            ));
        }
        Ok(Self {
            q_lens,
            kv_lens,
            tables,
        })
    }

    pub fn num_seqs(&self) -> usize {
        self.q_lens.len()
    }

    pub fn q_lens(&self) -> &'a [usize] {
        self.q_lens
    }

    pub fn kv_lens(&self) -> &'a [usize] {
        self.kv_lens
    }

    pub fn tables(&self) -> &'a BlockTables {
        self.tables
    }

    pub fn num_query_tokens(&self) -> usize {
        self.q_lens.iter().sum()
    }

    /// First query token of each sequence.
    pub fn query_offsets(&self) -> Vec<usize> {
        self.q_lens
            .iter()
            .scan(0, |acc, &q| {
                let start = *acc;
                *acc += q;
                Some(start)
            })
            .collect()
    }
}

struct TaskOutput {
    seq: usize,
    kv_head: usize,
    /// `[q_len, group, head_dim_v]`
    output: Vec<f32>,
    /// `[q_len, group]`
    lse: Vec<f32>,
}

/// Paged attention over one KV cache.
#[derive(Debug, Clone, Copy)]
pub struct PagedAttention<'a> {
    cache: &'a PagedKvCache,
    params: AttentionParams,
    engine: ScoreEngine,
}

impl<'a> PagedAttention<'a> {
    pub fn new(cache: &'a PagedKvCache, params: AttentionParams) -> Result<Self> {
        let layout = cache.layout();
        let dims = HeadDims::new(layout.head_dim_nope, layout.head_dim_rope, layout.head_dim_v);
        let engine = ScoreEngine::new(params.num_heads, params.num_kv_heads, dims, params.scale)?;
        if params.num_kv_heads != layout.num_kv_heads {
            return Err(Error::shape(
                "num_kv_heads",
                &[layout.num_kv_heads],
                &[params.num_kv_heads],
            ));
        }
        Ok(Self {
            cache,
            params,
            engine,
        })
    }

    pub fn params(&self) -> &AttentionParams {
        &self.params
    }

    pub fn dims(&self) -> HeadDims {
        self.engine.dims()
    }

    fn tile_len(&self) -> usize {
        match self.params.kv_tile_len {
            0 => self.cache.layout().block_size,
            n => n,
        }
    }

    /// Attention for every query token of `batch`.
    ///
    /// With `carried`, the result is merged with that partial pair; a
    /// sequence whose `kv_len` is 0 then passes its carried rows through.
    pub fn forward(
        &self,
        query: &QueryTile<'_>,
        batch: &SequenceBatch<'_>,
        mask: &AttentionMask,
        carried: Option<&AttentionOutput>,
    ) -> Result<AttentionOutput> {
        let dims = self.dims();
        let num_heads = self.params.num_heads;
        let num_tokens = batch.num_query_tokens();

        let rows = query.num_rows(dims)?;
        if rows != num_tokens * num_heads {
            return Err(Error::shape(
                "query",
                &[num_tokens, num_heads, dims.qk()],
                &[rows / num_heads.max(1), num_heads, dims.qk()],
            ));
        }
        mask.validate(num_heads, batch.q_lens(), batch.kv_lens())?;

        let layout = self.cache.layout();
        let resolver = BlockCacheResolver::new(
            batch.tables(),
            batch.kv_lens(),
            layout.block_size,
            layout.num_blocks,
            layout.addressing,
        )?;

        debug!(
            num_seqs = batch.num_seqs(),
            num_tokens,
            num_heads,
            num_kv_heads = self.params.num_kv_heads,
            kv_tile_len = self.tile_len(),
            mask = mask.kind(),
            ring = carried.is_some(),
            "paged attention forward"
        );

        let offsets = batch.query_offsets();
        let tasks: Vec<(usize, usize)> = (0..batch.num_seqs())
            .flat_map(|seq| (0..self.params.num_kv_heads).map(move |kv| (seq, kv)))
            .collect();

        let results = tasks
            .par_iter()
            .map(|&(seq, kv_head)| {
                self.run_task(query, batch, &resolver, mask, offsets[seq], seq, kv_head)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut out = AttentionOutput::empty(num_tokens, num_heads, dims.v);
        let group = self.engine.group_size();
        let dv = dims.v;
        for task in results {
            let q_len = batch.q_lens()[task.seq];
            for t in 0..q_len {
                let token = offsets[task.seq] + t;
                for g in 0..group {
                    let row = token * num_heads + task.kv_head * group + g;
                    let src = t * group + g;
                    out.output[row * dv..(row + 1) * dv]
                        .copy_from_slice(&task.output[src * dv..(src + 1) * dv]);
                    out.lse[row] = task.lse[src];
                }
            }
        }

        if let Some(carried) = carried {
            merge_into(&mut out, carried)?;
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_task(
        &self,
        query: &QueryTile<'_>,
        batch: &SequenceBatch<'_>,
        resolver: &BlockCacheResolver<'_>,
        mask: &AttentionMask,
        q_offset: usize,
        seq: usize,
        kv_head: usize,
    ) -> Result<TaskOutput> {
        let dims = self.dims();
        let group = self.engine.group_size();
        let q_len = batch.q_lens()[seq];
        let kv_len = batch.kv_lens()[seq];
        let dv = dims.v;

        let mut output = vec![0.0f32; q_len * group * dv];
        let mut lse = vec![f32::NEG_INFINITY; q_len * group];
        if kv_len == 0 || q_len == 0 {
            trace!(seq, kv_head, "empty sequence skipped");
            return Ok(TaskOutput {
                seq,
                kv_head,
                output,
                lse,
            });
        }

        let tile_len = self.tile_len();
        let ctx = mask.context(seq, q_len, kv_len, self.params.mask_sentinel);
        let masked = !mask.is_none();

        let mut states: Vec<AttentionState> =
            (0..q_len * group).map(|_| AttentionState::new(dv)).collect();
        let mut tile = KvTile::with_capacity(tile_len, dims.qk(), dv);
        let mut scores = vec![0.0f32; group * tile_len];
        let first_head = kv_head * group;
        let rows: Vec<Vec<QueryRow<'_>>> = (0..q_len)
            .map(|t| {
                let base = (q_offset + t) * self.params.num_heads + first_head;
                (0..group).map(|g| query.row(base + g, dims)).collect()
            })
            .collect();

        for start in (0..kv_len).step_by(tile_len) {
            let len = tile_len.min(kv_len - start);
            tile.gather(self.cache, resolver, seq, kv_head, start, len)?;

            for (t, token_rows) in rows.iter().enumerate() {
                let scores = &mut scores[..group * len];
                self.engine.score_group(
                    token_rows,
                    kv_head,
                    &tile,
                    masked.then_some((&ctx, t)),
                    scores,
                )?;
                for (g, row_scores) in scores.chunks(len).enumerate() {
                    states[t * group + g].update(row_scores, tile.values())?;
                }
            }
        }

        for (i, state) in states.iter_mut().enumerate() {
            lse[i] = state.finalize(&mut output[i * dv..(i + 1) * dv])?;
        }
        trace!(seq, kv_head, q_len, kv_len, "attention task done");

        Ok(TaskOutput {
            seq,
            kv_head,
            output,
            lse,
        })
    }
}
