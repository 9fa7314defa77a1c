//! Score engine: scaled dot-product scores for one query against one KV tile
//!
//! Query rows come either fused (`[.., dim_qk]`) or pre-split into non-rope
//! and rope parts. The split path feeds both partial products into the same
//! lane accumulator, so it is bit-identical to the fused contraction.
//!
//! KV tiles are gathered through the [`BlockCacheResolver`] once per
//! `(sequence, kv_head, tile)` and shared by every query head of the group.
//! Int8 caches are dequantized during the gather.

use super::HeadDims;
use super::mask::MaskContext;
use super::simd::{LANES, dot_lanes, reduce_lanes};
use crate::error::{Error, Result};
use crate::inference::memory::BlockCacheResolver;
use crate::inference::{ChannelQuant, PagedKvCache};

/// Upcast int8 to int32, add the zero-point and apply the channel scale.
///
/// `channel_base` is the quantization channel of `src[0]`.
pub(crate) fn dequantize_int8_into(
    src: &[i8],
    quant: &ChannelQuant,
    channel_base: usize,
    dst: &mut [f32],
) {
    let scale = &quant.scale[channel_base..channel_base + src.len()];
    match &quant.offset {
        Some(offset) => {
            let offset = &offset[channel_base..channel_base + src.len()];
            for (((d, &q), &s), &o) in dst.iter_mut().zip(src).zip(scale).zip(offset) {
                *d = (q as i32 + o) as f32 * s;
            }
        }
        None => {
            for ((d, &q), &s) in dst.iter_mut().zip(src).zip(scale) {
                *d = q as i32 as f32 * s;
            }
        }
    }
}

/// Inverse of [`dequantize_int8_into`], rounding to nearest and saturating.
pub(crate) fn quantize_int8_into(
    src: &[f32],
    quant: &ChannelQuant,
    channel_base: usize,
    dst: &mut [i8],
) {
    for (i, (d, &v)) in dst.iter_mut().zip(src).enumerate() {
        let c = channel_base + i;
        let scale = quant.scale[c];
        let offset = quant.offset.as_ref().map_or(0, |o| o[c]);
        let q = if scale == 0.0 {
            0.0
        } else {
            (v / scale).round() - offset as f32
        };
        *d = q.clamp(i8::MIN as f32, i8::MAX as f32) as i8;
    }
}

/// Query rows `[tokens, heads, dim]`, fused or split.
#[derive(Debug, Clone, Copy)]
pub enum QueryTile<'a> {
    /// `[tokens, heads, nope + rope]`
    Fused(&'a [f32]),
    /// `[tokens, heads, nope]` and `[tokens, heads, rope]`
    Split { nope: &'a [f32], rope: &'a [f32] },
}

impl<'a> QueryTile<'a> {
    /// Number of `(token, head)` rows, checked against `dims`.
    pub fn num_rows(&self, dims: HeadDims) -> Result<usize> {
        match self {
            QueryTile::Fused(data) => rows_of(data.len(), dims.qk(), "query"),
            QueryTile::Split { nope, rope } => {
                let rows = rows_of(nope.len(), dims.nope, "query_nope")?;
                if rope.len() != rows * dims.rope {
                    return Err(Error::shape("query_rope", &[rows, dims.rope], &[rope.len()]));
                }
                Ok(rows)
            }
        }
    }

    /// Row `r = token * num_heads + head`.
    pub fn row(&self, r: usize, dims: HeadDims) -> QueryRow<'a> {
        match self {
            QueryTile::Fused(data) => QueryRow::Fused(&data[r * dims.qk()..(r + 1) * dims.qk()]),
            QueryTile::Split { nope, rope } => QueryRow::Split {
                nope: &nope[r * dims.nope..(r + 1) * dims.nope],
                rope: &rope[r * dims.rope..(r + 1) * dims.rope],
            },
        }
    }
}

fn rows_of(len: usize, width: usize, arg: &'static str) -> Result<usize> {
    if width == 0 || len % width != 0 {
        return Err(Error::shape(arg, &[len / width.max(1), width], &[len]));
    }
    Ok(len / width)
}

/// One query row.
#[derive(Debug, Clone, Copy)]
pub enum QueryRow<'a> {
    Fused(&'a [f32]),
    Split { nope: &'a [f32], rope: &'a [f32] },
}

impl QueryRow<'_> {
    fn check(&self, dims: HeadDims) -> Result<()> {
        match self {
            QueryRow::Fused(q) if q.len() != dims.qk() => {
                Err(Error::shape("query row", &[dims.qk()], &[q.len()]))
            }
            QueryRow::Split { nope, rope } if nope.len() != dims.nope || rope.len() != dims.rope => {
                Err(Error::shape(
                    "query row",
                    &[dims.nope, dims.rope],
                    &[nope.len(), rope.len()],
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Lane accumulator for one dot product fed in one or more segments.
#[derive(Debug, Clone, Copy, Default)]
pub struct DotAccumulator {
    lanes: [f32; LANES],
}

impl DotAccumulator {
    /// Accumulate `a · b`, where `a[0]` is channel `channel_base` of the row.
    pub fn feed(&mut self, a: &[f32], b: &[f32], channel_base: usize) {
        dot_lanes(&mut self.lanes, a, b, channel_base);
    }

    pub fn finish(&self) -> f32 {
        reduce_lanes(&self.lanes)
    }
}

/// Keys and values of `len` consecutive logical positions for one KV head.
#[derive(Debug, Clone)]
pub struct KvTile {
    start: usize,
    len: usize,
    key_dim: usize,
    head_dim_v: usize,
    keys: Vec<f32>,
    values: Vec<f32>,
}

impl KvTile {
    /// Empty tile with room for `capacity` positions.
    pub fn with_capacity(capacity: usize, key_dim: usize, head_dim_v: usize) -> Self {
        Self {
            start: 0,
            len: 0,
            key_dim,
            head_dim_v,
            keys: vec![0.0; capacity * key_dim],
            values: vec![0.0; capacity * head_dim_v],
        }
    }

    /// Tile from host rows, `keys` is `[len, key_dim]`, `values` `[len, head_dim_v]`.
    pub fn from_rows(
        start: usize,
        keys: Vec<f32>,
        values: Vec<f32>,
        key_dim: usize,
        head_dim_v: usize,
    ) -> Result<Self> {
        let len = rows_of(keys.len(), key_dim, "key tile")?;
        if values.len() != len * head_dim_v {
            return Err(Error::shape("value tile", &[len, head_dim_v], &[values.len()]));
        }
        Ok(Self {
            start,
            len,
            key_dim,
            head_dim_v,
            keys,
            values,
        })
    }

    /// Gather positions `start..start + len` of sequence `seq` for `kv_head`.
    pub fn gather(
        &mut self,
        cache: &PagedKvCache,
        resolver: &BlockCacheResolver<'_>,
        seq: usize,
        kv_head: usize,
        start: usize,
        len: usize,
    ) -> Result<()> {
        let kd = self.key_dim;
        let dv = self.head_dim_v;
        if self.keys.len() < len * kd {
            self.keys.resize(len * kd, 0.0);
            self.values.resize(len * dv, 0.0);
        }

        for j in 0..len {
            let addr = resolver.resolve(seq, start + j, kv_head)?;
            cache.read_key(addr, kv_head, &mut self.keys[j * kd..(j + 1) * kd])?;
            cache.read_value(addr, kv_head, &mut self.values[j * dv..(j + 1) * dv])?;
        }
        self.start = start;
        self.len = len;
        Ok(())
    }

    /// Logical position of the first key.
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn key_dim(&self) -> usize {
        self.key_dim
    }

    pub fn head_dim_v(&self) -> usize {
        self.head_dim_v
    }

    pub fn key(&self, j: usize) -> &[f32] {
        &self.keys[j * self.key_dim..(j + 1) * self.key_dim]
    }

    /// `[len, head_dim_v]`
    pub fn values(&self) -> &[f32] {
        &self.values[..self.len * self.head_dim_v]
    }
}

/// Scaled, masked `Q·Kᵀ` with grouped KV heads.
#[derive(Debug, Clone, Copy)]
pub struct ScoreEngine {
    num_heads: usize,
    num_kv_heads: usize,
    dims: HeadDims,
    scale: f32,
}

impl ScoreEngine {
    pub fn new(num_heads: usize, num_kv_heads: usize, dims: HeadDims, scale: f32) -> Result<Self> {
        if num_kv_heads == 0 || num_heads == 0 || num_heads % num_kv_heads != 0 {
            return Err(Error::InvalidGrouping {
                num_heads,
                num_kv_heads,
            });
        }
        Ok(Self {
            num_heads,
            num_kv_heads,
            dims,
            scale,
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    /// Query heads per KV head.
    pub fn group_size(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    /// KV head serving query head `head`.
    pub fn kv_head(&self, head: usize) -> usize {
        head / self.group_size()
    }

    pub fn dims(&self) -> HeadDims {
        self.dims
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Raw (unscaled) dot product of a query row with a key row.
    pub fn dot(&self, q: QueryRow<'_>, key: &[f32]) -> f32 {
        let mut acc = DotAccumulator::default();
        match q {
            QueryRow::Fused(q) => acc.feed(q, key, 0),
            QueryRow::Split { nope, rope } => {
                let n = self.dims.nope;
                acc.feed(nope, &key[..n], 0);
                acc.feed(rope, &key[n..], n);
            }
        }
        acc.finish()
    }

    /// Scores of one query row against every key of `tile`, scaled and then
    /// biased by `mask` (as `(context, head, query index)`).
    pub fn score_row(
        &self,
        q: QueryRow<'_>,
        tile: &KvTile,
        mask: Option<(&MaskContext<'_>, usize, usize)>,
        out: &mut [f32],
    ) -> Result<()> {
        q.check(self.dims)?;
        if tile.key_dim() != self.dims.qk() {
            return Err(Error::shape("key tile", &[self.dims.qk()], &[tile.key_dim()]));
        }
        if out.len() != tile.len() {
            return Err(Error::shape("scores", &[tile.len()], &[out.len()]));
        }

        for (j, s) in out.iter_mut().enumerate() {
            *s = self.dot(q, tile.key(j)) * self.scale;
        }
        if let Some((ctx, head, t)) = mask {
            ctx.apply(head, t, tile.start(), out);
        }
        Ok(())
    }

    /// `[group, tile_len]` scores of one token's query heads that share
    /// `kv_head`. `rows[g]` is query head `kv_head * group_size + g`.
    pub fn score_group(
        &self,
        rows: &[QueryRow<'_>],
        kv_head: usize,
        tile: &KvTile,
        mask: Option<(&MaskContext<'_>, usize)>,
        out: &mut [f32],
    ) -> Result<()> {
        let group = self.group_size();
        if rows.len() != group {
            return Err(Error::shape("query rows", &[group], &[rows.len()]));
        }
        if kv_head >= self.num_kv_heads {
            return Err(Error::OutOfRange {
                what: "kv head",
                index: kv_head,
                limit: self.num_kv_heads,
            });
        }
        let tile_len = tile.len();
        if out.len() != group * tile_len {
            return Err(Error::shape("scores", &[group, tile_len], &[out.len()]));
        }

        for (g, (row, scores)) in rows.iter().zip(out.chunks_mut(tile_len.max(1))).enumerate() {
            let head = kv_head * group + g;
            self.score_row(*row, tile, mask.map(|(ctx, t)| (ctx, head, t)), scores)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::AttentionMask;

    fn data(n: usize, phase: f32) -> Vec<f32> {
        (0..n).map(|i| ((i as f32) * 0.13 + phase).sin()).collect()
    }

    #[test]
    fn test_grouping_rejected() {
        assert!(matches!(
            ScoreEngine::new(6, 4, HeadDims::new(8, 0, 8), 1.0),
            Err(Error::InvalidGrouping {
                num_heads: 6,
                num_kv_heads: 4
            })
        ));
        assert!(ScoreEngine::new(4, 0, HeadDims::new(8, 0, 8), 1.0).is_err());
        let e = ScoreEngine::new(8, 2, HeadDims::new(8, 0, 8), 1.0).unwrap();
        assert_eq!(e.group_size(), 4);
        assert_eq!(e.kv_head(5), 1);
    }

    #[test]
    fn test_split_matches_fused_bitwise() {
        let dims = HeadDims::mla();
        let engine = ScoreEngine::new(1, 1, dims, 1.0 / (576f32).sqrt()).unwrap();
        let q = data(576, 0.3);
        let keys = data(4 * 576, 1.1);
        let tile = KvTile::from_rows(0, keys, vec![0.0; 4 * 512], 576, 512).unwrap();

        let mut fused = vec![0.0; 4];
        let mut split = vec![0.0; 4];
        engine
            .score_row(QueryRow::Fused(&q), &tile, None, &mut fused)
            .unwrap();
        engine
            .score_row(
                QueryRow::Split {
                    nope: &q[..512],
                    rope: &q[512..],
                },
                &tile,
                None,
                &mut split,
            )
            .unwrap();

        for (a, b) in fused.iter().zip(split.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_score_row_values_and_mask() {
        let dims = HeadDims::new(2, 0, 1);
        let engine = ScoreEngine::new(1, 1, dims, 0.5).unwrap();
        let tile =
            KvTile::from_rows(4, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![0.0; 3], 2, 1).unwrap();
        let q = [2.0, 4.0];

        let mut out = vec![0.0; 3];
        engine
            .score_row(QueryRow::Fused(&q), &tile, None, &mut out)
            .unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0]);

        // query 0 at position 5 (kv_len 6, q_len 1): key position 6 is masked
        let mask = AttentionMask::PrefixCausal;
        let ctx = mask.context(0, 1, 6, f32::NEG_INFINITY);
        engine
            .score_row(QueryRow::Fused(&q), &tile, Some((&ctx, 0, 0)), &mut out)
            .unwrap();
        assert_eq!(out, vec![1.0, 2.0, f32::NEG_INFINITY]);
    }

    #[test]
    fn test_score_group_uses_group_heads() {
        let dims = HeadDims::new(4, 0, 4);
        let engine = ScoreEngine::new(4, 2, dims, 1.0).unwrap();
        let q = data(16, 0.0);
        let rows: Vec<QueryRow<'_>> = (0..4).map(|h| QueryRow::Fused(&q[h * 4..h * 4 + 4])).collect();
        let tile = KvTile::from_rows(0, data(8, 2.5), vec![0.0; 8], 4, 4).unwrap();

        // heads 2 and 3 read kv head 1
        let mut out = vec![0.0; 4];
        engine.score_group(&rows[2..], 1, &tile, None, &mut out).unwrap();

        let mut expect = vec![0.0; 2];
        engine.score_row(rows[3], &tile, None, &mut expect).unwrap();
        assert_eq!(&out[2..4], &expect[..]);

        // ALiBi bias follows the absolute head index
        let mask = AttentionMask::Alibi {
            slopes: vec![0.0, 0.0, 1.0, 2.0],
            causal: false,
        };
        let ctx = mask.context(0, 1, 2, f32::NEG_INFINITY);
        engine
            .score_group(&rows[2..], 1, &tile, Some((&ctx, 0)), &mut out)
            .unwrap();
        assert_eq!(out[2], expect[0] - 2.0);

        assert!(matches!(
            engine.score_group(&rows[1..], 1, &tile, None, &mut out),
            Err(Error::ShapeMismatch { arg: "query rows", .. })
        ));
        assert!(engine.score_group(&rows[2..], 2, &tile, None, &mut out).is_err());
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let engine = ScoreEngine::new(1, 1, HeadDims::new(4, 2, 4), 1.0).unwrap();
        let tile = KvTile::from_rows(0, vec![0.0; 6], vec![0.0; 4], 6, 4).unwrap();
        let q = [0.0f32; 5];
        let mut out = [0.0f32; 1];
        assert!(matches!(
            engine.score_row(QueryRow::Fused(&q), &tile, None, &mut out),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_dequantize_with_offset() {
        let quant = ChannelQuant::new(vec![0.5, 0.25, 2.0], Some(vec![1, -2, 0])).unwrap();
        let mut out = [0.0f32; 2];
        dequantize_int8_into(&[3, -4], &quant, 1, &mut out);
        // (3 - 2) * 0.25 and (-4 + 0) * 2.0
        assert_eq!(out, [0.25, -8.0]);
    }

    #[test]
    fn test_quantize_saturates() {
        let quant = ChannelQuant::uniform(2, 0.01);
        let mut out = [0i8; 2];
        quantize_int8_into(&[10.0, -10.0], &quant, 0, &mut out);
        assert_eq!(out, [127, -128]);
    }
}
