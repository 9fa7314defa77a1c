//! CPU implementation of PagedAttentionOps
//!
//! Copies the cache and query tensors to host `f32` (int8 caches stay int8
//! and are dequantized per tile), then runs the tiled paged attention driver.

use super::{check_shape, host_f32, output_tensor};
use crate::attention::{AttentionMask, AttentionOutput, PagedAttention, QueryTile, SequenceBatch};
use crate::config::AttentionConfig;
use crate::error::{Error, Result};
use crate::inference::{BlockTables, ChannelQuant, KvCacheLayout, PagedKvCache, StorageDType};
use crate::ops::traits::{Int8CacheScales, PagedAttentionOps};
use numr::dtype::DType;
use numr::runtime::cpu::{CpuClient, CpuRuntime};
use numr::tensor::Tensor;

fn cache_layout(config: &AttentionConfig) -> KvCacheLayout {
    KvCacheLayout {
        num_blocks: config.num_blocks,
        block_size: config.block_size,
        num_kv_heads: config.kv_heads(),
        head_dim_nope: config.head_dim_nope,
        head_dim_rope: config.head_dim_rope,
        head_dim_v: config.head_dim_v(),
        addressing: config.layout,
        value_storage: config.value_storage,
    }
}

fn check_cache_shapes(
    layout: &KvCacheLayout,
    key_cache: &Tensor<CpuRuntime>,
    value_cache: Option<&Tensor<CpuRuntime>>,
) -> Result<()> {
    check_shape(key_cache, &layout.key_shape(), "key_cache")?;
    match (layout.value_shape(), value_cache) {
        (Some(shape), Some(v)) => check_shape(v, &shape, "value_cache"),
        (None, None) => Ok(()),
        (Some(shape), None) => Err(Error::shape("value_cache", &shape, &[])),
        (None, Some(v)) => Err(Error::shape("value_cache", &[], v.shape())),
    }
}

fn block_tables(block_table: &Tensor<CpuRuntime>) -> Result<BlockTables> {
    if block_table.dtype() != DType::I32 {
        return Err(Error::DTypeMismatch {
            expected: DType::I32,
            got: block_table.dtype(),
        });
    }
    let shape = block_table.shape();
    if shape.len() != 2 {
        return Err(Error::shape("block_table", &[0, 0], shape));
    }
    BlockTables::new(block_table.to_vec::<i32>(), shape[0], shape[1])
}

fn int8_host(t: &Tensor<CpuRuntime>) -> Result<Vec<i8>> {
    if t.dtype() != DType::I8 {
        return Err(Error::DTypeMismatch {
            expected: DType::I8,
            got: t.dtype(),
        });
    }
    Ok(t.to_vec::<i8>())
}

fn channel_quant(
    client: &CpuClient,
    scale: &Tensor<CpuRuntime>,
    offset: Option<&Tensor<CpuRuntime>>,
    channels: usize,
    arg: &'static str,
) -> Result<ChannelQuant> {
    check_shape(scale, &[channels], arg)?;
    let scale = host_f32(client, scale)?;
    let offset = match offset {
        Some(o) => {
            if o.dtype() != DType::I32 {
                return Err(Error::DTypeMismatch {
                    expected: DType::I32,
                    got: o.dtype(),
                });
            }
            check_shape(o, &[channels], arg)?;
            Some(o.to_vec::<i32>())
        }
        None => None,
    };
    ChannelQuant::new(scale, offset)
}

/// Shared tail of both forward variants once the cache is on the host.
#[allow(clippy::too_many_arguments)]
fn run_paged(
    client: &CpuClient,
    q: &Tensor<CpuRuntime>,
    q_rope: Option<&Tensor<CpuRuntime>>,
    cache: &PagedKvCache,
    block_table: &Tensor<CpuRuntime>,
    q_lens: &[usize],
    kv_lens: &[usize],
    mask: &AttentionMask,
    carried: Option<(&Tensor<CpuRuntime>, &Tensor<CpuRuntime>)>,
    config: &AttentionConfig,
) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
    let out_dtype = q.dtype();
    if StorageDType::from_dtype(out_dtype)? == StorageDType::Int8 {
        return Err(Error::DTypeMismatch {
            expected: DType::F32,
            got: out_dtype,
        });
    }
    if carried.is_some() && !config.ring {
        return Err(Error::InvalidArgument {
            arg: "carried",
            reason: "carried partial result given but ring mode is off".into(),
        });
    }

    let dims = config.dims();
    let num_heads = config.num_heads;
    let num_tokens: usize = q_lens.iter().sum();

    let q_host = host_f32(client, q)?;
    let rope_host = match q_rope {
        Some(r) => {
            check_shape(q, &[num_tokens, num_heads, dims.nope], "q")?;
            check_shape(r, &[num_tokens, num_heads, dims.rope], "q_rope")?;
            Some(host_f32(client, r)?)
        }
        None => {
            check_shape(q, &[num_tokens, num_heads, dims.qk()], "q")?;
            None
        }
    };
    let query = match &rope_host {
        Some(rope) => QueryTile::Split {
            nope: &q_host,
            rope,
        },
        None => QueryTile::Fused(&q_host),
    };

    let carried = match carried {
        Some((out, lse)) => {
            check_shape(out, &[num_tokens, num_heads, dims.v], "carried_output")?;
            check_shape(lse, &[num_tokens, num_heads], "carried_lse")?;
            if lse.dtype() != DType::F32 {
                return Err(Error::DTypeMismatch {
                    expected: DType::F32,
                    got: lse.dtype(),
                });
            }
            Some(AttentionOutput::from_parts(
                host_f32(client, out)?,
                lse.to_vec::<f32>(),
                num_tokens,
                num_heads,
                dims.v,
            )?)
        }
        None => None,
    };

    let tables = block_tables(block_table)?;
    let batch = SequenceBatch::new(q_lens, kv_lens, &tables)?;
    let attn = PagedAttention::new(cache, config.params())?;
    let result = attn.forward(&query, &batch, mask, carried.as_ref())?;

    let device = q.device();
    let output = output_tensor(
        client,
        &result.output,
        &[num_tokens, num_heads, dims.v],
        out_dtype,
        device,
    )?;
    let lse = Tensor::<CpuRuntime>::from_slice(&result.lse, &[num_tokens, num_heads], device);
    Ok((output, lse))
}

impl PagedAttentionOps<CpuRuntime> for CpuClient {
    fn paged_attention_fwd(
        &self,
        q: &Tensor<CpuRuntime>,
        q_rope: Option<&Tensor<CpuRuntime>>,
        key_cache: &Tensor<CpuRuntime>,
        value_cache: Option<&Tensor<CpuRuntime>>,
        block_table: &Tensor<CpuRuntime>,
        q_lens: &[usize],
        kv_lens: &[usize],
        mask: &AttentionMask,
        carried: Option<(&Tensor<CpuRuntime>, &Tensor<CpuRuntime>)>,
        config: &AttentionConfig,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        config.validate()?;
        let layout = cache_layout(config);
        check_cache_shapes(&layout, key_cache, value_cache)?;

        let keys = host_f32(self, key_cache)?;
        let values = value_cache.map(|v| host_f32(self, v)).transpose()?;
        let cache = PagedKvCache::from_f32(layout, keys, values)?;

        run_paged(
            self,
            q,
            q_rope,
            &cache,
            block_table,
            q_lens,
            kv_lens,
            mask,
            carried,
            config,
        )
    }

    fn paged_attention_fwd_int8(
        &self,
        q: &Tensor<CpuRuntime>,
        q_rope: Option<&Tensor<CpuRuntime>>,
        key_cache: &Tensor<CpuRuntime>,
        value_cache: Option<&Tensor<CpuRuntime>>,
        scales: Int8CacheScales<'_, CpuRuntime>,
        block_table: &Tensor<CpuRuntime>,
        q_lens: &[usize],
        kv_lens: &[usize],
        mask: &AttentionMask,
        carried: Option<(&Tensor<CpuRuntime>, &Tensor<CpuRuntime>)>,
        config: &AttentionConfig,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        config.validate()?;
        let layout = cache_layout(config);
        check_cache_shapes(&layout, key_cache, value_cache)?;

        let kv_heads = layout.num_kv_heads;
        let key_quant = channel_quant(
            self,
            scales.key_scale,
            scales.key_offset,
            kv_heads * layout.key_dim(),
            "key_scale",
        )?;
        let keys = int8_host(key_cache)?;

        let values = match value_cache {
            Some(v) => {
                let scale = scales.value_scale.ok_or(Error::InvalidArgument {
                    arg: "value_scale",
                    reason: "int8 value cache needs per-channel scales".into(),
                })?;
                let quant = channel_quant(
                    self,
                    scale,
                    scales.value_offset,
                    kv_heads * layout.head_dim_v,
                    "value_scale",
                )?;
                Some((int8_host(v)?, quant))
            }
            None => None,
        };
        let cache = PagedKvCache::from_int8(layout, keys, key_quant, values)?;

        run_paged(
            self,
            q,
            q_rope,
            &cache,
            block_table,
            q_lens,
            kv_lens,
            mask,
            carried,
            config,
        )
    }
}
