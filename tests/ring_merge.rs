//! Ring mode: attention over KV shards merged through the log-sum-exp
//! equals attention over the whole sequence.

mod common;

use common::{assert_close, fill, wave};
use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
use pagemla::attention::{
    AttentionMask, AttentionOutput, AttentionParams, DenseSequence, HeadDims, PagedAttention,
    QueryTile, RingExchange, SequenceBatch, merge, merge_all, reference_attention,
};
use pagemla::inference::{BlockTables, PagedKvCache};
use pagemla::ops::{PagedAttentionOps, RingMergeOps};
use pagemla::{AttentionConfig, Error, Tensor};

const DIMS: HeadDims = HeadDims {
    nope: 16,
    rope: 8,
    v: 16,
};

fn builder() -> pagemla::inference::PagedKvCacheBuilder {
    PagedKvCache::builder()
        .num_blocks(80)
        .block_size(8)
        .num_kv_heads(2)
        .key_dims(DIMS.nope, DIMS.rope)
        .head_dim_v(DIMS.v)
}

/// The full sequence plus the same data cut into `shards` equal ranks.
fn shard_outputs(
    kv_len: usize,
    shards: usize,
    q: &[f32],
    params: AttentionParams,
) -> (AttentionOutput, Vec<AttentionOutput>) {
    let fx = fill(builder(), &[kv_len], 0.4);
    let full = reference_attention(
        q,
        &[1],
        &fx.seqs,
        params.num_heads,
        params.scale,
        &AttentionMask::None,
        params.mask_sentinel,
    )
    .unwrap();

    let step = kv_len / shards;
    let parts = (0..shards)
        .map(|r| {
            let shard = fx.seqs[0].slice(r * step..(r + 1) * step).unwrap();
            reference_attention(
                q,
                &[1],
                &[shard],
                params.num_heads,
                params.scale,
                &AttentionMask::None,
                params.mask_sentinel,
            )
            .unwrap()
        })
        .collect();
    (full, parts)
}

#[test]
fn test_two_shards_merge_to_full() {
    let params = AttentionParams::new(4, 2, DIMS);
    let q = wave(4 * DIMS.qk(), 0.2);
    let (full, parts) = shard_outputs(200, 2, &q, params);

    let merged = merge(&parts[0], &parts[1]).unwrap();
    assert_close(&merged, &full, 1e-5);

    let swapped = merge(&parts[1], &parts[0]).unwrap();
    assert_close(&swapped, &merged, 1e-6);
}

#[test]
fn test_merge_all_over_four_shards() {
    let params = AttentionParams::new(4, 2, DIMS);
    let q = wave(4 * DIMS.qk(), 1.2);
    let (full, parts) = shard_outputs(200, 4, &q, params);
    assert_close(&merge_all(&parts).unwrap(), &full, 1e-5);
}

#[test]
fn test_ring_exchange_with_paged_shards() {
    let (kv_len, ranks) = (200, 4);
    let step = kv_len / ranks;
    let params = AttentionParams::new(4, 2, DIMS).with_kv_tile_len(16);
    let q = wave(4 * DIMS.qk(), 0.7);

    let (kr, vr) = (2 * DIMS.qk(), 2 * DIMS.v);
    let keys = wave(kv_len * kr, 0.9);
    let values = wave(kv_len * vr, 1.4);
    let whole = DenseSequence::new(keys.clone(), values.clone(), 2, DIMS).unwrap();
    let full = reference_attention(
        &q,
        &[1],
        &[whole],
        4,
        params.scale,
        &AttentionMask::None,
        params.mask_sentinel,
    )
    .unwrap();

    // every rank owns a cache holding one shard in blocks 0..
    let caches: Vec<PagedKvCache> = (0..ranks)
        .map(|r| {
            let mut cache = builder().build().unwrap();
            let span = r * step..(r + 1) * step;
            let slots: Vec<i32> = (0..step as i32).collect();
            cache
                .reshape_and_cache(
                    &keys[span.start * kr..span.end * kr],
                    Some(&values[span.start * vr..span.end * vr]),
                    &slots,
                )
                .unwrap();
            cache
        })
        .collect();
    let blocks: Vec<i32> = (0..step.div_ceil(8) as i32).collect();
    let tables = BlockTables::from_rows(&[blocks]);

    let ring = RingExchange::new(ranks).unwrap();
    assert_eq!(ring.num_ranks(), ranks);
    let result = ring
        .run(|rank, carried| {
            let attn = PagedAttention::new(&caches[rank], params)?;
            let kv_lens = [step];
            let batch = SequenceBatch::new(&[1], &kv_lens, &tables)?;
            attn.forward(&QueryTile::Fused(&q), &batch, &AttentionMask::None, carried)
        })
        .unwrap();
    assert_close(&result, &full, 1e-5);
}

#[test]
fn test_ring_error_reaches_the_end() {
    let ring = RingExchange::new(3).unwrap();
    let err = ring.run(|rank, carried| {
        if rank == 1 {
            return Err(Error::InvalidArgument {
                arg: "rank",
                reason: "boom".into(),
            });
        }
        Ok(carried
            .cloned()
            .unwrap_or_else(|| AttentionOutput::empty(1, 1, 1)))
    });
    assert!(matches!(err, Err(Error::InvalidArgument { arg: "rank", .. })));
    assert!(RingExchange::new(0).is_err());
}

#[test]
fn test_two_rank_ops_ring_over_200_tokens() {
    let (client, dev) = setup();
    let (kv_len, ranks) = (200, 2);
    let step = kv_len / ranks;
    let mut cfg = AttentionConfig::mla(4, 8, 16);
    cfg.num_kv_heads = Some(2);
    cfg.head_dim_nope = DIMS.nope;
    cfg.head_dim_rope = DIMS.rope;
    cfg.head_dim_v = Some(DIMS.v);
    cfg.kv_tile_len = Some(24);
    cfg.ring = true;

    let (kr, vr) = (2 * DIMS.qk(), 2 * DIMS.v);
    let keys = wave(kv_len * kr, 0.25);
    let values = wave(kv_len * vr, 1.9);
    let q_data = wave(2 * 4 * DIMS.qk(), 0.8);
    let q = Tensor::<CpuRuntime>::from_slice(&q_data, &[2, 4, DIMS.qk()], &dev);

    // rank r holds tokens r * 100 .. (r + 1) * 100 in its own pool, in reverse block order
    let blocks: Vec<i32> = (0..step.div_ceil(8) as i32).rev().collect();
    let bt = Tensor::<CpuRuntime>::from_slice(&blocks, &[1, blocks.len()], &dev);
    let shard_cache = |rank: usize| {
        let mut kc = vec![0.0f32; 16 * 8 * kr];
        let mut vc = vec![0.0f32; 16 * 8 * vr];
        for p in 0..step {
            let slot = blocks[p / 8] as usize * 8 + p % 8;
            let src = rank * step + p;
            kc[slot * kr..(slot + 1) * kr].copy_from_slice(&keys[src * kr..(src + 1) * kr]);
            vc[slot * vr..(slot + 1) * vr].copy_from_slice(&values[src * vr..(src + 1) * vr]);
        }
        (
            Tensor::<CpuRuntime>::from_slice(&kc, &[16, 8, 2, DIMS.qk()], &dev),
            Tensor::<CpuRuntime>::from_slice(&vc, &[16, 8, 2, DIMS.v], &dev),
        )
    };

    let mut carried: Option<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> = None;
    for rank in 0..ranks {
        let (key_cache, value_cache) = shard_cache(rank);
        let result = client
            .paged_attention_fwd(
                &q,
                None,
                &key_cache,
                Some(&value_cache),
                &bt,
                &[2],
                &[step],
                &AttentionMask::None,
                carried.as_ref().map(|(o, l)| (o, l)),
                &cfg,
            )
            .unwrap();
        carried = Some(result);
    }
    let (out, lse) = carried.unwrap();

    let whole = DenseSequence::new(keys, values, 2, DIMS).unwrap();
    let full = reference_attention(
        &q_data,
        &[2],
        &[whole],
        4,
        cfg.scale(),
        &AttentionMask::None,
        cfg.mask_sentinel(),
    )
    .unwrap();
    let merged =
        AttentionOutput::from_parts(out.to_vec::<f32>(), lse.to_vec::<f32>(), 2, 4, DIMS.v)
            .unwrap();
    assert_close(&merged, &full, 1e-5);
}

fn setup() -> (CpuClient, CpuDevice) {
    let device = CpuDevice::new();
    let client = CpuClient::new(device.clone());
    (client, device)
}

#[test]
fn test_ops_carried_pair_matches_ring_merge() {
    let (client, dev) = setup();
    let mut cfg = AttentionConfig::mla(4, 8, 16);
    cfg.num_kv_heads = Some(2);
    cfg.head_dim_nope = DIMS.nope;
    cfg.head_dim_rope = DIMS.rope;
    cfg.head_dim_v = Some(DIMS.v);
    cfg.ring = true;

    let kv_len = 20;
    let kr = 2 * DIMS.qk();
    let vr = 2 * DIMS.v;
    let keys = wave(kv_len * kr, 0.1);
    let values = wave(kv_len * vr, 0.6);
    let mut kc = vec![0.0f32; 16 * 8 * kr];
    let mut vc = vec![0.0f32; 16 * 8 * vr];
    kc[..kv_len * kr].copy_from_slice(&keys);
    vc[..kv_len * vr].copy_from_slice(&values);

    let key_cache = Tensor::<CpuRuntime>::from_slice(&kc, &[16, 8, 2, DIMS.qk()], &dev);
    let value_cache = Tensor::<CpuRuntime>::from_slice(&vc, &[16, 8, 2, DIMS.v], &dev);
    let bt = Tensor::<CpuRuntime>::from_slice(&[0i32, 1, 2], &[1, 3], &dev);
    let q_data = wave(4 * DIMS.qk(), 0.3);
    let q = Tensor::<CpuRuntime>::from_slice(&q_data, &[1, 4, DIMS.qk()], &dev);

    // a partial result from some other rank
    let other = wave(4 * DIMS.v, 2.0);
    let carried_out = Tensor::<CpuRuntime>::from_slice(&other, &[1, 4, DIMS.v], &dev);
    let carried_lse =
        Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.5, -0.5, 3.0], &[1, 4], &dev);

    let fwd = |carried: Option<(&Tensor<CpuRuntime>, &Tensor<CpuRuntime>)>| {
        client
            .paged_attention_fwd(
                &q,
                None,
                &key_cache,
                Some(&value_cache),
                &bt,
                &[1],
                &[kv_len],
                &AttentionMask::None,
                carried,
                &cfg,
            )
            .unwrap()
    };
    let (local_out, local_lse) = fwd(None);
    let (fused_out, fused_lse) = fwd(Some((&carried_out, &carried_lse)));
    let (merged_out, merged_lse) = client
        .ring_merge(&local_out, &local_lse, &carried_out, &carried_lse)
        .unwrap();

    assert_eq!(fused_out.to_vec::<f32>(), merged_out.to_vec::<f32>());
    assert_eq!(fused_lse.to_vec::<f32>(), merged_lse.to_vec::<f32>());
}
