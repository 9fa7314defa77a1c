//! Shared fixtures: fill a paged cache through the block allocator and keep
//! the same data in contiguous form for the golden path.

#![allow(dead_code)]

use pagemla::attention::{AttentionOutput, DenseSequence, HeadDims};
use pagemla::inference::{
    BlockAllocator, BlockTable, BlockTables, CpuBlockAllocator, HeadAddressing, PagedKvCache,
    PagedKvCacheBuilder, ValueStorage,
};

/// Deterministic data in `[-1, 1]`.
pub fn wave(n: usize, phase: f32) -> Vec<f32> {
    (0..n).map(|i| ((i as f32) * 0.37 + phase).sin()).collect()
}

pub struct Fixture {
    pub cache: PagedKvCache,
    pub tables: BlockTables,
    pub seqs: Vec<DenseSequence>,
    pub kv_lens: Vec<usize>,
}

/// Build the cache described by `builder` and write `kv_lens[i]` tokens for
/// every sequence. One spare block is taken between sequences so that no
/// table is a contiguous range.
pub fn fill(builder: PagedKvCacheBuilder, kv_lens: &[usize], phase: f32) -> Fixture {
    fill_with(builder, kv_lens, phase, |_| {})
}

/// Like [`fill`], with `storage_round` applied to the contiguous copy so it
/// matches what a lossy cache hands back on read.
pub fn fill_with(
    builder: PagedKvCacheBuilder,
    kv_lens: &[usize],
    phase: f32,
    storage_round: impl Fn(&mut [f32]),
) -> Fixture {
    let layout = *builder.layout();
    let dims = HeadDims::new(layout.head_dim_nope, layout.head_dim_rope, layout.head_dim_v);
    let heads = layout.num_kv_heads;
    let pool = match layout.addressing {
        HeadAddressing::Shared => layout.num_blocks,
        HeadAddressing::CompressedHead {
            num_blocks_per_head,
        } => num_blocks_per_head,
    };
    let combined = layout.value_storage == ValueStorage::Combined;

    let mut cache = builder.build().unwrap();
    let allocator = CpuBlockAllocator::new(pool, layout.block_size);

    let mut tables: Vec<BlockTable> = Vec::new();
    let mut seqs = Vec::new();
    for (i, &kv_len) in kv_lens.iter().enumerate() {
        let table = allocator.allocate_table(kv_len).unwrap();
        allocator.allocate(1).unwrap();

        let keys = wave(kv_len * heads * dims.qk(), phase + i as f32);
        let values = wave(kv_len * heads * dims.v, phase + 0.5 + i as f32);
        let slots: Vec<i32> = (0..kv_len)
            .map(|p| table.slot_mapping(p).unwrap())
            .collect();
        cache
            .reshape_and_cache(&keys, (!combined).then_some(values.as_slice()), &slots)
            .unwrap();

        let mut keys = keys;
        let mut values = if combined {
            keys.chunks(dims.qk())
                .flat_map(|k| k[..dims.v].to_vec())
                .collect()
        } else {
            values
        };
        storage_round(&mut keys);
        storage_round(&mut values);
        seqs.push(DenseSequence::new(keys, values, heads, dims).unwrap());
        tables.push(table);
    }

    Fixture {
        cache,
        tables: BlockTables::from_tables(&tables),
        seqs,
        kv_lens: kv_lens.to_vec(),
    }
}

/// Round to the int8 grid of `ChannelQuant::uniform(_, 1.0 / 64.0)`.
pub fn int8_round(values: &mut [f32]) {
    for v in values {
        *v = (*v * 64.0).round().clamp(-128.0, 127.0) / 64.0;
    }
}

pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(x, y)| if x == y { 0.0 } else { (x - y).abs() })
        .fold(0.0, f32::max)
}

pub fn assert_close(got: &AttentionOutput, expect: &AttentionOutput, tol: f32) {
    assert_eq!(got.shape(), expect.shape());
    let out = max_abs_diff(&got.output, &expect.output);
    assert!(out <= tol, "output differs by {out}");
    let lse = max_abs_diff(&got.lse, &expect.lse);
    assert!(lse <= tol, "lse differs by {lse}");
}
