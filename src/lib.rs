//! # pagemla
//!
//! **Paged-cache attention built on numr: MHA/GQA and multi-latent attention.**
//!
//! pagemla runs attention for packed query batches against a KV cache stored
//! in fixed-size blocks. Keys may be split into a non-rope and a rope part
//! (MLA, 512 + 64), caches may be float or per-channel int8, and partial
//! results from ring participants are merged exactly through their
//! log-sum-exp.
//!
//! ## Relationship to numr
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   pagemla ◄── YOU ARE HERE              │
//! │  (block tables, paged KV cache, tiled attention, merge) │
//! └──────────────────────────┬──────────────────────────────┘
//! │                      numr                                │
//! │            (tensors, dtypes, runtime, casts)             │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design
//!
//! - **Extension traits**: [`PagedAttentionOps`] and [`RingMergeOps`] implemented on numr's clients
//! - **Host kernels**: [`attention`] works on `f32` slices, tile by tile, one task per (sequence, kv head)
//! - **Paged storage**: [`inference`] owns block tables, allocation and the KV cache pool
//! - **Config**: [`config::AttentionConfig`] (JSON) and data-driven [`config::PrecisionPolicy`]

pub mod attention;
pub mod config;
pub mod error;
pub mod inference;
pub mod ops;

pub use attention::{AttentionMask, AttentionOutput, HeadDims, PagedAttention};
pub use config::{AttentionConfig, PrecisionPolicy};
pub use error::{Error, Result};
pub use inference::{BlockCacheResolver, BlockTables, PagedKvCache};
pub use ops::{PagedAttentionOps, RingMergeOps};

// Re-export numr types that users will commonly need
pub use numr::dtype::DType;
pub use numr::runtime::{Runtime, RuntimeClient};
pub use numr::tensor::Tensor;

#[cfg(test)]
pub(crate) mod test_utils {
    use numr::runtime::cpu::{CpuClient, CpuDevice};

    /// Create a CPU client and device for use in unit tests.
    pub(crate) fn cpu_setup() -> (CpuClient, CpuDevice) {
        let device = CpuDevice::new();
        let client = CpuClient::new(device.clone());
        (client, device)
    }

    /// Deterministic test data in `[-1, 1]`.
    pub(crate) fn wave(n: usize, phase: f32) -> Vec<f32> {
        (0..n).map(|i| ((i as f32) * 0.37 + phase).sin()).collect()
    }
}
