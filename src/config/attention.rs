//! Attention configuration types.

use crate::attention::{AttentionParams, HeadDims};
use crate::error::{Error, Result};
use crate::inference::{HeadAddressing, PagedKvCacheBuilder, StorageDType, ValueStorage};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Paged attention configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionConfig {
    pub num_heads: usize,

    #[serde(default)]
    pub num_kv_heads: Option<usize>,

    /// Non-rope (content) part of the key
    #[serde(default = "default_head_dim_nope")]
    pub head_dim_nope: usize,

    /// Rope part of the key, 0 disables the split
    #[serde(default = "default_head_dim_rope")]
    pub head_dim_rope: usize,

    #[serde(default)]
    pub head_dim_v: Option<usize>,

    pub block_size: usize,

    pub num_blocks: usize,

    /// Score scale, defaults to `1/sqrt(head_dim_nope + head_dim_rope)`
    #[serde(default)]
    pub scale: Option<f32>,

    /// KV positions per tile, defaults to `block_size`
    #[serde(default)]
    pub kv_tile_len: Option<usize>,

    #[serde(default)]
    pub layout: HeadAddressing,

    #[serde(default)]
    pub value_storage: ValueStorage,

    #[serde(default)]
    pub cache_dtype: StorageDType,

    /// Bias for disallowed positions, defaults to `-inf`
    #[serde(default)]
    pub mask_sentinel: Option<f32>,

    /// Produce LSE and merge a carried partial result
    #[serde(default)]
    pub ring: bool,
}

fn default_head_dim_nope() -> usize {
    512
}

fn default_head_dim_rope() -> usize {
    64
}

impl AttentionConfig {
    /// MLA defaults (512 + 64 key, 512 value) for `num_heads` query heads over
    /// one latent KV head.
    pub fn mla(num_heads: usize, block_size: usize, num_blocks: usize) -> Self {
        Self {
            num_heads,
            num_kv_heads: Some(1),
            head_dim_nope: default_head_dim_nope(),
            head_dim_rope: default_head_dim_rope(),
            head_dim_v: None,
            block_size,
            num_blocks,
            scale: None,
            kv_tile_len: None,
            layout: HeadAddressing::Shared,
            value_storage: ValueStorage::Separate,
            cache_dtype: StorageDType::F32,
            mask_sentinel: None,
            ring: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let kv = self.kv_heads();
        if self.num_heads == 0 || kv == 0 || self.num_heads % kv != 0 {
            return Err(Error::InvalidGrouping {
                num_heads: self.num_heads,
                num_kv_heads: kv,
            });
        }
        for (name, v) in [
            ("block_size", self.block_size),
            ("num_blocks", self.num_blocks),
            ("head_dim_nope", self.head_dim_nope),
            ("head_dim_v", self.head_dim_v()),
        ] {
            if v == 0 {
                return Err(Error::Config {
                    reason: format!("{name} must be > 0"),
                });
            }
        }
        if self.kv_tile_len == Some(0) {
            return Err(Error::Config {
                reason: "kv_tile_len must be > 0".into(),
            });
        }
        if let Some(scale) = self.scale {
            if !scale.is_finite() || scale <= 0.0 {
                return Err(Error::Config {
                    reason: format!("scale must be finite and positive, got {scale}"),
                });
            }
        }
        if let Some(s) = self.mask_sentinel {
            if s.is_nan() || s > 0.0 {
                return Err(Error::Config {
                    reason: format!("mask_sentinel must be negative, got {s}"),
                });
            }
        }
        if self.value_storage == ValueStorage::Combined && self.head_dim_v() > self.head_dim_nope {
            return Err(Error::Config {
                reason: format!(
                    "combined kv needs head_dim_v ({}) <= head_dim_nope ({})",
                    self.head_dim_v(),
                    self.head_dim_nope
                ),
            });
        }
        if let HeadAddressing::CompressedHead {
            num_blocks_per_head,
        } = self.layout
        {
            if num_blocks_per_head == 0 || num_blocks_per_head * kv > self.num_blocks {
                return Err(Error::Config {
                    reason: format!(
                        "compressed_head: {num_blocks_per_head} blocks per head x {kv} heads \
                         exceeds num_blocks ({})",
                        self.num_blocks
                    ),
                });
            }
        }
        Ok(())
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content).map_err(|e| Error::Config {
            reason: format!("JSON parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::Config {
            reason: format!("IO error: {e}"),
        })?;
        Self::from_json(&content)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Config {
            reason: format!("JSON encode error: {e}"),
        })
    }

    pub fn kv_heads(&self) -> usize {
        self.num_kv_heads.unwrap_or(self.num_heads)
    }

    pub fn head_dim_v(&self) -> usize {
        self.head_dim_v.unwrap_or(self.head_dim_nope)
    }

    pub fn dims(&self) -> HeadDims {
        HeadDims::new(self.head_dim_nope, self.head_dim_rope, self.head_dim_v())
    }

    pub fn scale(&self) -> f32 {
        self.scale
            .unwrap_or_else(|| (self.dims().qk() as f32).sqrt().recip())
    }

    pub fn kv_tile_len(&self) -> usize {
        self.kv_tile_len.unwrap_or(self.block_size)
    }

    pub fn mask_sentinel(&self) -> f32 {
        self.mask_sentinel.unwrap_or(f32::NEG_INFINITY)
    }

    /// Per-invocation parameters for [`crate::attention::PagedAttention`].
    pub fn params(&self) -> AttentionParams {
        AttentionParams::new(self.num_heads, self.kv_heads(), self.dims())
            .with_scale(self.scale())
            .with_kv_tile_len(self.kv_tile_len())
            .with_mask_sentinel(self.mask_sentinel())
    }

    /// Cache builder matching this layout. Int8 caches still need
    /// [`PagedKvCacheBuilder::int8`].
    pub fn cache_builder(&self) -> PagedKvCacheBuilder {
        crate::inference::PagedKvCache::builder()
            .num_blocks(self.num_blocks)
            .block_size(self.block_size)
            .num_kv_heads(self.kv_heads())
            .key_dims(self.head_dim_nope, self.head_dim_rope)
            .head_dim_v(self.head_dim_v())
            .addressing(self.layout)
            .value_storage(self.value_storage)
            .dtype(self.cache_dtype)
    }
}
