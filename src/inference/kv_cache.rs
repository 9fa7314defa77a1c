//! Paged KV cache - fixed pool of blocks addressed through block tables
//!
//! Layout: `keys[num_blocks, block_size, heads_per_slot, key_dim]` where
//! `key_dim = head_dim_nope + head_dim_rope` (the non-rope segment comes
//! first). Values are either stored separately as
//! `[num_blocks, block_size, heads_per_slot, head_dim_v]` or alias the
//! leading `head_dim_v` channels of the key (combined MLA latent cache).
//!
//! The attention path only reads the cache. Writes go through
//! [`PagedKvCache::write_token`] / [`PagedKvCache::reshape_and_cache`].

use super::memory::{HeadAddressing, SlotAddress, SlotFootprint};
use super::storage::{ChannelQuant, KvStorage, StorageDType};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Where values live relative to keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueStorage {
    /// Values have their own cache tensor.
    #[default]
    Separate,
    /// Values are the leading `head_dim_v` channels of the key.
    Combined,
}

/// Geometry of a paged KV cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvCacheLayout {
    pub num_blocks: usize,
    pub block_size: usize,
    pub num_kv_heads: usize,
    pub head_dim_nope: usize,
    pub head_dim_rope: usize,
    pub head_dim_v: usize,
    pub addressing: HeadAddressing,
    pub value_storage: ValueStorage,
}

impl KvCacheLayout {
    pub fn key_dim(&self) -> usize {
        self.head_dim_nope + self.head_dim_rope
    }

    pub fn heads_per_slot(&self) -> usize {
        self.addressing.heads_per_slot(self.num_kv_heads)
    }

    /// Shape of the key cache tensor.
    pub fn key_shape(&self) -> [usize; 4] {
        [
            self.num_blocks,
            self.block_size,
            self.heads_per_slot(),
            self.key_dim(),
        ]
    }

    /// Shape of the value cache tensor, `None` for combined storage.
    pub fn value_shape(&self) -> Option<[usize; 4]> {
        match self.value_storage {
            ValueStorage::Separate => Some([
                self.num_blocks,
                self.block_size,
                self.heads_per_slot(),
                self.head_dim_v,
            ]),
            ValueStorage::Combined => None,
        }
    }

    pub fn footprint(&self, dtype: StorageDType) -> SlotFootprint {
        SlotFootprint {
            heads_per_slot: self.heads_per_slot(),
            key_dim: self.key_dim(),
            value_dim: match self.value_storage {
                ValueStorage::Separate => self.head_dim_v,
                ValueStorage::Combined => 0,
            },
            elem_bytes: dtype.size_in_bytes(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (arg, v) in [
            ("num_blocks", self.num_blocks),
            ("block_size", self.block_size),
            ("num_kv_heads", self.num_kv_heads),
            ("head_dim_nope", self.head_dim_nope),
            ("head_dim_v", self.head_dim_v),
        ] {
            if v == 0 {
                return Err(Error::InvalidArgument {
                    arg,
                    reason: "must be > 0".into(),
                });
            }
        }
        if self.value_storage == ValueStorage::Combined && self.head_dim_v > self.head_dim_nope {
            return Err(Error::InvalidArgument {
                arg: "head_dim_v",
                reason: format!(
                    "combined kv needs head_dim_v ({}) <= head_dim_nope ({})",
                    self.head_dim_v, self.head_dim_nope
                ),
            });
        }
        if let HeadAddressing::CompressedHead {
            num_blocks_per_head,
        } = self.addressing
        {
            if num_blocks_per_head == 0 || num_blocks_per_head * self.num_kv_heads > self.num_blocks
            {
                return Err(Error::InvalidArgument {
                    arg: "num_blocks_per_head",
                    reason: format!(
                        "{num_blocks_per_head} blocks per head x {} heads does not fit {} blocks",
                        self.num_kv_heads, self.num_blocks
                    ),
                });
            }
        }
        Ok(())
    }

    fn slot_index(&self, addr: SlotAddress, kv_head: usize) -> Result<usize> {
        if addr.block >= self.num_blocks {
            return Err(Error::OutOfRange {
                what: "block id",
                index: addr.block,
                limit: self.num_blocks,
            });
        }
        if addr.slot >= self.block_size {
            return Err(Error::OutOfRange {
                what: "slot",
                index: addr.slot,
                limit: self.block_size,
            });
        }
        if kv_head >= self.num_kv_heads {
            return Err(Error::OutOfRange {
                what: "kv head",
                index: kv_head,
                limit: self.num_kv_heads,
            });
        }
        let head = self.addressing.head_in_slot(kv_head);
        Ok((addr.block * self.block_size + addr.slot) * self.heads_per_slot() + head)
    }
}

/// Host-resident paged KV cache.
#[derive(Debug, Clone)]
pub struct PagedKvCache {
    layout: KvCacheLayout,
    keys: KvStorage,
    values: Option<KvStorage>,
}

impl PagedKvCache {
    pub fn builder() -> PagedKvCacheBuilder {
        PagedKvCacheBuilder::default()
    }

    /// Wrap existing f32 buffers laid out as [`KvCacheLayout::key_shape`] /
    /// [`KvCacheLayout::value_shape`].
    pub fn from_f32(
        layout: KvCacheLayout,
        keys: Vec<f32>,
        values: Option<Vec<f32>>,
    ) -> Result<Self> {
        Self::from_storage(layout, KvStorage::F32(keys), values.map(KvStorage::F32))
    }

    /// Wrap existing int8 buffers with their per-channel dequantization.
    pub fn from_int8(
        layout: KvCacheLayout,
        keys: Vec<i8>,
        key_quant: ChannelQuant,
        values: Option<(Vec<i8>, ChannelQuant)>,
    ) -> Result<Self> {
        Self::from_storage(
            layout,
            KvStorage::Int8 {
                data: keys,
                quant: key_quant,
            },
            values.map(|(data, quant)| KvStorage::Int8 { data, quant }),
        )
    }

    fn from_storage(
        layout: KvCacheLayout,
        keys: KvStorage,
        values: Option<KvStorage>,
    ) -> Result<Self> {
        layout.validate()?;

        let key_shape = layout.key_shape();
        let key_len: usize = key_shape.iter().product();
        if keys.len() != key_len {
            return Err(Error::shape("key_cache", &key_shape, &[keys.len()]));
        }
        check_quant(&keys, layout.num_kv_heads * layout.key_dim(), "key quant")?;

        match (layout.value_shape(), &values) {
            (Some(shape), Some(v)) => {
                let len: usize = shape.iter().product();
                if v.len() != len {
                    return Err(Error::shape("value_cache", &shape, &[v.len()]));
                }
                check_quant(v, layout.num_kv_heads * layout.head_dim_v, "value quant")?;
            }
            (Some(shape), None) => {
                return Err(Error::shape("value_cache", &shape, &[]));
            }
            (None, Some(v)) => {
                return Err(Error::shape("value_cache", &[], &[v.len()]));
            }
            (None, None) => {}
        }

        Ok(Self {
            layout,
            keys,
            values,
        })
    }

    pub fn layout(&self) -> &KvCacheLayout {
        &self.layout
    }

    pub fn dtype(&self) -> StorageDType {
        self.keys.dtype()
    }

    /// Read the full key row (non-rope then rope) for `kv_head` at `addr`.
    pub fn read_key(&self, addr: SlotAddress, kv_head: usize, dst: &mut [f32]) -> Result<()> {
        let key_dim = self.layout.key_dim();
        if dst.len() != key_dim {
            return Err(Error::shape("key row", &[key_dim], &[dst.len()]));
        }
        let idx = self.layout.slot_index(addr, kv_head)?;
        self.keys.read_into(idx * key_dim, kv_head * key_dim, dst);
        Ok(())
    }

    /// Read the value row for `kv_head` at `addr`.
    pub fn read_value(&self, addr: SlotAddress, kv_head: usize, dst: &mut [f32]) -> Result<()> {
        let dv = self.layout.head_dim_v;
        if dst.len() != dv {
            return Err(Error::shape("value row", &[dv], &[dst.len()]));
        }
        let idx = self.layout.slot_index(addr, kv_head)?;
        match &self.values {
            Some(values) => values.read_into(idx * dv, kv_head * dv, dst),
            None => {
                let key_dim = self.layout.key_dim();
                self.keys.read_into(idx * key_dim, kv_head * key_dim, dst)
            }
        }
        Ok(())
    }

    /// Write one token's key (and value, for separate storage) into a slot.
    pub fn write_token(
        &mut self,
        addr: SlotAddress,
        kv_head: usize,
        key: &[f32],
        value: Option<&[f32]>,
    ) -> Result<()> {
        let key_dim = self.layout.key_dim();
        let dv = self.layout.head_dim_v;
        if key.len() != key_dim {
            return Err(Error::shape("key row", &[key_dim], &[key.len()]));
        }
        let idx = self.layout.slot_index(addr, kv_head)?;

        match (&mut self.values, value) {
            (Some(values), Some(v)) => {
                if v.len() != dv {
                    return Err(Error::shape("value row", &[dv], &[v.len()]));
                }
                values.write_from(idx * dv, kv_head * dv, v);
            }
            (Some(_), None) => {
                return Err(Error::InvalidArgument {
                    arg: "value",
                    reason: "separate value storage needs a value row".into(),
                });
            }
            (None, Some(_)) => {
                return Err(Error::InvalidArgument {
                    arg: "value",
                    reason: "combined kv cache takes values from the key row".into(),
                });
            }
            (None, None) => {}
        }
        self.keys.write_from(idx * key_dim, kv_head * key_dim, key);
        Ok(())
    }

    /// Scatter `[num_tokens, num_kv_heads, dim]` rows into the slots named by
    /// `slot_mapping` (`table_block * block_size + slot`, `< 0` = skip).
    pub fn reshape_and_cache(
        &mut self,
        keys: &[f32],
        values: Option<&[f32]>,
        slot_mapping: &[i32],
    ) -> Result<()> {
        let num_tokens = slot_mapping.len();
        let heads = self.layout.num_kv_heads;
        let key_dim = self.layout.key_dim();
        let dv = self.layout.head_dim_v;

        if keys.len() != num_tokens * heads * key_dim {
            return Err(Error::shape(
                "keys",
                &[num_tokens, heads, key_dim],
                &[keys.len()],
            ));
        }
        if let Some(v) = values {
            if v.len() != num_tokens * heads * dv {
                return Err(Error::shape("values", &[num_tokens, heads, dv], &[v.len()]));
            }
        }

        // validate every slot before the first write
        let bs = self.layout.block_size;
        let limit = self.layout.addressing.table_entry_limit(self.layout.num_blocks);
        if let Some(&bad) = slot_mapping
            .iter()
            .find(|&&s| s >= 0 && s as usize / bs >= limit)
        {
            return Err(Error::OutOfRange {
                what: "block id",
                index: bad as usize / bs,
                limit,
            });
        }

        for (t, &slot) in slot_mapping.iter().enumerate() {
            if slot < 0 {
                continue;
            }
            let slot = slot as usize;
            for h in 0..heads {
                let addr = SlotAddress {
                    block: self.layout.addressing.physical_block(slot / bs, h),
                    slot: slot % bs,
                };
                let k = &keys[(t * heads + h) * key_dim..][..key_dim];
                let v = values.map(|v| &v[(t * heads + h) * dv..][..dv]);
                self.write_token(addr, h, k, v)?;
            }
        }
        Ok(())
    }
}

fn check_quant(storage: &KvStorage, channels: usize, arg: &'static str) -> Result<()> {
    if let KvStorage::Int8 { quant, .. } = storage {
        if quant.channels() != channels {
            return Err(Error::shape(arg, &[channels], &[quant.channels()]));
        }
    }
    Ok(())
}

/// Builder for [`PagedKvCache`]; storage format and layout are fixed here.
#[derive(Debug, Clone)]
pub struct PagedKvCacheBuilder {
    layout: KvCacheLayout,
    dtype: StorageDType,
    key_quant: Option<ChannelQuant>,
    value_quant: Option<ChannelQuant>,
}

impl Default for PagedKvCacheBuilder {
    fn default() -> Self {
        Self {
            layout: KvCacheLayout {
                num_blocks: 0,
                block_size: 128,
                num_kv_heads: 1,
                head_dim_nope: 512,
                head_dim_rope: 64,
                head_dim_v: 512,
                addressing: HeadAddressing::Shared,
                value_storage: ValueStorage::Separate,
            },
            dtype: StorageDType::F32,
            key_quant: None,
            value_quant: None,
        }
    }
}

impl PagedKvCacheBuilder {
    pub fn num_blocks(mut self, n: usize) -> Self {
        self.layout.num_blocks = n;
        self
    }

    pub fn block_size(mut self, n: usize) -> Self {
        self.layout.block_size = n;
        self
    }

    pub fn num_kv_heads(mut self, n: usize) -> Self {
        self.layout.num_kv_heads = n;
        self
    }

    /// Key widths: non-rope and rope segments. `rope = 0` means a plain key.
    pub fn key_dims(mut self, nope: usize, rope: usize) -> Self {
        self.layout.head_dim_nope = nope;
        self.layout.head_dim_rope = rope;
        self
    }

    pub fn head_dim_v(mut self, n: usize) -> Self {
        self.layout.head_dim_v = n;
        self
    }

    pub fn addressing(mut self, addressing: HeadAddressing) -> Self {
        self.layout.addressing = addressing;
        self
    }

    pub fn value_storage(mut self, value_storage: ValueStorage) -> Self {
        self.layout.value_storage = value_storage;
        self
    }

    pub fn dtype(mut self, dtype: StorageDType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Int8 storage with per-channel dequantization for keys and values.
    pub fn int8(mut self, key_quant: ChannelQuant, value_quant: Option<ChannelQuant>) -> Self {
        self.dtype = StorageDType::Int8;
        self.key_quant = Some(key_quant);
        self.value_quant = value_quant;
        self
    }

    pub fn layout(&self) -> &KvCacheLayout {
        &self.layout
    }

    /// Allocate a zero-filled cache.
    pub fn build(self) -> Result<PagedKvCache> {
        let layout = self.layout;
        layout.validate()?;

        let key_len: usize = layout.key_shape().iter().product();
        let keys = KvStorage::zeros(self.dtype, key_len, self.key_quant)?;
        let values = match layout.value_shape() {
            Some(shape) => Some(KvStorage::zeros(
                self.dtype,
                shape.iter().product(),
                self.value_quant,
            )?),
            None => None,
        };
        PagedKvCache::from_storage(layout, keys, values)
    }
}
