//! Element storage for the paged KV cache
//!
//! The storage format is chosen once when the cache is built. Reads always
//! produce `f32` working values; F16/BF16 go through `half`, Int8 through
//! per-channel dequantization.

use crate::attention::score::{dequantize_int8_into, quantize_int8_into};
use crate::error::{Error, Result};
use half::{bf16, f16};
use numr::dtype::DType;
use serde::{Deserialize, Serialize};

/// Storage dtype of cache elements or outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageDType {
    #[default]
    F32,
    F16,
    BF16,
    Int8,
}

impl StorageDType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            StorageDType::F32 => 4,
            StorageDType::F16 | StorageDType::BF16 => 2,
            StorageDType::Int8 => 1,
        }
    }

    pub fn to_dtype(self) -> DType {
        match self {
            StorageDType::F32 => DType::F32,
            StorageDType::F16 => DType::F16,
            StorageDType::BF16 => DType::BF16,
            StorageDType::Int8 => DType::I8,
        }
    }

    pub fn from_dtype(dtype: DType) -> Result<Self> {
        match dtype {
            DType::F32 => Ok(StorageDType::F32),
            DType::F16 => Ok(StorageDType::F16),
            DType::BF16 => Ok(StorageDType::BF16),
            DType::I8 => Ok(StorageDType::Int8),
            other => Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: other,
            }),
        }
    }

    /// Round `values` in place to this dtype's precision.
    ///
    /// Int8 has no float rounding of its own (it needs scales), so it is
    /// left untouched.
    pub fn round_slice(&self, values: &mut [f32]) {
        match self {
            StorageDType::F32 | StorageDType::Int8 => {}
            StorageDType::F16 => values
                .iter_mut()
                .for_each(|v| *v = f16::from_f32(*v).to_f32()),
            StorageDType::BF16 => values
                .iter_mut()
                .for_each(|v| *v = bf16::from_f32(*v).to_f32()),
        }
    }
}

/// Per-channel int8 dequantization parameters.
///
/// `value = (q as i32 + offset[c]) as f32 * scale[c]`, one channel per
/// `(kv_head, dim)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelQuant {
    pub scale: Vec<f32>,
    pub offset: Option<Vec<i32>>,
}

impl ChannelQuant {
    pub fn new(scale: Vec<f32>, offset: Option<Vec<i32>>) -> Result<Self> {
        if let Some(off) = &offset {
            if off.len() != scale.len() {
                return Err(Error::shape("quant offset", &[scale.len()], &[off.len()]));
            }
        }
        Ok(Self { scale, offset })
    }

    /// Symmetric quantization (no offset) with one scale for every channel.
    pub fn uniform(channels: usize, scale: f32) -> Self {
        Self {
            scale: vec![scale; channels],
            offset: None,
        }
    }

    pub fn channels(&self) -> usize {
        self.scale.len()
    }
}

/// Backing buffer of one cache tensor (keys or values).
#[derive(Debug, Clone)]
pub enum KvStorage {
    F32(Vec<f32>),
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    Int8 { data: Vec<i8>, quant: ChannelQuant },
}

impl KvStorage {
    /// Zero-filled storage of `len` elements.
    pub fn zeros(dtype: StorageDType, len: usize, quant: Option<ChannelQuant>) -> Result<Self> {
        Ok(match dtype {
            StorageDType::F32 => KvStorage::F32(vec![0.0; len]),
            StorageDType::F16 => KvStorage::F16(vec![f16::ZERO; len]),
            StorageDType::BF16 => KvStorage::BF16(vec![bf16::ZERO; len]),
            StorageDType::Int8 => {
                let quant = quant.ok_or(Error::InvalidArgument {
                    arg: "quant",
                    reason: "int8 storage requires per-channel dequantization scales".into(),
                })?;
                KvStorage::Int8 {
                    data: vec![0; len],
                    quant,
                }
            }
        })
    }

    pub fn dtype(&self) -> StorageDType {
        match self {
            KvStorage::F32(_) => StorageDType::F32,
            KvStorage::F16(_) => StorageDType::F16,
            KvStorage::BF16(_) => StorageDType::BF16,
            KvStorage::Int8 { .. } => StorageDType::Int8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            KvStorage::F32(v) => v.len(),
            KvStorage::F16(v) => v.len(),
            KvStorage::BF16(v) => v.len(),
            KvStorage::Int8 { data, .. } => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read `dst.len()` elements starting at `start` as f32.
    /// `channel` is the first quantization channel of the row.
    pub(crate) fn read_into(&self, start: usize, channel: usize, dst: &mut [f32]) {
        let n = dst.len();
        match self {
            KvStorage::F32(v) => dst.copy_from_slice(&v[start..start + n]),
            KvStorage::F16(v) => {
                for (d, s) in dst.iter_mut().zip(&v[start..start + n]) {
                    *d = s.to_f32();
                }
            }
            KvStorage::BF16(v) => {
                for (d, s) in dst.iter_mut().zip(&v[start..start + n]) {
                    *d = s.to_f32();
                }
            }
            KvStorage::Int8 { data, quant } => {
                dequantize_int8_into(&data[start..start + n], quant, channel, dst)
            }
        }
    }

    /// Write `src` at `start`, converting (or quantizing) to the storage dtype.
    pub(crate) fn write_from(&mut self, start: usize, channel: usize, src: &[f32]) {
        let n = src.len();
        match self {
            KvStorage::F32(v) => v[start..start + n].copy_from_slice(src),
            KvStorage::F16(v) => {
                for (d, &s) in v[start..start + n].iter_mut().zip(src) {
                    *d = f16::from_f32(s);
                }
            }
            KvStorage::BF16(v) => {
                for (d, &s) in v[start..start + n].iter_mut().zip(src) {
                    *d = bf16::from_f32(s);
                }
            }
            KvStorage::Int8 { data, quant } => {
                quantize_int8_into(src, quant, channel, &mut data[start..start + n])
            }
        }
    }
}
