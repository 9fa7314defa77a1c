//! CPU attention ops: host copies in, tiled kernels, tensors out

pub mod paged_attention;
pub mod ring_merge;

use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::ops::TypeConversionOps;
use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
use numr::tensor::Tensor;

/// Copy a F32/F16/BF16 tensor to host `f32`.
pub(crate) fn host_f32(client: &CpuClient, t: &Tensor<CpuRuntime>) -> Result<Vec<f32>> {
    match t.dtype() {
        DType::F32 => Ok(t.to_vec::<f32>()),
        DType::F16 | DType::BF16 => Ok(client
            .cast(t, DType::F32)
            .map_err(Error::Numr)?
            .to_vec::<f32>()),
        other => Err(Error::DTypeMismatch {
            expected: DType::F32,
            got: other,
        }),
    }
}

/// Build an output tensor from `f32` data, cast to `dtype`.
pub(crate) fn output_tensor(
    client: &CpuClient,
    data: &[f32],
    shape: &[usize],
    dtype: DType,
    device: &CpuDevice,
) -> Result<Tensor<CpuRuntime>> {
    let t = Tensor::<CpuRuntime>::from_slice(data, shape, device);
    if dtype == DType::F32 {
        return Ok(t);
    }
    client.cast(&t, dtype).map_err(Error::Numr)
}

pub(crate) fn check_shape(
    t: &Tensor<CpuRuntime>,
    expected: &[usize],
    arg: &'static str,
) -> Result<()> {
    if t.shape() != expected {
        return Err(Error::shape(arg, expected, t.shape()));
    }
    Ok(())
}
