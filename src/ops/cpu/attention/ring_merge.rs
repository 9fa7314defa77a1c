//! CPU implementation of RingMergeOps

use super::{check_shape, host_f32, output_tensor};
use crate::attention::{AttentionOutput, merge};
use crate::error::{Error, Result};
use crate::ops::traits::RingMergeOps;
use numr::dtype::DType;
use numr::runtime::cpu::{CpuClient, CpuRuntime};
use numr::tensor::Tensor;

fn partial(
    client: &CpuClient,
    output: &Tensor<CpuRuntime>,
    lse: &Tensor<CpuRuntime>,
) -> Result<AttentionOutput> {
    let shape = output.shape();
    if shape.len() != 3 {
        return Err(Error::shape("output", &[0, 0, 0], shape));
    }
    if lse.dtype() != DType::F32 {
        return Err(Error::DTypeMismatch {
            expected: DType::F32,
            got: lse.dtype(),
        });
    }
    check_shape(lse, &shape[..2], "lse")?;
    AttentionOutput::from_parts(
        host_f32(client, output)?,
        lse.to_vec::<f32>(),
        shape[0],
        shape[1],
        shape[2],
    )
}

impl RingMergeOps<CpuRuntime> for CpuClient {
    fn ring_merge(
        &self,
        output: &Tensor<CpuRuntime>,
        lse: &Tensor<CpuRuntime>,
        carried_output: &Tensor<CpuRuntime>,
        carried_lse: &Tensor<CpuRuntime>,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        check_shape(carried_output, output.shape(), "carried_output")?;
        let current = partial(self, output, lse)?;
        let carried = partial(self, carried_output, carried_lse)?;
        let merged = merge(&current, &carried)?;

        let device = output.device();
        let out = output_tensor(
            self,
            &merged.output,
            output.shape(),
            output.dtype(),
            device,
        )?;
        let lse = Tensor::<CpuRuntime>::from_slice(&merged.lse, lse.shape(), device);
        Ok((out, lse))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;

    #[test]
    fn test_ring_merge_equal_weights() {
        let (client, dev) = cpu_setup();
        let out_a = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 0.0], &[1, 1, 2], &dev);
        let out_b = Tensor::<CpuRuntime>::from_slice(&[0.0f32, 1.0], &[1, 1, 2], &dev);
        let lse = Tensor::<CpuRuntime>::from_slice(&[0.0f32], &[1, 1], &dev);

        let (out, merged_lse) = client.ring_merge(&out_a, &lse, &out_b, &lse).unwrap();
        assert_eq!(out.shape(), &[1, 1, 2]);
        let out = out.to_vec::<f32>();
        assert!((out[0] - 0.5).abs() < 1e-6 && (out[1] - 0.5).abs() < 1e-6);
        assert!((merged_lse.to_vec::<f32>()[0] - 2f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_ring_merge_identity_carried() {
        let (client, dev) = cpu_setup();
        let out = Tensor::<CpuRuntime>::from_slice(&[0.25f32, -0.5, 2.0, 3.0], &[2, 1, 2], &dev);
        let lse = Tensor::<CpuRuntime>::from_slice(&[1.5f32, -2.0], &[2, 1], &dev);
        let zero = Tensor::<CpuRuntime>::from_slice(&[0.0f32; 4], &[2, 1, 2], &dev);
        let neg_inf =
            Tensor::<CpuRuntime>::from_slice(&[f32::NEG_INFINITY; 2], &[2, 1], &dev);

        let (merged, merged_lse) = client.ring_merge(&out, &lse, &zero, &neg_inf).unwrap();
        assert_eq!(merged.to_vec::<f32>(), out.to_vec::<f32>());
        assert_eq!(merged_lse.to_vec::<f32>(), lse.to_vec::<f32>());
    }

    #[test]
    fn test_ring_merge_shape_mismatch() {
        let (client, dev) = cpu_setup();
        let a = Tensor::<CpuRuntime>::from_slice(&[0.0f32; 4], &[1, 2, 2], &dev);
        let b = Tensor::<CpuRuntime>::from_slice(&[0.0f32; 4], &[2, 1, 2], &dev);
        let lse = Tensor::<CpuRuntime>::from_slice(&[0.0f32; 2], &[1, 2], &dev);
        assert!(matches!(
            client.ring_merge(&a, &lse, &b, &lse),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
