//! CPU implementation of QuantMatmulOps

use crate::error::{Error, Result};
use crate::is_float;
use crate::quant::traits::QuantMatmulOps;
use crate::quant::{QuantTensor, ffi};
use numr::dtype::DType;
use numr::ops::TypeConversionOps;
use numr::runtime::Device;
use numr::runtime::cpu::{CpuClient, CpuRuntime};
use numr::tensor::Tensor;
use tracing::trace;

impl QuantMatmulOps<CpuRuntime> for CpuClient {
    fn quant_matmul(
        &self,
        activation: &Tensor<CpuRuntime>,
        weight: &QuantTensor<CpuRuntime>,
    ) -> Result<Tensor<CpuRuntime>> {
        if weight.device().id() != activation.device().id() {
            return Err(Error::InvalidArgument {
                arg: "weight",
                reason: format!(
                    "weight on device {:?}, activation on device {:?}",
                    weight.device().id(),
                    activation.device().id()
                ),
            });
        }

        // Validate weight is 2D: [N, K]
        let &[n, k] = weight.shape() else {
            return Err(Error::QuantError {
                reason: format!(
                    "quant_matmul weight must be 2D [N, K], got {:?}",
                    weight.shape()
                ),
            });
        };

        // Validate activation shape: [M, K]
        let &[m, a_k] = activation.shape() else {
            return Err(Error::InvalidArgument {
                arg: "activation",
                reason: format!(
                    "quant_matmul activation must be 2D [M, K], got {:?}",
                    activation.shape()
                ),
            });
        };
        if a_k != k {
            return Err(Error::ShapeMismatch {
                expected: vec![m, k],
                got: activation.shape().to_vec(),
            });
        }

        let activation = match activation.dtype() {
            DType::F32 => activation.clone(),
            dt if is_float(dt) => self.cast(activation, DType::F32)?,
            other => {
                return Err(Error::DTypeMismatch {
                    expected: DType::F32,
                    got: other,
                });
            }
        };

        trace!(m = m, k = k, n = n, "int4 quant_matmul");
        ffi::mul_mat(weight, &activation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::{dequantize_int4, quantize_int4};
    use crate::test_utils::{cpu_setup, det_tensor};
    use numr::ops::MatmulOps;

    #[test]
    fn test_quant_matmul_basic() {
        let (client, device) = cpu_setup();

        // activation [1, 64] of ones, weight [1, 64] with every value 2.0
        let act = Tensor::<CpuRuntime>::from_slice(&[1.0f32; 64], &[1, 64], &device).unwrap();
        let mut block = vec![0u8; 36];
        block[0..4].copy_from_slice(&1.0f32.to_le_bytes());
        block[4..36].fill(0xAA); // nibble 10 → (10 - 8) * 1.0 = 2.0
        let qt = QuantTensor::<CpuRuntime>::from_bytes(&block, &[1, 64], &device).unwrap();

        let result = client.quant_matmul(&act, &qt).unwrap();
        assert_eq!(result.shape(), &[1, 1]);
        assert_eq!(result.dtype(), DType::F32);
        assert_eq!(result.to_vec::<f32>(), vec![128.0]);
    }

    #[test]
    fn test_quant_matmul_matches_dequant_matmul() {
        let (client, device) = cpu_setup();
        let act = det_tensor(&[3, 128], &device);
        let weight = quantize_int4(&det_tensor(&[5, 128], &device)).unwrap();

        let quant = client.quant_matmul(&act, &weight).unwrap();
        let dense = dequantize_int4(&weight).unwrap();
        let dense_t = dense.transpose(-2, -1).unwrap().contiguous().unwrap();
        let reference = client.matmul(&act, &dense_t).unwrap();

        assert_eq!(quant.shape(), &[3, 5]);
        for (a, b) in quant.to_vec::<f32>().iter().zip(reference.to_vec::<f32>()) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn test_half_activation_is_upcast() {
        let (client, device) = cpu_setup();
        let act = det_tensor(&[2, 64], &device);
        let weight = quantize_int4(&det_tensor(&[3, 64], &device)).unwrap();

        let from_f32 = client.quant_matmul(&act, &weight).unwrap();
        let act_f16 = client.cast(&act, DType::F16).unwrap();
        let from_f16 = client.quant_matmul(&act_f16, &weight).unwrap();
        assert_eq!(from_f16.dtype(), DType::F32);
        for (a, b) in from_f32.to_vec::<f32>().iter().zip(from_f16.to_vec::<f32>()) {
            assert!((a - b).abs() < 1e-2, "{a} vs {b}");
        }
    }

    #[test]
    fn test_rejects_integer_activation() {
        let (client, device) = cpu_setup();
        let act = Tensor::<CpuRuntime>::zeros(&[1, 64], DType::U8, &device).unwrap();
        let weight = quantize_int4(&det_tensor(&[1, 64], &device)).unwrap();
        assert!(matches!(
            client.quant_matmul(&act, &weight),
            Err(Error::DTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_dimension_mismatch() {
        let (client, device) = cpu_setup();
        let act = det_tensor(&[2, 128], &device);
        let weight = quantize_int4(&det_tensor(&[3, 64], &device)).unwrap();
        assert!(matches!(
            client.quant_matmul(&act, &weight),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_non_2d() {
        let (client, device) = cpu_setup();
        let act = det_tensor(&[2, 2, 64], &device);
        let weight = quantize_int4(&det_tensor(&[3, 64], &device)).unwrap();
        assert!(client.quant_matmul(&act, &weight).is_err());

        let weight_1d = quantize_int4(&det_tensor(&[64], &device)).unwrap();
        let act = det_tensor(&[1, 64], &device);
        assert!(client.quant_matmul(&act, &weight_1d).is_err());
    }

    #[test]
    fn test_quant_matmul_batch() {
        let (client, device) = cpu_setup();
        let act = det_tensor(&[2, 64], &device);
        let wq = quantize_int4(&det_tensor(&[4, 64], &device)).unwrap();
        let wk = quantize_int4(&det_tensor(&[2, 64], &device)).unwrap();

        let outs = client.quant_matmul_batch(&act, &[&wq, &wk]).unwrap();
        assert_eq!(outs.len(), 2);
        assert_eq!(outs[0].shape(), &[2, 4]);
        assert_eq!(outs[1].shape(), &[2, 2]);
    }
}
