//! Block quantizer: dense f32 tensor → packed int4 blocks
//!
//! The encoding itself is delegated to the fixed-ABI kernel behind
//! [`super::ffi`]; this module owns the caller-side contract (dtype and shape
//! checks, output ownership). Inputs are never mutated.

use crate::error::{Error, Result};
use crate::quant::cpu::kernels::dequant_int4;
use crate::quant::format::{self, HIST_BINS};
use crate::quant::{QuantTensor, ffi};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::runtime::cpu::CpuRuntime;
use numr::tensor::Tensor;

/// Pack a dense f32 host tensor into int4 blocks.
///
/// # Errors
///
/// `InvalidInput` if `src` is not F32 (no implicit upcast), or if its
/// element count or last dimension is not a multiple of 64.
pub fn quantize_int4(src: &Tensor<CpuRuntime>) -> Result<QuantTensor<CpuRuntime>> {
    quantize_int4_with_histogram(src).map(|(packed, _)| packed)
}

/// [`quantize_int4`], also returning the 16-bin histogram of stored nibbles.
pub fn quantize_int4_with_histogram(
    src: &Tensor<CpuRuntime>,
) -> Result<(QuantTensor<CpuRuntime>, [i64; HIST_BINS])> {
    if src.dtype() != DType::F32 {
        return Err(Error::invalid_input(format!(
            "input tensor must be f32, got {:?}",
            src.dtype()
        )));
    }
    format::validate_shape(src.shape())?;

    let (bytes, hist) = ffi::quantize(src)?;
    let packed = QuantTensor::from_bytes(&bytes, src.shape(), src.device())?;
    Ok((packed, hist))
}

/// Decode packed blocks back to a dense f32 tensor on the same device.
///
/// For verification and export; the quantized matmul never calls this.
pub fn dequantize_int4<R: Runtime<DType = DType>>(packed: &QuantTensor<R>) -> Result<Tensor<R>> {
    let mut out = vec![0.0f32; packed.numel()];
    dequant_int4(&packed.as_bytes()?, &mut out);
    Ok(Tensor::<R>::from_slice(&out, packed.shape(), packed.device())?)
}
