//! Raw-pointer boundary to the int4 kernels
//!
//! The block encoder and the quantized matmul are fixed-ABI routines taking
//! bare pointers and extents. This module is the only place that turns
//! tensors into addresses. Any tensor may be a non-owning view into larger
//! storage, so the address handed over is the storage base plus the view's
//! byte offset, never the base alone.

use crate::error::{Error, Result};
use crate::quant::cpu::kernels::{int4_mul_mat_f32, int4_quantize_f32};
use crate::quant::format::{self, HIST_BINS};
use crate::quant::tensor::QuantTensor;
use numr::dtype::DType;
use numr::runtime::cpu::CpuRuntime;
use numr::tensor::Tensor;
use std::ffi::c_void;

/// Byte offset of a view's first element from its storage base.
fn view_offset(tensor: &Tensor<CpuRuntime>) -> u64 {
    tensor.ptr() - tensor.storage().ptr()
}

/// Address of the first element of a tensor view.
fn view_ptr(tensor: &Tensor<CpuRuntime>) -> *const c_void {
    (tensor.storage().ptr() + view_offset(tensor)) as usize as *const c_void
}

fn extent(v: usize) -> Result<i64> {
    i64::try_from(v).map_err(|_| Error::invalid_input(format!("extent {v} overflows i64")))
}

/// Encode a validated f32 tensor; returns the packed bytes and nibble histogram.
///
/// The caller guarantees dtype F32 and a packable shape.
pub(crate) fn quantize(src: &Tensor<CpuRuntime>) -> Result<(Vec<u8>, [i64; HIST_BINS])> {
    debug_assert_eq!(src.dtype(), DType::F32);
    let src = src.contiguous()?;
    let n = src.numel();
    let k = src.shape().last().copied().unwrap_or(0);

    let mut dst = vec![0u8; format::storage_bytes(n)?];
    let mut hist = [0i64; HIST_BINS];
    // SAFETY: `src` is a contiguous F32 view of `n` elements, `dst` holds
    // exactly (n / 64) * 36 bytes and `hist` has 16 slots; n and k were
    // validated.
    let written = unsafe {
        int4_quantize_f32(
            view_ptr(&src).cast(),
            dst.as_mut_ptr().cast(),
            extent(n)?,
            extent(k)?,
            hist.as_mut_ptr(),
        )
    };
    debug_assert_eq!(written, dst.len());
    Ok((dst, hist))
}

/// `activation [M, K] × weight [N, K]^T → [M, N]` through the kernel.
///
/// The caller guarantees a 2-D weight, a 2-D F32 activation and matching K.
/// The output buffer is allocated here and handed back to the caller.
pub(crate) fn mul_mat(
    weight: &QuantTensor<CpuRuntime>,
    activation: &Tensor<CpuRuntime>,
) -> Result<Tensor<CpuRuntime>> {
    debug_assert_eq!(activation.dtype(), DType::F32);
    let (n, k) = (weight.shape()[0], weight.shape()[1]);
    let m = activation.shape()[0];
    debug_assert_eq!(activation.shape()[1], k);

    let packed = weight.storage().contiguous()?;
    let activation_c = activation.contiguous()?;

    // Extents are passed fastest-varying first.
    let src0_ne = [extent(k)?, extent(n)?];
    let src1_ne = [extent(k)?, extent(m)?];
    let mut result = vec![0.0f32; m * n];

    // SAFETY: weight holds n * (k / 64) * 36 packed bytes, activation holds
    // m * k f32 values, both contiguous, and `result` has room for m * n f32
    // values.
    unsafe {
        int4_mul_mat_f32(
            src0_ne.as_ptr(),
            view_ptr(&packed),
            src1_ne.as_ptr(),
            view_ptr(&activation_c),
            result.as_mut_ptr(),
        );
    }
    Ok(Tensor::<CpuRuntime>::from_slice(
        &result,
        &[m, n],
        activation.device(),
    )?)
}
