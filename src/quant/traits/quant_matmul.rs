//! Quantized matmul operations trait

use crate::error::Result;
use crate::quant::QuantTensor;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Mixed-precision matmul: float activation × packed int4 weight
///
/// This is THE hot path in quantized inference. The weight stays packed and
/// is decoded on the fly inside the kernel; a dequantized weight matrix is
/// never materialized.
///
/// # Contract
///
/// - `activation` shape: `[M, K]`, any float dtype (upcast to F32 first)
/// - `weight` shape: `[N, K]` (N output rows, K input cols; blocks packed along K)
/// - Output shape: `[M, N]`, dtype F32
pub trait QuantMatmulOps<R: Runtime> {
    fn quant_matmul(&self, activation: &Tensor<R>, weight: &QuantTensor<R>) -> Result<Tensor<R>>;

    /// Same activation × several packed weights (e.g. fused Q/K/V projections).
    ///
    /// Default implementation just loops.
    fn quant_matmul_batch(
        &self,
        activation: &Tensor<R>,
        weights: &[&QuantTensor<R>],
    ) -> Result<Vec<Tensor<R>>> {
        weights
            .iter()
            .map(|w| self.quant_matmul(activation, w))
            .collect()
    }
}
