//! Block quantization operations trait

use crate::error::Result;
use crate::quant::QuantTensor;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Pack dense tensors into int4 blocks on the runtime that owns them
///
/// # Contract
///
/// - `src` dtype: F32 only; other dtypes fail with `InvalidInput`
/// - `src` element count and last dimension: multiples of 64
/// - The result lives on `src`'s device; `src` is not modified
pub trait QuantizeOps<R: Runtime> {
    fn quantize_int4(&self, src: &Tensor<R>) -> Result<QuantTensor<R>>;
}
