//! CPU implementation of QuantizeOps

use crate::error::Result;
use crate::quant::traits::QuantizeOps;
use crate::quant::{QuantTensor, quantize};
use numr::runtime::cpu::{CpuClient, CpuRuntime};
use numr::tensor::Tensor;

impl QuantizeOps<CpuRuntime> for CpuClient {
    fn quantize_int4(&self, src: &Tensor<CpuRuntime>) -> Result<QuantTensor<CpuRuntime>> {
        quantize::quantize_int4(src)
    }
}
