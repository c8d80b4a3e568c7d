//! # qlinear
//!
//! **4-bit block-quantized linear layers with lazy, one-way weight packing.**
//!
//! A [`QuantizedLinear`] is built and loaded like a dense layer. The first
//! forward pass (or a placement onto the device its weight already lives on)
//! packs the weight into int4 blocks and drops the dense copy; every later
//! forward runs a quantized matmul directly against the packed blocks.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ nn      QuantizedLinear · Linear · VarMap · convert       │
//! ├──────────────────────────────────────────────────────────┤
//! │ quant   QuantTensor · QuantizeOps · QuantMatmulOps        │
//! │         └─ ffi ─▶ C-ABI kernels (encode, mul_mat)         │
//! ├──────────────────────────────────────────────────────────┤
//! │ numr                                                     │
//! │        (tensors, dense ops, runtime, autograd Var)       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design
//!
//! - **QuantTensor**: packed blocks are a separate type, never a dtype
//! - **QuantizedParameter**: tagged union over dense/packed, transitions once
//! - **Extension traits**: `QuantizeOps`, `QuantMatmulOps` on numr's `CpuClient`
//! - **Kernels**: exposed with a C ABI and reached through one FFI boundary

pub mod error;
pub mod format;
pub mod nn;
pub mod quant;

pub use error::{Error, Result};
pub use nn::{
    ConvertConfig, Linear, LinearLayer, Module, Placement, QuantizedLinear, QuantizedParameter,
    VarMap, convert_linears,
};
pub use quant::{QuantMatmulOps, QuantTensor, QuantizeOps, dequantize_int4, quantize_int4};

// Re-export numr types that users will commonly need
pub use numr::dtype::DType;
pub use numr::error::{Error as NumrError, Result as NumrResult};
pub use numr::runtime::{Runtime, RuntimeClient};
pub use numr::tensor::Tensor;

/// Float dtypes the layers accept for dense data and activations.
pub(crate) fn is_float(dtype: DType) -> bool {
    matches!(dtype, DType::F32 | DType::F16 | DType::BF16 | DType::F64)
}
