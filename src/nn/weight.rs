//! Weight enum: dense tensor or packed int4 blocks

use crate::error::{Error, Result};
use crate::quant::QuantTensor;
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// A weight that is either a standard tensor or a quantized tensor.
///
/// A `QuantizedParameter` starts as `Standard` and moves to `Quantized` once;
/// `Weight` gives type-safe access to whichever representation is current.
pub enum Weight<R: Runtime> {
    /// Standard floating-point tensor
    Standard(Tensor<R>),
    /// Int4 block-quantized tensor
    Quantized(QuantTensor<R>),
}

impl<R: Runtime> Weight<R> {
    /// Returns `true` if this weight is quantized.
    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Quantized(_))
    }

    /// Get as a standard tensor, or error if quantized.
    pub fn as_tensor(&self) -> Result<&Tensor<R>> {
        match self {
            Self::Standard(t) => Ok(t),
            Self::Quantized(_) => Err(Error::ModelError {
                reason: "expected standard tensor, got quantized".into(),
            }),
        }
    }

    /// Get as a quantized tensor, or error if standard.
    pub fn as_quant_tensor(&self) -> Result<&QuantTensor<R>> {
        match self {
            Self::Quantized(q) => Ok(q),
            Self::Standard(_) => Err(Error::ModelError {
                reason: "expected quantized tensor, got standard".into(),
            }),
        }
    }
}

impl<R: Runtime<DType = DType>> Weight<R> {
    /// Logical shape of the weight.
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Standard(t) => t.shape(),
            Self::Quantized(q) => q.shape(),
        }
    }

    /// Storage dtype: the float dtype, or `U8` once packed.
    pub fn dtype(&self) -> DType {
        match self {
            Self::Standard(t) => t.dtype(),
            Self::Quantized(_) => DType::U8,
        }
    }

    pub fn device(&self) -> &R::Device {
        match self {
            Self::Standard(t) => t.device(),
            Self::Quantized(q) => q.device(),
        }
    }

    /// Bytes held by the current representation.
    pub fn storage_bytes(&self) -> usize {
        match self {
            Self::Standard(t) => t.numel() * t.dtype().size_in_bytes(),
            Self::Quantized(q) => q.storage_bytes(),
        }
    }
}
