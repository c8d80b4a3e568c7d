//! Quantized tensor: packed int4 blocks plus the logical shape
//!
//! `QuantTensor<R>` is a separate type from `Tensor<R>`, NOT a custom DType.
//! Packed data has block structure (not element structure) and supports only
//! storage, row views, device copies, dequantization and quantized matmul.

use crate::error::{Error, Result};
use crate::quant::format;
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Int4 block-quantized tensor
///
/// The packed bytes live in a `U8` tensor shaped like the logical shape with
/// the last dimension replaced by the packed row width. That tensor may be a
/// view into a larger allocation. `shape` is the LOGICAL element shape of the
/// dense source, not the block shape.
///
/// # Invariants
///
/// - `data` holds exactly `format::storage_bytes(numel)` bytes
/// - The last dimension of `shape` is a multiple of `format::BLOCK_LEN`
/// - Blocks are packed along the last axis (contiguous in memory)
pub struct QuantTensor<R: Runtime> {
    /// Packed block bytes, `[..., row_bytes]`
    data: Tensor<R>,
    /// Logical shape in elements (not blocks)
    shape: Vec<usize>,
}

impl<R: Runtime> Clone for QuantTensor<R> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            shape: self.shape.clone(),
        }
    }
}

/// Shape of the packed byte tensor for a logical shape.
fn packed_shape(shape: &[usize]) -> Result<Vec<usize>> {
    format::validate_shape(shape)?;
    let mut packed = shape.to_vec();
    if let Some(last) = packed.last_mut() {
        *last = format::row_bytes(*last)?;
    }
    Ok(packed)
}

impl<R: Runtime<DType = DType>> QuantTensor<R> {
    /// Create a quantized tensor from raw block data
    ///
    /// `data` must contain exactly `format::storage_bytes(numel)` bytes of
    /// tightly-packed blocks.
    ///
    /// # Errors
    ///
    /// - If `shape` cannot be packed (see `format::validate_shape`)
    /// - If `data` length doesn't match the expected storage bytes
    pub fn from_bytes(data: &[u8], shape: &[usize], device: &R::Device) -> Result<Self> {
        let packed = packed_shape(shape)?;
        let expected_bytes: usize = packed.iter().product();
        if data.len() != expected_bytes {
            return Err(Error::QuantError {
                reason: format!(
                    "expected {} bytes for shape {:?}, got {} bytes",
                    expected_bytes,
                    shape,
                    data.len(),
                ),
            });
        }
        let data = Tensor::<R>::from_bytes(data, &packed, DType::U8, device)?;
        Ok(Self {
            data,
            shape: shape.to_vec(),
        })
    }

    /// Wrap an existing `U8` tensor (possibly a view) of packed blocks.
    pub fn from_storage(data: Tensor<R>, shape: &[usize]) -> Result<Self> {
        if data.dtype() != DType::U8 {
            return Err(Error::DTypeMismatch {
                expected: DType::U8,
                got: data.dtype(),
            });
        }
        let packed = packed_shape(shape)?;
        if data.shape() != packed.as_slice() {
            return Err(Error::ShapeMismatch {
                expected: packed,
                got: data.shape().to_vec(),
            });
        }
        Ok(Self {
            data,
            shape: shape.to_vec(),
        })
    }

    /// Logical shape in elements
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Total number of logical elements
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of blocks
    pub fn num_blocks(&self) -> usize {
        self.numel() / format::BLOCK_LEN
    }

    /// Total storage size in bytes
    pub fn storage_bytes(&self) -> usize {
        self.num_blocks() * format::BLOCK_BYTES
    }

    /// Device where the packed bytes live
    pub fn device(&self) -> &R::Device {
        self.data.device()
    }

    /// Packed byte tensor
    pub fn storage(&self) -> &Tensor<R> {
        &self.data
    }

    /// Copy of the packed bytes of this view
    pub fn as_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.data.contiguous()?.to_bytes()?)
    }

    /// Copy the packed bytes unchanged to `device`.
    pub fn to_device(&self, device: &R::Device) -> Result<Self> {
        Self::from_bytes(&self.as_bytes()?, &self.shape, device)
    }

    /// Non-owning view of rows `start..start + len` of a 2-D packed tensor.
    pub fn narrow_rows(&self, start: usize, len: usize) -> Result<Self> {
        let &[rows, cols] = self.shape.as_slice() else {
            return Err(Error::QuantError {
                reason: format!("narrow_rows needs a 2-D tensor, got {:?}", self.shape),
            });
        };
        match start.checked_add(len) {
            Some(end) if end <= rows => {}
            _ => {
                return Err(Error::InvalidArgument {
                    arg: "len",
                    reason: format!("{len} rows from {start} exceed {rows}"),
                });
            }
        }
        Ok(Self {
            data: self.data.narrow(0, start, len)?,
            shape: vec![len, cols],
        })
    }
}
