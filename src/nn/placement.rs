//! Placement requests: optional target device and optional target dtype

use crate::error::{Error, Result};
use crate::is_float;
use numr::dtype::DType;
use numr::ops::TypeConversionOps;
use numr::runtime::{Device, Runtime};
use numr::tensor::Tensor;

/// A request to move and/or cast a parameter.
///
/// `None` fields leave that aspect unchanged.
pub struct Placement<R: Runtime> {
    pub device: Option<R::Device>,
    pub dtype: Option<DType>,
}

impl<R: Runtime> Clone for Placement<R> {
    fn clone(&self) -> Self {
        Self {
            device: self.device.clone(),
            dtype: self.dtype,
        }
    }
}

impl<R: Runtime> Placement<R> {
    pub fn new(device: Option<R::Device>, dtype: Option<DType>) -> Self {
        Self { device, dtype }
    }

    /// Device-only request.
    pub fn device(device: R::Device) -> Self {
        Self::new(Some(device), None)
    }

    /// Dtype-only request.
    pub fn dtype(dtype: DType) -> Self {
        Self::new(None, Some(dtype))
    }

    /// Both fields unset.
    pub fn is_noop(&self) -> bool {
        self.device.is_none() && self.dtype.is_none()
    }

    /// Whether the request names `device`.
    pub fn targets(&self, device: &R::Device) -> bool {
        self.device
            .as_ref()
            .is_some_and(|d| same_device::<R>(d, device))
    }
}

pub(crate) fn same_device<R: Runtime>(a: &R::Device, b: &R::Device) -> bool {
    a.id() == b.id()
}

/// Conventional copy/cast of a dense tensor.
///
/// A dtype change runs through the client; a device change copies the bytes
/// unchanged onto the target device.
pub(crate) fn place_tensor<R, C>(
    client: &C,
    tensor: &Tensor<R>,
    placement: &Placement<R>,
) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: TypeConversionOps<R>,
{
    let mut out = tensor.clone();
    match placement.dtype {
        Some(dtype) if dtype != out.dtype() => {
            if !is_float(dtype) || !is_float(out.dtype()) {
                return Err(Error::InvalidArgument {
                    arg: "dtype",
                    reason: format!("cannot cast {:?} data to {:?}", out.dtype(), dtype),
                });
            }
            out = client.cast(&out, dtype)?;
        }
        _ => {}
    }
    match &placement.device {
        Some(device) if !same_device::<R>(device, out.device()) => {
            let bytes = out.contiguous()?.to_bytes()?;
            out = Tensor::<R>::from_bytes(&bytes, out.shape(), out.dtype(), device)?;
        }
        _ => {}
    }
    Ok(out)
}
