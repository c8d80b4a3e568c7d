//! Lazily quantized layer parameter
//!
//! `QuantizedParameter` is a small state machine over [`Weight`]:
//!
//! ```text
//! Standard(tensor) ──ensure_quantized()──▶ Quantized(blocks, logical shape)
//! ```
//!
//! The transition happens at most once and is never reversed. It is
//! triggered either explicitly through `ensure_quantized` (the layer's
//! forward path does this) or by a placement request that names the device
//! the data already lives on without asking for a different dtype. Every
//! other placement is a conventional copy/cast that keeps the current state.
//!
//! Not thread-safe during the first transition: serialize the first forward
//! (or call `ensure_quantized` up front) before sharing a layer across threads.

use crate::error::{Error, Result};
use crate::is_float;
use crate::nn::placement::{Placement, place_tensor};
use crate::nn::weight::Weight;
use crate::quant::{QuantTensor, QuantizeOps};
use numr::dtype::DType;
use numr::ops::TypeConversionOps;
use numr::runtime::{Device, Runtime};
use numr::tensor::Tensor;
use tracing::debug;

/// Weight container that converts itself to int4 blocks on first qualifying use
pub struct QuantizedParameter<R: Runtime> {
    data: Weight<R>,
    requires_grad: bool,
}

impl<R: Runtime<DType = DType>> QuantizedParameter<R> {
    /// Wrap dense data; nothing is packed until the first qualifying use.
    pub fn new(data: Tensor<R>, requires_grad: bool) -> Self {
        Self {
            data: Weight::Standard(data),
            requires_grad,
        }
    }

    /// Current representation
    pub fn data(&self) -> &Weight<R> {
        &self.data
    }

    pub fn is_quantized(&self) -> bool {
        self.data.is_quantized()
    }

    /// Dense shape the packed blocks were produced from; `None` until quantized.
    pub fn logical_shape(&self) -> Option<&[usize]> {
        match &self.data {
            Weight::Quantized(q) => Some(q.shape()),
            Weight::Standard(_) => None,
        }
    }

    /// Packed blocks, if quantized.
    pub fn packed(&self) -> Option<&QuantTensor<R>> {
        self.data.as_quant_tensor().ok()
    }

    /// Always false once quantized.
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Packed blocks are not differentiable, so enabling gradients on a
    /// quantized parameter is rejected.
    pub fn set_requires_grad(&mut self, requires_grad: bool) -> Result<()> {
        if requires_grad && self.is_quantized() {
            return Err(Error::InvalidArgument {
                arg: "requires_grad",
                reason: "packed int4 weights are not differentiable".into(),
            });
        }
        self.requires_grad = requires_grad;
        Ok(())
    }

    pub fn device(&self) -> &R::Device {
        self.data.device()
    }

    /// Float dtype while dense, `U8` once packed.
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// Pack the dense data if that has not happened yet.
    ///
    /// Non-f32 float data is upcast to f32 before packing. The dense buffer is
    /// dropped after the transition. Calling again is a no-op returning the
    /// same blocks.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if the element count or the last dimension is not a
    /// multiple of 64, or the data is not floating point.
    pub fn ensure_quantized<C>(&mut self, client: &C) -> Result<&QuantTensor<R>>
    where
        C: QuantizeOps<R> + TypeConversionOps<R>,
    {
        if let Weight::Standard(dense) = &self.data {
            let packed = pack_dense(client, dense)?;
            debug!(
                shape = ?packed.shape(),
                bytes = packed.storage_bytes(),
                device = ?packed.device().id(),
                "quantized parameter to int4 blocks"
            );
            self.data = Weight::Quantized(packed);
            self.requires_grad = false;
        }
        self.data.as_quant_tensor()
    }

    /// Apply a placement request.
    ///
    /// Same device and no dtype change: one-way quantization (no-op if already
    /// packed). Otherwise: dense data is copied/cast conventionally; packed
    /// data is copied byte-for-byte on a device change and a dtype request is
    /// ignored, since the blocks are never reinterpreted as floats.
    pub fn to<C>(&mut self, client: &C, placement: &Placement<R>) -> Result<()>
    where
        C: QuantizeOps<R> + TypeConversionOps<R>,
    {
        let same_device = placement.targets(self.device());
        let keeps_dtype = placement.dtype.is_none_or(|dt| dt == self.dtype());
        if same_device && keeps_dtype {
            self.ensure_quantized(client)?;
            return Ok(());
        }

        self.data = match &self.data {
            Weight::Standard(dense) => Weight::Standard(place_tensor(client, dense, placement)?),
            Weight::Quantized(packed) => {
                if let Some(dtype) = placement.dtype {
                    debug!(?dtype, "ignoring dtype cast on packed parameter");
                }
                match &placement.device {
                    Some(device) if !placement.targets(packed.device()) => {
                        Weight::Quantized(packed.to_device(device)?)
                    }
                    _ => Weight::Quantized(packed.clone()),
                }
            }
        };
        Ok(())
    }
}

fn pack_dense<R, C>(client: &C, dense: &Tensor<R>) -> Result<QuantTensor<R>>
where
    R: Runtime<DType = DType>,
    C: QuantizeOps<R> + TypeConversionOps<R>,
{
    let dense = match dense.dtype() {
        DType::F32 => dense.clone(),
        dt if is_float(dt) => client.cast(dense, DType::F32)?,
        other => {
            return Err(Error::invalid_input(format!(
                "cannot quantize {other:?} data"
            )));
        }
    };
    client.quantize_int4(&dense)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{cpu_setup, det_tensor};
    use numr::runtime::cpu::CpuRuntime;

    #[test]
    fn test_starts_dense() {
        let (_, device) = cpu_setup();
        let p = QuantizedParameter::new(det_tensor(&[2, 64], &device), true);
        assert!(!p.is_quantized());
        assert!(p.logical_shape().is_none());
        assert!(p.packed().is_none());
        assert!(p.requires_grad());
        assert_eq!(p.dtype(), DType::F32);
    }

    #[test]
    fn test_ensure_quantized_transitions_once() {
        let (client, device) = cpu_setup();
        let mut p = QuantizedParameter::new(det_tensor(&[4, 128], &device), true);
        let first = p.ensure_quantized(&client).unwrap().as_bytes().unwrap();
        assert!(p.is_quantized());
        assert!(!p.requires_grad());
        assert_eq!(p.logical_shape(), Some(&[4, 128][..]));
        assert_eq!(p.dtype(), DType::U8);

        let ptr = p.packed().unwrap().storage().ptr();
        let second = p.ensure_quantized(&client).unwrap();
        assert_eq!(second.storage().ptr(), ptr);
        assert_eq!(second.as_bytes().unwrap(), first);
    }

    #[test]
    fn test_same_device_placement_quantizes() {
        let (client, device) = cpu_setup();
        let mut p = QuantizedParameter::new(det_tensor(&[1, 64], &device), false);
        p.to(&client, &Placement::device(device.clone())).unwrap();
        assert!(p.is_quantized());
    }

    #[test]
    fn test_empty_placement_leaves_dense() {
        let (client, device) = cpu_setup();
        let mut p = QuantizedParameter::<CpuRuntime>::new(det_tensor(&[1, 64], &device), false);
        p.to(&client, &Placement::new(None, None)).unwrap();
        assert!(!p.is_quantized());
        assert_eq!(p.dtype(), DType::F32);
    }

    #[test]
    fn test_dtype_cast_while_dense_casts() {
        let (client, device) = cpu_setup();
        let mut p = QuantizedParameter::new(det_tensor(&[1, 64], &device), false);
        p.to(&client, &Placement::new(Some(device.clone()), Some(DType::F16)))
            .unwrap();
        assert!(!p.is_quantized());
        assert_eq!(p.dtype(), DType::F16);

        // f16 dense data is upcast before packing
        p.ensure_quantized(&client).unwrap();
        assert_eq!(p.logical_shape(), Some(&[1, 64][..]));
    }

    #[test]
    fn test_dtype_cast_after_quantized_keeps_blocks() {
        let (client, device) = cpu_setup();
        let mut p = QuantizedParameter::new(det_tensor(&[2, 64], &device), false);
        let bytes = p.ensure_quantized(&client).unwrap().as_bytes().unwrap();

        p.to(&client, &Placement::dtype(DType::F16)).unwrap();
        assert!(p.is_quantized());
        assert_eq!(p.dtype(), DType::U8);
        assert_eq!(p.logical_shape(), Some(&[2, 64][..]));
        assert_eq!(p.packed().unwrap().as_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_same_device_placement_after_quantized_is_noop() {
        let (client, device) = cpu_setup();
        let mut p = QuantizedParameter::new(det_tensor(&[2, 64], &device), false);
        p.ensure_quantized(&client).unwrap();
        let ptr = p.packed().unwrap().storage().ptr();
        p.to(&client, &Placement::device(device.clone())).unwrap();
        assert!(p.is_quantized());
        assert_eq!(p.packed().unwrap().storage().ptr(), ptr);
        assert_eq!(p.data().storage_bytes(), 2 * 36);
    }

    #[test]
    fn test_misaligned_data_fails_and_stays_dense() {
        let (client, device) = cpu_setup();
        let mut p = QuantizedParameter::new(det_tensor(&[2, 48], &device), true);
        assert!(matches!(
            p.ensure_quantized(&client),
            Err(Error::InvalidInput { .. })
        ));
        assert!(!p.is_quantized());
        assert!(p.requires_grad());
    }

    #[test]
    fn test_integer_data_rejected() {
        let (client, device) = cpu_setup();
        let dense = Tensor::<CpuRuntime>::zeros(&[1, 64], DType::U8, &device).unwrap();
        let mut p = QuantizedParameter::new(dense, false);
        assert!(matches!(
            p.ensure_quantized(&client),
            Err(Error::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_requires_grad_rejected_when_packed() {
        let (client, device) = cpu_setup();
        let mut p = QuantizedParameter::new(det_tensor(&[1, 64], &device), false);
        p.ensure_quantized(&client).unwrap();
        assert!(p.set_requires_grad(true).is_err());
        assert!(p.set_requires_grad(false).is_ok());
    }
}
