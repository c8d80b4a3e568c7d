//! Module trait: parameter inventory and placement.

use crate::error::Result;
use crate::nn::linear::{Linear, LinearLayer, QuantizedLinear};
use crate::nn::placement::{Placement, place_tensor};
use crate::quant::QuantizeOps;
use numr::autograd::Var;
use numr::dtype::DType;
use numr::ops::TypeConversionOps;
use numr::runtime::Runtime;

/// Core trait for layers.
///
/// Forward passes stay as inherent methods on each layer because
/// signatures differ (different client bounds, `&self` vs `&mut self`).
pub trait Module<R: Runtime> {
    /// Named logical parameter shapes. Names use dot notation for nested
    /// modules: `"layers.0.attn.weight"`. Packed weights report the dense
    /// shape they were produced from.
    fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)>;

    /// Total number of scalar parameters.
    fn num_parameters(&self) -> usize {
        self.parameter_shapes()
            .iter()
            .map(|(_, shape)| shape.iter().product::<usize>())
            .sum()
    }

    /// Apply a placement request to every parameter.
    ///
    /// For quantized layers this is also the hook that packs weights: a
    /// request for the device they already live on quantizes them.
    fn place<C>(&mut self, client: &C, placement: &Placement<R>) -> Result<()>
    where
        C: QuantizeOps<R> + TypeConversionOps<R>;
}

fn place_var<R, C>(client: &C, var: &mut Var<R>, placement: &Placement<R>) -> Result<()>
where
    R: Runtime<DType = DType>,
    C: TypeConversionOps<R>,
{
    *var = Var::new(
        place_tensor(client, var.tensor(), placement)?,
        var.requires_grad(),
    );
    Ok(())
}

impl<R: Runtime<DType = DType>> Module<R> for Linear<R> {
    fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let mut shapes = vec![("weight".to_string(), self.weight().tensor().shape().to_vec())];
        if let Some(b) = self.bias() {
            shapes.push(("bias".to_string(), b.tensor().shape().to_vec()));
        }
        shapes
    }

    fn place<C>(&mut self, client: &C, placement: &Placement<R>) -> Result<()>
    where
        C: QuantizeOps<R> + TypeConversionOps<R>,
    {
        place_var(client, self.weight_mut(), placement)?;
        if let Some(b) = self.bias_mut() {
            place_var(client, b, placement)?;
        }
        Ok(())
    }
}

impl<R: Runtime<DType = DType>> Module<R> for QuantizedLinear<R> {
    fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let mut shapes = vec![("weight".to_string(), self.weight_shape().to_vec())];
        if let Some(b) = self.bias() {
            shapes.push(("bias".to_string(), b.tensor().shape().to_vec()));
        }
        shapes
    }

    fn place<C>(&mut self, client: &C, placement: &Placement<R>) -> Result<()>
    where
        C: QuantizeOps<R> + TypeConversionOps<R>,
    {
        self.weight_mut().to(client, placement)?;
        if let Some(b) = self.bias_mut() {
            place_var(client, b, placement)?;
        }
        Ok(())
    }
}

impl<R: Runtime<DType = DType>> Module<R> for LinearLayer<R> {
    fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        match self {
            Self::Dense(l) => l.parameter_shapes(),
            Self::Quantized(l) => l.parameter_shapes(),
        }
    }

    fn place<C>(&mut self, client: &C, placement: &Placement<R>) -> Result<()>
    where
        C: QuantizeOps<R> + TypeConversionOps<R>,
    {
        match self {
            Self::Dense(l) => l.place(client, placement),
            Self::Quantized(l) => l.place(client, placement),
        }
    }
}
