//! Linear and quantized linear layers

use crate::error::{Error, Result};
use crate::is_float;
use crate::nn::parameter::QuantizedParameter;
use crate::nn::varmap::Init;
use crate::quant::{QuantMatmulOps, QuantizeOps};
use numr::autograd::Var;
use numr::dtype::DType;
use numr::ops::{BinaryOps, MatmulOps, TypeConversionOps};
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use rand::Rng;

/// Split `input` into `(leading dims, rows)` after checking the last dim.
fn flatten_input<R: Runtime<DType = DType>>(
    input: &Tensor<R>,
    in_features: usize,
) -> Result<(Vec<usize>, Tensor<R>)> {
    let shape = input.shape();
    let Some((&k, leading)) = shape.split_last() else {
        return Err(Error::InvalidArgument {
            arg: "input",
            reason: "linear input must have at least one dimension".into(),
        });
    };
    if k != in_features {
        let mut expected = leading.to_vec();
        expected.push(in_features);
        return Err(Error::ShapeMismatch {
            expected,
            got: shape.to_vec(),
        });
    }
    if !is_float(input.dtype()) {
        return Err(Error::InvalidArgument {
            arg: "input",
            reason: format!(
                "linear input must be floating point, got {:?}",
                input.dtype()
            ),
        });
    }
    let rows: usize = leading.iter().product();
    Ok((leading.to_vec(), input.contiguous()?.reshape(&[rows, k])?))
}

fn out_shape(leading: &[usize], out_features: usize) -> Vec<usize> {
    let mut shape = leading.to_vec();
    shape.push(out_features);
    shape
}

fn cast_to<R, C>(client: &C, tensor: Tensor<R>, dtype: DType) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: TypeConversionOps<R>,
{
    if tensor.dtype() == dtype {
        Ok(tensor)
    } else {
        Ok(client.cast(&tensor, dtype)?)
    }
}

fn check_bias<R: Runtime<DType = DType>>(
    bias: Option<&Tensor<R>>,
    out_features: usize,
) -> Result<()> {
    match bias {
        Some(b) if b.shape() != [out_features] => Err(Error::ShapeMismatch {
            expected: vec![out_features],
            got: b.shape().to_vec(),
        }),
        _ => Ok(()),
    }
}

pub(crate) fn weight_dims(shape: &[usize]) -> Result<(usize, usize)> {
    match *shape {
        [out_features, in_features] => Ok((out_features, in_features)),
        _ => Err(Error::InvalidArgument {
            arg: "weight",
            reason: format!("linear weight must be 2-D, got {shape:?}"),
        }),
    }
}

/// Check a loaded weight/bias pair without taking ownership.
pub(crate) fn validate_parts<R: Runtime<DType = DType>>(
    weight: &Tensor<R>,
    bias: Option<&Tensor<R>>,
) -> Result<(usize, usize)> {
    let (out_features, in_features) = weight_dims(weight.shape())?;
    check_bias(bias, out_features)?;
    Ok((out_features, in_features))
}

/// Dense linear layer: output = input @ weight^T + bias
///
/// Uses `Var<R>` for parameters; the forward pass runs on raw tensors.
pub struct Linear<R: Runtime> {
    weight: Var<R>,
    bias: Option<Var<R>>,
}

impl<R: Runtime<DType = DType>> Linear<R> {
    /// Create from loaded tensors. `trainable` controls gradient tracking.
    ///
    /// `weight` is `[out_features, in_features]`, `bias` is `[out_features]`.
    pub fn new(weight: Tensor<R>, bias: Option<Tensor<R>>, trainable: bool) -> Result<Self> {
        validate_parts(&weight, bias.as_ref())?;
        Ok(Self {
            weight: Var::new(weight, trainable),
            bias: bias.map(|b| Var::new(b, trainable)),
        })
    }

    /// Freshly initialized f32 layer on `device`.
    pub fn init<G: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        has_bias: bool,
        device: &R::Device,
        rng: &mut G,
    ) -> Result<Self> {
        let (weight, bias) = init_tensors(in_features, out_features, has_bias, device, rng)?;
        Ok(Self {
            weight: Var::new(weight, true),
            bias: bias.map(|b| Var::new(b, true)),
        })
    }

    pub fn in_features(&self) -> usize {
        self.weight.tensor().shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.tensor().shape()[0]
    }

    /// Forward: input @ weight^T + bias
    ///
    /// input: `[..., in_features]`, output: `[..., out_features]` in the
    /// input's dtype.
    pub fn forward<C>(&self, client: &C, input: &Tensor<R>) -> Result<Tensor<R>>
    where
        C: MatmulOps<R> + BinaryOps<R> + TypeConversionOps<R>,
    {
        let dtype = input.dtype();
        let (leading, x) = flatten_input(input, self.in_features())?;
        let weight = self.weight.tensor();
        let x = cast_to(client, x, weight.dtype())?;
        let w_t = weight.transpose(-2, -1)?.contiguous()?;
        let mut out = client
            .matmul(&x, &w_t)?
            .reshape(&out_shape(&leading, self.out_features()))?;
        if let Some(bias) = &self.bias {
            let bias = cast_to(client, bias.tensor().clone(), out.dtype())?;
            out = client.add(&out, &bias)?;
        }
        cast_to(client, out, dtype)
    }

    pub fn weight(&self) -> &Var<R> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Var<R>> {
        self.bias.as_ref()
    }

    pub(crate) fn weight_mut(&mut self) -> &mut Var<R> {
        &mut self.weight
    }

    pub(crate) fn bias_mut(&mut self) -> Option<&mut Var<R>> {
        self.bias.as_mut()
    }

    pub fn into_parts(self) -> (Var<R>, Option<Var<R>>) {
        (self.weight, self.bias)
    }
}

fn init_tensors<R, G>(
    in_features: usize,
    out_features: usize,
    has_bias: bool,
    device: &R::Device,
    rng: &mut G,
) -> Result<(Tensor<R>, Option<Tensor<R>>)>
where
    R: Runtime<DType = DType>,
    G: Rng + ?Sized,
{
    let weight = Init::PyTorchLinear.tensor(&[out_features, in_features], device, rng)?;
    let bias = if has_bias {
        let bound = if in_features == 0 {
            0.0
        } else {
            1.0 / (in_features as f32).sqrt()
        };
        Some(Init::Uniform(bound).tensor(&[out_features], device, rng)?)
    } else {
        None
    };
    Ok((weight, bias))
}

/// Linear layer whose weight is packed to int4 blocks on first use
///
/// The weight starts dense and is quantized by the first `forward` or by a
/// same-device placement. After that the dense copy is gone and the layer is
/// inference-only. The bias always stays dense and follows the activation
/// dtype.
pub struct QuantizedLinear<R: Runtime> {
    in_features: usize,
    out_features: usize,
    weight: QuantizedParameter<R>,
    bias: Option<Var<R>>,
}

impl<R: Runtime<DType = DType>> QuantizedLinear<R> {
    /// Freshly initialized layer on `device` using the thread-local RNG.
    ///
    /// Alignment is not checked here: a layer whose `in_features` is not a
    /// multiple of 64 fails on its first forward or placement.
    pub fn new(
        in_features: usize,
        out_features: usize,
        has_bias: bool,
        device: &R::Device,
    ) -> Result<Self> {
        Self::new_with_rng(
            in_features,
            out_features,
            has_bias,
            device,
            &mut rand::thread_rng(),
        )
    }

    pub fn new_with_rng<G: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        has_bias: bool,
        device: &R::Device,
        rng: &mut G,
    ) -> Result<Self> {
        let (weight, bias) = init_tensors(in_features, out_features, has_bias, device, rng)?;
        Ok(Self {
            in_features,
            out_features,
            weight: QuantizedParameter::new(weight, false),
            bias: bias.map(|b| Var::new(b, true)),
        })
    }

    /// Wrap loaded dense tensors; `weight` is `[out_features, in_features]`.
    pub fn from_tensors(weight: Tensor<R>, bias: Option<Tensor<R>>) -> Result<Self> {
        let (out_features, in_features) = validate_parts(&weight, bias.as_ref())?;
        Ok(Self {
            in_features,
            out_features,
            weight: QuantizedParameter::new(weight, false),
            bias: bias.map(|b| Var::new(b, true)),
        })
    }

    /// Take over a dense layer's weight and bias without copying.
    pub fn from_linear(linear: Linear<R>) -> Self {
        let (in_features, out_features) = (linear.in_features(), linear.out_features());
        let (weight, bias) = linear.into_parts();
        Self {
            in_features,
            out_features,
            weight: QuantizedParameter::new(weight.tensor().clone(), false),
            bias,
        }
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// `[out_features, in_features]`
    pub fn weight_shape(&self) -> [usize; 2] {
        [self.out_features, self.in_features]
    }

    pub fn weight(&self) -> &QuantizedParameter<R> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Var<R>> {
        self.bias.as_ref()
    }

    pub(crate) fn weight_mut(&mut self) -> &mut QuantizedParameter<R> {
        &mut self.weight
    }

    pub(crate) fn bias_mut(&mut self) -> Option<&mut Var<R>> {
        self.bias.as_mut()
    }

    /// Forward: quant_matmul(input, weight) + bias
    ///
    /// input: `[..., in_features]` in any float dtype, output:
    /// `[..., out_features]` in the same dtype. Packs the weight on the first
    /// call; a bias whose dtype differs from the input is recast in place.
    ///
    /// # Errors
    ///
    /// - `ShapeMismatch` if the last input dim is not `in_features`
    /// - `InvalidInput` if the weight cannot be packed
    pub fn forward<C>(&mut self, client: &C, input: &Tensor<R>) -> Result<Tensor<R>>
    where
        C: QuantizeOps<R> + QuantMatmulOps<R> + BinaryOps<R> + TypeConversionOps<R>,
    {
        let dtype = input.dtype();
        let (leading, x) = flatten_input(input, self.in_features)?;
        if let Some(bias) = self.bias.as_mut().filter(|b| b.tensor().dtype() != dtype) {
            *bias = Var::new(client.cast(bias.tensor(), dtype)?, bias.requires_grad());
        }
        let weight = self.weight.ensure_quantized(client)?;
        let out = client
            .quant_matmul(&x, weight)?
            .reshape(&out_shape(&leading, self.out_features))?;
        let out = cast_to(client, out, dtype)?;
        match &self.bias {
            Some(bias) => Ok(client.add(&out, bias.tensor())?),
            None => Ok(out),
        }
    }
}

/// A linear layer produced by checkpoint conversion
pub enum LinearLayer<R: Runtime> {
    /// Left in floating point
    Dense(Linear<R>),
    /// Packed to int4 on first use
    Quantized(QuantizedLinear<R>),
}

impl<R: Runtime<DType = DType>> LinearLayer<R> {
    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Quantized(_))
    }

    pub fn in_features(&self) -> usize {
        match self {
            Self::Dense(l) => l.in_features(),
            Self::Quantized(l) => l.in_features(),
        }
    }

    pub fn out_features(&self) -> usize {
        match self {
            Self::Dense(l) => l.out_features(),
            Self::Quantized(l) => l.out_features(),
        }
    }

    pub fn forward<C>(&mut self, client: &C, input: &Tensor<R>) -> Result<Tensor<R>>
    where
        C: MatmulOps<R>
            + QuantizeOps<R>
            + QuantMatmulOps<R>
            + BinaryOps<R>
            + TypeConversionOps<R>,
    {
        match self {
            Self::Dense(l) => l.forward(client, input),
            Self::Quantized(l) => l.forward(client, input),
        }
    }
}
