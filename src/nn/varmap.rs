//! VarMap: named collection of dense model tensors.

use crate::error::{Error, Result};
use crate::format::safetensors::SafeTensors;
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use rand::Rng;
use std::collections::HashMap;
use std::path::Path;

/// Initialization strategy for new tensors.
#[derive(Debug, Clone, Copy)]
pub enum Init {
    /// All zeros
    Zeros,
    /// All ones
    Ones,
    /// Constant value
    Const(f32),
    /// Uniform random in `[-bound, bound]`; the bound must be finite
    Uniform(f32),
    /// Kaiming uniform (PyTorch Linear default): U(-1/sqrt(in), 1/sqrt(in)),
    /// `in` taken from the last dimension
    PyTorchLinear,
}

impl Init {
    /// Build an f32 tensor of `shape` on `device`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if a `Uniform` bound is NaN or infinite.
    pub fn tensor<R, G>(self, shape: &[usize], device: &R::Device, rng: &mut G) -> Result<Tensor<R>>
    where
        R: Runtime<DType = DType>,
        G: Rng + ?Sized,
    {
        let numel: usize = shape.iter().product();
        let data: Vec<f32> = match self {
            Self::Zeros => vec![0.0; numel],
            Self::Ones => vec![1.0; numel],
            Self::Const(v) => vec![v; numel],
            Self::Uniform(bound) => uniform(numel, bound, rng)?,
            Self::PyTorchLinear => {
                let fan_in = shape.last().copied().unwrap_or(0);
                if fan_in == 0 {
                    vec![0.0; numel]
                } else {
                    uniform(numel, 1.0 / (fan_in as f32).sqrt(), rng)?
                }
            }
        };
        Ok(Tensor::<R>::from_slice(&data, shape, device)?)
    }
}

fn uniform<G: Rng + ?Sized>(numel: usize, bound: f32, rng: &mut G) -> Result<Vec<f32>> {
    if !bound.is_finite() {
        return Err(Error::InvalidArgument {
            arg: "bound",
            reason: format!("uniform bound must be finite, got {bound}"),
        });
    }
    if bound <= 0.0 {
        return Ok(vec![0.0; numel]);
    }
    Ok((0..numel).map(|_| rng.gen_range(-bound..=bound)).collect())
}

/// Named collection of dense model tensors.
///
/// Names use dot notation for nested modules: `"layers.0.attn.q_proj.weight"`.
pub struct VarMap<R: Runtime> {
    data: HashMap<String, Tensor<R>>,
}

impl<R: Runtime> Default for VarMap<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Runtime> VarMap<R> {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
        }
    }

    /// Insert (or overwrite) a tensor.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor<R>) {
        self.data.insert(name.into(), tensor);
    }

    /// Get a tensor by name.
    pub fn get(&self, name: &str) -> Result<&Tensor<R>> {
        self.data.get(name).ok_or_else(|| Error::ModelError {
            reason: format!("weight not found: {name}"),
        })
    }

    /// Remove and return a tensor by name (zero-copy extraction).
    pub fn take(&mut self, name: &str) -> Result<Tensor<R>> {
        self.data.remove(name).ok_or_else(|| Error::ModelError {
            reason: format!("weight not found: {name}"),
        })
    }

    /// All tensor names, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor<R>)> {
        self.data.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.data.contains_key(name)
    }
}

impl<R: Runtime<DType = DType>> VarMap<R> {
    /// Load all tensors from a SafeTensors file, keeping their stored dtype.
    pub fn from_safetensors<P: AsRef<Path>>(path: P, device: &R::Device) -> Result<Self> {
        let mut st = SafeTensors::open(path)?;
        let data = st.load_all(device)?;
        Ok(Self { data })
    }
}

impl<R: Runtime> From<HashMap<String, Tensor<R>>> for VarMap<R> {
    fn from(data: HashMap<String, Tensor<R>>) -> Self {
        Self { data }
    }
}
