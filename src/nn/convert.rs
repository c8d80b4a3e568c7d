//! Swap dense linear weights in a checkpoint for lazily quantized layers

use crate::error::{Error, Result};
use crate::is_float;
use crate::nn::linear::{Linear, LinearLayer, QuantizedLinear, validate_parts};
use crate::nn::module::Module;
use crate::nn::placement::Placement;
use crate::nn::varmap::VarMap;
use crate::quant::{QuantizeOps, format};
use numr::dtype::DType;
use numr::ops::TypeConversionOps;
use numr::runtime::Runtime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Conversion settings
///
/// ```json
/// { "modules_to_not_convert": ["lm_head"], "quantize_on_load": true }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertConfig {
    /// Modules kept dense, matched on the full dotted name or its last segment
    pub modules_to_not_convert: Vec<String>,
    /// Place each layer on the device its weight was loaded to during
    /// conversion, which packs quantized layers immediately.
    pub quantize_on_load: bool,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            modules_to_not_convert: vec!["lm_head".to_string()],
            quantize_on_load: false,
        }
    }
}

impl ConvertConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::ConfigError {
            reason: format!("invalid convert config: {e}"),
        })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::ConfigError {
            reason: format!("reading {}: {e}", path.display()),
        })?;
        Self::from_json_str(&text)
    }

    /// Whether `module` must stay dense.
    pub fn excludes(&self, module: &str) -> bool {
        let last = module.rsplit('.').next().unwrap_or(module);
        self.modules_to_not_convert
            .iter()
            .any(|m| m == module || m == last)
    }
}

/// Build linear layers from every 2-D float `<module>.weight` in `varmap`.
///
/// The matching `<module>.bias`, if present, joins the layer. A module
/// becomes `Quantized` when its weight can be packed (last dim and element
/// count multiples of 64) and it is not excluded; otherwise `Dense`. Consumed
/// tensors are removed from the map; everything else is left in place.
///
/// Every module is validated before anything is removed, so an error leaves
/// `varmap` untouched.
pub fn convert_linears<R, C>(
    client: &C,
    varmap: &mut VarMap<R>,
    config: &ConvertConfig,
) -> Result<BTreeMap<String, LinearLayer<R>>>
where
    R: Runtime<DType = DType>,
    C: QuantizeOps<R> + TypeConversionOps<R>,
{
    let mut modules: Vec<String> = varmap
        .iter()
        .filter(|(_, t)| t.shape().len() == 2 && is_float(t.dtype()))
        .filter_map(|(name, _)| name.strip_suffix(".weight").map(str::to_string))
        .collect();
    modules.sort();

    for module in &modules {
        let weight = varmap.get(&format!("{module}.weight"))?;
        let bias_name = format!("{module}.bias");
        let bias = if varmap.contains(&bias_name) {
            Some(varmap.get(&bias_name)?)
        } else {
            None
        };
        validate_parts(weight, bias).inspect_err(|e| {
            debug!(module = %module, error = %e, "rejecting linear module");
        })?;
    }

    let mut layers = BTreeMap::new();
    let (mut quantized, mut dense) = (0usize, 0usize);
    for module in modules {
        let weight = varmap.take(&format!("{module}.weight"))?;
        let bias_name = format!("{module}.bias");
        let bias = if varmap.contains(&bias_name) {
            Some(varmap.take(&bias_name)?)
        } else {
            None
        };

        let device = weight.device().clone();
        let packable = format::validate_shape(weight.shape()).is_ok();
        let layer = if packable && !config.excludes(&module) {
            quantized += 1;
            LinearLayer::Quantized(QuantizedLinear::from_tensors(weight, bias)?)
        } else {
            debug!(module = %module, shape = ?weight.shape(), packable, "keeping linear dense");
            dense += 1;
            LinearLayer::Dense(Linear::new(weight, bias, false)?)
        };
        layers.insert(module, (layer, device));
    }

    let layers = layers
        .into_iter()
        .map(|(module, (mut layer, device))| {
            if config.quantize_on_load {
                layer.place(client, &Placement::device(device))?;
            }
            Ok((module, layer))
        })
        .collect::<Result<BTreeMap<_, _>>>()?;

    info!(
        quantized,
        dense,
        remaining = varmap.len(),
        quantize_on_load = config.quantize_on_load,
        "converted linear layers"
    );
    Ok(layers)
}
