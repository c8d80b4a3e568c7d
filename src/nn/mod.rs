pub mod convert;
pub mod linear;
pub mod module;
pub mod parameter;
pub mod placement;
pub mod varmap;
pub mod weight;

pub use convert::{ConvertConfig, convert_linears};
pub use linear::{Linear, LinearLayer, QuantizedLinear};
pub use module::Module;
pub use parameter::QuantizedParameter;
pub use placement::Placement;
pub use varmap::{Init, VarMap};
pub use weight::Weight;
