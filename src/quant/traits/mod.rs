pub mod quant_matmul;
pub mod quantize;

pub use quant_matmul::QuantMatmulOps;
pub use quantize::QuantizeOps;
