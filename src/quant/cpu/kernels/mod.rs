pub mod int4_block;
pub mod quant_matmul;

pub use int4_block::{dequant_int4, dot_int4_row, int4_quantize_f32, quantize_row_int4};
pub use quant_matmul::{int4_mul_mat_f32, quant_matmul_int4};
