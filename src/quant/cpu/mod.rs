pub mod kernels;
mod quant_matmul;
mod quantize;
