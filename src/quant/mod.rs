pub mod cpu;
pub(crate) mod ffi;
pub mod format;
pub mod quantize;
pub mod tensor;
pub mod traits;

pub use format::{BLOCK_BYTES, BLOCK_LEN};
pub use quantize::{dequantize_int4, quantize_int4, quantize_int4_with_histogram};
pub use tensor::QuantTensor;
pub use traits::{QuantMatmulOps, QuantizeOps};
