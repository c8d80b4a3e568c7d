//! Checkpoint file formats

pub mod safetensors;

pub use safetensors::{SafeTensors, TensorInfo, save_safetensors};
