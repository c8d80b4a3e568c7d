//! Int4 block format definition
//!
//! A block packs `BLOCK_LEN` consecutive source floats:
//!
//! ```text
//! [4 bytes]  f32 scale, little-endian
//! [32 bytes] 64 nibbles, two per byte: element 2i in the low nibble,
//!            element 2i+1 in the high nibble, stored with a +8 bias
//! ```
//!
//! # Packing axis contract
//!
//! Blocks run along the LAST axis and never straddle rows. For a weight
//! `[out_features, in_features]`, each row holds `in_features / 64` blocks.

use crate::error::{Error, Result};

/// Source elements per block
pub const BLOCK_LEN: usize = 64;
/// Bytes of the per-block scale
pub const SCALE_BYTES: usize = 4;
/// Bytes per packed block: scale followed by `BLOCK_LEN / 2` nibble bytes
pub const BLOCK_BYTES: usize = BLOCK_LEN / 2 + SCALE_BYTES;
/// Bins of the nibble histogram filled by the encoder
pub const HIST_BINS: usize = 16;

/// Number of blocks for `numel` elements.
pub fn num_blocks(numel: usize) -> Result<usize> {
    if numel % BLOCK_LEN != 0 {
        return Err(Error::invalid_input(format!(
            "element count {numel} is not a multiple of block length {BLOCK_LEN}"
        )));
    }
    Ok(numel / BLOCK_LEN)
}

/// Packed bytes for `numel` elements: `(numel / 64) * 36`.
pub fn storage_bytes(numel: usize) -> Result<usize> {
    Ok(num_blocks(numel)? * BLOCK_BYTES)
}

/// Packed bytes of one row of `row_len` elements.
pub fn row_bytes(row_len: usize) -> Result<usize> {
    storage_bytes(row_len)
}

/// Check that a dense shape can be packed.
///
/// Both the element count and the last dimension must be multiples of
/// `BLOCK_LEN`.
pub fn validate_shape(shape: &[usize]) -> Result<()> {
    let Some(&last) = shape.last() else {
        return Err(Error::invalid_input("cannot quantize a 0-d tensor"));
    };
    let numel = shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| Error::invalid_input(format!("element count of {shape:?} overflows")))?;
    if numel % BLOCK_LEN != 0 {
        return Err(Error::invalid_input(format!(
            "tensor size {numel} must be a multiple of {BLOCK_LEN}"
        )));
    }
    if last % BLOCK_LEN != 0 {
        return Err(Error::invalid_input(format!(
            "last dim {last} of tensor must be a multiple of {BLOCK_LEN}"
        )));
    }
    Ok(())
}
