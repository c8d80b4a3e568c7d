//! CPU int4 block kernels: encode, decode, fused row dot
//!
//! Scheme per block of 64 values: `d = max|x| / 7`, each value stored as
//! `round(x / d) + 8` in a nibble. Decoding is `(nibble - 8) * d`, so an
//! all-zero block decodes to exact zeros.

use crate::quant::format::{BLOCK_BYTES, BLOCK_LEN, HIST_BINS, SCALE_BYTES};
use std::ffi::c_void;

#[inline]
fn block_scale(block: &[u8]) -> f32 {
    f32::from_le_bytes([block[0], block[1], block[2], block[3]])
}

#[inline]
fn encode(v: f32) -> u8 {
    // |v| <= 7 up to float error; NaN saturates to 0
    (v.round().clamp(-8.0, 7.0) as i8 + 8) as u8
}

/// Encode one row of f32 values into packed blocks, counting nibbles in `hist`.
///
/// `src.len()` must be a multiple of 64 and `dst` must hold exactly
/// `src.len() / 64 * 36` bytes.
pub fn quantize_row_int4(src: &[f32], dst: &mut [u8], hist: &mut [i64; HIST_BINS]) {
    debug_assert_eq!(src.len() % BLOCK_LEN, 0);
    debug_assert_eq!(dst.len(), src.len() / BLOCK_LEN * BLOCK_BYTES);

    for (x, block) in src
        .chunks_exact(BLOCK_LEN)
        .zip(dst.chunks_exact_mut(BLOCK_BYTES))
    {
        let amax = x.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let d = amax / 7.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };

        block[..SCALE_BYTES].copy_from_slice(&d.to_le_bytes());
        for (pair, q) in x.chunks_exact(2).zip(block[SCALE_BYTES..].iter_mut()) {
            let lo = encode(pair[0] * id);
            let hi = encode(pair[1] * id);
            hist[lo as usize] += 1;
            hist[hi as usize] += 1;
            *q = lo | (hi << 4);
        }
    }
}

/// Decode packed blocks to f32.
pub fn dequant_int4(blocks: &[u8], output: &mut [f32]) {
    debug_assert_eq!(output.len(), blocks.len() / BLOCK_BYTES * BLOCK_LEN);

    for (block, out) in blocks
        .chunks_exact(BLOCK_BYTES)
        .zip(output.chunks_exact_mut(BLOCK_LEN))
    {
        let d = block_scale(block);
        for (i, &byte) in block[SCALE_BYTES..].iter().enumerate() {
            let low = (byte & 0x0F) as i8 - 8;
            let high = (byte >> 4) as i8 - 8;
            out[i * 2] = low as f32 * d;
            out[i * 2 + 1] = high as f32 * d;
        }
    }
}

/// Dot product of one packed weight row with an f32 activation row.
///
/// Decodes nibbles on the fly; the scale is applied once per block.
pub fn dot_int4_row(row: &[u8], act: &[f32]) -> f32 {
    debug_assert_eq!(act.len(), row.len() / BLOCK_BYTES * BLOCK_LEN);

    row.chunks_exact(BLOCK_BYTES)
        .zip(act.chunks_exact(BLOCK_LEN))
        .map(|(block, x)| {
            let mut sum = 0.0f32;
            for (i, &byte) in block[SCALE_BYTES..].iter().enumerate() {
                let low = ((byte & 0x0F) as i8 - 8) as f32;
                let high = ((byte >> 4) as i8 - 8) as f32;
                sum += low * x[i * 2] + high * x[i * 2 + 1];
            }
            sum * block_scale(block)
        })
        .sum()
}

/// Block encoder with a C ABI.
///
/// Encodes `n` floats laid out as rows of `k`, writes `(n / 64) * 36` bytes
/// to `dst`, adds nibble counts into `hist` and returns the bytes written.
///
/// # Safety
///
/// - `src` must be valid for reads of `n` aligned f32 values
/// - `dst` must be valid for writes of `(n / 64) * 36` bytes
/// - `hist` must be valid for reads and writes of 16 aligned i64 values
/// - `n` and `k` must be non-negative multiples of 64, `k` dividing `n`
///   (`k` may be 0 only when `n` is 0)
pub unsafe extern "C" fn int4_quantize_f32(
    src: *const f32,
    dst: *mut c_void,
    n: i64,
    k: i64,
    hist: *mut i64,
) -> usize {
    let (n, k) = (n as usize, k as usize);
    let total = n / BLOCK_LEN * BLOCK_BYTES;
    if n == 0 || k == 0 {
        return 0;
    }

    // SAFETY: guaranteed by the caller contract above
    let (src, dst, hist) = unsafe {
        (
            std::slice::from_raw_parts(src, n),
            std::slice::from_raw_parts_mut(dst.cast::<u8>(), total),
            &mut *hist.cast::<[i64; HIST_BINS]>(),
        )
    };

    let row_bytes = k / BLOCK_LEN * BLOCK_BYTES;
    for (row, out) in src.chunks_exact(k).zip(dst.chunks_exact_mut(row_bytes)) {
        quantize_row_int4(row, out, hist);
    }
    total
}
