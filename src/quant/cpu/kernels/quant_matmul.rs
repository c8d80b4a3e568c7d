//! CPU int4 quantized matmul kernel
//!
//! Computes: activation [M, K] × weight^T → output [M, N]
//!
//! Weight is stored as [N, K] packed blocks (blocks run along K). Each output
//! element is a fused decode-and-dot over one packed weight row, so no
//! dequantized weight is ever materialized.
//!
//! Parallelism:
//! - M = 1 (decode): rayon over chunks of the N output columns
//! - M > 1: rayon over activation rows

use rayon::prelude::*;
use std::ffi::c_void;

use super::int4_block::dot_int4_row;
use crate::quant::format::{BLOCK_BYTES, BLOCK_LEN};

/// Quantized matmul: activation \[M, K\] × weight\[N, K\]^T → output \[M, N\]
///
/// `act`: \[M * K\] f32 values (row-major)
/// `weight`: packed bytes for the \[N, K\] weight
/// `output`: \[M * N\] f32 values (row-major), fully overwritten
pub fn quant_matmul_int4(
    act: &[f32],
    weight: &[u8],
    output: &mut [f32],
    m: usize,
    k: usize,
    n: usize,
) {
    debug_assert_eq!(act.len(), m * k);
    debug_assert_eq!(output.len(), m * n);

    let row_bytes = k / BLOCK_LEN * BLOCK_BYTES;
    debug_assert_eq!(weight.len(), n * row_bytes);

    if n == 0 {
        return;
    }
    if k == 0 {
        output.fill(0.0);
        return;
    }

    if m == 1 {
        // ~4 chunks per thread, at least 16 rows each
        let num_threads = rayon::current_num_threads();
        let chunk_size = n.div_ceil(num_threads * 4).max(16);

        output
            .par_chunks_mut(chunk_size)
            .enumerate()
            .for_each(|(c, out)| {
                let j_start = c * chunk_size;
                for (jj, o) in out.iter_mut().enumerate() {
                    let j = j_start + jj;
                    *o = dot_int4_row(&weight[j * row_bytes..(j + 1) * row_bytes], act);
                }
            });
    } else {
        output
            .par_chunks_mut(n)
            .zip(act.par_chunks(k))
            .for_each(|(out, act_row)| {
                for (j, o) in out.iter_mut().enumerate() {
                    *o = dot_int4_row(&weight[j * row_bytes..(j + 1) * row_bytes], act_row);
                }
            });
    }
}

/// Quantized matmul with a C ABI.
///
/// `src0_ne` holds the weight extents fastest-first `[K, N]`; `src1_ne` the
/// activation extents `[K, M]`. Writes `M * N` floats to `result`. Shapes are
/// not checked.
///
/// # Safety
///
/// - `src0_ne` and `src1_ne` must each point to 2 readable i64 values
/// - `src0_data` must be valid for reads of `N * (K / 64) * 36` bytes
/// - `src1_data` must be valid for reads of `M * K` aligned f32 values
/// - `result` must be valid for writes of `M * N` aligned f32 values
/// - `K` must be a multiple of 64 and equal in both extents
pub unsafe extern "C" fn int4_mul_mat_f32(
    src0_ne: *const i64,
    src0_data: *const c_void,
    src1_ne: *const i64,
    src1_data: *const c_void,
    result: *mut f32,
) {
    // SAFETY: guaranteed by the caller contract above
    let (k, n, m) = unsafe {
        (
            *src0_ne as usize,
            *src0_ne.add(1) as usize,
            *src1_ne.add(1) as usize,
        )
    };
    debug_assert_eq!(k, unsafe { *src1_ne } as usize);

    let row_bytes = k / BLOCK_LEN * BLOCK_BYTES;
    // SAFETY: guaranteed by the caller contract above
    let (weight, act, output) = unsafe {
        (
            std::slice::from_raw_parts(src0_data.cast::<u8>(), n * row_bytes),
            std::slice::from_raw_parts(src1_data.cast::<f32>(), m * k),
            std::slice::from_raw_parts_mut(result, m * n),
        )
    };
    quant_matmul_int4(act, weight, output, m, k, n);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::cpu::kernels::int4_block::{dequant_int4, quantize_row_int4};
    use crate::quant::format::HIST_BINS;

    fn packed_weight(n: usize, k: usize) -> (Vec<u8>, Vec<f32>) {
        let src: Vec<f32> = (0..n * k).map(|i| (i as f32 * 0.05).sin()).collect();
        let mut bytes = vec![0u8; n * k / BLOCK_LEN * BLOCK_BYTES];
        let mut hist = [0i64; HIST_BINS];
        quantize_row_int4(&src, &mut bytes, &mut hist);
        let mut dense = vec![0.0f32; n * k];
        dequant_int4(&bytes, &mut dense);
        (bytes, dense)
    }

    fn reference(act: &[f32], dense: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; m * n];
        for i in 0..m {
            for j in 0..n {
                out[i * n + j] = (0..k).map(|t| act[i * k + t] * dense[j * k + t]).sum();
            }
        }
        out
    }

    #[test]
    fn test_decode_path_matches_reference() {
        let (m, k, n) = (1, 128, 40);
        let (bytes, dense) = packed_weight(n, k);
        let act: Vec<f32> = (0..m * k).map(|i| (i as f32 * 0.3).cos()).collect();

        let mut out = vec![0.0f32; m * n];
        quant_matmul_int4(&act, &bytes, &mut out, m, k, n);
        for (a, b) in out.iter().zip(reference(&act, &dense, m, k, n)) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
    }

    #[test]
    fn test_batched_path_matches_reference() {
        let (m, k, n) = (5, 192, 3);
        let (bytes, dense) = packed_weight(n, k);
        let act: Vec<f32> = (0..m * k).map(|i| (i as f32 * 0.7).sin()).collect();

        let mut out = vec![0.0f32; m * n];
        quant_matmul_int4(&act, &bytes, &mut out, m, k, n);
        for (a, b) in out.iter().zip(reference(&act, &dense, m, k, n)) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
    }

    #[test]
    fn test_extern_entry_point() {
        let (m, k, n) = (2, 64, 2);
        let (bytes, dense) = packed_weight(n, k);
        let act = vec![1.0f32; m * k];
        let src0_ne = [k as i64, n as i64];
        let src1_ne = [k as i64, m as i64];
        let mut out = vec![f32::NAN; m * n];
        unsafe {
            int4_mul_mat_f32(
                src0_ne.as_ptr(),
                bytes.as_ptr().cast(),
                src1_ne.as_ptr(),
                act.as_ptr().cast(),
                out.as_mut_ptr(),
            );
        }
        let expected = reference(&act, &dense, m, k, n);
        for (a, b) in out.iter().zip(expected) {
            assert!((a - b).abs() < 1e-3);
        }
    }
}
