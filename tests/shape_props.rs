//! Property tests for the packing shape contract.

use numr::runtime::cpu::{CpuDevice, CpuRuntime};
use proptest::prelude::*;
use qlinear::{Error, Tensor, dequantize_int4, quantize_int4};

fn ramp(rows: usize, cols: usize) -> Tensor<CpuRuntime> {
    let data: Vec<f32> = (0..rows * cols)
        .map(|i| ((i % 29) as f32 - 14.0) * 0.05)
        .collect();
    Tensor::<CpuRuntime>::from_slice(&data, &[rows, cols], &CpuDevice::new()).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn packs_iff_aligned(rows in 1usize..6, cols in 1usize..300) {
        let src = ramp(rows, cols);
        let n = rows * cols;
        match quantize_int4(&src) {
            Ok(packed) => {
                prop_assert!(cols % 64 == 0 && n % 64 == 0);
                prop_assert_eq!(packed.as_bytes().unwrap().len(), (n / 64) * 36);
                prop_assert_eq!(packed.shape(), &[rows, cols][..]);
            }
            Err(Error::InvalidInput { .. }) => {
                prop_assert!(cols % 64 != 0 || n % 64 != 0);
            }
            Err(other) => prop_assert!(false, "unexpected error: {other}"),
        }
    }

    #[test]
    fn decode_error_bounded_by_half_step(rows in 1usize..4, blocks in 1usize..4, scale in 0.01f32..10.0) {
        let cols = blocks * 64;
        let data: Vec<f32> = (0..rows * cols)
            .map(|i| ((i as f32) * 0.37).sin() * scale)
            .collect();
        let src = Tensor::<CpuRuntime>::from_slice(&data, &[rows, cols], &CpuDevice::new()).unwrap();
        let decoded = dequantize_int4(&quantize_int4(&src).unwrap()).unwrap().to_vec::<f32>();

        for (block, out) in data.chunks(64).zip(decoded.chunks(64)) {
            let amax = block.iter().fold(0.0f32, |m, x| m.max(x.abs()));
            let step = amax / 7.0;
            for (x, y) in block.iter().zip(out) {
                prop_assert!((x - y).abs() <= step * (0.5 + 1e-4) + 1e-6, "{} vs {} (step {})", x, y, step);
            }
        }
    }
}
