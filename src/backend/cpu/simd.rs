//! std::simd variants of the hot CPU kernels
//!
//! Requires the `simd` feature (nightly `portable_simd`). The matvec keeps
//! four vector accumulators per row with fused multiply-add, then finishes
//! the leftover columns with the scalar 4-way loop, so results differ from
//! [`ops::matvec`](super::ops::matvec) only in summation order.

use std::simd::prelude::*;
use std::simd::StdFloat;

use rayon::prelude::*;

use super::ops::{dot4, rms_scale};

#[cfg(target_arch = "x86_64")]
pub const SIMD_WIDTH: usize = 8; // AVX2

#[cfg(target_arch = "aarch64")]
pub const SIMD_WIDTH: usize = 4; // NEON

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const SIMD_WIDTH: usize = 4;

type SimdF32 = Simd<f32, SIMD_WIDTH>;

const UNROLL: usize = 4;

const MIN_ROWS_PER_TASK: usize = 16;

/// Dot product over `x.len()` columns
#[inline]
pub fn dot_simd(w: &[f32], x: &[f32]) -> f32 {
    let n = x.len();
    let block = UNROLL * SIMD_WIDTH;
    let upper = n - n % block;

    let mut acc = [SimdF32::splat(0.0); UNROLL];
    let mut j = 0;
    while j < upper {
        for (u, sum) in acc.iter_mut().enumerate() {
            let off = j + u * SIMD_WIDTH;
            let wv = SimdF32::from_slice(&w[off..off + SIMD_WIDTH]);
            let xv = SimdF32::from_slice(&x[off..off + SIMD_WIDTH]);
            *sum = wv.mul_add(xv, *sum);
        }
        j += block;
    }

    let val = (acc[0] + acc[1] + acc[2] + acc[3]).reduce_sum();
    val + dot4(&w[upper..n], &x[upper..n])
}

/// Row-parallel matvec using [`dot_simd`] per row
pub fn matvec_simd(out: &mut [f32], x: &[f32], w: &[f32]) {
    let n = x.len();
    debug_assert!(w.len() >= out.len() * n);
    out.par_iter_mut()
        .enumerate()
        .with_min_len(MIN_ROWS_PER_TASK)
        .for_each(|(row, o)| {
            *o = dot_simd(&w[row * n..(row + 1) * n], x);
        });
}

fn sum_of_squares_simd(x: &[f32]) -> f32 {
    let chunks = x.chunks_exact(SIMD_WIDTH);
    let tail = chunks.remainder();
    let mut acc = SimdF32::splat(0.0);
    for c in chunks {
        let v = SimdF32::from_slice(c);
        acc = v.mul_add(v, acc);
    }
    tail.iter().fold(acc.reduce_sum(), |s, &v| s + v * v)
}

pub fn rms_norm_simd(out: &mut [f32], input: &[f32], weight: &[f32]) {
    debug_assert_eq!(out.len(), input.len());
    let scale = rms_scale(sum_of_squares_simd(input), input.len());
    for ((o, &x), &w) in out.iter_mut().zip(input).zip(weight) {
        *o = w * (scale * x);
    }
}

pub fn rms_norm_in_place_simd(x: &mut [f32], weight: &[f32]) {
    let scale = rms_scale(sum_of_squares_simd(x), x.len());
    for (v, &w) in x.iter_mut().zip(weight) {
        *v = w * (scale * *v);
    }
}
