//! Numeric kernels for one decode step
//!
//! Every function here is pure over its slice arguments. Parallel kernels fan
//! out with rayon and return only after every task has finished, so callers
//! can treat each call as a barrier.

use rayon::prelude::*;

/// Epsilon added to the mean square in RMS normalization
pub const RMS_NORM_EPS: f32 = 1e-5;

/// Base of the rotary frequency schedule
pub const ROPE_THETA: f64 = 10000.0;

/// Rows handed to one rayon task at minimum; keeps tiny projections sequential
const MIN_ROWS_PER_TASK: usize = 16;

/// Head geometry needed by attention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadLayout {
    pub head_size: usize,
    pub kv_dim: usize,
    /// Query heads per key/value head
    pub kv_mul: usize,
    /// Stride of one head's score row in the `att` scratch
    pub seq_len: usize,
}

/// RMS-normalize `input` into `out`: `out[i] = weight[i] * (scale * input[i])`
/// with `scale = 1 / sqrt(mean(input^2) + 1e-5)`.
pub fn rms_norm(out: &mut [f32], input: &[f32], weight: &[f32]) {
    debug_assert_eq!(out.len(), input.len());
    debug_assert!(weight.len() >= input.len());
    let scale = rms_scale(sum_of_squares(input), input.len());
    for ((o, &x), &w) in out.iter_mut().zip(input).zip(weight) {
        *o = w * (scale * x);
    }
}

/// In-place variant for the final norm, where input and output are `x`
pub fn rms_norm_in_place(x: &mut [f32], weight: &[f32]) {
    debug_assert!(weight.len() >= x.len());
    let scale = rms_scale(sum_of_squares(x), x.len());
    for (v, &w) in x.iter_mut().zip(weight) {
        *v = w * (scale * *v);
    }
}

pub(crate) fn rms_scale(sum_sq: f32, len: usize) -> f32 {
    let mean = sum_sq / len as f32 + RMS_NORM_EPS;
    1.0 / mean.sqrt()
}

fn sum_of_squares(x: &[f32]) -> f32 {
    x.iter().fold(0.0f32, |acc, &v| acc + v * v)
}

/// Rotary position encoding over `q` (all pairs) and `k` (pairs below
/// `k.len()`, i.e. `kv_dim`).
pub fn rope_rotate(q: &mut [f32], k: &mut [f32], position: usize, head_size: usize) {
    let kv_dim = k.len();
    for i in (0..q.len()).step_by(2) {
        let head_dim = i % head_size;
        let exponent = (head_dim as f32 / head_size as f32) as f64;
        let freq = (1.0 / ROPE_THETA.powf(exponent)) as f32;
        let angle = position as f32 * freq;
        let cos = (angle as f64).cos() as f32;
        let sin = (angle as f64).sin() as f32;

        rotate_pair(q, i, cos, sin);
        if i < kv_dim {
            rotate_pair(k, i, cos, sin);
        }
    }
}

#[inline]
fn rotate_pair(v: &mut [f32], i: usize, cos: f32, sin: f32) {
    let v0 = v[i];
    let v1 = v[i + 1];
    v[i] = v0 * cos - v1 * sin;
    v[i + 1] = v0 * sin + v1 * cos;
}

/// Numerically stable softmax in place. No-op on an empty slice.
pub fn softmax(x: &mut [f32]) {
    let Some(max) = x.iter().copied().reduce(f32::max) else {
        return;
    };
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in x.iter_mut() {
        *v /= sum;
    }
}

/// `out[row] = W[row, :] . x` for a row-major `W` of shape `(out.len(), x.len())`.
///
/// Rows run in parallel; each row reduces with four partial sums.
pub fn matvec(out: &mut [f32], x: &[f32], w: &[f32]) {
    let n = x.len();
    debug_assert!(w.len() >= out.len() * n);
    out.par_iter_mut()
        .enumerate()
        .with_min_len(MIN_ROWS_PER_TASK)
        .for_each(|(row, o)| {
            *o = dot4(&w[row * n..(row + 1) * n], x);
        });
}

/// Dot product with four independent accumulators, then the `n % 4` tail.
#[inline]
pub fn dot4(w: &[f32], x: &[f32]) -> f32 {
    let mut sum = [0.0f32; 4];
    let w_chunks = w.chunks_exact(4);
    let x_chunks = x.chunks_exact(4);
    let (w_tail, x_tail) = (w_chunks.remainder(), x_chunks.remainder());
    for (wc, xc) in w_chunks.zip(x_chunks) {
        sum[0] += wc[0] * xc[0];
        sum[1] += wc[1] * xc[1];
        sum[2] += wc[2] * xc[2];
        sum[3] += wc[3] * xc[3];
    }
    let mut val = sum[0] + sum[1] + sum[2] + sum[3];
    for (&a, &b) in w_tail.iter().zip(x_tail) {
        val += a * b;
    }
    val
}

/// Attention for a single head at `position`.
///
/// `keys` / `values` are one layer of the cache (`seq_len * kv_dim`);
/// `kv_offset` selects this head's key/value head inside each timestep.
/// `scores` must hold at least `position + 1` entries.
#[allow(clippy::too_many_arguments)]
pub fn attend_head(
    out: &mut [f32],
    scores: &mut [f32],
    q: &[f32],
    keys: &[f32],
    values: &[f32],
    position: usize,
    kv_dim: usize,
    kv_offset: usize,
) {
    let head_size = q.len();
    let scores = &mut scores[..=position];
    let norm = (head_size as f32).sqrt();

    for (t, score) in scores.iter_mut().enumerate() {
        let base = t * kv_dim + kv_offset;
        let k = &keys[base..base + head_size];
        let dot = q.iter().zip(k).fold(0.0f32, |acc, (&a, &b)| acc + a * b);
        *score = dot / norm;
    }

    softmax(scores);

    out.fill(0.0);
    for (t, &a) in scores.iter().enumerate() {
        let base = t * kv_dim + kv_offset;
        let v = &values[base..base + head_size];
        for (o, &vi) in out.iter_mut().zip(v) {
            *o += a * vi;
        }
    }
}

/// All heads in parallel. Head `h` writes `xb[h*head_size..]` and its own
/// `att` row, so no two tasks share an output.
pub fn multi_head_attention(
    xb: &mut [f32],
    att: &mut [f32],
    q: &[f32],
    keys: &[f32],
    values: &[f32],
    position: usize,
    layout: HeadLayout,
) {
    let HeadLayout {
        head_size,
        kv_dim,
        kv_mul,
        seq_len,
    } = layout;

    xb.par_chunks_mut(head_size)
        .zip(att.par_chunks_mut(seq_len))
        .enumerate()
        .for_each(|(h, (out, scores))| {
            let q_head = &q[h * head_size..(h + 1) * head_size];
            let kv_offset = (h / kv_mul) * head_size;
            attend_head(out, scores, q_head, keys, values, position, kv_dim, kv_offset);
        });
}

/// SwiGLU gate: `hb[i] = silu(hb[i]) * gate[i]`
pub fn silu_gate(hb: &mut [f32], gate: &[f32]) {
    debug_assert_eq!(hb.len(), gate.len());
    for (h, &g) in hb.iter_mut().zip(gate) {
        let v = *h;
        *h = v * (1.0 / (1.0 + (-v).exp())) * g;
    }
}

/// `accum[i] += delta[i]`
pub fn residual_add(accum: &mut [f32], delta: &[f32]) {
    debug_assert_eq!(accum.len(), delta.len());
    for (a, &d) in accum.iter_mut().zip(delta) {
        *a += d;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TOL: f32 = 1e-5;

    fn naive_matvec(x: &[f32], w: &[f32], d: usize) -> Vec<f32> {
        let n = x.len();
        (0..d)
            .map(|r| (0..n).map(|j| w[r * n + j] * x[j]).sum())
            .collect()
    }

    #[test]
    fn test_rms_norm_known_values() {
        let input = [1.0f32, 2.0, 3.0, 4.0];
        let weight = [0.5f32; 4];
        let mut out = [0.0f32; 4];
        rms_norm(&mut out, &input, &weight);

        let scale = 1.0 / (7.5f32 + 1e-5).sqrt();
        for i in 0..4 {
            assert!((out[i] - 0.5 * scale * input[i]).abs() < TOL);
        }
    }

    #[test]
    fn test_rms_norm_zero_input_is_finite() {
        let input = [0.0f32; 8];
        let weight = [1.0f32; 8];
        let mut out = [1.0f32; 8];
        rms_norm(&mut out, &input, &weight);
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_rms_norm_in_place_matches_out_of_place() {
        let input: Vec<f32> = (0..13).map(|i| i as f32 * 0.3 - 2.0).collect();
        let weight: Vec<f32> = (0..13).map(|i| 1.0 + i as f32 * 0.01).collect();
        let mut out = vec![0.0; 13];
        rms_norm(&mut out, &input, &weight);
        let mut x = input.clone();
        rms_norm_in_place(&mut x, &weight);
        assert_eq!(out, x);
    }

    #[test]
    fn test_rope_position_zero_is_identity() {
        let q0: Vec<f32> = (0..8).map(|i| i as f32 - 3.5).collect();
        let k0: Vec<f32> = (0..4).map(|i| i as f32 * 0.25 + 1.0).collect();
        let mut q = q0.clone();
        let mut k = k0.clone();
        rope_rotate(&mut q, &mut k, 0, 4);
        assert_eq!(q, q0);
        assert_eq!(k, k0);
    }

    #[test]
    fn test_rope_preserves_pair_norm_and_skips_k_beyond_kv_dim() {
        let mut q = vec![1.0f32, 0.0, 0.0, 1.0, 3.0, 4.0, -1.0, 2.0];
        let mut k = vec![1.0f32, 0.0, 2.0, 2.0];
        rope_rotate(&mut q, &mut k, 3, 4);

        for pair in q.chunks(2) {
            let n = (pair[0] * pair[0] + pair[1] * pair[1]).sqrt();
            assert!(n > 0.9);
        }
        // first pair of each head has freq 1 so angle == position
        assert!((q[0] - 3.0f32.cos()).abs() < TOL);
        assert!((q[1] - 3.0f32.sin()).abs() < TOL);
        assert!((k[0] - 3.0f32.cos()).abs() < TOL);
        assert_eq!(k.len(), 4);
    }

    #[test]
    fn test_softmax_large_magnitudes() {
        let mut x = vec![1e4f32, -1e4, 0.0, 1e4 - 1.0];
        softmax(&mut x);
        let sum: f32 = x.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(x.iter().all(|v| v.is_finite()));
        assert!(x[0] > x[3]);
        assert_eq!(x[1], 0.0);
    }

    #[test]
    fn test_softmax_empty_and_single() {
        let mut empty: [f32; 0] = [];
        softmax(&mut empty);

        let mut one = [42.0f32];
        softmax(&mut one);
        assert_eq!(one[0], 1.0);
    }

    #[test]
    fn test_dot4_handles_tail() {
        let w: Vec<f32> = (0..7).map(|i| i as f32).collect();
        let x = vec![1.0f32; 7];
        assert_eq!(dot4(&w, &x), 21.0);
    }

    #[test]
    fn test_matvec_matches_naive() {
        let n = 37;
        let d = 41;
        let x: Vec<f32> = (0..n).map(|i| (i as f32 * 0.7).sin()).collect();
        let w: Vec<f32> = (0..n * d).map(|i| (i as f32 * 0.13).cos()).collect();
        let mut out = vec![0.0; d];
        matvec(&mut out, &x, &w);
        let expected = naive_matvec(&x, &w, d);
        for (a, b) in out.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_attention_position_zero_returns_value() {
        let head_size = 4;
        let kv_dim = 8;
        let q = [0.3f32, -1.0, 2.0, 0.5];
        let keys: Vec<f32> = (0..kv_dim).map(|i| i as f32).collect();
        let values: Vec<f32> = (0..kv_dim).map(|i| 10.0 + i as f32).collect();
        let mut out = [0.0f32; 4];
        let mut scores = [0.0f32; 3];

        attend_head(&mut out, &mut scores, &q, &keys, &values, 0, kv_dim, head_size);
        assert_eq!(out, [14.0, 15.0, 16.0, 17.0]);
        assert_eq!(scores[0], 1.0);
    }

    #[test]
    fn test_attention_weights_two_timesteps() {
        // q orthogonal to both keys => uniform weights => mean of values
        let q = [0.0f32, 1.0];
        let keys = [1.0f32, 0.0, -1.0, 0.0];
        let values = [2.0f32, 4.0, 6.0, 8.0];
        let mut out = [0.0f32; 2];
        let mut scores = [0.0f32; 2];
        attend_head(&mut out, &mut scores, &q, &keys, &values, 1, 2, 0);
        assert!((out[0] - 4.0).abs() < TOL);
        assert!((out[1] - 6.0).abs() < TOL);
    }

    #[test]
    fn test_multi_head_attention_grouped_heads_share_kv() {
        let layout = HeadLayout {
            head_size: 2,
            kv_dim: 2,
            kv_mul: 2,
            seq_len: 4,
        };
        let q = [1.0f32, 0.0, 0.0, 1.0];
        let keys = [0.5f32, 0.5, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let values = [3.0f32, -3.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let mut xb = [9.0f32; 4];
        let mut att = [0.0f32; 8];
        multi_head_attention(&mut xb, &mut att, &q, &keys, &values, 0, layout);
        assert_eq!(xb, [3.0, -3.0, 3.0, -3.0]);
        assert_eq!(att[0], 1.0);
        assert_eq!(att[4], 1.0);
    }

    #[test]
    fn test_silu_gate() {
        let mut hb = [0.0f32, 1.0, -2.0];
        let gate = [5.0f32, 2.0, 1.0];
        silu_gate(&mut hb, &gate);
        assert_eq!(hb[0], 0.0);
        let s1 = 1.0 / (1.0 + (-1.0f32).exp());
        assert!((hb[1] - s1 * 2.0).abs() < TOL);
        let s2 = -2.0 / (1.0 + 2.0f32.exp());
        assert!((hb[2] - s2).abs() < TOL);
    }

    #[test]
    fn test_residual_add() {
        let mut a = [1.0f32, 2.0];
        residual_add(&mut a, &[0.5, -2.0]);
        assert_eq!(a, [1.5, 0.0]);
    }

    proptest! {
        #[test]
        fn prop_rms_norm_scale_invariant(
            input in prop::collection::vec(-100.0f32..100.0, 1..64),
            c in 0.5f32..50.0,
        ) {
            // keep the epsilon negligible next to the mean square
            let ms = input.iter().map(|v| v * v).sum::<f32>() / input.len() as f32;
            prop_assume!(ms > 1.0);

            let weight = vec![1.0f32; input.len()];
            let scaled: Vec<f32> = input.iter().map(|v| v * c).collect();
            let mut a = vec![0.0; input.len()];
            let mut b = vec![0.0; input.len()];
            rms_norm(&mut a, &input, &weight);
            rms_norm(&mut b, &scaled, &weight);
            for (x, y) in a.iter().zip(&b) {
                prop_assert!((x - y).abs() < 1e-3, "{} vs {}", x, y);
            }
        }

        #[test]
        fn prop_softmax_sums_to_one(input in prop::collection::vec(-1e4f32..1e4, 1..128)) {
            let mut x = input;
            softmax(&mut x);
            let sum: f32 = x.iter().sum();
            prop_assert!((sum - 1.0).abs() < 1e-5 * x.len().max(1) as f32);
            prop_assert!(x.iter().all(|v| v.is_finite() && *v >= 0.0));
        }

        #[test]
        fn prop_matvec_is_linear(
            n in 1usize..24,
            d in 1usize..24,
            a in -3.0f32..3.0,
            b in -3.0f32..3.0,
            seed in any::<u32>(),
        ) {
            let sample = |i: usize, salt: u32| (((i as u32).wrapping_mul(2654435761) ^ seed ^ salt) % 1000) as f32 / 500.0 - 1.0;
            let w: Vec<f32> = (0..n * d).map(|i| sample(i, 1)).collect();
            let x1: Vec<f32> = (0..n).map(|i| sample(i, 2)).collect();
            let x2: Vec<f32> = (0..n).map(|i| sample(i, 3)).collect();
            let combo: Vec<f32> = x1.iter().zip(&x2).map(|(p, q)| a * p + b * q).collect();

            let mut y = vec![0.0; d];
            let mut y1 = vec![0.0; d];
            let mut y2 = vec![0.0; d];
            matvec(&mut y, &combo, &w);
            matvec(&mut y1, &x1, &w);
            matvec(&mut y2, &x2, &w);
            for r in 0..d {
                let expected = a * y1[r] + b * y2[r];
                prop_assert!((y[r] - expected).abs() < 1e-3, "row {}: {} vs {}", r, y[r], expected);
            }
        }
    }
}
