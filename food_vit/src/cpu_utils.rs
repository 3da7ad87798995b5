//! Shared CPU helpers for row-major matrix math and gradient accumulation.
//!
//! Matrices are flat `Vec<f32>` buffers. A weight of shape `[out][in]` stores
//! row `o` at `o * in .. (o + 1) * in`.

use rayon::prelude::*;

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `acc += alpha * x`
pub fn axpy(acc: &mut [f32], alpha: f32, x: &[f32]) {
    for (a, v) in acc.iter_mut().zip(x) {
        *a += alpha * v;
    }
}

pub fn add_in_place(acc: &mut [f32], x: &[f32]) {
    for (a, v) in acc.iter_mut().zip(x) {
        *a += v;
    }
}

/// Numerically stable softmax of one row.
pub fn softmax(xs: &[f32]) -> Vec<f32> {
    let max = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = xs.iter().map(|x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

/// `log(sum(exp(xs)))` without overflow.
pub fn log_sum_exp(xs: &[f32]) -> f32 {
    let max = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    max + xs.iter().map(|x| (x - max).exp()).sum::<f32>().ln()
}

/// Index of the largest value, first one on ties.
pub fn argmax(xs: &[f32]) -> usize {
    let mut best = 0;
    for (i, &x) in xs.iter().enumerate() {
        if x > xs[best] {
            best = i;
        }
    }
    best
}

/// `x [rows][in] * weight^T [in][out] + bias` -> `[rows][out]`.
pub fn matmul_add_bias(
    x: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
    in_dim: usize,
    out_dim: usize,
) -> Vec<f32> {
    let rows = x.len() / in_dim;
    let mut out = vec![0.0; rows * out_dim];
    out.par_chunks_mut(out_dim)
        .zip(x.par_chunks(in_dim))
        .for_each(|(y_row, x_row)| {
            for (o, y) in y_row.iter_mut().enumerate() {
                let w_row = &weight[o * in_dim..(o + 1) * in_dim];
                *y = dot(w_row, x_row) + bias.map_or(0.0, |b| b[o]);
            }
        });
    out
}

/// Gradient with respect to the input of [`matmul_add_bias`]:
/// `grad_out [rows][out] * weight [out][in]` -> `[rows][in]`.
pub fn backprop_input(grad_out: &[f32], weight: &[f32], in_dim: usize, out_dim: usize) -> Vec<f32> {
    let rows = grad_out.len() / out_dim;
    let mut grad_in = vec![0.0; rows * in_dim];
    grad_in
        .par_chunks_mut(in_dim)
        .zip(grad_out.par_chunks(out_dim))
        .for_each(|(gi_row, go_row)| {
            for (o, &g) in go_row.iter().enumerate() {
                if g != 0.0 {
                    axpy(gi_row, g, &weight[o * in_dim..(o + 1) * in_dim]);
                }
            }
        });
    grad_in
}

/// Accumulate weight and bias gradients of [`matmul_add_bias`]:
/// `grad_w += grad_out^T * x`, `grad_b += sum_rows(grad_out)`.
pub fn accumulate_wb_gradients(
    grad_w: &mut [f32],
    grad_b: Option<&mut [f32]>,
    grad_out: &[f32],
    x: &[f32],
    in_dim: usize,
    out_dim: usize,
) {
    let rows = grad_out.len() / out_dim;
    grad_w
        .par_chunks_mut(in_dim)
        .enumerate()
        .for_each(|(o, gw_row)| {
            for r in 0..rows {
                let g = grad_out[r * out_dim + o];
                if g != 0.0 {
                    axpy(gw_row, g, &x[r * in_dim..(r + 1) * in_dim]);
                }
            }
        });
    if let Some(grad_b) = grad_b {
        for go_row in grad_out.chunks(out_dim) {
            add_in_place(grad_b, go_row);
        }
    }
}
