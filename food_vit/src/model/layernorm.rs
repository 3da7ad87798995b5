use rayon::prelude::*;

use super::param::{Param, Parameters, scoped};

/// Activations kept from a forward pass for [`LayerNorm::backward`].
#[derive(Debug, Clone)]
pub struct LayerNormCache {
    /// Normalised input before scale and shift, `[rows][dim]`.
    pub norm: Vec<f32>,
    /// `1 / sqrt(var + eps)` per row.
    pub rstd: Vec<f32>,
}

/// Per-row layer normalisation with learnable scale (gamma) and shift (beta).
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub dim: usize,
    pub gamma: Param,
    pub beta: Param,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(dim: usize) -> Self {
        LayerNorm {
            dim,
            gamma: Param::filled(vec![dim], 1.0),
            beta: Param::zeros(vec![dim]),
            eps: 1e-5,
        }
    }

    pub fn forward(&self, input: &[f32]) -> (Vec<f32>, LayerNormCache) {
        let dim = self.dim;
        let rows = input.len() / dim;
        let mut norm = vec![0.0; input.len()];
        let mut rstd = vec![0.0; rows];
        norm.par_chunks_mut(dim)
            .zip(rstd.par_iter_mut())
            .zip(input.par_chunks(dim))
            .for_each(|((n_row, r), x_row)| {
                let mean = x_row.iter().sum::<f32>() / dim as f32;
                let var = x_row.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / dim as f32;
                *r = 1.0 / (var + self.eps).sqrt();
                for (n, x) in n_row.iter_mut().zip(x_row) {
                    *n = (x - mean) * *r;
                }
            });
        let gamma = &self.gamma.value;
        let beta = &self.beta.value;
        let out = norm
            .par_chunks(dim)
            .flat_map_iter(|n_row| {
                n_row
                    .iter()
                    .zip(gamma)
                    .zip(beta)
                    .map(|((n, g), b)| g * n + b)
            })
            .collect();
        (out, LayerNormCache { norm, rstd })
    }

    /// grad_output is [rows][dim], returns grad_input [rows][dim]
    pub fn backward(&mut self, cache: &LayerNormCache, grad_output: &[f32]) -> Vec<f32> {
        let dim = self.dim;
        for (go_row, n_row) in grad_output.chunks(dim).zip(cache.norm.chunks(dim)) {
            for i in 0..dim {
                self.gamma.grad[i] += go_row[i] * n_row[i];
                self.beta.grad[i] += go_row[i];
            }
        }
        let gamma = &self.gamma.value;
        let mut grad_input = vec![0.0; grad_output.len()];
        grad_input
            .par_chunks_mut(dim)
            .zip(grad_output.par_chunks(dim))
            .zip(cache.norm.par_chunks(dim))
            .zip(cache.rstd.par_iter())
            .for_each(|(((gi_row, go_row), n_row), &rstd)| {
                // dxhat = g * gamma
                let mut mean_dxhat = 0.0;
                let mut mean_dxhat_xhat = 0.0;
                for i in 0..dim {
                    let dxhat = go_row[i] * gamma[i];
                    mean_dxhat += dxhat;
                    mean_dxhat_xhat += dxhat * n_row[i];
                }
                mean_dxhat /= dim as f32;
                mean_dxhat_xhat /= dim as f32;
                for i in 0..dim {
                    let dxhat = go_row[i] * gamma[i];
                    gi_row[i] = rstd * (dxhat - mean_dxhat - n_row[i] * mean_dxhat_xhat);
                }
            });
        grad_input
    }
}

impl Parameters for LayerNorm {
    fn named_params(&self, prefix: &str) -> Vec<(String, &Param)> {
        vec![
            (scoped(prefix, "weight"), &self.gamma),
            (scoped(prefix, "bias"), &self.beta),
        ]
    }

    fn named_params_mut(&mut self, prefix: &str) -> Vec<(String, &mut Param)> {
        vec![
            (scoped(prefix, "weight"), &mut self.gamma),
            (scoped(prefix, "bias"), &mut self.beta),
        ]
    }
}
