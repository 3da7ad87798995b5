use rand::Rng;
use rayon::prelude::*;

use super::linear::Linear;
use super::mode::{Dropout, Mode};
use super::param::{Param, Parameters, scoped};
use crate::cpu_utils::{axpy, dot, softmax};

/// Activations kept from [`Attention::forward`] for the backward pass.
#[derive(Debug, Clone)]
pub struct AttentionCache {
    input: Vec<f32>,
    /// `[seq][3 * dim]`, laid out as q | k | v, each split into heads.
    qkv: Vec<f32>,
    /// Softmax weights before dropout, `[heads][seq][seq]`.
    probs: Vec<f32>,
    /// Dropout mask over `probs`, when dropout was active.
    attn_mask: Option<Vec<f32>>,
    /// Concatenated head outputs before the output projection, `[seq][dim]`.
    heads_out: Vec<f32>,
    proj_mask: Option<Vec<f32>>,
}

impl AttentionCache {
    /// Attention weights actually applied to the values, `[heads][seq][seq]`.
    fn weights(&self) -> Vec<f32> {
        match &self.attn_mask {
            Some(mask) => self.probs.iter().zip(mask).map(|(p, m)| p * m).collect(),
            None => self.probs.clone(),
        }
    }

    /// Softmax weights before dropout, `[heads][seq][seq]`.
    pub fn probs(&self) -> &[f32] {
        &self.probs
    }
}

/// Multi-head scaled dot-product self-attention.
#[derive(Debug, Clone)]
pub struct Attention {
    pub num_heads: usize,
    pub head_dim: usize,
    pub qkv: Linear,
    pub proj: Linear,
    pub attn_drop: Dropout,
    pub proj_drop: Dropout,
}

impl Attention {
    pub fn new<R: Rng + ?Sized>(
        dim: usize,
        num_heads: usize,
        qkv_bias: bool,
        attn_drop: f32,
        proj_drop: f32,
        rng: &mut R,
    ) -> Self {
        Attention {
            num_heads,
            head_dim: dim / num_heads,
            qkv: Linear::new(dim, dim * 3, qkv_bias, rng),
            proj: Linear::new(dim, dim, true, rng),
            attn_drop: Dropout::new(attn_drop),
            proj_drop: Dropout::new(proj_drop),
        }
    }

    fn dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    fn scale(&self) -> f32 {
        1.0 / (self.head_dim as f32).sqrt()
    }

    /// x: [seq][dim] -> [seq][dim]
    pub fn forward(&self, x: &[f32], mode: &mut Mode) -> (Vec<f32>, AttentionCache) {
        let dim = self.dim();
        let seq_len = x.len() / dim;
        let head_dim = self.head_dim;
        let scale = self.scale();
        let qkv = self.qkv.forward(x);

        // Parallelize over heads, each thread returns its [seq][seq] softmax weights
        let qkv_ref = &qkv;
        let probs: Vec<f32> = (0..self.num_heads)
            .into_par_iter()
            .flat_map_iter(move |head| {
                let q_off = head * head_dim;
                let k_off = dim + head * head_dim;
                let qkv = qkv_ref;
                (0..seq_len).flat_map(move |i| {
                    let qi = &qkv[i * 3 * dim + q_off..][..head_dim];
                    let scores: Vec<f32> = (0..seq_len)
                        .map(|j| dot(qi, &qkv[j * 3 * dim + k_off..][..head_dim]) * scale)
                        .collect();
                    softmax(&scores)
                })
            })
            .collect();

        let mut weights = probs.clone();
        let attn_mask = self.attn_drop.forward(&mut weights, mode);

        let head_outputs: Vec<Vec<f32>> = (0..self.num_heads)
            .into_par_iter()
            .map(|head| {
                let v_off = 2 * dim + head * head_dim;
                let w_head = &weights[head * seq_len * seq_len..][..seq_len * seq_len];
                let mut out = vec![0.0; seq_len * head_dim];
                for (i, out_row) in out.chunks_mut(head_dim).enumerate() {
                    for j in 0..seq_len {
                        let w = w_head[i * seq_len + j];
                        if w != 0.0 {
                            axpy(out_row, w, &qkv[j * 3 * dim + v_off..][..head_dim]);
                        }
                    }
                }
                out
            })
            .collect();
        // Merge heads back to [seq][dim]
        let mut heads_out = vec![0.0; seq_len * dim];
        for (head, out) in head_outputs.iter().enumerate() {
            for i in 0..seq_len {
                heads_out[i * dim + head * head_dim..][..head_dim]
                    .copy_from_slice(&out[i * head_dim..][..head_dim]);
            }
        }

        let mut out = self.proj.forward(&heads_out);
        let proj_mask = self.proj_drop.forward(&mut out, mode);
        let cache = AttentionCache {
            input: x.to_vec(),
            qkv,
            probs,
            attn_mask,
            heads_out,
            proj_mask,
        };
        (out, cache)
    }

    /// grad_output: [seq][dim], returns grad_input [seq][dim]
    pub fn backward(&mut self, cache: &AttentionCache, grad_output: &[f32]) -> Vec<f32> {
        let dim = self.dim();
        let head_dim = self.head_dim;
        let seq_len = grad_output.len() / dim;
        let scale = self.scale();

        let mut grad_proj = grad_output.to_vec();
        Dropout::backward(&mut grad_proj, cache.proj_mask.as_deref());
        let grad_heads = self.proj.backward(&cache.heads_out, &grad_proj);

        let weights = cache.weights();
        let qkv = &cache.qkv;
        // Each head yields its (grad_q, grad_k, grad_v) as [seq][head_dim]
        let head_grads: Vec<[Vec<f32>; 3]> = (0..self.num_heads)
            .into_par_iter()
            .map(|head| {
                let q_off = head * head_dim;
                let k_off = dim + q_off;
                let v_off = 2 * dim + q_off;
                let block = head * seq_len * seq_len;
                let probs = &cache.probs[block..][..seq_len * seq_len];
                let w_head = &weights[block..][..seq_len * seq_len];
                let mask = cache.attn_mask.as_ref().map(|m| &m[block..][..seq_len * seq_len]);
                let mut grad_q = vec![0.0; seq_len * head_dim];
                let mut grad_k = vec![0.0; seq_len * head_dim];
                let mut grad_v = vec![0.0; seq_len * head_dim];
                let mut grad_w = vec![0.0; seq_len];
                let mut grad_scores = vec![0.0; seq_len];
                for i in 0..seq_len {
                    let go = &grad_heads[i * dim + q_off..][..head_dim];
                    for j in 0..seq_len {
                        let vj = &qkv[j * 3 * dim + v_off..][..head_dim];
                        grad_w[j] = dot(go, vj);
                        axpy(&mut grad_v[j * head_dim..][..head_dim], w_head[i * seq_len + j], go);
                    }
                    if let Some(mask) = mask {
                        for j in 0..seq_len {
                            grad_w[j] *= mask[i * seq_len + j];
                        }
                    }
                    // softmax backward: p * (g - sum(p * g))
                    let p_row = &probs[i * seq_len..][..seq_len];
                    let weighted = dot(p_row, &grad_w);
                    for j in 0..seq_len {
                        grad_scores[j] = p_row[j] * (grad_w[j] - weighted) * scale;
                    }
                    let qi = &qkv[i * 3 * dim + q_off..][..head_dim];
                    for j in 0..seq_len {
                        let gs = grad_scores[j];
                        if gs == 0.0 {
                            continue;
                        }
                        let kj = &qkv[j * 3 * dim + k_off..][..head_dim];
                        axpy(&mut grad_q[i * head_dim..][..head_dim], gs, kj);
                        axpy(&mut grad_k[j * head_dim..][..head_dim], gs, qi);
                    }
                }
                [grad_q, grad_k, grad_v]
            })
            .collect();

        let mut grad_qkv = vec![0.0; seq_len * 3 * dim];
        for (head, grads) in head_grads.iter().enumerate() {
            for (part, grad) in grads.iter().enumerate() {
                let off = part * dim + head * head_dim;
                for i in 0..seq_len {
                    grad_qkv[i * 3 * dim + off..][..head_dim]
                        .copy_from_slice(&grad[i * head_dim..][..head_dim]);
                }
            }
        }
        self.qkv.backward(&cache.input, &grad_qkv)
    }
}

impl Parameters for Attention {
    fn named_params(&self, prefix: &str) -> Vec<(String, &Param)> {
        let mut out = self.qkv.named_params(&scoped(prefix, "qkv"));
        out.extend(self.proj.named_params(&scoped(prefix, "proj")));
        out
    }

    fn named_params_mut(&mut self, prefix: &str) -> Vec<(String, &mut Param)> {
        let mut out = self.qkv.named_params_mut(&scoped(prefix, "qkv"));
        out.extend(self.proj.named_params_mut(&scoped(prefix, "proj")));
        out
    }
}
