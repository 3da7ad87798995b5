use rand::Rng;
use rayon::prelude::*;

use super::linear::Linear;
use super::mode::{Dropout, Mode};
use super::param::{Param, Parameters, scoped};
use crate::gelu::{gelu, gelu_derivative};

#[derive(Debug, Clone)]
pub struct MlpCache {
    input: Vec<f32>,
    hidden: Vec<f32>,
    activated: Vec<f32>,
    mask1: Option<Vec<f32>>,
    mask2: Option<Vec<f32>>,
}

/// Per-token feed-forward network: expand, GELU, project back.
#[derive(Debug, Clone)]
pub struct Mlp {
    pub fc1: Linear,
    pub fc2: Linear,
    pub drop: Dropout,
}

impl Mlp {
    pub fn new<R: Rng + ?Sized>(dim: usize, hidden_dim: usize, drop: f32, rng: &mut R) -> Self {
        Mlp {
            fc1: Linear::new(dim, hidden_dim, true, rng),
            fc2: Linear::new(hidden_dim, dim, true, rng),
            drop: Dropout::new(drop),
        }
    }

    /// x: [seq][dim] -> [seq][dim]
    pub fn forward(&self, x: &[f32], mode: &mut Mode) -> (Vec<f32>, MlpCache) {
        let hidden = self.fc1.forward(x);
        let mut activated: Vec<f32> = hidden.par_iter().map(|&h| gelu(h)).collect();
        let mask1 = self.drop.forward(&mut activated, mode);
        let mut out = self.fc2.forward(&activated);
        let mask2 = self.drop.forward(&mut out, mode);
        let cache = MlpCache {
            input: x.to_vec(),
            hidden,
            activated,
            mask1,
            mask2,
        };
        (out, cache)
    }

    pub fn backward(&mut self, cache: &MlpCache, grad_output: &[f32]) -> Vec<f32> {
        let mut grad_out = grad_output.to_vec();
        Dropout::backward(&mut grad_out, cache.mask2.as_deref());
        let mut grad_activated = self.fc2.backward(&cache.activated, &grad_out);
        Dropout::backward(&mut grad_activated, cache.mask1.as_deref());
        let grad_hidden: Vec<f32> = grad_activated
            .par_iter()
            .zip(cache.hidden.par_iter())
            .map(|(g, &h)| g * gelu_derivative(h))
            .collect();
        self.fc1.backward(&cache.input, &grad_hidden)
    }
}

impl Parameters for Mlp {
    fn named_params(&self, prefix: &str) -> Vec<(String, &Param)> {
        let mut out = self.fc1.named_params(&scoped(prefix, "fc1"));
        out.extend(self.fc2.named_params(&scoped(prefix, "fc2")));
        out
    }

    fn named_params_mut(&mut self, prefix: &str) -> Vec<(String, &mut Param)> {
        let mut out = self.fc1.named_params_mut(&scoped(prefix, "fc1"));
        out.extend(self.fc2.named_params_mut(&scoped(prefix, "fc2")));
        out
    }
}
