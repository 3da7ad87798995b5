use rand::Rng;

use super::param::{Param, Parameters, scoped};
use crate::cpu_utils::{accumulate_wb_gradients, backprop_input, matmul_add_bias};

/// Fully connected layer applied independently to every row of its input.
#[derive(Debug, Clone)]
pub struct Linear {
    pub in_dim: usize,
    pub out_dim: usize,
    pub weight: Param,       // shape: [out_dim][in_dim]
    pub bias: Option<Param>, // shape: [out_dim]
}

impl Linear {
    pub fn new<R: Rng + ?Sized>(in_dim: usize, out_dim: usize, bias: bool, rng: &mut R) -> Self {
        Linear {
            in_dim,
            out_dim,
            weight: Param::trunc_normal(vec![out_dim, in_dim], rng),
            bias: bias.then(|| Param::zeros(vec![out_dim])),
        }
    }

    /// input: [rows][in_dim], output: [rows][out_dim]
    pub fn forward(&self, input: &[f32]) -> Vec<f32> {
        matmul_add_bias(
            input,
            &self.weight.value,
            self.bias.as_ref().map(|b| b.value.as_slice()),
            self.in_dim,
            self.out_dim,
        )
    }

    /// Accumulate parameter gradients for one forward call and return the
    /// gradient with respect to `input`.
    pub fn backward(&mut self, input: &[f32], grad_output: &[f32]) -> Vec<f32> {
        accumulate_wb_gradients(
            &mut self.weight.grad,
            self.bias.as_mut().map(|b| b.grad.as_mut_slice()),
            grad_output,
            input,
            self.in_dim,
            self.out_dim,
        );
        backprop_input(grad_output, &self.weight.value, self.in_dim, self.out_dim)
    }
}

impl Parameters for Linear {
    fn named_params(&self, prefix: &str) -> Vec<(String, &Param)> {
        let mut out = vec![(scoped(prefix, "weight"), &self.weight)];
        if let Some(bias) = &self.bias {
            out.push((scoped(prefix, "bias"), bias));
        }
        out
    }

    fn named_params_mut(&mut self, prefix: &str) -> Vec<(String, &mut Param)> {
        let mut out = vec![(scoped(prefix, "weight"), &mut self.weight)];
        if let Some(bias) = &mut self.bias {
            out.push((scoped(prefix, "bias"), bias));
        }
        out
    }
}
