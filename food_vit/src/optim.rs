use rayon::prelude::*;

use crate::config::TrainConfig;
use crate::model::{Param, Parameters};

/// Adam with decoupled weight decay.
///
/// Moment buffers live on each [`Param`]; the optimizer only keeps the
/// hyperparameters and the step count used for bias correction.
#[derive(Debug, Clone)]
pub struct AdamW {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
    t: i32,
}

impl AdamW {
    pub fn new(lr: f32, weight_decay: f32) -> Self {
        AdamW {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay,
            t: 0,
        }
    }

    pub fn from_config(config: &TrainConfig) -> Self {
        AdamW {
            lr: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
            weight_decay: config.weight_decay,
            t: 0,
        }
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> i32 {
        self.t
    }

    /// Apply one update to every parameter of `model` from its accumulated
    /// gradients.
    pub fn step<M: Parameters + ?Sized>(&mut self, model: &mut M) {
        self.t += 1;
        for (_, param) in model.named_params_mut("") {
            self.update(param);
        }
    }

    fn update(&self, param: &mut Param) {
        let (lr, beta1, beta2, eps) = (self.lr, self.beta1, self.beta2, self.eps);
        let decay = 1.0 - lr * self.weight_decay;
        let bias1 = 1.0 - beta1.powi(self.t);
        let bias2 = 1.0 - beta2.powi(self.t);
        let Param {
            value, grad, m, v, ..
        } = param;
        value
            .par_iter_mut()
            .zip(grad.par_iter())
            .zip(m.par_iter_mut())
            .zip(v.par_iter_mut())
            .for_each(|(((p, &g), m), v)| {
                *p *= decay;
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
    }
}
