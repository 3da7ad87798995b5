//! Forward-pass mode and dropout.
//!
//! The mode is threaded explicitly through every forward call instead of
//! being a flag stored on the layers. `Mode::Eval` turns dropout into the
//! identity and makes the forward pass deterministic.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub enum Mode {
    Eval,
    /// Training; dropout masks are drawn from the owned generator.
    Train(StdRng),
}

impl Mode {
    pub fn train(seed: u64) -> Self {
        Mode::Train(StdRng::seed_from_u64(seed))
    }

    pub fn is_train(&self) -> bool {
        matches!(self, Mode::Train(_))
    }
}

/// Inverted dropout: kept activations are scaled by `1 / (1 - p)` so eval
/// needs no rescaling.
#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    pub p: f32,
}

impl Dropout {
    pub fn new(p: f32) -> Self {
        Dropout { p }
    }

    /// Apply dropout in place. Returns the scaled keep mask when anything was
    /// dropped, which backward needs.
    pub fn forward(&self, x: &mut [f32], mode: &mut Mode) -> Option<Vec<f32>> {
        let rng = match mode {
            Mode::Train(rng) if self.p > 0.0 => rng,
            _ => return None,
        };
        let scale = 1.0 / (1.0 - self.p);
        let mask: Vec<f32> = x
            .iter()
            .map(|_| if rng.gen_bool(f64::from(self.p)) { 0.0 } else { scale })
            .collect();
        for (v, m) in x.iter_mut().zip(&mask) {
            *v *= m;
        }
        Some(mask)
    }

    pub fn backward(grad: &mut [f32], mask: Option<&[f32]>) {
        if let Some(mask) = mask {
            for (g, m) in grad.iter_mut().zip(mask) {
                *g *= m;
            }
        }
    }
}
