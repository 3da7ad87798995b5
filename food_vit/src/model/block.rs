use rand::Rng;

use super::attention::{Attention, AttentionCache};
use super::layernorm::{LayerNorm, LayerNormCache};
use super::mlp::{Mlp, MlpCache};
use super::mode::Mode;
use super::param::{Param, Parameters, scoped};
use crate::config::VitConfig;
use crate::cpu_utils::add_in_place;

#[derive(Debug, Clone)]
pub struct BlockCache {
    norm1: LayerNormCache,
    attn: AttentionCache,
    norm2: LayerNormCache,
    mlp: MlpCache,
}

impl BlockCache {
    pub fn attention(&self) -> &AttentionCache {
        &self.attn
    }
}

/// Pre-norm transformer block:
/// `x' = x + attn(norm1(x))`, `y = x' + mlp(norm2(x'))`.
#[derive(Debug, Clone)]
pub struct TransformerBlock {
    pub norm1: LayerNorm,
    pub attn: Attention,
    pub norm2: LayerNorm,
    pub mlp: Mlp,
}

impl TransformerBlock {
    pub fn new<R: Rng + ?Sized>(config: &VitConfig, rng: &mut R) -> Self {
        let dim = config.embed_dim;
        TransformerBlock {
            norm1: LayerNorm::new(dim),
            attn: Attention::new(
                dim,
                config.num_heads,
                config.qkv_bias,
                config.attn_drop_rate,
                config.drop_rate,
                rng,
            ),
            norm2: LayerNorm::new(dim),
            mlp: Mlp::new(dim, config.hidden_features(), config.drop_rate, rng),
        }
    }

    /// x: [seq][dim] -> [seq][dim]
    pub fn forward(&self, x: &[f32], mode: &mut Mode) -> (Vec<f32>, BlockCache) {
        let (normed1, norm1) = self.norm1.forward(x);
        let (attn_out, attn) = self.attn.forward(&normed1, mode);
        let mut hidden = x.to_vec();
        add_in_place(&mut hidden, &attn_out);

        let (normed2, norm2) = self.norm2.forward(&hidden);
        let (mlp_out, mlp) = self.mlp.forward(&normed2, mode);
        add_in_place(&mut hidden, &mlp_out);

        let cache = BlockCache {
            norm1,
            attn,
            norm2,
            mlp,
        };
        (hidden, cache)
    }

    /// grad_output: [seq][dim], returns grad_input [seq][dim]
    pub fn backward(&mut self, cache: &BlockCache, grad_output: &[f32]) -> Vec<f32> {
        // Residual connection: grad flows to both the mlp branch and x'
        let grad_normed2 = self.mlp.backward(&cache.mlp, grad_output);
        let mut grad_hidden = grad_output.to_vec();
        add_in_place(&mut grad_hidden, &self.norm2.backward(&cache.norm2, &grad_normed2));

        let grad_normed1 = self.attn.backward(&cache.attn, &grad_hidden);
        let mut grad_input = grad_hidden;
        add_in_place(&mut grad_input, &self.norm1.backward(&cache.norm1, &grad_normed1));
        grad_input
    }
}

impl Parameters for TransformerBlock {
    fn named_params(&self, prefix: &str) -> Vec<(String, &Param)> {
        let mut out = self.norm1.named_params(&scoped(prefix, "norm1"));
        out.extend(self.attn.named_params(&scoped(prefix, "attn")));
        out.extend(self.norm2.named_params(&scoped(prefix, "norm2")));
        out.extend(self.mlp.named_params(&scoped(prefix, "mlp")));
        out
    }

    fn named_params_mut(&mut self, prefix: &str) -> Vec<(String, &mut Param)> {
        let mut out = self.norm1.named_params_mut(&scoped(prefix, "norm1"));
        out.extend(self.attn.named_params_mut(&scoped(prefix, "attn")));
        out.extend(self.norm2.named_params_mut(&scoped(prefix, "norm2")));
        out.extend(self.mlp.named_params_mut(&scoped(prefix, "mlp")));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn tiny_config() -> VitConfig {
        VitConfig {
            embed_dim: 8,
            num_heads: 2,
            mlp_ratio: 2.0,
            drop_rate: 0.0,
            ..VitConfig::default()
        }
    }

    #[test]
    fn zeroed_sublayers_leave_the_residual_stream_untouched() {
        let mut rng = StdRng::seed_from_u64(21);
        let mut block = TransformerBlock::new(&tiny_config(), &mut rng);
        // attention and mlp outputs end in a projection; zero both
        for p in [&mut block.attn.proj.weight, &mut block.mlp.fc2.weight] {
            p.value.iter_mut().for_each(|v| *v = 0.0);
        }
        let x: Vec<f32> = (0..3 * 8).map(|i| i as f32 * 0.1 - 1.0).collect();
        let (y, _) = block.forward(&x, &mut Mode::Eval);
        assert_eq!(y, x);
    }

    #[test]
    fn backward_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(22);
        let mut block = TransformerBlock::new(&tiny_config(), &mut rng);
        for (name, p) in block.named_params_mut("") {
            if name.ends_with("weight") && !name.contains("norm") {
                p.value.iter_mut().for_each(|v| *v *= 20.0);
            }
        }
        let x: Vec<f32> = (0..2 * 8).map(|i| ((i * 7 % 11) as f32 - 5.0) * 0.2).collect();
        let c: Vec<f32> = (0..2 * 8).map(|i| (i as f32 * 1.3).cos()).collect();
        let loss = |b: &TransformerBlock, x: &[f32]| -> f32 {
            b.forward(x, &mut Mode::Eval).0.iter().zip(&c).map(|(y, c)| y * c).sum()
        };
        let (_, cache) = block.forward(&x, &mut Mode::Eval);
        let grad_x = block.backward(&cache, &c);
        let h = 1e-2;
        for i in 0..x.len() {
            let mut xp = x.clone();
            xp[i] += h;
            let mut xm = x.clone();
            xm[i] -= h;
            let numeric = (loss(&block, &xp) - loss(&block, &xm)) / (2.0 * h);
            assert!(
                (numeric - grad_x[i]).abs() < 2e-2 * (1.0 + numeric.abs()),
                "x[{i}]: numeric {numeric} analytic {}",
                grad_x[i]
            );
        }
    }

    #[test]
    fn parameter_names_follow_module_paths() {
        let mut rng = StdRng::seed_from_u64(1);
        let block = TransformerBlock::new(&tiny_config(), &mut rng);
        let names: Vec<String> = block
            .named_params("blocks.0")
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(
            names,
            [
                "blocks.0.norm1.weight",
                "blocks.0.norm1.bias",
                "blocks.0.attn.qkv.weight",
                "blocks.0.attn.qkv.bias",
                "blocks.0.attn.proj.weight",
                "blocks.0.attn.proj.bias",
                "blocks.0.norm2.weight",
                "blocks.0.norm2.bias",
                "blocks.0.mlp.fc1.weight",
                "blocks.0.mlp.fc1.bias",
                "blocks.0.mlp.fc2.weight",
                "blocks.0.mlp.fc2.bias",
            ]
        );
    }
}
