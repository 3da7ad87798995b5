use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::debug;

use super::block::{BlockCache, TransformerBlock};
use super::layernorm::{LayerNorm, LayerNormCache};
use super::linear::Linear;
use super::mode::{Dropout, Mode};
use super::param::{Param, Parameters, scoped};
use super::patch_embedding::PatchEmbedding;
use crate::config::VitConfig;
use crate::cpu_utils::add_in_place;
use crate::error::{Error, Result};

/// Everything [`VisionTransformer::backward`] needs from one training
/// forward pass of a single image.
#[derive(Debug, Clone)]
pub struct ForwardCache {
    patches: Vec<f32>,
    pos_mask: Option<Vec<f32>>,
    blocks: Vec<BlockCache>,
    norm: LayerNormCache,
    cls_normed: Vec<f32>,
}

impl ForwardCache {
    pub fn blocks(&self) -> &[BlockCache] {
        &self.blocks
    }
}

/// Vision Transformer classifier.
///
/// image -> patch embedding -> [cls | patches] + positional embedding ->
/// dropout -> blocks -> final norm -> head on the classification token.
#[derive(Debug, Clone)]
pub struct VisionTransformer {
    config: VitConfig,
    pub patch_embed: PatchEmbedding,
    pub cls_token: Param, // shape: [1][embed_dim]
    pub pos_embed: Param, // shape: [n_patches + 1][embed_dim]
    pub pos_drop: Dropout,
    pub blocks: Vec<TransformerBlock>,
    pub norm: LayerNorm,
    pub head: Linear,
}

impl VisionTransformer {
    /// Build a randomly initialised model.
    pub fn new(config: VitConfig) -> Result<Self> {
        Self::with_rng(config, &mut StdRng::from_entropy())
    }

    /// Build a model whose initial weights are fixed by `seed`.
    pub fn with_seed(config: VitConfig, seed: u64) -> Result<Self> {
        Self::with_rng(config, &mut StdRng::seed_from_u64(seed))
    }

    pub fn with_rng<R: Rng + ?Sized>(config: VitConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let dim = config.embed_dim;
        let patch_embed = PatchEmbedding::new(&config, rng);
        let cls_token = Param::trunc_normal(vec![1, dim], rng);
        let pos_embed = Param::trunc_normal(vec![config.seq_len(), dim], rng);
        let blocks = (0..config.depth)
            .map(|_| TransformerBlock::new(&config, rng))
            .collect();
        let model = VisionTransformer {
            patch_embed,
            cls_token,
            pos_embed,
            pos_drop: Dropout::new(config.drop_rate),
            blocks,
            norm: LayerNorm::new(dim),
            head: Linear::new(dim, config.num_classes, true, rng),
            config,
        };
        debug!(
            params = model.num_params(),
            depth = model.config.depth,
            embed_dim = dim,
            "initialised vision transformer"
        );
        Ok(model)
    }

    pub fn config(&self) -> &VitConfig {
        &self.config
    }

    pub fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    /// Logits for a batch of CHW images, `[batch][num_classes]`.
    ///
    /// In [`Mode::Eval`] the images are processed in parallel and the result
    /// is deterministic. In [`Mode::Train`] dropout masks are drawn in batch
    /// order from the mode's generator.
    pub fn forward<T>(&self, images: &[T], mode: &mut Mode) -> Result<Vec<Vec<f32>>>
    where
        T: AsRef<[f32]> + Sync,
    {
        if images.is_empty() {
            return Err(Error::EmptyBatch);
        }
        if mode.is_train() {
            images
                .iter()
                .map(|image| Ok(self.forward_train(image.as_ref(), mode)?.0))
                .collect()
        } else {
            images
                .par_iter()
                .map(|image| Ok(self.forward_train(image.as_ref(), &mut Mode::Eval)?.0))
                .collect()
        }
    }

    /// Forward pass of one image that also returns the activations needed
    /// for [`VisionTransformer::backward`].
    pub fn forward_train(&self, image: &[f32], mode: &mut Mode) -> Result<(Vec<f32>, ForwardCache)> {
        let dim = self.config.embed_dim;
        let (tokens, patches) = self.patch_embed.forward(image)?;

        let mut x = Vec::with_capacity(self.pos_embed.len());
        x.extend_from_slice(&self.cls_token.value);
        x.extend_from_slice(&tokens);
        if x.len() != self.pos_embed.len() {
            return Err(Error::Shape(format!(
                "token sequence has {} positions but the positional table has {}",
                x.len() / dim,
                self.pos_embed.len() / dim
            )));
        }
        add_in_place(&mut x, &self.pos_embed.value);
        let pos_mask = self.pos_drop.forward(&mut x, mode);

        let mut block_caches = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let (next, cache) = block.forward(&x, mode);
            x = next;
            block_caches.push(cache);
        }

        // Only the classification token feeds the head
        let (cls_normed, norm) = self.norm.forward(&x[..dim]);
        let logits = self.head.forward(&cls_normed);
        let cache = ForwardCache {
            patches,
            pos_mask,
            blocks: block_caches,
            norm,
            cls_normed,
        };
        Ok((logits, cache))
    }

    /// Accumulate parameter gradients for one image given `dloss/dlogits`.
    pub fn backward(&mut self, cache: &ForwardCache, grad_logits: &[f32]) -> Result<()> {
        if grad_logits.len() != self.config.num_classes {
            return Err(Error::Shape(format!(
                "expected {} logit gradients, got {}",
                self.config.num_classes,
                grad_logits.len()
            )));
        }
        let dim = self.config.embed_dim;
        let grad_cls = self.head.backward(&cache.cls_normed, grad_logits);
        let grad_cls = self.norm.backward(&cache.norm, &grad_cls);

        let mut grad = vec![0.0; self.pos_embed.len()];
        grad[..dim].copy_from_slice(&grad_cls);
        for (block, block_cache) in self.blocks.iter_mut().zip(&cache.blocks).rev() {
            grad = block.backward(block_cache, &grad);
        }
        Dropout::backward(&mut grad, cache.pos_mask.as_deref());

        add_in_place(&mut self.pos_embed.grad, &grad);
        add_in_place(&mut self.cls_token.grad, &grad[..dim]);
        self.patch_embed.backward(&cache.patches, &grad[dim..]);
        Ok(())
    }
}

impl Parameters for VisionTransformer {
    fn named_params(&self, prefix: &str) -> Vec<(String, &Param)> {
        let mut out = self.patch_embed.named_params(&scoped(prefix, "patch_embed"));
        out.push((scoped(prefix, "cls_token"), &self.cls_token));
        out.push((scoped(prefix, "pos_embed"), &self.pos_embed));
        for (i, block) in self.blocks.iter().enumerate() {
            out.extend(block.named_params(&scoped(prefix, &format!("blocks.{i}"))));
        }
        out.extend(self.norm.named_params(&scoped(prefix, "norm")));
        out.extend(self.head.named_params(&scoped(prefix, "head")));
        out
    }

    fn named_params_mut(&mut self, prefix: &str) -> Vec<(String, &mut Param)> {
        let mut out = self
            .patch_embed
            .named_params_mut(&scoped(prefix, "patch_embed"));
        out.push((scoped(prefix, "cls_token"), &mut self.cls_token));
        out.push((scoped(prefix, "pos_embed"), &mut self.pos_embed));
        for (i, block) in self.blocks.iter_mut().enumerate() {
            out.extend(block.named_params_mut(&scoped(prefix, &format!("blocks.{i}"))));
        }
        out.extend(self.norm.named_params_mut(&scoped(prefix, "norm")));
        out.extend(self.head.named_params_mut(&scoped(prefix, "head")));
        out
    }
}
