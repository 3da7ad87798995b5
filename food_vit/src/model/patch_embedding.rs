use rand::Rng;

use super::linear::Linear;
use super::param::{Param, Parameters, scoped};
use crate::config::VitConfig;
use crate::error::{Error, Result};

/// Splits a CHW image into non-overlapping square patches and projects each
/// one to an embedding vector.
///
/// The projection is a single [`Linear`] over the flattened patch, which is
/// the same map as a convolution with kernel size and stride equal to
/// `patch_size` and weight layout `[embed_dim, in_chans, p, p]`.
#[derive(Debug, Clone)]
pub struct PatchEmbedding {
    pub image_size: usize,
    pub patch_size: usize,
    pub in_chans: usize,
    pub embed_dim: usize,
    pub proj: Linear,
}

impl PatchEmbedding {
    pub fn new<R: Rng + ?Sized>(config: &VitConfig, rng: &mut R) -> Self {
        PatchEmbedding {
            image_size: config.image_size,
            patch_size: config.patch_size,
            in_chans: config.in_chans,
            embed_dim: config.embed_dim,
            proj: Linear::new(config.patch_dim(), config.embed_dim, true, rng),
        }
    }

    pub fn n_patches(&self) -> usize {
        let grid = self.image_size / self.patch_size;
        grid * grid
    }

    /// Returns `(embeddings [n_patches][embed_dim], patches [n_patches][patch_dim])`.
    /// The flattened patches are what backward needs.
    pub fn forward(&self, image: &[f32]) -> Result<(Vec<f32>, Vec<f32>)> {
        let patches = patchify(image, self.in_chans, self.image_size, self.patch_size)?;
        let embeddings = self.proj.forward(&patches);
        Ok((embeddings, patches))
    }

    /// Accumulates projection gradients. The image itself is not learnable,
    /// so no input gradient is produced.
    pub fn backward(&mut self, patches: &[f32], grad_output: &[f32]) {
        self.proj.backward(patches, grad_output);
    }
}

impl Parameters for PatchEmbedding {
    fn named_params(&self, prefix: &str) -> Vec<(String, &Param)> {
        self.proj.named_params(&scoped(prefix, "proj"))
    }

    fn named_params_mut(&mut self, prefix: &str) -> Vec<(String, &mut Param)> {
        self.proj.named_params_mut(&scoped(prefix, "proj"))
    }
}

/// Rearranges a CHW image into `[n_patches][chans * p * p]`.
///
/// Patches come out in raster order (row of patches, then column). Inside a
/// patch, values are ordered channel, then row, then column.
pub fn patchify(image: &[f32], chans: usize, size: usize, patch: usize) -> Result<Vec<f32>> {
    if patch == 0 || size % patch != 0 {
        return Err(Error::Shape(format!(
            "image size {size} is not divisible by patch size {patch}"
        )));
    }
    if image.len() != chans * size * size {
        return Err(Error::Shape(format!(
            "expected a {chans}x{size}x{size} image ({} values), got {}",
            chans * size * size,
            image.len()
        )));
    }
    let grid = size / patch;
    let mut out = Vec::with_capacity(image.len());
    for py in 0..grid {
        for px in 0..grid {
            for c in 0..chans {
                for dy in 0..patch {
                    let row = (c * size + py * patch + dy) * size + px * patch;
                    out.extend_from_slice(&image[row..row + patch]);
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn produces_one_embedding_per_patch() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(5);
        for (image_size, patch_size) in [(8, 4), (12, 4), (16, 8), (32, 16)] {
            let config = VitConfig {
                image_size,
                patch_size,
                embed_dim: 6,
                ..VitConfig::default()
            };
            let embed = PatchEmbedding::new(&config, &mut rng);
            let image = vec![0.5; config.image_len()];
            let (tokens, _) = embed.forward(&image)?;
            let expected = (image_size / patch_size).pow(2);
            assert_eq!(embed.n_patches(), expected);
            assert_eq!(tokens.len(), expected * 6);
        }
        Ok(())
    }

    #[test]
    fn patches_follow_raster_order() -> Result<()> {
        // one channel, 4x4 image, 2x2 patches; pixel value = its flat index
        let image: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let patches = patchify(&image, 1, 4, 2)?;
        assert_eq!(
            patches,
            vec![
                0.0, 1.0, 4.0, 5.0, // top-left
                2.0, 3.0, 6.0, 7.0, // top-right
                8.0, 9.0, 12.0, 13.0, // bottom-left
                10.0, 11.0, 14.0, 15.0, // bottom-right
            ]
        );
        Ok(())
    }

    #[test]
    fn rejects_indivisible_or_wrong_sized_images() {
        assert!(matches!(patchify(&[0.0; 75], 3, 5, 2), Err(Error::Shape(_))));
        assert!(matches!(patchify(&[0.0; 10], 1, 4, 2), Err(Error::Shape(_))));
    }
}
