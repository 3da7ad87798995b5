//! Model, training and preprocessing configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Food categories the shipped model is trained on.
pub const FOOD_CLASSES: [&str; 10] = [
    "apple", "banana", "broccoli", "burger", "carrot", "donut", "fries", "hotdog", "pizza",
    "salad",
];

/// Per-channel normalisation mean (RGB), shared by training and inference.
pub const IMAGE_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// Per-channel normalisation standard deviation (RGB).
pub const IMAGE_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Image file extensions picked up when scanning a directory.
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Architecture hyperparameters of a [`crate::VisionTransformer`].
///
/// Weights are only interchangeable between models whose configs agree on
/// every shape-bearing field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VitConfig {
    pub image_size: usize,
    pub patch_size: usize,
    pub in_chans: usize,
    pub num_classes: usize,
    pub embed_dim: usize,
    pub depth: usize,
    pub num_heads: usize,
    pub mlp_ratio: f32,
    pub qkv_bias: bool,
    pub drop_rate: f32,
    pub attn_drop_rate: f32,
}

impl Default for VitConfig {
    fn default() -> Self {
        VitConfig {
            image_size: 224,
            patch_size: 16,
            in_chans: 3,
            num_classes: FOOD_CLASSES.len(),
            embed_dim: 384,
            depth: 8,
            num_heads: 6,
            mlp_ratio: 3.0,
            qkv_bias: true,
            drop_rate: 0.1,
            attn_drop_rate: 0.0,
        }
    }
}

impl VitConfig {
    /// Number of patches along one side of the image.
    pub fn grid_size(&self) -> usize {
        self.image_size / self.patch_size
    }

    pub fn n_patches(&self) -> usize {
        self.grid_size() * self.grid_size()
    }

    /// Token count including the classification token.
    pub fn seq_len(&self) -> usize {
        self.n_patches() + 1
    }

    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads
    }

    /// Width of the MLP hidden layer.
    pub fn hidden_features(&self) -> usize {
        (self.embed_dim as f32 * self.mlp_ratio) as usize
    }

    /// Flattened length of one patch (`in_chans * patch_size^2`).
    pub fn patch_dim(&self) -> usize {
        self.in_chans * self.patch_size * self.patch_size
    }

    /// Flattened length of one CHW input image.
    pub fn image_len(&self) -> usize {
        self.in_chans * self.image_size * self.image_size
    }

    pub fn validate(&self) -> Result<()> {
        if self.patch_size == 0 || self.image_size == 0 {
            return Err(Error::InvalidConfig(
                "image_size and patch_size must be positive".into(),
            ));
        }
        if self.image_size % self.patch_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "image_size {} is not divisible by patch_size {}",
                self.image_size, self.patch_size
            )));
        }
        if self.in_chans == 0 || self.num_classes == 0 || self.depth == 0 {
            return Err(Error::InvalidConfig(
                "in_chans, num_classes and depth must be positive".into(),
            ));
        }
        if self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
            return Err(Error::InvalidConfig(format!(
                "embed_dim {} is not divisible by num_heads {}",
                self.embed_dim, self.num_heads
            )));
        }
        if self.hidden_features() == 0 {
            return Err(Error::InvalidConfig(format!(
                "mlp_ratio {} gives an empty hidden layer",
                self.mlp_ratio
            )));
        }
        for (name, p) in [
            ("drop_rate", self.drop_rate),
            ("attn_drop_rate", self.attn_drop_rate),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::InvalidConfig(format!(
                    "{name} must be in [0, 1), got {p}"
                )));
            }
        }
        Ok(())
    }

    /// Fields that fix parameter shapes. Two configs that agree here can
    /// share a weights file.
    pub fn same_architecture(&self, other: &VitConfig) -> bool {
        self.image_size == other.image_size
            && self.patch_size == other.patch_size
            && self.in_chans == other.in_chans
            && self.num_classes == other.num_classes
            && self.embed_dim == other.embed_dim
            && self.depth == other.depth
            && self.num_heads == other.num_heads
            && self.hidden_features() == other.hidden_features()
            && self.qkv_bias == other.qkv_bias
    }

    /// Side length the shorter image edge is resized to before the center
    /// crop (256 for a 224 input).
    pub fn resize_size(&self) -> u32 {
        (self.image_size * 256 / 224) as u32
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let config: VitConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }
}

/// Optimisation and data loading settings for [`crate::Trainer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub weight_decay: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    /// Threads decoding images for the next batch.
    pub num_workers: usize,
    /// Batches prepared ahead of the one being trained on.
    pub prefetch: usize,
    pub seed: u64,
    /// Apply random crop, flip and colour jitter to training images.
    pub augment: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            epochs: 15,
            batch_size: 16,
            learning_rate: 5e-4,
            weight_decay: 0.05,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            num_workers: 4,
            prefetch: 2,
            seed: 42,
            augment: true,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be positive".into()));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "learning_rate must be positive and finite, got {}",
                self.learning_rate
            )));
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "weight_decay must be non-negative and finite, got {}",
                self.weight_decay
            )));
        }
        if !self.eps.is_finite() || self.eps <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "eps must be positive and finite, got {}",
                self.eps
            )));
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(Error::InvalidConfig("betas must be in [0, 1)".into()));
        }
        Ok(())
    }
}
