//! Vision Transformer layers.
//!
//! Every layer owns its parameters and exposes a forward pass that returns
//! its output together with the activations its backward pass needs.
//! Backward accumulates into the parameter gradients and returns the
//! gradient with respect to the layer input.

pub mod attention;
pub mod block;
pub mod layernorm;
pub mod linear;
pub mod mlp;
pub mod mode;
pub mod param;
pub mod patch_embedding;
pub mod vit;

pub use attention::Attention;
pub use block::TransformerBlock;
pub use layernorm::LayerNorm;
pub use linear::Linear;
pub use mlp::Mlp;
pub use mode::{Dropout, Mode};
pub use param::{Param, Parameters};
pub use patch_embedding::PatchEmbedding;
pub use vit::{ForwardCache, VisionTransformer};
