//! Weights file: a safetensors container of F32 tensors keyed by parameter
//! name, with the architecture and the class list stored in its metadata.
//!
//! Class names travel with the weights so that the label index used in
//! training and the one used at inference cannot drift apart.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use tracing::info;

use crate::config::VitConfig;
use crate::error::{Error, Result};
use crate::model::{Parameters, VisionTransformer};

const CONFIG_KEY: &str = "config";
const CLASS_NAMES_KEY: &str = "class_names";

/// A model together with the class names its head was trained on.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub model: VisionTransformer,
    pub class_names: Vec<String>,
}

/// Serialize a model and its class list to safetensors bytes.
pub fn to_bytes(model: &VisionTransformer, class_names: &[String]) -> Result<Vec<u8>> {
    if class_names.len() != model.num_classes() {
        return Err(Error::WeightMismatch(format!(
            "{} class names for a head with {} outputs",
            class_names.len(),
            model.num_classes()
        )));
    }
    let params = model.named_params("");
    let mut views = Vec::with_capacity(params.len());
    for (name, param) in &params {
        let view = TensorView::new(
            Dtype::F32,
            param.shape.clone(),
            bytemuck::cast_slice(&param.value),
        )?;
        views.push((name.clone(), view));
    }
    let metadata = HashMap::from([
        (CONFIG_KEY.to_string(), serde_json::to_string(model.config())?),
        (CLASS_NAMES_KEY.to_string(), serde_json::to_string(class_names)?),
    ]);
    Ok(safetensors::serialize(
        views.iter().map(|(name, view)| (name, view)),
        &Some(metadata),
    )?)
}

pub fn save(model: &VisionTransformer, class_names: &[String], path: &Path) -> Result<()> {
    let bytes = to_bytes(model, class_names)?;
    std::fs::write(path, bytes).map_err(|e| Error::io(path, e))?;
    info!(path = %path.display(), params = model.num_params(), "saved weights");
    Ok(())
}

/// Rebuild a checkpoint from safetensors bytes.
///
/// When `expected` is given, the stored architecture must match it exactly;
/// a mismatch fails instead of reshaping anything.
pub fn from_bytes(bytes: &[u8], expected: Option<&VitConfig>) -> Result<Checkpoint> {
    let (_, header) = SafeTensors::read_metadata(bytes)?;
    let metadata = header.metadata().clone().unwrap_or_default();
    let stored_config = match metadata.get(CONFIG_KEY) {
        Some(raw) => Some(serde_json::from_str::<VitConfig>(raw)?),
        None => None,
    };
    let config = match (stored_config, expected) {
        (Some(stored), Some(expected)) => {
            if !stored.same_architecture(expected) {
                return Err(Error::WeightMismatch(format!(
                    "file was saved from {stored:?}, expected {expected:?}"
                )));
            }
            // keep the caller's dropout settings, shapes are identical
            expected.clone()
        }
        (Some(stored), None) => stored,
        (None, Some(expected)) => expected.clone(),
        (None, None) => {
            return Err(Error::WeightMismatch(
                "file carries no config and none was given".into(),
            ));
        }
    };

    let class_names: Vec<String> = match metadata.get(CLASS_NAMES_KEY) {
        Some(raw) => serde_json::from_str(raw)?,
        None => {
            return Err(Error::WeightMismatch(
                "file carries no class names".into(),
            ));
        }
    };
    if class_names.len() != config.num_classes {
        return Err(Error::WeightMismatch(format!(
            "{} class names for {} classes",
            class_names.len(),
            config.num_classes
        )));
    }

    let tensors = SafeTensors::deserialize(bytes)?;
    let mut model = VisionTransformer::with_seed(config, 0)?;
    load_tensors(&mut model, &tensors)?;
    Ok(Checkpoint { model, class_names })
}

pub fn load(path: &Path, expected: Option<&VitConfig>) -> Result<Checkpoint> {
    let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
    let checkpoint = from_bytes(&bytes, expected)?;
    info!(
        path = %path.display(),
        classes = checkpoint.class_names.len(),
        "loaded weights"
    );
    Ok(checkpoint)
}

/// Copy every tensor into the matching parameter. Missing, unexpected,
/// non-F32 or differently shaped tensors are all errors.
fn load_tensors<M: Parameters>(model: &mut M, tensors: &SafeTensors<'_>) -> Result<()> {
    let mut unexpected: HashSet<String> = tensors.names().into_iter().cloned().collect();
    for (name, param) in model.named_params_mut("") {
        let view = tensors
            .tensor(&name)
            .map_err(|_| Error::WeightMismatch(format!("missing tensor '{name}'")))?;
        if view.dtype() != Dtype::F32 {
            return Err(Error::WeightMismatch(format!(
                "tensor '{name}' has dtype {:?}, expected F32",
                view.dtype()
            )));
        }
        if view.shape() != param.shape.as_slice() {
            return Err(Error::WeightMismatch(format!(
                "tensor '{name}' has shape {:?}, expected {:?}",
                view.shape(),
                param.shape
            )));
        }
        param.value = bytemuck::allocation::pod_collect_to_vec(view.data());
        param.zero_grad();
        unexpected.remove(&name);
    }
    if !unexpected.is_empty() {
        let mut names: Vec<String> = unexpected.into_iter().collect();
        names.sort();
        return Err(Error::WeightMismatch(format!(
            "unexpected tensors: {}",
            names.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Mode;

    fn tiny_config() -> VitConfig {
        VitConfig {
            image_size: 8,
            patch_size: 4,
            num_classes: 2,
            embed_dim: 8,
            depth: 2,
            num_heads: 2,
            mlp_ratio: 2.0,
            ..VitConfig::default()
        }
    }

    fn classes() -> Vec<String> {
        vec!["pizza".to_string(), "salad".to_string()]
    }

    #[test]
    fn round_trip_reproduces_forward_outputs() -> Result<()> {
        let config = tiny_config();
        let model = VisionTransformer::with_seed(config.clone(), 17)?;
        let bytes = to_bytes(&model, &classes())?;
        let loaded = from_bytes(&bytes, Some(&config))?;
        assert_eq!(loaded.class_names, classes());

        let image: Vec<f32> = (0..config.image_len()).map(|i| (i as f32).sin()).collect();
        let images = vec![image];
        let before = model.forward(&images, &mut Mode::Eval)?;
        let after = loaded.model.forward(&images, &mut Mode::Eval)?;
        assert_eq!(before, after);
        Ok(())
    }

    #[test]
    fn config_is_recovered_from_metadata() -> Result<()> {
        let model = VisionTransformer::with_seed(tiny_config(), 1)?;
        let bytes = to_bytes(&model, &classes())?;
        let loaded = from_bytes(&bytes, None)?;
        assert!(loaded.model.config().same_architecture(&tiny_config()));
        Ok(())
    }

    #[test]
    fn architecture_mismatch_fails_loudly() -> Result<()> {
        let model = VisionTransformer::with_seed(tiny_config(), 1)?;
        let bytes = to_bytes(&model, &classes())?;
        let deeper = VitConfig {
            depth: 3,
            ..tiny_config()
        };
        assert!(matches!(
            from_bytes(&bytes, Some(&deeper)),
            Err(Error::WeightMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn tensor_shape_mismatch_fails_loudly() -> Result<()> {
        // same metadata, but the head tensor is written with the wrong shape
        let model = VisionTransformer::with_seed(tiny_config(), 1)?;
        let params = model.named_params("");
        let bogus = vec![0.0f32; 3 * 8];
        let mut views = Vec::new();
        for (name, param) in &params {
            let view = if name == "head.weight" {
                TensorView::new(Dtype::F32, vec![3, 8], bytemuck::cast_slice(&bogus))?
            } else {
                TensorView::new(Dtype::F32, param.shape.clone(), bytemuck::cast_slice(&param.value))?
            };
            views.push((name.clone(), view));
        }
        let metadata = HashMap::from([
            (CONFIG_KEY.to_string(), serde_json::to_string(model.config())?),
            (CLASS_NAMES_KEY.to_string(), serde_json::to_string(&classes())?),
        ]);
        let bytes =
            safetensors::serialize(views.iter().map(|(name, view)| (name, view)), &Some(metadata))?;
        let err = from_bytes(&bytes, None);
        assert!(matches!(err, Err(Error::WeightMismatch(msg)) if msg.contains("head.weight")));
        Ok(())
    }

    #[test]
    fn class_count_must_match_head() -> Result<()> {
        let model = VisionTransformer::with_seed(tiny_config(), 1)?;
        let three = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert!(matches!(to_bytes(&model, &three), Err(Error::WeightMismatch(_))));
        Ok(())
    }
}
