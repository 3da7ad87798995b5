//! Classification of image files with a trained model.

use std::fmt::Write as _;
use std::io::Write;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{info, warn};

use crate::config::{IMAGE_EXTENSIONS, VitConfig};
use crate::cpu_utils::softmax;
use crate::data::{ImageTensor, Preprocessor};
use crate::error::{Error, Result};
use crate::model::{Mode, VisionTransformer};
use crate::weights;

/// One ranked class for an image.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class_name: String,
    /// Softmax probability in `[0, 1]`.
    pub probability: f32,
}

/// The `k` most probable classes of one logit row, highest first. Ties keep
/// ascending class order; `k` is clamped to the number of classes.
pub fn top_predictions(logits: &[f32], class_names: &[String], k: usize) -> Vec<Prediction> {
    let probs = softmax(logits);
    let mut ranked: Vec<usize> = (0..probs.len()).collect();
    // stable sort keeps index order among equal probabilities
    ranked.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
    ranked
        .into_iter()
        .take(k.min(class_names.len()))
        .filter_map(|i| {
            class_names.get(i).map(|name| Prediction {
                class_name: name.clone(),
                probability: probs[i],
            })
        })
        .collect()
}

/// A trained model plus everything needed to go from a file path to
/// ranked class names.
#[derive(Debug, Clone)]
pub struct Classifier {
    model: VisionTransformer,
    class_names: Vec<String>,
    preprocessor: Preprocessor,
}

impl Classifier {
    pub fn new(model: VisionTransformer, class_names: Vec<String>) -> Result<Self> {
        if class_names.len() != model.num_classes() {
            return Err(Error::InvalidConfig(format!(
                "{} class names for a head with {} outputs",
                class_names.len(),
                model.num_classes()
            )));
        }
        let preprocessor = Preprocessor::new(model.config());
        Ok(Classifier {
            model,
            class_names,
            preprocessor,
        })
    }

    /// Load a weights file, taking the architecture and class names stored
    /// in it.
    pub fn load(path: &Path) -> Result<Self> {
        let checkpoint = weights::load(path, None)?;
        Self::new(checkpoint.model, checkpoint.class_names)
    }

    /// Load a weights file that must match `config`.
    pub fn load_with_config(path: &Path, config: &VitConfig) -> Result<Self> {
        let checkpoint = weights::load(path, Some(config))?;
        Self::new(checkpoint.model, checkpoint.class_names)
    }

    pub fn model(&self) -> &VisionTransformer {
        &self.model
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    /// Top-`k` predictions for one image file.
    pub fn predict_image(&self, path: &Path, k: usize) -> Result<Vec<Prediction>> {
        let tensor = self.preprocessor.load(path)?;
        let logits = self.model.forward(&[tensor], &mut Mode::Eval)?;
        Ok(logits
            .first()
            .map(|row| top_predictions(row, &self.class_names, k))
            .unwrap_or_default())
    }

    /// Top-`k` predictions for many files, `batch_size` at a time.
    ///
    /// Files that fail to load are logged and skipped. Results come back in
    /// input order, each paired with the path it was computed from.
    pub fn predict_batch(
        &self,
        paths: &[PathBuf],
        batch_size: usize,
        k: usize,
    ) -> Result<Vec<(PathBuf, Vec<Prediction>)>> {
        let mut results = Vec::with_capacity(paths.len());
        for chunk in paths.chunks(batch_size.max(1)) {
            let loaded: Vec<(&PathBuf, Result<ImageTensor>)> = chunk
                .par_iter()
                .map(|path| (path, self.preprocessor.load(path)))
                .collect();
            let mut kept = Vec::with_capacity(loaded.len());
            let mut tensors = Vec::with_capacity(loaded.len());
            for (path, tensor) in loaded {
                match tensor {
                    Ok(tensor) => {
                        kept.push(path);
                        tensors.push(tensor);
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping image"),
                }
            }
            if tensors.is_empty() {
                continue;
            }
            let logits = self.model.forward(&tensors, &mut Mode::Eval)?;
            for (path, row) in kept.into_iter().zip(&logits) {
                results.push((path.clone(), top_predictions(row, &self.class_names, k)));
            }
        }
        Ok(results)
    }
}

/// Every image under `dir`, recursively, in sorted order. Extensions are
/// matched case-insensitively against [`IMAGE_EXTENSIONS`].
pub fn collect_images(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::DirectoryNotFound(dir.to_path_buf()));
    }
    let mut found = Vec::new();
    walk_dir(dir, &mut found)?;
    if found.is_empty() {
        return Err(Error::NoImages(dir.to_path_buf()));
    }
    found.sort();
    info!(dir = %dir.display(), images = found.len(), "collected images");
    Ok(found)
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

/// Symlinked directories are not descended into, so a link back up the
/// tree cannot loop. Symlinked files are listed like regular ones.
fn walk_dir(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let file_type = entry.file_type().map_err(|e| Error::io(entry.path(), e))?;
        let path = entry.path();
        let is_file = file_type.is_file() || (file_type.is_symlink() && path.is_file());
        if file_type.is_dir() {
            walk_dir(&path, out)?;
        } else if is_file && is_image_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}

/// `  pizza: 0.8123 (81.23%)`
pub fn format_prediction(prediction: &Prediction) -> String {
    format!(
        "{}: {:.4} ({:.2}%)",
        prediction.class_name,
        prediction.probability,
        prediction.probability * 100.0
    )
}

/// Render results as text: the path, one indented line per prediction, then
/// a blank line.
pub fn render_results(results: &[(PathBuf, Vec<Prediction>)]) -> String {
    let mut out = String::new();
    for (path, predictions) in results {
        let _ = writeln!(out, "{}", path.display());
        for prediction in predictions {
            let _ = writeln!(out, "  {}", format_prediction(prediction));
        }
        out.push('\n');
    }
    out
}

pub fn write_results(results: &[(PathBuf, Vec<Prediction>)], path: &Path) -> Result<()> {
    let mut file = std::fs::File::create(path).map_err(|e| Error::io(path, e))?;
    file.write_all(render_results(results).as_bytes())
        .map_err(|e| Error::io(path, e))?;
    info!(path = %path.display(), images = results.len(), "wrote results");
    Ok(())
}
