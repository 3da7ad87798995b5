//! Vision Transformer food classifier on the CPU.
//!
//! [`VisionTransformer`] is trained with hand-written backpropagation and
//! AdamW ([`Trainer`]), persisted as safetensors ([`weights`]) and served by
//! a [`Classifier`] that maps image files to ranked class names.

pub mod config;
mod cpu_utils;
pub mod data;
pub mod error;
mod gelu;
pub mod inference;
pub mod logging;
pub mod model;
pub mod optim;
pub mod train;
pub mod weights;

pub use config::{FOOD_CLASSES, TrainConfig, VitConfig};
pub use data::{ImageFolder, ImageTensor, Preprocessor};
pub use error::{Error, Result};
pub use inference::{Classifier, Prediction, collect_images, top_predictions, write_results};
pub use model::{Mode, Parameters, VisionTransformer};
pub use optim::AdamW;
pub use train::{EpochStats, Trainer};
pub use weights::Checkpoint;

#[cfg(test)]
mod tests {
    use super::*;
    use ::image::{Rgb, RgbImage};
    use std::path::{Path, PathBuf};

    fn tiny_config(num_classes: usize) -> VitConfig {
        VitConfig {
            image_size: 16,
            patch_size: 8,
            num_classes,
            embed_dim: 16,
            depth: 1,
            num_heads: 2,
            mlp_ratio: 2.0,
            ..VitConfig::default()
        }
    }

    fn tempdir() -> Result<tempfile::TempDir> {
        tempfile::tempdir().map_err(|e| Error::io("tempdir", e))
    }

    fn save_png(path: &Path, img: &RgbImage) -> Result<()> {
        img.save(path).map_err(|source| Error::Image {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Two visually separable classes: bright red and dark blue squares.
    fn write_dataset(root: &Path, per_class: usize) -> Result<()> {
        for (class, colour) in [("apple", [220u8, 30, 30]), ("blueberry", [20, 30, 160])] {
            let dir = root.join(class);
            std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
            for i in 0..per_class {
                let shade = (i * 7) as u8;
                let img = RgbImage::from_fn(24, 20, |x, y| {
                    let jitter = ((x + y) % 3) as u8;
                    Rgb([
                        colour[0].saturating_sub(shade) + jitter,
                        colour[1] + jitter,
                        colour[2].saturating_sub(shade) + jitter,
                    ])
                });
                save_png(&dir.join(format!("{i}.png")), &img)?;
            }
        }
        Ok(())
    }

    fn quick_train_config(epochs: usize) -> TrainConfig {
        TrainConfig {
            epochs,
            batch_size: 2,
            learning_rate: 5e-3,
            num_workers: 2,
            prefetch: 1,
            augment: false,
            ..TrainConfig::default()
        }
    }

    #[test]
    fn one_epoch_on_a_small_tree_reports_sane_stats() -> Result<()> {
        let dir = tempdir()?;
        write_dataset(dir.path(), 4)?;
        let dataset = ImageFolder::open(dir.path())?;
        let mut model = VisionTransformer::with_seed(tiny_config(2), 0)?;
        let mut trainer = Trainer::new(TrainConfig {
            augment: true,
            ..quick_train_config(1)
        })?;
        let stats = trainer.fit(&mut model, &dataset)?;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].epoch, 1);
        assert_eq!(stats[0].samples, 8);
        assert!(stats[0].loss.is_finite() && stats[0].loss > 0.0);
        assert!((0.0..=100.0).contains(&stats[0].accuracy));
        assert_eq!(trainer.optimizer().steps(), 4);
        Ok(())
    }

    #[test]
    fn loss_decreases_on_separable_classes() -> Result<()> {
        let dir = tempdir()?;
        write_dataset(dir.path(), 4)?;
        let dataset = ImageFolder::open(dir.path())?;
        let config = VitConfig {
            drop_rate: 0.0,
            ..tiny_config(2)
        };
        let mut model = VisionTransformer::with_seed(config, 1)?;
        let mut trainer = Trainer::new(quick_train_config(8))?;
        let stats = trainer.fit(&mut model, &dataset)?;
        let first = stats.first().map(|s| s.loss).unwrap_or(f32::NAN);
        let last = stats.last().map(|s| s.loss).unwrap_or(f32::NAN);
        assert!(last < first, "loss went from {first} to {last}");
        Ok(())
    }

    #[test]
    fn class_count_mismatch_is_rejected_before_training() -> Result<()> {
        let dir = tempdir()?;
        write_dataset(dir.path(), 1)?;
        let dataset = ImageFolder::open(dir.path())?;
        let mut model = VisionTransformer::with_seed(tiny_config(3), 0)?;
        let mut trainer = Trainer::new(quick_train_config(1))?;
        assert!(matches!(
            trainer.fit(&mut model, &dataset),
            Err(Error::InvalidConfig(_))
        ));
        Ok(())
    }

    #[test]
    fn saved_classifier_reproduces_logits() -> Result<()> {
        let dir = tempdir()?;
        let image_path = dir.path().join("meal.png");
        save_png(
            &image_path,
            &RgbImage::from_fn(30, 22, |x, y| Rgb([(x * 8) as u8, (y * 11) as u8, 90])),
        )?;
        let classes = vec!["apple".to_string(), "pizza".to_string(), "salad".to_string()];
        let model = VisionTransformer::with_seed(tiny_config(3), 4)?;
        let weights_path = dir.path().join("model.safetensors");
        weights::save(&model, &classes, &weights_path)?;

        let fresh = Classifier::new(model, classes.clone())?;
        let restored = Classifier::load(&weights_path)?;
        assert_eq!(restored.class_names(), classes.as_slice());
        assert_eq!(
            fresh.predict_image(&image_path, 3)?,
            restored.predict_image(&image_path, 3)?
        );
        Ok(())
    }

    #[test]
    fn weights_from_a_different_depth_fail_to_load() -> Result<()> {
        let dir = tempdir()?;
        let classes = vec!["a".to_string(), "b".to_string()];
        let weights_path = dir.path().join("model.safetensors");
        weights::save(
            &VisionTransformer::with_seed(tiny_config(2), 0)?,
            &classes,
            &weights_path,
        )?;
        let deeper = VitConfig {
            depth: 2,
            ..tiny_config(2)
        };
        assert!(matches!(
            Classifier::load_with_config(&weights_path, &deeper),
            Err(Error::WeightMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn gray_image_at_full_size_is_deterministic() -> Result<()> {
        let dir = tempdir()?;
        let image_path = dir.path().join("gray.png");
        save_png(&image_path, &RgbImage::from_pixel(224, 224, Rgb([128, 128, 128])))?;
        let config = VitConfig {
            embed_dim: 32,
            depth: 1,
            num_heads: 2,
            ..VitConfig::default()
        };
        let model = VisionTransformer::with_seed(config, 9)?;
        let pre = Preprocessor::new(model.config());
        let tensor = pre.load(&image_path)?;
        assert_eq!(tensor.data().len(), 3 * 224 * 224);
        let images = vec![tensor];
        let a = model.forward(&images, &mut Mode::Eval)?;
        let b = model.forward(&images, &mut Mode::Eval)?;
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].len(), FOOD_CLASSES.len());
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn batch_inference_skips_unreadable_files_and_keeps_paths_aligned() -> Result<()> {
        let dir = tempdir()?;
        let mut paths: Vec<PathBuf> = Vec::new();
        for i in 0..4 {
            let path = dir.path().join(format!("{i}.png"));
            save_png(&path, &RgbImage::from_pixel(20, 20, Rgb([i * 60, 10, 200])))?;
            paths.push(path);
        }
        let corrupt = dir.path().join("broken.jpg");
        std::fs::write(&corrupt, b"not a jpeg").map_err(|e| Error::io(&corrupt, e))?;
        paths.insert(1, dir.path().join("missing.png"));
        paths.insert(3, corrupt);

        let classifier = Classifier::new(
            VisionTransformer::with_seed(tiny_config(3), 2)?,
            vec!["x".into(), "y".into(), "z".into()],
        )?;
        let results = classifier.predict_batch(&paths, 2, 2)?;
        let returned: Vec<&PathBuf> = results.iter().map(|(p, _)| p).collect();
        let expected: Vec<PathBuf> = (0..4).map(|i| dir.path().join(format!("{i}.png"))).collect();
        assert_eq!(returned, expected.iter().collect::<Vec<_>>());
        for (path, predictions) in &results {
            assert_eq!(predictions.len(), 2);
            assert_eq!(predictions, &classifier.predict_image(path, 2)?);
        }
        Ok(())
    }

    #[test]
    fn directory_scan_filters_by_extension_and_recurses() -> Result<()> {
        let dir = tempdir()?;
        let nested = dir.path().join("lunch");
        std::fs::create_dir(&nested).map_err(|e| Error::io(&nested, e))?;
        for name in ["b.JPG", "a.png", "notes.txt", "lunch/c.bmp", "lunch/d.gif"] {
            let path = dir.path().join(name);
            std::fs::write(&path, b"").map_err(|e| Error::io(&path, e))?;
        }
        let found = collect_images(dir.path())?;
        let names: Vec<PathBuf> = found
            .iter()
            .filter_map(|p| p.strip_prefix(dir.path()).ok().map(Path::to_path_buf))
            .collect();
        assert_eq!(
            names,
            [
                PathBuf::from("a.png"),
                PathBuf::from("b.JPG"),
                PathBuf::from("lunch/c.bmp")
            ]
        );

        let empty = tempdir()?;
        assert!(matches!(collect_images(empty.path()), Err(Error::NoImages(_))));
        Ok(())
    }

    #[test]
    fn results_file_lists_every_image() -> Result<()> {
        let dir = tempdir()?;
        let image_path = dir.path().join("dinner.png");
        save_png(&image_path, &RgbImage::from_pixel(16, 16, Rgb([1, 2, 3])))?;
        let classifier = Classifier::new(
            VisionTransformer::with_seed(tiny_config(2), 3)?,
            vec!["fries".into(), "hotdog".into()],
        )?;
        let results = classifier.predict_batch(&[image_path.clone()], 8, 3)?;
        let out = dir.path().join("results.txt");
        write_results(&results, &out)?;
        let text = std::fs::read_to_string(&out).map_err(|e| Error::io(&out, e))?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], image_path.display().to_string());
        assert!(lines[1].starts_with("  ") && lines[1].ends_with("%)"));
        assert_eq!(lines[3], "");
        Ok(())
    }
}
