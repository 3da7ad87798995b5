use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::TrainConfig;
use crate::cpu_utils::{argmax, log_sum_exp, softmax};
use crate::data::{DataLoader, ImageFolder, LoaderOptions, Preprocessor, TrainAugment, Transform};
use crate::error::{Error, Result};
use crate::model::{Mode, Parameters, VisionTransformer};
use crate::optim::AdamW;

/// Cross-entropy of one logit row against `label`, and its gradient with
/// respect to the logits (`softmax - onehot`).
pub fn cross_entropy(logits: &[f32], label: usize) -> Result<(f32, Vec<f32>)> {
    if label >= logits.len() {
        return Err(Error::Shape(format!(
            "label {label} out of range for {} classes",
            logits.len()
        )));
    }
    let loss = log_sum_exp(logits) - logits[label];
    let mut grad = softmax(logits);
    grad[label] -= 1.0;
    Ok((loss, grad))
}

/// Summary of one pass over the training set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpochStats {
    /// 1-based.
    pub epoch: usize,
    /// Mean of the per-batch mean losses.
    pub loss: f32,
    /// Percentage of samples whose top logit was the label.
    pub accuracy: f32,
    pub samples: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    /// Mean loss over the batch.
    pub loss: f32,
    pub correct: usize,
}

/// Owns the optimizer state and the randomness of a training run.
pub struct Trainer {
    config: TrainConfig,
    optimizer: AdamW,
    mode: Mode,
    shuffle_rng: StdRng,
}

impl Trainer {
    pub fn new(config: TrainConfig) -> Result<Self> {
        config.validate()?;
        Ok(Trainer {
            optimizer: AdamW::from_config(&config),
            mode: Mode::train(config.seed.wrapping_add(1)),
            shuffle_rng: StdRng::seed_from_u64(config.seed),
            config,
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn optimizer(&self) -> &AdamW {
        &self.optimizer
    }

    /// One optimisation step on a batch: zero grads, forward and backward
    /// every sample with dropout active, then a single AdamW update.
    pub fn train_step<T: AsRef<[f32]>>(
        &mut self,
        model: &mut VisionTransformer,
        images: &[T],
        labels: &[usize],
    ) -> Result<StepOutput> {
        if images.is_empty() {
            return Err(Error::EmptyBatch);
        }
        if images.len() != labels.len() {
            return Err(Error::Shape(format!(
                "{} images but {} labels",
                images.len(),
                labels.len()
            )));
        }
        let scale = 1.0 / images.len() as f32;
        model.zero_grad();
        let mut total_loss = 0.0;
        let mut correct = 0;
        for (image, &label) in images.iter().zip(labels) {
            let (logits, cache) = model.forward_train(image.as_ref(), &mut self.mode)?;
            let (loss, mut grad) = cross_entropy(&logits, label)?;
            if argmax(&logits) == label {
                correct += 1;
            }
            total_loss += loss;
            grad.iter_mut().for_each(|g| *g *= scale);
            model.backward(&cache, &grad)?;
        }
        self.optimizer.step(model);
        Ok(StepOutput {
            loss: total_loss * scale,
            correct,
        })
    }

    /// Train on every batch `loader` yields for one epoch.
    pub fn train_epoch(
        &mut self,
        model: &mut VisionTransformer,
        loader: &DataLoader,
        epoch: usize,
    ) -> Result<EpochStats> {
        let mut loss_sum = 0.0;
        let mut batches = 0usize;
        let mut correct = 0usize;
        let mut samples = 0usize;
        for batch in loader.epoch(&mut self.shuffle_rng)? {
            let batch = batch?;
            let step = self.train_step(model, &batch.images, &batch.labels)?;
            debug!(epoch, batch = batches, loss = step.loss, "train step");
            loss_sum += step.loss;
            batches += 1;
            correct += step.correct;
            samples += batch.len();
        }
        if batches == 0 {
            return Err(Error::Dataset("epoch produced no batches".into()));
        }
        let stats = EpochStats {
            epoch,
            loss: loss_sum / batches as f32,
            accuracy: 100.0 * correct as f32 / samples as f32,
            samples,
        };
        info!(
            "Epoch: {}, Loss: {:.4}, Acc: {:.2}%",
            stats.epoch, stats.loss, stats.accuracy
        );
        Ok(stats)
    }

    /// Run `config.epochs` epochs over `dataset`. The model head must have
    /// one output per dataset class.
    pub fn fit(
        &mut self,
        model: &mut VisionTransformer,
        dataset: &ImageFolder,
    ) -> Result<Vec<EpochStats>> {
        if dataset.classes().len() != model.num_classes() {
            return Err(Error::InvalidConfig(format!(
                "dataset has {} classes but the model head has {}",
                dataset.classes().len(),
                model.num_classes()
            )));
        }
        let transform = if self.config.augment {
            Transform::Train(TrainAugment::new(model.config()))
        } else {
            Transform::Eval(Preprocessor::new(model.config()))
        };
        let loader = DataLoader::new(
            dataset.samples().to_vec(),
            transform,
            LoaderOptions {
                batch_size: self.config.batch_size,
                num_workers: self.config.num_workers,
                prefetch: self.config.prefetch,
                shuffle: true,
            },
        )?;
        info!(
            samples = loader.num_samples(),
            batches = loader.num_batches(),
            epochs = self.config.epochs,
            params = model.num_params(),
            "starting training"
        );
        (1..=self.config.epochs)
            .map(|epoch| self.train_epoch(model, &loader, epoch))
            .collect()
    }
}
