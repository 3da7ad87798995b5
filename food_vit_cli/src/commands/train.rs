//! Train command implementation.

use anyhow::{Context, Result};
use food_vit::{ImageFolder, TrainConfig, Trainer, VisionTransformer, VitConfig, weights};
use tracing::info;

use crate::TrainArgs;

/// Apply command-line overrides on top of the defaults.
fn train_config(args: &TrainArgs) -> TrainConfig {
    let defaults = TrainConfig::default();
    TrainConfig {
        epochs: args.epochs.unwrap_or(defaults.epochs),
        batch_size: args.batch_size.unwrap_or(defaults.batch_size),
        learning_rate: args.lr.unwrap_or(defaults.learning_rate),
        weight_decay: args.weight_decay.unwrap_or(defaults.weight_decay),
        num_workers: args.workers.unwrap_or(defaults.num_workers),
        seed: args.seed.unwrap_or(defaults.seed),
        augment: !args.no_augment,
        ..defaults
    }
}

pub fn run(args: &TrainArgs) -> Result<()> {
    let dataset = ImageFolder::open(&args.data_dir)
        .with_context(|| format!("failed to open dataset at {}", args.data_dir.display()))?;

    let mut vit_config = match &args.config {
        Some(path) => VitConfig::from_json_file(path)
            .with_context(|| format!("failed to read model config {}", path.display()))?,
        None => VitConfig::default(),
    };
    // the head is sized by the classes actually present
    vit_config.num_classes = dataset.classes().len();

    let config = train_config(args);
    let mut model = VisionTransformer::with_seed(vit_config, config.seed)?;
    let mut trainer = Trainer::new(config)?;
    let stats = trainer.fit(&mut model, &dataset)?;

    weights::save(&model, dataset.classes(), &args.out)
        .with_context(|| format!("failed to save weights to {}", args.out.display()))?;
    if let Some(last) = stats.last() {
        info!(
            epochs = stats.len(),
            loss = last.loss,
            accuracy = last.accuracy,
            "training finished"
        );
    }
    println!("Model saved to {}", args.out.display());
    Ok(())
}
