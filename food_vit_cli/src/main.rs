//! Train the food classifier or run it on images.

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgGroup, Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "food-vit")]
#[command(author, version, about = "Vision Transformer food classifier")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model on a class-per-directory image tree
    Train(TrainArgs),

    /// Classify one image or every image in a directory
    Infer(InferArgs),
}

#[derive(Args)]
pub struct TrainArgs {
    /// Root directory with one subdirectory per class
    #[arg(long)]
    pub data_dir: PathBuf,

    /// Where to write the trained weights
    #[arg(long, default_value = "food_classifier.safetensors")]
    pub out: PathBuf,

    /// JSON file with model hyperparameters (defaults to the shipped config)
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub epochs: Option<usize>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Learning rate
    #[arg(long)]
    pub lr: Option<f32>,

    #[arg(long)]
    pub weight_decay: Option<f32>,

    /// Image decoding threads
    #[arg(long)]
    pub workers: Option<usize>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Disable random crop, flip and colour jitter
    #[arg(long)]
    pub no_augment: bool,
}

#[derive(Args)]
#[command(group(ArgGroup::new("input").required(true).multiple(true).args(["img", "img_dir"])))]
pub struct InferArgs {
    /// Trained weights file
    #[arg(long)]
    pub model: PathBuf,

    /// A single image to classify
    #[arg(long)]
    pub img: Option<PathBuf>,

    /// A directory of images to classify recursively
    #[arg(long)]
    pub img_dir: Option<PathBuf>,

    /// Results file for directory mode
    #[arg(long, default_value = "results.txt")]
    pub out: PathBuf,

    #[arg(long, default_value_t = 8)]
    pub batch_size: usize,

    /// Predictions to report per image
    #[arg(long, default_value_t = 3)]
    pub top_k: usize,
}

fn main() -> Result<()> {
    food_vit::logging::init_tracing()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => commands::train::run(&args),
        Commands::Infer(args) => commands::infer::run(&args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infer_requires_an_input() {
        assert!(Cli::try_parse_from(["food-vit", "infer", "--model", "m.safetensors"]).is_err());
    }

    #[test]
    fn infer_defaults_match_the_documented_ones() -> Result<()> {
        let cli = Cli::try_parse_from([
            "food-vit",
            "infer",
            "--model",
            "m.safetensors",
            "--img-dir",
            "photos",
        ])?;
        let Commands::Infer(args) = cli.command else {
            anyhow::bail!("parsed the wrong subcommand");
        };
        assert_eq!(args.out, PathBuf::from("results.txt"));
        assert_eq!(args.batch_size, 8);
        assert_eq!(args.top_k, 3);
        assert!(args.img.is_none());
        Ok(())
    }

    #[test]
    fn train_flags_are_optional_overrides() -> Result<()> {
        let cli = Cli::try_parse_from(["food-vit", "train", "--data-dir", "data", "--lr", "0.001"])?;
        let Commands::Train(args) = cli.command else {
            anyhow::bail!("parsed the wrong subcommand");
        };
        assert_eq!(args.lr, Some(0.001));
        assert_eq!(args.epochs, None);
        assert_eq!(args.out, PathBuf::from("food_classifier.safetensors"));
        Ok(())
    }
}
