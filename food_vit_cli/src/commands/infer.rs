//! Infer command implementation.

use anyhow::{Context, Result, bail};
use food_vit::inference::format_prediction;
use food_vit::{Classifier, collect_images, write_results};

use crate::InferArgs;

pub fn run(args: &InferArgs) -> Result<()> {
    if args.batch_size == 0 || args.top_k == 0 {
        bail!("--batch-size and --top-k must be positive");
    }
    let classifier = Classifier::load(&args.model)
        .with_context(|| format!("failed to load model {}", args.model.display()))?;

    if let Some(img) = &args.img {
        let predictions = classifier
            .predict_image(img, args.top_k)
            .with_context(|| format!("failed to classify {}", img.display()))?;
        println!("Predictions for {}:", img.display());
        for prediction in &predictions {
            println!("  {}", format_prediction(prediction));
        }
    }

    if let Some(dir) = &args.img_dir {
        let paths = collect_images(dir)?;
        println!("Found {} images in {}", paths.len(), dir.display());
        let results = classifier.predict_batch(&paths, args.batch_size, args.top_k)?;
        write_results(&results, &args.out)?;
        println!(
            "Classified {} of {} images, results saved to {}",
            results.len(),
            paths.len(),
            args.out.display()
        );
    }
    Ok(())
}
