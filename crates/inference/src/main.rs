use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tch::Device;
use tracing::info;

use inference::{load_classifier, FeatureExtractor};
use vitclip_core::safetensors_util::read_tensors;

#[derive(Parser, Debug)]
#[command(author, version, about = "Extract video features and class scores", long_about = None)]
struct Args {
    /// Directory with config.json and .safetensors checkpoints
    #[arg(long, default_value = "checkpoints")]
    checkpoint_dir: PathBuf,

    /// Safetensors file holding a `clip` tensor, [C, T, H, W] or [B, C, T, H, W]
    #[arg(long)]
    clip: PathBuf,

    /// Where to write `features` and `logits`
    #[arg(long)]
    output: PathBuf,

    #[arg(long, default_value_t = 5)]
    top_k: i64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let device = Device::cuda_if_available();
    info!("Using device: {:?}", device);

    let (_vs, model) = load_classifier(&args.checkpoint_dir, device)?;
    let extractor = FeatureExtractor::new(model);

    let clip = read_tensors(&args.clip)
        .with_context(|| format!("Failed to read {:?}", args.clip))?
        .into_iter()
        .find(|(name, _)| name == "clip")
        .map(|(_, t)| t.to(device))
        .ok_or_else(|| anyhow!("{:?} has no `clip` tensor", args.clip))?;

    let features = extractor.features(&clip)?;
    let logits = extractor.logits(&clip)?;
    for (i, preds) in extractor.classify(&clip, args.top_k)?.iter().enumerate() {
        for p in preds {
            info!("clip {} | class {} | p={:.4}", i, p.label, p.score);
        }
    }

    tch::Tensor::write_safetensors(
        &[
            ("features", features.to_device(Device::Cpu)),
            ("logits", logits.to_device(Device::Cpu)),
        ],
        &args.output,
    )?;
    info!("Wrote features {:?} to {:?}", features.size(), args.output);

    Ok(())
}
