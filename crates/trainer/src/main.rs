use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use tch::Device;

use trainer::{ClipDataset, Trainer, TrainerConfig};
use vitclip_core::{BackboneConfig, ClassifierConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Fine-tune the video CLIP backbone for classification", long_about = None)]
struct Args {
    /// JSON list of {"path", "label"} training clips
    #[arg(long)]
    train_annotations: PathBuf,

    /// Optional validation clips, same format
    #[arg(long)]
    val_annotations: Option<PathBuf>,

    #[arg(long, default_value = "configs/model_config.yaml")]
    model_config: PathBuf,

    #[arg(long, default_value = "configs/training_config.yaml")]
    training_config: PathBuf,

    /// Directory with the pretrained CLIP weights, overrides the model config
    #[arg(long)]
    pretrained: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut backbone_config = if args.model_config.exists() {
        let content = fs::read_to_string(&args.model_config)?;
        BackboneConfig::from_yaml_str(&content)
            .with_context(|| format!("Invalid model config {:?}", args.model_config))?
    } else {
        info!("No model config at {:?}, using ViT-B/16 defaults", args.model_config);
        BackboneConfig::default()
    };
    if let Some(pretrained) = args.pretrained {
        backbone_config.pretrained = Some(pretrained);
    }

    let trainer_config: TrainerConfig = if args.training_config.exists() {
        let content = fs::read_to_string(&args.training_config)?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid training config {:?}", args.training_config))?
    } else {
        TrainerConfig::default()
    };
    trainer_config.validate()?;

    let device = Device::cuda_if_available();
    info!("Using device: {:?}", device);

    let train_set = ClipDataset::load(&args.train_annotations, device)?;
    let val_set = args
        .val_annotations
        .as_deref()
        .map(|p: &Path| ClipDataset::load(p, device))
        .transpose()?;
    info!(
        "Loaded {} training clips, {} validation clips",
        train_set.len(),
        val_set.as_ref().map_or(0, |v| v.len())
    );

    // The label space follows the annotations unless fixed in the config.
    let num_classes = trainer_config
        .num_classes
        .unwrap_or_else(|| train_set.num_classes());
    let model_config = ClassifierConfig {
        backbone: backbone_config,
        num_classes,
        dropout: trainer_config.dropout,
    };

    let mut trainer = Trainer::new(model_config, trainer_config, device)?;
    trainer.train(&train_set, val_set.as_ref())?;

    println!("Training complete!");

    Ok(())
}
