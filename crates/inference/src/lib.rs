use anyhow::{Context, Result};
use tch::{nn, Device};
use tracing::{info, warn};

use vitclip_core::safetensors_util::load_safetensors;
use vitclip_core::{ClassifierConfig, VideoClassifier};

pub mod extractor;

pub use extractor::{FeatureExtractor, Prediction};

/// Rebuilds the classifier described by `config.json` in `dir` and loads the
/// latest `.safetensors` checkpoint found next to it.
pub fn load_classifier(dir: &std::path::Path, device: Device) -> Result<(nn::VarStore, VideoClassifier)> {
    let config_path = dir.join("config.json");

    // 1. Load Config
    let config_str = std::fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read model config.json at {:?}", config_path))?;
    let config: ClassifierConfig = serde_json::from_str(&config_str)
        .context("Failed to parse model config.json")?;

    // 2. Find latest checkpoint
    let mut checkpoint_path = None;
    if let Ok(entries) = std::fs::read_dir(dir) {
        let mut checkpoints: Vec<_> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map_or(false, |ext| ext == "safetensors"))
            .collect();

        checkpoints.sort();
        checkpoint_path = checkpoints.pop();
    }

    // 3. Initialize Model
    let vs = nn::VarStore::new(device);
    let model = VideoClassifier::new(&vs, &config)?;

    if let Some(path) = checkpoint_path {
        info!("Loading weights from {:?}", path);
        let report = load_safetensors(&vs, &path)
            .context("Failed to load safetensors checkpoint")?;
        if !report.missing.is_empty() {
            warn!("Checkpoint is missing {} variables: {:?}", report.missing.len(), report.missing);
        }
    } else {
        warn!("No .safetensors checkpoint found in {:?}. Using random weights.", dir);
    }

    Ok((vs, model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Kind, Tensor};
    use vitclip_core::safetensors_util::save_safetensors;
    use vitclip_core::BackboneConfig;

    pub(crate) fn tiny_config() -> ClassifierConfig {
        let mut backbone = BackboneConfig::vit_b16(2);
        backbone.input_resolution = 32;
        backbone.width = 16;
        backbone.layers = 1;
        backbone.heads = 2;
        ClassifierConfig {
            backbone,
            num_classes: 4,
            dropout: 0.5,
        }
    }

    #[test]
    fn restores_the_latest_checkpoint() {
        let dir = std::env::temp_dir().join(format!("vitclip-load-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let config = tiny_config();
        std::fs::write(dir.join("config.json"), serde_json::to_string(&config).unwrap()).unwrap();

        let vs = nn::VarStore::new(Device::Cpu);
        let model = VideoClassifier::new(&vs, &config).unwrap();
        save_safetensors(&vs, dir.join("checkpoint_epoch_0000.safetensors")).unwrap();
        tch::no_grad(|| {
            let _ = vs.variables().get_mut("cls_head.fc_cls.bias").unwrap().fill_(3.0);
        });
        save_safetensors(&vs, dir.join("checkpoint_epoch_0001.safetensors")).unwrap();

        let (loaded_vs, loaded) = load_classifier(&dir, Device::Cpu).unwrap();
        std::fs::remove_dir_all(&dir).ok();

        assert_eq!(loaded_vs.variables()["cls_head.fc_cls.bias"].double_value(&[0]), 3.0);
        let x = Tensor::randn([1, 3, 2, 32, 32], (Kind::Float, Device::Cpu));
        let a = model.forward(&x, false).unwrap();
        let b = loaded.forward(&x, false).unwrap();
        assert!(a.allclose(&b, 1e-5, 1e-5, false));
    }

    #[test]
    fn missing_config_is_an_error() {
        let dir = std::env::temp_dir().join("vitclip-no-config-here");
        assert!(load_classifier(&dir, Device::Cpu).is_err());
    }
}
