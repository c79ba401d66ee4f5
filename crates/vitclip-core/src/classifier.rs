use serde::{Deserialize, Serialize};
use tch::{nn, Tensor};

use crate::backbone::ViTClip;
use crate::config::BackboneConfig;
use crate::error::{BackboneError, Result};
use crate::head::I3DHead;
use crate::safetensors_util::LoadReport;

pub const BACKBONE_PREFIX: &str = "backbone";
pub const HEAD_PREFIX: &str = "cls_head";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub backbone: BackboneConfig,
    pub num_classes: i64,
    /// Dropout before the classifier layer.
    #[serde(default = "default_head_dropout")]
    pub dropout: f64,
}

fn default_head_dropout() -> f64 {
    0.5
}

/// Backbone plus classification head, sharing one `VarStore`.
pub struct VideoClassifier {
    pub backbone: ViTClip,
    head: I3DHead,
    pub config: ClassifierConfig,
}

impl VideoClassifier {
    pub fn new(vs: &nn::VarStore, config: &ClassifierConfig) -> Result<Self> {
        if config.num_classes <= 0 {
            return Err(BackboneError::InvalidConfig(format!(
                "num_classes must be positive, got {}",
                config.num_classes
            )));
        }
        let backbone = ViTClip::new(vs, BACKBONE_PREFIX, &config.backbone)?;
        let head = I3DHead::new(
            &(vs.root() / HEAD_PREFIX),
            backbone.feature_dim(),
            config.num_classes,
            config.backbone.num_frames,
            config.dropout,
        );
        Ok(Self {
            backbone,
            head,
            config: config.clone(),
        })
    }

    /// Initialises the backbone; the head keeps its own init and stays trainable.
    pub fn init_weights(&self, vs: &nn::VarStore) -> Result<LoadReport> {
        self.backbone.init_weights(vs)
    }

    /// x: [B, C, T, H, W] -> [B * T, D, 1, 1, 1]
    pub fn features(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        self.backbone.forward(x, train)
    }

    /// x: [B, C, T, H, W] -> logits [B, num_classes]
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let feats = self.features(x, train)?;
        self.head.forward(&feats, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdaptationType;
    use crate::init::variables_under;
    use tch::{Device, Kind};

    fn tiny_config() -> ClassifierConfig {
        let mut backbone = BackboneConfig::vit_b16(2);
        backbone.input_resolution = 32;
        backbone.width = 16;
        backbone.layers = 1;
        backbone.heads = 2;
        ClassifierConfig {
            backbone,
            num_classes: 3,
            dropout: 0.0,
        }
    }

    #[test]
    fn logits_per_clip() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = VideoClassifier::new(&vs, &tiny_config()).unwrap();
        model.init_weights(&vs).unwrap();
        let x = Tensor::randn([2, 3, 2, 32, 32], (Kind::Float, Device::Cpu));
        assert_eq!(model.forward(&x, false).unwrap().size(), vec![2, 3]);
        assert_eq!(model.features(&x, false).unwrap().size(), vec![4, 16, 1, 1, 1]);
    }

    #[test]
    fn head_stays_trainable_after_freezing() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = VideoClassifier::new(&vs, &tiny_config()).unwrap();
        model.init_weights(&vs).unwrap();
        for (name, var) in variables_under(&vs, HEAD_PREFIX) {
            assert!(var.requires_grad(), "{}", name);
        }
        assert!(!vs.variables()["backbone.conv1.weight"].requires_grad());
    }

    #[test]
    fn config_survives_json() {
        let mut cfg = tiny_config();
        cfg.backbone.adaptation_type = AdaptationType::ClassToken;
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ClassifierConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.backbone.adaptation_type, AdaptationType::ClassToken);
        assert_eq!(back.num_classes, 3);
    }

    #[test]
    fn rejects_empty_label_space() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut cfg = tiny_config();
        cfg.num_classes = 0;
        assert!(matches!(
            VideoClassifier::new(&vs, &cfg),
            Err(BackboneError::InvalidConfig(_))
        ));
    }
}
