use log::{info, warn};
use tch::{nn, Tensor};

use crate::config::{AdaptationType, BackboneConfig};
use crate::error::{BackboneError, Result};
use crate::init::{default_init, freeze_except, parameter_counts, variables_under};
use crate::layer_norm::LayerNorm;
use crate::pooler::AttentivePooler;
use crate::safetensors_util::{load_partial, read_tensors, LoadReport};
use crate::transformer::Transformer;

/// Parameters left trainable by the freezing policy, matched as name substrings.
pub const TRAINABLE_MARKERS: &[&str] = &["temporal_embedding", "ln_post", "attentive_pooler"];

const LINEAR_INIT_STD: f64 = 0.02;

/// Pretrained CLIP visual encoder picked by depth: (name, weights file).
pub fn pretrained_variant(layers: i64) -> (&'static str, &'static str) {
    if layers == 12 {
        ("ViT-B/16", "ViT-B-16.safetensors")
    } else {
        ("ViT-L/14", "ViT-L-14.safetensors")
    }
}

/// The CLIP image encoder, applied frame by frame with a learned temporal
/// embedding added between the positional embedding and `ln_pre`.
pub struct ViTClip {
    conv1: nn::Conv2D,
    class_embedding: Tensor,
    positional_embedding: Tensor,
    ln_pre: LayerNorm,
    temporal_embedding: Tensor,
    transformer: Transformer,
    ln_post: LayerNorm,
    attentive_pooler: Option<AttentivePooler>,
    prefix: String,
    pub config: BackboneConfig,
}

impl ViTClip {
    /// Registers the backbone's variables under `prefix` ("" for the store root).
    pub fn new(vs: &nn::VarStore, prefix: &str, config: &BackboneConfig) -> Result<Self> {
        config.validate()?;
        if config.adaptation_type == AdaptationType::Adapter {
            return Err(BackboneError::Unimplemented("adapter".to_string()));
        }

        let root = prefix
            .split('.')
            .filter(|c| !c.is_empty())
            .fold(vs.root(), |p, c| p.sub(c));
        let width = config.width;
        let eps = config.layer_norm_epsilon;

        let conv_config = nn::ConvConfig {
            stride: config.patch_size,
            bias: false,
            ..Default::default()
        };
        let conv1 = nn::conv2d(&root / "conv1", 3, width, config.patch_size, conv_config);

        let scale = (width as f64).powf(-0.5);
        let class_embedding = root.var(
            "class_embedding",
            &[width],
            nn::Init::Randn { mean: 0.0, stdev: scale },
        );
        let positional_embedding = root.var(
            "positional_embedding",
            &[config.num_patches() + 1, width],
            nn::Init::Randn { mean: 0.0, stdev: scale },
        );
        let ln_pre = LayerNorm::new(&(&root / "ln_pre"), width, eps);

        let temporal_embedding = root.var(
            "temporal_embedding",
            &[1, config.num_frames, width],
            nn::Init::Const(0.0),
        );

        let transformer = Transformer::new(
            &(&root / "transformer"),
            width,
            config.layers,
            config.heads,
            eps,
        );
        let ln_post = LayerNorm::new(&(&root / "ln_post"), width, eps);

        let attentive_pooler = match config.adaptation_type {
            AdaptationType::FrozenTuning => Some(AttentivePooler::new(
                &(&root / "attentive_pooler"),
                width,
                config.heads,
                &config.pooler,
            )),
            _ => None,
        };

        Ok(Self {
            conv1,
            class_embedding,
            positional_embedding,
            ln_pre,
            temporal_embedding,
            transformer,
            ln_post,
            attentive_pooler,
            prefix: prefix.to_string(),
            config: config.clone(),
        })
    }

    pub fn feature_dim(&self) -> i64 {
        self.config.width
    }

    /// Initialises or loads the weights, then applies the freezing policy.
    pub fn init_weights(&self, vs: &nn::VarStore) -> Result<LoadReport> {
        let report = match &self.config.pretrained {
            Some(dir) => {
                let (variant, file) = pretrained_variant(self.config.layers);
                let path = dir.join(file);
                if !path.is_file() {
                    return Err(BackboneError::MissingWeights(path));
                }

                default_init(vs, &self.prefix, LINEAR_INIT_STD);
                info!("load model from: {} clip {}", dir.display(), variant);
                let report = load_partial(vs, &self.prefix, visual_encoder_weights(read_tensors(&path)?))?;
                info!("Missing keys: {:?}", report.missing);
                info!("Unexpected keys: {:?}", report.unexpected);
                info!("=> loaded successfully '{}'", path.display());
                report
            }
            None => {
                warn!("You should load pretrained!!!");
                default_init(vs, &self.prefix, LINEAR_INIT_STD);
                LoadReport::default()
            }
        };

        self.apply_freeze_policy(vs);

        for (name, var) in variables_under(vs, &self.prefix) {
            info!("{}: {}", name, var.requires_grad());
        }
        let (total, tunable) = parameter_counts(vs, &self.prefix);
        info!(
            "Number of total parameters: {}, tunable parameters: {}",
            total, tunable
        );
        Ok(report)
    }

    /// Names of the variables left trainable.
    pub fn apply_freeze_policy(&self, vs: &nn::VarStore) -> Vec<String> {
        if self.config.frozen {
            freeze_except(vs, &self.prefix, TRAINABLE_MARKERS)
        } else {
            freeze_except(vs, &self.prefix, &[""])
        }
    }

    /// x: [B, C, T, H, W] -> [B * T, width, 1, 1, 1]
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let size = x.size();
        let [b, c, t, h, w] = <[i64; 5]>::try_from(size.as_slice())
            .map_err(|_| BackboneError::Shape(format!("expected [B, C, T, H, W], got {:?}", size)))?;
        if t != self.config.num_frames {
            return Err(BackboneError::FrameMismatch {
                expected: self.config.num_frames,
                got: t,
            });
        }
        let p = self.config.patch_size;
        let tokens = (h / p) * (w / p);
        if c != 3 || tokens + 1 != self.positional_embedding.size()[0] {
            return Err(BackboneError::Shape(format!(
                "clip {:?} does not fit 3 channels and {} patches of {}x{}",
                size,
                self.config.num_patches(),
                p,
                p
            )));
        }
        let d = self.config.width;

        // b c t h w -> (b t) c h w
        let x = x.permute([0, 2, 1, 3, 4]).reshape([b * t, c, h, w]);
        let x = x.apply(&self.conv1);
        let kind = x.kind();
        let x = x.reshape([b * t, d, -1]).permute([0, 2, 1]);

        let cls = self.class_embedding.to_kind(kind)
            + Tensor::zeros([b * t, 1, d], (kind, x.device()));
        let x = Tensor::cat(&[cls, x], 1);
        let x = x + self.positional_embedding.to_kind(kind);

        // (b t) n d -> (b n) t d
        let n = x.size()[1];
        let x = x.reshape([b, t, n, d]).permute([0, 2, 1, 3]).reshape([b * n, t, d]);
        let x = x + self.temporal_embedding.to_kind(kind);
        // (b n) t d -> (b t) n d
        let x = x.reshape([b, n, t, d]).permute([0, 2, 1, 3]).reshape([b * t, n, d]);
        let x = self.ln_pre.forward(&x);

        // NLD -> LND
        let x = self.transformer.forward(&x.permute([1, 0, 2]), train);
        let x = self.ln_post.forward(&x);

        let x = match &self.attentive_pooler {
            Some(pooler) => pooler.forward(&x.permute([1, 0, 2]), train).select(1, 0),
            None => x.get(0),
        };

        Ok(x.unsqueeze(-1).unsqueeze(-1).unsqueeze(-1))
    }
}

/// Keeps the `visual.` entries of a full CLIP checkpoint (all entries if there
/// is no such prefix) and drops the image-text projection.
fn visual_encoder_weights(tensors: Vec<(String, Tensor)>) -> Vec<(String, Tensor)> {
    let has_visual_prefix = tensors.iter().any(|(name, _)| name.starts_with("visual."));
    tensors
        .into_iter()
        .filter_map(|(name, t)| {
            let name = if has_visual_prefix {
                name.strip_prefix("visual.")?.to_string()
            } else {
                name
            };
            (name != "proj").then_some((name, t))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttentivePoolerConfig;
    use tch::{Device, Kind};

    fn tiny(adaptation_type: AdaptationType) -> BackboneConfig {
        BackboneConfig {
            input_resolution: 32,
            num_frames: 4,
            patch_size: 16,
            width: 32,
            layers: 2,
            heads: 4,
            pretrained: None,
            frozen: true,
            adaptation_type,
            pooler: AttentivePoolerConfig::default(),
            layer_norm_epsilon: 1e-5,
        }
    }

    fn clip(b: i64) -> Tensor {
        Tensor::randn([b, 3, 4, 32, 32], (Kind::Float, Device::Cpu))
    }

    #[test]
    fn forward_returns_one_feature_per_frame() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = ViTClip::new(&vs, "", &tiny(AdaptationType::FrozenTuning)).unwrap();
        let y = model.forward(&clip(2), false).unwrap();
        assert_eq!(y.size(), vec![8, 32, 1, 1, 1]);
    }

    #[test]
    fn class_token_readout_has_no_pooler() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = ViTClip::new(&vs, "backbone", &tiny(AdaptationType::ClassToken)).unwrap();
        assert!(vs.variables().keys().all(|k| !k.contains("attentive_pooler")));
        assert!(vs.variables().contains_key("backbone.transformer.resblocks.1.attn.in_proj_weight"));
        let y = model.forward(&clip(1), false).unwrap();
        assert_eq!(y.size(), vec![4, 32, 1, 1, 1]);
    }

    #[test]
    fn adapter_is_not_implemented() {
        let vs = nn::VarStore::new(Device::Cpu);
        let err = ViTClip::new(&vs, "", &tiny(AdaptationType::Adapter)).err().unwrap();
        assert!(matches!(err, BackboneError::Unimplemented(_)));
    }

    #[test]
    fn rejects_wrong_frame_count_and_rank() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = ViTClip::new(&vs, "", &tiny(AdaptationType::FrozenTuning)).unwrap();
        let x = Tensor::randn([1, 3, 5, 32, 32], (Kind::Float, Device::Cpu));
        assert!(matches!(
            model.forward(&x, false),
            Err(BackboneError::FrameMismatch { expected: 4, got: 5 })
        ));
        let x = Tensor::randn([3, 32, 32], (Kind::Float, Device::Cpu));
        assert!(matches!(model.forward(&x, false), Err(BackboneError::Shape(_))));
        let x = Tensor::randn([1, 3, 4, 48, 48], (Kind::Float, Device::Cpu));
        assert!(matches!(model.forward(&x, false), Err(BackboneError::Shape(_))));
    }

    #[test]
    fn frames_stay_in_clip_major_order() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = ViTClip::new(&vs, "", &tiny(AdaptationType::ClassToken)).unwrap();
        let x = clip(2);
        let both = model.forward(&x, false).unwrap();
        let second = model.forward(&x.narrow(0, 1, 1), false).unwrap();
        assert!(both.narrow(0, 4, 4).allclose(&second, 1e-4, 1e-4, false));
    }

    #[test]
    fn temporal_embedding_is_added_per_frame() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = ViTClip::new(&vs, "", &tiny(AdaptationType::ClassToken)).unwrap();
        let frame = Tensor::randn([1, 3, 1, 32, 32], (Kind::Float, Device::Cpu));
        let x = frame.repeat([1, 1, 4, 1, 1]);

        let y = model.forward(&x, false).unwrap();
        assert!(y.get(0).allclose(&y.get(3), 1e-5, 1e-5, false));

        tch::no_grad(|| {
            let _ = vs.variables()["temporal_embedding"].narrow(1, 3, 1).fill_(1.0);
        });
        let y = model.forward(&x, false).unwrap();
        assert!(y.get(0).allclose(&y.get(1), 1e-5, 1e-5, false));
        assert!(!y.get(0).allclose(&y.get(3), 1e-5, 1e-5, false));
    }

    #[test]
    fn freezing_leaves_only_the_temporal_and_pooling_parameters() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = ViTClip::new(&vs, "", &tiny(AdaptationType::FrozenTuning)).unwrap();
        let report = model.init_weights(&vs).unwrap();
        assert_eq!(report, LoadReport::default());

        for (name, var) in vs.variables() {
            let expected = TRAINABLE_MARKERS.iter().any(|m| name.contains(m));
            assert_eq!(var.requires_grad(), expected, "{}", name);
        }

        let loss = model.forward(&clip(1), true).unwrap().sum(Kind::Float);
        loss.backward();
        let vars = vs.variables();
        assert!(vars["temporal_embedding"].grad().defined());
        assert!(!vars["conv1.weight"].grad().defined());
    }

    #[test]
    fn unfrozen_backbone_trains_everything() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut cfg = tiny(AdaptationType::FrozenTuning);
        cfg.frozen = false;
        let model = ViTClip::new(&vs, "", &cfg).unwrap();
        model.init_weights(&vs).unwrap();
        let (total, tunable) = parameter_counts(&vs, "");
        assert_eq!(total, tunable);
    }

    #[test]
    fn default_init_resets_linears_and_norms() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = ViTClip::new(&vs, "", &tiny(AdaptationType::ClassToken)).unwrap();
        model.init_weights(&vs).unwrap();
        let vars = vs.variables();
        let bias = &vars["transformer.resblocks.0.mlp.c_fc.bias"];
        assert_eq!(bias.abs().sum(Kind::Float).double_value(&[]), 0.0);
        let ln = &vars["ln_pre.weight"];
        assert!(ln.eq(1.0).all().int64_value(&[]) == 1);
    }

    #[test]
    fn loads_pretrained_visual_weights_by_depth() {
        let dir = std::env::temp_dir().join(format!("vitclip-pretrained-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let conv = Tensor::ones([32, 3, 16, 16], (Kind::Float, Device::Cpu)) * 0.5;
        let named = vec![
            ("visual.conv1.weight".to_string(), conv.shallow_clone()),
            ("visual.proj".to_string(), Tensor::zeros([32, 16], (Kind::Float, Device::Cpu))),
            ("visual.some_extra".to_string(), Tensor::zeros([2], (Kind::Float, Device::Cpu))),
            ("token_embedding.weight".to_string(), Tensor::zeros([4, 8], (Kind::Float, Device::Cpu))),
        ];
        // two layers: the ViT-L/14 file is picked
        Tensor::write_safetensors(&named, dir.join("ViT-L-14.safetensors")).unwrap();

        let vs = nn::VarStore::new(Device::Cpu);
        let mut cfg = tiny(AdaptationType::FrozenTuning);
        cfg.pretrained = Some(dir.clone());
        let model = ViTClip::new(&vs, "backbone", &cfg).unwrap();
        let report = model.init_weights(&vs).unwrap();
        std::fs::remove_dir_all(&dir).ok();

        assert_eq!(report.loaded, vec!["backbone.conv1.weight".to_string()]);
        assert_eq!(report.unexpected, vec!["some_extra".to_string()]);
        assert!(report.missing.contains(&"backbone.temporal_embedding".to_string()));
        assert!(vs.variables()["backbone.conv1.weight"].equal(&conv));
    }

    #[test]
    fn missing_pretrained_file_is_reported() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut cfg = tiny(AdaptationType::FrozenTuning);
        cfg.layers = 12;
        cfg.pretrained = Some(std::env::temp_dir().join("vitclip-no-such-dir"));
        let model = ViTClip::new(&vs, "", &cfg).unwrap();
        tch::no_grad(|| {
            let _ = vs.variables().get_mut("ln_pre.bias").unwrap().fill_(3.0);
        });
        match model.init_weights(&vs) {
            Err(BackboneError::MissingWeights(path)) => {
                assert!(path.ends_with("ViT-B-16.safetensors"))
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        // a failed load leaves the store as it was
        let vars = vs.variables();
        assert!(vars["ln_pre.bias"].eq(3.0).all().int64_value(&[]) == 1);
        assert!(vars["conv1.weight"].requires_grad());
    }
}
