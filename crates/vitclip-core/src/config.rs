use std::fmt;
use std::path::PathBuf;

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};

use crate::error::{BackboneError, Result};

const PRETRAINED_TYPE_ERROR: &str = "pretrained must be a str or None";

/// How the pretrained encoder is adapted to video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationType {
    /// Frozen encoder, learned temporal embedding and an attentive pooling head.
    FrozenTuning,
    /// Bottleneck adapters inside the encoder. Not implemented.
    Adapter,
    /// Frozen encoder read out through the class token.
    ClassToken,
}

impl Default for AdaptationType {
    fn default() -> Self {
        AdaptationType::FrozenTuning
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentivePoolerConfig {
    /// Number of learned query tokens.
    pub num_queries: i64,
    /// Hidden width of the MLPs, relative to the embedding dim.
    pub mlp_ratio: f64,
    /// One cross-attention block plus `depth - 1` self-attention blocks.
    pub depth: i64,
    pub qkv_bias: bool,
    /// Standard deviation of the truncated normal used for queries and linears.
    pub init_std: f64,
    pub layer_norm_epsilon: f64,
}

impl Default for AttentivePoolerConfig {
    fn default() -> Self {
        Self {
            num_queries: 1,
            mlp_ratio: 4.0,
            depth: 1,
            qkv_bias: true,
            init_std: 0.02,
            layer_norm_epsilon: 1e-6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackboneConfig {
    /// Side length of the square input frames.
    pub input_resolution: i64,
    /// Frames per clip. Inputs with a different temporal length are rejected.
    pub num_frames: i64,
    pub patch_size: i64,
    /// Token embedding dimension.
    pub width: i64,
    /// Number of residual attention blocks.
    pub layers: i64,
    pub heads: i64,
    /// Directory holding the pretrained CLIP weights.
    #[serde(default, deserialize_with = "deserialize_pretrained")]
    pub pretrained: Option<PathBuf>,
    /// Restrict training to the temporal embedding, `ln_post` and the pooler.
    /// `false` leaves every backbone parameter trainable for full fine-tuning;
    /// the freezing policy is then skipped entirely.
    #[serde(default = "default_frozen")]
    pub frozen: bool,
    #[serde(default)]
    pub adaptation_type: AdaptationType,
    #[serde(default)]
    pub pooler: AttentivePoolerConfig,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
}

fn default_frozen() -> bool {
    true
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self::vit_b16(8)
    }
}

impl BackboneConfig {
    /// CLIP ViT-B/16 visual encoder.
    pub fn vit_b16(num_frames: i64) -> Self {
        Self {
            input_resolution: 224,
            num_frames,
            patch_size: 16,
            width: 768,
            layers: 12,
            heads: 12,
            pretrained: None,
            frozen: true,
            adaptation_type: AdaptationType::FrozenTuning,
            pooler: AttentivePoolerConfig::default(),
            layer_norm_epsilon: default_layer_norm_epsilon(),
        }
    }

    /// CLIP ViT-L/14 visual encoder.
    pub fn vit_l14(num_frames: i64) -> Self {
        Self {
            patch_size: 14,
            width: 1024,
            layers: 24,
            heads: 16,
            ..Self::vit_b16(num_frames)
        }
    }

    pub fn grid_size(&self) -> i64 {
        self.input_resolution / self.patch_size
    }

    pub fn num_patches(&self) -> i64 {
        self.grid_size() * self.grid_size()
    }

    pub fn head_dim(&self) -> i64 {
        self.width / self.heads
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("input_resolution", self.input_resolution),
            ("num_frames", self.num_frames),
            ("patch_size", self.patch_size),
            ("width", self.width),
            ("layers", self.layers),
            ("heads", self.heads),
            ("pooler.num_queries", self.pooler.num_queries),
            ("pooler.depth", self.pooler.depth),
        ];
        for (name, value) in sizes {
            if value <= 0 {
                return Err(BackboneError::InvalidConfig(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        if self.input_resolution % self.patch_size != 0 {
            return Err(BackboneError::InvalidConfig(format!(
                "input_resolution {} is not divisible by patch_size {}",
                self.input_resolution, self.patch_size
            )));
        }
        if self.width % self.heads != 0 {
            return Err(BackboneError::InvalidConfig(format!(
                "width {} is not divisible by heads {}",
                self.width, self.heads
            )));
        }
        if self.pooler.mlp_ratio <= 0.0 {
            return Err(BackboneError::InvalidConfig(
                "pooler.mlp_ratio must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s).map_err(|e| config_error(e.to_string()))
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| config_error(e.to_string()))
    }
}

fn config_error(msg: String) -> BackboneError {
    if msg.contains(PRETRAINED_TYPE_ERROR) {
        BackboneError::InvalidPretrained
    } else {
        BackboneError::InvalidConfig(msg)
    }
}

/// Accepts a string path or null; anything else is a type error.
fn deserialize_pretrained<'de, D>(deserializer: D) -> std::result::Result<Option<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    struct PretrainedVisitor;

    impl<'de> Visitor<'de> for PretrainedVisitor {
        type Value = Option<PathBuf>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a path string or null")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
            Ok(Some(PathBuf::from(v)))
        }

        fn visit_none<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D2: Deserializer<'de>>(
            self,
            deserializer: D2,
        ) -> std::result::Result<Self::Value, D2::Error> {
            deserializer.deserialize_any(PretrainedVisitor)
        }

        fn visit_bool<E: de::Error>(self, _: bool) -> std::result::Result<Self::Value, E> {
            Err(E::custom(PRETRAINED_TYPE_ERROR))
        }

        fn visit_i64<E: de::Error>(self, _: i64) -> std::result::Result<Self::Value, E> {
            Err(E::custom(PRETRAINED_TYPE_ERROR))
        }

        fn visit_u64<E: de::Error>(self, _: u64) -> std::result::Result<Self::Value, E> {
            Err(E::custom(PRETRAINED_TYPE_ERROR))
        }

        fn visit_f64<E: de::Error>(self, _: f64) -> std::result::Result<Self::Value, E> {
            Err(E::custom(PRETRAINED_TYPE_ERROR))
        }

        fn visit_seq<A: SeqAccess<'de>>(self, _: A) -> std::result::Result<Self::Value, A::Error> {
            Err(de::Error::custom(PRETRAINED_TYPE_ERROR))
        }

        fn visit_map<A: MapAccess<'de>>(self, _: A) -> std::result::Result<Self::Value, A::Error> {
            Err(de::Error::custom(PRETRAINED_TYPE_ERROR))
        }
    }

    deserializer.deserialize_any(PretrainedVisitor)
}
