pub mod attention;
pub mod backbone;
pub mod classifier;
pub mod config;
pub mod error;
pub mod head;
pub mod init;
pub mod layer_norm;
pub mod pooler;
pub mod safetensors_util;
pub mod transformer;

pub use backbone::ViTClip;
pub use classifier::{ClassifierConfig, VideoClassifier};
pub use config::{AdaptationType, AttentivePoolerConfig, BackboneConfig};
pub use error::{BackboneError, Result};
pub use safetensors_util::LoadReport;
