pub mod dataset;
pub mod train;

pub use dataset::ClipDataset;
pub use train::Trainer;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub learning_rate: f64,
    pub batch_size: usize,
    pub epochs: usize,
    /// Randomly sampled batches per epoch.
    pub steps_per_epoch: usize,
    pub save_every: usize,
    pub eval_every: usize,
    pub checkpoint_dir: String,
    pub warmup_steps: Option<usize>,
    pub weight_decay: Option<f64>,
    /// Inferred from the training annotations when absent.
    pub num_classes: Option<i64>,
    /// Dropout before the classification layer.
    pub dropout: f64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            batch_size: 8,
            epochs: 10,
            steps_per_epoch: 100,
            save_every: 1,
            eval_every: 1,
            checkpoint_dir: "./checkpoints".to_string(),
            warmup_steps: Some(0),
            weight_decay: Some(0.05),
            num_classes: None,
            dropout: 0.5,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(anyhow!("batch_size must be positive"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(anyhow!("dropout must be in [0, 1), got {}", self.dropout));
        }
        Ok(())
    }
}
