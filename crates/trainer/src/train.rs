use std::path::PathBuf;

use anyhow::{anyhow, Result};
use log::info;
use tch::{nn, nn::OptimizerConfig, Device, Kind};

use vitclip_core::safetensors_util::save_safetensors;
use vitclip_core::{ClassifierConfig, VideoClassifier};

use crate::dataset::ClipDataset;
use crate::TrainerConfig;

pub struct Trainer {
    config: TrainerConfig,
    model: VideoClassifier,
    optimizer: nn::Optimizer,
    vs: nn::VarStore,
    step: usize,
}

impl Trainer {
    pub fn new(
        model_config: ClassifierConfig,
        trainer_config: TrainerConfig,
        device: Device,
    ) -> Result<Self> {
        trainer_config.validate()?;
        let vs = nn::VarStore::new(device);
        let model = VideoClassifier::new(&vs, &model_config)?;
        model.init_weights(&vs)?;

        // Frozen variables never receive a gradient, so AdamW leaves them untouched.
        let optimizer = nn::AdamW {
            wd: trainer_config.weight_decay.unwrap_or(0.0),
            ..Default::default()
        }
        .build(&vs, trainer_config.learning_rate)?;

        Ok(Self {
            config: trainer_config,
            model,
            optimizer,
            vs,
            step: 0,
        })
    }

    /// Linear warmup to the base learning rate, constant afterwards.
    pub fn learning_rate_at(&self, step: usize) -> f64 {
        match self.config.warmup_steps {
            Some(warmup) if warmup > 0 && step < warmup => {
                self.config.learning_rate * (step + 1) as f64 / warmup as f64
            }
            _ => self.config.learning_rate,
        }
    }

    /// One optimisation step on a random batch. Returns the loss.
    pub fn train_step(&mut self, dataset: &ClipDataset) -> Result<f64> {
        let (input, target) = dataset.sample_batch(self.config.batch_size)?;

        self.optimizer.set_lr(self.learning_rate_at(self.step));
        let logits = self.model.forward(&input, true)?;
        let loss = logits.cross_entropy_for_logits(&target);
        self.optimizer.backward_step(&loss);
        self.step += 1;

        Ok(loss.double_value(&[]))
    }

    pub fn train(&mut self, train_set: &ClipDataset, val_set: Option<&ClipDataset>) -> Result<()> {
        if train_set.is_empty() {
            return Err(anyhow!("training set is empty"));
        }
        let num_classes = self.model.config.num_classes;
        train_set.check_labels(num_classes)?;
        if let Some(val_set) = val_set {
            val_set.check_labels(num_classes)?;
        }
        info!("Starting training with configuration: {:?}", self.config);

        for epoch in 0..self.config.epochs {
            let mut epoch_loss = 0.0;
            let num_batches = self.config.steps_per_epoch;

            for batch_idx in 0..num_batches {
                let loss_val = self.train_step(train_set)?;
                epoch_loss += loss_val;

                if batch_idx % 10 == 0 {
                    info!(
                        "Epoch {} | Batch {}/{} | Loss: {:.4} | LR: {:.2e}",
                        epoch,
                        batch_idx,
                        num_batches,
                        loss_val,
                        self.learning_rate_at(self.step)
                    );
                }
            }

            info!(
                "Epoch {} Average Loss: {:.4}",
                epoch,
                epoch_loss / num_batches.max(1) as f64
            );

            if let Some(val_set) = val_set {
                if self.config.eval_every > 0 && (epoch + 1) % self.config.eval_every == 0 {
                    let acc = self.evaluate(val_set)?;
                    info!("Epoch {} Top-1 accuracy: {:.4}", epoch, acc);
                }
            }

            if self.config.save_every > 0 && (epoch + 1) % self.config.save_every == 0 {
                self.save_checkpoint(epoch)?;
            }
        }

        Ok(())
    }

    /// Top-1 accuracy over the whole dataset, in order.
    pub fn evaluate(&self, dataset: &ClipDataset) -> Result<f64> {
        if dataset.is_empty() {
            return Ok(0.0);
        }
        let _guard = tch::no_grad_guard();
        let indices: Vec<usize> = (0..dataset.len()).collect();
        let mut correct = 0.0;
        for chunk in indices.chunks(self.config.batch_size.max(1)) {
            let (input, target) = dataset.batch(chunk)?;
            let logits = self.model.forward(&input, false)?;
            let hits = logits
                .argmax(-1, false)
                .eq_tensor(&target)
                .to_kind(Kind::Float)
                .sum(Kind::Float);
            correct += hits.double_value(&[]);
        }
        Ok(correct / dataset.len() as f64)
    }

    pub fn save_checkpoint(&self, epoch: usize) -> Result<PathBuf> {
        let path = PathBuf::from(&self.config.checkpoint_dir);
        if !path.exists() {
            std::fs::create_dir_all(&path)?;
        }

        let filename = path.join(format!("checkpoint_epoch_{:04}.safetensors", epoch));
        save_safetensors(&self.vs, &filename)?;

        let config_path = path.join("config.json");
        let config_json = serde_json::to_string_pretty(&self.model.config)?;
        std::fs::write(config_path, config_json)?;

        info!("Saved checkpoint and config to {:?}", path);
        Ok(filename)
    }
}
