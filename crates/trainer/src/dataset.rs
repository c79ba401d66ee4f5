use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

use vitclip_core::safetensors_util::read_tensors;

/// Name of the tensor holding the decoded clip inside each sample file.
pub const CLIP_TENSOR: &str = "clip";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    /// Safetensors file with a `clip` tensor of shape [C, T, H, W].
    pub path: PathBuf,
    pub label: i64,
}

/// Decoded, normalised clips listed by a JSON annotation file.
pub struct ClipDataset {
    items: Vec<Annotation>,
    device: Device,
}

impl ClipDataset {
    /// Relative sample paths are resolved against the annotation file's directory.
    pub fn load<P: AsRef<Path>>(annotation_file: P, device: Device) -> Result<Self> {
        let annotation_file = annotation_file.as_ref();
        let content = fs::read_to_string(annotation_file)
            .with_context(|| format!("Failed to read annotations at {:?}", annotation_file))?;
        let mut items: Vec<Annotation> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse annotations at {:?}", annotation_file))?;

        let base = annotation_file.parent().unwrap_or_else(|| Path::new("."));
        for item in items.iter_mut() {
            if item.path.is_relative() {
                item.path = base.join(&item.path);
            }
            if item.label < 0 {
                return Err(anyhow!("negative label {} for {:?}", item.label, item.path));
            }
        }
        Ok(Self::from_annotations(items, device))
    }

    pub fn from_annotations(items: Vec<Annotation>, device: Device) -> Self {
        Self { items, device }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Largest label + 1.
    pub fn num_classes(&self) -> i64 {
        self.items.iter().map(|a| a.label + 1).max().unwrap_or(0)
    }

    /// Fails on the first label outside `0..num_classes`.
    pub fn check_labels(&self, num_classes: i64) -> Result<()> {
        match self.items.iter().find(|a| a.label < 0 || a.label >= num_classes) {
            Some(item) => Err(anyhow!(
                "label {} of {:?} is outside the {} classes",
                item.label,
                item.path,
                num_classes
            )),
            None => Ok(()),
        }
    }

    /// Returns the clip [C, T, H, W] as float and its label.
    pub fn get(&self, idx: usize) -> Result<(Tensor, i64)> {
        let item = self
            .items
            .get(idx)
            .ok_or_else(|| anyhow!("index {} out of range for {} clips", idx, self.items.len()))?;
        let clip = read_tensors(&item.path)
            .with_context(|| format!("Failed to read clip {:?}", item.path))?
            .into_iter()
            .find(|(name, _)| name == CLIP_TENSOR)
            .map(|(_, t)| t)
            .ok_or_else(|| anyhow!("{:?} has no `{}` tensor", item.path, CLIP_TENSOR))?;
        if clip.dim() != 4 {
            return Err(anyhow!("{:?}: expected [C, T, H, W], got {:?}", item.path, clip.size()));
        }
        Ok((clip.to_kind(Kind::Float), item.label))
    }

    /// input: [batch, C, T, H, W], target: [batch]
    pub fn batch(&self, indices: &[usize]) -> Result<(Tensor, Tensor)> {
        if indices.is_empty() {
            return Err(anyhow!("cannot build an empty batch"));
        }
        let mut clips = Vec::with_capacity(indices.len());
        let mut labels = Vec::with_capacity(indices.len());
        for &idx in indices {
            let (clip, label) = self.get(idx)?;
            clips.push(clip);
            labels.push(label);
        }
        let input = Tensor::f_stack(&clips, 0)
            .with_context(|| format!("clips {:?} differ in shape", indices))?
            .to(self.device);
        let target = Tensor::from_slice(&labels).to(self.device);
        Ok((input, target))
    }

    /// Returns a batch of `batch_size` clips drawn with replacement.
    pub fn sample_batch(&self, batch_size: usize) -> Result<(Tensor, Tensor)> {
        if self.items.is_empty() {
            return Err(anyhow!("cannot sample from an empty dataset"));
        }
        let mut rng = thread_rng();
        let indices: Vec<usize> = (0..batch_size)
            .map(|_| rng.gen_range(0..self.items.len()))
            .collect();
        self.batch(&indices)
    }
}
