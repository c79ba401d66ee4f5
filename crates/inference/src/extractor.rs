use anyhow::{anyhow, Result};
use tch::{Kind, Tensor};

use vitclip_core::VideoClassifier;

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: i64,
    pub score: f64,
}

/// Eval-mode forward passes over single clips or batches of clips.
pub struct FeatureExtractor {
    model: VideoClassifier,
}

impl FeatureExtractor {
    pub fn new(model: VideoClassifier) -> Self {
        Self { model }
    }

    fn batched(clip: &Tensor) -> Result<Tensor> {
        match clip.dim() {
            4 => Ok(clip.unsqueeze(0)),
            5 => Ok(clip.shallow_clone()),
            _ => Err(anyhow!(
                "expected [C, T, H, W] or [B, C, T, H, W], got {:?}",
                clip.size()
            )),
        }
    }

    /// Per-frame backbone features, [B, T, D].
    pub fn features(&self, clip: &Tensor) -> Result<Tensor> {
        let _guard = tch::no_grad_guard();
        let x = Self::batched(clip)?.to_kind(Kind::Float);
        let b = x.size()[0];
        let feats = self.model.features(&x, false)?;
        let t = feats.size()[0] / b;
        Ok(feats.view([b, t, -1]))
    }

    /// Class logits, [B, num_classes].
    pub fn logits(&self, clip: &Tensor) -> Result<Tensor> {
        let _guard = tch::no_grad_guard();
        let x = Self::batched(clip)?.to_kind(Kind::Float);
        Ok(self.model.forward(&x, false)?)
    }

    /// The `k` most probable classes of every clip, best first.
    pub fn classify(&self, clip: &Tensor, k: i64) -> Result<Vec<Vec<Prediction>>> {
        let probs = self.logits(clip)?.softmax(-1, Kind::Float);
        let k = k.clamp(1, probs.size()[1]);
        let (scores, labels) = probs.topk(k, -1, true, true);

        let mut out = Vec::with_capacity(probs.size()[0] as usize);
        for row in 0..probs.size()[0] {
            let preds = (0..k)
                .map(|j| Prediction {
                    label: labels.int64_value(&[row, j]),
                    score: scores.double_value(&[row, j]),
                })
                .collect();
            out.push(preds);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::tiny_config;
    use tch::{nn, Device};

    fn extractor() -> FeatureExtractor {
        let vs = nn::VarStore::new(Device::Cpu);
        FeatureExtractor::new(VideoClassifier::new(&vs, &tiny_config()).unwrap())
    }

    #[test]
    fn single_clip_is_batched() {
        let ex = extractor();
        let clip = Tensor::randn([3, 2, 32, 32], (Kind::Float, Device::Cpu));
        assert_eq!(ex.features(&clip).unwrap().size(), vec![1, 2, 16]);
        assert_eq!(ex.logits(&clip).unwrap().size(), vec![1, 4]);
    }

    #[test]
    fn classify_sorts_by_probability() {
        let ex = extractor();
        let clips = Tensor::randn([2, 3, 2, 32, 32], (Kind::Float, Device::Cpu));
        let preds = ex.classify(&clips, 10).unwrap();
        assert_eq!(preds.len(), 2);
        for row in preds {
            assert_eq!(row.len(), 4);
            assert!(row.windows(2).all(|w| w[0].score >= w[1].score));
            let total: f64 = row.iter().map(|p| p.score).sum();
            assert!((total - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn eval_mode_is_deterministic() {
        let ex = extractor();
        let clip = Tensor::randn([3, 2, 32, 32], (Kind::Float, Device::Cpu));
        let a = ex.logits(&clip).unwrap();
        let b = ex.logits(&clip).unwrap();
        assert!(a.equal(&b));
    }

    #[test]
    fn rejects_images() {
        let ex = extractor();
        let image = Tensor::randn([3, 32, 32], (Kind::Float, Device::Cpu));
        assert!(ex.features(&image).is_err());
    }
}
