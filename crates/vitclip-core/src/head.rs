use tch::{nn, Tensor};

use crate::error::{BackboneError, Result};

/// Classification head over per-frame backbone features: average pooling,
/// mean over the frames of each clip, dropout and a linear classifier.
pub struct I3DHead {
    fc_cls: nn::Linear,
    num_frames: i64,
    dropout: f64,
}

impl I3DHead {
    pub fn new(vs: &nn::Path, in_channels: i64, num_classes: i64, num_frames: i64, dropout: f64) -> Self {
        let fc_config = nn::LinearConfig {
            ws_init: nn::Init::Randn { mean: 0.0, stdev: 0.01 },
            bs_init: Some(nn::Init::Const(0.0)),
            bias: true,
        };
        let fc_cls = nn::linear(vs / "fc_cls", in_channels, num_classes, fc_config);
        Self {
            fc_cls,
            num_frames,
            dropout,
        }
    }

    /// x: [B * T, D, t, h, w] -> logits [B, num_classes]
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let size = x.size();
        if size.len() != 5 || size[0] % self.num_frames != 0 {
            return Err(BackboneError::Shape(format!(
                "expected [B * {}, D, t, h, w], got {:?}",
                self.num_frames, size
            )));
        }
        let (bt, d) = (size[0], size[1]);
        let kind = x.kind();
        let x = x
            .adaptive_avg_pool3d([1, 1, 1])
            .view([bt / self.num_frames, self.num_frames, d])
            .mean_dim(Some(&[1i64][..]), false, kind);
        Ok(x.dropout(self.dropout, train).apply(&self.fc_cls))
    }
}
