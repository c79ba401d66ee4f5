use tch::{nn, Tensor};

use crate::attention::MultiheadAttention;
use crate::layer_norm::LayerNorm;

/// x * sigmoid(1.702 * x), the GELU approximation CLIP was trained with.
pub fn quick_gelu(x: &Tensor) -> Tensor {
    x * (x * 1.702).sigmoid()
}

/// FeedForward block (MLP) with QuickGELU.
pub struct Mlp {
    c_fc: nn::Linear,
    c_proj: nn::Linear,
}

impl Mlp {
    pub fn new(vs: &nn::Path, d_model: i64) -> Self {
        let n_hidden = 4 * d_model;
        let c_fc = nn::linear(vs / "c_fc", d_model, n_hidden, Default::default());
        let c_proj = nn::linear(vs / "c_proj", n_hidden, d_model, Default::default());
        Self { c_fc, c_proj }
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        quick_gelu(&x.apply(&self.c_fc)).apply(&self.c_proj)
    }
}

/// Pre-norm residual block operating on sequence-first tokens.
pub struct ResidualAttentionBlock {
    attn: MultiheadAttention,
    ln_1: LayerNorm,
    mlp: Mlp,
    ln_2: LayerNorm,
}

impl ResidualAttentionBlock {
    pub fn new(vs: &nn::Path, d_model: i64, n_head: i64, eps: f64) -> Self {
        Self {
            attn: MultiheadAttention::new(&(vs / "attn"), d_model, n_head),
            ln_1: LayerNorm::new(&(vs / "ln_1"), d_model, eps),
            mlp: Mlp::new(&(vs / "mlp"), d_model),
            ln_2: LayerNorm::new(&(vs / "ln_2"), d_model, eps),
        }
    }

    /// x: [HW + 1, BT, D]
    pub fn forward(&self, x: &Tensor, train: bool) -> Tensor {
        // CLIP's visual encoder attends without a mask
        let x = x + self.attn.forward(&self.ln_1.forward(x), None, train);
        &x + self.mlp.forward(&self.ln_2.forward(&x))
    }
}

pub struct Transformer {
    resblocks: Vec<ResidualAttentionBlock>,
}

impl Transformer {
    pub fn new(vs: &nn::Path, width: i64, layers: i64, heads: i64, eps: f64) -> Self {
        let resblocks = (0..layers)
            .map(|i| {
                ResidualAttentionBlock::new(&(vs / "resblocks" / i), width, heads, eps)
            })
            .collect();
        Self { resblocks }
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Tensor {
        self.resblocks
            .iter()
            .fold(x.shallow_clone(), |x, block| block.forward(&x, train))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn quick_gelu_matches_formula() {
        let x = Tensor::from_slice(&[-1.0f32, 0.0, 2.0]);
        let y = quick_gelu(&x);
        let expected = 2.0 / (1.0 + (-1.702f64 * 2.0).exp());
        assert!((y.double_value(&[2]) - expected).abs() < 1e-5);
        assert_eq!(y.double_value(&[1]), 0.0);
    }

    #[test]
    fn stack_uses_clip_parameter_names() {
        let vs = nn::VarStore::new(Device::Cpu);
        let t = Transformer::new(&(vs.root() / "transformer"), 16, 3, 4, 1e-5);
        let vars = vs.variables();
        for i in 0..3 {
            for suffix in [
                "attn.in_proj_weight",
                "ln_1.weight",
                "mlp.c_fc.weight",
                "mlp.c_proj.bias",
                "ln_2.bias",
            ] {
                let key = format!("transformer.resblocks.{}.{}", i, suffix);
                assert!(vars.contains_key(&key), "missing {}", key);
            }
        }
        let x = Tensor::randn([5, 2, 16], (Kind::Float, Device::Cpu));
        assert_eq!(t.forward(&x, false).size(), vec![5, 2, 16]);
    }

    #[test]
    fn zeroed_block_is_identity() {
        let vs = nn::VarStore::new(Device::Cpu);
        let block = ResidualAttentionBlock::new(&vs.root(), 8, 2, 1e-5);
        tch::no_grad(|| {
            for (name, mut var) in vs.variables() {
                if name.contains("out_proj") || name.contains("c_proj") {
                    let _ = var.zero_();
                }
            }
        });
        let x = Tensor::randn([3, 2, 8], (Kind::Float, Device::Cpu));
        assert!(block.forward(&x, false).allclose(&x, 1e-6, 1e-6, false));
    }
}
