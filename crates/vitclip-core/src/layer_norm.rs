use tch::{nn, Kind, Tensor};

/// LayerNorm over the last dimension, computed in float32 so half-precision
/// activations keep their dtype without losing the normalisation statistics.
#[derive(Debug)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    dim: i64,
    eps: f64,
}

impl LayerNorm {
    pub fn new(vs: &nn::Path, dim: i64, eps: f64) -> Self {
        let weight = vs.var("weight", &[dim], nn::Init::Const(1.0));
        let bias = vs.var("bias", &[dim], nn::Init::Const(0.0));
        Self { weight, bias, dim, eps }
    }

    /// x: [..., dim]
    pub fn forward(&self, x: &Tensor) -> Tensor {
        let orig_kind = x.kind();
        x.to_kind(Kind::Float)
            .layer_norm([self.dim], Some(&self.weight), Some(&self.bias), self.eps, false)
            .to_kind(orig_kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn normalises_last_dim() {
        let vs = nn::VarStore::new(Device::Cpu);
        let ln = LayerNorm::new(&vs.root(), 8, 1e-5);
        let x = Tensor::randn([2, 3, 8], (Kind::Float, Device::Cpu)) * 5.0 + 3.0;
        let y = ln.forward(&x);
        assert_eq!(y.size(), vec![2, 3, 8]);
        let mean = y.mean_dim(Some(&[-1i64][..]), false, Kind::Float);
        assert!(mean.abs().max().double_value(&[]) < 1e-4);
    }

    #[test]
    fn keeps_input_dtype() {
        let vs = nn::VarStore::new(Device::Cpu);
        let ln = LayerNorm::new(&vs.root(), 4, 1e-5);
        let x = Tensor::randn([3, 4], (Kind::Float, Device::Cpu)).to_kind(Kind::Double);
        assert_eq!(ln.forward(&x).kind(), Kind::Double);
    }
}
