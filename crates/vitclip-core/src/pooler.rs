use tch::{nn, Tensor};

use crate::attention::{CrossAttention, SelfAttention};
use crate::config::AttentivePoolerConfig;
use crate::init::trunc_normal_;
use crate::layer_norm::LayerNorm;

/// Two-layer MLP with exact GELU.
pub struct GeluMlp {
    fc1: nn::Linear,
    fc2: nn::Linear,
}

impl GeluMlp {
    pub fn new(vs: &nn::Path, dim: i64, hidden: i64) -> Self {
        Self {
            fc1: nn::linear(vs / "fc1", dim, hidden, Default::default()),
            fc2: nn::linear(vs / "fc2", hidden, dim, Default::default()),
        }
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        x.apply(&self.fc1).gelu("none").apply(&self.fc2)
    }
}

/// Pre-norm batch-first transformer block.
pub struct Block {
    norm1: LayerNorm,
    attn: SelfAttention,
    norm2: LayerNorm,
    mlp: GeluMlp,
}

impl Block {
    pub fn new(vs: &nn::Path, dim: i64, num_heads: i64, config: &AttentivePoolerConfig) -> Self {
        let hidden = (dim as f64 * config.mlp_ratio) as i64;
        Self {
            norm1: LayerNorm::new(&(vs / "norm1"), dim, config.layer_norm_epsilon),
            attn: SelfAttention::new(&(vs / "attn"), dim, num_heads, config.qkv_bias),
            norm2: LayerNorm::new(&(vs / "norm2"), dim, config.layer_norm_epsilon),
            mlp: GeluMlp::new(&(vs / "mlp"), dim, hidden),
        }
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Tensor {
        let x = x + self.attn.forward(&self.norm1.forward(x), train);
        &x + self.mlp.forward(&self.norm2.forward(&x))
    }
}

/// Queries cross-attend to the normalised context, then pass through an MLP.
pub struct CrossAttentionBlock {
    norm1: LayerNorm,
    xattn: CrossAttention,
    norm2: LayerNorm,
    mlp: GeluMlp,
}

impl CrossAttentionBlock {
    pub fn new(vs: &nn::Path, dim: i64, num_heads: i64, config: &AttentivePoolerConfig) -> Self {
        let hidden = (dim as f64 * config.mlp_ratio) as i64;
        Self {
            norm1: LayerNorm::new(&(vs / "norm1"), dim, config.layer_norm_epsilon),
            xattn: CrossAttention::new(&(vs / "xattn"), dim, num_heads, config.qkv_bias),
            norm2: LayerNorm::new(&(vs / "norm2"), dim, config.layer_norm_epsilon),
            mlp: GeluMlp::new(&(vs / "mlp"), dim, hidden),
        }
    }

    /// q: [B, Q, D], x: [B, L, D]
    pub fn forward(&self, q: &Tensor, x: &Tensor, train: bool) -> Tensor {
        let q = q + self.xattn.forward(q, &self.norm1.forward(x), train);
        &q + self.mlp.forward(&self.norm2.forward(&q))
    }
}

/// Reduces a token sequence to `num_queries` summary vectors with learned queries.
pub struct AttentivePooler {
    query_tokens: Tensor,
    cross_attention_block: CrossAttentionBlock,
    blocks: Vec<Block>,
}

impl AttentivePooler {
    pub fn new(vs: &nn::Path, embed_dim: i64, num_heads: i64, config: &AttentivePoolerConfig) -> Self {
        let mut query_tokens = vs.var(
            "query_tokens",
            &[1, config.num_queries, embed_dim],
            nn::Init::Const(0.0),
        );
        trunc_normal_(&mut query_tokens, 0.0, config.init_std, -2.0, 2.0);

        let cross_attention_block =
            CrossAttentionBlock::new(&(vs / "cross_attention_block"), embed_dim, num_heads, config);
        let blocks = (0..config.depth - 1)
            .map(|i| Block::new(&(vs / "blocks" / i), embed_dim, num_heads, config))
            .collect();

        let pooler = Self {
            query_tokens,
            cross_attention_block,
            blocks,
        };
        pooler.init_weights(config.init_std);
        pooler
    }

    fn linears(&self) -> Vec<&nn::Linear> {
        let mut linears = Vec::new();
        for block in &self.blocks {
            linears.extend([&block.attn.qkv, &block.attn.proj, &block.mlp.fc1, &block.mlp.fc2]);
        }
        let cross = &self.cross_attention_block;
        linears.extend([&cross.xattn.q, &cross.xattn.kv, &cross.xattn.proj, &cross.mlp.fc1, &cross.mlp.fc2]);
        linears
    }

    fn init_weights(&self, std: f64) {
        for linear in self.linears() {
            let mut ws = linear.ws.shallow_clone();
            trunc_normal_(&mut ws, 0.0, std, -2.0, 2.0);
            if let Some(bs) = &linear.bs {
                let mut bs = bs.shallow_clone();
                tch::no_grad(|| {
                    let _ = bs.fill_(0.0);
                });
            }
        }

        // Residual output projections shrink with depth.
        let rescale = |w: &Tensor, layer_id: usize| {
            let mut w = w.shallow_clone();
            tch::no_grad(|| {
                let _ = w.g_div_scalar_((2.0 * layer_id as f64).sqrt());
            });
        };
        let mut layer_id = 0;
        for (i, block) in self.blocks.iter().enumerate() {
            layer_id = i;
            rescale(&block.attn.proj.ws, i + 1);
            rescale(&block.mlp.fc2.ws, i + 1);
        }
        rescale(&self.cross_attention_block.xattn.proj.ws, layer_id + 1);
        rescale(&self.cross_attention_block.mlp.fc2.ws, layer_id + 1);
    }

    /// x: [B, L, D] -> [B, num_queries, D]
    pub fn forward(&self, x: &Tensor, train: bool) -> Tensor {
        let x = self
            .blocks
            .iter()
            .fold(x.shallow_clone(), |x, blk| blk.forward(&x, train));
        let q = self
            .query_tokens
            .to_kind(x.kind())
            .repeat([x.size()[0], 1, 1]);
        self.cross_attention_block.forward(&q, &x, train)
    }
}
