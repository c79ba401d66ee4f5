use tch::{nn, Tensor};

/// softmax(q k^T / sqrt(d) + mask) v over the last two dims.
/// q: [..., Lq, d], k/v: [..., Lk, d], mask broadcastable to [..., Lq, Lk].
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    attn_mask: Option<&Tensor>,
    dropout: f64,
    train: bool,
) -> Tensor {
    let head_dim = q.size()[q.dim() - 1];
    let att = q.matmul(&k.transpose(-2, -1)) * (1.0 / (head_dim as f64).sqrt());
    let att = match attn_mask {
        Some(mask) => att + mask.to_kind(q.kind()),
        None => att,
    };
    att.softmax(-1, q.kind())
        .dropout(dropout, train)
        .matmul(v)
}

/// Sequence-first multi-head self attention with a packed input projection,
/// laid out like `torch.nn.MultiheadAttention` so CLIP weights load by name.
pub struct MultiheadAttention {
    in_proj_weight: Tensor,
    in_proj_bias: Tensor,
    out_proj: nn::Linear,
    embed_dim: i64,
    num_heads: i64,
}

impl MultiheadAttention {
    pub fn new(vs: &nn::Path, embed_dim: i64, num_heads: i64) -> Self {
        let bound = (6.0 / (embed_dim + 3 * embed_dim) as f64).sqrt();
        let in_proj_weight = vs.var(
            "in_proj_weight",
            &[3 * embed_dim, embed_dim],
            nn::Init::Uniform { lo: -bound, up: bound },
        );
        let in_proj_bias = vs.var("in_proj_bias", &[3 * embed_dim], nn::Init::Const(0.0));
        let out_proj = nn::linear(vs / "out_proj", embed_dim, embed_dim, Default::default());

        Self {
            in_proj_weight,
            in_proj_bias,
            out_proj,
            embed_dim,
            num_heads,
        }
    }

    /// x: [seq_len, batch, embed_dim] -> [seq_len, batch, embed_dim]
    pub fn forward(&self, x: &Tensor, attn_mask: Option<&Tensor>, train: bool) -> Tensor {
        let size = x.size();
        let (l, n) = (size[0], size[1]);
        let head_dim = self.embed_dim / self.num_heads;

        let qkv = x.linear(&self.in_proj_weight, Some(&self.in_proj_bias));
        let chunks = qkv.chunk(3, -1);

        // [L, N, D] -> [N * H, L, head_dim]
        let split = |t: &Tensor| {
            t.contiguous()
                .view([l, n * self.num_heads, head_dim])
                .transpose(0, 1)
        };
        let (q, k, v) = (split(&chunks[0]), split(&chunks[1]), split(&chunks[2]));

        let y = scaled_dot_product_attention(&q, &k, &v, attn_mask, 0.0, train);
        y.transpose(0, 1)
            .contiguous()
            .view([l, n, self.embed_dim])
            .apply(&self.out_proj)
    }
}

/// Batch-first multi-head self attention with a fused qkv projection.
pub struct SelfAttention {
    pub(crate) qkv: nn::Linear,
    pub(crate) proj: nn::Linear,
    num_heads: i64,
}

impl SelfAttention {
    pub fn new(vs: &nn::Path, dim: i64, num_heads: i64, qkv_bias: bool) -> Self {
        let qkv_config = nn::LinearConfig {
            bias: qkv_bias,
            ..Default::default()
        };
        Self {
            qkv: nn::linear(vs / "qkv", dim, 3 * dim, qkv_config),
            proj: nn::linear(vs / "proj", dim, dim, Default::default()),
            num_heads,
        }
    }

    /// x: [batch, seq_len, dim]
    pub fn forward(&self, x: &Tensor, train: bool) -> Tensor {
        let size = x.size();
        let (b, l, c) = (size[0], size[1], size[2]);
        let head_dim = c / self.num_heads;

        // [B, L, 3, H, hd] -> [3, B, H, L, hd]
        let qkv = x
            .apply(&self.qkv)
            .view([b, l, 3, self.num_heads, head_dim])
            .permute([2, 0, 3, 1, 4]);
        let (q, k, v) = (qkv.get(0), qkv.get(1), qkv.get(2));

        let y = scaled_dot_product_attention(&q, &k, &v, None, 0.0, train);
        y.transpose(1, 2).contiguous().view([b, l, c]).apply(&self.proj)
    }
}

/// Batch-first cross attention: queries attend over a context sequence.
pub struct CrossAttention {
    pub(crate) q: nn::Linear,
    pub(crate) kv: nn::Linear,
    pub(crate) proj: nn::Linear,
    num_heads: i64,
}

impl CrossAttention {
    pub fn new(vs: &nn::Path, dim: i64, num_heads: i64, qkv_bias: bool) -> Self {
        let qkv_config = nn::LinearConfig {
            bias: qkv_bias,
            ..Default::default()
        };
        Self {
            q: nn::linear(vs / "q", dim, dim, qkv_config),
            kv: nn::linear(vs / "kv", dim, 2 * dim, qkv_config),
            proj: nn::linear(vs / "proj", dim, dim, Default::default()),
            num_heads,
        }
    }

    /// q: [batch, num_queries, dim], x: [batch, seq_len, dim] -> [batch, num_queries, dim]
    pub fn forward(&self, q: &Tensor, x: &Tensor, train: bool) -> Tensor {
        let q_size = q.size();
        let (b, n_q, c) = (q_size[0], q_size[1], q_size[2]);
        let l = x.size()[1];
        let head_dim = c / self.num_heads;

        let q = q
            .apply(&self.q)
            .view([b, n_q, self.num_heads, head_dim])
            .transpose(1, 2);
        // [B, L, 2, H, hd] -> [2, B, H, L, hd]
        let kv = x
            .apply(&self.kv)
            .view([b, l, 2, self.num_heads, head_dim])
            .permute([2, 0, 3, 1, 4]);
        let (k, v) = (kv.get(0), kv.get(1));

        let y = scaled_dot_product_attention(&q, &k, &v, None, 0.0, train);
        y.transpose(1, 2).contiguous().view([b, n_q, c]).apply(&self.proj)
    }
}
