use std::f64::consts::SQRT_2;

use tch::{nn, Tensor};

const LINEAR_LAYERS: &[&str] = &["c_fc", "c_proj", "out_proj", "q", "kv", "qkv", "proj", "fc1", "fc2"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
    LinearWeight,
    LinearBias,
    NormWeight,
    NormBias,
    Other,
}

/// Classifies a variable by the layer that owns it, from its dotted name.
pub fn param_role(name: &str) -> ParamRole {
    let mut parts = name.rsplit('.');
    let leaf = parts.next().unwrap_or_default();
    let owner = parts.next().unwrap_or_default();
    let is_linear = LINEAR_LAYERS.contains(&owner);
    let is_norm = owner.starts_with("ln_") || owner.starts_with("norm");
    match (leaf, is_linear, is_norm) {
        ("weight", true, _) => ParamRole::LinearWeight,
        ("bias", true, _) => ParamRole::LinearBias,
        ("weight", _, true) => ParamRole::NormWeight,
        ("bias", _, true) => ParamRole::NormBias,
        _ => ParamRole::Other,
    }
}

fn norm_cdf(x: f64) -> f64 {
    (1.0 + Tensor::from_slice(&[x / SQRT_2]).erf().double_value(&[0])) / 2.0
}

/// Fills `t` with values from N(mean, std) truncated to [a, b], by inverse-CDF sampling.
pub fn trunc_normal_(t: &mut Tensor, mean: f64, std: f64, a: f64, b: f64) {
    let l = norm_cdf((a - mean) / std);
    let u = norm_cdf((b - mean) / std);
    tch::no_grad(|| {
        let mut sample = Tensor::empty(t.size(), (t.kind(), t.device()));
        let _ = sample.uniform_(2.0 * l - 1.0, 2.0 * u - 1.0);
        let sample = (sample.erfinv() * (std * SQRT_2) + mean).clamp(a, b);
        t.copy_(&sample);
    });
}

/// Variables whose dotted name lies under `prefix` (all of them when `prefix` is empty).
pub fn variables_under(vs: &nn::VarStore, prefix: &str) -> Vec<(String, Tensor)> {
    let mut vars: Vec<_> = vs
        .variables()
        .into_iter()
        .filter(|(name, _)| {
            prefix.is_empty()
                || name
                    .strip_prefix(prefix)
                    .map_or(false, |rest| rest.starts_with('.'))
        })
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
}

/// Linear layers get trunc-normal(std) weights and zero biases, layer norms
/// get unit weights and zero biases. Everything else is left untouched.
pub fn default_init(vs: &nn::VarStore, prefix: &str, std: f64) {
    for (name, mut var) in variables_under(vs, prefix) {
        match param_role(&name) {
            ParamRole::LinearWeight => trunc_normal_(&mut var, 0.0, std, -2.0, 2.0),
            ParamRole::LinearBias | ParamRole::NormBias => tch::no_grad(|| {
                let _ = var.fill_(0.0);
            }),
            ParamRole::NormWeight => tch::no_grad(|| {
                let _ = var.fill_(1.0);
            }),
            ParamRole::Other => {}
        }
    }
}

/// Marks variables trainable iff their name contains one of `markers`.
/// Returns the names left trainable.
pub fn freeze_except(vs: &nn::VarStore, prefix: &str, markers: &[&str]) -> Vec<String> {
    let mut trainable = Vec::new();
    for (name, var) in variables_under(vs, prefix) {
        let keep = markers.iter().any(|m| name.contains(m));
        let _ = var.set_requires_grad(keep);
        if keep {
            trainable.push(name);
        }
    }
    trainable
}

/// (total, trainable) element counts.
pub fn parameter_counts(vs: &nn::VarStore, prefix: &str) -> (i64, i64) {
    variables_under(vs, prefix)
        .iter()
        .fold((0, 0), |(total, tunable), (_, var)| {
            let n = var.numel() as i64;
            (total + n, if var.requires_grad() { tunable + n } else { tunable })
        })
}
