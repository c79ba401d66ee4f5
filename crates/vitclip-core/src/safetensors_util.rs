use std::collections::HashSet;
use std::fs::File;
use std::path::Path;

use log::debug;
use memmap2::MmapOptions;
use safetensors::SafeTensors;
use tch::{nn, Kind, Tensor};

use crate::error::{BackboneError, Result};
use crate::init::variables_under;

/// Outcome of a non-strict load.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// Variables of the store that received no tensor.
    pub missing: Vec<String>,
    /// Tensors of the file with no matching variable.
    pub unexpected: Vec<String>,
}

fn join_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Reads every tensor of a safetensors file onto the CPU, sorted by name.
pub fn read_tensors<P: AsRef<Path>>(path: P) -> Result<Vec<(String, Tensor)>> {
    let file = File::open(path)?;
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut out = Vec::with_capacity(tensors.len());
    for (name, view) in tensors.tensors() {
        let shape: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
        let kind = match view.dtype() {
            safetensors::Dtype::F32 => Kind::Float,
            safetensors::Dtype::F16 => Kind::Half,
            safetensors::Dtype::BF16 => Kind::BFloat16,
            other => return Err(BackboneError::UnsupportedDtype(format!("{:?}", other))),
        };
        out.push((name, Tensor::from_data_size(view.data(), &shape, kind)));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

/// Copies tensors into the variables under `prefix` whose names match.
/// Tensors without a variable are reported as unexpected, variables without
/// a tensor as missing. A shape mismatch aborts the load.
pub fn load_partial<I>(vs: &nn::VarStore, prefix: &str, tensors: I) -> Result<LoadReport>
where
    I: IntoIterator<Item = (String, Tensor)>,
{
    let mut variables = vs.variables();
    let mut report = LoadReport::default();

    for (name, tensor) in tensors {
        let target = join_name(prefix, &name);
        match variables.get_mut(&target) {
            Some(var) => {
                if var.size() != tensor.size() {
                    return Err(BackboneError::Shape(format!(
                        "{}: expected {:?}, found {:?}",
                        target,
                        var.size(),
                        tensor.size()
                    )));
                }
                let src = tensor.to_kind(var.kind()).to_device(var.device());
                tch::no_grad(|| var.copy_(&src));
                debug!("loaded tensor: {}", target);
                report.loaded.push(target);
            }
            None => report.unexpected.push(name),
        }
    }

    let loaded: HashSet<&String> = report.loaded.iter().collect();
    report.missing = variables_under(vs, prefix)
        .into_iter()
        .map(|(name, _)| name)
        .filter(|name| !loaded.contains(name))
        .collect();
    Ok(report)
}

/// Loads a whole checkpoint written by [`save_safetensors`].
pub fn load_safetensors<P: AsRef<Path>>(vs: &nn::VarStore, path: P) -> Result<LoadReport> {
    load_partial(vs, "", read_tensors(path)?)
}

pub fn save_safetensors<P: AsRef<Path>>(vs: &nn::VarStore, path: P) -> Result<()> {
    let named: Vec<(String, Tensor)> = variables_under(vs, "")
        .into_iter()
        .map(|(name, var)| (name, var.to_device(tch::Device::Cpu)))
        .collect();
    Tensor::write_safetensors(&named, path)?;
    Ok(())
}
