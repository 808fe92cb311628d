//! Training checkpoints
//!
//! A checkpoint is a safetensors file holding every trainable var under its
//! model name, plus metadata recording where the loop stopped. Optimizer
//! moments are not stored; a resumed run starts them afresh.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use log::info;
use safetensors::tensor::TensorView;
use safetensors::{serialize, Dtype as SafeDtype, SafeTensors};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const CHECKPOINT_FORMAT: &str = "controlnet-desplat";
pub const CHECKPOINT_DIR: &str = "checkpoints";

/// Loop position saved at the end of an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingState {
    /// Last completed epoch.
    pub epoch: usize,
    pub global_step: usize,
}

pub struct Checkpoint {
    pub state: TrainingState,
    pub tensors: HashMap<String, Tensor>,
}

/// `<output>/checkpoints/epoch={e}-step={s}.safetensors`
pub fn checkpoint_path(output_dir: &Path, state: TrainingState) -> PathBuf {
    output_dir.join(CHECKPOINT_DIR).join(format!(
        "epoch={}-step={}.safetensors",
        state.epoch, state.global_step
    ))
}

pub fn save_checkpoint(path: &Path, vars: &[(String, Var)], state: TrainingState) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let mut buffers = Vec::with_capacity(vars.len());
    for (name, var) in vars {
        let tensor = var.as_tensor();
        buffers.push((
            name.as_str(),
            convert_dtype(tensor.dtype())?,
            tensor.dims().to_vec(),
            tensor_to_vec(tensor)?,
        ));
    }

    let mut views = HashMap::with_capacity(buffers.len());
    for (name, dtype, shape, data) in &buffers {
        views.insert(name.to_string(), TensorView::new(*dtype, shape.clone(), data)?);
    }

    let mut metadata = HashMap::new();
    metadata.insert("format".to_string(), CHECKPOINT_FORMAT.to_string());
    metadata.insert("epoch".to_string(), state.epoch.to_string());
    metadata.insert("global_step".to_string(), state.global_step.to_string());

    let data = serialize(&views, &Some(metadata))?;
    fs::write(path, data).with_context(|| format!("Failed to write checkpoint: {}", path.display()))?;
    info!(
        "Saved checkpoint {} ({} tensors)",
        path.display(),
        vars.len()
    );
    Ok(())
}

pub fn load_checkpoint(path: &Path, device: &Device) -> Result<Checkpoint> {
    let buffer =
        fs::read(path).with_context(|| format!("Failed to read checkpoint: {}", path.display()))?;

    let (_, header) = SafeTensors::read_metadata(&buffer)
        .with_context(|| format!("Invalid safetensors header: {}", path.display()))?;
    let metadata = header.metadata().clone().unwrap_or_default();
    match metadata.get("format").map(String::as_str) {
        Some(CHECKPOINT_FORMAT) => {}
        other => anyhow::bail!(
            "{} is not a training checkpoint (format {:?})",
            path.display(),
            other
        ),
    }
    let state = TrainingState {
        epoch: parse_field(&metadata, "epoch")?,
        global_step: parse_field(&metadata, "global_step")?,
    };

    let tensors = candle_core::safetensors::load_buffer(&buffer, device)?;
    Ok(Checkpoint { state, tensors })
}

/// Copy checkpoint tensors into `vars`. Every var must be present with a
/// matching shape.
pub fn restore_vars(vars: &[(String, Var)], tensors: &HashMap<String, Tensor>) -> Result<()> {
    for (name, var) in vars {
        let tensor = tensors
            .get(name)
            .with_context(|| format!("Checkpoint is missing '{}'", name))?;
        anyhow::ensure!(
            tensor.dims() == var.dims(),
            "Shape mismatch for '{}': checkpoint {:?}, model {:?}",
            name,
            tensor.dims(),
            var.dims()
        );
        let tensor = tensor.to_device(var.device())?.to_dtype(var.dtype())?;
        var.set(&tensor)?;
    }
    Ok(())
}

fn parse_field(metadata: &HashMap<String, String>, key: &str) -> Result<usize> {
    metadata
        .get(key)
        .with_context(|| format!("Checkpoint metadata is missing '{}'", key))?
        .parse()
        .with_context(|| format!("Checkpoint metadata '{}' is not a number", key))
}

fn convert_dtype(dtype: DType) -> Result<SafeDtype> {
    match dtype {
        DType::F32 => Ok(SafeDtype::F32),
        DType::F16 => Ok(SafeDtype::F16),
        DType::BF16 => Ok(SafeDtype::BF16),
        _ => Err(anyhow::anyhow!("Unsupported dtype for safetensors: {:?}", dtype)),
    }
}

fn tensor_to_vec(tensor: &Tensor) -> Result<Vec<u8>> {
    let flattened = tensor.flatten_all()?;
    let data = match tensor.dtype() {
        DType::F32 => flattened
            .to_vec1::<f32>()?
            .into_iter()
            .flat_map(|f| f.to_le_bytes())
            .collect(),
        DType::F16 => flattened
            .to_vec1::<half::f16>()?
            .into_iter()
            .flat_map(|f| f.to_le_bytes())
            .collect(),
        DType::BF16 => flattened
            .to_vec1::<half::bf16>()?
            .into_iter()
            .flat_map(|f| f.to_le_bytes())
            .collect(),
        other => anyhow::bail!("Unsupported tensor dtype for conversion: {:?}", other),
    };
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vars(device: &Device) -> Vec<(String, Var)> {
        vec![
            (
                "controlnet.conv_in.weight".to_string(),
                Var::from_tensor(&Tensor::arange(0f32, 6., device).unwrap().reshape((2, 3)).unwrap())
                    .unwrap(),
            ),
            (
                "controlnet.conv_in.bias".to_string(),
                Var::from_tensor(&Tensor::new(&[0.5f32, -0.5], device).unwrap()).unwrap(),
            ),
        ]
    }

    #[test]
    fn test_checkpoint_path() {
        let path = checkpoint_path(Path::new("out"), TrainingState { epoch: 3, global_step: 120 });
        assert_eq!(path, PathBuf::from("out/checkpoints/epoch=3-step=120.safetensors"));
    }

    #[test]
    fn test_save_then_restore() -> Result<()> {
        let dir = TempDir::new()?;
        let device = Device::Cpu;
        let state = TrainingState { epoch: 2, global_step: 17 };
        let path = checkpoint_path(dir.path(), state);

        let original = vars(&device);
        save_checkpoint(&path, &original, state)?;

        let checkpoint = load_checkpoint(&path, &device)?;
        assert_eq!(checkpoint.state, state);

        let fresh: Vec<(String, Var)> = original
            .iter()
            .map(|(name, var)| (name.clone(), Var::zeros(var.dims(), DType::F32, &device).unwrap()))
            .collect();
        restore_vars(&fresh, &checkpoint.tensors)?;
        for ((_, a), (_, b)) in original.iter().zip(fresh.iter()) {
            assert_eq!(
                a.flatten_all()?.to_vec1::<f32>()?,
                b.flatten_all()?.to_vec1::<f32>()?
            );
        }
        Ok(())
    }

    #[test]
    fn test_missing_var_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let device = Device::Cpu;
        let path = dir.path().join("ckpt.safetensors");
        let state = TrainingState { epoch: 0, global_step: 1 };
        save_checkpoint(&path, &vars(&device)[..1], state)?;

        let checkpoint = load_checkpoint(&path, &device)?;
        let err = restore_vars(&vars(&device), &checkpoint.tensors).unwrap_err();
        assert!(err.to_string().contains("controlnet.conv_in.bias"));
        Ok(())
    }

    #[test]
    fn test_foreign_safetensors_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("weights.safetensors");
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert("w".to_string(), Tensor::zeros(2, DType::F32, &device)?);
        candle_core::safetensors::save(&tensors, &path)?;

        assert!(load_checkpoint(&path, &device).is_err());
        Ok(())
    }
}
