//! Command line surface and the run configuration derived from it

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_PROMPT: &str = "best quality, extremely detailed";
pub const DEFAULT_MODEL_CONFIG: &str = "models/cldm_v15.yaml";

#[derive(Parser, Debug)]
#[command(author, version, about = "Train ControlNet for the de-splatting task", long_about = None)]
pub struct Args {
    /// Root path for noisy dataset
    #[arg(short = 'd', long)]
    pub dataset: PathBuf,

    /// ControlNet model path
    #[arg(short = 'm', long)]
    pub model_path: PathBuf,

    /// Batch size
    #[arg(short = 'b', long, default_value_t = 4, value_parser = clap::value_parser!(u64).range(1..))]
    pub batch_size: u64,

    /// Path to ControlNet config
    #[arg(short = 'c', long, default_value = DEFAULT_MODEL_CONFIG)]
    pub config: PathBuf,

    /// Gradient accumulation in batches
    #[arg(short = 'g', long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    pub accum_grad: u64,

    /// Compute accelerator
    #[arg(short = 'a', long, value_enum, default_value_t = Accelerator::Gpu)]
    pub accelerator: Accelerator,

    /// Text prompt
    #[arg(short = 'p', long, default_value = DEFAULT_PROMPT)]
    pub prompt: String,

    /// Checkpoint path to resume training (also accepted as `-ck`)
    #[arg(long = "ckpt_path", alias = "ckpt-path")]
    pub ckpt_path: Option<PathBuf>,

    /// Preload the whole dataset into memory
    #[arg(long)]
    pub dataset_in_memory: bool,

    /// Training precision
    #[arg(long, value_enum, default_value_t = Precision::Bf16)]
    pub precision: Precision,

    /// Number of epochs to train
    #[arg(long, default_value_t = 1000)]
    pub max_epochs: usize,

    /// Directory receiving image logs and checkpoints
    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Seed for shuffling, timestep and noise sampling
    #[arg(long)]
    pub seed: Option<u64>,
}

impl Args {
    /// Parse the process arguments, accepting the two-letter `-ck` flag.
    pub fn parse_normalized() -> Self {
        Self::parse_from(normalize_args(std::env::args_os()))
    }
}

/// Rewrite `-ck <path>` and `-ck=<path>` to `--ckpt_path`. clap short flags
/// are single characters, so `-ck` would otherwise parse as `-c k`.
pub fn normalize_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .map(Into::into)
        .map(|arg| match arg.to_str() {
            Some("-ck") => OsString::from("--ckpt_path"),
            Some(s) if s.starts_with("-ck=") => OsString::from(format!("--ckpt_path={}", &s[4..])),
            _ => arg,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    /// CUDA when available, otherwise Metal
    Gpu,
    Cuda,
    #[value(alias = "mps")]
    Metal,
    Cpu,
    /// Best available device, falling back to CPU
    Auto,
}

impl Accelerator {
    pub fn device(self) -> Result<Device> {
        use candle_core::utils::{cuda_is_available, metal_is_available};

        let device = match self {
            Accelerator::Cpu => Device::Cpu,
            Accelerator::Cuda => Device::new_cuda(0)?,
            Accelerator::Metal => Device::new_metal(0)?,
            Accelerator::Gpu => {
                if cuda_is_available() {
                    Device::new_cuda(0)?
                } else if metal_is_available() {
                    Device::new_metal(0)?
                } else {
                    bail!("accelerator 'gpu' requested but no CUDA or Metal device is available");
                }
            }
            Accelerator::Auto => {
                if cuda_is_available() {
                    Device::new_cuda(0)?
                } else if metal_is_available() {
                    Device::new_metal(0)?
                } else {
                    Device::Cpu
                }
            }
        };
        Ok(device)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
pub enum Precision {
    #[value(name = "bf16")]
    #[serde(rename = "bf16")]
    Bf16,
    #[value(name = "16")]
    #[serde(rename = "16")]
    F16,
    #[value(name = "32")]
    #[serde(rename = "32")]
    F32,
}

impl Precision {
    /// Dtype of the frozen modules. Half precision on CPU falls back to `f32`.
    pub fn compute_dtype(self, device: &Device) -> DType {
        match (self, device) {
            (_, Device::Cpu) => DType::F32,
            (Precision::Bf16, _) => DType::BF16,
            (Precision::F16, _) => DType::F16,
            (Precision::F32, _) => DType::F32,
        }
    }
}

/// Everything a run needs, fixed at startup and passed by reference to the
/// dataset, model and trainer setup.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingConfig {
    pub dataset_root: PathBuf,
    pub split: String,
    pub image_size: u32,
    pub dataset_in_memory: bool,
    pub prompt: String,

    pub model_path: PathBuf,
    pub model_config: PathBuf,
    pub learning_rate: f64,
    pub sd_locked: bool,
    pub only_mid_control: bool,

    pub batch_size: usize,
    pub accumulate_grad_batches: usize,
    pub accelerator: Accelerator,
    pub precision: Precision,
    pub max_epochs: usize,
    pub resume_from: Option<PathBuf>,
    pub logger_frequency: usize,
    pub output_dir: PathBuf,
    pub seed: Option<u64>,
}

impl TrainingConfig {
    pub fn from_args(args: Args) -> Self {
        Self {
            dataset_root: args.dataset,
            split: "train".to_string(),
            image_size: 512,
            dataset_in_memory: args.dataset_in_memory,
            prompt: args.prompt,
            model_path: args.model_path,
            model_config: args.config,
            learning_rate: 1e-5,
            sd_locked: true,
            only_mid_control: false,
            batch_size: args.batch_size as usize,
            accumulate_grad_batches: args.accum_grad as usize,
            accelerator: args.accelerator,
            precision: args.precision,
            max_epochs: args.max_epochs,
            resume_from: args.ckpt_path,
            logger_frequency: 300,
            output_dir: args.output_dir,
            seed: args.seed,
        }
    }

    /// Write the resolved configuration as JSON next to the run outputs.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write run config: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args, clap::Error> {
        let argv = std::iter::once("train_controlnet").chain(args.iter().copied());
        Args::try_parse_from(normalize_args(argv))
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["-d", "data", "-m", "model.safetensors"]).unwrap();
        let config = TrainingConfig::from_args(args);

        assert_eq!(config.dataset_root, PathBuf::from("data"));
        assert_eq!(config.model_path, PathBuf::from("model.safetensors"));
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.model_config, PathBuf::from(DEFAULT_MODEL_CONFIG));
        assert_eq!(config.accumulate_grad_batches, 1);
        assert_eq!(config.accelerator, Accelerator::Gpu);
        assert_eq!(config.prompt, DEFAULT_PROMPT);
        assert_eq!(config.resume_from, None);
        assert!(!config.dataset_in_memory);
        assert_eq!(config.precision, Precision::Bf16);
        assert_eq!(config.learning_rate, 1e-5);
        assert!(config.sd_locked);
        assert!(!config.only_mid_control);
        assert_eq!(config.logger_frequency, 300);
        assert_eq!(config.image_size, 512);
        assert_eq!(config.split, "train");
    }

    #[test]
    fn test_all_flags() {
        let args = parse(&[
            "--dataset", "data",
            "--model-path", "m.safetensors",
            "-b", "2",
            "-c", "cfg.yaml",
            "-g", "8",
            "-a", "cpu",
            "-p", "a photo",
            "-ck", "last.safetensors",
            "--dataset-in-memory",
            "--precision", "32",
            "--seed", "3",
        ])
        .unwrap();
        let config = TrainingConfig::from_args(args);

        assert_eq!(config.batch_size, 2);
        assert_eq!(config.model_config, PathBuf::from("cfg.yaml"));
        assert_eq!(config.accumulate_grad_batches, 8);
        assert_eq!(config.accelerator, Accelerator::Cpu);
        assert_eq!(config.prompt, "a photo");
        assert_eq!(config.resume_from, Some(PathBuf::from("last.safetensors")));
        assert!(config.dataset_in_memory);
        assert_eq!(config.precision, Precision::F32);
        assert_eq!(config.seed, Some(3));
    }

    #[test]
    fn test_ckpt_flag_forms() {
        let long = parse(&["-d", "x", "-m", "y", "--ckpt_path", "a"]).unwrap();
        let equals = parse(&["-d", "x", "-m", "y", "-ck=b"]).unwrap();
        assert_eq!(long.ckpt_path, Some(PathBuf::from("a")));
        assert_eq!(equals.ckpt_path, Some(PathBuf::from("b")));
    }

    #[test]
    fn test_required_flags() {
        assert!(parse(&["-d", "data"]).is_err());
        assert!(parse(&["-m", "model"]).is_err());
    }

    #[test]
    fn test_zero_sizes_rejected() {
        assert!(parse(&["-d", "x", "-m", "y", "-b", "0"]).is_err());
        assert!(parse(&["-d", "x", "-m", "y", "-g", "0"]).is_err());
    }

    #[test]
    fn test_accelerator_aliases() {
        let args = parse(&["-d", "x", "-m", "y", "-a", "mps"]).unwrap();
        assert_eq!(args.accelerator, Accelerator::Metal);
        assert!(Accelerator::Cpu.device().unwrap().is_cpu());
    }

    #[test]
    fn test_run_config_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("run_config.json");
        let args = parse(&["-d", "data", "-m", "m.safetensors", "--precision", "16"]).unwrap();
        TrainingConfig::from_args(args).save_json(&path).unwrap();

        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["batch_size"], 4);
        assert_eq!(json["precision"], "16");
        assert_eq!(json["accelerator"], "gpu");
        assert_eq!(json["resume_from"], serde_json::Value::Null);
    }

    #[test]
    fn test_compute_dtype_on_cpu() {
        assert_eq!(Precision::Bf16.compute_dtype(&Device::Cpu), DType::F32);
        assert_eq!(Precision::F32.compute_dtype(&Device::Cpu), DType::F32);
    }
}
