//! ControlLDM architecture configuration, read from YAML

use anyhow::{Context, Result};
use candle_transformers::models::stable_diffusion::{clip, unet_2d, vae};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlLdmConfig {
    pub model: ModelSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    pub diffusion: DiffusionConfig,
    /// Latent scaling applied after VAE encoding.
    pub scale_factor: f64,
    /// One scale per ControlNet residual (down residuals, then mid). A single
    /// value is broadcast to every residual.
    #[serde(default = "default_control_scales")]
    pub control_scales: Vec<f64>,
    pub unet: UNetConfig,
    pub controlnet: ControlNetConfig,
    pub vae: VaeConfig,
    pub text_encoder: TextEncoderConfig,
    #[serde(default)]
    pub weights: WeightPrefixes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffusionConfig {
    pub timesteps: usize,
    pub linear_start: f32,
    pub linear_end: f32,
    #[serde(default = "default_beta_schedule")]
    pub beta_schedule: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BlockConfig {
    pub out_channels: usize,
    /// Transformer depth of the block, absent for blocks without cross attention.
    pub use_cross_attn: Option<usize>,
    pub attention_head_dim: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UNetConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub blocks: Vec<BlockConfig>,
    pub layers_per_block: usize,
    pub cross_attention_dim: usize,
    #[serde(default = "default_true")]
    pub flip_sin_to_cos: bool,
    #[serde(default)]
    pub freq_shift: f64,
    #[serde(default = "default_one")]
    pub downsample_padding: usize,
    #[serde(default = "default_scale")]
    pub mid_block_scale_factor: f64,
    pub norm_num_groups: usize,
    pub norm_eps: f64,
    #[serde(default)]
    pub use_linear_projection: bool,
    #[serde(default)]
    pub sliced_attention_size: Option<usize>,
    #[serde(default)]
    pub use_flash_attn: bool,
}

impl UNetConfig {
    pub fn to_candle(&self) -> unet_2d::UNet2DConditionModelConfig {
        unet_2d::UNet2DConditionModelConfig {
            blocks: self
                .blocks
                .iter()
                .map(|b| unet_2d::BlockConfig {
                    out_channels: b.out_channels,
                    use_cross_attn: b.use_cross_attn,
                    attention_head_dim: b.attention_head_dim,
                })
                .collect(),
            center_input_sample: false,
            cross_attention_dim: self.cross_attention_dim,
            downsample_padding: self.downsample_padding,
            flip_sin_to_cos: self.flip_sin_to_cos,
            freq_shift: self.freq_shift,
            layers_per_block: self.layers_per_block,
            mid_block_scale_factor: self.mid_block_scale_factor,
            norm_eps: self.norm_eps,
            norm_num_groups: self.norm_num_groups,
            sliced_attention_size: self.sliced_attention_size,
            use_linear_projection: self.use_linear_projection,
        }
    }

    /// Number of down residuals produced by the encoder half: one for
    /// `conv_in`, one per resnet and one per downsampler.
    pub fn num_down_residuals(&self) -> usize {
        let n = self.blocks.len();
        1 + n * self.layers_per_block + n.saturating_sub(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlNetConfig {
    #[serde(default = "default_conditioning_channels")]
    pub conditioning_channels: usize,
    /// Channel widths of the hint encoder. Each step after the first halves
    /// the spatial size, so the hint must be `2^(len-1)` times the latent size.
    pub conditioning_embedding_out_channels: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaeConfig {
    pub block_out_channels: Vec<usize>,
    pub layers_per_block: usize,
    pub latent_channels: usize,
    pub norm_num_groups: usize,
    #[serde(default = "default_true")]
    pub use_quant_conv: bool,
    #[serde(default = "default_true")]
    pub use_post_quant_conv: bool,
}

impl VaeConfig {
    pub fn to_candle(&self) -> vae::AutoEncoderKLConfig {
        vae::AutoEncoderKLConfig {
            block_out_channels: self.block_out_channels.clone(),
            layers_per_block: self.layers_per_block,
            latent_channels: self.latent_channels,
            norm_num_groups: self.norm_num_groups,
            use_quant_conv: self.use_quant_conv,
            use_post_quant_conv: self.use_post_quant_conv,
        }
    }

    pub fn downsample_factor(&self) -> usize {
        1 << self.block_out_channels.len().saturating_sub(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextEncoderConfig {
    /// CLIP variant: `v1_5`, `v2_1` or `sdxl`.
    #[serde(default = "default_clip_variant")]
    pub variant: String,
    /// `tokenizer.json`; relative paths resolve against the config file.
    pub tokenizer: PathBuf,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_pad_token")]
    pub pad_token: String,
}

impl TextEncoderConfig {
    pub fn clip_config(&self) -> Result<clip::Config> {
        match self.variant.as_str() {
            "v1_5" => Ok(clip::Config::v1_5()),
            "v2_1" => Ok(clip::Config::v2_1()),
            "sdxl" => Ok(clip::Config::sdxl()),
            other => anyhow::bail!("unsupported CLIP variant '{}'", other),
        }
    }
}

/// Key prefixes of each sub-model inside the checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightPrefixes {
    pub unet: String,
    pub controlnet: String,
    pub vae: String,
    pub text_encoder: String,
}

impl Default for WeightPrefixes {
    fn default() -> Self {
        Self {
            unet: "unet".to_string(),
            controlnet: "controlnet".to_string(),
            vae: "vae".to_string(),
            text_encoder: "text_encoder".to_string(),
        }
    }
}

fn default_control_scales() -> Vec<f64> {
    vec![1.0]
}

fn default_beta_schedule() -> String {
    "scaled_linear".to_string()
}

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

fn default_scale() -> f64 {
    1.0
}

fn default_conditioning_channels() -> usize {
    3
}

fn default_clip_variant() -> String {
    "v1_5".to_string()
}

fn default_max_length() -> usize {
    77
}

fn default_pad_token() -> String {
    "<|endoftext|>".to_string()
}

impl ControlLdmConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("Failed to parse YAML config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load the config and resolve the tokenizer path against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config = Self::from_yaml_str(&config_str)
            .with_context(|| format!("Invalid model config: {}", path.display()))?;

        let tokenizer = &config.model.text_encoder.tokenizer;
        if tokenizer.is_relative() {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            config.model.text_encoder.tokenizer = base.join(tokenizer);
        }
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let model = &self.model;
        anyhow::ensure!(!model.unet.blocks.is_empty(), "unet.blocks must not be empty");
        anyhow::ensure!(
            !model.controlnet.conditioning_embedding_out_channels.is_empty(),
            "controlnet.conditioning_embedding_out_channels must not be empty"
        );
        let hint_factor = 1 << (model.controlnet.conditioning_embedding_out_channels.len() - 1);
        anyhow::ensure!(
            hint_factor == model.vae.downsample_factor(),
            "hint encoder downsamples by {} but the VAE by {}",
            hint_factor,
            model.vae.downsample_factor()
        );
        let expected = model.unet.num_down_residuals() + 1;
        anyhow::ensure!(
            model.control_scales.len() == 1 || model.control_scales.len() == expected,
            "control_scales needs 1 or {} entries, got {}",
            expected,
            model.control_scales.len()
        );
        Ok(())
    }

    /// Per-residual control scales, down residuals first and mid last.
    pub fn control_scales(&self) -> Vec<f64> {
        let n = self.model.unet.num_down_residuals() + 1;
        match self.model.control_scales.as_slice() {
            [single] => vec![*single; n],
            scales => scales.to_vec(),
        }
    }
}
