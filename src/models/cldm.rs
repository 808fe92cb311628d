//! ControlLDM: Stable Diffusion with a trainable ControlNet
//!
//! The VAE and text encoder are always frozen. The UNet is frozen while
//! `sd_locked` holds; otherwise its decoder half (up blocks and output
//! layers) trains alongside the ControlNet. Frozen parts run in the compute
//! dtype, trainable parts in `f32`.
//!
//! candle's UNet takes a single scalar timestep, so a training step draws
//! one `t` for the whole batch rather than one per sample. With batches
//! larger than one the noise levels inside a batch are therefore correlated.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::models::stable_diffusion::{unet_2d, vae};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::collections::HashMap;
use std::path::Path;

use super::config::ControlLdmConfig;
use super::controlnet::ControlNet;
use super::text_encoder::{ClipConditioner, TextConditioner};
use crate::data::Batch;
use crate::trainers::ddpm_scheduler::{DDIMSampler, DDPMScheduler};
use crate::trainers::trainer::{LogImagesOptions, TrainableModel};

/// UNet weight groups that train when the UNet is unlocked.
const UNET_DECODER_GROUPS: [&str; 3] = ["up_blocks.", "conv_norm_out.", "conv_out."];

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub learning_rate: f64,
    /// Keep the whole UNet frozen.
    pub sd_locked: bool,
    /// Inject only the mid-block residual.
    pub only_mid_control: bool,
    pub seed: Option<u64>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            learning_rate: 1e-5,
            sd_locked: true,
            only_mid_control: false,
            seed: None,
        }
    }
}

/// Read a safetensors checkpoint into a name → tensor map.
pub fn load_state_dict(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    candle_core::safetensors::load(path, device)
        .with_context(|| format!("Failed to load model weights: {}", path.display()))
}

pub struct ControlLdm {
    vae: vae::AutoEncoderKL,
    unet: unet_2d::UNet2DConditionModel,
    controlnet: ControlNet,
    text: Box<dyn TextConditioner>,
    scheduler: DDPMScheduler,
    trainable: VarMap,
    trainable_names: Vec<String>,
    settings: ModelSettings,
    scale_factor: f64,
    dtype: DType,
    unet_dtype: DType,
    device: Device,
    rng: StdRng,
}

impl ControlLdm {
    /// Load the architecture from `config_path` and all weights, including
    /// the CLIP text encoder, from the checkpoint at `model_path`.
    pub fn from_files(
        config_path: &Path,
        model_path: &Path,
        settings: ModelSettings,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let config = ControlLdmConfig::load(config_path)?;
        info!("Loading model weights from {}", model_path.display());
        let weights = load_state_dict(model_path, device)?;

        let vb = VarBuilder::from_tensors(weights.clone(), dtype, device);
        let text = ClipConditioner::new(
            vb.pp(&config.model.weights.text_encoder),
            &config.model.text_encoder,
        )
        .context("Failed to build the text encoder")?;

        Self::new(&config, settings, weights, Box::new(text), device, dtype)
    }

    pub fn new(
        config: &ControlLdmConfig,
        settings: ModelSettings,
        weights: HashMap<String, Tensor>,
        text: Box<dyn TextConditioner>,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let model = &config.model;
        let prefixes = &model.weights;
        let frozen = VarBuilder::from_tensors(weights.clone(), dtype, device);

        let diffusion = &model.diffusion;
        let scheduler = DDPMScheduler::new(
            diffusion.timesteps,
            diffusion.linear_start as f64,
            diffusion.linear_end as f64,
            diffusion.beta_schedule.parse()?,
        )?;

        let vae = vae::AutoEncoderKL::new(frozen.pp(&prefixes.vae), 3, 3, model.vae.to_candle())
            .context("Failed to build the VAE")?;

        let trainable = VarMap::new();
        let trainable_vb = VarBuilder::from_varmap(&trainable, DType::F32, device);

        let unet_config = model.unet.to_candle();
        let (unet, unet_dtype) = if settings.sd_locked {
            let unet = unet_2d::UNet2DConditionModel::new(
                frozen.pp(&prefixes.unet),
                model.unet.in_channels,
                model.unet.out_channels,
                model.unet.use_flash_attn,
                unet_config,
            )
            .context("Failed to build the UNet")?;
            (unet, dtype)
        } else {
            let unet = unet_2d::UNet2DConditionModel::new(
                trainable_vb.pp(&prefixes.unet),
                model.unet.in_channels,
                model.unet.out_channels,
                model.unet.use_flash_attn,
                unet_config,
            )
            .context("Failed to build the UNet")?;
            (unet, DType::F32)
        };

        let controlnet = ControlNet::new(
            trainable_vb.pp(&prefixes.controlnet),
            &model.unet,
            &model.controlnet,
            config.control_scales(),
        )
        .context("Failed to build the ControlNet")?;

        load_trainable(&trainable, &weights, &prefixes.controlnet, &prefixes.unet)?;

        let unet_trainable: Vec<String> = UNET_DECODER_GROUPS
            .iter()
            .map(|group| format!("{}.{}", prefixes.unet, group))
            .collect();
        let controlnet_prefix = format!("{}.", prefixes.controlnet);
        let trainable_names = named_vars(&trainable)
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| {
                name.starts_with(&controlnet_prefix)
                    || (!settings.sd_locked && unet_trainable.iter().any(|g| name.starts_with(g)))
            })
            .collect();

        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        info!(
            "ControlLDM ready on {:?} (frozen dtype {:?}, sd_locked {}, only_mid_control {})",
            device, dtype, settings.sd_locked, settings.only_mid_control
        );

        Ok(Self {
            vae,
            unet,
            controlnet,
            text,
            scheduler,
            trainable,
            trainable_names,
            settings,
            scale_factor: model.scale_factor,
            dtype,
            unet_dtype,
            device: device.clone(),
            rng,
        })
    }

    /// `(B, H, W, 3)` images in `[-1, 1]` to scaled latents.
    fn encode_first_stage(&self, images: &Tensor) -> Result<Tensor> {
        let images = images
            .to_device(&self.device)?
            .permute((0, 3, 1, 2))?
            .to_dtype(self.dtype)?
            .contiguous()?;
        let latents = self.vae.encode(&images)?.sample()?;
        Ok((latents * self.scale_factor)?.detach())
    }

    fn decode_first_stage(&self, latents: &Tensor) -> Result<Tensor> {
        let latents = (latents.to_dtype(self.dtype)? / self.scale_factor)?;
        Ok(self.vae.decode(&latents)?.to_dtype(DType::F32)?.detach())
    }

    /// `(B, H, W, 3)` hint to the channel-first `f32` ControlNet input.
    fn prepare_hint(&self, hint: &Tensor) -> Result<Tensor> {
        Ok(hint
            .to_device(&self.device)?
            .permute((0, 3, 1, 2))?
            .to_dtype(DType::F32)?
            .contiguous()?)
    }

    fn randn(&mut self, shape: &[usize]) -> Result<Tensor> {
        let n = shape.iter().product();
        let data: Vec<f32> = (0..n).map(|_| self.rng.sample(StandardNormal)).collect();
        Ok(Tensor::from_vec(data, shape, &self.device)?)
    }

    /// Predicted noise for `x_noisy` at timestep `t`.
    fn apply_model(&self, x_noisy: &Tensor, hint: &Tensor, t: usize, context: &Tensor) -> Result<Tensor> {
        let batch_size = x_noisy.dim(0)?;
        let timesteps = DDPMScheduler::timestep_tensor(t, batch_size, &self.device)?;
        let control = self.controlnet.forward(
            &x_noisy.to_dtype(DType::F32)?,
            hint,
            &timesteps,
            &context.to_dtype(DType::F32)?,
        )?;

        let down = control
            .down_block_residuals
            .iter()
            .map(|r| r.to_dtype(self.unet_dtype))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let mid = control.mid_block_residual.to_dtype(self.unet_dtype)?;
        let down = if self.settings.only_mid_control {
            None
        } else {
            Some(down.as_slice())
        };

        let eps = self.unet.forward_with_additional_residuals(
            &x_noisy.to_dtype(self.unet_dtype)?,
            t as f64,
            &context.to_dtype(self.unet_dtype)?,
            down,
            Some(&mid),
        )?;
        Ok(eps)
    }

    /// Classifier-free guided DDIM sampling from pure noise.
    fn sample_ddim(
        &mut self,
        hint: &Tensor,
        context: &Tensor,
        uncond: &Tensor,
        latent_shape: &[usize],
        options: &LogImagesOptions,
    ) -> Result<Tensor> {
        let sampler = DDIMSampler::new(&self.scheduler, options.ddim_steps)?;
        let mut x = self.randn(latent_shape)?;
        let steps = sampler.num_steps();

        for (i, t) in sampler.timesteps().into_iter().enumerate() {
            let cond = self.apply_model(&x, hint, t, context)?.to_dtype(DType::F32)?;
            let eps = if options.guidance_scale == 1.0 {
                cond
            } else {
                let uncond_eps = self.apply_model(&x, hint, t, uncond)?.to_dtype(DType::F32)?;
                (&uncond_eps + ((cond - &uncond_eps)? * options.guidance_scale)?)?
            };
            x = sampler.step(&x, &eps, steps - i - 1)?.detach();
        }
        Ok(x)
    }
}

impl TrainableModel for ControlLdm {
    fn training_step(&mut self, batch: &Batch) -> Result<Tensor> {
        let latents = self.encode_first_stage(&batch.jpg)?;
        let hint = self.prepare_hint(&batch.hint)?;
        let context = self.text.encode_batch(&batch.txt)?.to_device(&self.device)?;

        let t = self.scheduler.sample_timestep(&mut self.rng);
        let noise = self.randn(latents.dims())?;
        let x_noisy = self
            .scheduler
            .add_noise(&latents.to_dtype(DType::F32)?, &noise, t)?;

        let eps = self.apply_model(&x_noisy, &hint, t, &context)?;
        let loss = (eps.to_dtype(DType::F32)? - &noise)?.sqr()?.mean_all()?;
        Ok(loss)
    }

    fn trainable_vars(&self) -> Vec<(String, Var)> {
        named_vars(&self.trainable)
            .into_iter()
            .filter(|(name, _)| self.trainable_names.contains(name))
            .collect()
    }

    fn learning_rate(&self) -> f64 {
        self.settings.learning_rate
    }

    fn log_images(&mut self, batch: &Batch, options: &LogImagesOptions) -> Result<Vec<(String, Tensor)>> {
        let n = batch.len().min(options.max_images);
        let jpg = batch.jpg.narrow(0, 0, n)?;
        let hint = self.prepare_hint(&batch.hint.narrow(0, 0, n)?)?;
        let context = self
            .text
            .encode_batch(&batch.txt[..n])?
            .to_device(&self.device)?;
        let uncond = self
            .text
            .encode_batch(&vec![String::new(); n])?
            .to_device(&self.device)?;

        let latents = self.encode_first_stage(&jpg)?;
        let reconstruction = self.decode_first_stage(&latents)?;

        let samples = self.sample_ddim(&hint, &context, &uncond, latents.dims(), options)?;
        let samples = self.decode_first_stage(&samples)?;

        Ok(vec![
            ("reconstruction".to_string(), reconstruction),
            ("control".to_string(), hint.detach()),
            (
                format!("samples_cfg_scale_{:.2}", options.guidance_scale),
                samples,
            ),
        ])
    }
}

/// Vars of `varmap` sorted by name.
fn named_vars(varmap: &VarMap) -> Vec<(String, Var)> {
    let data = varmap
        .data()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
}

/// Fill the freshly built trainable vars from the checkpoint.
///
/// ControlNet weights missing from the checkpoint are copied from the UNet
/// weight of the same name, which is how a ControlNet starts from a plain
/// Stable Diffusion checkpoint. The hint encoder and zero convs have no UNet
/// counterpart and keep their fresh initialisation. Every other var must be
/// present.
fn load_trainable(
    varmap: &VarMap,
    weights: &HashMap<String, Tensor>,
    controlnet_prefix: &str,
    unet_prefix: &str,
) -> Result<()> {
    let controlnet_prefix = format!("{}.", controlnet_prefix);
    let (mut loaded, mut from_unet, mut fresh) = (0usize, 0usize, 0usize);

    for (name, var) in named_vars(varmap) {
        let tensor = match weights.get(&name) {
            Some(tensor) => {
                loaded += 1;
                tensor
            }
            None => {
                let suffix = name
                    .strip_prefix(&controlnet_prefix)
                    .with_context(|| format!("Checkpoint is missing '{}'", name))?;
                if suffix.starts_with("controlnet_") {
                    fresh += 1;
                    continue;
                }
                let unet_name = format!("{}.{}", unet_prefix, suffix);
                let tensor = weights
                    .get(&unet_name)
                    .with_context(|| format!("Checkpoint has neither '{}' nor '{}'", name, unet_name))?;
                from_unet += 1;
                tensor
            }
        };
        anyhow::ensure!(
            tensor.dims() == var.dims(),
            "Shape mismatch for '{}': checkpoint {:?}, model {:?}",
            name,
            tensor.dims(),
            var.dims()
        );
        var.set(&tensor.to_device(var.device())?.to_dtype(DType::F32)?)?;
    }

    if from_unet > 0 {
        warn!(
            "ControlNet not found in checkpoint: {} tensors copied from the UNet, {} freshly initialised",
            from_unet, fresh
        );
    }
    info!("Loaded {} trainable tensors from checkpoint", loaded);
    Ok(())
}
