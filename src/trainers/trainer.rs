//! Fit loop
//!
//! Runs epochs over a [`DataLoader`], steps AdamW with gradient accumulation,
//! calls back after every batch and writes a checkpoint at the end of every
//! epoch. Only the newest checkpoint is kept on disk.

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};

use super::checkpoint::{self, TrainingState};
use crate::data::{Batch, ControlRecord, DataLoader, Dataset};

/// Image logging knobs passed to [`TrainableModel::log_images`].
#[derive(Debug, Clone)]
pub struct LogImagesOptions {
    pub max_images: usize,
    pub ddim_steps: usize,
    pub guidance_scale: f64,
}

impl Default for LogImagesOptions {
    fn default() -> Self {
        Self {
            max_images: 4,
            ddim_steps: 50,
            guidance_scale: 9.0,
        }
    }
}

/// A model the [`Trainer`] can fit.
pub trait TrainableModel {
    /// Scalar loss for one batch, attached to the graph of the trainable vars.
    fn training_step(&mut self, batch: &Batch) -> Result<Tensor>;

    /// Vars the optimizer updates, with stable names used in checkpoints.
    fn trainable_vars(&self) -> Vec<(String, Var)>;

    fn learning_rate(&self) -> f64;

    /// Named `(N, 3, H, W)` images in `[-1, 1]` describing the model's
    /// current behaviour on `batch`.
    fn log_images(&mut self, batch: &Batch, options: &LogImagesOptions) -> Result<Vec<(String, Tensor)>>;
}

/// Position in the fit loop, as seen by callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopState {
    pub epoch: usize,
    pub batch_idx: usize,
    pub global_step: usize,
}

pub trait Callback<M> {
    fn on_train_batch_end(&mut self, model: &mut M, batch: &Batch, state: &LoopState) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub max_epochs: usize,
    pub accumulate_grad_batches: usize,
    pub output_dir: PathBuf,
    pub resume_from: Option<PathBuf>,
    /// Loss is logged every this many optimizer steps.
    pub log_every_n_steps: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_epochs: 1000,
            accumulate_grad_batches: 1,
            output_dir: PathBuf::from("."),
            resume_from: None,
            log_every_n_steps: 50,
        }
    }
}

pub struct Trainer<M> {
    config: TrainerConfig,
    device: Device,
    callbacks: Vec<Box<dyn Callback<M>>>,
    global_step: usize,
    last_checkpoint: Option<PathBuf>,
}

impl<M: TrainableModel> Trainer<M> {
    pub fn new(config: TrainerConfig, device: Device) -> Self {
        Self {
            config,
            device,
            callbacks: Vec::new(),
            global_step: 0,
            last_checkpoint: None,
        }
    }

    pub fn add_callback(&mut self, callback: Box<dyn Callback<M>>) {
        self.callbacks.push(callback);
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn last_checkpoint(&self) -> Option<&PathBuf> {
        self.last_checkpoint.as_ref()
    }

    pub fn fit<D>(&mut self, model: &mut M, loader: &mut DataLoader<D>) -> Result<()>
    where
        D: Dataset<Item = ControlRecord>,
    {
        let vars = model.trainable_vars();
        anyhow::ensure!(!vars.is_empty(), "model has no trainable vars");
        let num_params: usize = vars.iter().map(|(_, v)| v.elem_count()).sum();
        info!(
            "Trainable parameters: {} in {} tensors",
            num_params,
            vars.len()
        );

        let start_epoch = match self.config.resume_from.clone() {
            Some(path) => self.resume(&path, &vars)?,
            None => 0,
        };

        let params = ParamsAdamW {
            lr: model.learning_rate(),
            ..Default::default()
        };
        let mut optimizer = AdamW::new(vars.iter().map(|(_, v)| v.clone()).collect(), params)?;
        let accumulate = self.config.accumulate_grad_batches.max(1);

        for epoch in start_epoch..self.config.max_epochs {
            let mut progress = EpochProgress::new(loader.num_batches(), epoch);
            let mut accumulated: Option<GradStore> = None;
            let mut window = LossWindow::default();
            let mut epoch_loss = 0.0;
            let mut num_batches = 0;

            for (batch_idx, batch) in loader.epoch().enumerate() {
                let batch = batch.with_context(|| format!("Failed to load batch {} of epoch {}", batch_idx, epoch))?;

                let loss = model
                    .training_step(&batch)
                    .with_context(|| format!("Training step failed at epoch {} batch {}", epoch, batch_idx))?;
                let loss_value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
                let grads = (loss / accumulate as f64)?.backward()?;
                accumulated = Some(merge_grads(accumulated, grads, &vars)?);
                window.push(loss_value);
                epoch_loss += loss_value as f64;
                num_batches += 1;

                if window.len() == accumulate {
                    self.optimizer_step(&mut optimizer, accumulated.take(), window.take_mean())?;
                }
                progress.tick(loss_value);

                let state = LoopState {
                    epoch,
                    batch_idx,
                    global_step: self.global_step,
                };
                for callback in self.callbacks.iter_mut() {
                    callback.on_train_batch_end(model, &batch, &state)?;
                }
            }

            if window.len() > 0 {
                self.optimizer_step(&mut optimizer, accumulated.take(), window.take_mean())?;
            }
            progress.finish();

            if num_batches > 0 {
                info!(
                    "Epoch {} done: mean loss {:.6}, global step {}",
                    epoch,
                    epoch_loss / num_batches as f64,
                    self.global_step
                );
            }
            self.save_epoch_checkpoint(epoch, &vars)?;
        }
        Ok(())
    }

    /// `loss` is the mean over the micro-batches of the accumulation window.
    fn optimizer_step(&mut self, optimizer: &mut AdamW, grads: Option<GradStore>, loss: f64) -> Result<()> {
        if let Some(grads) = grads {
            optimizer.step(&grads)?;
            self.global_step += 1;
            if self.global_step % self.config.log_every_n_steps.max(1) == 0 {
                info!("step {}: loss {:.6}", self.global_step, loss);
            }
        }
        Ok(())
    }

    fn resume(&mut self, path: &Path, vars: &[(String, Var)]) -> Result<usize> {
        let checkpoint = checkpoint::load_checkpoint(path, &self.device)
            .with_context(|| format!("Failed to resume from {}", path.display()))?;
        checkpoint::restore_vars(vars, &checkpoint.tensors)?;
        self.global_step = checkpoint.state.global_step;

        // Resuming from this run's own checkpoint: the next epoch replaces it.
        let own = checkpoint::checkpoint_path(&self.config.output_dir, checkpoint.state);
        if same_file(&own, path) {
            self.last_checkpoint = Some(path.to_path_buf());
        }
        info!(
            "Resumed from {} at epoch {}, global step {}",
            path.display(),
            checkpoint.state.epoch,
            checkpoint.state.global_step
        );
        Ok(checkpoint.state.epoch + 1)
    }

    fn save_epoch_checkpoint(&mut self, epoch: usize, vars: &[(String, Var)]) -> Result<()> {
        let state = TrainingState {
            epoch,
            global_step: self.global_step,
        };
        let path = checkpoint::checkpoint_path(&self.config.output_dir, state);
        checkpoint::save_checkpoint(&path, vars, state)?;

        if let Some(previous) = self.last_checkpoint.replace(path.clone()) {
            if previous != path {
                debug!("Removing previous checkpoint {}", previous.display());
                fs::remove_file(&previous)
                    .with_context(|| format!("Failed to remove {}", previous.display()))?;
            }
        }
        Ok(())
    }
}

/// Micro-batch losses of the current accumulation window.
#[derive(Debug, Default)]
struct LossWindow {
    sum: f64,
    count: usize,
}

impl LossWindow {
    fn push(&mut self, loss: f32) {
        self.sum += loss as f64;
        self.count += 1;
    }

    fn len(&self) -> usize {
        self.count
    }

    /// Mean of the window, which is then cleared.
    fn take_mean(&mut self) -> f64 {
        let mean = if self.count == 0 { 0.0 } else { self.sum / self.count as f64 };
        *self = Self::default();
        mean
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Add the gradients of `vars` in `grads` to the running sum.
fn merge_grads(accumulated: Option<GradStore>, grads: GradStore, vars: &[(String, Var)]) -> Result<GradStore> {
    let mut accumulated = match accumulated {
        Some(acc) => acc,
        None => return Ok(grads),
    };
    for (_, var) in vars {
        let tensor = var.as_tensor();
        if let Some(grad) = grads.get(tensor) {
            let sum = match accumulated.get(tensor) {
                Some(prev) => (prev + grad)?,
                None => grad.clone(),
            };
            accumulated.insert(tensor, sum);
        }
    }
    Ok(accumulated)
}

#[cfg(feature = "progress-bar")]
struct EpochProgress(indicatif::ProgressBar);

#[cfg(feature = "progress-bar")]
impl EpochProgress {
    fn new(len: usize, epoch: usize) -> Self {
        let bar = indicatif::ProgressBar::new(len as u64);
        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} epoch {prefix} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_prefix(epoch.to_string());
        Self(bar)
    }

    fn tick(&mut self, loss: f32) {
        self.0.set_message(format!("loss {:.4}", loss));
        self.0.inc(1);
    }

    fn finish(&mut self) {
        self.0.finish_and_clear();
    }
}

#[cfg(not(feature = "progress-bar"))]
struct EpochProgress;

#[cfg(not(feature = "progress-bar"))]
impl EpochProgress {
    fn new(_len: usize, _epoch: usize) -> Self {
        Self
    }

    fn tick(&mut self, _loss: f32) {}

    fn finish(&mut self) {}
}
