//! Periodic image logging during training

use anyhow::{Context, Result};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

use super::image_utils::{make_grid, save_image};
use super::trainer::{Callback, LogImagesOptions, LoopState, TrainableModel};
use crate::data::Batch;

pub const GRID_COLUMNS: usize = 4;
pub const GRID_PADDING: usize = 2;

/// Writes a grid per image key every `batch_frequency` batches.
pub struct ImageLogger {
    batch_frequency: usize,
    options: LogImagesOptions,
    log_dir: PathBuf,
    enabled: bool,
}

impl ImageLogger {
    pub fn new(batch_frequency: usize, output_dir: &Path) -> Self {
        Self {
            batch_frequency: batch_frequency.max(1),
            options: LogImagesOptions::default(),
            log_dir: output_dir.join("image_log").join("train"),
            enabled: true,
        }
    }

    pub fn with_options(mut self, options: LogImagesOptions) -> Self {
        self.options = options;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    fn should_log(&self, batch_idx: usize) -> bool {
        self.enabled && batch_idx % self.batch_frequency == 0
    }

    /// `{key}_gs-{global_step:06}_e-{epoch:06}_b-{batch_idx:06}.png`
    pub fn file_name(key: &str, state: &LoopState) -> String {
        format!(
            "{}_gs-{:06}_e-{:06}_b-{:06}.png",
            key, state.global_step, state.epoch, state.batch_idx
        )
    }

    fn write_images<M: TrainableModel>(&self, model: &mut M, batch: &Batch, state: &LoopState) -> Result<()> {
        let images = model
            .log_images(batch, &self.options)
            .context("Failed to generate log images")?;
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("Failed to create directory: {}", self.log_dir.display()))?;

        for (key, images) in images {
            let n = images.dim(0)?.min(self.options.max_images);
            if n == 0 {
                continue;
            }
            let images = images.narrow(0, 0, n)?.clamp(-1f32, 1f32)?;
            let grid = make_grid(&images, GRID_COLUMNS, GRID_PADDING)?;
            let path = self.log_dir.join(Self::file_name(&key, state));
            save_image(&grid, &path)?;
        }
        info!(
            "Logged images at epoch {} batch {} (step {})",
            state.epoch, state.batch_idx, state.global_step
        );
        Ok(())
    }
}

impl<M: TrainableModel> Callback<M> for ImageLogger {
    fn on_train_batch_end(&mut self, model: &mut M, batch: &Batch, state: &LoopState) -> Result<()> {
        if self.should_log(state.batch_idx) {
            self.write_images(model, batch, state)?;
        }
        Ok(())
    }
}
