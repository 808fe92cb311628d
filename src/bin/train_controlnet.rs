//! ControlNet de-splatting training binary

use anyhow::{Context, Result};
use log::info;
use std::fs;

use controlnet_desplat::config::{Args, TrainingConfig};
use controlnet_desplat::data::{ControlNetDataset, DataLoader, Dataset, ImageTransform, NoisyDataset};
use controlnet_desplat::logging;
use controlnet_desplat::models::{ControlLdm, ModelSettings};
use controlnet_desplat::trainers::{ImageLogger, Trainer, TrainerConfig};

fn main() -> Result<()> {
    logging::init_logger();

    let args = Args::parse_normalized();
    let config = TrainingConfig::from_args(args);
    info!("Configuration: {:?}", config);

    fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("Failed to create output directory: {}", config.output_dir.display()))?;
    config.save_json(&config.output_dir.join("run_config.json"))?;

    let device = config.accelerator.device()?;
    let dtype = config.precision.compute_dtype(&device);
    info!("Using device {:?} with compute dtype {:?}", device, dtype);

    let noisy = NoisyDataset::new(
        &config.dataset_root,
        &config.split,
        ImageTransform::new(config.image_size),
        config.dataset_in_memory,
    )
    .with_context(|| format!("Failed to open dataset at {}", config.dataset_root.display()))?;
    let dataset = ControlNetDataset::new(noisy, config.prompt.clone());
    info!("Dataset size: {}", dataset.len());

    let mut loader = DataLoader::new(dataset, config.batch_size, true, config.seed);

    let settings = ModelSettings {
        learning_rate: config.learning_rate,
        sd_locked: config.sd_locked,
        only_mid_control: config.only_mid_control,
        seed: config.seed,
    };
    let mut model = ControlLdm::from_files(&config.model_config, &config.model_path, settings, &device, dtype)?;

    let trainer_config = TrainerConfig {
        max_epochs: config.max_epochs,
        accumulate_grad_batches: config.accumulate_grad_batches,
        output_dir: config.output_dir.clone(),
        resume_from: config.resume_from.clone(),
        ..Default::default()
    };
    let mut trainer = Trainer::new(trainer_config, device);
    trainer.add_callback(Box::new(ImageLogger::new(config.logger_frequency, &config.output_dir)));

    trainer.fit(&mut model, &mut loader)?;
    info!("Training finished at global step {}", trainer.global_step());
    Ok(())
}
