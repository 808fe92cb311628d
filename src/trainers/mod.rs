//! Training engine: noise schedule, fit loop, checkpoints and image logging

pub mod checkpoint;
pub mod ddpm_scheduler;
pub mod image_logger;
pub mod image_utils;
pub mod trainer;

pub use ddpm_scheduler::{BetaSchedule, DDIMSampler, DDPMScheduler};
pub use image_logger::ImageLogger;
pub use trainer::{Callback, LogImagesOptions, LoopState, TrainableModel, Trainer, TrainerConfig};
