//! Data pipeline for ControlNet training
//!
//! Three layers, leaves first:
//! - [`noisy::NoisyDataset`] reads (render, ground truth) image pairs from disk
//! - [`adapter::ControlNetDataset`] converts each pair to the ControlNet input contract
//! - [`loader::DataLoader`] shuffles and batches adapted records

pub mod adapter;
pub mod loader;
pub mod noisy;

pub use adapter::{ControlNetDataset, ControlRecord};
pub use loader::{Batch, DataLoader};
pub use noisy::{ImageTransform, NoisyDataset};

use candle_core::Tensor;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading samples.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("index {index} out of range for dataset of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("no image pairs found under {0}")]
    Empty(PathBuf),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

/// Index-addressable sample source.
///
/// Lookups are synchronous and must return `IndexOutOfRange` for any
/// `index >= len()`.
pub trait Dataset {
    type Item;

    fn len(&self) -> usize;

    fn get(&self, index: usize) -> Result<Self::Item, DatasetError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A raw training sample: the rendered (noisy) image and its ground truth.
///
/// Both tensors are `f32`, channel-first `(3, H, W)`, with values in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct ImagePair {
    pub render: Tensor,
    pub ground_truth: Tensor,
}

/// Bounds check shared by every provider.
pub(crate) fn check_index(index: usize, len: usize) -> Result<(), DatasetError> {
    if index >= len {
        return Err(DatasetError::IndexOutOfRange { index, len });
    }
    Ok(())
}
