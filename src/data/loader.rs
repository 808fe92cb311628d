//! Single-threaded batch loader
//!
//! Samples are fetched on the calling thread, in order or in a per-epoch
//! shuffled order, and stacked into batch tensors. The last batch of an epoch
//! may be smaller than `batch_size`.

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::{ControlRecord, Dataset, DatasetError};

/// A stacked batch of [`ControlRecord`]s.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(B, H, W, 3)` ground truth images in `[-1, 1]`.
    pub jpg: Tensor,
    /// `(B, H, W, 3)` control hints in `[-1, 1]`.
    pub hint: Tensor,
    pub txt: Vec<String>,
}

impl Batch {
    pub fn from_records(records: Vec<ControlRecord>) -> Result<Self, DatasetError> {
        let jpg: Vec<&Tensor> = records.iter().map(|r| &r.jpg).collect();
        let hint: Vec<&Tensor> = records.iter().map(|r| &r.hint).collect();
        Ok(Self {
            jpg: Tensor::stack(&jpg, 0)?,
            hint: Tensor::stack(&hint, 0)?,
            txt: records.into_iter().map(|r| r.txt).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.txt.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txt.is_empty()
    }
}

pub struct DataLoader<D> {
    dataset: D,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
}

impl<D> DataLoader<D>
where
    D: Dataset<Item = ControlRecord>,
{
    /// `seed` fixes the shuffle order; without it the order is drawn from entropy.
    pub fn new(dataset: D, batch_size: usize, shuffle: bool, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            rng,
        }
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Start a new epoch. Draws a new permutation when shuffling.
    pub fn epoch(&mut self) -> EpochIter<'_, D> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        EpochIter {
            dataset: &self.dataset,
            order,
            batch_size: self.batch_size,
            cursor: 0,
        }
    }
}

/// Batches of one epoch.
pub struct EpochIter<'a, D> {
    dataset: &'a D,
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl<'a, D> EpochIter<'a, D> {
    /// Dataset indices of this epoch, in visiting order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }
}

impl<'a, D> Iterator for EpochIter<'a, D>
where
    D: Dataset<Item = ControlRecord>,
{
    type Item = Result<Batch, DatasetError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;

        let records = indices
            .iter()
            .map(|&i| self.dataset.get(i))
            .collect::<Result<Vec<_>, _>>();
        Some(records.and_then(Batch::from_records))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.order.len() - self.cursor).div_ceil(self.batch_size);
        (remaining, Some(remaining))
    }
}
