//! ControlNet dataset adapter
//!
//! The raw provider yields channel-first images in `[0, 1]`. The ControlNet
//! training step expects channel-last images in `[-1, 1]` plus a text prompt
//! under the keys `jpg`, `hint` and `txt`. This adapter bridges exactly those
//! two differences:
//!
//! | | provider (precondition) | adapter (postcondition) |
//! |---|---|---|
//! | layout | `(3, H, W)` | `(H, W, 3)` |
//! | range | `[0, 1]` | `[-1, 1]` via `x ↦ 2x − 1` |
//!
//! Lookups are pure: nothing is cached and no randomness is involved.

use candle_core::Tensor;

use super::{Dataset, DatasetError, ImagePair};

/// One training record in the ControlNet input contract.
#[derive(Debug, Clone)]
pub struct ControlRecord {
    /// Ground truth image, `(H, W, 3)` in `[-1, 1]`.
    pub jpg: Tensor,
    /// Rendered image used as the control hint, `(H, W, 3)` in `[-1, 1]`.
    pub hint: Tensor,
    /// Text conditioning, identical for every record of a run.
    pub txt: String,
}

/// Wraps a raw pair dataset and presents it as [`ControlRecord`]s.
pub struct ControlNetDataset<D> {
    inner: D,
    prompt: String,
}

impl<D> ControlNetDataset<D>
where
    D: Dataset<Item = ImagePair>,
{
    pub fn new(inner: D, prompt: impl Into<String>) -> Self {
        Self {
            inner,
            prompt: prompt.into(),
        }
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }
}

impl<D> Dataset for ControlNetDataset<D>
where
    D: Dataset<Item = ImagePair>,
{
    type Item = ControlRecord;

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn get(&self, index: usize) -> Result<ControlRecord, DatasetError> {
        let ImagePair {
            render,
            ground_truth,
        } = self.inner.get(index)?;

        Ok(ControlRecord {
            jpg: to_model_space(&ground_truth)?,
            hint: to_model_space(&render)?,
            txt: self.prompt.clone(),
        })
    }
}

/// `(C, H, W)` in `[0, 1]` to `(H, W, C)` in `[-1, 1]`.
fn to_model_space(image: &Tensor) -> Result<Tensor, DatasetError> {
    let scaled = image.affine(2.0, -1.0)?;
    Ok(scaled.permute((1, 2, 0))?.contiguous()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::check_index;
    use candle_core::{DType, Device, D};

    const DEFAULT_PROMPT: &str = "best quality, extremely detailed";

    /// Provider returning the same pair for every index.
    struct ConstantPairs {
        len: usize,
        pair: ImagePair,
    }

    impl ConstantPairs {
        fn zeros(len: usize, height: usize, width: usize) -> Self {
            let zeros = Tensor::zeros((3, height, width), DType::F32, &Device::Cpu).unwrap();
            Self {
                len,
                pair: ImagePair {
                    render: zeros.clone(),
                    ground_truth: zeros,
                },
            }
        }
    }

    impl Dataset for ConstantPairs {
        type Item = ImagePair;

        fn len(&self) -> usize {
            self.len
        }

        fn get(&self, index: usize) -> Result<ImagePair, DatasetError> {
            check_index(index, self.len)?;
            Ok(self.pair.clone())
        }
    }

    /// Provider whose render and ground truth differ per channel.
    struct Gradient;

    impl Dataset for Gradient {
        type Item = ImagePair;

        fn len(&self) -> usize {
            3
        }

        fn get(&self, index: usize) -> Result<ImagePair, DatasetError> {
            check_index(index, 3)?;
            let (h, w) = (4, 5);
            let render: Vec<f32> = (0..3 * h * w)
                .map(|i| i as f32 / (3 * h * w - 1) as f32)
                .collect();
            let render = Tensor::from_vec(render, (3, h, w), &Device::Cpu)?;
            let ground_truth = (Tensor::ones((3, h, w), DType::F32, &Device::Cpu)? * 0.25)?;
            Ok(ImagePair {
                render,
                ground_truth,
            })
        }
    }

    #[test]
    fn test_zero_pairs_scenario() -> anyhow::Result<()> {
        let dataset = ControlNetDataset::new(ConstantPairs::zeros(10, 512, 512), DEFAULT_PROMPT);
        assert_eq!(dataset.len(), 10);

        let record = dataset.get(0)?;
        assert_eq!(record.jpg.dims(), &[512, 512, 3]);
        assert_eq!(record.hint.dims(), &[512, 512, 3]);

        for image in [&record.jpg, &record.hint] {
            let min = image.flatten_all()?.min(D::Minus1)?.to_scalar::<f32>()?;
            let max = image.flatten_all()?.max(D::Minus1)?.to_scalar::<f32>()?;
            assert_eq!(min, -1.0);
            assert_eq!(max, -1.0);
        }
        assert_eq!(record.txt, DEFAULT_PROMPT);
        Ok(())
    }

    #[test]
    fn test_range_and_layout() -> anyhow::Result<()> {
        let dataset = ControlNetDataset::new(Gradient, "prompt");
        let raw = Gradient.get(1)?;
        let record = dataset.get(1)?;

        // Channel axis moves last, spatial axes keep their order.
        assert_eq!(raw.render.dims(), &[3, 4, 5]);
        assert_eq!(record.hint.dims(), &[4, 5, 3]);

        let values = record.hint.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
        assert!(values.iter().any(|&v| v == -1.0));
        assert!(values.iter().any(|&v| v == 1.0));

        // Pixel (c=2, y=3, x=4) lands at (3, 4, 2) and is remapped.
        let src = raw.render.get(2)?.get(3)?.get(4)?.to_scalar::<f32>()?;
        let dst = record.hint.get(3)?.get(4)?.get(2)?.to_scalar::<f32>()?;
        assert!((dst - (2.0 * src - 1.0)).abs() < 1e-6);

        // Ground truth is transformed independently of the render.
        let gt = record.jpg.flatten_all()?.to_vec1::<f32>()?;
        assert!(gt.iter().all(|&v| (v + 0.5).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn test_input_tensors_untouched() -> anyhow::Result<()> {
        let provider = ConstantPairs::zeros(1, 2, 2);
        let original = provider.pair.render.clone();
        let dataset = ControlNetDataset::new(provider, "p");
        let _ = dataset.get(0)?;
        let after = dataset.inner.pair.render.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(after, original.flatten_all()?.to_vec1::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_length_pass_through() {
        for len in [0, 1, 7, 64] {
            let dataset = ControlNetDataset::new(ConstantPairs::zeros(len, 1, 1), "p");
            assert_eq!(dataset.len(), len);
            assert_eq!(dataset.is_empty(), len == 0);
        }
    }

    #[test]
    fn test_prompt_is_constant() -> anyhow::Result<()> {
        let dataset = ControlNetDataset::new(Gradient, "a fixed prompt");
        for i in 0..dataset.len() {
            assert_eq!(dataset.get(i)?.txt, "a fixed prompt");
        }
        assert_eq!(dataset.prompt(), "a fixed prompt");
        Ok(())
    }

    #[test]
    fn test_out_of_range_passes_through() {
        let dataset = ControlNetDataset::new(ConstantPairs::zeros(10, 1, 1), "p");
        let err = dataset.get(10).unwrap_err();
        match err {
            DatasetError::IndexOutOfRange { index, len } => {
                assert_eq!(index, 10);
                assert_eq!(len, 10);
            }
            other => panic!("unexpected error: {other}"),
        }
        let raw_err = ConstantPairs::zeros(10, 1, 1).get(10).unwrap_err();
        assert_eq!(
            dataset.get(10).unwrap_err().to_string(),
            raw_err.to_string()
        );
    }
}
