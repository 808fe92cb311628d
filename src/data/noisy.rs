//! Noisy image-pair dataset
//!
//! Expects the following layout under the dataset root:
//!
//! ```text
//! <root>/<split>/render/<name>.png   rendered (noisy) image
//! <root>/<split>/gt/<name>.png       ground truth image
//! ```
//!
//! Files are paired by stem and ordered by stem. Unpaired files are skipped.

use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::DynamicImage;
use log::{info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::{check_index, Dataset, DatasetError, ImagePair};

pub const RENDER_DIR: &str = "render";
pub const GROUND_TRUTH_DIR: &str = "gt";

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

/// Resize-and-crop transform applied to both images of a pair.
#[derive(Debug, Clone, Copy)]
pub struct ImageTransform {
    pub size: u32,
}

impl ImageTransform {
    pub fn new(size: u32) -> Self {
        Self { size }
    }

    /// Resize the shorter side to `size`, center-crop to `size x size`, and
    /// return a `(3, size, size)` tensor in `[0, 1]`.
    pub fn apply(&self, img: &DynamicImage) -> Result<Tensor, DatasetError> {
        let img = img.resize_to_fill(self.size, self.size, FilterType::Triangle);
        image_to_tensor(&img)
    }
}

/// Convert an image to a channel-first `f32` tensor in `[0, 1]`.
pub fn image_to_tensor(img: &DynamicImage) -> Result<Tensor, DatasetError> {
    let img = img.to_rgb8();
    let (width, height) = (img.width() as usize, img.height() as usize);
    let data = img.into_raw();
    let tensor = Tensor::from_vec(data, (height, width, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?;
    Ok((tensor / 255.0)?)
}

#[derive(Debug, Clone)]
struct PairPaths {
    render: PathBuf,
    ground_truth: PathBuf,
}

/// (render, ground truth) pairs read from disk.
pub struct NoisyDataset {
    transform: ImageTransform,
    pairs: Vec<PairPaths>,
    cache: Option<Vec<ImagePair>>,
}

impl NoisyDataset {
    /// Scan `<root>/<split>` for image pairs. With `load_into_memory` every
    /// pair is decoded and transformed up front.
    pub fn new(
        root: impl AsRef<Path>,
        split: &str,
        transform: ImageTransform,
        load_into_memory: bool,
    ) -> Result<Self, DatasetError> {
        let root = root.as_ref().to_path_buf();
        let split_dir = root.join(split);
        let pairs = scan_pairs(&split_dir)?;

        if pairs.is_empty() {
            return Err(DatasetError::Empty(split_dir));
        }
        info!(
            "Found {} image pairs in {} (split '{}')",
            pairs.len(),
            root.display(),
            split
        );

        let mut dataset = Self {
            transform,
            pairs,
            cache: None,
        };

        if load_into_memory {
            info!("Loading {} pairs into memory", dataset.pairs.len());
            let cache = dataset
                .pairs
                .iter()
                .map(|paths| dataset.load_pair(paths))
                .collect::<Result<Vec<_>, _>>()?;
            dataset.cache = Some(cache);
        }

        Ok(dataset)
    }

    pub fn is_in_memory(&self) -> bool {
        self.cache.is_some()
    }

    fn load_pair(&self, paths: &PairPaths) -> Result<ImagePair, DatasetError> {
        let render = self.transform.apply(&open_image(&paths.render)?)?;
        let ground_truth = self.transform.apply(&open_image(&paths.ground_truth)?)?;
        Ok(ImagePair {
            render,
            ground_truth,
        })
    }
}

impl Dataset for NoisyDataset {
    type Item = ImagePair;

    fn len(&self) -> usize {
        self.pairs.len()
    }

    fn get(&self, index: usize) -> Result<ImagePair, DatasetError> {
        check_index(index, self.pairs.len())?;
        match &self.cache {
            Some(cache) => Ok(cache[index].clone()),
            None => self.load_pair(&self.pairs[index]),
        }
    }
}

fn open_image(path: &Path) -> Result<DynamicImage, DatasetError> {
    image::open(path).map_err(|source| DatasetError::Image {
        path: path.to_path_buf(),
        source,
    })
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map_or(false, |ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Image files in `dir` keyed by stem.
fn images_by_stem(dir: &Path) -> Result<BTreeMap<String, PathBuf>, DatasetError> {
    let io_err = |source| DatasetError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut images = BTreeMap::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if !path.is_file() || !is_image(&path) {
            continue;
        }
        if let Some(stem) = path.file_stem() {
            images.insert(stem.to_string_lossy().into_owned(), path);
        }
    }
    Ok(images)
}

fn scan_pairs(split_dir: &Path) -> Result<Vec<PairPaths>, DatasetError> {
    let renders = images_by_stem(&split_dir.join(RENDER_DIR))?;
    let mut ground_truths = images_by_stem(&split_dir.join(GROUND_TRUTH_DIR))?;

    let mut pairs = Vec::with_capacity(renders.len());
    for (stem, render) in renders {
        match ground_truths.remove(&stem) {
            Some(ground_truth) => pairs.push(PairPaths {
                render,
                ground_truth,
            }),
            None => warn!("No ground truth for render {}, skipping", render.display()),
        }
    }
    for orphan in ground_truths.values() {
        warn!("No render for ground truth {}, skipping", orphan.display());
    }

    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::D;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn write_image(path: &Path, width: u32, height: u32, color: [u8; 3]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(width, height, Rgb(color))
            .save(path)
            .unwrap();
    }

    fn fixture(names: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (i, name) in names.iter().enumerate() {
            let shade = (i * 40) as u8;
            write_image(
                &dir.path().join("train/render").join(format!("{name}.png")),
                48,
                32,
                [shade, 0, 255],
            );
            write_image(
                &dir.path().join("train/gt").join(format!("{name}.png")),
                48,
                32,
                [255, shade, 0],
            );
        }
        dir
    }

    #[test]
    fn test_pairs_sorted_by_stem() {
        let dir = fixture(&["b", "a", "c"]);
        let dataset = NoisyDataset::new(dir.path(), "train", ImageTransform::new(16), false).unwrap();
        assert_eq!(dataset.len(), 3);
        let stems: Vec<_> = dataset
            .pairs
            .iter()
            .map(|p| p.render.file_stem().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(stems, ["a", "b", "c"]);
    }

    #[test]
    fn test_unpaired_files_skipped() {
        let dir = fixture(&["a", "b"]);
        write_image(&dir.path().join("train/render/lonely.png"), 8, 8, [0, 0, 0]);
        write_image(&dir.path().join("train/gt/orphan.png"), 8, 8, [0, 0, 0]);
        fs::write(dir.path().join("train/render/notes.txt"), "not an image").unwrap();

        let dataset = NoisyDataset::new(dir.path(), "train", ImageTransform::new(16), false).unwrap();
        assert_eq!(dataset.len(), 2);
    }

    #[test]
    fn test_transform_shape_and_range() -> anyhow::Result<()> {
        let dir = fixture(&["a"]);
        let dataset = NoisyDataset::new(dir.path(), "train", ImageTransform::new(16), false)?;
        let pair = dataset.get(0)?;
        assert_eq!(pair.render.dims(), &[3, 16, 16]);
        assert_eq!(pair.ground_truth.dims(), &[3, 16, 16]);

        let min = pair.render.flatten_all()?.min(D::Minus1)?.to_scalar::<f32>()?;
        let max = pair.render.flatten_all()?.max(D::Minus1)?.to_scalar::<f32>()?;
        assert!(min >= 0.0 && max <= 1.0);

        // Render was [0, 0, 255]: red channel 0, blue channel 1.
        let red = pair.render.get(0)?.mean_all()?.to_scalar::<f32>()?;
        let blue = pair.render.get(2)?.mean_all()?.to_scalar::<f32>()?;
        assert!(red.abs() < 0.01);
        assert!((blue - 1.0).abs() < 0.01);
        Ok(())
    }

    #[test]
    fn test_in_memory_matches_lazy() -> anyhow::Result<()> {
        let dir = fixture(&["a", "b"]);
        let lazy = NoisyDataset::new(dir.path(), "train", ImageTransform::new(8), false)?;
        let eager = NoisyDataset::new(dir.path(), "train", ImageTransform::new(8), true)?;
        assert!(!lazy.is_in_memory());
        assert!(eager.is_in_memory());

        for i in 0..2 {
            let a = lazy.get(i)?.ground_truth.flatten_all()?.to_vec1::<f32>()?;
            let b = eager.get(i)?.ground_truth.flatten_all()?.to_vec1::<f32>()?;
            assert_eq!(a, b);
        }
        Ok(())
    }

    #[test]
    fn test_out_of_range() {
        let dir = fixture(&["a"]);
        let dataset = NoisyDataset::new(dir.path(), "train", ImageTransform::new(8), true).unwrap();
        assert!(matches!(
            dataset.get(1),
            Err(DatasetError::IndexOutOfRange { index: 1, len: 1 })
        ));
    }

    #[test]
    fn test_empty_split_is_error() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("train/render")).unwrap();
        fs::create_dir_all(dir.path().join("train/gt")).unwrap();
        assert!(matches!(
            NoisyDataset::new(dir.path(), "train", ImageTransform::new(8), false),
            Err(DatasetError::Empty(_))
        ));
    }

    #[test]
    fn test_missing_split_is_io_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            NoisyDataset::new(dir.path(), "val", ImageTransform::new(8), false),
            Err(DatasetError::Io { .. })
        ));
    }
}
