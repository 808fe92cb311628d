//! Image tensor helpers for writing training image logs

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use std::path::Path;

/// Save a `(3, H, W)` tensor holding values in `[-1, 1]` as an 8-bit image.
/// The format follows the file extension, defaulting to PNG.
pub fn save_image<P: AsRef<Path>>(tensor: &Tensor, path: P) -> Result<()> {
    let tensor = ((tensor.to_dtype(DType::F32)?.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?;
    let tensor = tensor.round()?.to_dtype(DType::U8)?;

    let (channel, height, width) = tensor.dims3().context("Expected 3D tensor [C, H, W]")?;
    if channel != 3 {
        anyhow::bail!("Expected 3 channels (RGB), got {}", channel);
    }

    let data = tensor.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
    let img = image::ImageBuffer::<image::Rgb<u8>, Vec<u8>>::from_raw(width as u32, height as u32, data)
        .context("Failed to create image buffer")?;

    let path = path.as_ref();
    let format = match path.extension().and_then(|s| s.to_str()) {
        Some("jpg") | Some("jpeg") => image::ImageFormat::Jpeg,
        _ => image::ImageFormat::Png,
    };
    img.save_with_format(path, format)
        .with_context(|| format!("Failed to save image {}", path.display()))?;
    Ok(())
}

/// Tile `(N, C, H, W)` images into one `(C, H', W')` grid with `nrow` images
/// per row and `padding` zero pixels around every tile.
pub fn make_grid(images: &Tensor, nrow: usize, padding: usize) -> Result<Tensor> {
    let (n, c, h, w) = images.dims4().context("Expected 4D tensor [N, C, H, W]")?;
    anyhow::ensure!(n > 0, "cannot build a grid from zero images");
    let cols = nrow.clamp(1, n);
    let rows = n.div_ceil(cols);

    let blank = Tensor::zeros((c, h, w), images.dtype(), images.device())?;
    let mut grid_rows = Vec::with_capacity(rows);
    for row in 0..rows {
        let mut tiles = Vec::with_capacity(cols);
        for col in 0..cols {
            let idx = row * cols + col;
            let tile = if idx < n { images.get(idx)? } else { blank.clone() };
            tiles.push(tile.pad_with_zeros(1, padding, 0)?.pad_with_zeros(2, padding, 0)?);
        }
        grid_rows.push(Tensor::cat(&tiles, 2)?.pad_with_zeros(2, 0, padding)?);
    }
    Ok(Tensor::cat(&grid_rows, 1)?.pad_with_zeros(1, 0, padding)?)
}
