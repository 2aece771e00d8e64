use std::path::Path;

use anyhow::{anyhow, Context, Result};
use citemark_core::RenderImage;
use image::RgbaImage;

pub fn to_rgba_image(image: &RenderImage) -> Result<RgbaImage> {
    RgbaImage::from_raw(image.width, image.height, image.pixels.clone()).ok_or_else(|| {
        anyhow!(
            "pixel buffer of {} bytes does not match {}x{} RGBA",
            image.pixels.len(),
            image.width,
            image.height
        )
    })
}

/// Writes a page raster, highlight overlay included, as PNG.
pub fn save_png(image: &RenderImage, path: &Path) -> Result<()> {
    to_rgba_image(image)?
        .save_with_format(path, image::ImageFormat::Png)
        .with_context(|| format!("failed to write {:?}", path))
}
