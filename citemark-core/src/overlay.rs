use serde::Serialize;

use crate::model::{HighlightBox, RectSource, RenderImage, ViewportSize};

const SERVER_COLOR: [u8; 3] = [255, 235, 0];
const SERVER_ALPHA: f32 = 0.35;
const FALLBACK_COLOR: [u8; 3] = [255, 200, 0];
const FALLBACK_ALPHA: f32 = 0.2;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlayBox {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
    pub id: String,
    pub source: RectSource,
}

/// Everything drawn above one page raster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlayFrame {
    /// 1-based.
    pub page: u32,
    pub width: f64,
    pub height: f64,
    pub boxes: Vec<OverlayBox>,
}

impl OverlayFrame {
    pub fn empty(page: u32, size: ViewportSize) -> Self {
        Self {
            page,
            width: size.width,
            height: size.height,
            boxes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}

/// Builds a fresh frame from the final boxes of a page.
///
/// Nothing is carried over from a previous frame.
pub fn render_overlay(page: u32, boxes: &[HighlightBox], size: ViewportSize) -> OverlayFrame {
    let size = size.sanitized();
    let boxes = boxes
        .iter()
        .filter(|highlight| highlight.abs.width > 0.0 && highlight.abs.height > 0.0)
        .map(|highlight| OverlayBox {
            left: highlight.abs.left,
            top: highlight.abs.top,
            width: highlight.abs.width,
            height: highlight.abs.height,
            id: highlight.rect.id.clone(),
            source: highlight.rect.source,
        })
        .collect();
    OverlayFrame {
        page,
        width: size.width,
        height: size.height,
        boxes,
    }
}

/// Blends `frame` into an RGBA raster of the same page.
///
/// The raster may differ in size from the frame; boxes are scaled to fit.
pub fn paint_onto(image: &mut RenderImage, frame: &OverlayFrame) {
    if image.width == 0 || image.height == 0 || frame.is_empty() {
        return;
    }
    let scale_x = image.width as f64 / frame.width;
    let scale_y = image.height as f64 / frame.height;

    // Fallback first so server boxes end up on top.
    let ordered = frame
        .boxes
        .iter()
        .filter(|overlay| overlay.source == RectSource::Fallback)
        .chain(
            frame
                .boxes
                .iter()
                .filter(|overlay| overlay.source == RectSource::Server),
        );
    for overlay in ordered {
        let (color, alpha) = match overlay.source {
            RectSource::Server => (SERVER_COLOR, SERVER_ALPHA),
            RectSource::Fallback => (FALLBACK_COLOR, FALLBACK_ALPHA),
        };
        let x0 = clamp_px(overlay.left * scale_x, image.width, f64::floor);
        let x1 = clamp_px((overlay.left + overlay.width) * scale_x, image.width, f64::ceil);
        let y0 = clamp_px(overlay.top * scale_y, image.height, f64::floor);
        let y1 = clamp_px((overlay.top + overlay.height) * scale_y, image.height, f64::ceil);
        fill_rect(image, (x0, y0, x1, y1), color, alpha);
    }
}

fn clamp_px(value: f64, max: u32, round: fn(f64) -> f64) -> u32 {
    if !value.is_finite() {
        return 0;
    }
    round(value).clamp(0.0, max as f64) as u32
}

fn fill_rect(
    image: &mut RenderImage,
    (x0, y0, x1, y1): (u32, u32, u32, u32),
    color: [u8; 3],
    alpha: f32,
) {
    if x0 >= x1 || y0 >= y1 {
        return;
    }
    let width = image.width as usize;
    let expected = width * image.height as usize * 4;
    if image.pixels.len() < expected {
        return;
    }
    for y in y0..y1 {
        let row_start = y as usize * width * 4;
        for x in x0..x1 {
            let idx = row_start + x as usize * 4;
            blend_pixel(&mut image.pixels[idx..idx + 4], color, alpha);
        }
    }
}

fn blend_pixel(pixel: &mut [u8], color: [u8; 3], alpha: f32) {
    let alpha = alpha.clamp(0.0, 1.0);
    let inv = 1.0 - alpha;
    for (channel, target) in pixel.iter_mut().zip(color) {
        *channel = (*channel as f32 * inv + target as f32 * alpha)
            .round()
            .clamp(0.0, 255.0) as u8;
    }
}
