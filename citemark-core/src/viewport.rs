use serde::{Deserialize, Serialize};

use crate::model::ViewportSize;

/// Mapping from page space (points, origin bottom-left) to viewport pixels
/// (origin top-left) for one page at one scale and rotation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageViewport {
    /// `[x_min, y_min, x_max, y_max]` of the page box in points.
    pub view_box: [f64; 4],
    pub scale: f64,
    /// Clockwise, one of 0, 90, 180, 270.
    pub rotation: u16,
    pub width: f64,
    pub height: f64,
    transform: [f64; 6],
}

impl PageViewport {
    pub fn new(page_width: f64, page_height: f64, scale: f64, rotation: i32) -> Self {
        Self::with_view_box([0.0, 0.0, page_width, page_height], scale, rotation)
    }

    pub fn with_view_box(view_box: [f64; 4], scale: f64, rotation: i32) -> Self {
        let rotation = rotation.rem_euclid(360);
        let center_x = (view_box[2] + view_box[0]) / 2.0;
        let center_y = (view_box[3] + view_box[1]) / 2.0;

        // The y axis is flipped so that the top edge of the page lands at 0.
        let (a, b, c, d) = match rotation {
            90 => (0.0, 1.0, 1.0, 0.0),
            180 => (-1.0, 0.0, 0.0, 1.0),
            270 => (0.0, -1.0, -1.0, 0.0),
            _ => (1.0, 0.0, 0.0, -1.0),
        };

        let (offset_x, offset_y, width, height) = if a == 0.0 {
            (
                (center_y - view_box[1]).abs() * scale,
                (center_x - view_box[0]).abs() * scale,
                (view_box[3] - view_box[1]) * scale,
                (view_box[2] - view_box[0]) * scale,
            )
        } else {
            (
                (center_x - view_box[0]).abs() * scale,
                (center_y - view_box[1]).abs() * scale,
                (view_box[2] - view_box[0]) * scale,
                (view_box[3] - view_box[1]) * scale,
            )
        };

        let transform = [
            a * scale,
            b * scale,
            c * scale,
            d * scale,
            offset_x - a * scale * center_x - c * scale * center_y,
            offset_y - b * scale * center_x - d * scale * center_y,
        ];

        Self {
            view_box,
            scale,
            rotation: rotation as u16,
            width: width.abs(),
            height: height.abs(),
            transform,
        }
    }

    pub fn size(&self) -> ViewportSize {
        ViewportSize::new(self.width, self.height)
    }

    pub fn to_viewport_point(&self, x: f64, y: f64) -> (f64, f64) {
        let t = &self.transform;
        (x * t[0] + y * t[2] + t[4], x * t[1] + y * t[3] + t[5])
    }

    /// Converts `[x1, y1, x2, y2]` in page space into viewport corner points.
    pub fn to_viewport_rect(&self, rect: [f64; 4]) -> [f64; 4] {
        let (x1, y1) = self.to_viewport_point(rect[0], rect[1]);
        let (x2, y2) = self.to_viewport_point(rect[2], rect[3]);
        [x1, y1, x2, y2]
    }

    /// Quantized size used to detect that cached normalized values went stale.
    pub fn size_key(&self) -> (u32, u32) {
        (quantize(self.width), quantize(self.height))
    }
}

fn quantize(value: f64) -> u32 {
    let scaled = (value * 1000.0).round();
    if !scaled.is_finite() || scaled <= 0.0 {
        1
    } else if scaled > u32::MAX as f64 {
        u32::MAX
    } else {
        scaled as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn unrotated_viewport_flips_y_axis() {
        let viewport = PageViewport::new(600.0, 800.0, 2.0, 0);
        assert!(approx(viewport.width, 1200.0));
        assert!(approx(viewport.height, 1600.0));

        let (x, y) = viewport.to_viewport_point(0.0, 800.0);
        assert!(approx(x, 0.0) && approx(y, 0.0));
        let (x, y) = viewport.to_viewport_point(600.0, 0.0);
        assert!(approx(x, 1200.0) && approx(y, 1600.0));
    }

    #[test]
    fn quarter_turn_swaps_dimensions() {
        let viewport = PageViewport::new(600.0, 800.0, 1.0, 90);
        assert!(approx(viewport.width, 800.0));
        assert!(approx(viewport.height, 600.0));
        // Top-left corner of the page moves to the top-right of the viewport.
        let (x, y) = viewport.to_viewport_point(0.0, 800.0);
        assert!(approx(x, 800.0) && approx(y, 0.0));
    }

    #[test]
    fn negative_rotation_wraps() {
        let viewport = PageViewport::new(100.0, 200.0, 1.0, -90);
        assert_eq!(viewport.rotation, 270);
    }

    #[test]
    fn size_key_changes_with_scale() {
        let a = PageViewport::new(600.0, 800.0, 1.0, 0);
        let b = PageViewport::new(600.0, 800.0, 1.25, 0);
        assert_ne!(a.size_key(), b.size_key());
        assert_eq!(a.size_key(), PageViewport::new(600.0, 800.0, 1.0, 0).size_key());
    }
}
