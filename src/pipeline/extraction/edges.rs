//! Edge maps and edge density, the cheap first stage of the text gate.

use image::{DynamicImage, GrayImage, Luma};

use super::types::EdgeDetector;

/// Sobel gradient-magnitude edge detector.
///
/// A pixel is an edge when `sqrt(gx² + gy²)` over its 3x3 neighbourhood
/// exceeds `magnitude_threshold`. Border pixels are never edges.
#[derive(Debug, Clone)]
pub struct SobelEdgeDetector {
    pub magnitude_threshold: f32,
}

impl SobelEdgeDetector {
    pub fn new(magnitude_threshold: f32) -> Self {
        Self {
            magnitude_threshold,
        }
    }
}

impl Default for SobelEdgeDetector {
    fn default() -> Self {
        Self::new(100.0)
    }
}

impl EdgeDetector for SobelEdgeDetector {
    fn detect_edges(&self, luma: &GrayImage) -> GrayImage {
        let (w, h) = (luma.width(), luma.height());
        let mut edges = GrayImage::new(w, h);
        if w < 3 || h < 3 {
            return edges;
        }

        let px = |x: u32, y: u32| luma.get_pixel(x, y).0[0] as f32;

        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let gx = (px(x + 1, y - 1) + 2.0 * px(x + 1, y) + px(x + 1, y + 1))
                    - (px(x - 1, y - 1) + 2.0 * px(x - 1, y) + px(x - 1, y + 1));
                let gy = (px(x - 1, y + 1) + 2.0 * px(x, y + 1) + px(x + 1, y + 1))
                    - (px(x - 1, y - 1) + 2.0 * px(x, y - 1) + px(x + 1, y - 1));
                let magnitude = (gx * gx + gy * gy).sqrt();
                if magnitude > self.magnitude_threshold {
                    edges.put_pixel(x, y, Luma([255]));
                }
            }
        }
        edges
    }
}

/// Luma (grayscale) view of any decoded image.
pub fn to_luma(image: &DynamicImage) -> GrayImage {
    image::imageops::grayscale(image)
}

/// Fraction of non-zero pixels in an edge map. Empty maps have density 0.
pub fn edge_density(edges: &GrayImage) -> f32 {
    let total = edges.width() as u64 * edges.height() as u64;
    if total == 0 {
        return 0.0;
    }
    let on = edges.pixels().filter(|p| p.0[0] > 0).count() as u64;
    on as f32 / total as f32
}
