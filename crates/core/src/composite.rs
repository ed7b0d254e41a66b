//! Feathered re-assembly of processed tiles.
//!
//! Every internal tile edge fades in linearly over `feather` pixels. Each
//! canvas pixel is the weighted mean of the tiles covering it, using the
//! feather alpha as weight. Weights are kept as integer units so the sums are
//! exact and the result does not depend on painting order.

use image::{Rgb, RgbImage};
use ndarray::{Array2, Array3};

use crate::error::{ProcessError, Stage};
use crate::types::{RasterImage, TileRect};

/// Upper bound on the weight units of one tile pixel. Keeps the `u32` sums
/// safe for tens of thousands of overlapping 8-bit tiles.
const MAX_WEIGHT_UNITS: u32 = 256;

/// Per-pixel alpha for a tile at `rect` inside an `image_w` x `image_h` image.
///
/// Alpha is 1.0 except along edges that are not on the image boundary, where
/// it ramps as `distance / feather`. Edge ramps combine with `min`.
pub fn feather_mask(rect: &TileRect, image_w: u32, image_h: u32, feather: u32) -> Array2<f32> {
    let w = rect.width as usize;
    let h = rect.height as usize;
    if feather == 0 {
        return Array2::ones((h, w));
    }

    let f = feather as f32;
    let left = rect.x > 0;
    let right = rect.right() < image_w;
    let top = rect.y > 0;
    let bottom = rect.bottom() < image_h;

    Array2::from_shape_fn((h, w), |(y, x)| {
        let mut alpha = 1.0f32;
        if left {
            alpha = alpha.min(x as f32 / f);
        }
        if right {
            alpha = alpha.min((w - 1 - x) as f32 / f);
        }
        if top {
            alpha = alpha.min(y as f32 / f);
        }
        if bottom {
            alpha = alpha.min((h - 1 - y) as f32 / f);
        }
        alpha
    })
}

/// Accumulates feathered tiles as weighted sums and normalizes on [`finish`].
///
/// Pixels no tile covers with a positive weight come out black.
///
/// [`finish`]: Compositor::finish
pub struct Compositor {
    sums: Array3<u32>,
    weights: Array2<u32>,
    width: u32,
    height: u32,
    feather: u32,
    units: u32,
}

impl Compositor {
    pub fn new(width: u32, height: u32, feather: u32) -> Self {
        Self {
            sums: Array3::zeros((height as usize, width as usize, 3)),
            weights: Array2::zeros((height as usize, width as usize)),
            width,
            height,
            feather,
            units: feather.clamp(1, MAX_WEIGHT_UNITS),
        }
    }

    /// Add `pixels` at `rect`, weighted by its feather mask. Grayscale tiles
    /// are painted as gray RGB.
    pub fn paint(&mut self, rect: &TileRect, pixels: &RasterImage) -> Result<(), ProcessError> {
        if pixels.width != rect.width || pixels.height != rect.height {
            return Err(ProcessError::stage(
                Stage::Compositing,
                format!(
                    "processed tile {}x{} does not match its slot {}x{} at ({}, {})",
                    pixels.width, pixels.height, rect.width, rect.height, rect.x, rect.y
                ),
            ));
        }
        if rect.right() > self.width || rect.bottom() > self.height {
            return Err(ProcessError::stage(
                Stage::Compositing,
                format!(
                    "tile at ({}, {}) size {}x{} exceeds canvas {}x{}",
                    rect.x, rect.y, rect.width, rect.height, self.width, self.height
                ),
            ));
        }

        let mask = feather_mask(rect, self.width, self.height, self.feather);
        let channels = pixels.channels as usize;
        let tile_w = rect.width as usize;
        let units = self.units as f32;

        for ((y, x), &alpha) in mask.indexed_iter() {
            let weight = (alpha * units).round() as u32;
            if weight == 0 {
                continue;
            }
            let base = (y * tile_w + x) * channels;
            let px = &pixels.data[base..base + channels];
            let cy = rect.y as usize + y;
            let cx = rect.x as usize + x;
            for c in 0..3 {
                let src = u32::from(if channels >= 3 { px[c] } else { px[0] });
                self.sums[[cy, cx, c]] += src * weight;
            }
            self.weights[[cy, cx]] += weight;
        }

        Ok(())
    }

    /// Normalize the accumulated sums into an opaque 8-bit RGB image.
    pub fn finish(self) -> RgbImage {
        let Self {
            sums,
            weights,
            width,
            height,
            ..
        } = self;
        RgbImage::from_fn(width, height, |x, y| {
            let (x, y) = (x as usize, y as usize);
            let weight = weights[[y, x]];
            Rgb([0, 1, 2].map(|c| {
                if weight == 0 {
                    0
                } else {
                    ((sums[[y, x, c]] + weight / 2) / weight).min(255) as u8
                }
            }))
        })
    }
}
