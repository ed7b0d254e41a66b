use serde::{Deserialize, Serialize};

use crate::error::{ProcessError, Stage};

/// Interleaved 8-bit raster buffer (HWC), 1 to 4 channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl RasterImage {
    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: u32) -> Result<Self, ProcessError> {
        if !(1..=4).contains(&channels) {
            return Err(ProcessError::stage(
                Stage::Init,
                format!("unsupported channel count {channels} (expected 1..=4)"),
            ));
        }
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected {
            return Err(ProcessError::stage(
                Stage::Init,
                format!(
                    "pixel buffer length mismatch: expected {expected} ({width}x{height}x{channels}), got {}",
                    data.len()
                ),
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            channels,
        })
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Copy out the `rect` region. The rectangle must lie inside the image.
    pub fn crop(&self, rect: &TileRect) -> Result<RasterImage, ProcessError> {
        if rect.x + rect.width > self.width || rect.y + rect.height > self.height {
            return Err(ProcessError::stage(
                Stage::Chunking,
                format!(
                    "tile {}x{}+{}+{} exceeds image bounds {}x{}",
                    rect.width, rect.height, rect.x, rect.y, self.width, self.height
                ),
            ));
        }

        let c = self.channels as usize;
        let src_stride = self.width as usize * c;
        let row_len = rect.width as usize * c;
        let mut data = Vec::with_capacity(row_len * rect.height as usize);
        for row in rect.y..rect.y + rect.height {
            let start = row as usize * src_stride + rect.x as usize * c;
            data.extend_from_slice(&self.data[start..start + row_len]);
        }

        Ok(RasterImage {
            data,
            width: rect.width,
            height: rect.height,
            channels: self.channels,
        })
    }

    /// Drop the 4th channel of an RGBA buffer; other layouts are returned as-is.
    pub fn strip_alpha(self) -> RasterImage {
        if self.channels != 4 {
            return self;
        }
        let data = self
            .data
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect();
        RasterImage {
            data,
            width: self.width,
            height: self.height,
            channels: 3,
        }
    }

    /// Widen to 3 channels: grayscale is replicated, extra channels are dropped.
    pub fn to_rgb(&self) -> RasterImage {
        let data = match self.channels {
            3 => self.data.clone(),
            1 => self.data.iter().flat_map(|&v| [v, v, v]).collect(),
            2 => self
                .data
                .chunks_exact(2)
                .flat_map(|px| [px[0], px[0], px[0]])
                .collect(),
            _ => self
                .data
                .chunks_exact(self.channels as usize)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect(),
        };
        RasterImage {
            data,
            width: self.width,
            height: self.height,
            channels: 3,
        }
    }
}

/// Introspected description of a loaded restoration model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub image_input_name: String,
    /// `(batch, channels, height, width)`; `-1` marks a dynamic dimension.
    pub image_input_shape: [i64; 4],
    pub is_grayscale: bool,
    pub has_quality_input: bool,
    pub quality_input_name: Option<String>,
}

impl ModelInfo {
    pub fn channels(&self) -> u32 {
        if self.is_grayscale {
            1
        } else {
            3
        }
    }
}

/// Tile geometry in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    /// Extraction origin (expanded into the overlap band).
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Non-overlapping grid cell origin.
    pub origin_x: u32,
    pub origin_y: u32,
    pub row: u32,
    pub col: u32,
}

impl TileRect {
    pub fn whole(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
            origin_x: 0,
            origin_y: 0,
            row: 0,
            col: 0,
        }
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }
}

/// Progress snapshot for the active request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingState {
    pub total_tiles: u32,
    pub completed_tiles: u32,
    pub current_image_index: u32,
    pub total_images: u32,
}

impl ProcessingState {
    pub fn progress(&self) -> f32 {
        if self.total_tiles == 0 {
            return 0.0;
        }

        (self.completed_tiles as f32 / self.total_tiles as f32).clamp(0.0, 1.0)
    }
}
