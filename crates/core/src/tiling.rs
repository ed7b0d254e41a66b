//! Tile planning: splits an image into a deterministic grid of overlapping
//! extraction rectangles.

use serde::{Deserialize, Serialize};

use crate::error::{ProcessError, Stage};
use crate::types::TileRect;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilePolicy {
    pub tile_size: u32,
    pub overlap: u32,
}

impl TilePolicy {
    pub const DEFAULT: TilePolicy = TilePolicy {
        tile_size: 1200,
        overlap: 32,
    };

    /// Policy for the SCUNet family, which needs smaller tiles and a wider blend band.
    pub const SCUNET: TilePolicy = TilePolicy {
        tile_size: 640,
        overlap: 128,
    };

    /// Distance between neighbouring grid cell origins.
    pub fn step(&self) -> u32 {
        self.tile_size.saturating_sub(self.overlap)
    }

    /// Width of the linear blend ramp on each internal tile edge.
    pub fn feather(&self) -> u32 {
        self.overlap / 2
    }

    pub fn validate(&self) -> Result<(), ProcessError> {
        if self.overlap >= self.tile_size {
            return Err(ProcessError::stage(
                Stage::Chunking,
                format!(
                    "tile_size ({}) must be larger than overlap ({})",
                    self.tile_size, self.overlap
                ),
            ));
        }
        Ok(())
    }
}

impl Default for TilePolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A tile policy selected by model identifier prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyPolicy {
    pub prefix: String,
    pub tile_size: u32,
    pub overlap: u32,
}

impl FamilyPolicy {
    pub fn policy(&self) -> TilePolicy {
        TilePolicy {
            tile_size: self.tile_size,
            overlap: self.overlap,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingConfig {
    pub default: TilePolicy,
    pub families: Vec<FamilyPolicy>,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            default: TilePolicy::DEFAULT,
            families: vec![FamilyPolicy {
                prefix: "scunet".to_string(),
                tile_size: TilePolicy::SCUNET.tile_size,
                overlap: TilePolicy::SCUNET.overlap,
            }],
        }
    }
}

impl TilingConfig {
    /// First family whose prefix matches `model_id` (case-insensitive), else the default.
    pub fn policy_for(&self, model_id: &str) -> TilePolicy {
        let id = model_id.to_ascii_lowercase();
        self.families
            .iter()
            .find(|family| id.starts_with(&family.prefix.to_ascii_lowercase()))
            .map(FamilyPolicy::policy)
            .unwrap_or(self.default)
    }
}

/// Whether an image needs to be split at all under `policy`.
pub fn needs_chunking(width: u32, height: u32, policy: &TilePolicy) -> bool {
    width > policy.tile_size || height > policy.tile_size
}

/// Compute the tile grid for a `width` x `height` image, row-major.
///
/// Images that fit in one tile yield a single full-frame rectangle. Otherwise
/// every grid cell of size `tile_size - overlap` is expanded by `overlap / 2`
/// on each side that is not an image edge, then clamped to the image.
pub fn plan_tiles(width: u32, height: u32, policy: &TilePolicy) -> Result<Vec<TileRect>, ProcessError> {
    if width == 0 || height == 0 {
        return Err(ProcessError::stage(
            Stage::Chunking,
            format!("cannot tile an empty image ({width}x{height})"),
        ));
    }
    policy.validate()?;

    if !needs_chunking(width, height, policy) {
        return Ok(vec![TileRect::whole(width, height)]);
    }

    let step = policy.step();
    let half = policy.overlap / 2;
    let cols = width.div_ceil(step);
    let rows = height.div_ceil(step);

    let mut tiles = Vec::with_capacity((rows * cols) as usize);
    for row in 0..rows {
        for col in 0..cols {
            let origin_x = col * step;
            let origin_y = row * step;

            let (x, w) = expand_span(origin_x, step, half, col > 0, col + 1 < cols, width);
            let (y, h) = expand_span(origin_y, step, half, row > 0, row + 1 < rows, height);
            if w == 0 || h == 0 {
                continue;
            }

            tiles.push(TileRect {
                x,
                y,
                width: w,
                height: h,
                origin_x,
                origin_y,
                row,
                col,
            });
        }
    }

    Ok(tiles)
}

fn expand_span(origin: u32, step: u32, half: u32, grow_before: bool, grow_after: bool, limit: u32) -> (u32, u32) {
    let start = if grow_before { origin.saturating_sub(half) } else { origin };
    let mut end = origin + step;
    if grow_after {
        end += half;
    }
    let end = end.min(limit);
    (start, end.saturating_sub(start))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_exact_cover(width: u32, height: u32, tiles: &[TileRect]) {
        let mut covered = vec![false; (width * height) as usize];
        for tile in tiles {
            assert!(tile.width > 0 && tile.height > 0, "degenerate tile {tile:?}");
            assert!(tile.right() <= width && tile.bottom() <= height, "tile out of bounds {tile:?}");
            for y in tile.y..tile.bottom() {
                for x in tile.x..tile.right() {
                    covered[(y * width + x) as usize] = true;
                }
            }
        }
        assert!(covered.iter().all(|&c| c), "gap in tile coverage for {width}x{height}");
    }

    #[test]
    fn test_small_image_is_single_tile() {
        let tiles = plan_tiles(500, 500, &TilePolicy::DEFAULT).unwrap();
        assert_eq!(tiles, vec![TileRect::whole(500, 500)]);
    }

    #[test]
    fn test_exact_tile_size_is_not_chunked() {
        assert!(!needs_chunking(1200, 1200, &TilePolicy::DEFAULT));
        assert!(needs_chunking(1201, 10, &TilePolicy::DEFAULT));
    }

    #[test]
    fn test_2000_square_default_policy_is_2x2() {
        let tiles = plan_tiles(2000, 2000, &TilePolicy::DEFAULT).unwrap();
        assert_eq!(tiles.len(), 4);

        let order: Vec<(u32, u32)> = tiles.iter().map(|t| (t.row, t.col)).collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);

        assert_eq!((tiles[0].x, tiles[0].width), (0, 1168 + 16));
        assert_eq!((tiles[1].x, tiles[1].width), (1168 - 16, 2000 - 1152));
        assert_eq!(tiles[1].origin_x, 1168);
        assert_exact_cover(2000, 2000, &tiles);
    }

    #[test]
    fn test_scunet_policy_grid() {
        let tiles = plan_tiles(1500, 700, &TilePolicy::SCUNET).unwrap();
        // step = 512 -> 3 cols x 2 rows
        assert_eq!(tiles.len(), 6);
        let middle = tiles.iter().find(|t| t.row == 0 && t.col == 1).unwrap();
        assert_eq!(middle.x, 512 - 64);
        assert_eq!(middle.width, 512 + 128);
        assert_exact_cover(1500, 700, &tiles);
    }

    #[test]
    fn test_coverage_and_overlap_across_sizes() {
        let policies = [
            TilePolicy { tile_size: 10, overlap: 4 },
            TilePolicy { tile_size: 7, overlap: 3 },
            TilePolicy { tile_size: 8, overlap: 0 },
            TilePolicy { tile_size: 5, overlap: 1 },
        ];
        for policy in policies {
            for width in 1..40 {
                for height in [1, 9, 23] {
                    let tiles = plan_tiles(width, height, &policy).unwrap();
                    assert_exact_cover(width, height, &tiles);

                    for a in &tiles {
                        if let Some(b) = tiles.iter().find(|b| b.row == a.row && b.col == a.col + 1) {
                            let shared = a.right().saturating_sub(b.x);
                            assert!(shared >= policy.overlap / 2, "{policy:?} {width}x{height}: {a:?} {b:?}");
                        }
                        if let Some(b) = tiles.iter().find(|b| b.col == a.col && b.row == a.row + 1) {
                            let shared = a.bottom().saturating_sub(b.y);
                            assert!(shared >= policy.overlap / 2, "{policy:?} {width}x{height}: {a:?} {b:?}");
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_tiles_never_exceed_tile_size() {
        let policy = TilePolicy { tile_size: 64, overlap: 16 };
        for tile in plan_tiles(300, 200, &policy).unwrap() {
            assert!(tile.width <= 64 && tile.height <= 64, "{tile:?}");
        }
    }

    #[test]
    fn test_invalid_policy_is_chunking_error() {
        let policy = TilePolicy { tile_size: 32, overlap: 32 };
        let err = plan_tiles(100, 100, &policy).unwrap_err();
        assert!(matches!(
            err,
            ProcessError::ImageProcessing {
                stage: Stage::Chunking,
                ..
            }
        ));
    }

    #[test]
    fn test_empty_image_is_chunking_error() {
        assert!(plan_tiles(0, 10, &TilePolicy::DEFAULT).is_err());
    }

    #[test]
    fn test_policy_for_matches_family_prefix() {
        let config = TilingConfig::default();
        assert_eq!(config.policy_for("scunet_color_real_psnr"), TilePolicy::SCUNET);
        assert_eq!(config.policy_for("SCUNet-gray-25"), TilePolicy::SCUNET);
        assert_eq!(config.policy_for("fbcnn_color"), TilePolicy::DEFAULT);
        assert_eq!(config.policy_for("my_scunet"), TilePolicy::DEFAULT);
    }

    #[test]
    fn test_feather_is_half_overlap() {
        assert_eq!(TilePolicy::DEFAULT.feather(), 16);
        assert_eq!(TilePolicy { tile_size: 10, overlap: 3 }.feather(), 1);
    }
}
