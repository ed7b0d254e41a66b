//! Request-scoped staging for processed tiles.
//!
//! Small images keep tiles in memory; very large ones spill each processed
//! tile to a PNG in a private temp directory. Either way the storage is
//! emptied when the request ends, including on error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use image::{ColorType, DynamicImage};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::{ProcessError, Stage};
use crate::types::RasterImage;

const STAGING_DIR_PREFIX: &str = "tilerestore-tiles-";

pub trait TileStorage: Send {
    fn put(&mut self, index: usize, tile: RasterImage) -> Result<(), ProcessError>;
    /// Remove and return tile `index`, or `None` if it was never stored.
    fn take(&mut self, index: usize) -> Result<Option<RasterImage>, ProcessError>;
    /// Release everything. Failures are logged, never returned.
    fn cleanup(&mut self);
}

#[derive(Debug, Default)]
pub struct MemoryTileStorage {
    tiles: HashMap<usize, RasterImage>,
}

impl MemoryTileStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TileStorage for MemoryTileStorage {
    fn put(&mut self, index: usize, tile: RasterImage) -> Result<(), ProcessError> {
        self.tiles.insert(index, tile);
        Ok(())
    }

    fn take(&mut self, index: usize) -> Result<Option<RasterImage>, ProcessError> {
        Ok(self.tiles.remove(&index))
    }

    fn cleanup(&mut self) {
        self.tiles.clear();
        self.tiles.shrink_to_fit();
    }
}

#[derive(Debug)]
pub struct DiskTileStorage {
    dir: Option<TempDir>,
    stored: HashMap<usize, PathBuf>,
}

impl DiskTileStorage {
    /// Stage under the system temp directory.
    pub fn new() -> Result<Self, ProcessError> {
        Self::create(tempfile::Builder::new().prefix(STAGING_DIR_PREFIX).tempdir())
    }

    pub fn new_in(parent: &Path) -> Result<Self, ProcessError> {
        Self::create(
            tempfile::Builder::new()
                .prefix(STAGING_DIR_PREFIX)
                .tempdir_in(parent),
        )
    }

    fn create(dir: std::io::Result<TempDir>) -> Result<Self, ProcessError> {
        let dir = dir.map_err(|err| {
            ProcessError::stage(
                Stage::Init,
                format!("failed to create tile staging directory: {err}"),
            )
        })?;
        debug!(dir = %dir.path().display(), "Created tile staging directory");
        Ok(Self {
            dir: Some(dir),
            stored: HashMap::new(),
        })
    }

    /// Staging directory, until cleanup.
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(TempDir::path)
    }
}

impl TileStorage for DiskTileStorage {
    fn put(&mut self, index: usize, tile: RasterImage) -> Result<(), ProcessError> {
        let dir = self.dir.as_ref().ok_or_else(|| {
            ProcessError::stage(Stage::Inference, "tile staging directory already removed")
        })?;
        let path = dir.path().join(format!("tile-{index:05}.png"));
        let color = match tile.channels {
            1 => ColorType::L8,
            2 => ColorType::La8,
            3 => ColorType::Rgb8,
            _ => ColorType::Rgba8,
        };
        image::save_buffer(&path, &tile.data, tile.width, tile.height, color).map_err(|err| {
            ProcessError::stage(
                Stage::Inference,
                format!("failed to stage tile {index} at {}: {err}", path.display()),
            )
        })?;
        self.stored.insert(index, path);
        Ok(())
    }

    fn take(&mut self, index: usize) -> Result<Option<RasterImage>, ProcessError> {
        let Some(path) = self.stored.remove(&index) else {
            return Ok(None);
        };
        let decoded = image::open(&path).map_err(|err| {
            ProcessError::stage(
                Stage::Compositing,
                format!("failed to read staged tile {}: {err}", path.display()),
            )
        })?;
        if let Err(err) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), error = %err, "Failed to remove staged tile");
        }
        raster_from_dynamic(decoded).map(Some)
    }

    fn cleanup(&mut self) {
        self.stored.clear();
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => debug!(dir = %path.display(), "Removed tile staging directory"),
                Err(err) => warn!(
                    dir = %path.display(),
                    error = %err,
                    "Failed to remove tile staging directory"
                ),
            }
        }
    }
}

impl Drop for DiskTileStorage {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn raster_from_dynamic(image: DynamicImage) -> Result<RasterImage, ProcessError> {
    let (width, height) = (image.width(), image.height());
    let (data, channels) = match image {
        DynamicImage::ImageLuma8(buf) => (buf.into_raw(), 1),
        DynamicImage::ImageLumaA8(buf) => (buf.into_raw(), 2),
        DynamicImage::ImageRgba8(buf) => (buf.into_raw(), 4),
        other => (other.into_rgb8().into_raw(), 3),
    };
    RasterImage::new(data, width, height, channels)
}

/// In-memory storage up to `threshold_pixels`, disk staging above it.
/// Disk staging goes under `staging_parent` when given, else the system temp dir.
pub fn select_storage(
    pixel_count: u64,
    threshold_pixels: u64,
    staging_parent: Option<&Path>,
) -> Result<Box<dyn TileStorage>, ProcessError> {
    if pixel_count > threshold_pixels {
        debug!(pixel_count, threshold_pixels, "Staging tiles on disk");
        let storage = match staging_parent {
            Some(parent) => DiskTileStorage::new_in(parent)?,
            None => DiskTileStorage::new()?,
        };
        Ok(Box::new(storage))
    } else {
        Ok(Box::new(MemoryTileStorage::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(channels: u32, fill: u8) -> RasterImage {
        RasterImage::new(vec![fill; (6 * 4 * channels) as usize], 6, 4, channels).unwrap()
    }

    #[test]
    fn test_memory_storage_put_take() {
        let mut storage = MemoryTileStorage::new();
        storage.put(0, tile(3, 1)).unwrap();
        storage.put(1, tile(3, 2)).unwrap();

        assert_eq!(storage.take(1).unwrap(), Some(tile(3, 2)));
        assert_eq!(storage.take(1).unwrap(), None);
        storage.cleanup();
        assert_eq!(storage.take(0).unwrap(), None);
    }

    #[test]
    fn test_disk_storage_roundtrips_pixels() {
        let parent = tempfile::tempdir().expect("parent dir should be created");
        let mut storage = DiskTileStorage::new_in(parent.path()).expect("staging dir");

        storage.put(3, tile(3, 77)).unwrap();
        storage.put(4, tile(1, 9)).unwrap();
        let dir = storage.path().expect("staging dir").to_path_buf();
        assert!(dir.join("tile-00003.png").is_file());
        assert!(dir.join("tile-00004.png").is_file());

        assert_eq!(storage.take(3).unwrap(), Some(tile(3, 77)));
        assert_eq!(storage.take(4).unwrap(), Some(tile(1, 9)));
        assert_eq!(storage.take(5).unwrap(), None);
    }

    #[test]
    fn test_disk_storage_removes_directory_on_cleanup() {
        let parent = tempfile::tempdir().expect("parent dir should be created");
        let mut storage = DiskTileStorage::new_in(parent.path()).expect("staging dir");
        storage.put(0, tile(3, 0)).unwrap();
        let dir = storage.path().expect("dir before cleanup").to_path_buf();
        assert!(dir.join("tile-00000.png").is_file());

        storage.cleanup();
        assert!(!dir.exists());
        assert!(storage.path().is_none());
        assert!(storage.put(1, tile(3, 0)).is_err());
        // second cleanup is a no-op
        storage.cleanup();
    }

    #[test]
    fn test_disk_storage_removes_directory_on_drop() {
        let parent = tempfile::tempdir().expect("parent dir should be created");
        let dir = {
            let mut storage = DiskTileStorage::new_in(parent.path()).expect("staging dir");
            storage.put(0, tile(3, 0)).unwrap();
            storage.path().expect("dir").to_path_buf()
        };
        assert!(!dir.exists());
    }

    #[test]
    fn test_select_storage_by_threshold() {
        let parent = tempfile::tempdir().expect("parent dir should be created");
        let staged = |parent: &Path| std::fs::read_dir(parent).expect("read parent").count();

        let mut small = select_storage(100, 100, Some(parent.path())).unwrap();
        small.put(0, tile(3, 0)).unwrap();
        assert_eq!(staged(parent.path()), 0);
        assert_eq!(small.take(0).unwrap(), Some(tile(3, 0)));

        let mut large = select_storage(101, 100, Some(parent.path())).unwrap();
        large.put(0, tile(3, 0)).unwrap();
        assert_eq!(staged(parent.path()), 1);
        assert_eq!(large.take(0).unwrap(), Some(tile(3, 0)));
        large.cleanup();
        assert_eq!(staged(parent.path()), 0);
    }
}
