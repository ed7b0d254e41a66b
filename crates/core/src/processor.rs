//! The request-level pipeline: decode, plan tiles, run each tile, stage the
//! results, composite, encode PNG.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::Instant;

use image::{DynamicImage, ImageFormat};
use tracing::{debug, info, warn};

use crate::composite::Compositor;
use crate::config::{resolve_relative_to, AppConfig, DEFAULT_DISK_STAGING_THRESHOLD_PIXELS, DEFAULT_PAD_ALIGN};
use crate::engine::{EngineOptions, InferenceEngine, OrtEngine};
use crate::error::{ProcessError, Stage};
use crate::introspect::{introspect, ChannelProbe, TrialInferenceProbe};
use crate::runner::run_tile;
use crate::storage::{select_storage, TileStorage};
use crate::tiling::{plan_tiles, TilingConfig};
use crate::types::{ModelInfo, ProcessingState, RasterImage};

/// Observer for [`ProcessingState`] updates, called on the processing thread.
pub type ProgressCallback<'a> = &'a mut dyn FnMut(ProcessingState);

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    pub tiling: TilingConfig,
    pub pad_align: u32,
    pub disk_staging_threshold_pixels: u64,
    /// Parent for on-disk tile staging; the system temp dir when unset.
    pub staging_dir: Option<PathBuf>,
    pub engine: EngineOptions,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            tiling: TilingConfig::default(),
            pad_align: DEFAULT_PAD_ALIGN,
            disk_staging_threshold_pixels: DEFAULT_DISK_STAGING_THRESHOLD_PIXELS,
            staging_dir: None,
            engine: EngineOptions::default(),
        }
    }
}

impl ProcessorConfig {
    /// Build from the app config; a relative staging dir is resolved
    /// against `data_dir`.
    pub fn from_app_config(config: &AppConfig, data_dir: &Path) -> Self {
        Self {
            tiling: config.tiling.clone(),
            pad_align: config.processing.pad_align,
            disk_staging_threshold_pixels: config.processing.disk_staging_threshold_pixels,
            staging_dir: config
                .paths
                .staging_dir
                .as_deref()
                .map(|dir| resolve_relative_to(data_dir, dir)),
            engine: EngineOptions {
                intra_threads: config.processing.intra_threads,
            },
        }
    }
}

struct LoadedModel {
    engine: Box<dyn InferenceEngine>,
    info: ModelInfo,
    model_id: String,
}

/// Runs at most one request at a time against a single loaded model.
///
/// The model sits behind a mutex that is only ever `try_lock`ed, so a request
/// arriving while another is in flight fails with [`ProcessError::Busy`].
pub struct ImageProcessor {
    config: ProcessorConfig,
    probe: Box<dyn ChannelProbe + Send + Sync>,
    model: Mutex<Option<LoadedModel>>,
    model_info: Mutex<Option<ModelInfo>>,
    state: Mutex<ProcessingState>,
}

/// Cleans up staged tiles when the request scope ends, however it ends.
struct StagingGuard(Box<dyn TileStorage>);

impl Drop for StagingGuard {
    fn drop(&mut self) {
        self.0.cleanup();
    }
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn try_lock_model(mutex: &Mutex<Option<LoadedModel>>) -> Result<MutexGuard<'_, Option<LoadedModel>>, ProcessError> {
    match mutex.try_lock() {
        Ok(guard) => Ok(guard),
        Err(TryLockError::WouldBlock) => Err(ProcessError::Busy),
        Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
    }
}

impl ImageProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            config,
            probe: Box::new(TrialInferenceProbe),
            model: Mutex::new(None),
            model_info: Mutex::new(None),
            state: Mutex::new(ProcessingState::default()),
        }
    }

    /// Replace the channel detection strategy used by later loads.
    pub fn with_probe(mut self, probe: impl ChannelProbe + Send + Sync + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Load an ONNX model from `path`. Any previously loaded model is dropped
    /// first, so a failed load leaves the processor with no model.
    pub fn load_model(&self, path: &Path) -> Result<ModelInfo, ProcessError> {
        let mut guard = try_lock_model(&self.model)?;
        *guard = None;
        *lock_recover(&self.model_info) = None;

        let engine = OrtEngine::load(path, self.config.engine)?;
        let model_id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(self.install_locked(&mut guard, Box::new(engine), model_id))
    }

    /// Install an already-constructed engine. `model_id` selects the tile policy.
    pub fn install_engine(
        &self,
        engine: Box<dyn InferenceEngine>,
        model_id: &str,
    ) -> Result<ModelInfo, ProcessError> {
        let mut guard = try_lock_model(&self.model)?;
        *guard = None;
        Ok(self.install_locked(&mut guard, engine, model_id.to_string()))
    }

    fn install_locked(
        &self,
        slot: &mut Option<LoadedModel>,
        mut engine: Box<dyn InferenceEngine>,
        model_id: String,
    ) -> ModelInfo {
        let info = introspect(engine.as_mut(), self.probe.as_ref());
        let policy = self.config.tiling.policy_for(&model_id);
        info!(
            model = %model_id,
            tile_size = policy.tile_size,
            overlap = policy.overlap,
            "Model ready"
        );

        *lock_recover(&self.model_info) = Some(info.clone());
        *slot = Some(LoadedModel {
            engine,
            info: info.clone(),
            model_id,
        });
        info
    }

    pub fn model_info(&self) -> Option<ModelInfo> {
        lock_recover(&self.model_info).clone()
    }

    /// Snapshot of the current (or last) request's progress.
    pub fn state(&self) -> ProcessingState {
        *lock_recover(&self.state)
    }

    /// Restore one encoded image and return it as PNG bytes with the same
    /// dimensions, 3-channel, no alpha.
    ///
    /// `on_progress` is called once the tile count is known and after every
    /// tile. Any tile failure aborts the whole request.
    pub fn process_image(
        &self,
        image_bytes: &[u8],
        strength: f32,
        mut on_progress: Option<ProgressCallback<'_>>,
    ) -> Result<Vec<u8>, ProcessError> {
        let mut guard = try_lock_model(&self.model)?;
        let model = guard.as_mut().ok_or(ProcessError::NoModelLoaded)?;

        if !(0.0..=1.0).contains(&strength) {
            return Err(ProcessError::stage(
                Stage::Init,
                format!("strength must be within [0, 1], got {strength}"),
            ));
        }

        let mut state = ProcessingState {
            total_images: 1,
            ..ProcessingState::default()
        };
        self.publish(state, &mut None);

        let started = Instant::now();
        let image = decode_image(image_bytes)?;
        let policy = self.config.tiling.policy_for(&model.model_id);
        let rects = plan_tiles(image.width, image.height, &policy)?;

        state.total_tiles = rects.len() as u32;
        info!(
            width = image.width,
            height = image.height,
            tiles = rects.len(),
            tile_size = policy.tile_size,
            overlap = policy.overlap,
            strength,
            "Processing image"
        );
        self.publish(state, &mut on_progress);

        let mut staging = StagingGuard(select_storage(
            image.pixel_count(),
            self.config.disk_staging_threshold_pixels,
            self.config.staging_dir.as_deref(),
        )?);

        for (index, rect) in rects.iter().enumerate() {
            let source = image.crop(rect)?;
            let tile_started = Instant::now();
            let processed = run_tile(
                model.engine.as_mut(),
                &model.info,
                &source,
                strength,
                self.config.pad_align,
            )?;
            drop(source);
            debug!(
                index,
                row = rect.row,
                col = rect.col,
                x = rect.x,
                y = rect.y,
                width = rect.width,
                height = rect.height,
                elapsed_ms = tile_started.elapsed().as_millis() as u64,
                "Tile processed"
            );

            staging.0.put(index, processed)?;
            state.completed_tiles += 1;
            self.publish(state, &mut on_progress);
        }

        let feather = policy.feather();
        let mut compositor = Compositor::new(image.width, image.height, feather);
        for (index, rect) in rects.iter().enumerate() {
            let pixels = staging.0.take(index)?.ok_or_else(|| {
                ProcessError::stage(
                    Stage::Compositing,
                    format!("processed tile {index} is missing"),
                )
            })?;
            compositor.paint(rect, &pixels)?;
        }
        drop(staging);

        let png = encode_png(DynamicImage::ImageRgb8(compositor.finish()))?;
        info!(
            tiles = rects.len(),
            bytes = png.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Image processed"
        );
        Ok(png)
    }

    fn publish(&self, state: ProcessingState, on_progress: &mut Option<ProgressCallback<'_>>) {
        *lock_recover(&self.state) = state;
        if let Some(callback) = on_progress.as_mut() {
            callback(state);
        }
    }
}

/// Decode any supported container into 8-bit pixels. Alpha is dropped, luma
/// stays single-channel, everything else becomes RGB.
fn decode_image(bytes: &[u8]) -> Result<RasterImage, ProcessError> {
    let decoded = image::load_from_memory(bytes).map_err(|err| {
        ProcessError::stage(Stage::Init, format!("failed to decode input image: {err}"))
    })?;
    let (width, height) = (decoded.width(), decoded.height());

    let (data, channels) = match decoded {
        DynamicImage::ImageLuma8(buf) => (buf.into_raw(), 1),
        DynamicImage::ImageLuma16(buf) => (DynamicImage::ImageLuma16(buf).into_luma8().into_raw(), 1),
        other => {
            if other.color().has_alpha() {
                debug!("Dropping alpha channel from input image");
            }
            (other.into_rgb8().into_raw(), 3)
        }
    };

    let raster = RasterImage::new(data, width, height, channels)?;
    if raster.pixel_count() == 0 {
        warn!("Input image has no pixels");
    }
    Ok(raster)
}

fn encode_png(image: DynamicImage) -> Result<Vec<u8>, ProcessError> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|err| {
            ProcessError::stage(Stage::Compositing, format!("failed to encode PNG: {err}"))
        })?;
    Ok(bytes)
}
