use std::time::Instant;

use tracing::debug;

use crate::codec::{crop_spatial, decode_tensor, encode_tensor, pad_to_multiple, strength_tensor};
use crate::engine::InferenceEngine;
use crate::error::{ProcessError, Stage};
use crate::types::{ModelInfo, RasterImage};

/// Run one tile through the model and decode the first declared output.
///
/// The tile is reflection-padded to `pad_align` before inference and the
/// output is cropped back to the tile size.
pub fn run_tile(
    engine: &mut dyn InferenceEngine,
    model_info: &ModelInfo,
    tile: &RasterImage,
    strength: f32,
    pad_align: u32,
) -> Result<RasterImage, ProcessError> {
    let output_name = engine
        .outputs()
        .first()
        .map(|spec| spec.name.clone())
        .ok_or_else(|| ProcessError::stage(Stage::Inference, "model declares no outputs"))?;

    let height = tile.height as usize;
    let width = tile.width as usize;
    let tensor = pad_to_multiple(encode_tensor(tile, model_info.is_grayscale), pad_align as usize);
    let padded_shape = tensor.dim();

    let mut inputs = vec![(model_info.image_input_name.clone(), tensor.into_dyn())];
    if let Some(quality_name) = model_info.quality_input_name.as_ref() {
        inputs.push((quality_name.clone(), strength_tensor(strength)));
    }

    let started = Instant::now();
    let outputs = engine.run(inputs)?;
    debug!(
        width,
        height,
        padded = ?padded_shape,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Tile inference finished"
    );

    let output = outputs
        .into_iter()
        .find(|(name, _)| *name == output_name)
        .map(|(_, array)| array)
        .ok_or_else(|| {
            ProcessError::stage(
                Stage::Inference,
                format!("engine returned no '{output_name}' output"),
            )
        })?;

    decode_tensor(&crop_spatial(output, height, width)?)
}
