//! Interleaved 8-bit pixels <-> planar `[1, C, H, W]` f32 tensors in `[0, 1]`.

use ndarray::{s, Array4, ArrayD, Axis, Ix4, IxDyn};

use crate::error::{ProcessError, Stage};
use crate::types::RasterImage;

/// Encode `image` for a model taking one (`grayscale`) or three planes.
///
/// Grayscale models get the mean of the source's color channels. Color models
/// always get three planes; a source with fewer channels repeats its last one.
/// Alpha must already be stripped; channels past the third are ignored.
pub fn encode_tensor(image: &RasterImage, grayscale: bool) -> Array4<f32> {
    let h = image.height as usize;
    let w = image.width as usize;
    let src_channels = image.channels as usize;

    if grayscale {
        let color_channels = color_channel_count(src_channels);
        let mut tensor = Array4::<f32>::zeros((1, 1, h, w));
        for (pixel, value) in image
            .data
            .chunks_exact(src_channels)
            .zip(tensor.iter_mut())
        {
            let sum: f32 = pixel[..color_channels].iter().map(|&v| v as f32).sum();
            *value = sum / color_channels as f32 / 255.0;
        }
        return tensor;
    }

    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for c in 0..3 {
        let src = c.min(src_channels - 1);
        let mut plane = tensor.index_axis_mut(Axis(1), c);
        for (pixel, value) in image.data.chunks_exact(src_channels).zip(plane.iter_mut()) {
            *value = pixel[src] as f32 / 255.0;
        }
    }
    tensor
}

/// Luma+alpha and RGBA buffers carry one trailing non-color channel.
fn color_channel_count(channels: usize) -> usize {
    match channels {
        2 => 1,
        4 => 3,
        n => n,
    }
}

/// Decode a `[1, C, H, W]` model output into an interleaved buffer.
/// Each value maps to `floor(min(max(v * 255, 0), 255))`.
pub fn decode_tensor(tensor: &ArrayD<f32>) -> Result<RasterImage, ProcessError> {
    let shape = tensor.shape();
    let &[batch, channels, h, w] = shape else {
        return Err(ProcessError::stage(
            Stage::Inference,
            format!("expected a 4-D output tensor, got shape {shape:?}"),
        ));
    };
    if batch != 1 || !(1..=4).contains(&channels) {
        return Err(ProcessError::stage(
            Stage::Inference,
            format!("unsupported output tensor shape {shape:?}"),
        ));
    }

    let hw = h * w;
    let mut data = vec![0u8; hw * channels];
    for c in 0..channels {
        let plane = tensor.index_axis(Axis(1), c);
        for (i, &v) in plane.iter().enumerate() {
            data[i * channels + c] = to_u8(v);
        }
    }

    RasterImage::new(data, w as u32, h as u32, channels as u32)
}

fn to_u8(v: f32) -> u8 {
    (v * 255.0).max(0.0).min(255.0).floor() as u8
}

/// Reflection-pad H and W up to the next multiple of `align`.
/// `align <= 1` returns the tensor unchanged.
pub fn pad_to_multiple(tensor: Array4<f32>, align: usize) -> Array4<f32> {
    if align <= 1 {
        return tensor;
    }
    let (n, c, h, w) = tensor.dim();
    let pad_h = (align - h % align) % align;
    let pad_w = (align - w % align) % align;
    if pad_h == 0 && pad_w == 0 {
        return tensor;
    }

    let new_h = h + pad_h;
    let new_w = w + pad_w;
    Array4::from_shape_fn((n, c, new_h, new_w), |(b, ch, y, x)| {
        tensor[[b, ch, mirror_index(y, h), mirror_index(x, w)]]
    })
}

/// Edge-inclusive mirror: index `n` maps to `n - 1`, `n + 1` to `n - 2`, ...
fn mirror_index(i: usize, n: usize) -> usize {
    let period = 2 * n;
    let m = i % period;
    if m < n {
        m
    } else {
        period - 1 - m
    }
}

/// Crop a 4-D tensor's spatial dims back to `height` x `width`.
pub fn crop_spatial(tensor: ArrayD<f32>, height: usize, width: usize) -> Result<ArrayD<f32>, ProcessError> {
    let tensor = tensor.into_dimensionality::<Ix4>().map_err(|err| {
        ProcessError::stage(Stage::Inference, format!("output tensor is not 4-D: {err}"))
    })?;
    let (_, _, h, w) = tensor.dim();
    if h == height && w == width {
        return Ok(tensor.into_dyn());
    }
    if h < height || w < width {
        return Err(ProcessError::stage(
            Stage::Inference,
            format!("output {w}x{h} is smaller than tile {width}x{height}"),
        ));
    }
    Ok(tensor
        .slice(s![.., .., ..height, ..width])
        .to_owned()
        .into_dyn())
}

/// The `(1, 1)` scalar fed to a model's strength/quality input.
pub fn strength_tensor(strength: f32) -> ArrayD<f32> {
    ArrayD::from_elem(IxDyn(&[1, 1]), strength)
}
