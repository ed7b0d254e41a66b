//! Model introspection: which input carries the image, how many channels it
//! takes, and whether a scalar strength/quality input exists.
//!
//! Restoration models rarely declare a static channel count, so the default
//! [`TrialInferenceProbe`] asks the engine directly with tiny trial tensors.

use ndarray::{ArrayD, IxDyn};
use tracing::{debug, info, warn};

use crate::codec::strength_tensor;
use crate::engine::{InferenceEngine, TensorSpec};
use crate::types::ModelInfo;

/// Side length of the square trial tensor.
pub const PROBE_SIZE: usize = 64;
/// Strength value sent with trial calls on models that take one.
pub const PROBE_STRENGTH: f32 = 0.5;

const IMAGE_NAME_HINTS: [&str; 3] = ["input", "image", "x"];
const QUALITY_NAME_HINTS: [&str; 3] = ["qf", "quality", "strength"];

/// Strategy for deciding the channel count of a candidate image input.
pub trait ChannelProbe {
    /// `Some(1)` for grayscale, `Some(3)` for color, `None` if the candidate
    /// does not look like an image input. `extra_inputs` are fed alongside
    /// every trial call.
    fn probe(
        &self,
        engine: &mut dyn InferenceEngine,
        candidate: &TensorSpec,
        extra_inputs: &[(String, ArrayD<f32>)],
    ) -> Option<u32>;
}

/// Grayscale first, then color: run a zero-filled `1xCx64x64` tensor and
/// accept the first channel count the engine does not reject.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrialInferenceProbe;

impl ChannelProbe for TrialInferenceProbe {
    fn probe(
        &self,
        engine: &mut dyn InferenceEngine,
        candidate: &TensorSpec,
        extra_inputs: &[(String, ArrayD<f32>)],
    ) -> Option<u32> {
        for channels in [1u32, 3] {
            let trial = ArrayD::<f32>::zeros(IxDyn(&[1, channels as usize, PROBE_SIZE, PROBE_SIZE]));
            let mut inputs = Vec::with_capacity(extra_inputs.len() + 1);
            inputs.push((candidate.name.clone(), trial));
            inputs.extend(extra_inputs.iter().cloned());

            // Executor errors are opaque text, so a shape rejection cannot be
            // told apart from other failures. Any rejection of the
            // single-channel trial moves on to the 3-channel trial.
            match engine.run(inputs) {
                Ok(_) => return Some(channels),
                Err(err) => debug!(
                    input = %candidate.name,
                    channels,
                    error = %err,
                    "Trial inference rejected"
                ),
            }
        }
        None
    }
}

/// Reads a static channel dimension from the declared shape; dynamic or
/// unusual shapes defer to the trial probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclaredShapeProbe;

impl ChannelProbe for DeclaredShapeProbe {
    fn probe(
        &self,
        engine: &mut dyn InferenceEngine,
        candidate: &TensorSpec,
        extra_inputs: &[(String, ArrayD<f32>)],
    ) -> Option<u32> {
        match candidate.shape.as_slice() {
            [_, 1, _, _] => Some(1),
            [_, 3, _, _] => Some(3),
            _ => TrialInferenceProbe.probe(engine, candidate, extra_inputs),
        }
    }
}

/// Describe `engine` using `probe`. Never fails: anything that cannot be
/// determined falls back to the first declared input as a dynamic color input.
pub fn introspect(engine: &mut dyn InferenceEngine, probe: &dyn ChannelProbe) -> ModelInfo {
    let inputs: Vec<TensorSpec> = engine.inputs().to_vec();
    let quality_input_name = detect_quality_input(&inputs);

    let extra_inputs: Vec<(String, ArrayD<f32>)> = quality_input_name
        .iter()
        .map(|name| (name.clone(), strength_tensor(PROBE_STRENGTH)))
        .collect();

    for candidate in image_candidates(&inputs, quality_input_name.as_deref()) {
        let Some(channels) = probe.probe(engine, candidate, &extra_inputs) else {
            continue;
        };

        let info = ModelInfo {
            image_input_name: candidate.name.clone(),
            image_input_shape: image_shape(candidate, channels),
            is_grayscale: channels == 1,
            has_quality_input: quality_input_name.is_some(),
            quality_input_name: quality_input_name.clone(),
        };
        info!(
            image_input = %info.image_input_name,
            grayscale = info.is_grayscale,
            quality_input = ?info.quality_input_name,
            "Model introspected"
        );
        return info;
    }

    let image_input_name = inputs
        .first()
        .map(|spec| spec.name.clone())
        .unwrap_or_else(|| "input".to_string());
    warn!(
        image_input = %image_input_name,
        "Could not classify model input; assuming dynamic color input"
    );

    ModelInfo {
        image_input_name,
        image_input_shape: [1, 3, -1, -1],
        is_grayscale: false,
        has_quality_input: quality_input_name.is_some(),
        quality_input_name,
    }
}

/// Inputs that may carry the image, in declaration order.
fn image_candidates<'a>(inputs: &'a [TensorSpec], quality_input: Option<&str>) -> Vec<&'a TensorSpec> {
    if inputs.len() == 1 {
        return inputs.iter().collect();
    }

    inputs
        .iter()
        .filter(|spec| Some(spec.name.as_str()) != quality_input)
        .filter(|spec| {
            let name = spec.name.to_ascii_lowercase();
            name == "input" || IMAGE_NAME_HINTS.iter().any(|hint| name.contains(hint))
        })
        .collect()
}

/// A name match wins; otherwise a two-input model's second input is assumed
/// to be the quality scalar.
fn detect_quality_input(inputs: &[TensorSpec]) -> Option<String> {
    if inputs.len() < 2 {
        return None;
    }

    let by_name = inputs.iter().find(|spec| {
        let name = spec.name.to_ascii_lowercase();
        QUALITY_NAME_HINTS.iter().any(|hint| name.contains(hint))
    });
    if let Some(spec) = by_name {
        return Some(spec.name.clone());
    }

    if inputs.len() == 2 {
        return Some(inputs[1].name.clone());
    }

    debug!(
        inputs = inputs.len(),
        "No quality input matched; strength will not be sent"
    );
    None
}

fn image_shape(spec: &TensorSpec, channels: u32) -> [i64; 4] {
    match spec.shape.as_slice() {
        [batch, _, height, width] => [*batch, channels as i64, *height, *width],
        _ => [1, channels as i64, -1, -1],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    /// Accepts only calls whose image tensor has one of `accepted_channels`
    /// and which carry every declared input.
    struct ProbeEngine {
        inputs: Vec<TensorSpec>,
        outputs: Vec<TensorSpec>,
        image_input: String,
        accepted_channels: Vec<usize>,
        /// Returned instead of running the first call.
        first_error: Option<&'static str>,
        calls: Vec<Vec<String>>,
    }

    impl ProbeEngine {
        fn new(inputs: &[&str], image_input: &str, accepted_channels: &[usize]) -> Self {
            Self {
                inputs: inputs
                    .iter()
                    .map(|name| TensorSpec::f32(name, &[1, -1, -1, -1]))
                    .collect(),
                outputs: vec![TensorSpec::f32("output", &[1, -1, -1, -1])],
                image_input: image_input.to_string(),
                accepted_channels: accepted_channels.to_vec(),
                first_error: None,
                calls: Vec::new(),
            }
        }
    }

    impl InferenceEngine for ProbeEngine {
        fn inputs(&self) -> &[TensorSpec] {
            &self.inputs
        }

        fn outputs(&self) -> &[TensorSpec] {
            &self.outputs
        }

        fn run(
            &mut self,
            inputs: Vec<(String, ArrayD<f32>)>,
        ) -> Result<Vec<(String, ArrayD<f32>)>, EngineError> {
            self.calls
                .push(inputs.iter().map(|(name, _)| name.clone()).collect());
            if let Some(message) = self.first_error.take() {
                return Err(EngineError::new(message));
            }

            if inputs.len() != self.inputs.len() {
                return Err(EngineError::new("missing input"));
            }
            let (_, image) = inputs
                .iter()
                .find(|(name, _)| *name == self.image_input)
                .ok_or_else(|| EngineError::new("unknown input"))?;
            if !self.accepted_channels.contains(&image.shape()[1]) {
                return Err(EngineError::new("Got invalid dimensions for input"));
            }
            Ok(vec![("output".to_string(), image.clone())])
        }
    }

    #[test]
    fn test_single_input_model_is_image_input_without_quality() {
        let mut engine = ProbeEngine::new(&["lq"], "lq", &[3]);
        let info = introspect(&mut engine, &TrialInferenceProbe);

        assert_eq!(info.image_input_name, "lq");
        assert!(!info.is_grayscale);
        assert!(!info.has_quality_input);
        assert_eq!(info.quality_input_name, None);
        assert_eq!(info.image_input_shape, [1, 3, -1, -1]);
        // grayscale trial, then color trial
        assert_eq!(engine.calls.len(), 2);
    }

    #[test]
    fn test_grayscale_model_accepts_first_trial() {
        let mut engine = ProbeEngine::new(&["input"], "input", &[1]);
        let info = introspect(&mut engine, &TrialInferenceProbe);

        assert!(info.is_grayscale);
        assert_eq!(info.channels(), 1);
        assert_eq!(engine.calls.len(), 1);
    }

    #[test]
    fn test_any_grayscale_trial_failure_still_tries_color() {
        let mut engine = ProbeEngine::new(&["input"], "input", &[1, 3]);
        engine.first_error = Some("arena allocation failed");
        let info = introspect(&mut engine, &TrialInferenceProbe);

        assert_eq!(info.image_input_name, "input");
        assert!(!info.is_grayscale);
        assert_eq!(engine.calls.len(), 2);
    }

    #[test]
    fn test_quality_input_detected_by_name() {
        let mut engine = ProbeEngine::new(&["input", "qf"], "input", &[3]);
        let info = introspect(&mut engine, &TrialInferenceProbe);

        assert_eq!(info.image_input_name, "input");
        assert!(info.has_quality_input);
        assert_eq!(info.quality_input_name.as_deref(), Some("qf"));
        // trial calls carry the strength tensor
        assert!(engine
            .calls
            .iter()
            .all(|call| call.contains(&"qf".to_string())));
    }

    #[test]
    fn test_quality_name_match_beats_position() {
        let mut engine = ProbeEngine::new(&["strength_level", "image"], "image", &[3]);
        let info = introspect(&mut engine, &TrialInferenceProbe);

        assert_eq!(info.image_input_name, "image");
        assert_eq!(info.quality_input_name.as_deref(), Some("strength_level"));
    }

    #[test]
    fn test_two_inputs_without_hint_assume_second_is_quality() {
        let mut engine = ProbeEngine::new(&["input", "sigma"], "input", &[3]);
        let info = introspect(&mut engine, &TrialInferenceProbe);

        assert_eq!(info.quality_input_name.as_deref(), Some("sigma"));
    }

    #[test]
    fn test_three_inputs_without_hint_leave_quality_undetected() {
        let mut engine = ProbeEngine::new(&["input", "a", "b"], "input", &[3]);
        let info = introspect(&mut engine, &TrialInferenceProbe);

        assert!(!info.has_quality_input);
        assert_eq!(info.quality_input_name, None);
        // trials lack inputs the engine needs, so the fallback applies
        assert_eq!(info.image_input_name, "input");
        assert_eq!(info.image_input_shape, [1, 3, -1, -1]);
    }

    #[test]
    fn test_rejecting_engine_falls_back_to_first_input_color() {
        let mut engine = ProbeEngine::new(&["data", "other_input"], "nothing", &[]);
        let info = introspect(&mut engine, &TrialInferenceProbe);

        assert_eq!(info.image_input_name, "data");
        assert!(!info.is_grayscale);
        assert_eq!(info.image_input_shape, [1, 3, -1, -1]);
    }

    #[test]
    fn test_declared_shape_probe_skips_trial_for_static_channels() {
        let mut engine = ProbeEngine::new(&["input"], "input", &[]);
        engine.inputs[0].shape = vec![1, 1, -1, -1];

        let info = introspect(&mut engine, &DeclaredShapeProbe);
        assert!(info.is_grayscale);
        assert!(engine.calls.is_empty());
    }

    #[test]
    fn test_declared_shape_probe_defers_when_dynamic() {
        let mut engine = ProbeEngine::new(&["input"], "input", &[3]);
        let info = introspect(&mut engine, &DeclaredShapeProbe);

        assert!(!info.is_grayscale);
        assert_eq!(engine.calls.len(), 2);
    }

    #[test]
    fn test_candidates_match_name_hints() {
        let inputs = vec![
            TensorSpec::f32("noise_level", &[1]),
            TensorSpec::f32("timestep", &[1]),
            TensorSpec::f32("lq_image", &[1, 3, -1, -1]),
        ];
        let names: Vec<&str> = image_candidates(&inputs, Some("noise_level"))
            .into_iter()
            .map(|spec| spec.name.as_str())
            .collect();
        assert_eq!(names, vec!["lq_image"]);
    }
}
