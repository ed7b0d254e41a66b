//! Model executor seam: named f32 tensors in, named f32 tensors out.
//!
//! [`OrtEngine`] is the ONNX Runtime implementation. FP16 models are handled
//! here so the rest of the pipeline only ever sees `f32` data.

use std::borrow::Cow;
use std::path::Path;
use std::time::Instant;

use half::f16;
use ndarray::ArrayD;
use ort::{
    session::{builder::GraphOptimizationLevel, Session, SessionInputValue, SessionInputs},
    tensor::TensorElementType,
    value::{Tensor, ValueType},
};
use tracing::{debug, info};

use crate::error::{EngineError, ProcessError};

/// Element type a model declares for one of its tensors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementKind {
    Float32,
    Float16,
    Other(String),
}

/// Declared name, shape and element type of a model input or output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: String,
    /// `-1` marks a dynamic dimension. Empty when the model does not say.
    pub shape: Vec<i64>,
    pub element: ElementKind,
}

impl TensorSpec {
    pub fn f32(name: &str, shape: &[i64]) -> Self {
        Self {
            name: name.to_string(),
            shape: shape.to_vec(),
            element: ElementKind::Float32,
        }
    }
}

/// An inference-capable model handle.
///
/// Implementations are treated as a single exclusive resource: callers hold
/// `&mut self` for the duration of one `run`.
pub trait InferenceEngine: Send {
    fn inputs(&self) -> &[TensorSpec];
    fn outputs(&self) -> &[TensorSpec];
    fn run(
        &mut self,
        inputs: Vec<(String, ArrayD<f32>)>,
    ) -> Result<Vec<(String, ArrayD<f32>)>, EngineError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineOptions {
    /// Intra-op thread count; `0` keeps the runtime default.
    pub intra_threads: usize,
}

pub struct OrtEngine {
    session: Session,
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
}

impl OrtEngine {
    /// Load an ONNX model. Missing files and runtime rejections are
    /// reported as [`ProcessError::ModelLoad`].
    pub fn load(model_path: &Path, options: EngineOptions) -> Result<Self, ProcessError> {
        if !model_path.is_file() {
            return Err(ProcessError::model_load(model_path, "file does not exist"));
        }

        let started = Instant::now();
        debug!(
            model = %model_path.display(),
            intra_threads = options.intra_threads,
            "Building ONNX Runtime session"
        );

        let session = build_session(model_path, options)
            .map_err(|err| ProcessError::model_load(model_path, err))?;

        let inputs: Vec<TensorSpec> = session
            .inputs()
            .iter()
            .map(|input| tensor_spec(input.name(), input.dtype()))
            .collect();
        let outputs: Vec<TensorSpec> = session
            .outputs()
            .iter()
            .map(|output| tensor_spec(output.name(), output.dtype()))
            .collect();

        if outputs.is_empty() {
            return Err(ProcessError::model_load(
                model_path,
                "model declares no outputs",
            ));
        }

        info!(
            model = %model_path.display(),
            inputs = ?inputs.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            outputs = ?outputs.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ONNX model loaded"
        );

        Ok(Self {
            session,
            inputs,
            outputs,
        })
    }

    fn input_element(&self, name: &str) -> ElementKind {
        self.inputs
            .iter()
            .find(|spec| spec.name == name)
            .map(|spec| spec.element.clone())
            .unwrap_or(ElementKind::Float32)
    }
}

fn build_session(model_path: &Path, options: EngineOptions) -> Result<Session, EngineError> {
    let mut builder = Session::builder()
        .map_err(EngineError::from_display)?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(EngineError::from_display)?;

    if options.intra_threads > 0 {
        builder = builder
            .with_intra_threads(options.intra_threads)
            .map_err(EngineError::from_display)?;
    }

    builder
        .commit_from_file(model_path)
        .map_err(EngineError::from_display)
}

fn tensor_spec(name: &str, dtype: &ValueType) -> TensorSpec {
    match dtype {
        ValueType::Tensor { ty, shape, .. } => TensorSpec {
            name: name.to_string(),
            shape: shape.iter().copied().collect(),
            element: match ty {
                TensorElementType::Float32 => ElementKind::Float32,
                TensorElementType::Float16 => ElementKind::Float16,
                other => ElementKind::Other(format!("{other:?}")),
            },
        },
        other => TensorSpec {
            name: name.to_string(),
            shape: Vec::new(),
            element: ElementKind::Other(format!("{other:?}")),
        },
    }
}

impl InferenceEngine for OrtEngine {
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
        let mut values: Vec<(Cow<'static, str>, SessionInputValue<'static>)> =
            Vec::with_capacity(inputs.len());
        for (name, array) in inputs {
            let value: SessionInputValue<'static> = match self.input_element(&name) {
                ElementKind::Float16 => Tensor::from_array(array.mapv(f16::from_f32))
                    .map_err(EngineError::from_display)?
                    .into(),
                _ => Tensor::from_array(array)
                    .map_err(EngineError::from_display)?
                    .into(),
            };
            values.push((Cow::Owned(name), value));
        }

        let output_specs = self.outputs.clone();
        let session_inputs: SessionInputs<'_, '_, 0> = SessionInputs::ValueMap(values);
        let outputs = self
            .session
            .run(session_inputs)
            .map_err(EngineError::from_display)?;

        let mut results = Vec::with_capacity(output_specs.len());
        for spec in &output_specs {
            let value = &outputs[spec.name.as_str()];
            let array = match spec.element {
                ElementKind::Float16 => value
                    .try_extract_array::<f16>()
                    .map_err(EngineError::from_display)?
                    .mapv(f16::to_f32),
                _ => value
                    .try_extract_array::<f32>()
                    .map_err(EngineError::from_display)?
                    .to_owned(),
            };
            results.push((spec.name.clone(), array));
        }

        Ok(results)
    }
}
