use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Pipeline phase an [`ProcessError::ImageProcessing`] failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Init,
    Chunking,
    Inference,
    Compositing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Chunking => write!(f, "chunking"),
            Self::Inference => write!(f, "inference"),
            Self::Compositing => write!(f, "compositing"),
        }
    }
}

/// Failure reported by the model executor, carrying its own error text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub(crate) fn from_display(err: impl fmt::Display) -> Self {
        Self(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to load model {}: {reason}", path.display())]
    ModelLoad { path: PathBuf, reason: String },
    #[error("image processing failed during {stage}: {message}")]
    ImageProcessing { stage: Stage, message: String },
    #[error("inference engine call failed: {0}")]
    Engine(#[from] EngineError),
    #[error("no model loaded")]
    NoModelLoaded,
    #[error("processor is busy with another request")]
    Busy,
}

impl ProcessError {
    pub fn stage(stage: Stage, message: impl Into<String>) -> Self {
        Self::ImageProcessing {
            stage,
            message: message.into(),
        }
    }

    pub fn model_load(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        Self::ModelLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
