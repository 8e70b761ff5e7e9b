use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::DynamicImage;
use thiserror::Error;

use crate::registry::{ModelDescriptor, ModelFamily, Representation};

mod candle;

pub use candle::CandleEngine;

/// How an artifact should be materialized. Both variants go through the
/// same loading contract; callers build this value once and never branch
/// on the representation again.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadSpec {
    PipelineDirectory { path: PathBuf, family: ModelFamily },
    SingleFileCheckpoint { path: PathBuf, family: ModelFamily },
}

impl LoadSpec {
    pub fn path(&self) -> &Path {
        match self {
            LoadSpec::PipelineDirectory { path, .. } => path,
            LoadSpec::SingleFileCheckpoint { path, .. } => path,
        }
    }

    pub fn family(&self) -> ModelFamily {
        match self {
            LoadSpec::PipelineDirectory { family, .. } => *family,
            LoadSpec::SingleFileCheckpoint { family, .. } => *family,
        }
    }
}

impl From<&ModelDescriptor> for LoadSpec {
    fn from(descriptor: &ModelDescriptor) -> Self {
        match descriptor.representation {
            Representation::PipelineDirectory => LoadSpec::PipelineDirectory {
                path: descriptor.path.clone(),
                family: descriptor.family,
            },
            Representation::SingleFileCheckpoint => LoadSpec::SingleFileCheckpoint {
                path: descriptor.path.clone(),
                family: descriptor.family,
            },
        }
    }
}

/// Fully resolved generation parameters. Defaults are applied and
/// validation has passed before one of these is built.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineParams {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance_scale: f64,
    pub seed: u64,
}

/// The one place where device memory exhaustion is distinguished from
/// every other engine fault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("device out of memory")]
    OutOfMemory,
    #[error("{0}")]
    Failure(String),
}

/// A model materialized in device memory. Calls are synchronous; the
/// lifecycle layer runs them on blocking threads.
pub trait LoadedModel: Send + Sync {
    fn generate(&self, params: &EngineParams) -> std::result::Result<DynamicImage, EngineError>;

    /// Device memory actually attributed to this model.
    fn memory_bytes(&self) -> u64;

    /// Explicit teardown beyond what dropping the model releases.
    fn close(&self) -> std::result::Result<(), EngineError> {
        Ok(())
    }
}

pub trait InferenceEngine: Send + Sync {
    fn load(&self, spec: &LoadSpec) -> std::result::Result<Arc<dyn LoadedModel>, EngineError>;
}
