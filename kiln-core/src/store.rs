use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::registry::{ModelDescriptor, ModelFamily, Representation};

/// The slice of a pipeline `model_index.json` the store cares about.
#[derive(Debug, Deserialize)]
struct PipelineIndex {
    #[serde(rename = "_class_name", default)]
    class_name: Option<String>,
    #[serde(default)]
    safety_checker: Option<Value>,
}

/// Scans a directory of model artifacts and derives descriptors from
/// their layout: a subdirectory with a `model_index.json` is a pipeline,
/// a `*.safetensors` file is a single-file checkpoint, anything else is
/// ignored.
pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Describes every recognized artifact under the store root, sorted
    /// by file name. Artifacts that cannot be read are skipped with a
    /// warning rather than failing the whole scan.
    pub fn catalog(&self) -> Result<Vec<ModelDescriptor>> {
        let read_err =
            |err: io::Error| Error::Store(format!("cannot read {}: {err}", self.root.display()));
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(read_err)? {
            paths.push(entry.map_err(read_err)?.path());
        }
        paths.sort();

        let mut descriptors = Vec::new();
        for path in paths {
            match describe(&path) {
                Ok(Some(descriptor)) => {
                    debug!(
                        id = %descriptor.id,
                        family = %descriptor.family,
                        representation = %descriptor.representation,
                        "cataloged model"
                    );
                    descriptors.push(descriptor);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable artifact")
                }
            }
        }
        info!(
            count = descriptors.len(),
            root = %self.root.display(),
            "scanned model store"
        );
        Ok(descriptors)
    }

    /// Looks a single model up by id, rescanning the store.
    pub fn resolve(&self, id: &str) -> Result<ModelDescriptor> {
        self.catalog()?
            .into_iter()
            .find(|descriptor| descriptor.id == id)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }
}

fn describe(path: &Path) -> io::Result<Option<ModelDescriptor>> {
    if path.is_dir() {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        let index_path = path.join("model_index.json");
        if !index_path.is_file() {
            return Ok(None);
        }
        let index: PipelineIndex = serde_json::from_slice(&fs::read(&index_path)?)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let has_safety_filter = safety_checker_present(index.safety_checker.as_ref())
            || path.join("safety_checker").is_dir();
        return Ok(Some(ModelDescriptor {
            id: name.to_string(),
            representation: Representation::PipelineDirectory,
            path: path.to_path_buf(),
            family: family_of(name, index.class_name.as_deref()),
            estimated_memory_bytes: weights_size(path)?,
            has_safety_filter,
        }));
    }

    if path.is_file() && path.extension().is_some_and(|ext| ext == "safetensors") {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            return Ok(None);
        };
        return Ok(Some(ModelDescriptor {
            id: stem.to_string(),
            representation: Representation::SingleFileCheckpoint,
            path: path.to_path_buf(),
            family: ModelFamily::from_name(stem),
            estimated_memory_bytes: fs::metadata(path)?.len(),
            has_safety_filter: false,
        }));
    }

    Ok(None)
}

/// The pipeline class is more authoritative than whatever the directory
/// happens to be called.
fn family_of(id: &str, class_name: Option<&str>) -> ModelFamily {
    if let Some(class) = class_name {
        if class.contains("XL") {
            return ModelFamily::Sdxl;
        }
        if ModelFamily::from_name(id) == ModelFamily::Custom && class.contains("StableDiffusion") {
            return ModelFamily::Sd15;
        }
    }
    ModelFamily::from_name(id)
}

/// Pruned pipelines keep the key with null entries, which still means
/// no safety checker ships with the model.
fn safety_checker_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Array(parts)) => parts.first().is_some_and(|part| !part.is_null()),
        Some(_) => true,
    }
}

/// Total size of every `*.safetensors` file under the directory.
fn weights_size(dir: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            total += weights_size(&path)?;
        } else if path.extension().is_some_and(|ext| ext == "safetensors") {
            total += fs::metadata(&path)?.len();
        }
    }
    Ok(total)
}
