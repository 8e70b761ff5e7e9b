use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Model lineage, which decides the pipeline configuration used at load
/// time and the latent stride requests are validated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFamily {
    Sd15,
    Sd21,
    Sdxl,
    Custom,
}

serde_plain::derive_display_from_serialize!(ModelFamily);
serde_plain::derive_fromstr_from_deserialize!(ModelFamily);

impl ModelFamily {
    /// Detect the family from an artifact name.
    pub fn from_name(name: &str) -> Self {
        let name_upper = name.to_uppercase();

        if name_upper.contains("XL") {
            ModelFamily::Sdxl
        } else if name_upper.contains("2-1") || name_upper.contains("2.1") || name_upper.contains("SD2") || name_upper.contains("V2") {
            ModelFamily::Sd21
        } else if name_upper.contains("1-5") || name_upper.contains("1.5") || name_upper.contains("SD1") || name_upper.contains("V1") {
            ModelFamily::Sd15
        } else {
            ModelFamily::Custom
        }
    }

    /// Latent-space downsampling factor. Image dimensions must be a
    /// multiple of this.
    pub fn latent_stride(self) -> usize {
        8
    }
}

/// On-disk layout of an artifact. Fixed at registration; it only decides
/// which loading path the engine takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Representation {
    PipelineDirectory,
    SingleFileCheckpoint,
}

serde_plain::derive_display_from_serialize!(Representation);

/// Immutable description of a registered model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub representation: Representation,
    pub path: PathBuf,
    pub family: ModelFamily,
    pub estimated_memory_bytes: u64,
    pub has_safety_filter: bool,
}

#[derive(Default)]
struct RegistryInner {
    index: HashMap<String, usize>,
    ordered: Vec<ModelDescriptor>,
}

/// In-memory catalog of known models. Registration order is preserved and
/// descriptors never change once accepted.
#[derive(Default)]
pub struct ModelRegistry {
    inner: RwLock<RegistryInner>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the descriptor was newly added. Re-registering
    /// the same id with the same path is a no-op; the same id with a
    /// different path is a conflict.
    pub fn register(&self, descriptor: ModelDescriptor) -> Result<bool> {
        let inner = &mut *self.inner.write();
        if let Some(&pos) = inner.index.get(&descriptor.id) {
            if inner.ordered[pos].path == descriptor.path {
                debug!(model = %descriptor.id, "already registered");
                return Ok(false);
            }
            return Err(Error::DuplicateId(descriptor.id));
        }
        debug!(
            model = %descriptor.id,
            representation = %descriptor.representation,
            family = %descriptor.family,
            "registered"
        );
        let pos = inner.ordered.len();
        inner.index.insert(descriptor.id.clone(), pos);
        inner.ordered.push(descriptor);
        Ok(true)
    }

    pub fn lookup(&self, id: &str) -> Result<ModelDescriptor> {
        let inner = self.inner.read();
        inner
            .index
            .get(id)
            .map(|&pos| inner.ordered[pos].clone())
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Registration-ordered listing. The iterator reads the table one
    /// entry per step, so it never holds the lock across steps and a
    /// fresh call starts over from the beginning.
    pub fn list(&self) -> Listing<'_> {
        Listing {
            registry: self,
            next: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Listing<'a> {
    registry: &'a ModelRegistry,
    next: usize,
}

impl Iterator for Listing<'_> {
    type Item = ModelDescriptor;

    fn next(&mut self) -> Option<ModelDescriptor> {
        let inner = self.registry.inner.read();
        let item = inner.ordered.get(self.next).cloned();
        if item.is_some() {
            self.next += 1;
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str, path: &str) -> ModelDescriptor {
        ModelDescriptor {
            id: id.to_string(),
            representation: Representation::SingleFileCheckpoint,
            path: PathBuf::from(path),
            family: ModelFamily::from_name(id),
            estimated_memory_bytes: 4 << 30,
            has_safety_filter: false,
        }
    }

    #[test]
    fn register_and_lookup() {
        let registry = ModelRegistry::new();
        assert!(registry.register(descriptor("sd15-mini", "/m/sd15-mini.safetensors")).unwrap());
        let found = registry.lookup("sd15-mini").unwrap();
        assert_eq!(found.family, ModelFamily::Sd15);
        assert!(matches!(registry.lookup("nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn same_path_is_idempotent() {
        let registry = ModelRegistry::new();
        assert!(registry.register(descriptor("a", "/m/a")).unwrap());
        assert!(!registry.register(descriptor("a", "/m/a")).unwrap());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn different_path_conflicts() {
        let registry = ModelRegistry::new();
        registry.register(descriptor("a", "/m/a")).unwrap();
        let err = registry.register(descriptor("a", "/elsewhere/a")).unwrap_err();
        assert!(matches!(err, Error::DuplicateId(id) if id == "a"));
    }

    #[test]
    fn listing_preserves_registration_order_and_restarts() {
        let registry = ModelRegistry::new();
        for id in ["zed", "alpha", "mid"] {
            registry.register(descriptor(id, &format!("/m/{id}"))).unwrap();
        }
        let ids: Vec<String> = registry.list().map(|d| d.id).collect();
        assert_eq!(ids, ["zed", "alpha", "mid"]);
        // A fresh listing starts over.
        assert_eq!(registry.list().next().unwrap().id, "zed");
    }

    #[test]
    fn listing_sees_entries_added_mid_iteration() {
        let registry = ModelRegistry::new();
        registry.register(descriptor("first", "/m/first")).unwrap();
        let mut listing = registry.list();
        assert_eq!(listing.next().unwrap().id, "first");
        registry.register(descriptor("second", "/m/second")).unwrap();
        assert_eq!(listing.next().unwrap().id, "second");
        assert!(listing.next().is_none());
    }

    #[test]
    fn family_detection_from_names() {
        assert_eq!(ModelFamily::from_name("stable-diffusion-v1-5"), ModelFamily::Sd15);
        assert_eq!(ModelFamily::from_name("stable-diffusion-2-1"), ModelFamily::Sd21);
        assert_eq!(ModelFamily::from_name("sdxl-base-1.0"), ModelFamily::Sdxl);
        assert_eq!(ModelFamily::from_name("dreamshaper-8"), ModelFamily::Custom);
    }
}
