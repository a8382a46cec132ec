// crates/envelope-config/src/registry.rs
// ============================================================================
// Module: Driver Registry
// Description: Filesystem-backed driver loading with process-lifetime caching.
// Purpose: Resolve id@version keys to immutable Driver snapshots.
// Dependencies: envelope-core, serde_yaml, tracing
// ============================================================================

//! ## Overview
//! The registry loads driver documents from a root directory, resolves their
//! `extends` chains, validates, and caches the built snapshots. It is an
//! explicit value handed to whatever needs drivers; there is no process-wide
//! singleton, so tests run against isolated roots.
//! Layout: `<root>/<driver-id>/v<version>.yaml`, with a flat
//! `<root>/<driver-id>.yaml` fallback for single-version drivers.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use envelope_core::Driver;
use envelope_core::DriverCatalog;
use envelope_core::DriverCatalogError;
use envelope_core::DriverId;
use envelope_core::DriverKey;
use envelope_core::DriverVersion;
use tracing::debug;

use crate::document::DriverDocument;
use crate::document::DriverError;

// ============================================================================
// SECTION: Registry
// ============================================================================

/// Filesystem-backed driver registry with an immutable cache.
#[derive(Debug)]
pub struct DriverRegistry {
    /// Directory holding driver definition files.
    root: PathBuf,
    /// Built drivers keyed by id and version.
    cache: Mutex<BTreeMap<DriverKey, Arc<Driver>>>,
}

impl DriverRegistry {
    /// Creates a registry rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    /// Loads a driver snapshot, from cache when already built.
    ///
    /// # Errors
    /// Returns [`DriverError::NotFound`] when no file exists for the key,
    /// and the document's own errors when it fails to parse or validate.
    pub fn load(&self, id: &DriverId, version: &DriverVersion) -> Result<Arc<Driver>, DriverError> {
        let key = DriverKey::new(id.clone(), version.clone());
        if let Some(cached) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(Arc::clone(cached));
        }
        debug!(driver = %key, "driver cache miss; loading from disk");
        let mut chain = Vec::new();
        let document = self.resolve(&key, &mut chain)?;
        let driver = Arc::new(document.build(&key)?);
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&driver));
        Ok(driver)
    }

    /// Returns true when a driver file exists for the key.
    #[must_use]
    pub fn exists(&self, id: &DriverId, version: &DriverVersion) -> bool {
        self.file_for(&DriverKey::new(id.clone(), version.clone())).is_some()
    }

    /// Enumerates the `(id, version)` pairs available under the root.
    ///
    /// Versioned files contribute their filename version; flat files
    /// contribute the version declared inside the document.
    #[must_use]
    pub fn list(&self) -> Vec<DriverKey> {
        let mut keys = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return keys;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                collect_versioned(&path, &mut keys);
            } else if let Some(id) = yaml_stem(&path)
                && let Some(version) = declared_version(&path)
            {
                keys.push(DriverKey::new(DriverId::new(id), DriverVersion::new(version)));
            }
        }
        keys.sort();
        keys
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    /// Loads a document and merges its `extends` parents, detecting cycles.
    fn resolve(
        &self,
        key: &DriverKey,
        chain: &mut Vec<DriverKey>,
    ) -> Result<DriverDocument, DriverError> {
        if chain.contains(key) {
            let mut rendered: Vec<String> = chain.iter().map(ToString::to_string).collect();
            rendered.push(key.to_string());
            return Err(DriverError::CircularExtends {
                chain: rendered.join(" -> "),
            });
        }
        chain.push(key.clone());

        let document = self.read_document(key)?;
        let mut composed = DriverDocument::default();
        for reference in &document.extends {
            let parent_key: DriverKey =
                reference.parse().map_err(|_| DriverError::InvalidExtends {
                    reference: reference.clone(),
                })?;
            let mut parent = self.resolve(&parent_key, chain)?;
            // Parents never impose their identity on the child.
            if let Some(section) = &mut parent.driver {
                section.id = None;
                section.version = None;
            }
            composed = composed.merged_with(parent);
        }
        composed = composed.merged_with(document);
        chain.pop();
        Ok(composed)
    }

    /// Reads and parses the YAML document for `key` from disk.
    fn read_document(&self, key: &DriverKey) -> Result<DriverDocument, DriverError> {
        let Some(path) = self.file_for(key) else {
            return Err(DriverError::NotFound {
                key: key.clone(),
            });
        };
        let raw = std::fs::read_to_string(&path).map_err(|source| DriverError::Io {
            path: path.clone(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| DriverError::Parse {
            path,
            source,
        })
    }

    /// Resolves the file for a key: versioned layout first, flat fallback.
    fn file_for(&self, key: &DriverKey) -> Option<PathBuf> {
        let versioned = self
            .root
            .join(key.id().as_str())
            .join(format!("v{}.yaml", key.version()));
        if versioned.is_file() {
            return Some(versioned);
        }
        let flat = self.root.join(format!("{}.yaml", key.id()));
        flat.is_file().then_some(flat)
    }
}

/// Collects `v<version>.yaml` files under a per-driver directory.
fn collect_versioned(dir: &Path, keys: &mut Vec<DriverKey>) {
    let Some(id) = dir.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if let Some(stem) = yaml_stem(&path)
            && let Some(version) = stem.strip_prefix('v')
        {
            keys.push(DriverKey::new(DriverId::new(id), DriverVersion::new(version)));
        }
    }
}

/// Returns the file stem for `.yaml` paths.
fn yaml_stem(path: &Path) -> Option<&str> {
    if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
        return None;
    }
    path.file_stem().and_then(|s| s.to_str())
}

/// Reads the version a flat driver file declares, if any.
fn declared_version(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let document: DriverDocument = serde_yaml::from_str(&raw).ok()?;
    document.driver.and_then(|section| section.version)
}

// ============================================================================
// SECTION: Catalog Adapter
// ============================================================================

impl DriverCatalog for DriverRegistry {
    fn load(&self, key: &DriverKey) -> Result<Arc<Driver>, DriverCatalogError> {
        Self::load(self, key.id(), key.version()).map_err(|error| match error {
            DriverError::NotFound {
                key,
            } => DriverCatalogError::NotFound {
                key,
            },
            other => DriverCatalogError::Invalid {
                key: key.clone(),
                message: other.to_string(),
            },
        })
    }
}
