// crates/envelope-core/src/interfaces/mod.rs
// ============================================================================
// Module: Storage Interfaces
// Description: Envelope, blob, and driver-catalog seams with memory baselines.
// Purpose: Let hosts supply persistence while the runtime stays storage-agnostic.
// Dependencies: serde, thiserror
// ============================================================================

//! ## Overview
//! The runtime never talks to a database or object store directly; it goes
//! through the traits here. Hosts implement them against real storage; the
//! in-memory implementations back tests and lightweight embeddings.
//! Invariants:
//! - [`EnvelopeStore::put`] is compare-and-swap on the envelope revision;
//!   concurrent writers lose with [`StoreError::RevisionConflict`].
//! - Blob writes are durable before the attachment record referencing them
//!   is persisted; the orchestrator relies on this ordering.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::driver::Driver;
use crate::core::envelope::Envelope;
use crate::core::identifiers::DocType;
use crate::core::identifiers::DriverKey;
use crate::core::identifiers::EnvelopeId;

// ============================================================================
// SECTION: Storage Reference
// ============================================================================

/// Opaque location of a stored blob, as issued by a [`BlobStore`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageRef(String);

impl StorageRef {
    /// Creates a storage reference.
    #[must_use]
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    /// Returns the reference as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// SECTION: Envelope Store
// ============================================================================

/// Errors surfaced by envelope persistence.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No envelope exists under the requested id.
    #[error("envelope `{id}` not found")]
    NotFound {
        /// The requested envelope id.
        id: EnvelopeId,
    },
    /// Another writer persisted the envelope since it was loaded.
    #[error("revision conflict on envelope `{id}`: expected {expected}, stored {stored}")]
    RevisionConflict {
        /// The envelope id.
        id: EnvelopeId,
        /// The revision the writer loaded.
        expected: u64,
        /// The revision currently persisted.
        stored: u64,
    },
    /// The backing store failed.
    #[error("envelope store backend failure: {message}")]
    Backend {
        /// Backend-specific failure description.
        message: String,
    },
}

/// Persistence seam for envelopes.
pub trait EnvelopeStore {
    /// Loads an envelope by id.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] when no envelope exists under `id`.
    fn get(&self, id: &EnvelopeId) -> Result<Envelope, StoreError>;

    /// Persists an envelope with compare-and-swap on `expected_revision`.
    ///
    /// `expected_revision` is the revision the writer loaded (0 for a fresh
    /// envelope). On success the stored revision becomes
    /// `expected_revision + 1` and the persisted envelope is returned.
    ///
    /// # Errors
    /// Returns [`StoreError::RevisionConflict`] when the stored revision no
    /// longer matches `expected_revision`.
    fn put(&self, envelope: Envelope, expected_revision: u64) -> Result<Envelope, StoreError>;
}

/// In-memory envelope store for tests and lightweight embeddings.
#[derive(Debug, Default)]
pub struct MemoryEnvelopeStore {
    /// Envelopes keyed by id.
    records: Mutex<BTreeMap<EnvelopeId, Envelope>>,
}

impl MemoryEnvelopeStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored envelopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true when no envelopes are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EnvelopeStore for MemoryEnvelopeStore {
    fn get(&self, id: &EnvelopeId) -> Result<Envelope, StoreError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                id: id.clone(),
            })
    }

    fn put(&self, mut envelope: Envelope, expected_revision: u64) -> Result<Envelope, StoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(stored) = records.get(&envelope.id)
            && stored.revision != expected_revision
        {
            return Err(StoreError::RevisionConflict {
                id: envelope.id.clone(),
                expected: expected_revision,
                stored: stored.revision,
            });
        }
        envelope.revision = expected_revision + 1;
        records.insert(envelope.id.clone(), envelope.clone());
        Ok(envelope)
    }
}

// ============================================================================
// SECTION: Blob Store
// ============================================================================

/// Errors surfaced by blob persistence.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BlobStoreError {
    /// The blob could not be written.
    #[error("blob write failed for `{doc_type}`: {message}")]
    WriteFailed {
        /// Document type being written.
        doc_type: DocType,
        /// Backend-specific failure description.
        message: String,
    },
}

/// Persistence seam for attachment content.
pub trait BlobStore {
    /// Persists attachment content and returns its storage reference.
    ///
    /// # Errors
    /// Returns [`BlobStoreError::WriteFailed`] when the content cannot be
    /// written durably.
    fn put(
        &self,
        envelope: &EnvelopeId,
        doc_type: &DocType,
        bytes: &[u8],
    ) -> Result<StorageRef, BlobStoreError>;
}

/// In-memory blob store for tests and lightweight embeddings.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    /// Blob bytes keyed by storage reference.
    blobs: Mutex<BTreeMap<StorageRef, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns stored content for a reference, if present.
    #[must_use]
    pub fn get(&self, storage: &StorageRef) -> Option<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(storage)
            .cloned()
    }

    /// Returns the number of stored blobs.
    #[must_use]
    pub fn blob_count(&self) -> usize {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(
        &self,
        envelope: &EnvelopeId,
        doc_type: &DocType,
        bytes: &[u8],
    ) -> Result<StorageRef, BlobStoreError> {
        let mut blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        let storage = StorageRef::new(format!("mem://{envelope}/{doc_type}/{}", blobs.len()));
        blobs.insert(storage.clone(), bytes.to_vec());
        Ok(storage)
    }
}

// ============================================================================
// SECTION: Driver Catalog
// ============================================================================

/// Errors surfaced when resolving a pinned driver snapshot.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverCatalogError {
    /// No driver exists under the requested key.
    #[error("driver `{key}` not found")]
    NotFound {
        /// The requested driver key.
        key: DriverKey,
    },
    /// The driver exists but could not be loaded or validated.
    #[error("driver `{key}` failed to load: {message}")]
    Invalid {
        /// The requested driver key.
        key: DriverKey,
        /// Loader-specific failure description.
        message: String,
    },
}

/// Resolution seam for driver snapshots.
pub trait DriverCatalog {
    /// Resolves a driver snapshot by `id@version` key.
    ///
    /// # Errors
    /// Returns [`DriverCatalogError::NotFound`] for unknown keys and
    /// [`DriverCatalogError::Invalid`] for drivers that fail to load.
    fn load(&self, key: &DriverKey) -> Result<Arc<Driver>, DriverCatalogError>;
}

// ============================================================================
// SECTION: Tests
// ============================================================================
